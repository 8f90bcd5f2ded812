//! Network module for peer-to-peer connections.
//!
//! This module provides the TCP plumbing shared by the handshake and the
//! data connection:
//! - Outgoing connects with a timeout, mapped onto the protocol error taxonomy
//! - Listener binding and cancellable accepts
//! - Accepting the data connection from the peer that did the handshake

pub mod handshake;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use protocol::{ProtocolError, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use handshake::{initiate, respond, Negotiated};

/// Connect to `addr`, giving up after `timeout`.
///
/// Any failure to reach the peer is reported as
/// [`ProtocolError::ConnectionRefused`]; running out of time as
/// [`ProtocolError::Timeout`].
pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Err(_) => {
            return Err(ProtocolError::Timeout(format!(
                "connecting to {} took longer than {:?}",
                addr, timeout
            )))
        }
        Ok(Err(e)) => return Err(ProtocolError::ConnectionRefused(format!("{}: {}", addr, e))),
        Ok(Ok(stream)) => stream,
    };

    stream.set_nodelay(true)?;
    debug!("Connected to {}", addr);
    Ok(stream)
}

/// Bind a TCP listener on all interfaces.
pub async fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
        .await
        .map_err(|e| {
            ProtocolError::ConnectionRefused(format!("cannot listen on port {}: {}", port, e))
        })
}

/// Accept one connection, or fail with [`ProtocolError::ConnectionClosed`]
/// once `cancel` fires.
pub async fn accept(
    listener: &TcpListener,
    cancel: &CancellationToken,
) -> Result<(TcpStream, SocketAddr)> {
    tokio::select! {
        _ = cancel.cancelled() => {
            Err(ProtocolError::ConnectionClosed("listener cancelled".to_string()))
        }
        accepted = listener.accept() => {
            let (stream, peer) = accepted?;
            stream.set_nodelay(true)?;
            debug!("Accepted connection from {}", peer);
            Ok((stream, peer))
        }
    }
}

/// Accept the first connection coming from `expected`, within `timeout`.
///
/// Connections from any other address are dropped.
pub async fn accept_from(
    listener: &TcpListener,
    expected: IpAddr,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(TcpStream, SocketAddr)> {
    let accepting = async {
        loop {
            let (stream, peer) = accept(listener, cancel).await?;
            if peer.ip() == expected {
                return Ok::<_, ProtocolError>((stream, peer));
            }
            warn!("Dropping connection from {}, expected {}", peer, expected);
        }
    };

    tokio::time::timeout(timeout, accepting)
        .await
        .map_err(|_| {
            ProtocolError::Timeout(format!(
                "no connection from {} within {:?}",
                expected, timeout
            ))
        })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = connect(SocketAddr::from(([127, 0, 0, 1], port)), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionRefused(_)));
    }

    #[tokio::test]
    async fn test_accept_cancelled() {
        let listener = bind(0).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = accept(&listener, &cancel).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_connect_and_accept() {
        let listener = bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();

        let (client, server) = tokio::join!(
            connect(SocketAddr::from(([127, 0, 0, 1], port)), Duration::from_secs(2)),
            accept(&listener, &cancel)
        );
        let client = client.unwrap();
        let (server, peer) = server.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
        assert_eq!(server.peer_addr().unwrap(), client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_accept_from_expected_peer() {
        let listener = bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let localhost = IpAddr::from([127, 0, 0, 1]);

        let (client, server) = tokio::join!(
            connect(SocketAddr::new(localhost, port), Duration::from_secs(2)),
            accept_from(&listener, localhost, Duration::from_secs(2), &cancel)
        );
        let client = client.unwrap();
        let (_, peer) = server.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_accept_from_drops_other_peers() {
        use tokio::io::AsyncReadExt;

        let listener = bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let cancel = CancellationToken::new();

        let (client, server) = tokio::join!(
            connect(SocketAddr::from(([127, 0, 0, 1], port)), Duration::from_secs(2)),
            accept_from(
                &listener,
                IpAddr::from([192, 0, 2, 1]),
                Duration::from_millis(300),
                &cancel
            )
        );
        assert!(matches!(server.unwrap_err(), ProtocolError::Timeout(_)));

        // The stranger's connection was closed.
        let mut client = client.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
    }
}
