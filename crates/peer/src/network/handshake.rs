//! Device-type handshake.
//!
//! Runs on its own connection before any data moves:
//!
//! ```text
//! Initiator                              Responder
//!     |                                      |
//!     |------ u64 len + descriptor JSON ---->|
//!     |<----- u64 len + descriptor JSON -----|
//!     |                                      |
//!  both sides check the peer's device_type and pick a TransferProfile
//! ```
//!
//! The responder's descriptor may carry `data_port`, the port its data
//! listener is bound to.

use protocol::{
    DeviceDescriptor, FrameCodec, ProtocolError, Result, TransferProfile, MAX_DESCRIPTOR_SIZE,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// What the peer told us about itself.
    pub peer: DeviceDescriptor,
    /// Conventions for the session with this peer.
    pub profile: TransferProfile,
}

impl Negotiated {
    /// Port to open the data connection on: the one the peer advertised,
    /// else its family's default.
    pub fn data_port(&self) -> u16 {
        self.peer.data_port.unwrap_or(self.profile.data_port)
    }
}

/// Handshake as the connecting side: send our descriptor, then read the peer's.
///
/// # Errors
///
/// Returns [`ProtocolError::IncompatibleDevice`] if the peer's device type is
/// not recognized; the connection is shut down in that case.
pub async fn initiate<S>(stream: &mut S, local: &DeviceDescriptor) -> Result<Negotiated>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut codec = FrameCodec::new(stream);
    codec.write_length_prefixed(&local.to_json()?).await?;
    let peer = read_descriptor(&mut codec).await?;

    conclude(&mut codec, peer).await
}

/// Handshake as the accepting side: read the peer's descriptor, reply with ours.
///
/// The reply is sent even when the peer turns out incompatible, so it can
/// report the mismatch too.
///
/// # Errors
///
/// Returns [`ProtocolError::IncompatibleDevice`] if the peer's device type is
/// not recognized; the connection is shut down in that case.
pub async fn respond<S>(stream: &mut S, local: &DeviceDescriptor) -> Result<Negotiated>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut codec = FrameCodec::new(stream);
    let peer = read_descriptor(&mut codec).await?;
    codec.write_length_prefixed(&local.to_json()?).await?;

    conclude(&mut codec, peer).await
}

async fn read_descriptor<S: AsyncRead + Unpin>(
    codec: &mut FrameCodec<S>,
) -> Result<DeviceDescriptor> {
    let bytes = codec.read_length_prefixed(MAX_DESCRIPTOR_SIZE).await?;
    let descriptor = DeviceDescriptor::from_json(&bytes)?;
    debug!(
        "Peer descriptor: type={} os={:?} data_port={:?}",
        descriptor.device_type, descriptor.os, descriptor.data_port
    );
    Ok(descriptor)
}

async fn conclude<S>(codec: &mut FrameCodec<S>, peer: DeviceDescriptor) -> Result<Negotiated>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let profile = match peer
        .ensure_compatible()
        .and_then(|_| TransferProfile::for_device(&peer.device_type))
    {
        Ok(profile) => profile,
        Err(e) => {
            warn!("Rejecting peer: {}", e);
            if let Err(shutdown_err) = codec.shutdown().await {
                debug!("Shutdown after rejected handshake failed: {}", shutdown_err);
            }
            return Err(e);
        }
    };

    info!("Handshake complete with {} peer ({})", peer.device_type, peer.os);
    Ok(Negotiated { peer, profile })
}

/// Map a handshake that ran out of time to [`ProtocolError::Timeout`].
pub async fn with_timeout<F>(timeout: std::time::Duration, handshake: F) -> Result<Negotiated>
where
    F: std::future::Future<Output = Result<Negotiated>>,
{
    tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| ProtocolError::Timeout(format!("handshake took longer than {:?}", timeout)))?
}
