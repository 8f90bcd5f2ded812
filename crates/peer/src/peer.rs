//! Peer coordinator wiring discovery, handshake and transfer sessions.
//!
//! A [`Peer`] owns the configuration, the session slot and the shutdown
//! token. The sending side runs [`Peer::send_to`]; the receiving side binds a
//! [`ReceiveEndpoint`] once and calls [`Peer::receive_on`] for every incoming
//! transfer.

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use protocol::{DeviceDescriptor, ProtocolError, TransferProfile};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery::{Device, DiscoveryError, DiscoveryService, DiscoverySettings};
use crate::network::{self, handshake, Negotiated};
use crate::session::{
    self, cancellable, DecryptOutcome, PasswordProvider, PendingDecryption, ReceiveOptions,
    ReceiveOutcome, SaveDirProvider, SendOptions, SessionSlot, TransferObserver, TransferRequest,
    TransferSummary,
};

/// Events emitted by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A handshake succeeded and data is about to move.
    SessionStarted { peer: IpAddr, device_type: String },
    /// The session ended normally.
    SessionFinished { files: usize },
    /// The session ended with an error.
    SessionFailed { message: String },
}

/// Listeners of the receiving side.
///
/// The data listener is bound before any handshake so the port it got can be
/// advertised to the sender.
#[derive(Debug)]
pub struct ReceiveEndpoint {
    handshake: TcpListener,
    data: TcpListener,
}

impl ReceiveEndpoint {
    pub fn handshake_port(&self) -> Result<u16> {
        Ok(self.handshake.local_addr()?.port())
    }

    pub fn data_port(&self) -> Result<u16> {
        Ok(self.data.local_addr()?.port())
    }
}

/// One local peer: sends to and receives from other devices.
pub struct Peer {
    config: Config,
    slot: SessionSlot,
    shutdown: CancellationToken,
    event_tx: broadcast::Sender<PeerEvent>,
}

impl Peer {
    /// Create a peer from an already validated configuration.
    pub fn new(config: Config) -> Self {
        let shutdown = CancellationToken::new();
        let (event_tx, _) = broadcast::channel(64);
        Self {
            config,
            slot: SessionSlot::with_parent(shutdown.clone()),
            shutdown,
            event_tx,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a receiver for peer events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Whether a transfer is running.
    pub fn is_busy(&self) -> bool {
        self.slot.is_active()
    }

    /// Cancel the running session without shutting down.
    pub fn cancel_session(&self) {
        self.slot.cancel_current();
    }

    /// Cancel the running session and every background task.
    pub fn stop(&self) {
        info!("Stopping peer");
        self.shutdown.cancel();
    }

    /// What this peer tells others about itself during the handshake.
    pub fn local_descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor::local(self.config.device_type())
    }

    /// Broadcast for receivers and collect their replies.
    pub async fn discover(&self) -> Result<Vec<Device>> {
        let settings =
            DiscoverySettings::from_config(&self.config).context("Invalid discovery settings")?;
        let devices = DiscoveryService::new(settings)
            .discover()
            .await
            .context("Discovery failed")?;
        info!("Discovered {} device(s)", devices.len());
        Ok(devices)
    }

    /// Answer discovery probes in the background until [`Peer::stop`].
    pub fn spawn_advertiser(&self) -> Result<JoinHandle<Result<(), DiscoveryError>>> {
        let settings =
            DiscoverySettings::from_config(&self.config).context("Invalid discovery settings")?;
        let service = DiscoveryService::new(settings);
        let cancel = self.shutdown.child_token();
        Ok(tokio::spawn(async move { service.advertise(cancel).await }))
    }

    /// Handshake with the receiver at `addr`, then send `request` to it.
    ///
    /// Setting `password` encrypts every file. Failures are reported to
    /// `observer` before being returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the receiver cannot be reached, is incompatible,
    /// or the transfer breaks off.
    pub async fn send_to(
        &self,
        addr: IpAddr,
        request: &TransferRequest,
        password: Option<String>,
        observer: &dyn TransferObserver,
    ) -> Result<TransferSummary> {
        let cancel = self.slot.begin();
        let timeout = self.config.network.connect_timeout();

        let connected = cancellable(&cancel, async {
            let negotiated = self.negotiate_with(addr).await?;
            let data_addr = SocketAddr::new(addr, negotiated.data_port());
            let stream = network::connect(data_addr, timeout).await?;
            Ok::<_, ProtocolError>((negotiated, stream))
        })
        .await;

        let (negotiated, stream) = match connected {
            Ok(connected) => connected,
            Err(e) => return Err(self.report(observer, e)).context("Failed to reach receiver"),
        };
        self.emit_event(PeerEvent::SessionStarted {
            peer: addr,
            device_type: negotiated.peer.device_type.to_string(),
        });

        let options = SendOptions {
            profile: negotiated.profile,
            password,
            temp_dir: self.config.transfer.temp_dir.clone(),
        };
        let result = session::send(stream, request, &options, observer, &cancel).await;
        self.finish(result.as_ref().map(|summary| summary.files));
        result.context("Transfer failed")
    }

    async fn negotiate_with(&self, addr: IpAddr) -> protocol::Result<Negotiated> {
        let timeout = self.config.network.connect_timeout();
        let control_addr = SocketAddr::new(addr, self.config.network.handshake_port);
        let mut control = network::connect(control_addr, timeout).await?;
        let local = self.local_descriptor();
        let negotiated =
            handshake::with_timeout(timeout, network::initiate(&mut control, &local)).await?;
        debug!(
            "Receiver expects data on port {} ({:?})",
            negotiated.data_port(),
            negotiated.profile.path_rule
        );
        Ok(negotiated)
    }

    /// Bind the handshake and data listeners.
    ///
    /// The data listener takes the configured port, or this device family's
    /// default when none is set.
    pub async fn listen(&self) -> Result<ReceiveEndpoint> {
        let own_profile = TransferProfile::for_device(&self.config.device_type())
            .context("Local device type cannot receive")?;
        let data_port = self.config.network.data_port.unwrap_or(own_profile.data_port);

        let data = network::bind(data_port)
            .await
            .context("Failed to bind data listener")?;
        let handshake = network::bind(self.config.network.handshake_port)
            .await
            .context("Failed to bind handshake listener")?;

        let endpoint = ReceiveEndpoint { handshake, data };
        info!(
            "Listening for handshakes on port {}, data on port {}",
            endpoint.handshake_port()?,
            endpoint.data_port()?
        );
        Ok(endpoint)
    }

    /// Wait for one sender on `endpoint` and receive its transfer.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails, the transfer breaks off, or
    /// the peer is stopped while waiting.
    pub async fn receive_on(
        &self,
        endpoint: &ReceiveEndpoint,
        observer: &dyn TransferObserver,
    ) -> Result<ReceiveOutcome> {
        let cancel = self.slot.begin();
        let timeout = self.config.network.connect_timeout();
        let local = self.local_descriptor().with_data_port(endpoint.data_port()?);

        let accepted = async {
            let (mut control, from) = network::accept(&endpoint.handshake, &cancel).await?;
            let negotiated =
                handshake::with_timeout(timeout, network::respond(&mut control, &local)).await?;
            let (data, _) =
                network::accept_from(&endpoint.data, from.ip(), timeout, &cancel).await?;
            Ok::<_, ProtocolError>((negotiated, from, data))
        }
        .await;

        let (negotiated, from, data) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => return Err(self.report(observer, e)).context("No transfer received"),
        };
        self.emit_event(PeerEvent::SessionStarted {
            peer: from.ip(),
            device_type: negotiated.peer.device_type.to_string(),
        });

        let options = ReceiveOptions {
            save_dir: self.config.save_dir(),
            profile: negotiated.profile,
            max_password_attempts: self.config.transfer.max_password_attempts,
        };
        let result = session::receive(data, &options, observer, &cancel).await;
        self.finish(result.as_ref().map(|outcome| outcome.received.len()));
        result.context("Transfer failed")
    }

    /// Bind, receive a single transfer, and release the listeners.
    pub async fn receive_once(&self, observer: &dyn TransferObserver) -> Result<ReceiveOutcome> {
        let endpoint = self.listen().await?;
        self.receive_on(&endpoint, observer).await
    }

    fn report(&self, observer: &dyn TransferObserver, error: ProtocolError) -> ProtocolError {
        warn!("Session setup failed: {}", error);
        observer.on_error(error.kind(), &error.to_string());
        self.emit_event(PeerEvent::SessionFailed {
            message: error.to_string(),
        });
        error
    }

    fn finish(&self, result: std::result::Result<usize, &ProtocolError>) {
        let event = match result {
            Ok(files) => PeerEvent::SessionFinished { files },
            Err(e) => PeerEvent::SessionFailed {
                message: e.to_string(),
            },
        };
        self.emit_event(event);
    }

    fn emit_event(&self, event: PeerEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Run the password loop for `pending` off the async runtime.
pub async fn decrypt_pending<P>(
    mut pending: PendingDecryption,
    mut provider: P,
) -> Result<DecryptOutcome>
where
    P: PasswordProvider + 'static,
{
    tokio::task::spawn_blocking(move || pending.run_with(&mut provider))
        .await
        .context("Decryption task failed")?
        .context("Failed to decrypt received files")
}
