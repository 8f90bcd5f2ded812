//! LAN discovery over UDP broadcast.
//!
//! Receivers listen on the discovery port for the literal token `DISCOVER`
//! and answer the sender, on its reply port, with `RECEIVER:<name>`.
//! Senders broadcast the token and collect replies for a fixed window.
//!
//! ```text
//! sender                                   receiver
//!   │ ── "DISCOVER" ──► 255.255.255.255:12345 │
//!   │ ◄── "RECEIVER:<name>" ── <sender ip>:12346
//! ```

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use protocol::{DeviceDescriptor, DeviceType};
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Probe sent by senders.
pub const DISCOVER_TOKEN: &[u8] = b"DISCOVER";

/// Prefix of a receiver's reply.
pub const REPLY_PREFIX: &str = "RECEIVER:";

const MAX_DATAGRAM: usize = 1024;

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 5_000;
/// Consecutive receive failures after which the advertiser gives up.
const MAX_RECEIVE_FAILURES: u32 = 10;

/// Errors that can occur during discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The UDP socket could not be set up.
    #[error("failed to bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The configured broadcast address is not IPv4.
    #[error("invalid broadcast address: {0}")]
    InvalidBroadcastAddress(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A peer found during one discovery round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub address: IpAddr,
    pub display_name: String,
    /// Known after the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
    /// Known after the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operating_system: Option<String>,
}

impl Device {
    pub fn new(address: IpAddr, display_name: impl Into<String>) -> Self {
        Self {
            address,
            display_name: display_name.into(),
            device_type: None,
            operating_system: None,
        }
    }

    /// Fill in what the handshake revealed about this device.
    pub fn with_descriptor(mut self, descriptor: &DeviceDescriptor) -> Self {
        self.device_type = Some(descriptor.device_type.clone());
        self.operating_system = Some(descriptor.os.clone());
        self
    }
}

/// Discovery state machine: `Idle → Broadcasting → Collecting → Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// No discovery round in progress.
    Idle,
    /// Sending the `DISCOVER` probe.
    Broadcasting,
    /// Waiting for replies.
    Collecting,
}

/// Discovery parameters, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub device_name: String,
    pub discovery_port: u16,
    pub reply_port: u16,
    pub broadcast_address: Ipv4Addr,
    pub window: Duration,
    pub max_attempts: u32,
}

impl DiscoverySettings {
    pub fn from_config(config: &Config) -> Result<Self, DiscoveryError> {
        let broadcast_address = config
            .network
            .broadcast_address
            .parse()
            .map_err(|_| {
                DiscoveryError::InvalidBroadcastAddress(config.network.broadcast_address.clone())
            })?;

        Ok(Self {
            device_name: config.device.name.clone(),
            discovery_port: config.network.discovery_port,
            reply_port: config.network.reply_port,
            broadcast_address,
            window: config.network.discovery_window(),
            max_attempts: config.network.discovery_attempts,
        })
    }
}

/// Finds receivers and answers senders.
pub struct DiscoveryService {
    settings: DiscoverySettings,
    state: watch::Sender<DiscoveryState>,
}

impl DiscoveryService {
    pub fn new(settings: DiscoverySettings) -> Self {
        let (state, _) = watch::channel(DiscoveryState::Idle);
        Self { settings, state }
    }

    /// Current state.
    pub fn state(&self) -> DiscoveryState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<DiscoveryState> {
        self.state.subscribe()
    }

    pub fn settings(&self) -> &DiscoverySettings {
        &self.settings
    }

    /// Answer `DISCOVER` probes until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the discovery port cannot be bound, or if receiving
    /// fails repeatedly.
    pub async fn advertise(&self, cancel: CancellationToken) -> Result<(), DiscoveryError> {
        let socket = bind_udp(self.settings.discovery_port)?;
        let reply = format!("{}{}", REPLY_PREFIX, self.settings.device_name);
        let mut buffer = [0u8; MAX_DATAGRAM];
        let mut backoff = ReceiveBackoff::default();

        info!(
            "Advertising as {:?} on UDP port {}",
            self.settings.device_name, self.settings.discovery_port
        );

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buffer) => received,
            };

            let (len, from) = match received {
                Ok(received) => {
                    backoff.reset();
                    received
                }
                Err(e) => {
                    let Some(delay) = backoff.next_delay() else {
                        warn!("Discovery receive keeps failing, giving up: {}", e);
                        return Err(DiscoveryError::Io(e));
                    };
                    warn!("Discovery receive failed, retrying in {:?}: {}", delay, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            if &buffer[..len] != DISCOVER_TOKEN {
                debug!("Ignoring {} byte datagram from {}", len, from);
                continue;
            }

            let target = SocketAddr::new(from.ip(), self.settings.reply_port);
            debug!("DISCOVER from {}, replying to {}", from, target);
            if let Err(e) = socket.send_to(reply.as_bytes(), target).await {
                warn!("Failed to reply to {}: {}", target, e);
            }
        }

        info!("Stopped advertising");
        Ok(())
    }

    /// Broadcast `DISCOVER` and collect replies.
    ///
    /// Retries up to the configured number of attempts while nothing has
    /// answered. Finding nobody is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply port cannot be bound.
    pub async fn discover(&self) -> Result<Vec<Device>, DiscoveryError> {
        let result = self.run_discovery().await;
        self.state.send_replace(DiscoveryState::Idle);
        result
    }

    async fn run_discovery(&self) -> Result<Vec<Device>, DiscoveryError> {
        let socket = bind_udp(self.settings.reply_port)?;
        let target = SocketAddr::new(
            IpAddr::V4(self.settings.broadcast_address),
            self.settings.discovery_port,
        );
        let mut devices: Vec<Device> = Vec::new();

        for attempt in 1..=self.settings.max_attempts {
            self.state.send_replace(DiscoveryState::Broadcasting);
            debug!("Discovery attempt {}/{} to {}", attempt, self.settings.max_attempts, target);
            if let Err(e) = socket.send_to(DISCOVER_TOKEN, target).await {
                warn!("Failed to broadcast discovery probe: {}", e);
            }

            self.state.send_replace(DiscoveryState::Collecting);
            collect_replies(&socket, self.settings.window, &mut devices).await;

            if !devices.is_empty() {
                break;
            }
        }

        info!("Discovery found {} device(s)", devices.len());
        Ok(devices)
    }
}

async fn collect_replies(socket: &UdpSocket, window: Duration, devices: &mut Vec<Device>) {
    let deadline = Instant::now() + window;
    let mut buffer = [0u8; MAX_DATAGRAM];

    loop {
        let received =
            match tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer)).await {
                Err(_) => break,
                Ok(received) => received,
            };

        match received {
            Ok((len, from)) => match parse_reply(&buffer[..len], from) {
                Some(device) if !devices.iter().any(|d| d.address == device.address) => {
                    info!("Found {} at {}", device.display_name, device.address);
                    devices.push(device);
                }
                Some(_) => {}
                None => debug!("Ignoring datagram from {}", from),
            },
            Err(e) => warn!("Discovery receive failed: {}", e),
        }
    }
}

/// Exponential delay between failed receives on the advertiser socket.
#[derive(Debug)]
struct ReceiveBackoff {
    current: Duration,
    failures: u32,
}

impl Default for ReceiveBackoff {
    fn default() -> Self {
        Self {
            current: Duration::from_millis(INITIAL_BACKOFF_MS),
            failures: 0,
        }
    }
}

impl ReceiveBackoff {
    /// Delay before the next receive, or `None` once too many failed in a row.
    fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= MAX_RECEIVE_FAILURES {
            return None;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(Duration::from_millis(MAX_BACKOFF_MS));
        Some(delay)
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Parse a `RECEIVER:<name>` reply.
pub fn parse_reply(bytes: &[u8], from: SocketAddr) -> Option<Device> {
    let text = std::str::from_utf8(bytes).ok()?;
    let name = text.strip_prefix(REPLY_PREFIX)?.trim();
    if name.is_empty() {
        return None;
    }
    Some(Device::new(from.ip(), name))
}

/// Bind a broadcast-capable, address-reusing UDP socket on all interfaces.
fn bind_udp(port: u16) -> Result<UdpSocket, DiscoveryError> {
    let bind = |port: u16| -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
        UdpSocket::from_std(socket.into())
    };
    bind(port).map_err(|source| DiscoveryError::Bind { port, source })
}
