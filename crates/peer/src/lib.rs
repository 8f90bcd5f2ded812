//! # DashDrop Peer Library
//!
//! This crate provides the peer side of DashDrop: finding receivers on the
//! local network and moving files and folders between devices.
//!
//! ## Overview
//!
//! - **Discovery**: UDP broadcast probes and unicast replies
//! - **Handshake**: device-type exchange that picks the transfer profile
//! - **Sessions**: sequential frame streaming with optional encryption and
//!   a deferred, password-driven decryption pass
//! - **Configuration**: TOML file with environment overrides
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                          Peer                            │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────┐  │
//! │  │  Discovery   │  │  Handshake   │  │ Session slot   │  │
//! │  │  (UDP)       │  │  (TCP)       │  │ send / receive │  │
//! │  └──────────────┘  └──────────────┘  └────────────────┘  │
//! │                                                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │       protocol: frames, metadata, encryption       │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//!
//! use peer::session::{NoopObserver, TransferRequest};
//! use peer::{Config, Peer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let peer = Peer::new(config);
//!
//!     for device in peer.discover().await? {
//!         let request = TransferRequest::new(vec![PathBuf::from("holiday")])?;
//!         peer.send_to(device.address, &request, None, &NoopObserver).await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`discovery`]: Finding receivers
//! - [`logging`]: Subscriber setup
//! - [`network`]: TCP plumbing and the handshake
//! - [`session`]: Send and receive loops, decryption, callbacks
//! - [`peer`]: Coordinator tying the pieces together
//! - [`console`]: Line-per-file transfer output for the binary

pub mod config;
pub mod console;
pub mod discovery;
pub mod logging;
pub mod network;
pub mod peer;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};
pub use console::ConsoleObserver;
pub use discovery::{Device, DiscoveryError, DiscoveryService, DiscoverySettings, DiscoveryState};
pub use network::Negotiated;
pub use peer::{decrypt_pending, Peer, PeerEvent, ReceiveEndpoint};
pub use session::{
    DecryptOutcome, EventObserver, NoopObserver, PasswordProvider, PendingDecryption,
    ReceiveOutcome, SaveDirProvider, SessionSlot, TransferEvent, TransferObserver,
    TransferRequest, TransferSummary,
};
