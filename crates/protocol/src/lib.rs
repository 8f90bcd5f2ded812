//! # DashDrop Protocol Library
//!
//! This crate provides the wire protocol shared by every DashDrop peer:
//! the frame codec, folder metadata, handshake descriptors and the
//! password-based file encryption.
//!
//! ## Overview
//!
//! A transfer is a sequence of frames on one TCP connection:
//!
//! ```text
//! ┌──────────────┬──────────┬──────┬─────────────┬───────────────┐
//! │ flag (8 B)   │ name len │ name │ payload len │ payload bytes │
//! │ "encyp: t/f" │ u64 LE   │ UTF8 │ u64 LE      │               │
//! └──────────────┴──────────┴──────┴─────────────┴───────────────┘
//!   ...repeated, then "encyp: h" (halt, no further fields)
//! ```
//!
//! Folder transfers start with a plain frame named `metadata.json` that
//! describes the tree. Encrypted frames carry `salt ++ iv ++ ciphertext` and a
//! name ending in `.crypt`.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{DeviceDescriptor, DeviceType, TransferProfile};
//!
//! let local = DeviceDescriptor::local(DeviceType::Desktop);
//! let bytes = local.to_json().unwrap();
//!
//! let peer = DeviceDescriptor::from_json(&bytes).unwrap();
//! peer.ensure_compatible().unwrap();
//! let profile = TransferProfile::for_device(&peer.device_type).unwrap();
//! assert_eq!(profile.chunk_size, 4096);
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: Frame headers and the async frame codec
//! - [`crypto`]: PBKDF2 + AES-256-CBC file encryption
//! - [`metadata`]: Folder metadata and destination reconstruction
//! - [`messages`]: Handshake descriptors and transfer profiles
//! - [`error`]: Error types

pub mod crypto;
pub mod error;
pub mod framing;
pub mod messages;
pub mod metadata;

pub use crypto::{
    decrypt_file, decrypt_stream, derive_key, encrypt_file, encrypt_stream, EncryptedBlob,
    CRYPT_SUFFIX, PBKDF2_ITERATIONS,
};
pub use error::{ErrorKind, ProtocolError, Result};
pub use framing::{
    EncryptionFlag, FrameCodec, FrameHeader, DEFAULT_CHUNK_SIZE, FLAG_TOKEN_LEN,
    METADATA_FILE_NAME,
};
pub use messages::{DeviceDescriptor, DeviceType, TransferProfile, MAX_DESCRIPTOR_SIZE};
pub use metadata::{
    build_metadata, build_request_metadata, reconstruct_destination, resolve_entry_path,
    unique_dir, unique_path, FileEntry, Metadata, PathRule, RootDescriptor,
};
