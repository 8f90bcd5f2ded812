//! Error types for the protocol crate.

use std::fmt;

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Connection errors
    /// The peer could not be reached at connect time.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The stream ended before a frame was complete.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    // Handshake errors
    /// The peer announced a device type this implementation cannot talk to.
    #[error("incompatible device: peer reported device type {device_type:?}")]
    IncompatibleDevice {
        /// Device type tag received from the peer.
        device_type: String,
    },

    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Decryption failed, usually because of a wrong password.
    #[error("decryption failed: {0}")]
    Decryption(String),

    // Folder metadata errors
    /// Folder metadata is malformed or lacks a root descriptor.
    #[error("invalid folder metadata: {0}")]
    Metadata(String),

    // Filesystem errors
    /// Reading or writing a local file failed.
    #[error("filesystem error: {0}")]
    Filesystem(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Coarse error category handed to the error callback of the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConnectionRefused,
    ConnectionClosed,
    Timeout,
    IncompatibleDevice,
    Serialization,
    Decryption,
    Metadata,
    Filesystem,
}

impl ErrorKind {
    /// Stable lowercase name, suitable for logs and UI message lookup.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::ConnectionClosed => "connection_closed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::IncompatibleDevice => "incompatible_device",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Decryption => "decryption",
            ErrorKind::Metadata => "metadata",
            ErrorKind::Filesystem => "filesystem",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ProtocolError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::ConnectionRefused(_) => ErrorKind::ConnectionRefused,
            ProtocolError::ConnectionClosed(_) => ErrorKind::ConnectionClosed,
            ProtocolError::Timeout(_) => ErrorKind::Timeout,
            ProtocolError::IncompatibleDevice { .. } => ErrorKind::IncompatibleDevice,
            ProtocolError::Serialization(_) | ProtocolError::Deserialization(_) => {
                ErrorKind::Serialization
            }
            ProtocolError::Decryption(_) => ErrorKind::Decryption,
            ProtocolError::Metadata(_) => ErrorKind::Metadata,
            ProtocolError::Filesystem(_) => ErrorKind::Filesystem,
        }
    }

    /// Wraps an I/O error that happened on a local file, keeping the path in the message.
    pub fn filesystem(path: &std::path::Path, err: std::io::Error) -> Self {
        ProtocolError::Filesystem(format!("{}: {}", path.display(), err))
    }
}

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionRefused => ProtocolError::ConnectionRefused(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Filesystem(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_closed_error_display() {
        let err = ProtocolError::ConnectionClosed("peer disconnected".to_string());
        assert_eq!(err.to_string(), "connection closed: peer disconnected");
    }

    #[test]
    fn test_incompatible_device_error_display() {
        let err = ProtocolError::IncompatibleDevice {
            device_type: "toaster".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "incompatible device: peer reported device type \"toaster\""
        );
    }

    #[test]
    fn test_decryption_error_display() {
        let err = ProtocolError::Decryption("bad padding".to_string());
        assert_eq!(err.to_string(), "decryption failed: bad padding");
    }

    #[test]
    fn test_metadata_error_display() {
        let err = ProtocolError::Metadata("missing root folder".to_string());
        assert_eq!(
            err.to_string(),
            "invalid folder metadata: missing root folder"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ProtocolError::ConnectionRefused(String::new()).kind(),
            ErrorKind::ConnectionRefused
        );
        assert_eq!(
            ProtocolError::Deserialization(String::new()).kind(),
            ErrorKind::Serialization
        );
        assert_eq!(
            ProtocolError::Filesystem(String::new()).kind(),
            ErrorKind::Filesystem
        );
        assert_eq!(ErrorKind::IncompatibleDevice.to_string(), "incompatible_device");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let protocol_err: ProtocolError = json_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_io_error_timeout() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Timeout(_)));
    }

    #[test]
    fn test_from_io_error_connection_closed() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::ConnectionClosed(_)));
    }

    #[test]
    fn test_from_io_error_refused() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let protocol_err: ProtocolError = io_err.into();
        assert_eq!(protocol_err.kind(), ErrorKind::ConnectionRefused);
    }

    #[test]
    fn test_from_io_error_other() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Filesystem(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
