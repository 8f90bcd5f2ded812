//! Handshake message definitions for DashDrop.
//!
//! Peers exchange a [`DeviceDescriptor`] before any data moves. The
//! descriptor's device type decides whether the two implementations can talk
//! at all and which [`TransferProfile`] governs the session.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::framing::DEFAULT_CHUNK_SIZE;
use crate::metadata::PathRule;

/// Maximum size of an encoded descriptor.
pub const MAX_DESCRIPTOR_SIZE: u64 = 64 * 1024;

/// Which peer implementation is on the other end.
///
/// The wire tags are historical: each names the language the first peer of
/// that family was written in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceType {
    /// Desktop peers, tag `python`.
    Desktop,
    /// Android peers, tag `java`.
    Android,
    /// iOS peers, tag `swift`.
    Ios,
    /// Any other tag; never compatible.
    Other(String),
}

impl DeviceType {
    /// Wire tag for this device type.
    pub fn as_tag(&self) -> &str {
        match self {
            DeviceType::Desktop => "python",
            DeviceType::Android => "java",
            DeviceType::Ios => "swift",
            DeviceType::Other(tag) => tag.as_str(),
        }
    }

    /// Parse a wire tag. Unknown tags become [`DeviceType::Other`].
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "python" => DeviceType::Desktop,
            "java" => DeviceType::Android,
            "swift" => DeviceType::Ios,
            other => DeviceType::Other(other.to_string()),
        }
    }

    /// Whether a session with this peer type can proceed.
    pub fn is_compatible(&self) -> bool {
        !matches!(self, DeviceType::Other(_))
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl Serialize for DeviceType {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_tag())
    }
}

impl<'de> Deserialize<'de> for DeviceType {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(DeviceType::from_tag(&tag))
    }
}

/// Capability descriptor sent by each side of the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Implementation family.
    pub device_type: DeviceType,
    /// Free-form operating system tag.
    pub os: String,
    /// Sender's address as it sees it. Some peers include it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Port of the responder's data listener.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_port: Option<u16>,
}

impl DeviceDescriptor {
    /// Descriptor for this process.
    pub fn local(device_type: DeviceType) -> Self {
        Self {
            device_type,
            os: std::env::consts::OS.to_string(),
            ip: None,
            data_port: None,
        }
    }

    pub fn with_data_port(mut self, port: u16) -> Self {
        self.data_port = Some(port);
        self
    }

    /// Encode as JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Decode from JSON.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Reject peers whose type is not recognized.
    pub fn ensure_compatible(&self) -> Result<()> {
        if self.device_type.is_compatible() {
            Ok(())
        } else {
            Err(ProtocolError::IncompatibleDevice {
                device_type: self.device_type.as_tag().to_string(),
            })
        }
    }
}

/// Per-peer-family conventions for one transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProfile {
    /// Bytes per payload write on the sending side.
    pub chunk_size: usize,
    /// How received folder names are cleaned.
    pub path_rule: PathRule,
    /// Data port the peer family listens on by default.
    pub data_port: u16,
}

impl TransferProfile {
    pub const DESKTOP: TransferProfile = TransferProfile {
        chunk_size: DEFAULT_CHUNK_SIZE,
        path_rule: PathRule::Plain,
        data_port: 58000,
    };

    pub const ANDROID: TransferProfile = TransferProfile {
        chunk_size: DEFAULT_CHUNK_SIZE,
        path_rule: PathRule::AndroidDocumentUri,
        data_port: 58100,
    };

    pub const IOS: TransferProfile = TransferProfile {
        chunk_size: DEFAULT_CHUNK_SIZE,
        path_rule: PathRule::Plain,
        data_port: 57341,
    };

    /// Profile for talking to a peer of the given type.
    pub fn for_device(device_type: &DeviceType) -> Result<Self> {
        match device_type {
            DeviceType::Desktop => Ok(Self::DESKTOP),
            DeviceType::Android => Ok(Self::ANDROID),
            DeviceType::Ios => Ok(Self::IOS),
            DeviceType::Other(tag) => Err(ProtocolError::IncompatibleDevice {
                device_type: tag.clone(),
            }),
        }
    }
}

impl Default for TransferProfile {
    fn default() -> Self {
        Self::DESKTOP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_tags() {
        for (tag, device_type) in [
            ("python", DeviceType::Desktop),
            ("java", DeviceType::Android),
            ("swift", DeviceType::Ios),
        ] {
            assert_eq!(DeviceType::from_tag(tag), device_type);
            assert_eq!(device_type.as_tag(), tag);
            assert!(device_type.is_compatible());
        }

        let other = DeviceType::from_tag("toaster");
        assert_eq!(other, DeviceType::Other("toaster".to_string()));
        assert!(!other.is_compatible());
    }

    #[test]
    fn test_descriptor_wire_format() {
        let descriptor = DeviceDescriptor {
            device_type: DeviceType::Android,
            os: "android".to_string(),
            ip: None,
            data_port: None,
        };
        let json: serde_json::Value =
            serde_json::from_slice(&descriptor.to_json().unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"device_type": "java", "os": "android"}));
    }

    #[test]
    fn test_descriptor_accepts_peer_fields() {
        let descriptor = DeviceDescriptor::from_json(
            br#"{"device_type": "swift", "os": "iOS 17", "ip": "192.168.1.20", "data_port": 40123}"#,
        )
        .unwrap();
        assert_eq!(descriptor.device_type, DeviceType::Ios);
        assert_eq!(descriptor.ip.as_deref(), Some("192.168.1.20"));
        assert_eq!(descriptor.data_port, Some(40123));
    }

    #[test]
    fn test_descriptor_missing_type_is_error() {
        let err = DeviceDescriptor::from_json(br#"{"os": "linux"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_incompatible_descriptor() {
        let descriptor = DeviceDescriptor::local(DeviceType::from_tag("kotlin"));
        let err = descriptor.ensure_compatible().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::IncompatibleDevice { ref device_type } if device_type == "kotlin"
        ));
    }

    #[test]
    fn test_profiles() {
        assert_eq!(
            TransferProfile::for_device(&DeviceType::Desktop).unwrap().data_port,
            58000
        );
        let android = TransferProfile::for_device(&DeviceType::Android).unwrap();
        assert_eq!(android.path_rule, PathRule::AndroidDocumentUri);
        assert_eq!(android.chunk_size, 4096);
        assert_eq!(
            TransferProfile::for_device(&DeviceType::Ios).unwrap().data_port,
            57341
        );
        assert!(TransferProfile::for_device(&DeviceType::Other("x".into())).is_err());
    }
}
