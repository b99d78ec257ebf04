//! Device identity and transfer history records.
//!
//! [`DeviceInfo`] is the identity tuple exchanged during pairing and
//! advertised over mDNS. [`PairedDevice`] is the persisted credential a
//! successful pairing produces. [`Transfer`] is the finalized history
//! entry handed to the storage facade.

use std::path::PathBuf;

use base64::prelude::*;
use serde::{Deserialize, Serialize};

use crate::crypto::{self, SECRET_SIZE};
use crate::error::{Error, Result};

/// Device class advertised on the network.
///
/// Older records used OS names; those are accepted as synonyms on ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Desktop-class device (streams large files over a local GET endpoint)
    #[serde(alias = "macos", alias = "windows", alias = "linux")]
    Desktop,
    /// Mobile-class device (uploads large files to the receiver's endpoint)
    #[serde(alias = "android", alias = "ios")]
    Mobile,
}

impl Platform {
    /// Canonical TXT-record value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
        }
    }

    /// Parse a TXT-record value, accepting legacy OS-name synonyms.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "desktop" | "macos" | "windows" | "linux" => Some(Self::Desktop),
            "mobile" | "android" | "ios" => Some(Self::Mobile),
            _ => None,
        }
    }
}

/// Identity tuple of a device.
///
/// `host` and `port` are populated only for remote devices resolved via
/// discovery, or locally once the server socket is bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// URL-safe random 128-bit token, generated once and persisted
    pub id: String,
    /// Display name
    pub name: String,
    /// Device class
    pub platform: Platform,
    /// Application version
    pub version: String,
    /// Reachable host, if known
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub host: Option<String>,
    /// TCP listening port, if known
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub port: Option<u16>,
}

impl DeviceInfo {
    /// Create a local identity with a freshly generated id.
    #[must_use]
    pub fn generate(name: &str, platform: Platform) -> Self {
        Self {
            id: crypto::generate_device_id(),
            name: name.to_string(),
            platform,
            version: crate::VERSION.to_string(),
            host: None,
            port: None,
        }
    }
}

/// A device seen on the network via discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    /// Identity resolved from the mDNS record
    #[serde(flatten)]
    pub device: DeviceInfo,
    /// Epoch-milliseconds of the last resolution
    pub last_seen: u64,
}

impl DiscoveredDevice {
    /// Whether this entry has not been refreshed within the staleness
    /// window.
    #[must_use]
    pub fn is_stale(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen) > crate::DISCOVERY_STALE_MS
    }
}

/// Persisted credential for a successfully paired device.
///
/// Uniqueness is by device id; re-pairing overwrites.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedDevice {
    /// Remote identity at pairing time
    #[serde(flatten)]
    pub device: DeviceInfo,
    /// 32-byte shared secret, base64
    pub shared_secret: String,
    /// Epoch-milliseconds of the pairing
    pub paired_at: u64,
    /// Epoch-milliseconds of the last successful connection
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_connected: Option<u64>,
}

impl PairedDevice {
    /// Build a credential from a completed pairing.
    #[must_use]
    pub fn new(device: DeviceInfo, secret: &[u8; SECRET_SIZE]) -> Self {
        Self {
            device,
            shared_secret: BASE64_STANDARD.encode(secret),
            paired_at: crate::epoch_ms(),
            last_connected: None,
        }
    }

    /// Decode the stored shared secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored value is not a valid 32-byte key.
    pub fn secret(&self) -> Result<[u8; SECRET_SIZE]> {
        let raw = BASE64_STANDARD
            .decode(&self.shared_secret)
            .map_err(|e| Error::Internal(format!("corrupt stored secret: {e}")))?;
        raw.try_into()
            .map_err(|_| Error::Internal("stored secret is not 32 bytes".to_string()))
    }
}

/// Direction of a finished transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// We sent it
    Send,
    /// We received it
    Receive,
}

/// Payload-specific fields of a history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferDetail {
    /// A delivered text message
    Text {
        /// Message body
        content: String,
    },
    /// A completed file exchange
    #[serde(rename_all = "camelCase")]
    File {
        /// File name as sent
        file_name: String,
        /// Size in bytes
        file_size: u64,
        /// MIME type as sent
        mime_type: String,
        /// Absolute path of the saved file (receive side)
        #[serde(skip_serializing_if = "Option::is_none", default)]
        file_path: Option<PathBuf>,
        /// Wall-clock duration of the transfer
        #[serde(skip_serializing_if = "Option::is_none", default)]
        duration_ms: Option<u64>,
        /// Derived throughput
        #[serde(skip_serializing_if = "Option::is_none", default)]
        speed_bytes_per_sec: Option<u64>,
    },
}

/// A finalized history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    /// Unique entry id
    pub id: String,
    /// Epoch-milliseconds of completion
    pub timestamp: u64,
    /// Direction
    pub direction: TransferDirection,
    /// Remote device id
    pub device_id: String,
    /// Remote device name
    pub device_name: String,
    /// Text or file detail
    #[serde(flatten)]
    pub detail: TransferDetail,
}

impl Transfer {
    /// Create a text history entry.
    #[must_use]
    pub fn text(direction: TransferDirection, device: &DeviceInfo, content: String) -> Self {
        Self {
            id: crypto::generate_message_id(),
            timestamp: crate::epoch_ms(),
            direction,
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            detail: TransferDetail::Text { content },
        }
    }

    /// Create a file history entry. Speed is derived from the duration
    /// when it is non-zero.
    #[must_use]
    pub fn file(
        direction: TransferDirection,
        device: &DeviceInfo,
        file_name: String,
        file_size: u64,
        mime_type: String,
        file_path: Option<PathBuf>,
        duration_ms: Option<u64>,
    ) -> Self {
        let speed_bytes_per_sec = duration_ms
            .filter(|ms| *ms > 0)
            .map(|ms| file_size * 1000 / ms);

        Self {
            id: crypto::generate_message_id(),
            timestamp: crate::epoch_ms(),
            direction,
            device_id: device.id.clone(),
            device_name: device.name.clone(),
            detail: TransferDetail::File {
                file_name,
                file_size,
                mime_type,
                file_path,
                duration_ms,
                speed_bytes_per_sec,
            },
        }
    }

    /// The timestamp as a human-readable string.
    #[must_use]
    pub fn formatted_timestamp(&self) -> String {
        use chrono::{DateTime, Utc};
        let secs = i64::try_from(self.timestamp / 1000).unwrap_or(i64::MAX);
        DateTime::<Utc>::from_timestamp(secs, 0).map_or_else(
            || "Unknown".to_string(),
            |dt| dt.format("%Y-%m-%d %H:%M").to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_synonyms() {
        assert_eq!(Platform::parse("desktop"), Some(Platform::Desktop));
        assert_eq!(Platform::parse("macos"), Some(Platform::Desktop));
        assert_eq!(Platform::parse("android"), Some(Platform::Mobile));
        assert_eq!(Platform::parse("toaster"), None);

        let p: Platform = serde_json::from_str("\"android\"").expect("alias");
        assert_eq!(p, Platform::Mobile);
        assert_eq!(serde_json::to_string(&p).unwrap(), "\"mobile\"");
    }

    #[test]
    fn test_device_info_wire_shape() {
        let device = DeviceInfo {
            id: "abc".into(),
            name: "Laptop".into(),
            platform: Platform::Desktop,
            version: "0.3.1".into(),
            host: None,
            port: Some(4242),
        };

        let json = serde_json::to_string(&device).unwrap();
        assert!(json.contains("\"platform\":\"desktop\""));
        assert!(!json.contains("host"), "absent host must be omitted");

        let back: DeviceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, device);
    }

    #[test]
    fn test_paired_device_secret_roundtrip() {
        let device = DeviceInfo::generate("Phone", Platform::Mobile);
        let secret = crypto::derive_shared_secret("pw", "a", "b");

        let paired = PairedDevice::new(device, &secret);
        assert_eq!(paired.secret().expect("decode"), secret);
    }

    #[test]
    fn test_discovered_staleness() {
        let entry = DiscoveredDevice {
            device: DeviceInfo::generate("Peer", Platform::Desktop),
            last_seen: 10_000,
        };
        assert!(!entry.is_stale(10_000 + crate::DISCOVERY_STALE_MS));
        assert!(entry.is_stale(10_001 + crate::DISCOVERY_STALE_MS));
    }

    #[test]
    fn test_file_transfer_speed_derivation() {
        let device = DeviceInfo::generate("Peer", Platform::Desktop);
        let t = Transfer::file(
            TransferDirection::Send,
            &device,
            "movie.mkv".into(),
            10_000_000,
            "video/x-matroska".into(),
            None,
            Some(2_000),
        );

        match t.detail {
            TransferDetail::File {
                speed_bytes_per_sec,
                ..
            } => assert_eq!(speed_bytes_per_sec, Some(5_000_000)),
            TransferDetail::Text { .. } => panic!("expected file detail"),
        }
    }

    #[test]
    fn test_transfer_tagged_serialization() {
        let device = DeviceInfo::generate("Peer", Platform::Desktop);
        let t = Transfer::text(TransferDirection::Receive, &device, "hi".into());

        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"type\":\"text\""));
        assert!(json.contains("\"direction\":\"receive\""));

        let back: Transfer = serde_json::from_str(&json).unwrap();
        assert_eq!(back.detail, TransferDetail::Text { content: "hi".into() });
    }
}
