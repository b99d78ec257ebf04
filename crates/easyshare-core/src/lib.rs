//! # EasyShare Core Library
//!
//! `easyshare-core` is the transfer engine of EasyShare, a peer-to-peer
//! local network sharing tool. Two devices on the same LAN discover each
//! other over mDNS, establish a shared secret through a passphrase
//! handshake, and exchange text and files directly.
//!
//! ## Features
//!
//! - **mDNS discovery**: peers advertise and browse `_easyshare._tcp`
//! - **Passphrase pairing**: challenge/response handshake, the passphrase
//!   never crosses the wire
//! - **Adaptive transfers**: chunked frames for small files, single-shot
//!   HTTP endpoints for large ones
//! - **Integrity**: truncated SHA-512 checksums, batch and streaming
//!
//! ## Modules
//!
//! - [`crypto`] - Key derivation, authenticated encryption, checksums
//! - [`protocol`] - Length-prefixed wire codec and message types
//! - [`discovery`] - mDNS advertise/browse surface
//! - [`pairing`] - Passphrase pairing state machine
//! - [`connection`] - Connection manager: socket, keepalive, dispatch
//! - [`transfer`] - Text and file transfer engine
//! - [`storage`] - Storage facade consumed by the core
//! - [`events`] - Typed event surface towards the host
//!
//! ## Example
//!
//! ```rust,ignore
//! use easyshare_core::connection::ConnectionManager;
//!
//! let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
//! let manager = ConnectionManager::new(local_device, storage, events_tx);
//! let port = manager.start_server().await?;
//!
//! manager.connect_to_device(&peer).await?;
//! manager.start_pairing("sunflower".into())?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod connection;
pub mod crypto;
pub mod device;
pub mod discovery;
pub mod error;
pub mod events;
pub mod pairing;
pub mod protocol;
pub mod storage;
pub mod transfer;

pub use error::{Error, ErrorKind, Result};

/// Library version, advertised in the mDNS TXT record.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size of one file chunk carried by a `file_chunk` message.
pub const CHUNK_SIZE: usize = 65_536;

/// Maximum payload of a single wire frame (10 MiB). Frames above this
/// tear the connection down.
pub const MAX_FRAME_PAYLOAD: usize = 10 * 1024 * 1024;

/// Files at or above this size take the HTTP transfer path (5 MiB).
pub const LARGE_FILE_THRESHOLD: u64 = 5 * 1024 * 1024;

/// Iteration count of the passphrase key derivation. Both peers must use
/// the same value or pairing fails. (An older deployment used 100_000.)
pub const KDF_ITERATIONS: u32 = 10_000;

/// Interval between application-level pings.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 5;

/// Silence threshold after which a connection is considered dead.
pub const KEEPALIVE_TIMEOUT_MS: u64 = 120_000;

/// Per-attempt TCP connect timeout.
pub const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Number of TCP connect attempts before giving up.
pub const CONNECT_ATTEMPTS: u32 = 3;

/// An inbound connection may displace the current one only if the current
/// socket has produced no frame for this long.
pub const STALE_SOCKET_MS: u64 = 30_000;

/// Discovered peers older than this are considered stale.
pub const DISCOVERY_STALE_MS: u64 = 30_000;

/// A pairing exchange with no progress for this long is terminal.
pub const PAIRING_TIMEOUT_SECS: u64 = 30;

/// Transfer history keeps this many entries, newest first.
pub const HISTORY_CAP: usize = 100;

/// Write batching granularity on the streaming receive path (512 KiB).
pub const RECEIVE_BUFFER_SIZE: usize = 512 * 1024;

/// Grace window after a send completes during which the keepalive timeout
/// stays suppressed (the receiver may still be flushing to disk).
pub const SEND_GRACE_MS: u64 = 120_000;

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
