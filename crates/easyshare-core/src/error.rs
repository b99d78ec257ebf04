//! Error types for EasyShare.
//!
//! A single error enum covers every failure mode in the engine. Each
//! variant belongs to one [`ErrorKind`], which determines its propagation
//! policy: network errors surface on the connection state, protocol errors
//! tear the socket down, auth errors terminate pairing, integrity errors
//! discard received bytes, I/O errors abort only the offending transfer.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for EasyShare operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Propagation category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect refused/reset/timeout; surfaces on the connection state.
    Network,
    /// Wire violation; the socket is torn down.
    Protocol,
    /// Pairing or verification failure; pairing terminates.
    Auth,
    /// Checksum or size mismatch on receive; bytes are discarded.
    Integrity,
    /// File open/read/write failure; aborts the offending transfer only.
    Io,
    /// A policy decision rejected the operation.
    Policy,
}

/// The main error type for EasyShare.
#[derive(Error, Debug)]
pub enum Error {
    /// TCP connect failed after all attempts
    #[error("failed to connect to {host}:{port}: {reason}")]
    ConnectFailed {
        /// Remote host
        host: String,
        /// Remote port
        port: u16,
        /// Underlying cause of the final attempt
        reason: String,
    },

    /// Connection lost mid-operation
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// No peer connection is active
    #[error("not connected to a peer")]
    NotConnected,

    /// A frame exceeded the protocol payload limit
    #[error("frame payload of {0} bytes exceeds the 10 MiB limit")]
    FrameTooLarge(usize),

    /// Malformed message payload
    #[error("invalid protocol message: {0}")]
    InvalidMessage(String),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Pairing was rejected by the remote device
    #[error("pairing rejected: {0}")]
    PairingRejected(String),

    /// Passphrase proof did not verify
    #[error("passphrase mismatch")]
    PassphraseMismatch,

    /// A pairing message arrived in a state that cannot accept it
    #[error("unexpected pairing message in state {0}")]
    PairingState(&'static str),

    /// Data-plane operation attempted without a paired session
    #[error("no shared secret established with the peer")]
    NotPaired,

    /// Authenticated decryption failed
    #[error("decryption failed")]
    DecryptFailed,

    /// Received file failed its checksum check
    #[error("checksum mismatch for '{0}'")]
    ChecksumMismatch(String),

    /// Received file failed its size check
    #[error("size mismatch for '{file}': expected {expected}, got {actual}")]
    SizeMismatch {
        /// File name
        file: String,
        /// Expected byte count
        expected: u64,
        /// Received byte count
        actual: u64,
    },

    /// File transfer was rejected by the receiver
    #[error("transfer rejected: {0}")]
    TransferRejected(String),

    /// The auxiliary HTTP endpoint failed
    #[error("http transfer failed: {0}")]
    HttpTransfer(String),

    /// mDNS registration or browsing failed
    #[error("discovery error: {0}")]
    Discovery(String),

    /// File not found
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the propagation category of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectFailed { .. } | Self::ConnectionLost(_) | Self::NotConnected => {
                ErrorKind::Network
            }
            Self::FrameTooLarge(_)
            | Self::InvalidMessage(_)
            | Self::Serialization(_)
            | Self::Internal(_) => ErrorKind::Protocol,
            Self::PairingRejected(_)
            | Self::PassphraseMismatch
            | Self::PairingState(_)
            | Self::NotPaired
            | Self::DecryptFailed => ErrorKind::Auth,
            Self::ChecksumMismatch(_) | Self::SizeMismatch { .. } => ErrorKind::Integrity,
            Self::FileNotFound(_) | Self::Io(_) | Self::HttpTransfer(_) | Self::Discovery(_) => {
                ErrorKind::Io
            }
            Self::TransferRejected(_) => ErrorKind::Policy,
        }
    }

    /// Whether this error must tear the peer connection down.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Protocol | ErrorKind::Network)
    }
}
