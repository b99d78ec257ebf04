//! Wire protocol for EasyShare peer connections.
//!
//! ## Frame Format
//!
//! ```text
//! ┌──────────────────┬──────────────┬─────────────────────┐
//! │  payload length  │  type code   │       payload       │
//! │  4 bytes (BE)    │   1 byte     │  UTF-8 JSON object  │
//! └──────────────────┴──────────────┴─────────────────────┘
//! ```
//!
//! The JSON object carries the authoritative `type` tag; the type-code
//! byte is written for wire observability and ignored on decode. Binary
//! chunk data travels base64-encoded inside the JSON. A frame payload is
//! limited to 10 MiB; larger frames tear the connection down.

use serde::{Deserialize, Serialize};

use crate::device::DeviceInfo;
use crate::error::{Error, Result};
use crate::{crypto, MAX_FRAME_PAYLOAD};

/// Frame header size: 4-byte length plus 1-byte type code.
pub const HEADER_SIZE: usize = 5;

/// Payload of a wire message, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Payload {
    /// Keepalive probe
    Ping,
    /// Keepalive answer; the message id echoes the ping's id
    Pong,
    /// Pairing: initiator introduces itself
    #[serde(rename_all = "camelCase")]
    PairRequest {
        /// Initiator identity
        device_info: DeviceInfo,
    },
    /// Pairing: responder issues a random challenge
    #[serde(rename_all = "camelCase")]
    PairChallenge {
        /// 32 random bytes, base64
        challenge: String,
        /// Responder clock at issue time, epoch-ms
        timestamp: u64,
    },
    /// Pairing: initiator proves possession of the derived secret
    #[serde(rename_all = "camelCase")]
    PairResponse {
        /// Truncated hash proof, base64
        response: String,
        /// Initiator identity (repeated for crossed-request resolution)
        device_info: DeviceInfo,
    },
    /// Pairing: responder confirms the proof
    #[serde(rename_all = "camelCase")]
    PairConfirm {
        /// Responder identity
        device_info: DeviceInfo,
    },
    /// Pairing: responder rejects
    PairReject {
        /// Human-readable reason
        reason: String,
    },
    /// A text message
    Text {
        /// Body; sealed and base64 when a session secret exists
        content: String,
    },
    /// Offer of a file
    #[serde(rename_all = "camelCase")]
    FileRequest {
        /// File name
        file_name: String,
        /// Size in bytes
        file_size: u64,
        /// MIME type
        mime_type: String,
        /// Truncated digest (base64) or the literal `size:<N>` tag
        checksum: String,
        /// Download endpoint for the desktop large path
        #[serde(skip_serializing_if = "Option::is_none", default)]
        http_url: Option<String>,
    },
    /// Acceptance of a file offer
    #[serde(rename_all = "camelCase")]
    FileAccept {
        /// Id of the `file_request` message
        request_id: String,
        /// Upload endpoint when the receiver serves the HTTP path
        #[serde(skip_serializing_if = "Option::is_none", default)]
        upload_url: Option<String>,
    },
    /// Rejection of a file offer
    #[serde(rename_all = "camelCase")]
    FileReject {
        /// Id of the `file_request` message
        request_id: String,
        /// Human-readable reason
        reason: String,
    },
    /// One slice of file content
    #[serde(rename_all = "camelCase")]
    FileChunk {
        /// Id of the `file_request` message
        request_id: String,
        /// Zero-based chunk index
        chunk_index: u32,
        /// Total chunk count for the file
        total_chunks: u32,
        /// Chunk bytes, base64 (sealed first when a secret exists)
        data: String,
    },
    /// End of chunked content
    #[serde(rename_all = "camelCase")]
    FileComplete {
        /// Id of the `file_request` message
        request_id: String,
        /// Whole-file digest for verification
        checksum: String,
    },
    /// Terminal acknowledgement of a file transfer
    #[serde(rename_all = "camelCase")]
    FileAck {
        /// Id of the `file_request` message
        request_id: String,
        /// Whether the receiver verified and saved the file
        success: bool,
    },
    /// Peer-reported error
    #[serde(rename_all = "camelCase")]
    Error {
        /// Machine-readable code
        code: String,
        /// Human-readable description
        message: String,
        /// Message id this error responds to
        #[serde(skip_serializing_if = "Option::is_none", default)]
        original_message_id: Option<String>,
    },
}

impl Payload {
    /// The informational type-code byte written into the frame header.
    #[must_use]
    pub const fn type_code(&self) -> u8 {
        match self {
            Self::Ping => 0x01,
            Self::Pong => 0x02,
            Self::PairRequest { .. } => 0x10,
            Self::PairChallenge { .. } => 0x11,
            Self::PairResponse { .. } => 0x12,
            Self::PairConfirm { .. } => 0x13,
            Self::PairReject { .. } => 0x14,
            Self::Text { .. } => 0x20,
            Self::FileRequest { .. } => 0x30,
            Self::FileAccept { .. } => 0x31,
            Self::FileReject { .. } => 0x32,
            Self::FileChunk { .. } => 0x33,
            Self::FileComplete { .. } => 0x34,
            Self::FileAck { .. } => 0x35,
            Self::Error { .. } => 0xFF,
        }
    }
}

/// A wire message: id, timestamp and tagged payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// 8 random bytes, URL-safe base64
    pub id: String,
    /// Sender clock, epoch-ms
    pub timestamp: u64,
    /// Tagged payload
    #[serde(flatten)]
    pub payload: Payload,
}

impl Message {
    /// Wrap a payload with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(payload: Payload) -> Self {
        Self {
            id: crypto::generate_message_id(),
            timestamp: crate::epoch_ms(),
            payload,
        }
    }

    /// Build the pong answering a ping, echoing its id.
    #[must_use]
    pub fn pong_for(ping_id: &str) -> Self {
        Self {
            id: ping_id.to_string(),
            timestamp: crate::epoch_ms(),
            payload: Payload::Pong,
        }
    }
}

/// Encode a message into a complete wire frame.
///
/// # Errors
///
/// Returns an error if serialization fails or the payload exceeds the
/// frame limit.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(message).map_err(|e| Error::Serialization(e.to_string()))?;

    if json.len() > MAX_FRAME_PAYLOAD {
        return Err(Error::FrameTooLarge(json.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + json.len());
    frame.extend_from_slice(&(json.len() as u32).to_be_bytes());
    frame.push(message.payload.type_code());
    frame.extend_from_slice(&json);
    Ok(frame)
}

/// Incremental frame parser.
///
/// Bytes arrive from the socket in arbitrary slices; the buffer extracts
/// the longest possible prefix of whole frames on demand and keeps the
/// tail for the next append.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    buf: Vec<u8>,
}

impl MessageBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a received byte slice.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently waiting for a complete frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Extract every complete frame currently buffered.
    ///
    /// Messages of a recognized type are returned in arrival order. A
    /// well-formed JSON object of an unrecognized type is skipped
    /// (forward compatibility).
    ///
    /// # Errors
    ///
    /// Returns an error on an oversized frame declaration or a payload
    /// that is not valid JSON; the caller must tear the connection down.
    pub fn extract(&mut self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();

        loop {
            if self.buf.len() < HEADER_SIZE {
                break;
            }

            let declared =
                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if declared > MAX_FRAME_PAYLOAD {
                return Err(Error::FrameTooLarge(declared));
            }

            if self.buf.len() < HEADER_SIZE + declared {
                break;
            }

            let payload = &self.buf[HEADER_SIZE..HEADER_SIZE + declared];
            match serde_json::from_slice::<Message>(payload) {
                Ok(message) => messages.push(message),
                Err(_) => {
                    // Distinguish an unknown-but-valid message from wire
                    // corruption: only the former is skippable.
                    if serde_json::from_slice::<serde_json::Value>(payload)
                        .map(|v| v.is_object())
                        .unwrap_or(false)
                    {
                        tracing::debug!("skipping frame with unrecognized message type");
                    } else {
                        return Err(Error::InvalidMessage(
                            "frame payload is not a JSON object".to_string(),
                        ));
                    }
                }
            }

            self.buf.drain(..HEADER_SIZE + declared);
        }

        Ok(messages)
    }
}
