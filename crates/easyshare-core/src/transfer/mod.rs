//! File and text transfer engine.
//!
//! The engine runs inside the connection dispatch task and owns the
//! per-connection transfer state: at most one outbound file
//! ([`PendingSend`]) and one inbound file ([`PendingReceive`]) at a time,
//! each a tagged variant for the mode in flight.
//!
//! Mode selection:
//! - files under 5 MiB travel as base64 chunks inside wire frames
//! - larger files sent from a desktop are served over a single-shot
//!   `GET /transfer/<token>` endpoint the receiver downloads from
//! - larger files sent from a mobile device are uploaded to a single-shot
//!   `POST /upload/<token>` endpoint the receiver provides; if the
//!   receiver cannot bind one, the sender falls back to streaming chunks
//!
//! Received bytes never become a history entry until the verifier
//! (checksum, or byte count for `size:` tags) passes.

pub(crate) mod http;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use crate::crypto::{self, StreamingChecksum, SECRET_SIZE};
use crate::device::{DeviceInfo, Platform, Transfer, TransferDirection};
use crate::error::{Error, Result};
use crate::events::{emit, Event, EventSender};
use crate::protocol::{Message, Payload};
use crate::storage::Storage;
use crate::{CHUNK_SIZE, LARGE_FILE_THRESHOLD, RECEIVE_BUFFER_SIZE};

/// Prefix of the synthetic checksum used when a digest would be
/// prohibitive to compute.
pub const SIZE_CHECKSUM_PREFIX: &str = "size:";

/// Progress of the transfer currently in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    /// Direction of the transfer
    pub direction: TransferDirection,
    /// File name (empty for text)
    pub file_name: String,
    /// Bytes moved so far
    pub bytes_transferred: u64,
    /// Total bytes expected
    pub total_bytes: u64,
}

impl TransferProgress {
    /// Progress as a percentage (0.0 - 100.0).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// Number of chunks a file of `size` bytes splits into.
#[must_use]
pub fn total_chunks(size: u64) -> u32 {
    size.div_ceil(CHUNK_SIZE as u64) as u32
}

/// Check received data against the checksum announced by the sender:
/// either a truncated digest or a `size:<N>` byte-count tag.
#[must_use]
pub fn verify_expected(expected: &str, digest: &str, byte_count: u64) -> bool {
    expected.strip_prefix(SIZE_CHECKSUM_PREFIX).map_or_else(
        || crypto::constant_time_eq(expected.as_bytes(), digest.as_bytes()),
        |tag| tag.parse::<u64>().is_ok_and(|n| n == byte_count),
    )
}

/// Encode chunk bytes for the wire: sealed with the session secret when
/// one exists, base64 either way.
fn encode_chunk_data(data: &[u8], secret: Option<&[u8; SECRET_SIZE]>) -> Result<String> {
    match secret {
        Some(secret) => Ok(BASE64_STANDARD.encode(crypto::seal(data, secret)?)),
        None => Ok(BASE64_STANDARD.encode(data)),
    }
}

/// Decode chunk bytes from the wire. A sealed payload that fails to open
/// falls back to the raw decoded bytes; the file checksum is the
/// authoritative integrity gate.
fn decode_chunk_data(data: &str, secret: Option<&[u8; SECRET_SIZE]>) -> Result<Vec<u8>> {
    let raw = BASE64_STANDARD
        .decode(data)
        .map_err(|e| Error::InvalidMessage(format!("chunk data is not base64: {e}")))?;

    if let Some(secret) = secret {
        if let Ok(plain) = crypto::open(&raw, secret) {
            return Ok(plain);
        }
    }
    Ok(raw)
}

/// Temporary file path used while an inbound file is being assembled.
fn temp_path(dir: &Path) -> PathBuf {
    dir.join(format!(".easyshare_tmp_{}", crate::epoch_ms()))
}

/// First non-existing variant of `dir/name`, appending ` (n)` before the
/// extension when needed.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("received");
    let ext = path.extension().and_then(|s| s.to_str());

    for n in 1u32.. {
        let next = match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        };
        if !next.exists() {
            return next;
        }
    }
    unreachable!()
}

/// Completion report from an HTTP subtask, delivered back into the
/// dispatch task before any engine state changes.
#[derive(Debug)]
pub(crate) enum TransferOutcome {
    /// A `GET` download of the sender's endpoint finished
    HttpDownloadDone {
        /// The `file_request` id
        request_id: String,
        /// Temp file holding the body
        temp_path: PathBuf,
        /// Bytes received, or the failure
        result: Result<u64>,
    },
    /// Our `POST /upload` endpoint received (and verified) a body
    HttpUploadReceived {
        /// The `file_request` id
        request_id: String,
        /// Temp file holding the body
        temp_path: PathBuf,
        /// Whether verification passed
        success: bool,
    },
    /// Our multipart upload to the receiver's endpoint finished
    HttpUploadPushed {
        /// The `file_request` id
        request_id: String,
        /// Upload result
        result: Result<()>,
    },
}

/// Outbound file in flight.
struct PendingSend {
    request_id: String,
    file_name: String,
    file_size: u64,
    mime_type: String,
    checksum: String,
    reply: Option<oneshot::Sender<bool>>,
    started: Instant,
    mode: SendMode,
}

enum SendMode {
    /// Whole file in memory, sent as chunks on accept
    Small { data: Vec<u8> },
    /// Desktop large path: we serve `GET /transfer/<token>`
    LargeHttp { server: http::HttpServerHandle },
    /// Mobile large path: upload to the receiver's endpoint on accept,
    /// or stream chunks from disk if it provides none
    LargeMobile { path: PathBuf },
}

/// Inbound file in flight.
struct PendingReceive {
    request_id: String,
    file_name: String,
    file_size: u64,
    mime_type: String,
    expected_checksum: String,
    started: Instant,
    mode: ReceiveMode,
}

enum ReceiveMode {
    /// Chunks collected in memory, reassembled on `file_complete`
    Small { chunks: HashMap<u32, Vec<u8>> },
    /// Chunk fallback for large files: streamed to a temp file with an
    /// incremental digest
    StreamingChunk {
        file: tokio::fs::File,
        hasher: StreamingChecksum,
        temp_path: PathBuf,
        buffer: Vec<u8>,
        bytes_written: u64,
    },
    /// We are downloading the sender's `GET` endpoint
    HttpDownload,
    /// We serve `POST /upload/<token>` and wait for the body
    HttpUpload { server: http::HttpServerHandle },
}

/// Per-connection transfer engine. All methods run on the connection
/// dispatch task.
pub(crate) struct TransferEngine {
    local: DeviceInfo,
    storage: Arc<dyn Storage>,
    events: EventSender,
    writer: mpsc::Sender<Message>,
    outcomes: mpsc::UnboundedSender<TransferOutcome>,
    remote: Option<DeviceInfo>,
    secret: Option<[u8; SECRET_SIZE]>,
    send: Option<PendingSend>,
    receive: Option<PendingReceive>,
    grace_until: Option<Instant>,
}

impl TransferEngine {
    pub(crate) fn new(
        local: DeviceInfo,
        storage: Arc<dyn Storage>,
        events: EventSender,
        writer: mpsc::Sender<Message>,
        outcomes: mpsc::UnboundedSender<TransferOutcome>,
    ) -> Self {
        Self {
            local,
            storage,
            events,
            writer,
            outcomes,
            remote: None,
            secret: None,
            send: None,
            receive: None,
            grace_until: None,
        }
    }

    /// The peer identity, once known.
    pub(crate) fn remote(&self) -> Option<&DeviceInfo> {
        self.remote.as_ref()
    }

    /// Record the peer identity (from connect target or pairing).
    pub(crate) fn set_remote(&mut self, remote: DeviceInfo) {
        self.remote = Some(remote);
    }

    /// Install the session secret (pairing success or stored credential).
    pub(crate) fn set_secret(&mut self, secret: [u8; SECRET_SIZE]) {
        self.secret = Some(secret);
    }

    /// Whether a transfer is in flight (including the post-send grace
    /// window), which suppresses the keepalive timeout.
    pub(crate) fn is_active(&self) -> bool {
        self.send.is_some()
            || self.receive.is_some()
            || self.grace_until.is_some_and(|until| Instant::now() < until)
    }

    fn remote_or_unknown(&self) -> DeviceInfo {
        self.remote.clone().unwrap_or_else(|| DeviceInfo {
            id: "unknown".to_string(),
            name: "Unknown Device".to_string(),
            platform: Platform::Desktop,
            version: "unknown".to_string(),
            host: None,
            port: None,
        })
    }

    async fn write(&self, message: Message) {
        // A gone socket is a broken pipe; the writer task logs it.
        let _ = self.writer.send(message).await;
    }

    fn progress(&self, direction: TransferDirection, file_name: &str, done: u64, total: u64) {
        emit(
            &self.events,
            Event::TransferProgress(Some(TransferProgress {
                direction,
                file_name: file_name.to_string(),
                bytes_transferred: done,
                total_bytes: total,
            })),
        );
    }

    fn clear_progress(&self) {
        emit(&self.events, Event::TransferProgress(None));
    }

    fn record(&self, transfer: Transfer) {
        self.storage.add_transfer(transfer.clone());
        emit(&self.events, Event::TransferComplete(transfer));
    }

    // ------------------------------------------------------------------
    // Text
    // ------------------------------------------------------------------

    /// Send a text message and record it immediately (no acknowledgement
    /// on the text plane).
    pub(crate) async fn send_text(&mut self, content: String) -> Result<()> {
        let wire_content = match &self.secret {
            Some(secret) => BASE64_STANDARD.encode(crypto::seal(content.as_bytes(), secret)?),
            None => content.clone(),
        };

        self.write(Message::new(Payload::Text {
            content: wire_content,
        }))
        .await;

        let remote = self.remote_or_unknown();
        self.record(Transfer::text(TransferDirection::Send, &remote, content));
        Ok(())
    }

    fn handle_text(&mut self, content: &str) {
        let decoded = match &self.secret {
            Some(secret) => open_text(content, secret),
            None => self.adopt_identity_from_text(content),
        }
        .unwrap_or_else(|| content.to_string());

        let remote = self.remote_or_unknown();
        emit(
            &self.events,
            Event::TextReceived {
                content: decoded.clone(),
                from: remote.clone(),
            },
        );
        self.record(Transfer::text(TransferDirection::Receive, &remote, decoded));
    }

    /// Without a session secret, try every stored credential against the
    /// sealed content; an authenticated open identifies the peer.
    fn adopt_identity_from_text(&mut self, content: &str) -> Option<String> {
        let sealed = BASE64_STANDARD.decode(content).ok()?;
        let plain = self.try_adopt(&sealed)?;
        String::from_utf8(plain).ok()
    }

    /// Trial-open a sealed payload against all stored credentials; the
    /// first authenticated open adopts that device identity.
    fn try_adopt(&mut self, sealed: &[u8]) -> Option<Vec<u8>> {
        for paired in self.storage.get_paired_devices() {
            let Ok(secret) = paired.secret() else {
                continue;
            };
            if let Ok(plain) = crypto::open(sealed, &secret) {
                tracing::debug!(device = %paired.device.name, "peer identified by credential");
                self.remote = Some(paired.device.clone());
                self.secret = Some(secret);
                return Some(plain);
            }
        }
        None
    }

    /// Decode inbound chunk bytes, adopting a peer identity on the way
    /// when a stored credential opens them.
    fn decode_incoming_chunk(&mut self, data: &str) -> Result<Vec<u8>> {
        if self.secret.is_some() {
            return decode_chunk_data(data, self.secret.as_ref());
        }

        let raw = BASE64_STANDARD
            .decode(data)
            .map_err(|e| Error::InvalidMessage(format!("chunk data is not base64: {e}")))?;
        if let Some(plain) = self.try_adopt(&raw) {
            return Ok(plain);
        }
        Ok(raw)
    }

    // ------------------------------------------------------------------
    // Send side
    // ------------------------------------------------------------------

    /// Offer a file to the peer. The returned future is resolved through
    /// `reply` once the transfer reaches a terminal state.
    pub(crate) async fn send_file(&mut self, path: PathBuf, reply: oneshot::Sender<bool>) {
        if self.send.is_some() {
            tracing::warn!("a file send is already in flight");
            let _ = reply.send(false);
            return;
        }

        match self.prepare_send(path, reply).await {
            Ok(()) => {}
            Err((e, reply)) => {
                tracing::warn!("file send failed to start: {e}");
                self.clear_progress();
                let _ = reply.send(false);
            }
        }
    }

    async fn prepare_send(
        &mut self,
        path: PathBuf,
        reply: oneshot::Sender<bool>,
    ) -> std::result::Result<(), (Error, oneshot::Sender<bool>)> {
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) => return Err((Error::Io(e), reply)),
        };
        let file_size = meta.len();
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let mime_type = mime_guess::from_path(&path)
            .first()
            .map_or_else(|| "application/octet-stream".to_string(), |m| m.to_string());

        let request = if file_size < LARGE_FILE_THRESHOLD {
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) => return Err((Error::Io(e), reply)),
            };
            let checksum = crypto::checksum(&data);

            let message = Message::new(Payload::FileRequest {
                file_name: file_name.clone(),
                file_size,
                mime_type: mime_type.clone(),
                checksum: checksum.clone(),
                http_url: None,
            });
            self.send = Some(PendingSend {
                request_id: message.id.clone(),
                file_name,
                file_size,
                mime_type,
                checksum,
                reply: Some(reply),
                started: Instant::now(),
                mode: SendMode::Small { data },
            });
            message
        } else if self.local.platform == Platform::Desktop {
            let checksum = match stream_file_checksum(&path).await {
                Ok(checksum) => checksum,
                Err(e) => return Err((e, reply)),
            };

            let message_id = crypto::generate_message_id();
            let server = match http::serve_download(
                path.clone(),
                file_name.clone(),
                file_size,
                self.events.clone(),
            )
            .await
            {
                Ok(server) => server,
                Err(e) => return Err((e, reply)),
            };

            let message = Message {
                id: message_id.clone(),
                timestamp: crate::epoch_ms(),
                payload: Payload::FileRequest {
                    file_name: file_name.clone(),
                    file_size,
                    mime_type: mime_type.clone(),
                    checksum: checksum.clone(),
                    http_url: Some(server.url.clone()),
                },
            };
            self.send = Some(PendingSend {
                request_id: message_id,
                file_name,
                file_size,
                mime_type,
                checksum,
                reply: Some(reply),
                started: Instant::now(),
                mode: SendMode::LargeHttp { server },
            });
            message
        } else {
            // Mobile sender: a full digest is prohibitive through the
            // platform bridge, announce the byte count instead.
            let checksum = format!("{SIZE_CHECKSUM_PREFIX}{file_size}");
            let message = Message::new(Payload::FileRequest {
                file_name: file_name.clone(),
                file_size,
                mime_type: mime_type.clone(),
                checksum: checksum.clone(),
                http_url: None,
            });
            self.send = Some(PendingSend {
                request_id: message.id.clone(),
                file_name,
                file_size,
                mime_type,
                checksum,
                reply: Some(reply),
                started: Instant::now(),
                mode: SendMode::LargeMobile { path },
            });
            message
        };

        self.write(request).await;
        Ok(())
    }

    async fn handle_accept(&mut self, request_id: &str, upload_url: Option<String>) {
        enum Accepted {
            StreamSmall(Vec<u8>),
            AwaitAck,
            Upload {
                path: PathBuf,
                url: String,
                request_id: String,
                file_name: String,
                file_size: u64,
                mime_type: String,
            },
            StreamDisk(PathBuf),
        }

        let action = {
            let Some(pending) = self.send.as_mut() else {
                tracing::debug!("file_accept with no send in flight");
                return;
            };
            if pending.request_id != request_id {
                tracing::debug!("file_accept for an unknown request, ignoring");
                return;
            }

            match &mut pending.mode {
                SendMode::Small { data } => Accepted::StreamSmall(std::mem::take(data)),
                // The receiver downloads from our endpoint; nothing to do
                // until file_ack.
                SendMode::LargeHttp { .. } => Accepted::AwaitAck,
                SendMode::LargeMobile { path } => match upload_url {
                    Some(url) => Accepted::Upload {
                        path: path.clone(),
                        url,
                        request_id: pending.request_id.clone(),
                        file_name: pending.file_name.clone(),
                        file_size: pending.file_size,
                        mime_type: pending.mime_type.clone(),
                    },
                    // The receiver could not provide an endpoint; stream
                    // chunks straight from disk.
                    None => Accepted::StreamDisk(path.clone()),
                },
            }
        };

        match action {
            Accepted::StreamSmall(data) => self.stream_chunks(data).await,
            Accepted::AwaitAck => {}
            Accepted::Upload {
                path,
                url,
                request_id,
                file_name,
                file_size,
                mime_type,
            } => {
                let events = self.events.clone();
                let outcomes = self.outcomes.clone();
                tokio::spawn(async move {
                    let result =
                        http::upload(&url, &path, &file_name, file_size, &mime_type, events).await;
                    let _ = outcomes.send(TransferOutcome::HttpUploadPushed { request_id, result });
                });
            }
            Accepted::StreamDisk(path) => self.stream_chunks_from_disk(path).await,
        }
    }

    /// Send an in-memory file as chunks, then `file_complete`, then
    /// finalize optimistically (chunk mode carries no acknowledgement).
    async fn stream_chunks(&mut self, data: Vec<u8>) {
        let Some(pending) = self.send.as_ref() else {
            return;
        };
        let request_id = pending.request_id.clone();
        let file_name = pending.file_name.clone();
        let file_size = pending.file_size;
        let checksum = pending.checksum.clone();

        let chunks = total_chunks(file_size);
        for (index, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
            let encoded = match encode_chunk_data(chunk, self.secret.as_ref()) {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::warn!("chunk encode failed: {e}");
                    self.finish_send(false);
                    return;
                }
            };
            // Bounded writer channel: awaiting here is the backpressure.
            self.write(Message::new(Payload::FileChunk {
                request_id: request_id.clone(),
                chunk_index: index as u32,
                total_chunks: chunks,
                data: encoded,
            }))
            .await;

            let sent = ((index + 1) * CHUNK_SIZE) as u64;
            self.progress(
                TransferDirection::Send,
                &file_name,
                sent.min(file_size),
                file_size,
            );
        }

        self.write(Message::new(Payload::FileComplete {
            request_id,
            checksum,
        }))
        .await;
        self.finish_send(true);
    }

    /// Chunk fallback for a large mobile send: read and emit chunks
    /// without holding the file in memory, pacing disk reads.
    async fn stream_chunks_from_disk(&mut self, path: PathBuf) {
        use tokio::io::AsyncReadExt;

        let Some(pending) = self.send.as_ref() else {
            return;
        };
        let request_id = pending.request_id.clone();
        let file_name = pending.file_name.clone();
        let file_size = pending.file_size;
        let checksum = pending.checksum.clone();

        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("cannot open {}: {e}", path.display());
                self.finish_send(false);
                return;
            }
        };

        let chunks = total_chunks(file_size);
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut index: u32 = 0;
        let mut sent: u64 = 0;

        loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("read error on {}: {e}", path.display());
                    self.finish_send(false);
                    return;
                }
            };

            let encoded = match encode_chunk_data(&buf[..n], self.secret.as_ref()) {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::warn!("chunk encode failed: {e}");
                    self.finish_send(false);
                    return;
                }
            };
            self.write(Message::new(Payload::FileChunk {
                request_id: request_id.clone(),
                chunk_index: index,
                total_chunks: chunks,
                data: encoded,
            }))
            .await;

            index += 1;
            sent += n as u64;
            self.progress(TransferDirection::Send, &file_name, sent, file_size);

            // Yield every 512 KiB so bridged runtimes keep breathing.
            if index % ((RECEIVE_BUFFER_SIZE / CHUNK_SIZE) as u32) == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }

        self.write(Message::new(Payload::FileComplete {
            request_id,
            checksum,
        }))
        .await;
        self.finish_send(true);
    }

    /// Terminal bookkeeping for the outbound file.
    fn finish_send(&mut self, success: bool) {
        let Some(mut pending) = self.send.take() else {
            return;
        };

        if let SendMode::LargeHttp { server } = pending.mode {
            server.shutdown();
        }

        if success {
            let remote = self.remote_or_unknown();
            let duration_ms = pending.started.elapsed().as_millis() as u64;
            self.record(Transfer::file(
                TransferDirection::Send,
                &remote,
                pending.file_name.clone(),
                pending.file_size,
                pending.mime_type.clone(),
                None,
                Some(duration_ms),
            ));
        }

        if let Some(reply) = pending.reply.take() {
            let _ = reply.send(success);
        }
        self.clear_progress();
        // The receiver may still be flushing to disk; keep the keepalive
        // timeout suppressed for a while.
        self.grace_until =
            Some(Instant::now() + std::time::Duration::from_millis(crate::SEND_GRACE_MS));
    }

    // ------------------------------------------------------------------
    // Receive side
    // ------------------------------------------------------------------

    /// Policy decision for an incoming offer. Paired devices pass the
    /// `auto_accept_from_paired` gate; everything else falls through to
    /// the current accept-all default.
    fn should_accept(&self) -> bool {
        let settings = self.storage.get_settings();
        let paired = self.remote.as_ref().is_some_and(|remote| {
            self.storage
                .get_paired_devices()
                .iter()
                .any(|p| p.device.id == remote.id)
        });

        if paired && settings.auto_accept_from_paired {
            return true;
        }
        // Accept-all is the current product policy for everyone else.
        true
    }

    async fn handle_request(
        &mut self,
        request_id: String,
        file_name: String,
        file_size: u64,
        mime_type: String,
        checksum: String,
        http_url: Option<String>,
    ) {
        if self.receive.is_some() {
            tracing::warn!("a file receive is already in flight, rejecting offer");
            self.write(Message::new(Payload::FileReject {
                request_id,
                reason: "Another transfer is in progress".to_string(),
            }))
            .await;
            return;
        }
        if !self.should_accept() {
            self.write(Message::new(Payload::FileReject {
                request_id,
                reason: "Receiver declined the transfer".to_string(),
            }))
            .await;
            return;
        }

        let save_dir = self.storage.get_settings().save_directory;

        if let Some(http_url) = http_url {
            // Sender serves the file; download it.
            self.receive = Some(PendingReceive {
                request_id: request_id.clone(),
                file_name: file_name.clone(),
                file_size,
                mime_type,
                expected_checksum: checksum,
                started: Instant::now(),
                mode: ReceiveMode::HttpDownload,
            });
            self.write(Message::new(Payload::FileAccept {
                request_id: request_id.clone(),
                upload_url: None,
            }))
            .await;

            let temp = temp_path(&save_dir);
            let events = self.events.clone();
            let outcomes = self.outcomes.clone();
            tokio::spawn(async move {
                let result =
                    http::download(&http_url, &temp, &file_name, file_size, events).await;
                let report = outcomes.send(TransferOutcome::HttpDownloadDone {
                    request_id,
                    temp_path: temp.clone(),
                    result,
                });
                if report.is_err() {
                    // The connection died while we were downloading.
                    let _ = tokio::fs::remove_file(&temp).await;
                }
            });
        } else if file_size < LARGE_FILE_THRESHOLD {
            self.receive = Some(PendingReceive {
                request_id: request_id.clone(),
                file_name,
                file_size,
                mime_type,
                expected_checksum: checksum,
                started: Instant::now(),
                mode: ReceiveMode::Small {
                    chunks: HashMap::new(),
                },
            });
            self.write(Message::new(Payload::FileAccept {
                request_id,
                upload_url: None,
            }))
            .await;
        } else {
            // Large inbound file: provide an upload endpoint, or fall
            // back to streaming chunks if we cannot bind one.
            let temp = temp_path(&save_dir);
            match http::serve_upload(
                request_id.clone(),
                checksum.clone(),
                file_name.clone(),
                file_size,
                temp.clone(),
                self.events.clone(),
                self.outcomes.clone(),
            )
            .await
            {
                Ok(server) => {
                    let upload_url = server.url.clone();
                    self.receive = Some(PendingReceive {
                        request_id: request_id.clone(),
                        file_name,
                        file_size,
                        mime_type,
                        expected_checksum: checksum,
                        started: Instant::now(),
                        mode: ReceiveMode::HttpUpload { server },
                    });
                    self.write(Message::new(Payload::FileAccept {
                        request_id,
                        upload_url: Some(upload_url),
                    }))
                    .await;
                }
                Err(e) => {
                    tracing::warn!("upload endpoint unavailable ({e}), using chunk fallback");
                    let file = match tokio::fs::File::create(&temp).await {
                        Ok(file) => file,
                        Err(e) => {
                            tracing::warn!("cannot create temp file: {e}");
                            self.write(Message::new(Payload::FileReject {
                                request_id,
                                reason: "Receiver cannot store the file".to_string(),
                            }))
                            .await;
                            return;
                        }
                    };
                    self.receive = Some(PendingReceive {
                        request_id: request_id.clone(),
                        file_name,
                        file_size,
                        mime_type,
                        expected_checksum: checksum,
                        started: Instant::now(),
                        mode: ReceiveMode::StreamingChunk {
                            file,
                            hasher: StreamingChecksum::new(),
                            temp_path: temp,
                            buffer: Vec::with_capacity(RECEIVE_BUFFER_SIZE),
                            bytes_written: 0,
                        },
                    });
                    self.write(Message::new(Payload::FileAccept {
                        request_id,
                        upload_url: None,
                    }))
                    .await;
                }
            }
        }
    }

    async fn handle_chunk(&mut self, request_id: &str, chunk_index: u32, data: &str) {
        let bytes = match self.decode_incoming_chunk(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("undecodable chunk: {e}");
                return;
            }
        };

        enum ChunkOutcome {
            Progress(u64),
            WriteFailed,
            Ignored,
        }

        let (outcome, file_name, file_size) = {
            let Some(pending) = self.receive.as_mut() else {
                tracing::debug!("file_chunk with no receive in flight");
                return;
            };
            if pending.request_id != request_id {
                return;
            }
            let (file_name, file_size) = (pending.file_name.clone(), pending.file_size);

            let outcome = match &mut pending.mode {
                ReceiveMode::Small { chunks } => {
                    chunks.insert(chunk_index, bytes);
                    let received = (chunks.len() * CHUNK_SIZE) as u64;
                    ChunkOutcome::Progress(received.min(file_size))
                }
                ReceiveMode::StreamingChunk {
                    file,
                    hasher,
                    buffer,
                    bytes_written,
                    ..
                } => {
                    hasher.update(&bytes);
                    buffer.extend_from_slice(&bytes);
                    *bytes_written += bytes.len() as u64;

                    // Flush in 512 KiB batches to amortize I/O crossings.
                    let mut failed = false;
                    if buffer.len() >= RECEIVE_BUFFER_SIZE {
                        let batch = std::mem::take(buffer);
                        if let Err(e) = file.write_all(&batch).await {
                            tracing::warn!("temp write failed: {e}");
                            failed = true;
                        }
                    }
                    if failed {
                        ChunkOutcome::WriteFailed
                    } else {
                        ChunkOutcome::Progress(*bytes_written)
                    }
                }
                ReceiveMode::HttpDownload | ReceiveMode::HttpUpload { .. } => {
                    tracing::debug!("unexpected file_chunk on an HTTP-mode receive");
                    ChunkOutcome::Ignored
                }
            };
            (outcome, file_name, file_size)
        };

        match outcome {
            ChunkOutcome::Progress(done) => {
                self.progress(TransferDirection::Receive, &file_name, done, file_size);
            }
            ChunkOutcome::WriteFailed => self.abort_receive().await,
            ChunkOutcome::Ignored => {}
        }
    }

    async fn handle_complete(&mut self, request_id: &str, checksum: &str) {
        {
            let Some(pending) = self.receive.as_ref() else {
                return;
            };
            if pending.request_id != request_id {
                return;
            }
            // file_complete is not part of the HTTP modes.
            if matches!(
                pending.mode,
                ReceiveMode::HttpDownload | ReceiveMode::HttpUpload { .. }
            ) {
                tracing::debug!("unexpected file_complete on an HTTP-mode receive");
                return;
            }
        }
        let pending = self.receive.take().expect("checked above");
        let save_dir = self.storage.get_settings().save_directory;

        match pending.mode {
            ReceiveMode::Small { chunks } => {
                let mut indices: Vec<u32> = chunks.keys().copied().collect();
                indices.sort_unstable();

                let mut data = Vec::with_capacity(pending.file_size as usize);
                for index in indices {
                    data.extend_from_slice(&chunks[&index]);
                }

                let digest = crypto::checksum(&data);
                if !verify_expected(checksum, &digest, data.len() as u64) {
                    tracing::warn!(file = %pending.file_name, "checksum mismatch, dropping file");
                    self.clear_progress();
                    return;
                }

                let path = unique_path(&save_dir, &pending.file_name);
                if let Err(e) = tokio::fs::write(&path, &data).await {
                    tracing::warn!("cannot save {}: {e}", path.display());
                    self.clear_progress();
                    return;
                }
                self.finish_receive(&pending.file_name, pending.file_size, &pending.mime_type, path, pending.started);
            }
            ReceiveMode::StreamingChunk {
                mut file,
                hasher,
                temp_path,
                buffer,
                bytes_written,
            } => {
                let flushed = async {
                    if !buffer.is_empty() {
                        file.write_all(&buffer).await?;
                    }
                    file.flush().await?;
                    drop(file);
                    Ok::<(), std::io::Error>(())
                }
                .await;

                let digest = hasher.digest();
                let ok = flushed.is_ok()
                    && verify_expected(&pending.expected_checksum, &digest, bytes_written)
                    && verify_expected(checksum, &digest, bytes_written);

                if ok {
                    let path = unique_path(&save_dir, &pending.file_name);
                    if tokio::fs::rename(&temp_path, &path).await.is_ok() {
                        self.finish_receive(
                            &pending.file_name,
                            pending.file_size,
                            &pending.mime_type,
                            path,
                            pending.started,
                        );
                        return;
                    }
                }
                tracing::warn!(file = %pending.file_name, "streamed receive failed verification");
                let _ = tokio::fs::remove_file(&temp_path).await;
                self.clear_progress();
            }
            ReceiveMode::HttpDownload | ReceiveMode::HttpUpload { .. } => {
                unreachable!("filtered above");
            }
        }
    }

    fn finish_receive(
        &mut self,
        file_name: &str,
        file_size: u64,
        mime_type: &str,
        path: PathBuf,
        started: Instant,
    ) {
        let remote = self.remote_or_unknown();
        let duration_ms = started.elapsed().as_millis() as u64;
        self.record(Transfer::file(
            TransferDirection::Receive,
            &remote,
            file_name.to_string(),
            file_size,
            mime_type.to_string(),
            Some(path),
            Some(duration_ms),
        ));
        self.clear_progress();
    }

    async fn handle_reject(&mut self, request_id: &str, reason: &str) {
        let matches = self
            .send
            .as_ref()
            .is_some_and(|pending| pending.request_id == request_id);
        if matches {
            tracing::info!("peer rejected the transfer: {reason}");
            self.finish_rejected_send();
        }
    }

    fn finish_rejected_send(&mut self) {
        if let Some(mut pending) = self.send.take() {
            if let SendMode::LargeHttp { server } = pending.mode {
                server.shutdown();
            }
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(false);
            }
        }
        self.clear_progress();
    }

    async fn handle_ack(&mut self, request_id: &str, success: bool) {
        let http_mode = {
            let Some(pending) = self.send.as_ref() else {
                return;
            };
            if pending.request_id != request_id {
                return;
            }
            matches!(
                pending.mode,
                SendMode::LargeHttp { .. } | SendMode::LargeMobile { .. }
            )
        };

        if http_mode {
            self.finish_send(success);
        }
        // Chunk mode is best-effort; its entry was already recorded on
        // file_complete emission.
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Handle a data-plane message. Pairing and heartbeat frames are the
    /// connection manager's business.
    pub(crate) async fn handle_message(&mut self, message: &Message) {
        match &message.payload {
            Payload::Text { content } => self.handle_text(content),
            Payload::FileRequest {
                file_name,
                file_size,
                mime_type,
                checksum,
                http_url,
            } => {
                self.handle_request(
                    message.id.clone(),
                    file_name.clone(),
                    *file_size,
                    mime_type.clone(),
                    checksum.clone(),
                    http_url.clone(),
                )
                .await;
            }
            Payload::FileAccept {
                request_id,
                upload_url,
            } => self.handle_accept(request_id, upload_url.clone()).await,
            Payload::FileReject { request_id, reason } => {
                self.handle_reject(request_id, reason).await;
            }
            Payload::FileChunk {
                request_id,
                chunk_index,
                data,
                ..
            } => self.handle_chunk(request_id, *chunk_index, data).await,
            Payload::FileComplete {
                request_id,
                checksum,
            } => self.handle_complete(request_id, checksum).await,
            Payload::FileAck {
                request_id,
                success,
            } => self.handle_ack(request_id, *success).await,
            _ => {}
        }
    }

    /// Handle a completion report from an HTTP subtask.
    pub(crate) async fn handle_outcome(&mut self, outcome: TransferOutcome) {
        match outcome {
            TransferOutcome::HttpDownloadDone {
                request_id,
                temp_path,
                result,
            } => {
                let Some(pending) = self.receive.as_ref() else {
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    return;
                };
                if pending.request_id != request_id {
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    return;
                }
                let pending = self.receive.take().expect("checked above");

                // Transport integrity plus a byte-count check suffice on
                // the download path.
                let verified = matches!(result, Ok(bytes) if bytes == pending.file_size);
                if verified {
                    let save_dir = self.storage.get_settings().save_directory;
                    let path = unique_path(&save_dir, &pending.file_name);
                    if tokio::fs::rename(&temp_path, &path).await.is_ok() {
                        self.finish_receive(
                            &pending.file_name,
                            pending.file_size,
                            &pending.mime_type,
                            path,
                            pending.started,
                        );
                        self.write(Message::new(Payload::FileAck {
                            request_id,
                            success: true,
                        }))
                        .await;
                        return;
                    }
                }

                tracing::warn!(file = %pending.file_name, "http download failed verification");
                let _ = tokio::fs::remove_file(&temp_path).await;
                self.clear_progress();
                self.write(Message::new(Payload::FileAck {
                    request_id,
                    success: false,
                }))
                .await;
            }
            TransferOutcome::HttpUploadReceived {
                request_id,
                temp_path,
                success,
            } => {
                let Some(pending) = self.receive.as_ref() else {
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    return;
                };
                if pending.request_id != request_id {
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    return;
                }
                let pending = self.receive.take().expect("checked above");
                if let ReceiveMode::HttpUpload { server } = pending.mode {
                    server.shutdown();
                }

                if success {
                    let save_dir = self.storage.get_settings().save_directory;
                    let path = unique_path(&save_dir, &pending.file_name);
                    if tokio::fs::rename(&temp_path, &path).await.is_ok() {
                        self.finish_receive(
                            &pending.file_name,
                            pending.file_size,
                            &pending.mime_type,
                            path,
                            pending.started,
                        );
                        self.write(Message::new(Payload::FileAck {
                            request_id,
                            success: true,
                        }))
                        .await;
                        return;
                    }
                }

                let _ = tokio::fs::remove_file(&temp_path).await;
                self.clear_progress();
                self.write(Message::new(Payload::FileAck {
                    request_id,
                    success: false,
                }))
                .await;
            }
            TransferOutcome::HttpUploadPushed { request_id, result } => {
                if let Err(e) = &result {
                    tracing::warn!("multipart upload failed: {e}");
                    let matches = self
                        .send
                        .as_ref()
                        .is_some_and(|pending| pending.request_id == request_id);
                    if matches {
                        self.finish_rejected_send();
                    }
                }
                // On success the receiver verifies and answers with
                // file_ack, which finalizes the send.
            }
        }
    }

    /// Abort whatever is in flight: resolve the send promise false,
    /// delete temp files, shut down HTTP endpoints. Called on disconnect.
    pub(crate) async fn abort_receive(&mut self) {
        if let Some(pending) = self.receive.take() {
            match pending.mode {
                ReceiveMode::StreamingChunk { temp_path, .. } => {
                    let _ = tokio::fs::remove_file(&temp_path).await;
                }
                ReceiveMode::HttpUpload { server } => server.shutdown(),
                ReceiveMode::Small { .. } | ReceiveMode::HttpDownload => {}
            }
        }
        self.clear_progress();
    }

    /// Full teardown on disconnect.
    pub(crate) async fn abort_all(&mut self) {
        if let Some(mut pending) = self.send.take() {
            if let SendMode::LargeHttp { server } = pending.mode {
                server.shutdown();
            }
            if let Some(reply) = pending.reply.take() {
                let _ = reply.send(false);
            }
        }
        self.abort_receive().await;
        self.grace_until = None;
    }
}

/// Decrypt a sealed text body; `None` when it does not decode.
fn open_text(content: &str, secret: &[u8; SECRET_SIZE]) -> Option<String> {
    let sealed = BASE64_STANDARD.decode(content).ok()?;
    let plain = crypto::open(&sealed, secret).ok()?;
    String::from_utf8(plain).ok()
}

/// Compute the streaming checksum of a file on disk.
async fn stream_file_checksum(path: &Path) -> Result<String> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = StreamingChecksum::new();
    let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.digest())
}
