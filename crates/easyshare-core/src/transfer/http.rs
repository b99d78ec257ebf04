//! Single-shot HTTP endpoints and client paths for large-file transfers.
//!
//! Both servers bind an ephemeral port on `0.0.0.0`, serve exactly one
//! transfer under an unguessable random token, answer 404 to any other
//! path or method, and are shut down by the engine on the transfer's
//! terminal state.
//!
//! - `GET /transfer/<token>` streams a file to the downloading peer
//! - `POST /upload/<token>` accepts one file, as `multipart/form-data`
//!   (first file part) or a raw body, verifying while streaming to a
//!   temp path

use std::net::UdpSocket;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{FromRequest, Path as UrlPath, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum_extra::extract::Multipart;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::crypto::StreamingChecksum;
use crate::device::TransferDirection;
use crate::error::{Error, Result};
use crate::events::EventSender;
use crate::transfer::{verify_expected, TransferOutcome, TransferProgress};
use crate::RECEIVE_BUFFER_SIZE;

/// Emit a progress event at most every this many bytes.
const PROGRESS_GRANULARITY: u64 = 256 * 1024;

/// A running single-shot HTTP server.
pub(crate) struct HttpServerHandle {
    /// Externally reachable URL of the endpoint
    pub url: String,
    shutdown: Option<oneshot::Sender<()>>,
}

impl HttpServerHandle {
    /// Stop accepting requests and let the in-flight response finish.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for HttpServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Best local IPv4 for building URLs the peer can reach: route a UDP
/// socket towards a public address and read the chosen source address.
/// No packet is actually sent.
pub(crate) fn local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

/// Throttled progress reporter for HTTP byte streams.
struct ProgressMeter {
    events: EventSender,
    direction: TransferDirection,
    file_name: String,
    total: u64,
    seen: u64,
    last_emitted: u64,
}

impl ProgressMeter {
    fn new(events: EventSender, direction: TransferDirection, file_name: &str, total: u64) -> Self {
        Self {
            events,
            direction,
            file_name: file_name.to_string(),
            total,
            seen: 0,
            last_emitted: 0,
        }
    }

    fn add(&mut self, bytes: u64) {
        self.seen += bytes;
        if self.seen - self.last_emitted >= PROGRESS_GRANULARITY || self.seen >= self.total {
            self.last_emitted = self.seen;
            crate::events::emit(
                &self.events,
                crate::events::Event::TransferProgress(Some(TransferProgress {
                    direction: self.direction,
                    file_name: self.file_name.clone(),
                    bytes_transferred: self.seen.min(self.total),
                    total_bytes: self.total,
                })),
            );
        }
    }
}

// ----------------------------------------------------------------------
// GET /transfer/<token>
// ----------------------------------------------------------------------

struct DownloadState {
    token: String,
    path: PathBuf,
    file_name: String,
    file_size: u64,
    events: EventSender,
}

/// Stand up the sender-side download endpoint for one file.
pub(crate) async fn serve_download(
    path: PathBuf,
    file_name: String,
    file_size: u64,
    events: EventSender,
) -> Result<HttpServerHandle> {
    let token = Uuid::new_v4().to_string();
    let listener = tokio::net::TcpListener::bind("0.0.0.0:0").await?;
    let port = listener.local_addr()?.port();
    let host = local_ip().unwrap_or_else(|| "127.0.0.1".to_string());
    let url = format!("http://{host}:{port}/transfer/{token}");

    let state = Arc::new(DownloadState {
        token,
        path,
        file_name,
        file_size,
        events,
    });

    let app = Router::new()
        .route("/transfer/:token", axum::routing::any(download_handler))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(state);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(e) = serve.await {
            tracing::debug!("download endpoint ended: {e}");
        }
    });

    tracing::info!(%url, "serving file for download");
    Ok(HttpServerHandle {
        url,
        shutdown: Some(shutdown_tx),
    })
}

async fn download_handler(
    UrlPath(token): UrlPath<String>,
    State(state): State<Arc<DownloadState>>,
    method: Method,
) -> Response {
    if method != Method::GET || token != state.token {
        return StatusCode::NOT_FOUND.into_response();
    }

    let file = match tokio::fs::File::open(&state.path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!("cannot open {}: {e}", state.path.display());
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let mut meter = ProgressMeter::new(
        state.events.clone(),
        TransferDirection::Send,
        &state.file_name,
        state.file_size,
    );
    let stream = ReaderStream::with_capacity(file, RECEIVE_BUFFER_SIZE).map(move |item| {
        if let Ok(bytes) = &item {
            meter.add(bytes.len() as u64);
        }
        item
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, state.file_size)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", state.file_name),
        )
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ----------------------------------------------------------------------
// POST /upload/<token>
// ----------------------------------------------------------------------

struct UploadState {
    token: String,
    request_id: String,
    expected_checksum: String,
    file_name: String,
    file_size: u64,
    temp_path: PathBuf,
    events: EventSender,
    outcomes: mpsc::UnboundedSender<TransferOutcome>,
}

/// Stand up the receiver-side upload endpoint for one file.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn serve_upload(
    request_id: String,
    expected_checksum: String,
    file_name: String,
    file_size: u64,
    temp_path: PathBuf,
    events: EventSender,
    outcomes: mpsc::UnboundedSender<TransferOutcome>,
) -> Result<HttpServerHandle> {
    let token = Uuid::new_v4().to_string();
    let listener = tokio::net::TcpListener::bind("0.0.0.0:0").await?;
    let port = listener.local_addr()?.port();
    let host = local_ip().unwrap_or_else(|| "127.0.0.1".to_string());
    let url = format!("http://{host}:{port}/upload/{token}");

    let state = Arc::new(UploadState {
        token,
        request_id,
        expected_checksum,
        file_name,
        file_size,
        temp_path,
        events,
        outcomes,
    });

    let app = Router::new()
        .route("/upload/:token", axum::routing::any(upload_handler))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(state);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(e) = serve.await {
            tracing::debug!("upload endpoint ended: {e}");
        }
    });

    tracing::info!(%url, "accepting file upload");
    Ok(HttpServerHandle {
        url,
        shutdown: Some(shutdown_tx),
    })
}

async fn upload_handler(
    UrlPath(token): UrlPath<String>,
    State(state): State<Arc<UploadState>>,
    request: Request,
) -> Response {
    if request.method() != Method::POST || token != state.token {
        return StatusCode::NOT_FOUND.into_response();
    }

    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    let received = if is_multipart {
        receive_multipart(request, &state).await
    } else {
        receive_raw(request, &state).await
    };

    let (success, bytes) = match received {
        Ok((digest, bytes)) => (
            verify_expected(&state.expected_checksum, &digest, bytes),
            bytes,
        ),
        Err(e) => {
            tracing::warn!("upload body failed: {e}");
            (false, 0)
        }
    };

    if !success && bytes > 0 {
        tracing::warn!(
            file = %state.file_name,
            bytes,
            "uploaded file failed verification"
        );
    }

    let report = state.outcomes.send(TransferOutcome::HttpUploadReceived {
        request_id: state.request_id.clone(),
        temp_path: state.temp_path.clone(),
        success,
    });
    if report.is_err() {
        // The connection died while the body was streaming in.
        let _ = tokio::fs::remove_file(&state.temp_path).await;
    }

    if success {
        (StatusCode::OK, "ok").into_response()
    } else {
        StatusCode::BAD_REQUEST.into_response()
    }
}

/// Drain the first file part of a multipart body into the temp path.
async fn receive_multipart(request: Request, state: &UploadState) -> Result<(String, u64)> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| Error::HttpTransfer(format!("not a multipart body: {e}")))?;

    let mut file = tokio::fs::File::create(&state.temp_path).await?;
    let mut hasher = StreamingChecksum::new();
    let mut meter = ProgressMeter::new(
        state.events.clone(),
        TransferDirection::Receive,
        &state.file_name,
        state.file_size,
    );
    let mut bytes: u64 = 0;

    let field = multipart
        .next_field()
        .await
        .map_err(|e| Error::HttpTransfer(format!("multipart read: {e}")))?;
    let Some(mut field) = field else {
        return Err(Error::HttpTransfer("multipart body has no parts".to_string()));
    };

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| Error::HttpTransfer(format!("multipart read: {e}")))?
    {
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        bytes += chunk.len() as u64;
        meter.add(chunk.len() as u64);
    }

    file.flush().await?;
    Ok((hasher.digest(), bytes))
}

/// Drain a raw request body into the temp path.
async fn receive_raw(request: Request, state: &UploadState) -> Result<(String, u64)> {
    let mut file = tokio::fs::File::create(&state.temp_path).await?;
    let mut hasher = StreamingChecksum::new();
    let mut meter = ProgressMeter::new(
        state.events.clone(),
        TransferDirection::Receive,
        &state.file_name,
        state.file_size,
    );
    let mut bytes: u64 = 0;

    let mut stream = request.into_body().into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::HttpTransfer(format!("body read: {e}")))?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        bytes += chunk.len() as u64;
        meter.add(chunk.len() as u64);
    }

    file.flush().await?;
    Ok((hasher.digest(), bytes))
}

// ----------------------------------------------------------------------
// Client paths
// ----------------------------------------------------------------------

/// Stream a `GET` of the sender's endpoint into a temp path, reporting
/// progress. Returns the byte count on success.
pub(crate) async fn download(
    url: &str,
    temp_path: &Path,
    file_name: &str,
    file_size: u64,
    events: EventSender,
) -> Result<u64> {
    let response = reqwest::Client::new()
        .get(url)
        .send()
        .await
        .map_err(|e| Error::HttpTransfer(format!("download request: {e}")))?;

    if !response.status().is_success() {
        return Err(Error::HttpTransfer(format!(
            "download returned {}",
            response.status()
        )));
    }

    let mut file = tokio::fs::File::create(temp_path).await?;
    let mut meter = ProgressMeter::new(events, TransferDirection::Receive, file_name, file_size);
    let mut bytes: u64 = 0;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::HttpTransfer(format!("download body: {e}")))?;
        file.write_all(&chunk).await?;
        bytes += chunk.len() as u64;
        meter.add(chunk.len() as u64);
    }

    file.flush().await?;
    Ok(bytes)
}

/// Push a file to the receiver's upload endpoint as multipart/form-data,
/// reporting progress from the outgoing stream.
pub(crate) async fn upload(
    url: &str,
    path: &Path,
    file_name: &str,
    file_size: u64,
    mime_type: &str,
    events: EventSender,
) -> Result<()> {
    let file = tokio::fs::File::open(path).await?;

    let mut meter = ProgressMeter::new(events, TransferDirection::Send, file_name, file_size);
    let stream = ReaderStream::with_capacity(file, RECEIVE_BUFFER_SIZE).map(move |item| {
        if let Ok(bytes) = &item {
            meter.add(bytes.len() as u64);
        }
        item
    });

    let part = reqwest::multipart::Part::stream_with_length(
        reqwest::Body::wrap_stream(stream),
        file_size,
    )
    .file_name(file_name.to_string())
    .mime_str(mime_type)
    .map_err(|e| Error::HttpTransfer(format!("invalid mime type: {e}")))?;

    let response = reqwest::Client::new()
        .post(url)
        .multipart(reqwest::multipart::Form::new().part("file", part))
        .send()
        .await
        .map_err(|e| Error::HttpTransfer(format!("upload request: {e}")))?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(Error::HttpTransfer(format!(
            "upload returned {}",
            response.status()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ip_is_parseable() {
        // The UDP trick needs no network traffic; when an interface
        // exists the result must parse as an IP literal.
        if let Some(ip) = local_ip() {
            assert!(ip.parse::<std::net::IpAddr>().is_ok());
        }
    }

    #[tokio::test]
    async fn test_download_endpoint_single_shot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let body: Vec<u8> = (0..100_000u32).map(|i| (i % 256) as u8).collect();
        tokio::fs::write(&path, &body).await.unwrap();

        let (events, _rx) = crate::events::channel();
        let server = serve_download(path, "payload.bin".into(), body.len() as u64, events)
            .await
            .expect("serve");
        let url = server.url.clone();

        let response = reqwest::get(&url).await.expect("get");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("content-disposition")
                .and_then(|v| v.to_str().ok()),
            Some("attachment; filename=\"payload.bin\"")
        );
        let downloaded = response.bytes().await.expect("body");
        assert_eq!(&downloaded[..], &body[..]);

        // Any other token or method is a 404.
        let miss = reqwest::get(url.rsplit_once('/').map(|(base, _)| format!("{base}/nope")).unwrap())
            .await
            .expect("get");
        assert_eq!(miss.status(), reqwest::StatusCode::NOT_FOUND);

        let wrong_method = reqwest::Client::new()
            .post(&url)
            .body("x")
            .send()
            .await
            .expect("post");
        assert_eq!(wrong_method.status(), reqwest::StatusCode::NOT_FOUND);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_upload_endpoint_raw_body_and_verification() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join(".easyshare_tmp_test");
        let body = vec![0xA5u8; 50_000];

        let (events, _rx) = crate::events::channel();
        let (outcomes_tx, mut outcomes_rx) = mpsc::unbounded_channel();

        let server = serve_upload(
            "req-1".into(),
            format!("size:{}", body.len()),
            "payload.bin".into(),
            body.len() as u64,
            temp.clone(),
            events,
            outcomes_tx,
        )
        .await
        .expect("serve");

        let response = reqwest::Client::new()
            .post(&server.url)
            .body(body.clone())
            .send()
            .await
            .expect("post");
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let outcome = outcomes_rx.recv().await.expect("outcome");
        match outcome {
            TransferOutcome::HttpUploadReceived {
                request_id,
                temp_path,
                success,
            } => {
                assert_eq!(request_id, "req-1");
                assert!(success);
                assert_eq!(tokio::fs::read(&temp_path).await.unwrap(), body);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        server.shutdown();
    }

    #[tokio::test]
    async fn test_upload_endpoint_rejects_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join(".easyshare_tmp_test");

        let (events, _rx) = crate::events::channel();
        let (outcomes_tx, mut outcomes_rx) = mpsc::unbounded_channel();

        let server = serve_upload(
            "req-2".into(),
            "size:999".into(),
            "short.bin".into(),
            999,
            temp,
            events,
            outcomes_tx,
        )
        .await
        .expect("serve");

        let response = reqwest::Client::new()
            .post(&server.url)
            .body(vec![1u8; 100])
            .send()
            .await
            .expect("post");
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        match outcomes_rx.recv().await.expect("outcome") {
            TransferOutcome::HttpUploadReceived { success, .. } => assert!(!success),
            other => panic!("unexpected outcome: {other:?}"),
        }

        server.shutdown();
    }

    #[tokio::test]
    async fn test_upload_roundtrip_multipart() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        let temp = dir.path().join(".easyshare_tmp_up");
        let body: Vec<u8> = (0..80_000u32).map(|i| (i % 253) as u8).collect();
        tokio::fs::write(&source, &body).await.unwrap();

        let (events, _rx) = crate::events::channel();
        let (outcomes_tx, mut outcomes_rx) = mpsc::unbounded_channel();

        let server = serve_upload(
            "req-3".into(),
            crate::crypto::checksum(&body),
            "source.bin".into(),
            body.len() as u64,
            temp,
            events.clone(),
            outcomes_tx,
        )
        .await
        .expect("serve");

        upload(
            &server.url,
            &source,
            "source.bin",
            body.len() as u64,
            "application/octet-stream",
            events,
        )
        .await
        .expect("upload");

        match outcomes_rx.recv().await.expect("outcome") {
            TransferOutcome::HttpUploadReceived {
                temp_path, success, ..
            } => {
                assert!(success);
                assert_eq!(tokio::fs::read(&temp_path).await.unwrap(), body);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        server.shutdown();
    }
}
