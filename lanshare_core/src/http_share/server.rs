//! HTTP gateway for browser-only devices
//!
//! Serves the landing page, the currently shared file and the local avatar,
//! and accepts uploads gated by the same confirmation tickets as native
//! transfers.

use crate::AppEvent;
use crate::error::{TransferError, TransferResult};
use crate::identity::LocalIdentity;
use crate::peer::{BROWSER_PEER_COLOR, BROWSER_PEER_KEY};
use crate::transfer::constants::CHUNK_SIZE;
use crate::transfer::receiver::ReceiverContext;
use crate::transfer::record::{Counterparty, Direction, TransferRecord, TransferStatus, TransferTracker};
use crate::transfer::utils::{create_unique_file, resolve_save_dir, sanitize_file_name};
use anyhow::{Context, Result};
use axum::{
    Router,
    body::Body,
    extract::{DefaultBodyLimit, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use bytes::Bytes;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::StreamExt;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::page::{ERROR_PAGE, SenderView, ShareView, render_index};

/// Fixed HTTP port of the gateway
pub const HTTP_PORT: u16 = 46001;

/// Download progress is published once per this many bytes
const PROGRESS_STEP: u64 = 1024 * 1024;

/// Name used when an upload does not carry a usable `X-File-Name`
const FALLBACK_UPLOAD_NAME: &str = "file.bin";

/// Characters left as-is in the download file name (RFC 3986 unreserved)
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// The file currently offered on `/download`
struct SharedFile {
    path: PathBuf,
    /// Snapshot taken when sharing started; later downloads copy it
    template: TransferRecord,
    /// The `Sharing` record until the first download claims it
    offer: Option<TransferTracker>,
}

impl SharedFile {
    /// Record for a new download: the unclaimed offer, else a fresh copy
    fn claim(&mut self, event_tx: &mpsc::Sender<AppEvent>) -> TransferTracker {
        match self.offer.take() {
            Some(tracker) => tracker,
            None => TransferTracker::new(
                self.template.restarted(TransferStatus::Sending),
                event_tx.clone(),
            ),
        }
    }

    /// Close an offer nobody downloaded
    async fn withdraw(self) {
        if let Some(mut offer) = self.offer {
            offer.set_status(TransferStatus::Aborted).await;
        }
    }
}

pub struct GatewayState {
    share: RwLock<Option<SharedFile>>,
    identity: RwLock<LocalIdentity>,
    ctx: ReceiverContext,
}

impl GatewayState {
    pub fn new(identity: LocalIdentity, ctx: ReceiverContext) -> Self {
        Self {
            share: RwLock::new(None),
            identity: RwLock::new(identity),
            ctx,
        }
    }

    /// Offer `path` to browsers, replacing any earlier share.
    ///
    /// The first download continues `record`; each later one gets its own.
    pub async fn share_file(&self, path: PathBuf, mut record: TransferRecord) {
        record.set_status(TransferStatus::Sharing);
        let offer = TransferTracker::new(record.clone(), self.ctx.event_tx.clone());
        offer.publish().await;
        tracing::info!("Sharing {:?} on the web gateway", path);
        let previous = self.share.write().await.replace(SharedFile {
            path,
            template: record,
            offer: Some(offer),
        });
        if let Some(previous) = previous {
            previous.withdraw().await;
        }
    }

    pub async fn clear_share(&self) {
        let previous = self.share.write().await.take();
        if let Some(previous) = previous {
            previous.withdraw().await;
            tracing::info!("Web share cleared");
        }
    }

    pub async fn update_identity(&self, identity: LocalIdentity) {
        *self.identity.write().await = identity;
    }
}

/// Device label for a browser counterparty
pub fn device_label(user_agent: Option<&str>) -> &'static str {
    match user_agent {
        Some(ua) if ua.contains("Android") => "Android",
        Some(ua) if ua.contains("iPhone") => "iPhone",
        _ => "Browser",
    }
}

/// Upload file name from the base64 `X-File-Name` header
fn decode_file_name(headers: &HeaderMap) -> String {
    let decoded = headers
        .get("x-file-name")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| BASE64.decode(v.trim()).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok());
    sanitize_file_name(decoded.as_deref().unwrap_or(FALLBACK_UPLOAD_NAME))
}

fn user_agent(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok())
}

impl IntoResponse for TransferError {
    fn into_response(self) -> Response {
        match self {
            TransferError::Rejected => StatusCode::FORBIDDEN.into_response(),
            TransferError::NothingShared => StatusCode::NOT_FOUND.into_response(),
            e => {
                tracing::error!("Gateway request failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// Permissive CORS on every response; preflights end here
async fn add_cors_headers(req: Request, next: Next) -> Response {
    let mut response = if req.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(req).await
    };

    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, GET, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("X-File-Name, Content-Type"),
    );
    response
}

async fn index_handler(State(state): State<Arc<GatewayState>>) -> Html<String> {
    let share = match state.share.read().await.as_ref() {
        None => ShareView::Nothing,
        Some(shared) => {
            let file_name = shared
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match tokio::fs::metadata(&shared.path).await {
                Ok(meta) if meta.is_file() => ShareView::Ready {
                    file_name,
                    size: meta.len(),
                },
                _ => ShareView::Missing { file_name },
            }
        }
    };

    let identity = state.identity.read().await;
    let sender = SenderView {
        nickname: &identity.nickname,
        accent_color: &identity.accent_color,
        has_avatar: identity.avatar.is_some(),
    };
    match render_index(&sender, &share) {
        Ok(html) => Html(html),
        Err(e) => {
            tracing::error!("Page generation failed: {}", e);
            Html(ERROR_PAGE.to_string())
        }
    }
}

async fn avatar_handler(State(state): State<Arc<GatewayState>>) -> Response {
    match &state.identity.read().await.avatar {
        Some(bytes) => (
            [(header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"))],
            bytes.clone(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn not_found_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Body of a download in progress; marks the record aborted if dropped early
struct DownloadBody {
    file: File,
    buffer: Vec<u8>,
    sent: u64,
    total: u64,
    next_report: u64,
    tracker: TransferTracker,
    finished: bool,
}

impl DownloadBody {
    async fn finish(&mut self, status: TransferStatus) {
        self.finished = true;
        if status == TransferStatus::Completed {
            let sent = self.sent;
            self.tracker.update(|r| r.set_bytes_done(sent)).await;
        }
        self.tracker.set_status(status).await;
    }

    async fn next_chunk(mut self) -> Option<(std::io::Result<Bytes>, Self)> {
        if self.finished || self.sent >= self.total {
            return None;
        }

        let want = std::cmp::min(CHUNK_SIZE as u64, self.total - self.sent) as usize;
        match self.file.read(&mut self.buffer[..want]).await {
            Ok(0) => {
                self.finish(TransferStatus::Failed).await;
                let err = std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "shared file shrank during download",
                );
                Some((Err(err), self))
            }
            Ok(n) => {
                self.sent += n as u64;
                // the server stops polling once Content-Length is reached
                if self.sent >= self.total {
                    self.finish(TransferStatus::Completed).await;
                } else if self.sent >= self.next_report {
                    self.next_report = self.sent + PROGRESS_STEP;
                    let sent = self.sent;
                    self.tracker.update(|r| r.set_bytes_done(sent)).await;
                }
                let chunk = Bytes::copy_from_slice(&self.buffer[..n]);
                Some((Ok(chunk), self))
            }
            Err(e) => {
                self.finish(TransferStatus::Failed).await;
                Some((Err(e), self))
            }
        }
    }
}

impl Drop for DownloadBody {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // client went away mid-download
        self.tracker.try_update(|r| r.set_status(TransferStatus::Aborted));
    }
}

async fn download_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> TransferResult<Response> {
    let (file, path, mut tracker) = {
        let mut share = state.share.write().await;
        let Some(shared) = share.as_mut() else {
            return Err(TransferError::NothingShared);
        };
        let file = match File::open(&shared.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::NothingShared);
            }
            Err(e) => return Err(e.into()),
        };
        let tracker = shared.claim(&state.ctx.event_tx);
        (file, shared.path.clone(), tracker)
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| FALLBACK_UPLOAD_NAME.to_string());

    let total = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => {
            tracker.set_status(TransferStatus::Failed).await;
            return Err(e.into());
        }
    };

    let device = device_label(user_agent(&headers));
    tracing::info!("{} is downloading {}", device, file_name);
    tracker
        .update(|r| {
            r.counterparty.address = device.to_string();
            r.total_bytes = total;
            r.set_status(TransferStatus::Sending);
            true
        })
        .await;

    let mut body = DownloadBody {
        file,
        buffer: vec![0u8; CHUNK_SIZE],
        sent: 0,
        total,
        next_report: PROGRESS_STEP,
        tracker,
        finished: false,
    };
    if total == 0 {
        body.finish(TransferStatus::Completed).await;
    }
    let stream = futures_util::stream::unfold(body, DownloadBody::next_chunk);

    let disposition = format!(
        "attachment; filename=\"{}\"",
        utf8_percent_encode(&file_name, FILENAME_ENCODE_SET)
    );
    let disposition = HeaderValue::from_str(&disposition)
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            ),
            (header::CONTENT_LENGTH, HeaderValue::from(total)),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn upload_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Body,
) -> TransferResult<StatusCode> {
    let ctx = &state.ctx;
    let file_name = decode_file_name(&headers);
    let total = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let device = device_label(user_agent(&headers));

    let counterparty = Counterparty {
        key: BROWSER_PEER_KEY.to_string(),
        nickname: device.to_string(),
        address: String::new(),
        accent_color: BROWSER_PEER_COLOR.to_string(),
        avatar: None,
    };
    let record = TransferRecord::new(
        Direction::Incoming,
        file_name.clone(),
        total,
        counterparty,
        TransferStatus::AwaitingConfirmation,
    );
    let mut tracker = TransferTracker::new(record, ctx.event_tx.clone());
    tracker.publish().await;

    let accepted = ctx
        .gate
        .await_confirmation(&tracker.record().id, &file_name, device, &ctx.event_tx)
        .await;
    if !accepted {
        tracker.set_status(TransferStatus::Rejected).await;
        return Err(TransferError::Rejected);
    }

    let save_dir = resolve_save_dir(&*ctx.config.read().await).await;
    let (mut file, path) = match create_unique_file(&save_dir, &file_name).await {
        Ok(created) => created,
        Err(e) => {
            tracker.set_status(TransferStatus::Failed).await;
            return Err(e.into());
        }
    };
    tracker
        .update(|r| {
            r.local_path = Some(path.clone());
            r.set_status(TransferStatus::Receiving)
        })
        .await;

    let mut received: u64 = 0;
    let mut stream = body.into_data_stream();
    let copied: TransferResult<()> = async {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(std::io::Error::other)?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if total > 0 {
                tracker.update(|r| r.set_bytes_done(received)).await;
            }
        }
        file.flush().await?;
        Ok(())
    }
    .await;

    if let Err(e) = copied {
        tracker.set_status(TransferStatus::Aborted).await;
        return Err(e);
    }
    if total > 0 && received != total {
        tracker.set_status(TransferStatus::Aborted).await;
        return Err(TransferError::Incomplete {
            received,
            expected: total,
        });
    }

    tracker
        .update(|r| {
            if r.total_bytes == 0 {
                r.total_bytes = received;
            }
            r.set_bytes_done(received)
        })
        .await;
    tracker.set_status(TransferStatus::Completed).await;
    tracing::info!("Upload from {} saved to {:?}", device, path);
    let _ = ctx
        .event_tx
        .send(AppEvent::Status(format!("Received {} from {}", file_name, device)))
        .await;
    Ok(StatusCode::OK)
}

/// Build the gateway router
pub fn create_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/download", get(download_handler))
        .route("/avatar", get(avatar_handler))
        .route("/upload", post(upload_handler))
        .route("/favicon.ico", get(not_found_handler))
        .fallback(index_handler)
        .layer(DefaultBodyLimit::disable())
        .layer(middleware::from_fn(add_cors_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn bind_gateway(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind web gateway on {}", addr))
}

/// Serve the gateway until cancelled
pub async fn serve_gateway(
    listener: TcpListener,
    state: Arc<GatewayState>,
    cancel: CancellationToken,
) -> Result<()> {
    let router = create_router(state);
    tracing::info!("Web gateway listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            tracing::info!("Web gateway shutting down gracefully");
        })
        .await?;
    Ok(())
}
