use crate::AppEvent;
use crate::config::SharedConfig;
use crate::confirm::ConfirmationGate;
use crate::error::{TransferError, TransferResult};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use super::constants::{CHUNK_SIZE, SPEED_REPORT_INTERVAL};
use super::protocol::read_header;
use super::record::{Counterparty, Direction, TransferRecord, TransferStatus, TransferTracker};
use super::throttle::RateLimiter;
use super::utils::{SpeedMeter, create_unique_file, resolve_save_dir, sanitize_file_name};

/// What every inbound connection needs from the rest of the backend
#[derive(Clone)]
pub struct ReceiverContext {
    pub config: SharedConfig,
    pub gate: Arc<ConfirmationGate>,
    pub event_tx: mpsc::Sender<AppEvent>,
}

/// Drive one inbound transfer to a terminal state.
///
/// Returns the final record for `Completed` and `Rejected`. A stream that
/// ends before the declared size leaves an `Aborted` record and returns
/// [`TransferError::Incomplete`]; header framing errors return before any
/// record exists.
pub async fn receive_transfer<S>(
    stream: &mut S,
    remote: IpAddr,
    ctx: &ReceiverContext,
) -> TransferResult<TransferRecord>
where
    S: AsyncRead + Unpin,
{
    let header = read_header(stream).await?;
    let file_name = sanitize_file_name(&header.file_name);
    let total = header.file_size;

    let counterparty = Counterparty {
        key: remote.to_string(),
        nickname: header.nickname,
        address: remote.to_string(),
        accent_color: header.accent_color,
        avatar: header.avatar,
    };
    let from = counterparty.display_name();
    tracing::info!("Incoming {} ({} bytes) from {}", file_name, total, from);

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
        .await_confirmation(&tracker.record().id, &file_name, &from, &ctx.event_tx)
        .await;
    if !accepted {
        tracing::info!("Declined {} from {}", file_name, from);
        tracker.set_status(TransferStatus::Rejected).await;
        return Ok(tracker.into_record());
    }

    let save_dir = resolve_save_dir(&*ctx.config.read().await).await;

    let (mut file, path) = match create_unique_file(&save_dir, &file_name).await {
        Ok(created) => created,
        Err(e) => {
            tracing::error!("Cannot create {} in {:?}: {}", file_name, save_dir, e);
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

    let copied = copy_to_file(stream, &mut file, total, &ctx.config, &mut tracker).await;
    let flushed = file.flush().await;

    let received = match (copied, flushed) {
        (Ok(n), Ok(())) => n,
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!("Receiving {} failed: {}", file_name, e);
            tracker.set_status(TransferStatus::Aborted).await;
            return Err(e.into());
        }
    };

    if received == total {
        tracker.update(|r| r.set_bytes_done(received)).await;
        tracker.set_status(TransferStatus::Completed).await;
        tracing::info!("Saved {:?}", path);
        let _ = ctx
            .event_tx
            .send(AppEvent::Status(format!("Received {}", file_name)))
            .await;
        Ok(tracker.into_record())
    } else {
        tracing::warn!(
            "{} ended early: {}/{} bytes, partial file left at {:?}",
            file_name,
            received,
            total,
            path
        );
        tracker.set_status(TransferStatus::Aborted).await;
        Err(TransferError::Incomplete {
            received,
            expected: total,
        })
    }
}

/// Copy up to `total` bytes in fixed-size chunks, throttled and reported per chunk
async fn copy_to_file<S>(
    stream: &mut S,
    file: &mut tokio::fs::File,
    total: u64,
    config: &SharedConfig,
    tracker: &mut TransferTracker,
) -> std::io::Result<u64>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut limiter = RateLimiter::new();
    let mut meter = SpeedMeter::new();
    let mut received: u64 = 0;

    while received < total {
        let to_read = std::cmp::min(CHUNK_SIZE as u64, total - received) as usize;
        let n = stream.read(&mut buffer[..to_read]).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n]).await?;
        received += n as u64;

        let limit_kbps = config.read().await.download_limit_kbps;
        limiter.consume(n, limit_kbps).await;
        let rate = meter.sample(received, total, SPEED_REPORT_INTERVAL);
        tracker
            .update(|r| {
                let progressed = r.set_bytes_done(received);
                let rated = rate.is_some_and(|(speed, eta)| r.set_rate(speed, eta));
                progressed || rated
            })
            .await;
    }

    Ok(received)
}
