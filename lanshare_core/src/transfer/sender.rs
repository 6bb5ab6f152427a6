use crate::config::SharedConfig;
use crate::error::{TransferError, TransferResult};
use crate::identity::LocalIdentity;
use crate::peer::Peer;
use std::net::SocketAddr;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::constants::{CHUNK_SIZE, SPEED_REPORT_INTERVAL};
use super::protocol::{TransferHeader, write_header};
use super::record::{Counterparty, Direction, TransferRecord, TransferStatus, TransferTracker};
use super::throttle::RateLimiter;
use super::utils::SpeedMeter;

/// Create the record for a send the user just initiated
pub async fn prepare_outgoing(path: &Path, peer: &Peer) -> TransferResult<TransferRecord> {
    let size = tokio::fs::metadata(path).await?.len();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file.bin".to_string());

    let mut record = TransferRecord::new(
        Direction::Outgoing,
        file_name,
        size,
        Counterparty::from_peer(peer),
        TransferStatus::Connecting,
    );
    record.local_path = Some(path.to_path_buf());
    Ok(record)
}

/// Connect to `target` and stream the file behind `tracker`'s record.
///
/// Failures leave the record `Failed` and are returned to the caller; nothing
/// is retried.
pub async fn send_file(
    target: SocketAddr,
    path: &Path,
    tracker: &mut TransferTracker,
    identity: &LocalIdentity,
    config: &SharedConfig,
) -> TransferResult<()> {
    tracker.publish().await;

    let result: TransferResult<()> = async {
        let mut stream = TcpStream::connect(target).await?;
        stream.set_nodelay(true)?;
        tracing::info!("Connected to {} for {:?}", target, path);
        send_over(&mut stream, path, tracker, identity, config).await?;
        stream.shutdown().await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            tracker.set_status(TransferStatus::Completed).await;
            tracing::info!("Sent {} to {}", tracker.record().file_name, target);
            Ok(())
        }
        Err(e) => {
            tracing::warn!("Sending {:?} to {} failed: {}", path, target, e);
            tracker.set_status(TransferStatus::Failed).await;
            Err(e)
        }
    }
}

/// Write header and file bytes to an already open stream
pub async fn send_over<W>(
    writer: &mut W,
    path: &Path,
    tracker: &mut TransferTracker,
    identity: &LocalIdentity,
    config: &SharedConfig,
) -> TransferResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut file = File::open(path).await?;
    let total = tracker.record().total_bytes;

    let header = TransferHeader {
        nickname: identity.nickname.clone(),
        accent_color: identity.accent_color.clone(),
        avatar: identity.avatar.clone(),
        file_name: tracker.record().file_name.clone(),
        file_size: total,
    };
    write_header(writer, &header).await?;
    tracker.set_status(TransferStatus::Sending).await;

    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut limiter = RateLimiter::new();
    let mut meter = SpeedMeter::new();
    let mut sent: u64 = 0;

    while sent < total {
        let to_read = std::cmp::min(CHUNK_SIZE as u64, total - sent) as usize;
        let n = file.read(&mut buffer[..to_read]).await?;
        if n == 0 {
            // file shrank after the header went out
            break;
        }
        writer.write_all(&buffer[..n]).await?;
        sent += n as u64;

        let limit_kbps = config.read().await.upload_limit_kbps;
        limiter.consume(n, limit_kbps).await;
        let rate = meter.sample(sent, total, SPEED_REPORT_INTERVAL);
        tracker
            .update(|r| {
                let progressed = r.set_bytes_done(sent);
                let rated = rate.is_some_and(|(speed, eta)| r.set_rate(speed, eta));
                progressed || rated
            })
            .await;
    }

    writer.flush().await?;
    if sent != total {
        return Err(TransferError::Incomplete {
            received: sent,
            expected: total,
        });
    }
    tracker.update(|r| r.set_bytes_done(sent)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppEvent;
    use crate::config::AppConfig;
    use crate::transfer::protocol::read_header;
    use crate::transfer::throttle::WINDOW_RESET_BYTES;
    use tokio::time::Instant;
    use tokio::sync::mpsc;

    fn identity() -> LocalIdentity {
        LocalIdentity {
            nickname: "Alice".into(),
            accent_color: "#FF00FF00".into(),
            avatar: Some(vec![1, 2, 3]),
        }
    }

    fn tracker_for(path: &Path, total: u64) -> (TransferTracker, mpsc::Receiver<AppEvent>) {
        let (tx, rx) = mpsc::channel(1024);
        let mut record = TransferRecord::new(
            Direction::Outgoing,
            path.file_name().unwrap().to_string_lossy(),
            total,
            Counterparty::default(),
            TransferStatus::Connecting,
        );
        record.local_path = Some(path.to_path_buf());
        (TransferTracker::new(record, tx), rx)
    }

    #[tokio::test]
    async fn test_send_over_writes_header_then_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        let payload: Vec<u8> = (0..150_000u32).map(|i| i as u8).collect();
        std::fs::write(&path, &payload).unwrap();

        let (mut tracker, _rx) = tracker_for(&path, payload.len() as u64);
        let config = AppConfig::default().shared();
        let mut wire = Vec::new();
        send_over(&mut wire, &path, &mut tracker, &identity(), &config)
            .await
            .unwrap();

        let mut reader = wire.as_slice();
        let header = read_header(&mut reader).await.unwrap();
        assert_eq!(header.nickname, "Alice");
        assert_eq!(header.avatar, Some(vec![1, 2, 3]));
        assert_eq!(header.file_name, "photo.jpg");
        assert_eq!(header.file_size, payload.len() as u64);
        assert_eq!(reader, payload.as_slice());

        assert_eq!(tracker.record().status(), TransferStatus::Sending);
        assert_eq!(tracker.record().progress(), 100.0);
    }

    #[tokio::test]
    async fn test_connection_refused_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"abc").unwrap();

        // grab a free port, then close it again
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap();
        drop(listener);

        let (mut tracker, _rx) = tracker_for(&path, 3);
        let config = AppConfig::default().shared();
        let result = send_file(target, &path, &mut tracker, &identity(), &config).await;
        assert!(result.is_err());
        assert_eq!(tracker.record().status(), TransferStatus::Failed);
    }

    #[tokio::test]
    async fn test_prepare_outgoing_snapshots_peer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, b"# hi").unwrap();
        let peer = Peer::browser();

        let record = prepare_outgoing(&path, &peer).await.unwrap();
        assert_eq!(record.total_bytes, 4);
        assert_eq!(record.file_name, "notes.md");
        assert_eq!(record.status(), TransferStatus::Connecting);
        assert_eq!(record.counterparty.key, peer.key());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_ceiling_paces_the_send() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paced.bin");
        let payload = vec![5u8; 2 * 1024 * 1024];
        std::fs::write(&path, &payload).unwrap();

        let (mut tracker, _rx) = tracker_for(&path, payload.len() as u64);
        let config = AppConfig {
            upload_limit_kbps: 512,
            // the other direction's ceiling must not apply here
            download_limit_kbps: 1,
            ..AppConfig::default()
        }
        .shared();

        let mut wire = Vec::new();
        let start = Instant::now();
        send_over(&mut wire, &path, &mut tracker, &identity(), &config)
            .await
            .unwrap();
        let elapsed = start.elapsed().as_secs_f64();

        assert!(wire.ends_with(&payload));
        let rate = 512.0 * 1024.0;
        let ideal = payload.len() as f64 / rate;
        let window = WINDOW_RESET_BYTES as f64 / rate;
        assert!(elapsed >= ideal - window, "too fast: {elapsed}s vs {ideal}s");
        assert!(elapsed <= ideal + 1.0, "too slow: {elapsed}s vs {ideal}s");
    }
}
