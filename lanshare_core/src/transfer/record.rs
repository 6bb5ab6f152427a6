//! Transfer record: the state of one file movement.
//!
//! A record has exactly one writer, the task driving the transfer. Every
//! change is pushed out as an [`AppEvent::TransferUpdated`] snapshot; the
//! backend loop folds those snapshots into the history.

use crate::AppEvent;
use crate::peer::Peer;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Connecting,
    /// Outgoing file published on the web gateway, waiting for a browser
    Sharing,
    AwaitingConfirmation,
    Sending,
    Receiving,
    Completed,
    Aborted,
    Rejected,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Aborted | Self::Rejected | Self::Failed
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Connecting => "Connecting...",
            Self::Sharing => "Sharing...",
            Self::AwaitingConfirmation => "Waiting for confirmation...",
            Self::Sending => "Sending...",
            Self::Receiving => "Receiving...",
            Self::Completed => "Completed",
            Self::Aborted => "Aborted",
            Self::Rejected => "Rejected",
            Self::Failed => "Failed",
        }
    }
}

/// Who is on the other end, snapshotted when the transfer starts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counterparty {
    /// Peer key (IP address) or the browser sentinel
    pub key: String,
    pub nickname: String,
    /// Network address or device label shown next to the nickname
    pub address: String,
    pub accent_color: String,
    #[serde(default, with = "crate::peer::avatar_base64")]
    pub avatar: Option<Vec<u8>>,
}

impl Counterparty {
    pub fn from_peer(peer: &Peer) -> Self {
        Self {
            key: peer.key(),
            nickname: peer.nickname.clone(),
            address: if peer.is_browser_peer {
                String::new()
            } else {
                peer.address.to_string()
            },
            accent_color: peer.accent_color.clone(),
            avatar: peer.avatar.clone(),
        }
    }

    /// "nick (address)", or whichever of the two is present
    pub fn display_name(&self) -> String {
        let has_nick = !self.nickname.trim().is_empty();
        let has_addr = !self.address.trim().is_empty();
        match (has_nick, has_addr) {
            (true, true) => format!("{} ({})", self.nickname, self.address),
            (true, false) => self.nickname.clone(),
            (false, true) => self.address.clone(),
            (false, false) => "Device".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: String,
    pub direction: Direction,
    pub file_name: String,
    pub total_bytes: u64,
    pub local_path: Option<PathBuf>,
    pub counterparty: Counterparty,
    progress: f64,
    status: TransferStatus,
    #[serde(skip)]
    pub speed: String,
    #[serde(skip)]
    pub eta: String,
    pub created_at: u64,
}

impl TransferRecord {
    pub fn new(
        direction: Direction,
        file_name: impl Into<String>,
        total_bytes: u64,
        counterparty: Counterparty,
        status: TransferStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            direction,
            file_name: file_name.into(),
            total_bytes,
            local_path: None,
            counterparty,
            progress: 0.0,
            status,
            speed: String::new(),
            eta: String::new(),
            created_at: now_timestamp(),
        }
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    /// Move to `status`. Terminal states are sticky; returns whether it changed.
    pub fn set_status(&mut self, status: TransferStatus) -> bool {
        if self.status == status || self.status.is_terminal() {
            return false;
        }
        self.status = status;
        if status.is_terminal() {
            self.speed.clear();
            self.eta.clear();
        }
        true
    }

    /// Raise progress to `progress` percent; never moves backwards while active.
    pub fn set_progress(&mut self, progress: f64) -> bool {
        let progress = progress.clamp(0.0, 100.0);
        if self.status.is_terminal() || progress <= self.progress {
            return false;
        }
        self.progress = progress;
        true
    }

    /// Progress derived from a byte count against the fixed total
    pub fn set_bytes_done(&mut self, done: u64) -> bool {
        let progress = if self.total_bytes == 0 {
            100.0
        } else {
            done as f64 / self.total_bytes as f64 * 100.0
        };
        self.set_progress(progress)
    }

    pub fn set_rate(&mut self, speed: String, eta: String) -> bool {
        if self.speed == speed && self.eta == eta {
            return false;
        }
        self.speed = speed;
        self.eta = eta;
        true
    }

    /// Same file and counterparty under a new id, starting over at `status`
    pub fn restarted(&self, status: TransferStatus) -> Self {
        Self {
            local_path: self.local_path.clone(),
            ..Self::new(
                self.direction,
                self.file_name.clone(),
                self.total_bytes,
                self.counterparty.clone(),
                status,
            )
        }
    }

    /// History entries loaded from disk: successful records display as full
    pub(crate) fn normalize_loaded(&mut self) {
        if self.status == TransferStatus::Completed {
            self.progress = 100.0;
        }
    }
}

/// Owning handle for a record in flight: mutates and publishes snapshots
pub struct TransferTracker {
    record: TransferRecord,
    event_tx: mpsc::Sender<AppEvent>,
}

impl TransferTracker {
    pub fn new(record: TransferRecord, event_tx: mpsc::Sender<AppEvent>) -> Self {
        Self { record, event_tx }
    }

    pub fn record(&self) -> &TransferRecord {
        &self.record
    }

    pub fn into_record(self) -> TransferRecord {
        self.record
    }

    pub async fn publish(&self) {
        let _ = self
            .event_tx
            .send(AppEvent::TransferUpdated(self.record.clone()))
            .await;
    }

    /// Apply `f` and publish only if it reports a change
    pub async fn update<F>(&mut self, f: F) -> bool
    where
        F: FnOnce(&mut TransferRecord) -> bool,
    {
        let changed = f(&mut self.record);
        if changed {
            self.publish().await;
        }
        changed
    }

    pub async fn set_status(&mut self, status: TransferStatus) -> bool {
        self.update(|r| r.set_status(status)).await
    }

    /// Non-async [`update`](Self::update) for drop paths; the snapshot is
    /// lost if the event channel is full
    pub fn try_update<F>(&mut self, f: F) -> bool
    where
        F: FnOnce(&mut TransferRecord) -> bool,
    {
        let changed = f(&mut self.record);
        if changed {
            let _ = self
                .event_tx
                .try_send(AppEvent::TransferUpdated(self.record.clone()));
        }
        changed
    }
}

/// Human-readable throughput, e.g. "3.4 MB/s" or "512 KB/s"
pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec > 1024.0 * 1024.0 {
        format!("{:.1} MB/s", bytes_per_sec / 1024.0 / 1024.0)
    } else {
        format!("{:.0} KB/s", bytes_per_sec / 1024.0)
    }
}

/// "mm:ss" or "hh:mm:ss"; "--:--" when the estimate is meaningless
pub fn format_eta(seconds: f64) -> String {
    if !seconds.is_finite() || seconds < 0.0 {
        return "--:--".to_string();
    }
    let total = Duration::from_secs_f64(seconds).as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

pub(crate) fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
