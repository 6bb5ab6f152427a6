//! JSON persistence for the peer cache and the transfer history.

use crate::config::get_config_dir;
use crate::history::HISTORY_CAP;
use crate::peer::Peer;
use crate::transfer::record::TransferRecord;
use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::fs;

const PEERS_FILE: &str = "peers_cache.json";
const HISTORY_FILE: &str = "history.json";

#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Storage in the app config directory (current directory as a last resort)
    pub fn default_location() -> Self {
        Self::new(get_config_dir().unwrap_or_else(|| PathBuf::from(".")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cached peers, all offline; self and the browser peer are never cached
    pub async fn load_peers(&self) -> Vec<Peer> {
        self.load_list::<Peer>(PEERS_FILE)
            .await
            .into_iter()
            .filter(|p| !p.is_self && !p.is_browser_peer)
            .map(Peer::into_cached)
            .collect()
    }

    pub async fn save_peers(&self, peers: &[Peer]) -> Result<()> {
        let peers: Vec<&Peer> = peers
            .iter()
            .filter(|p| !p.is_self && !p.is_browser_peer)
            .collect();
        self.save_list(PEERS_FILE, &peers).await
    }

    /// Newest-first history, at most [`HISTORY_CAP`] entries
    pub async fn load_history(&self) -> Vec<TransferRecord> {
        let mut records = self.load_list::<TransferRecord>(HISTORY_FILE).await;
        records.truncate(HISTORY_CAP);
        for record in records.iter_mut() {
            record.normalize_loaded();
        }
        records
    }

    pub async fn save_history(&self, records: &[TransferRecord]) -> Result<()> {
        let capped = &records[..records.len().min(HISTORY_CAP)];
        self.save_list(HISTORY_FILE, capped).await
    }

    async fn load_list<T: DeserializeOwned>(&self, file: &str) -> Vec<T> {
        let path = self.dir.join(file);
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                tracing::warn!("Cannot read {:?}: {}", path, e);
                return Vec::new();
            }
        };

        serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Ignoring corrupt {:?}: {}", path, e);
            Vec::new()
        })
    }

    async fn save_list<T: Serialize + ?Sized>(&self, file: &str, list: &T) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .context("Failed to create storage directory")?;

        let json = serde_json::to_string_pretty(list)?;
        let path = self.dir.join(file);
        fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentity;
    use crate::peer::{NetworkKind, PeerSighting};
    use crate::transfer::record::{Counterparty, Direction, TransferStatus};

    fn record(n: usize) -> TransferRecord {
        TransferRecord::new(
            Direction::Outgoing,
            format!("file-{n}.bin"),
            n as u64,
            Counterparty::default(),
            TransferStatus::Connecting,
        )
    }

    #[tokio::test]
    async fn test_missing_files_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        assert_eq!(storage.dir(), dir.path());
        assert!(storage.load_peers().await.is_empty());
        assert!(storage.load_history().await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_history_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(HISTORY_FILE), "{not json").unwrap();
        let storage = Storage::new(dir.path());
        assert!(storage.load_history().await.is_empty());
    }

    #[tokio::test]
    async fn test_history_capped_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let records: Vec<TransferRecord> = (0..150).map(record).collect();

        storage.save_history(&records).await.unwrap();
        let loaded = storage.load_history().await;
        assert_eq!(loaded.len(), HISTORY_CAP);
        assert_eq!(loaded[0].file_name, "file-0.bin");
        assert_eq!(loaded[99].file_name, "file-99.bin");
    }

    #[tokio::test]
    async fn test_history_load_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let records: Vec<TransferRecord> = (0..10).map(record).collect();
        storage.save_history(&records).await.unwrap();

        let first = storage.load_history().await;
        let second = storage.load_history().await;
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn test_completed_history_shows_full_progress() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let mut done = record(1);
        done.set_status(TransferStatus::Completed);
        storage.save_history(&[done]).await.unwrap();

        let loaded = storage.load_history().await;
        assert_eq!(loaded[0].progress(), 100.0);
    }

    #[tokio::test]
    async fn test_peers_come_back_offline_without_self() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let address = "192.168.1.9".parse().unwrap();
        let bob = Peer::from_sighting(
            PeerSighting {
                nickname: "bob".into(),
                accent_color: "#FF112233".into(),
                avatar: Some(vec![9, 9]),
                address,
                network_kind: NetworkKind::Lan,
            },
            100,
        );
        let me = Peer::local(
            &LocalIdentity {
                nickname: "me".into(),
                accent_color: "#FF000000".into(),
                avatar: None,
            },
            "192.168.1.2".parse().unwrap(),
        );

        storage.save_peers(&[me, bob]).await.unwrap();
        let loaded = storage.load_peers().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].nickname, "bob");
        assert!(!loaded[0].is_online());
        assert_eq!(loaded[0].avatar, Some(vec![9, 9]));
    }
}
