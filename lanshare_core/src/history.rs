use crate::transfer::record::TransferRecord;

/// Maximum number of history entries kept
pub const HISTORY_CAP: usize = 100;

/// In-memory transfer history, newest first
#[derive(Debug, Clone, Default)]
pub struct TransferHistory {
    records: Vec<TransferRecord>,
}

/// What an upsert did to the history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryChange {
    Inserted,
    Updated,
    Unchanged,
}

impl TransferHistory {
    pub fn new(mut records: Vec<TransferRecord>) -> Self {
        records.truncate(HISTORY_CAP);
        Self { records }
    }

    pub fn records(&self) -> &[TransferRecord] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&TransferRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Insert a new record at the front or replace the snapshot with the same id
    pub fn upsert(&mut self, record: TransferRecord) -> HistoryChange {
        match self.records.iter_mut().find(|r| r.id == record.id) {
            Some(existing) if *existing == record => HistoryChange::Unchanged,
            Some(existing) => {
                *existing = record;
                HistoryChange::Updated
            }
            None => {
                self.records.insert(0, record);
                self.records.truncate(HISTORY_CAP);
                HistoryChange::Inserted
            }
        }
    }

    pub fn clear_for_peer(&mut self, key: &str) -> usize {
        let before = self.records.len();
        self.records.retain(|r| r.counterparty.key != key);
        before - self.records.len()
    }

    pub fn clear_all(&mut self) -> usize {
        let n = self.records.len();
        self.records.clear();
        n
    }
}
