//! Per-transfer confirmation tickets.
//!
//! Every inbound transfer (native or browser) registers a ticket under its
//! transfer id and waits on it. The presentation layer answers with
//! [`crate::AppCommand::RespondConfirmation`], so any number of prompts can
//! be outstanding at once.

use crate::AppEvent;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, oneshot};

/// How long the first prompt may stay unanswered before it is escalated
pub const CONFIRMATION_PATIENCE: Duration = Duration::from_secs(45);

pub struct ConfirmationGate {
    pending: RwLock<HashMap<String, oneshot::Sender<bool>>>,
    patience: Duration,
}

impl ConfirmationGate {
    pub fn new() -> Self {
        Self::with_patience(CONFIRMATION_PATIENCE)
    }

    pub fn with_patience(patience: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            patience,
        }
    }

    /// Ask the user about `file_name` from `from` and wait for the answer.
    ///
    /// After the patience runs out a `ConfirmationEscalated` event asks the
    /// presentation layer for a blocking prompt, and the wait continues on the
    /// same ticket. A ticket dropped without an answer counts as a decline.
    pub async fn await_confirmation(
        &self,
        transfer_id: &str,
        file_name: &str,
        from: &str,
        event_tx: &mpsc::Sender<AppEvent>,
    ) -> bool {
        let (tx, mut rx) = oneshot::channel();
        self.pending.write().await.insert(transfer_id.to_string(), tx);

        let _ = event_tx
            .send(AppEvent::ConfirmationRequested {
                transfer_id: transfer_id.to_string(),
                file_name: file_name.to_string(),
                from: from.to_string(),
            })
            .await;

        let answer = match tokio::time::timeout(self.patience, &mut rx).await {
            Ok(result) => result.unwrap_or(false),
            Err(_) => {
                tracing::info!(
                    "No answer for {} after {:?}, escalating",
                    transfer_id,
                    self.patience
                );
                let _ = event_tx
                    .send(AppEvent::ConfirmationEscalated {
                        transfer_id: transfer_id.to_string(),
                        file_name: file_name.to_string(),
                        from: from.to_string(),
                    })
                    .await;
                rx.await.unwrap_or(false)
            }
        };

        self.pending.write().await.remove(transfer_id);
        answer
    }

    /// Resolve a ticket; false when no such transfer is waiting
    pub async fn respond(&self, transfer_id: &str, accepted: bool) -> bool {
        match self.pending.write().await.remove(transfer_id) {
            Some(tx) => tx.send(accepted).is_ok(),
            None => {
                tracing::debug!("No pending confirmation for {}", transfer_id);
                false
            }
        }
    }

    /// Decline everything still waiting; returns how many were pending
    pub async fn decline_all(&self) -> usize {
        let mut pending = self.pending.write().await;
        let count = pending.len();
        for (_, tx) in pending.drain() {
            let _ = tx.send(false);
        }
        count
    }
}

impl Default for ConfirmationGate {
    fn default() -> Self {
        Self::new()
    }
}
