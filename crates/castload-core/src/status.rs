//! Status controller - reconciling work state into persisted statuses
//!
//! Combines the scheduler's live work records with the current constraint
//! snapshot to produce a human-meaningful status per episode, applied as
//! one atomic batch. Episodes left in a pending-group status with no
//! matching work record are reset to idle in the same pass.

use crate::engine::{WorkRecord, WorkState};
use crate::error::DownloadError;
use crate::storage::{EpisodeStore, StatusUpdate};
use castload_types::{
    ConstraintSnapshot, CoreEvent, DownloadSettings, DownloadStatus, DownloadStatusKind,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

const TOO_MANY_ATTEMPTS_MESSAGE: &str = "Download failed after too many attempts.";
const DEFAULT_FAILURE_MESSAGE: &str = "Download failed.";

#[derive(Clone)]
pub struct StatusController {
    store: Arc<dyn EpisodeStore>,
    settings: Arc<RwLock<DownloadSettings>>,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl StatusController {
    pub fn new(
        store: Arc<dyn EpisodeStore>,
        settings: Arc<RwLock<DownloadSettings>>,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            store,
            settings,
            event_tx,
        }
    }

    /// One reconciliation pass: derive a status for every tracked work
    /// record, reset orphaned pending-group statuses, and apply everything
    /// as a single atomic batch.
    pub async fn update_statuses(
        &self,
        records: &[WorkRecord],
        snapshot: ConstraintSnapshot,
    ) -> Result<(), DownloadError> {
        let max_attempts = self.settings.read().await.max_download_attempts;

        let mut updates: HashMap<String, StatusUpdate> = records
            .iter()
            .map(|record| {
                (
                    record.episode_uuid.clone(),
                    status_update_for(record, &snapshot, max_attempts),
                )
            })
            .collect();

        // Orphan cleanup: statuses claiming scheduler work that no longer
        // exists are reset to idle within this same pass.
        let marked = self
            .store
            .uuids_with_status(&DownloadStatusKind::PENDING_GROUP)
            .await?;
        for uuid in marked {
            updates
                .entry(uuid)
                .or_insert_with(|| StatusUpdate::status(DownloadStatus::NotQueued));
        }

        if updates.is_empty() {
            return Ok(());
        }
        debug!(count = updates.len(), "applying status reconciliation batch");
        self.store.update_statuses(&updates).await?;

        for (uuid, update) in updates {
            let _ = self.event_tx.send(CoreEvent::DownloadStatusChanged {
                uuid,
                status: update.status,
            });
        }
        Ok(())
    }
}

/// Derive the persisted status for one work record under the given
/// constraint snapshot.
fn status_update_for(
    record: &WorkRecord,
    snapshot: &ConstraintSnapshot,
    max_attempts: u32,
) -> StatusUpdate {
    match &record.state {
        WorkState::Pending { constraints } => {
            let status = if !snapshot.is_network_available {
                DownloadStatus::WaitingForNetwork
            } else if constraints.requires_unmetered && !snapshot.is_unmetered_available {
                DownloadStatus::WaitingForNetwork
            } else if constraints.requires_power && !snapshot.is_power_available {
                DownloadStatus::WaitingForPower
            } else if constraints.requires_storage_not_low && !snapshot.is_storage_available {
                DownloadStatus::WaitingForStorage
            } else {
                DownloadStatus::Queued
            };
            StatusUpdate::status(status)
        }

        WorkState::Running => StatusUpdate::status(DownloadStatus::InProgress),

        WorkState::Succeeded { download_file } => StatusUpdate::downloaded(download_file.clone()),

        WorkState::Failed { error_message } => StatusUpdate::status(DownloadStatus::failed(
            error_message
                .as_deref()
                .filter(|message| !message.is_empty())
                .unwrap_or(DEFAULT_FAILURE_MESSAGE),
        )),

        // A cancellation at the attempt ceiling was a reschedule storm and
        // surfaces as a failure; any other cancellation resets silently.
        WorkState::Cancelled => {
            if record.run_attempt_count >= max_attempts {
                StatusUpdate::status(DownloadStatus::failed(TOO_MANY_ATTEMPTS_MESSAGE))
            } else {
                StatusUpdate::status(DownloadStatus::NotQueued)
            }
        }
    }
}
