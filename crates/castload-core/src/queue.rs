//! Queue controller - from "download this" to scheduled work
//!
//! Owns the mapping from download requests to scheduled background work:
//! eligibility filtering, constraint profiles, keep-or-replace dedup
//! against pending work, cancellation by episode or podcast, and the
//! stuck-item safeguard for reschedule storms.

use crate::engine::{
    ExistingWorkPolicy, ShowNotesUpdater, WorkConstraints, WorkRecord, WorkScheduler, WorkSpec,
};
use crate::error::DownloadError;
use crate::paths::DownloadPaths;
use crate::progress::ProgressCache;
use crate::storage::{EpisodeStore, StatusUpdate};
use castload_types::{
    DownloadSettings, DownloadStatus, DownloadStatusKind, DownloadType, Episode, EpisodeKind,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

#[derive(Clone)]
pub struct QueueController {
    store: Arc<dyn EpisodeStore>,
    settings: Arc<RwLock<DownloadSettings>>,
    scheduler: WorkScheduler,
    show_notes: Arc<ShowNotesUpdater>,
    progress: ProgressCache,
    paths: DownloadPaths,
    /// The check-then-schedule sequence must not interleave between two
    /// concurrent enqueue batches, or the same episode gets scheduled twice.
    enqueue_lock: Arc<Mutex<()>>,
}

impl QueueController {
    pub fn new(
        store: Arc<dyn EpisodeStore>,
        settings: Arc<RwLock<DownloadSettings>>,
        scheduler: WorkScheduler,
        show_notes: Arc<ShowNotesUpdater>,
        progress: ProgressCache,
        paths: DownloadPaths,
    ) -> Self {
        Self {
            store,
            settings,
            scheduler,
            show_notes,
            progress,
            paths,
            enqueue_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Schedule downloads for the given episodes.
    ///
    /// Episodes that are already downloaded, user files that have not been
    /// uploaded yet, and (for automatic requests) episodes exempt from auto
    /// download are filtered out. Requests for episodes with pending work
    /// are deduplicated: the pending work is replaced only when the new
    /// request relaxes a network or power requirement it carries.
    pub async fn add_to_queue(
        &self,
        uuids: &[String],
        download_type: DownloadType,
    ) -> Result<(), DownloadError> {
        let _guard = self.enqueue_lock.lock().await;

        let settings = self.settings.read().await.clone();
        let episodes: Vec<Episode> = self
            .store
            .episodes(uuids)
            .await?
            .into_iter()
            .filter(|episode| can_download(episode, download_type))
            .collect();
        if episodes.is_empty() {
            return Ok(());
        }

        let pending = self.scheduler.pending_works();
        let mut queued = HashMap::new();
        for episode in &episodes {
            let constraints = constraint_profile(episode, download_type, &settings);
            let policy = dedup_policy(pending.get(&episode.uuid), constraints);

            self.store
                .set_last_download_attempt(&episode.uuid, Utc::now())
                .await?;

            let scheduled = self.scheduler.enqueue_unique(
                WorkSpec {
                    episode_uuid: episode.uuid.clone(),
                    podcast_uuid: episode.podcast_uuid.clone(),
                    constraints,
                },
                policy,
            );
            if scheduled {
                info!(episode = %episode.uuid, ?download_type, "added episode to download queue");
                queued.insert(
                    episode.uuid.clone(),
                    StatusUpdate::status(DownloadStatus::Queued),
                );
                self.show_notes.enqueue(episode);
            }
        }
        self.store.update_statuses(&queued).await?;
        Ok(())
    }

    /// Cancel downloads for the given episodes. Cancelling an episode with
    /// no work is a no-op, not an error.
    pub async fn remove_from_queue(&self, uuids: &[String]) -> Result<(), DownloadError> {
        for uuid in uuids {
            self.scheduler.cancel_by_episode(uuid);
            self.show_notes.cancel(uuid);
            self.progress.clear_progress(uuid);
        }
        self.reset_statuses(uuids).await?;
        self.delete_download_files(uuids.to_vec());
        Ok(())
    }

    /// Cancel every queued or running download owned by a podcast.
    pub async fn remove_from_queue_for_podcast(
        &self,
        podcast_uuid: &str,
    ) -> Result<(), DownloadError> {
        let uuids: Vec<String> = self
            .store
            .episodes_for_podcast(podcast_uuid)
            .await?
            .into_iter()
            .map(|episode| episode.uuid)
            .collect();

        self.scheduler.cancel_by_podcast(podcast_uuid);
        for uuid in &uuids {
            self.show_notes.cancel(uuid);
            self.progress.clear_progress(uuid);
        }
        self.reset_statuses(&uuids).await?;
        self.delete_download_files(uuids);
        Ok(())
    }

    /// Stuck-item safeguard.
    ///
    /// Constraint changes can make the scheduler reschedule a pending item
    /// repeatedly without it ever running; each reschedule increments the
    /// run attempt count. Pending work at or above the ceiling is cancelled
    /// so it does not recycle forever with growing backoff. This is
    /// distinct from the in-flight retry count, which the work driver
    /// bounds separately.
    pub async fn cancel_downloads_exceeding_max_attempts(
        &self,
        records: &[WorkRecord],
    ) -> Result<(), DownloadError> {
        let max_attempts = self.settings.read().await.max_download_attempts;
        let stuck: Vec<String> = records
            .iter()
            .filter(|record| {
                record.pending_constraints().is_some() && record.run_attempt_count >= max_attempts
            })
            .map(|record| record.episode_uuid.clone())
            .collect();
        if stuck.is_empty() {
            return Ok(());
        }
        warn!(count = stuck.len(), "cancelling downloads stuck in reschedule loops");
        self.remove_from_queue(&stuck).await
    }

    /// Startup sweep: episodes persisted in a pending-group status with no
    /// live work are orphans from an earlier run and get reset to idle.
    pub async fn clear_stale_tasks(&self) -> Result<(), DownloadError> {
        let live: HashSet<String> = self
            .scheduler
            .current_records()
            .into_iter()
            .filter(WorkRecord::is_live)
            .map(|record| record.episode_uuid)
            .collect();

        let marked = self
            .store
            .uuids_with_status(&DownloadStatusKind::PENDING_GROUP)
            .await?;
        let stale: HashMap<String, StatusUpdate> = marked
            .into_iter()
            .filter(|uuid| !live.contains(uuid))
            .map(|uuid| (uuid, StatusUpdate::status(DownloadStatus::NotQueued)))
            .collect();
        if !stale.is_empty() {
            info!(count = stale.len(), "resetting stale download statuses");
            self.store.update_statuses(&stale).await?;
        }
        Ok(())
    }

    async fn reset_statuses(&self, uuids: &[String]) -> Result<(), DownloadError> {
        let updates: HashMap<String, StatusUpdate> = uuids
            .iter()
            .map(|uuid| {
                (
                    uuid.clone(),
                    StatusUpdate::status(DownloadStatus::NotQueued),
                )
            })
            .collect();
        self.store.update_statuses(&updates).await
    }

    /// Best-effort removal of downloaded media for cancelled episodes.
    fn delete_download_files(&self, uuids: Vec<String>) {
        if uuids.is_empty() {
            return;
        }
        let store = self.store.clone();
        let paths = self.paths.clone();
        tokio::spawn(async move {
            let episodes = match store.episodes(&uuids).await {
                Ok(episodes) => episodes,
                Err(error) => {
                    warn!(%error, "could not resolve episodes for file cleanup");
                    return;
                }
            };
            for episode in episodes {
                let file = paths.download_file(&episode);
                let _ = tokio::fs::remove_file(&file).await;
            }
        });
    }
}

fn can_download(episode: &Episode, download_type: DownloadType) -> bool {
    let type_allowed = match download_type {
        DownloadType::UserTriggered => true,
        DownloadType::Automatic => !episode.is_exempt_from_auto_download,
    };
    !episode.is_downloaded() && episode.is_file_available() && type_allowed
}

/// Constraint profile for a request: user-triggered downloads never wait on
/// network type or power, automatic ones honor the user's settings.
/// Storage-not-low is always required.
fn constraint_profile(
    episode: &Episode,
    download_type: DownloadType,
    settings: &DownloadSettings,
) -> WorkConstraints {
    let (requires_unmetered, requires_power) = match (download_type, &episode.kind) {
        (DownloadType::UserTriggered, _) => (false, false),
        (DownloadType::Automatic, EpisodeKind::Podcast) => (
            settings.auto_download_unmetered_only,
            settings.auto_download_on_power_only,
        ),
        (DownloadType::Automatic, EpisodeKind::UserFile { .. }) => {
            (settings.user_file_downloads_unmetered_only, false)
        }
    };
    WorkConstraints {
        requires_unmetered,
        requires_power,
        requires_storage_not_low: true,
    }
}

/// Keep-or-replace dedup: replace pending work only when the new request
/// relaxes a network or power requirement the pending work carries. A
/// more restrictive new request never pre-empts pending work.
fn dedup_policy(existing: Option<&WorkRecord>, new: WorkConstraints) -> ExistingWorkPolicy {
    match existing.and_then(WorkRecord::pending_constraints) {
        Some(pending)
            if (!new.requires_unmetered && pending.requires_unmetered)
                || (!new.requires_power && pending.requires_power) =>
        {
            ExistingWorkPolicy::Replace
        }
        _ => ExistingWorkPolicy::Keep,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{SchedulerConfig, WorkExecutor, WorkOutcome, WorkState};
    use crate::storage::MemoryEpisodeStore;
    use async_trait::async_trait;
    use castload_types::ConstraintSnapshot;
    use std::time::Duration;
    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;

    struct ParkedExecutor;

    #[async_trait]
    impl WorkExecutor for ParkedExecutor {
        async fn execute(&self, _spec: &WorkSpec, cancel: &CancellationToken) -> WorkOutcome {
            cancel.cancelled().await;
            WorkOutcome::Cancelled
        }
    }

    struct Fixture {
        controller: QueueController,
        store: Arc<MemoryEpisodeStore>,
        scheduler: WorkScheduler,
        _constraints_tx: watch::Sender<ConstraintSnapshot>,
        _dir: tempfile::TempDir,
    }

    fn fixture_with_snapshot(
        episodes: Vec<Episode>,
        snapshot: ConstraintSnapshot,
    ) -> Fixture {
        let store = Arc::new(MemoryEpisodeStore::with_episodes(episodes));
        let (constraints_tx, constraints_rx) = watch::channel(snapshot);
        let scheduler = WorkScheduler::new(
            Arc::new(ParkedExecutor),
            constraints_rx,
            SchedulerConfig {
                max_concurrent: 2,
                max_attempts: 3,
                retry_initial_backoff: Duration::from_millis(10),
            },
        );
        let dir = tempfile::tempdir().unwrap();
        let paths = DownloadPaths::new(dir.path());
        let controller = QueueController::new(
            store.clone(),
            Arc::new(RwLock::new(DownloadSettings::default())),
            scheduler.clone(),
            Arc::new(ShowNotesUpdater::new(reqwest::Client::new(), paths.clone())),
            ProgressCache::new(),
            paths,
        );
        Fixture {
            controller,
            store,
            scheduler,
            _constraints_tx: constraints_tx,
            _dir: dir,
        }
    }

    fn fixture(episodes: Vec<Episode>) -> Fixture {
        // Network down keeps all scheduled work observable as pending.
        fixture_with_snapshot(
            episodes,
            ConstraintSnapshot {
                is_network_available: false,
                is_unmetered_available: false,
                ..ConstraintSnapshot::unconstrained()
            },
        )
    }

    fn episode(uuid: &str) -> Episode {
        Episode::podcast_episode(uuid, "pod1", "Title", "https://host/a.mp3")
    }

    fn uuids(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[tokio::test]
    async fn downloaded_episodes_are_not_rescheduled() {
        let mut done = episode("ep1");
        done.status = DownloadStatus::Downloaded;
        let fx = fixture(vec![done]);

        fx.controller
            .add_to_queue(&uuids(&["ep1"]), DownloadType::Automatic)
            .await
            .unwrap();

        assert!(fx.scheduler.current_records().is_empty());
        assert_eq!(fx.store.status_of("ep1"), Some(DownloadStatus::Downloaded));
    }

    #[tokio::test]
    async fn duplicate_enqueue_keeps_one_work_record() {
        let fx = fixture(vec![episode("ep1")]);

        for _ in 0..2 {
            fx.controller
                .add_to_queue(&uuids(&["ep1"]), DownloadType::UserTriggered)
                .await
                .unwrap();
        }

        assert_eq!(fx.scheduler.current_records().len(), 1);
        assert_eq!(fx.store.status_of("ep1"), Some(DownloadStatus::Queued));
    }

    #[tokio::test]
    async fn user_triggered_requests_never_wait() {
        let fx = fixture(vec![episode("ep1")]);

        fx.controller
            .add_to_queue(&uuids(&["ep1"]), DownloadType::UserTriggered)
            .await
            .unwrap();

        let record = &fx.scheduler.current_records()[0];
        let constraints = record.pending_constraints().unwrap();
        assert!(!constraints.requires_unmetered);
        assert!(!constraints.requires_power);
        assert!(constraints.requires_storage_not_low);
    }

    #[tokio::test]
    async fn automatic_requests_honor_settings() {
        let fx = fixture(vec![episode("ep1")]);

        fx.controller
            .add_to_queue(&uuids(&["ep1"]), DownloadType::Automatic)
            .await
            .unwrap();

        let constraints = fx.scheduler.current_records()[0]
            .pending_constraints()
            .unwrap();
        // Defaults: unmetered only, no power requirement.
        assert!(constraints.requires_unmetered);
        assert!(!constraints.requires_power);
    }

    #[tokio::test]
    async fn relaxing_request_replaces_pending_work() {
        let fx = fixture(vec![episode("ep1")]);

        fx.controller
            .add_to_queue(&uuids(&["ep1"]), DownloadType::Automatic)
            .await
            .unwrap();
        let first_id = fx.scheduler.current_records()[0].id;

        fx.controller
            .add_to_queue(&uuids(&["ep1"]), DownloadType::UserTriggered)
            .await
            .unwrap();

        let records = fx.scheduler.current_records();
        assert_eq!(records.len(), 1);
        assert_ne!(records[0].id, first_id);
        assert!(!records[0].pending_constraints().unwrap().requires_unmetered);
    }

    #[tokio::test]
    async fn tightening_request_keeps_pending_work() {
        let fx = fixture(vec![episode("ep1")]);

        fx.controller
            .add_to_queue(&uuids(&["ep1"]), DownloadType::UserTriggered)
            .await
            .unwrap();
        let first_id = fx.scheduler.current_records()[0].id;

        fx.controller
            .add_to_queue(&uuids(&["ep1"]), DownloadType::Automatic)
            .await
            .unwrap();

        let records = fx.scheduler.current_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, first_id);
    }

    #[tokio::test]
    async fn not_uploaded_user_files_are_filtered() {
        let fx = fixture(vec![Episode::user_file(
            "uf1",
            "Recording",
            "https://host/uf1.mp3",
            false,
        )]);

        fx.controller
            .add_to_queue(&uuids(&["uf1"]), DownloadType::UserTriggered)
            .await
            .unwrap();

        assert!(fx.scheduler.current_records().is_empty());
    }

    #[tokio::test]
    async fn exempt_episodes_skip_automatic_but_not_manual() {
        let mut exempt = episode("ep1");
        exempt.is_exempt_from_auto_download = true;
        let fx = fixture(vec![exempt]);

        fx.controller
            .add_to_queue(&uuids(&["ep1"]), DownloadType::Automatic)
            .await
            .unwrap();
        assert!(fx.scheduler.current_records().is_empty());

        fx.controller
            .add_to_queue(&uuids(&["ep1"]), DownloadType::UserTriggered)
            .await
            .unwrap();
        assert_eq!(fx.scheduler.current_records().len(), 1);
    }

    #[tokio::test]
    async fn cancel_of_unknown_episode_is_a_noop() {
        let fx = fixture(vec![episode("ep1")]);
        fx.controller
            .remove_from_queue(&uuids(&["missing"]))
            .await
            .unwrap();
        assert!(!fx.scheduler.has_live_work());
    }

    #[tokio::test]
    async fn remove_resets_status_and_cancels_work() {
        let fx = fixture(vec![episode("ep1")]);
        fx.controller
            .add_to_queue(&uuids(&["ep1"]), DownloadType::UserTriggered)
            .await
            .unwrap();

        fx.controller
            .remove_from_queue(&uuids(&["ep1"]))
            .await
            .unwrap();

        assert_eq!(fx.store.status_of("ep1"), Some(DownloadStatus::NotQueued));
        let mut states = fx.scheduler.work_states();
        loop {
            {
                let records = states.borrow_and_update();
                if records
                    .iter()
                    .any(|r| r.episode_uuid == "ep1" && matches!(r.state, WorkState::Cancelled))
                {
                    break;
                }
            }
            states.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn stuck_pending_work_is_cancelled_at_the_ceiling() {
        let fx = fixture(vec![episode("ep1"), episode("ep2")]);
        fx.controller
            .add_to_queue(&uuids(&["ep1", "ep2"]), DownloadType::UserTriggered)
            .await
            .unwrap();

        let records: Vec<WorkRecord> = fx
            .scheduler
            .current_records()
            .into_iter()
            .map(|mut record| {
                if record.episode_uuid == "ep1" {
                    record.run_attempt_count = 3;
                }
                record
            })
            .collect();

        fx.controller
            .cancel_downloads_exceeding_max_attempts(&records)
            .await
            .unwrap();

        // Give the cancel a moment to propagate through the work driver.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let live: Vec<String> = fx
            .scheduler
            .current_records()
            .into_iter()
            .filter(WorkRecord::is_live)
            .map(|record| record.episode_uuid)
            .collect();
        assert!(!live.contains(&"ep1".to_string()));
        assert!(live.contains(&"ep2".to_string()));
        assert_eq!(fx.store.status_of("ep1"), Some(DownloadStatus::NotQueued));
    }

    #[tokio::test]
    async fn stale_statuses_are_reset_on_startup() {
        let mut stale = episode("ep1");
        stale.status = DownloadStatus::WaitingForNetwork;
        let mut in_progress = episode("ep2");
        in_progress.status = DownloadStatus::InProgress;
        let fx = fixture(vec![stale, in_progress]);

        fx.controller.clear_stale_tasks().await.unwrap();

        assert_eq!(fx.store.status_of("ep1"), Some(DownloadStatus::NotQueued));
        assert_eq!(fx.store.status_of("ep2"), Some(DownloadStatus::NotQueued));
    }
}
