//! Castload Core - Episode Download Engine
//!
//! This crate implements the episode download subsystem: constraint-gated
//! scheduling of one unit of work per episode, a bounded worker pool
//! streaming media to disk with atomic promotion, live progress with
//! throttled notifications, and reconciliation of scheduler state into
//! persisted, human-meaningful download statuses.

mod constraints;
mod engine;
mod error;
mod notification;
mod paths;
mod progress;
mod queue;
mod status;
mod storage;

pub use constraints::*;
pub use engine::*;
pub use error::*;
pub use notification::*;
pub use paths::*;
pub use progress::*;
pub use queue::*;
pub use status::*;
pub use storage::*;

use async_trait::async_trait;
use castload_types::{ConstraintSnapshot, CoreEvent, DownloadSettings, DownloadType};
use reqwest::Client;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The public surface of the download subsystem.
///
/// Composes the queue controller, status controller, work scheduler,
/// progress cache, and notification observer behind enqueue/cancel/query
/// operations. All scheduling state lives in the work scheduler; statuses
/// are derived from it by reconciliation rather than tracked separately.
#[derive(Clone)]
pub struct DownloadManager {
    store: Arc<dyn EpisodeStore>,
    settings: Arc<RwLock<DownloadSettings>>,
    progress: ProgressCache,
    scheduler: WorkScheduler,
    queue: QueueController,
    status: StatusController,
    constraints_rx: watch::Receiver<ConstraintSnapshot>,
    event_tx: broadcast::Sender<CoreEvent>,
    is_monitoring: Arc<AtomicBool>,
}

impl DownloadManager {
    /// Create a download manager.
    ///
    /// `constraints_rx` is the live device-state stream, typically from a
    /// [`PollingConstraintMonitor`]. Downloaded media is laid out under
    /// `data_root`.
    pub fn new(
        store: Arc<dyn EpisodeStore>,
        settings: DownloadSettings,
        constraints_rx: watch::Receiver<ConstraintSnapshot>,
        sink: Arc<dyn NotificationSink>,
        data_root: impl Into<PathBuf>,
    ) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent("Castload/0.1.0")
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(60))
            .build()?;

        let scheduler_config = SchedulerConfig {
            max_concurrent: settings.max_concurrent_downloads,
            max_attempts: settings.max_download_attempts,
            retry_initial_backoff: Duration::from_secs(settings.retry_initial_backoff_secs),
        };

        let paths = DownloadPaths::new(data_root);
        let progress = ProgressCache::new();
        let (event_tx, _) = broadcast::channel(256);
        let settings = Arc::new(RwLock::new(settings));

        let executor = Arc::new(FetchExecutor {
            store: store.clone(),
            fetcher: EpisodeFetcher::new(client.clone(), progress.clone()),
            paths: paths.clone(),
            observer: NotificationObserver::new(progress.clone(), sink),
            progress: progress.clone(),
        });
        let scheduler = WorkScheduler::new(executor, constraints_rx.clone(), scheduler_config);
        let show_notes = Arc::new(ShowNotesUpdater::new(client, paths.clone()));

        let queue = QueueController::new(
            store.clone(),
            settings.clone(),
            scheduler.clone(),
            show_notes,
            progress.clone(),
            paths,
        );
        let status = StatusController::new(store.clone(), settings.clone(), event_tx.clone());

        Ok(Self {
            store,
            settings,
            progress,
            scheduler,
            queue,
            status,
            constraints_rx,
            event_tx,
            is_monitoring: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Schedule downloads for the given episodes. Returns once the
    /// scheduling intent is recorded; transfers complete in the background.
    pub async fn enqueue_all(
        &self,
        uuids: &[String],
        download_type: DownloadType,
    ) -> Result<(), DownloadError> {
        self.queue.add_to_queue(uuids, download_type).await
    }

    /// Cancel downloads for the given episodes. Idempotent.
    pub async fn cancel_all(&self, uuids: &[String]) -> Result<(), DownloadError> {
        self.queue.remove_from_queue(uuids).await
    }

    /// Cancel every queued episode of a podcast.
    pub async fn cancel_all_for_podcast(&self, podcast_uuid: &str) -> Result<(), DownloadError> {
        self.queue.remove_from_queue_for_podcast(podcast_uuid).await
    }

    /// Whether any download work is queued or running.
    pub fn has_pending_or_running_downloads(&self) -> bool {
        self.scheduler.has_live_work()
    }

    /// Subscribe to core events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    /// The process-wide progress cache.
    pub fn progress(&self) -> &ProgressCache {
        &self.progress
    }

    pub fn settings(&self) -> Arc<RwLock<DownloadSettings>> {
        self.settings.clone()
    }

    pub fn store(&self) -> Arc<dyn EpisodeStore> {
        self.store.clone()
    }

    /// Start status reconciliation. Idempotent; the loop runs for the
    /// lifetime of the process.
    ///
    /// Statuses are derived from (work states x constraint snapshot) taken
    /// in the same pass, so a status write always reflects a constraint
    /// snapshot at least as fresh as the work-state sample it is paired
    /// with.
    pub fn monitor_download_status(&self) {
        if self.is_monitoring.swap(true, Ordering::AcqRel) {
            return;
        }

        let queue = self.queue.clone();
        let status = self.status.clone();
        let scheduler = self.scheduler.clone();
        let mut work_rx = self.scheduler.work_states();
        let mut constraints_rx = self.constraints_rx.clone();

        tokio::spawn(async move {
            if let Err(error) = queue.clear_stale_tasks().await {
                warn!(%error, "stale task sweep failed");
            }

            loop {
                let records = work_rx.borrow_and_update().clone();
                let snapshot = *constraints_rx.borrow_and_update();

                if let Err(error) = status.update_statuses(&records, snapshot).await {
                    warn!(%error, "status reconciliation failed");
                }
                if let Err(error) = queue.cancel_downloads_exceeding_max_attempts(&records).await {
                    warn!(%error, "stuck download sweep failed");
                }
                scheduler.prune_terminal(&records);

                tokio::select! {
                    changed = work_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    changed = constraints_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("status reconciliation loop stopped");
        });
    }
}

/// Runs one episode fetch as the scheduler's unit of work: resolve the
/// episode, observe notifications for its lifetime, fetch, and map the
/// outcome. Everything completes before `execute` returns.
struct FetchExecutor {
    store: Arc<dyn EpisodeStore>,
    fetcher: EpisodeFetcher,
    paths: DownloadPaths,
    observer: NotificationObserver,
    progress: ProgressCache,
}

#[async_trait]
impl WorkExecutor for FetchExecutor {
    async fn execute(&self, spec: &WorkSpec, cancel: &CancellationToken) -> WorkOutcome {
        let episode = match self.store.episode(&spec.episode_uuid).await {
            Ok(Some(episode)) => episode,
            Ok(None) => {
                return WorkOutcome::Failure {
                    message: "Episode is no longer in the library.".to_string(),
                    retryable: false,
                }
            }
            Err(error) => {
                return WorkOutcome::Failure {
                    message: error.to_string(),
                    retryable: false,
                }
            }
        };

        let download_file = self.paths.download_file(&episode);
        let temp_file = self.paths.temp_file(&episode);

        let notification = self.observer.observe(&episode, |uuid| {
            debug!(episode = %uuid, "download visible in foreground");
        });
        let outcome = self
            .fetcher
            .download(&episode, &download_file, &temp_file, cancel)
            .await;
        notification.cancel();
        self.progress.clear_progress(&episode.uuid);

        match outcome {
            FetchOutcome::Success { download_file, .. } => WorkOutcome::Success { download_file },
            FetchOutcome::Cancelled => WorkOutcome::Cancelled,
            failure => WorkOutcome::Failure {
                retryable: failure.should_retry(),
                message: failure
                    .error_message()
                    .unwrap_or_else(|| "Download failed.".to_string()),
            },
        }
    }
}
