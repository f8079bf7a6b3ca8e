//! Work scheduler - unique background work per episode
//!
//! Tracks at most one live work record per episode, gates execution on the
//! current constraint snapshot, bounds concurrency with a semaphore, and
//! retries retryable failures with exponential backoff. The record set is
//! published over a watch channel; status reconciliation derives persisted
//! statuses from it rather than keeping parallel bookkeeping.

use async_trait::async_trait;
use castload_types::ConstraintSnapshot;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// What to do when work for the same episode is already tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingWorkPolicy {
    /// Keep the existing work, drop the new request.
    Keep,
    /// Cancel the existing work and schedule the new request.
    Replace,
}

/// Constraint requirements attached to one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkConstraints {
    pub requires_unmetered: bool,
    pub requires_power: bool,
    pub requires_storage_not_low: bool,
}

impl WorkConstraints {
    pub fn satisfied_by(&self, snapshot: &ConstraintSnapshot) -> bool {
        snapshot.is_network_available
            && (!self.requires_unmetered || snapshot.is_unmetered_available)
            && (!self.requires_power || snapshot.is_power_available)
            && (!self.requires_storage_not_low || snapshot.is_storage_available)
    }
}

/// A request to schedule one episode download.
#[derive(Debug, Clone)]
pub struct WorkSpec {
    pub episode_uuid: String,
    pub podcast_uuid: Option<String>,
    pub constraints: WorkConstraints,
}

/// Scheduling state of one work record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkState {
    Pending { constraints: WorkConstraints },
    Running,
    Succeeded { download_file: PathBuf },
    Failed { error_message: Option<String> },
    Cancelled,
}

impl WorkState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkState::Succeeded { .. } | WorkState::Failed { .. } | WorkState::Cancelled
        )
    }
}

/// The scheduler's bookkeeping entry for one scheduled, running, or
/// finished unit of work. `run_attempt_count` is monotonically
/// non-decreasing for a given record and resets only when a brand-new
/// record is created for the episode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRecord {
    pub id: Uuid,
    pub episode_uuid: String,
    pub podcast_uuid: Option<String>,
    pub run_attempt_count: u32,
    pub state: WorkState,
}

impl WorkRecord {
    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn pending_constraints(&self) -> Option<WorkConstraints> {
        match self.state {
            WorkState::Pending { constraints } => Some(constraints),
            _ => None,
        }
    }
}

/// Result of executing one unit of work.
#[derive(Debug)]
pub enum WorkOutcome {
    Success { download_file: PathBuf },
    Failure { message: String, retryable: bool },
    Cancelled,
}

/// The work a scheduler entry runs once its constraints are satisfied.
///
/// The executor future is the one logical unit of work per episode: its
/// completion is the sole signal the scheduler uses for lifecycle tracking
/// and retry accounting, so implementations must not spawn work that
/// outlives the call.
#[async_trait]
pub trait WorkExecutor: Send + Sync {
    async fn execute(&self, spec: &WorkSpec, cancel: &CancellationToken) -> WorkOutcome;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub retry_initial_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_attempts: 3,
            retry_initial_backoff: Duration::from_secs(30),
        }
    }
}

struct WorkEntry {
    record: WorkRecord,
    spec: WorkSpec,
    cancel: CancellationToken,
}

struct SchedulerShared {
    entries: Mutex<HashMap<String, WorkEntry>>,
    states_tx: watch::Sender<Vec<WorkRecord>>,
    constraints_rx: watch::Receiver<ConstraintSnapshot>,
    permits: Arc<Semaphore>,
    executor: Arc<dyn WorkExecutor>,
    config: SchedulerConfig,
}

impl SchedulerShared {
    fn publish(&self) {
        let records: Vec<WorkRecord> = {
            let entries = self.entries.lock();
            entries.values().map(|entry| entry.record.clone()).collect()
        };
        self.states_tx.send_replace(records);
    }

    /// Mutate the record for `episode_uuid` if it still belongs to work
    /// `id` (a replaced driver must not touch its successor's record).
    fn update_record(&self, episode_uuid: &str, id: Uuid, f: impl FnOnce(&mut WorkRecord)) -> bool {
        let updated = {
            let mut entries = self.entries.lock();
            match entries.get_mut(episode_uuid) {
                Some(entry) if entry.record.id == id => {
                    f(&mut entry.record);
                    true
                }
                _ => false,
            }
        };
        if updated {
            self.publish();
        }
        updated
    }

    fn finish(&self, episode_uuid: &str, id: Uuid, state: WorkState) {
        self.update_record(episode_uuid, id, |record| record.state = state);
    }

    fn bump_attempt(&self, episode_uuid: &str, id: Uuid) -> u32 {
        let mut attempts = 0;
        self.update_record(episode_uuid, id, |record| {
            record.run_attempt_count += 1;
            attempts = record.run_attempt_count;
        });
        attempts
    }

    fn spec_of(&self, episode_uuid: &str, id: Uuid) -> Option<WorkSpec> {
        let entries = self.entries.lock();
        entries
            .get(episode_uuid)
            .filter(|entry| entry.record.id == id)
            .map(|entry| entry.spec.clone())
    }
}

/// Scheduler tracking one unit of download work per episode.
#[derive(Clone)]
pub struct WorkScheduler {
    shared: Arc<SchedulerShared>,
}

impl WorkScheduler {
    pub fn new(
        executor: Arc<dyn WorkExecutor>,
        constraints_rx: watch::Receiver<ConstraintSnapshot>,
        config: SchedulerConfig,
    ) -> Self {
        let (states_tx, _) = watch::channel(Vec::new());
        Self {
            shared: Arc::new(SchedulerShared {
                entries: Mutex::new(HashMap::new()),
                states_tx,
                constraints_rx,
                permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
                executor,
                config,
            }),
        }
    }

    /// Schedule work for an episode, deduplicating against any existing
    /// record. Returns `true` when new work was scheduled.
    ///
    /// Terminal records are always superseded: a fresh enqueue after
    /// `Failed` or `Downloaded` starts a new cycle with a reset attempt
    /// count.
    pub fn enqueue_unique(&self, spec: WorkSpec, policy: ExistingWorkPolicy) -> bool {
        let episode_uuid = spec.episode_uuid.clone();
        {
            let mut entries = self.shared.entries.lock();
            let supersede = match entries.get(&episode_uuid) {
                Some(existing) if existing.record.is_live() => match policy {
                    ExistingWorkPolicy::Keep => return false,
                    ExistingWorkPolicy::Replace => {
                        existing.cancel.cancel();
                        true
                    }
                },
                Some(_) => true,
                None => false,
            };
            if supersede {
                entries.remove(&episode_uuid);
            }

            let id = Uuid::new_v4();
            let cancel = CancellationToken::new();
            let record = WorkRecord {
                id,
                episode_uuid: episode_uuid.clone(),
                podcast_uuid: spec.podcast_uuid.clone(),
                run_attempt_count: 0,
                state: WorkState::Pending {
                    constraints: spec.constraints,
                },
            };
            entries.insert(
                episode_uuid.clone(),
                WorkEntry {
                    record,
                    spec,
                    cancel: cancel.clone(),
                },
            );
            tokio::spawn(drive(
                self.shared.clone(),
                episode_uuid.clone(),
                id,
                cancel,
            ));
        }
        self.shared.publish();
        info!(episode = %episode_uuid, "scheduled download work");
        true
    }

    /// Cancel work for an episode. A no-op for unknown or already terminal
    /// work.
    pub fn cancel_by_episode(&self, episode_uuid: &str) {
        let cancelled = {
            let entries = self.shared.entries.lock();
            match entries.get(episode_uuid) {
                Some(entry) if entry.record.is_live() => {
                    entry.cancel.cancel();
                    true
                }
                _ => false,
            }
        };
        if cancelled {
            info!(episode = %episode_uuid, "cancelled download work");
        }
    }

    /// Cancel all live work owned by a podcast. Returns the episode uuids
    /// that had live work.
    pub fn cancel_by_podcast(&self, podcast_uuid: &str) -> Vec<String> {
        let cancelled: Vec<String> = {
            let entries = self.shared.entries.lock();
            entries
                .values()
                .filter(|entry| {
                    entry.record.is_live()
                        && entry.record.podcast_uuid.as_deref() == Some(podcast_uuid)
                })
                .map(|entry| {
                    entry.cancel.cancel();
                    entry.record.episode_uuid.clone()
                })
                .collect()
        };
        if !cancelled.is_empty() {
            info!(podcast = %podcast_uuid, count = cancelled.len(), "cancelled podcast downloads");
        }
        cancelled
    }

    /// The currently pending (not yet running) work, keyed by episode uuid.
    pub fn pending_works(&self) -> HashMap<String, WorkRecord> {
        let entries = self.shared.entries.lock();
        entries
            .values()
            .filter(|entry| entry.record.pending_constraints().is_some())
            .map(|entry| (entry.record.episode_uuid.clone(), entry.record.clone()))
            .collect()
    }

    /// Live stream of the full work record set.
    pub fn work_states(&self) -> watch::Receiver<Vec<WorkRecord>> {
        self.shared.states_tx.subscribe()
    }

    pub fn current_records(&self) -> Vec<WorkRecord> {
        let entries = self.shared.entries.lock();
        entries.values().map(|entry| entry.record.clone()).collect()
    }

    pub fn has_live_work(&self) -> bool {
        let entries = self.shared.entries.lock();
        entries.values().any(|entry| entry.record.is_live())
    }

    /// Drop terminal records that a reconciliation pass has observed, so
    /// the record set does not grow without bound. Records created after
    /// the observation are untouched.
    pub fn prune_terminal(&self, observed: &[WorkRecord]) {
        let pruned = {
            let mut entries = self.shared.entries.lock();
            let before = entries.len();
            for record in observed {
                if record.state.is_terminal() {
                    if let Some(entry) = entries.get(&record.episode_uuid) {
                        if entry.record.id == record.id && entry.record.state.is_terminal() {
                            entries.remove(&record.episode_uuid);
                        }
                    }
                }
            }
            before != entries.len()
        };
        if pruned {
            self.shared.publish();
        }
    }
}

/// Per-work driver: wait for constraints, acquire a pool slot, execute,
/// and account for retries. One driver task exists per live work record.
async fn drive(
    shared: Arc<SchedulerShared>,
    episode_uuid: String,
    id: Uuid,
    cancel: CancellationToken,
) {
    let mut constraints_rx = shared.constraints_rx.clone();

    loop {
        let constraints = match shared.spec_of(&episode_uuid, id) {
            Some(spec) => spec.constraints,
            None => return,
        };

        // Wait until the device satisfies this work's requirements.
        loop {
            let satisfied = constraints.satisfied_by(&constraints_rx.borrow_and_update());
            if satisfied {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    shared.finish(&episode_uuid, id, WorkState::Cancelled);
                    return;
                }
                changed = constraints_rx.changed() => {
                    if changed.is_err() {
                        shared.finish(&episode_uuid, id, WorkState::Cancelled);
                        return;
                    }
                }
            }
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                shared.finish(&episode_uuid, id, WorkState::Cancelled);
                return;
            }
            permit = shared.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        // Constraints can regress while waiting for a pool slot. That is a
        // reschedule, not a run attempt, but it still counts toward the
        // ceiling: repeated reschedules without execution are how an item
        // gets stuck.
        if !constraints.satisfied_by(&constraints_rx.borrow()) {
            drop(permit);
            let attempts = shared.bump_attempt(&episode_uuid, id);
            warn!(episode = %episode_uuid, attempts, "constraints lost before execution, rescheduling");
            continue;
        }

        let spec = match shared.spec_of(&episode_uuid, id) {
            Some(spec) => spec,
            None => return,
        };
        if !shared.update_record(&episode_uuid, id, |record| record.state = WorkState::Running) {
            return;
        }

        let outcome = shared.executor.execute(&spec, &cancel).await;
        drop(permit);

        match outcome {
            WorkOutcome::Success { download_file } => {
                shared.finish(&episode_uuid, id, WorkState::Succeeded { download_file });
                return;
            }
            WorkOutcome::Cancelled => {
                shared.finish(&episode_uuid, id, WorkState::Cancelled);
                return;
            }
            WorkOutcome::Failure { message, retryable } => {
                let attempts = shared.bump_attempt(&episode_uuid, id);
                if retryable && attempts < shared.config.max_attempts {
                    let backoff = shared.config.retry_initial_backoff
                        * 2u32.saturating_pow(attempts.saturating_sub(1));
                    warn!(
                        episode = %episode_uuid,
                        attempts,
                        backoff_secs = backoff.as_secs(),
                        error = %message,
                        "download failed, will retry"
                    );
                    shared.update_record(&episode_uuid, id, |record| {
                        record.state = WorkState::Pending { constraints };
                    });
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            shared.finish(&episode_uuid, id, WorkState::Cancelled);
                            return;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                } else {
                    warn!(episode = %episode_uuid, attempts, error = %message, "download failed permanently");
                    shared.finish(
                        &episode_uuid,
                        id,
                        WorkState::Failed {
                            error_message: Some(message),
                        },
                    );
                    return;
                }
            }
        }
    }
}
