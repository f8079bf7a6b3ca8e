//! Progress cache - process-wide download progress
//!
//! Source of truth for "how far along is this download". Fetchers write
//! byte counts for their own episode; observers subscribe to a live stream
//! of percentages per episode.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

/// A transient progress reading for one episode. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
}

impl ProgressSample {
    /// Percentage in 0..=100 rounded to 2 decimal places, or `None` while the
    /// total is unknown (indeterminate progress).
    pub fn percent(&self) -> Option<f64> {
        let total = self.total_bytes.filter(|total| *total > 0)?;
        let raw = self.downloaded_bytes as f64 / total as f64 * 100.0;
        Some((raw.min(100.0) * 100.0).round() / 100.0)
    }
}

#[derive(Debug, Clone)]
enum ProgressChange {
    Updated { uuid: String, percent: Option<f64> },
    Cleared { uuid: String },
}

/// Process-wide map from episode uuid to download progress.
///
/// Writes replace the whole map (copy-on-write) so concurrent readers never
/// observe a partially updated map, and fetchers updating disjoint keys
/// never corrupt each other's entries.
#[derive(Clone)]
pub struct ProgressCache {
    map: Arc<RwLock<Arc<HashMap<String, ProgressSample>>>>,
    change_tx: broadcast::Sender<ProgressChange>,
}

impl ProgressCache {
    pub fn new() -> Self {
        let (change_tx, _) = broadcast::channel(256);
        Self {
            map: Arc::new(RwLock::new(Arc::new(HashMap::new()))),
            change_tx,
        }
    }

    /// Record a progress reading for an episode.
    ///
    /// Consecutive readings that round to the same percentage update the
    /// map but are not re-broadcast, so observers are not flooded with
    /// imperceptible deltas.
    pub fn update_progress(&self, uuid: &str, downloaded_bytes: u64, total_bytes: Option<u64>) {
        let sample = ProgressSample {
            downloaded_bytes,
            total_bytes,
        };
        let percent = sample.percent();

        let notify = {
            let mut map = self.map.write();
            let previous = map.get(uuid).copied();
            let mut next: HashMap<_, _> = (**map).clone();
            next.insert(uuid.to_string(), sample);
            *map = Arc::new(next);
            previous.map_or(true, |prev| prev.percent() != percent)
        };

        if notify {
            let _ = self.change_tx.send(ProgressChange::Updated {
                uuid: uuid.to_string(),
                percent,
            });
        }
    }

    /// Remove an episode's entry entirely. Distinct from 0% so observers
    /// can tell "not started / finished" from "just started".
    pub fn clear_progress(&self, uuid: &str) {
        let removed = {
            let mut map = self.map.write();
            if !map.contains_key(uuid) {
                return;
            }
            let mut next: HashMap<_, _> = (**map).clone();
            next.remove(uuid);
            *map = Arc::new(next);
            true
        };
        if removed {
            let _ = self.change_tx.send(ProgressChange::Cleared {
                uuid: uuid.to_string(),
            });
        }
    }

    /// Current percentage for an episode: `None` if untracked,
    /// `Some(None)` if tracked with an unknown total.
    pub fn percent(&self, uuid: &str) -> Option<Option<f64>> {
        self.map.read().get(uuid).map(ProgressSample::percent)
    }

    pub fn sample(&self, uuid: &str) -> Option<ProgressSample> {
        self.map.read().get(uuid).copied()
    }

    /// Live sequence of percentage values for one episode, ending when the
    /// entry is cleared. Begins with the current value if one is tracked.
    pub fn progress_stream(&self, uuid: &str) -> impl Stream<Item = Option<f64>> + Send + Unpin {
        let uuid = uuid.to_string();
        let current = self.percent(&uuid);
        let changes = BroadcastStream::new(self.change_tx.subscribe());

        let filtered = changes.filter_map(move |change| match change {
            Ok(ProgressChange::Updated {
                uuid: changed,
                percent,
            }) if changed == uuid => Some(Some(percent)),
            Ok(ProgressChange::Cleared { uuid: changed }) if changed == uuid => Some(None),
            Ok(_) => None,
            // Lagging observers skip samples rather than erroring out.
            Err(BroadcastStreamRecvError::Lagged(_)) => None,
        });

        let head = tokio_stream::iter(current.map(Some));
        Box::pin(
            head.chain(filtered)
                .take_while(|item| item.is_some())
                .filter_map(|item| item),
        )
    }
}

impl Default for ProgressCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_rounds_to_two_decimals() {
        let cache = ProgressCache::new();
        cache.update_progress("ep1", 1, Some(3));
        assert_eq!(cache.percent("ep1"), Some(Some(33.33)));
    }

    #[test]
    fn unknown_total_is_indeterminate() {
        let cache = ProgressCache::new();
        cache.update_progress("ep1", 1024, None);
        assert_eq!(cache.percent("ep1"), Some(None));
    }

    #[test]
    fn clear_removes_the_key_entirely() {
        let cache = ProgressCache::new();
        cache.update_progress("ep1", 0, Some(100));
        assert_eq!(cache.percent("ep1"), Some(Some(0.0)));
        cache.clear_progress("ep1");
        assert_eq!(cache.percent("ep1"), None);
    }

    #[test]
    fn updates_to_disjoint_keys_do_not_interfere() {
        let cache = ProgressCache::new();
        cache.update_progress("ep1", 50, Some(100));
        cache.update_progress("ep2", 25, Some(100));
        assert_eq!(cache.percent("ep1"), Some(Some(50.0)));
        assert_eq!(cache.percent("ep2"), Some(Some(25.0)));
    }

    #[tokio::test]
    async fn stream_is_monotonic_and_ends_at_one_hundred() {
        let cache = ProgressCache::new();
        let mut stream = cache.progress_stream("ep1");

        for downloaded in [0u64, 250, 500, 750, 1000] {
            cache.update_progress("ep1", downloaded, Some(1000));
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            match stream.next().await {
                Some(Some(percent)) => seen.push(percent),
                other => panic!("unexpected stream item: {other:?}"),
            }
        }
        assert_eq!(seen, vec![0.0, 25.0, 50.0, 75.0, 100.0]);
        let mut previous = -1.0;
        for percent in seen {
            assert!(percent >= previous);
            previous = percent;
        }
    }

    #[tokio::test]
    async fn identical_percentages_are_not_rebroadcast() {
        let cache = ProgressCache::new();
        let mut stream = cache.progress_stream("ep1");

        cache.update_progress("ep1", 100, Some(1000));
        // Rounds to the same 10.0, suppressed.
        cache.update_progress("ep1", 100, Some(1000));
        cache.update_progress("ep1", 200, Some(1000));

        assert_eq!(stream.next().await, Some(Some(10.0)));
        assert_eq!(stream.next().await, Some(Some(20.0)));
    }
}
