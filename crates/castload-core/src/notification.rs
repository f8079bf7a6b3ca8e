//! Notification observer - throttled progress notifications
//!
//! Subscribes to the progress cache for one episode and renders a
//! user-visible progress notification through a pluggable sink. Pushes are
//! throttled to meaningful changes so the notification system sees roughly
//! twenty updates per download no matter how frequently bytes arrive.

use crate::progress::ProgressCache;
use castload_types::Episode;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::debug;

const NOTIFICATION_TITLE: &str = "Downloading episode";

/// Minimum movement, in percentage points, between pushed samples.
const MIN_PERCENT_STEP: f64 = 5.0;

/// Renders progress notifications. `percent` is `None` for indeterminate
/// progress.
pub trait NotificationSink: Send + Sync {
    fn show(&self, uuid: &str, title: &str, text: &str, percent: Option<f64>);
    fn update(&self, uuid: &str, title: &str, text: &str, percent: Option<f64>);
    fn clear(&self, uuid: &str);
}

/// No-op sink for hosts without a notification surface.
pub struct NullNotificationSink;

impl NotificationSink for NullNotificationSink {
    fn show(&self, _uuid: &str, _title: &str, _text: &str, _percent: Option<f64>) {}
    fn update(&self, _uuid: &str, _title: &str, _text: &str, _percent: Option<f64>) {}
    fn clear(&self, _uuid: &str) {}
}

/// Cancellable handle for one observation. Cancelling clears the
/// notification and stops the subscription.
pub struct NotificationHandle {
    uuid: String,
    sink: Arc<dyn NotificationSink>,
    task: JoinHandle<()>,
}

impl NotificationHandle {
    pub fn cancel(self) {
        self.task.abort();
        self.sink.clear(&self.uuid);
        debug!(episode = %self.uuid, "cleared download notification");
    }
}

#[derive(Clone)]
pub struct NotificationObserver {
    progress: ProgressCache,
    sink: Arc<dyn NotificationSink>,
}

impl NotificationObserver {
    pub fn new(progress: ProgressCache, sink: Arc<dyn NotificationSink>) -> Self {
        Self { progress, sink }
    }

    /// Start observing progress for an episode. `on_first` runs once, on
    /// the first qualifying sample, so the caller can promote the work to a
    /// foreground-visible state.
    pub fn observe(
        &self,
        episode: &Episode,
        on_first: impl FnOnce(&str) + Send + 'static,
    ) -> NotificationHandle {
        let uuid = episode.uuid.clone();
        let text = episode.title.clone();
        let sink = self.sink.clone();
        let mut stream = self.progress.progress_stream(&uuid);

        let task_uuid = uuid.clone();
        let task_sink = sink.clone();
        let task = tokio::spawn(async move {
            let mut last_pushed: Option<Option<f64>> = None;
            let mut on_first = Some(on_first);
            while let Some(percent) = stream.next().await {
                if !should_push(last_pushed, percent) {
                    continue;
                }
                last_pushed = Some(percent);
                match on_first.take() {
                    Some(callback) => {
                        task_sink.show(&task_uuid, NOTIFICATION_TITLE, &text, percent);
                        callback(&task_uuid);
                    }
                    None => task_sink.update(&task_uuid, NOTIFICATION_TITLE, &text, percent),
                }
            }
        });

        NotificationHandle { uuid, sink, task }
    }
}

/// Throttle policy: push on the first sample, when the percentage becomes
/// known for the first time, when progress first reaches 100, or when it
/// has moved at least [`MIN_PERCENT_STEP`] points since the last push.
fn should_push(last_pushed: Option<Option<f64>>, current: Option<f64>) -> bool {
    let last = match last_pushed {
        None => return true,
        Some(last) => last,
    };
    match (last, current) {
        (None, Some(_)) => true,
        (Some(previous), Some(now)) => {
            (now >= 100.0 && previous < 100.0) || (now - previous).abs() >= MIN_PERCENT_STEP
        }
        (_, None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        pushes: Mutex<Vec<(String, Option<f64>)>>,
        cleared: AtomicBool,
    }

    impl NotificationSink for RecordingSink {
        fn show(&self, _uuid: &str, _title: &str, _text: &str, percent: Option<f64>) {
            self.pushes.lock().push(("show".to_string(), percent));
        }

        fn update(&self, _uuid: &str, _title: &str, _text: &str, percent: Option<f64>) {
            self.pushes.lock().push(("update".to_string(), percent));
        }

        fn clear(&self, _uuid: &str) {
            self.cleared.store(true, Ordering::Release);
        }
    }

    fn episode() -> Episode {
        Episode::podcast_episode("ep1", "pod1", "Title", "https://host/a.mp3")
    }

    #[test]
    fn throttle_policy() {
        // First sample always pushes, known or not.
        assert!(should_push(None, None));
        assert!(should_push(None, Some(0.0)));
        // Percent becoming known pushes.
        assert!(should_push(Some(None), Some(1.0)));
        // Small movements are suppressed.
        assert!(!should_push(Some(Some(10.0)), Some(12.0)));
        assert!(should_push(Some(Some(10.0)), Some(15.0)));
        // Reaching 100 always pushes.
        assert!(should_push(Some(Some(97.0)), Some(100.0)));
        assert!(!should_push(Some(Some(100.0)), Some(100.0)));
    }

    #[tokio::test]
    async fn pushes_are_bounded_per_download() {
        let cache = ProgressCache::new();
        let sink = Arc::new(RecordingSink::default());
        let observer = NotificationObserver::new(cache.clone(), sink.clone());
        let handle = observer.observe(&episode(), |_| {});

        for downloaded in 0..=1000 {
            cache.update_progress("ep1", downloaded, Some(1000));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let pushes = sink.pushes.lock().clone();
        // 0, 5, 10, ..., 100
        assert!(!pushes.is_empty());
        assert!(pushes.len() <= 21, "got {} pushes", pushes.len());
        assert_eq!(pushes.first().map(|(kind, _)| kind.as_str()), Some("show"));
        assert_eq!(pushes.last().map(|(_, percent)| *percent), Some(Some(100.0)));

        handle.cancel();
    }

    #[tokio::test]
    async fn first_qualifying_sample_invokes_on_first() {
        let cache = ProgressCache::new();
        let sink = Arc::new(RecordingSink::default());
        let observer = NotificationObserver::new(cache.clone(), sink.clone());

        let promoted = Arc::new(AtomicBool::new(false));
        let flag = promoted.clone();
        let handle = observer.observe(&episode(), move |_| {
            flag.store(true, Ordering::Release);
        });

        cache.update_progress("ep1", 0, Some(100));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(promoted.load(Ordering::Acquire));
        handle.cancel();
    }

    #[tokio::test]
    async fn cancel_clears_the_notification() {
        let cache = ProgressCache::new();
        let sink = Arc::new(RecordingSink::default());
        let observer = NotificationObserver::new(cache.clone(), sink.clone());

        let handle = observer.observe(&episode(), |_| {});
        cache.update_progress("ep1", 10, Some(100));
        tokio::time::sleep(Duration::from_millis(50)).await;

        handle.cancel();
        assert!(sink.cleared.load(Ordering::Acquire));
    }
}
