//! Per-file progress tracking and simulated progress animations.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Animation ceiling while the server assembles a chunked upload.
pub const ASSEMBLY_CEILING: f64 = 99.0;

/// Animation ceiling while a single-request upload is in flight.
pub const SINGLE_UPLOAD_CEILING: f64 = 90.0;

/// Default animation tick.
pub const DEFAULT_TICK: Duration = Duration::from_millis(200);

/// Share of the remaining distance to the ceiling covered per tick.
const ANIMATION_STEP: f64 = 0.1;

/// Closest an animation gets to its ceiling.
const CEILING_GAP: f64 = 0.01;

/// Client-side state of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Pending,
    Uploading,
    /// Chunks are in; the server is assembling.
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemProgress {
    pub state: UploadState,
    /// 0.0 to 100.0.
    pub percent: f64,
    pub error: Option<String>,
}

/// A change to one file's progress.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub filename: String,
    pub progress: ItemProgress,
}

struct Inner {
    items: Mutex<HashMap<String, ItemProgress>>,
    animations: Mutex<HashMap<String, JoinHandle<()>>>,
    tick: Duration,
    events: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

/// Tracks every queued file by name.
///
/// Animations are keyed by filename too; starting a new one, finishing,
/// failing or removing the file aborts the previous timer.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProgressTracker {
    pub fn new(tick: Duration) -> Self {
        Self::build(tick, None)
    }

    /// A tracker that also publishes every change.
    pub fn with_events(tick: Duration) -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::build(tick, Some(tx)), rx)
    }

    fn build(tick: Duration, events: Option<mpsc::UnboundedSender<ProgressEvent>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(HashMap::new()),
                animations: Mutex::new(HashMap::new()),
                tick,
                events,
            }),
        }
    }

    pub fn get(&self, filename: &str) -> Option<ItemProgress> {
        lock(&self.inner.items).get(filename).cloned()
    }

    /// Number of animation timers still registered.
    pub fn running_animations(&self) -> usize {
        lock(&self.inner.animations)
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    fn update(&self, filename: &str, f: impl FnOnce(&mut ItemProgress)) {
        update_item(&self.inner, filename, f);
    }

    pub fn set_pending(&self, filename: &str) {
        self.update(filename, |item| {
            item.state = UploadState::Pending;
            item.percent = 0.0;
            item.error = None;
        });
    }

    pub fn set_state(&self, filename: &str, state: UploadState) {
        self.update(filename, |item| item.state = state);
    }

    /// Set measured progress, e.g. after a chunk was acknowledged.
    pub fn set_percent(&self, filename: &str, percent: f64) {
        self.update(filename, |item| item.percent = percent.clamp(0.0, 100.0));
    }

    /// Climb toward `ceiling` without ever reaching it.
    pub fn start_animation(&self, filename: &str, ceiling: f64) {
        self.stop_animation(filename);

        let inner = self.inner.clone();
        let name = filename.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.tick);
            // The first tick of an interval fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                update_item(&inner, &name, |item| {
                    item.percent = animation_step(item.percent, ceiling);
                });
            }
        });
        lock(&self.inner.animations).insert(filename.to_string(), handle);
    }

    pub fn stop_animation(&self, filename: &str) {
        if let Some(handle) = lock(&self.inner.animations).remove(filename) {
            handle.abort();
        }
    }

    pub fn complete(&self, filename: &str) {
        self.stop_animation(filename);
        self.update(filename, |item| {
            item.state = UploadState::Completed;
            item.percent = 100.0;
            item.error = None;
        });
    }

    pub fn fail(&self, filename: &str, error: &str) {
        self.stop_animation(filename);
        self.update(filename, |item| {
            item.state = UploadState::Failed;
            item.error = Some(error.to_string());
        });
    }

    /// Forget a file entirely.
    pub fn remove(&self, filename: &str) {
        self.stop_animation(filename);
        lock(&self.inner.items).remove(filename);
    }
}

fn update_item(inner: &Inner, filename: &str, f: impl FnOnce(&mut ItemProgress)) {
    let snapshot = {
        let mut items = lock(&inner.items);
        let item = items
            .entry(filename.to_string())
            .or_insert_with(|| ItemProgress {
                state: UploadState::Pending,
                percent: 0.0,
                error: None,
            });
        f(item);
        item.clone()
    };
    if let Some(events) = &inner.events {
        let _ = events.send(ProgressEvent {
            filename: filename.to_string(),
            progress: snapshot,
        });
    }
}

fn animation_step(current: f64, ceiling: f64) -> f64 {
    let limit = ceiling - CEILING_GAP;
    if current >= limit {
        return current;
    }
    (current + (ceiling - current) * ANIMATION_STEP).min(limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_animation_never_reaches_ceiling() {
        let mut percent = 0.0;
        for _ in 0..10_000 {
            let next = animation_step(percent, ASSEMBLY_CEILING);
            assert!(next >= percent);
            percent = next;
        }
        assert!(percent < ASSEMBLY_CEILING);
        assert!(percent > 98.9);
    }

    #[test]
    fn test_animation_does_not_lower_measured_progress() {
        assert_eq!(animation_step(99.5, SINGLE_UPLOAD_CEILING), 99.5);
    }

    #[tokio::test]
    async fn test_animation_climbs_and_stops_on_completion() {
        let tracker = ProgressTracker::new(Duration::from_millis(5));
        tracker.set_state("a.mp4", UploadState::Processing);
        tracker.start_animation("a.mp4", ASSEMBLY_CEILING);
        assert_eq!(tracker.running_animations(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let item = tracker.get("a.mp4").unwrap();
        assert!(item.percent > 0.0);
        assert!(item.percent < ASSEMBLY_CEILING);

        tracker.complete("a.mp4");
        assert_eq!(tracker.running_animations(), 0);
        let item = tracker.get("a.mp4").unwrap();
        assert_eq!(item.state, UploadState::Completed);
        assert_eq!(item.percent, 100.0);

        // No timer left to move it again.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tracker.get("a.mp4").unwrap().percent, 100.0);
    }

    #[tokio::test]
    async fn test_failure_and_removal_stop_animations() {
        let tracker = ProgressTracker::new(Duration::from_millis(5));
        tracker.start_animation("a.mp4", SINGLE_UPLOAD_CEILING);
        tracker.start_animation("b.mp4", SINGLE_UPLOAD_CEILING);
        assert_eq!(tracker.running_animations(), 2);

        tracker.fail("a.mp4", "boom");
        assert_eq!(tracker.get("a.mp4").unwrap().state, UploadState::Failed);
        tracker.remove("b.mp4");
        assert!(tracker.get("b.mp4").is_none());
        assert_eq!(tracker.running_animations(), 0);
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let (tracker, mut events) = ProgressTracker::with_events(DEFAULT_TICK);
        tracker.set_pending("a.mp4");
        tracker.set_percent("a.mp4", 150.0);

        let first = events.recv().await.unwrap();
        assert_eq!(first.progress.state, UploadState::Pending);
        let second = events.recv().await.unwrap();
        assert_eq!(second.filename, "a.mp4");
        assert_eq!(second.progress.percent, 100.0);
    }
}
