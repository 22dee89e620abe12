//! Progress tracking and reporting for download operations

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Progress callback for download operations
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Events emitted during download operations
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Human-readable status line
    Status {
        text: String,
    },
    /// Overall batch progress in `[0.0, 1.0)`
    Fraction {
        value: f64,
    },
    RetryAttempt {
        url: String,
        attempt: u32,
        max_attempts: u32,
    },
    ArtifactComplete {
        name: String,
        bytes: u64,
        already_present: bool,
    },
    Error {
        url: String,
        error: String,
    },
}

/// Receiver of progress updates
///
/// Implementations must return quickly: the downloader calls into the sink
/// from its worker tasks and never waits for it to catch up.
pub trait ProgressSink: Send + Sync {
    fn on_status(&self, _text: &str) {}
    fn on_fraction(&self, _fraction: f64) {}
    fn on_retry_attempt(&self, _url: &str, _attempt: u32, _max_attempts: u32) {}
    fn on_artifact_complete(&self, _name: &str, _bytes: u64, _already_present: bool) {}
    fn on_error(&self, _url: &str, _error: &str) {}
}

/// Extension trait to convert a ProgressSink into a ProgressCallback
pub trait IntoProgressCallback {
    fn into_callback(self) -> ProgressCallback;
}

impl<T: ProgressSink + 'static> IntoProgressCallback for T {
    fn into_callback(self) -> ProgressCallback {
        Arc::new(move |event| match event {
            ProgressEvent::Status { text } => self.on_status(&text),
            ProgressEvent::Fraction { value } => self.on_fraction(value),
            ProgressEvent::RetryAttempt { url, attempt, max_attempts } => {
                self.on_retry_attempt(&url, attempt, max_attempts);
            }
            ProgressEvent::ArtifactComplete { name, bytes, already_present } => {
                self.on_artifact_complete(&name, bytes, already_present);
            }
            ProgressEvent::Error { url, error } => self.on_error(&url, &error),
        })
    }
}

/// Sink that forwards every event to `tracing`
#[derive(Debug, Default)]
pub struct TracingProgressSink {
    pub verbose: bool,
}

impl TracingProgressSink {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProgressSink for TracingProgressSink {
    fn on_status(&self, text: &str) {
        if self.verbose {
            info!("{}", text);
        }
    }

    fn on_fraction(&self, fraction: f64) {
        if self.verbose {
            debug!("Progress: {:.1}%", fraction * 100.0);
        }
    }

    fn on_retry_attempt(&self, url: &str, attempt: u32, max_attempts: u32) {
        warn!("Retry {}/{} for: {}", attempt, max_attempts, url);
    }

    fn on_artifact_complete(&self, name: &str, bytes: u64, already_present: bool) {
        if already_present {
            info!("Up to date: {} ({} bytes)", name, bytes);
        } else {
            info!("Downloaded: {} ({} bytes)", name, bytes);
        }
    }

    fn on_error(&self, url: &str, error: &str) {
        warn!("Error downloading {}: {}", url, error);
    }
}

/// Null progress sink that does nothing
#[derive(Debug, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {}

/// Composite sink that forwards events to multiple sinks
#[derive(Default)]
pub struct CompositeProgressSink {
    sinks: Vec<Box<dyn ProgressSink>>,
}

impl std::fmt::Debug for CompositeProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeProgressSink")
            .field("sinks_count", &self.sinks.len())
            .finish()
    }
}

impl CompositeProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink<S: ProgressSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl ProgressSink for CompositeProgressSink {
    fn on_status(&self, text: &str) {
        for sink in &self.sinks {
            sink.on_status(text);
        }
    }

    fn on_fraction(&self, fraction: f64) {
        for sink in &self.sinks {
            sink.on_fraction(fraction);
        }
    }

    fn on_retry_attempt(&self, url: &str, attempt: u32, max_attempts: u32) {
        for sink in &self.sinks {
            sink.on_retry_attempt(url, attempt, max_attempts);
        }
    }

    fn on_artifact_complete(&self, name: &str, bytes: u64, already_present: bool) {
        for sink in &self.sinks {
            sink.on_artifact_complete(name, bytes, already_present);
        }
    }

    fn on_error(&self, url: &str, error: &str) {
        for sink in &self.sinks {
            sink.on_error(url, error);
        }
    }
}

/// Batch-wide progress state shared by all download tasks of one batch
///
/// Every started and every finished artifact adds one tick. The reported
/// fraction is `ticks / (2 * expected + offset)`, so it only grows and stays
/// below 1.0 even when files short-circuit as already present.
pub struct ProgressTracker {
    ticks: AtomicU64,
    last_reported: Mutex<u64>,
    expected: Option<u64>,
    offset: u64,
    callback: Option<ProgressCallback>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("ticks", &self.ticks.load(Ordering::Relaxed))
            .field("expected", &self.expected)
            .field("offset", &self.offset)
            .finish()
    }
}

impl ProgressTracker {
    pub fn new(expected: Option<u64>, offset: u64, callback: Option<ProgressCallback>) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            last_reported: Mutex::new(0),
            expected,
            offset,
            callback,
        }
    }

    pub fn detached() -> Self {
        Self::new(None, 0, None)
    }

    pub fn fraction_for(ticks: u64, expected: u64, offset: u64) -> f64 {
        let denominator = expected.saturating_mul(2).saturating_add(offset).max(1);
        let fraction = ticks as f64 / denominator as f64;
        fraction.min(1.0 - f64::EPSILON)
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(ref callback) = self.callback {
            callback(event);
        }
    }

    pub fn status(&self, text: impl Into<String>) {
        self.emit(ProgressEvent::Status { text: text.into() });
    }

    /// Advance by one tick and report the new fraction if the expected count is known
    pub fn tick(&self) -> Option<f64> {
        let ticks = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        let expected = self.expected?;
        let fraction = Self::fraction_for(ticks, expected, self.offset);

        // Ticks can race each other to the sink; only ever move forward.
        let mut last = self.last_reported.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if ticks > *last {
            *last = ticks;
            self.emit(ProgressEvent::Fraction { value: fraction });
        }
        Some(fraction)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture() -> (ProgressCallback, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback: ProgressCallback = Arc::new(move |event| sink.lock().unwrap().push(event));
        (callback, events)
    }

    #[test]
    fn test_fraction_never_reaches_one() {
        // Every artifact ticks twice: once on start, once on finish.
        let expected = 3;
        let fraction = ProgressTracker::fraction_for(2 * expected, expected, 1000);
        assert!(fraction < 1.0);
        assert!(ProgressTracker::fraction_for(10_000, 1, 0) < 1.0);
    }

    #[test]
    fn test_tracker_reports_monotonic_fractions() {
        let (callback, events) = capture();
        let tracker = ProgressTracker::new(Some(4), 10, Some(callback));

        for _ in 0..8 {
            tracker.tick();
        }

        let fractions: Vec<f64> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::Fraction { value } => Some(*value),
                _ => None,
            })
            .collect();

        assert_eq!(fractions.len(), 8);
        assert!(fractions.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(fractions.iter().all(|value| *value < 1.0));
    }

    #[test]
    fn test_tracker_without_expected_count_reports_no_fraction() {
        let (callback, events) = capture();
        let tracker = ProgressTracker::new(None, 1000, Some(callback));

        assert_eq!(tracker.tick(), None);
        tracker.status("Downloading compiled outputs");

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ProgressEvent::Status { text } if text == "Downloading compiled outputs"));
        assert_eq!(tracker.ticks(), 1);
    }

    #[test]
    fn test_sink_into_callback_dispatches_events() {
        #[derive(Default)]
        struct Recording(Arc<Mutex<Vec<String>>>);

        impl ProgressSink for Recording {
            fn on_status(&self, text: &str) {
                self.0.lock().unwrap().push(format!("status:{text}"));
            }

            fn on_retry_attempt(&self, url: &str, attempt: u32, max_attempts: u32) {
                self.0.lock().unwrap().push(format!("retry:{url}:{attempt}/{max_attempts}"));
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let callback = Recording(seen.clone()).into_callback();

        callback(ProgressEvent::Status { text: "hello".to_string() });
        callback(ProgressEvent::RetryAttempt {
            url: "http://example.com".to_string(),
            attempt: 2,
            max_attempts: 3,
        });
        callback(ProgressEvent::Fraction { value: 0.5 });

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["status:hello".to_string(), "retry:http://example.com:2/3".to_string()]
        );
    }

    #[test]
    fn test_composite_progress_sink() {
        let composite = CompositeProgressSink::new()
            .add_sink(NullProgressSink)
            .add_sink(TracingProgressSink::new(false));

        composite.on_status("status");
        composite.on_error("http://example.com", "Test error");
        assert!(format!("{:?}", composite).contains("sinks_count: 2"));
    }
}
