//! Progress tracking for chunk evaluation.

use crate::core::view::ChunkId;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A progress update event.
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    /// Evaluation has started.
    Started { total_chunks: usize },
    /// A chunk reached the sink.
    ChunkCompleted {
        chunk: ChunkId,
        duration_ms: u64,
        index: usize,
        total: usize,
    },
    /// A chunk failed; `tolerated` chunks were replaced by nodata.
    ChunkFailed {
        chunk: ChunkId,
        message: String,
        tolerated: bool,
    },
    /// Overall progress percentage.
    Progress {
        percent: f32,
        elapsed_ms: u64,
        estimated_remaining_ms: Option<u64>,
    },
    /// Evaluation has finished, successfully or not.
    Completed {
        total_duration_ms: u64,
        chunks_processed: usize,
        chunks_failed: usize,
    },
    /// Cancellation was requested.
    Cancelled,
}

/// Callback type for progress updates.
pub type ProgressCallback = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Tracks evaluation progress and carries the cancellation flag.
///
/// Shared between the caller, the scheduler and its workers; [`cancel`]
/// may be called from any thread.
///
/// [`cancel`]: ProgressTracker::cancel
pub struct ProgressTracker {
    /// Number of chunks to evaluate.
    total_chunks: AtomicU64,
    /// Chunks delivered to the sink, including tolerated failures.
    completed_chunks: AtomicU64,
    /// Failed chunks.
    failed_chunks: AtomicU64,
    /// Whether evaluation is cancelled.
    cancelled: AtomicBool,
    /// Start time.
    start_time: parking_lot::Mutex<Option<Instant>>,
    /// Progress callback.
    callback: Option<ProgressCallback>,
    /// Chunk evaluation times for estimation.
    chunk_times: parking_lot::Mutex<Vec<u64>>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("total_chunks", &self.total())
            .field("completed_chunks", &self.completed())
            .field("failed_chunks", &self.failed())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl ProgressTracker {
    /// Create a new progress tracker.
    pub fn new() -> Self {
        Self {
            total_chunks: AtomicU64::new(0),
            completed_chunks: AtomicU64::new(0),
            failed_chunks: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            start_time: parking_lot::Mutex::new(None),
            callback: None,
            chunk_times: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Create a progress tracker wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Set a callback for progress updates.
    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Start tracking an evaluation of `total_chunks` chunks.
    ///
    /// Counters are reset; a pending cancellation is kept.
    pub fn start(&self, total_chunks: usize) {
        self.total_chunks.store(total_chunks as u64, Ordering::Relaxed);
        self.completed_chunks.store(0, Ordering::Relaxed);
        self.failed_chunks.store(0, Ordering::Relaxed);
        self.chunk_times.lock().clear();
        *self.start_time.lock() = Some(Instant::now());
        self.send_update(ProgressUpdate::Started { total_chunks });
    }

    /// Report that a chunk reached the sink.
    pub fn chunk_completed(&self, chunk: ChunkId, duration_ms: u64) {
        let completed = self.completed_chunks.fetch_add(1, Ordering::Relaxed) as usize + 1;
        self.chunk_times.lock().push(duration_ms);

        self.send_update(ProgressUpdate::ChunkCompleted {
            chunk,
            duration_ms,
            index: completed,
            total: self.total(),
        });
        self.send_progress_update();
    }

    /// Report a failed chunk.
    pub fn chunk_failed(&self, chunk: ChunkId, message: String, tolerated: bool) {
        self.failed_chunks.fetch_add(1, Ordering::Relaxed);
        self.send_update(ProgressUpdate::ChunkFailed {
            chunk,
            message,
            tolerated,
        });
    }

    /// Check if evaluation should stop submitting chunks.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::Relaxed) {
            self.send_update(ProgressUpdate::Cancelled);
        }
    }

    /// Complete tracking.
    pub fn complete(&self) {
        let duration = self.elapsed_ms();

        self.send_update(ProgressUpdate::Completed {
            total_duration_ms: duration,
            chunks_processed: self.completed(),
            chunks_failed: self.failed(),
        });
    }

    /// Number of chunks of the current evaluation.
    pub fn total(&self) -> usize {
        self.total_chunks.load(Ordering::Relaxed) as usize
    }

    /// Chunks delivered so far.
    pub fn completed(&self) -> usize {
        self.completed_chunks.load(Ordering::Relaxed) as usize
    }

    /// Chunks failed so far.
    pub fn failed(&self) -> usize {
        self.failed_chunks.load(Ordering::Relaxed) as usize
    }

    /// Get current progress percentage.
    pub fn progress_percent(&self) -> f32 {
        let total = self.total();
        if total == 0 {
            return 100.0;
        }
        (self.completed() as f32 / total as f32) * 100.0
    }

    /// Estimate remaining time in milliseconds.
    pub fn estimated_remaining_ms(&self) -> Option<u64> {
        let times = self.chunk_times.lock();
        if times.is_empty() {
            return None;
        }

        let avg_time: u64 = times.iter().sum::<u64>() / times.len() as u64;
        let remaining = self.total().saturating_sub(self.completed());
        Some(avg_time * remaining as u64)
    }

    /// Milliseconds since [`Self::start`].
    pub fn elapsed_ms(&self) -> u64 {
        let start = *self.start_time.lock();
        start.map(|t| t.elapsed().as_millis() as u64).unwrap_or(0)
    }

    fn send_update(&self, update: ProgressUpdate) {
        if let Some(ref callback) = self.callback {
            callback(update);
        }
    }

    fn send_progress_update(&self) {
        let elapsed = self.elapsed_ms();

        self.send_update(ProgressUpdate::Progress {
            percent: self.progress_percent(),
            elapsed_ms: elapsed,
            estimated_remaining_ms: self.estimated_remaining_ms(),
        });
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_progress_calculation() {
        let tracker = ProgressTracker::new();
        tracker.start(10);
        assert_eq!(tracker.progress_percent(), 0.0);

        for i in 0..5 {
            tracker.chunk_completed(ChunkId(i), 2);
        }
        assert_eq!(tracker.progress_percent(), 50.0);
        assert_eq!(tracker.estimated_remaining_ms(), Some(10));

        tracker.chunk_failed(ChunkId(7), "boom".to_string(), true);
        assert_eq!(tracker.failed(), 1);

        tracker.start(4);
        assert_eq!(tracker.completed(), 0);
        assert_eq!(tracker.failed(), 0);
    }

    #[test]
    fn test_cancellation() {
        let tracker = ProgressTracker::new();
        assert!(!tracker.is_cancelled());

        tracker.cancel();
        assert!(tracker.is_cancelled());
        tracker.start(3);
        assert!(tracker.is_cancelled());
    }

    #[test]
    fn test_callback_invoked() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let call_count_clone = call_count.clone();

        let tracker = ProgressTracker::new().with_callback(Box::new(move |_| {
            call_count_clone.fetch_add(1, Ordering::Relaxed);
        }));

        tracker.start(5);
        tracker.chunk_completed(ChunkId(0), 100);
        tracker.cancel();
        tracker.cancel();
        tracker.complete();

        // Started, ChunkCompleted, Progress, Cancelled (once), Completed
        assert_eq!(call_count.load(Ordering::Relaxed), 5);
    }
}
