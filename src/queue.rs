//! Front-end queue handle and per-queue I/O statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::completion::CompletionSink;
use crate::request::IoKind;
use crate::window::ShmWindow;

// =============================================================================
// Queue
// =============================================================================

/// One front-end device queue as seen by the dispatcher.
///
/// Couples the queue's shared memory window with the completion channel its
/// requests report to. Completion contexts hold an `Arc<Queue>` back-reference
/// until the bridge posts.
pub struct Queue {
    id: u16,
    window: ShmWindow,
    sink: Arc<dyn CompletionSink>,
    stats: QueueStats,
}

impl Queue {
    pub fn new(id: u16, window: ShmWindow, sink: Arc<dyn CompletionSink>) -> Self {
        Self {
            id,
            window,
            sink,
            stats: QueueStats::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[inline]
    pub fn window(&self) -> &ShmWindow {
        &self.window
    }

    #[inline]
    pub fn sink(&self) -> &Arc<dyn CompletionSink> {
        &self.sink
    }

    #[inline]
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Post a completion directly to this queue's channel.
    pub fn post(&self, token: u64, result: i64) {
        self.sink.post_completion(token, result);
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("window", &self.window)
            .field("in_flight", &self.stats.in_flight())
            .finish()
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// I/O statistics for one queue.
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Requests accepted by the remote service
    pub submitted: AtomicU64,

    /// Completions posted
    pub completed: AtomicU64,

    /// Requests that failed synchronously (nothing posted)
    pub sync_failures: AtomicU64,

    /// Completions posted with a non-zero result
    pub async_failures: AtomicU64,

    /// Read/write completions whose byte count did not match the request
    pub short_transfers: AtomicU64,

    /// Bytes read by successful reads
    pub bytes_read: AtomicU64,

    /// Bytes written by successful writes
    pub bytes_written: AtomicU64,
}

impl QueueStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request handed to the remote service. Called before the
    /// submission so a fast completion never sees a negative in-flight count.
    pub fn record_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo [`record_submit`](Self::record_submit) for a rejected submission.
    pub fn record_rejected(&self) {
        self.submitted.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a request rejected before any completion could be posted.
    pub fn record_sync_failure(&self) {
        self.sync_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completion about to be posted.
    pub fn record_completion(&self, kind: IoKind, len: u32, raw: i64, result: i64) {
        if result == 0 {
            match kind {
                IoKind::Read => {
                    self.bytes_read.fetch_add(u64::from(len), Ordering::Relaxed);
                }
                IoKind::Write => {
                    self.bytes_written.fetch_add(u64::from(len), Ordering::Relaxed);
                }
                IoKind::Flush | IoKind::Discard | IoKind::WriteZeroes => {}
            }
        } else {
            self.async_failures.fetch_add(1, Ordering::Relaxed);
            if kind.transfers_data() && raw >= 0 {
                self.short_transfers.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.completed.fetch_add(1, Ordering::Release);
    }

    /// Requests submitted but not yet completed.
    pub fn in_flight(&self) -> u64 {
        let completed = self.completed.load(Ordering::Acquire);
        self.submitted
            .load(Ordering::Relaxed)
            .saturating_sub(completed)
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            sync_failures: self.sync_failures.load(Ordering::Relaxed),
            async_failures: self.async_failures.load(Ordering::Relaxed),
            short_transfers: self.short_transfers.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }

    /// Reset all statistics.
    pub fn reset(&self) {
        self.submitted.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.sync_failures.store(0, Ordering::Relaxed);
        self.async_failures.store(0, Ordering::Relaxed);
        self.short_transfers.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
    }
}

/// Serializable copy of [`QueueStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub sync_failures: u64,
    pub async_failures: u64,
    pub short_transfers: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl QueueStatsSnapshot {
    pub fn in_flight(&self) -> u64 {
        self.submitted.saturating_sub(self.completed)
    }

    /// Sum two snapshots, for backend-wide totals.
    pub fn merge(self, other: Self) -> Self {
        Self {
            submitted: self.submitted + other.submitted,
            completed: self.completed + other.completed,
            sync_failures: self.sync_failures + other.sync_failures,
            async_failures: self.async_failures + other.async_failures,
            short_transfers: self.short_transfers + other.short_transfers,
            bytes_read: self.bytes_read + other.bytes_read,
            bytes_written: self.bytes_written + other.bytes_written,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_stats() {
        let stats = QueueStats::new();

        stats.record_submit();
        stats.record_submit();
        stats.record_submit();
        stats.record_completion(IoKind::Write, 4096, 4096, 0);
        stats.record_completion(IoKind::Read, 4096, 2048, 2048);

        let snap = stats.snapshot();
        assert_eq!(snap.submitted, 3);
        assert_eq!(snap.completed, 2);
        assert_eq!(snap.bytes_written, 4096);
        assert_eq!(snap.bytes_read, 0);
        assert_eq!(snap.async_failures, 1);
        assert_eq!(snap.short_transfers, 1);
        assert_eq!(stats.in_flight(), 1);
    }

    #[test]
    fn test_remote_failure_is_not_short_transfer() {
        let stats = QueueStats::new();
        stats.record_submit();
        stats.record_completion(IoKind::Read, 4096, -5, -5);
        stats.record_completion(IoKind::Discard, 8192, -5, -5);

        let snap = stats.snapshot();
        assert_eq!(snap.async_failures, 2);
        assert_eq!(snap.short_transfers, 0);
    }

    #[test]
    fn test_snapshot_merge_and_reset() {
        let stats = QueueStats::new();
        stats.record_submit();
        stats.record_sync_failure();
        let merged = stats.snapshot().merge(stats.snapshot());
        assert_eq!(merged.submitted, 2);
        assert_eq!(merged.sync_failures, 2);

        stats.reset();
        assert_eq!(stats.snapshot(), QueueStatsSnapshot::default());
    }
}
