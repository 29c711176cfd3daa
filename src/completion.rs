//! Completion contexts, the completion bridge, and completion channels
//!
//! Every dispatched request owns exactly one heap-allocated
//! [`CompletionContext`]. The dispatcher moves it into the remote completion
//! handle; the remote service later calls [`finish`] on one of its own
//! threads, which consumes the context and posts a single [`Completion`] to
//! the originating queue's [`CompletionSink`].
//!
//! # Lifecycle
//!
//! ```text
//!  submitting thread                      remote callback thread
//!  ─────────────────                      ──────────────────────
//!  CompletionContext::allocate
//!        │ Box moved into handle
//!        ▼
//!  AioImage::create_completion ──────▶  (handle in flight)
//!  AioImage::submit                             │
//!        │                                      ▼
//!     return                              finish(ctx, raw)
//!                                           normalize
//!                                           drop context
//!                                           post_completion ──▶ front end
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::queue::Queue;
use crate::request::{IoKind, Request};
use crate::window::IoSegment;

/// `-EIO`, reported for a zero-byte short transfer.
const NEG_EIO: i64 = -5;

// =============================================================================
// Completion Record
// =============================================================================

/// A normalized completion as seen by the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Correlation token copied from the request
    pub token: u64,

    /// `0` on success, otherwise a negative errno or a short byte count
    pub result: i64,
}

impl Completion {
    pub fn new(token: u64, result: i64) -> Self {
        Self { token, result }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.result == 0
    }
}

// =============================================================================
// Completion Sink
// =============================================================================

/// Destination for normalized completions.
///
/// `post_completion` is called from the remote service's callback threads,
/// possibly several at once, so implementations must be multi-producer safe.
///
/// Implementations must not panic. Those threads belong to the remote
/// service; a panic there is caught and logged by [`finish_on_callback`], and
/// the completion is lost.
pub trait CompletionSink: Send + Sync {
    fn post_completion(&self, token: u64, result: i64);
}

impl CompletionSink for Sender<Completion> {
    fn post_completion(&self, token: u64, result: i64) {
        if self.send(Completion::new(token, result)).is_err() {
            warn!(token, result, "completion receiver dropped, discarding completion");
        }
    }
}

impl CompletionSink for tokio::sync::mpsc::UnboundedSender<Completion> {
    fn post_completion(&self, token: u64, result: i64) {
        if self.send(Completion::new(token, result)).is_err() {
            warn!(token, result, "completion receiver dropped, discarding completion");
        }
    }
}

/// Unbounded multi-producer completion mailbox backed by a crossbeam channel.
///
/// The queue keeps both ends; the front end drains it with [`recv`],
/// [`recv_timeout`] or [`drain`].
///
/// [`recv`]: CompletionQueue::recv
/// [`recv_timeout`]: CompletionQueue::recv_timeout
/// [`drain`]: CompletionQueue::drain
#[derive(Debug, Clone)]
pub struct CompletionQueue {
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    /// Block until a completion arrives.
    pub fn recv(&self) -> Option<Completion> {
        self.rx.recv().ok()
    }

    /// Wait up to `timeout` for a completion.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Completion> {
        match self.rx.recv_timeout(timeout) {
            Ok(c) => Some(c),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }

    /// Take every completion currently queued.
    pub fn drain(&self) -> Vec<Completion> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl CompletionSink for CompletionQueue {
    fn post_completion(&self, token: u64, result: i64) {
        self.tx.post_completion(token, result);
    }
}

// =============================================================================
// Completion Context
// =============================================================================

/// Per-request record carried through the remote service.
///
/// Created by the dispatcher, owned by the in-flight operation, destroyed by
/// [`finish`] (or reclaimed by the dispatcher when setup or submission fails).
#[derive(Debug)]
pub struct CompletionContext {
    kind: IoKind,
    queue: Arc<Queue>,
    token: u64,
    len: u32,
    segments: Vec<IoSegment>,
}

impl CompletionContext {
    /// Allocate a context for `req`, reserving room for its translated
    /// segments when `kind` transfers data.
    pub fn allocate(kind: IoKind, queue: &Arc<Queue>, req: &Request) -> Result<Box<Self>> {
        let mut segments = Vec::new();
        if kind.transfers_data() {
            segments
                .try_reserve_exact(req.segments.len())
                .map_err(|_| Error::AllocationFailure {
                    segments: req.segments.len(),
                })?;
        }

        Ok(Box::new(Self {
            kind,
            queue: Arc::clone(queue),
            token: req.token,
            len: req.len,
            segments,
        }))
    }

    /// Fill the segment list by translating `req` against the queue's window.
    pub fn translate(&mut self, req: &Request) -> Result<()> {
        self.queue.window().translate_into(&req.segments, &mut self.segments)
    }

    #[inline]
    pub fn kind(&self) -> IoKind {
        self.kind
    }

    #[inline]
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Expected transfer length in bytes.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn segments(&self) -> &[IoSegment] {
        &self.segments
    }

    #[inline]
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }
}

// =============================================================================
// Completion Bridge
// =============================================================================

/// Fold a raw remote result into the front end's completion convention.
///
/// Read and write succeed only on an exact-length transfer; any other count is
/// passed through as the failure code, except a zero-byte transfer, which
/// becomes `-EIO` so it can never be mistaken for success. Flush, discard and
/// write-zeroes pass the raw code through.
pub fn normalize(kind: IoKind, expected_len: u32, raw: i64) -> i64 {
    match kind {
        IoKind::Write | IoKind::Read => {
            if raw == i64::from(expected_len) {
                0
            } else if raw == 0 {
                NEG_EIO
            } else {
                raw
            }
        }
        IoKind::Flush | IoKind::Discard | IoKind::WriteZeroes => raw,
    }
}

/// Completion bridge: invoked once per request on the remote service's thread
/// after the completion handle has yielded `raw` and been released.
///
/// The context is dropped before the completion is posted, and the post is
/// the last thing that happens.
pub fn finish(ctx: Box<CompletionContext>, raw: i64) {
    let CompletionContext {
        kind,
        queue,
        token,
        len,
        segments,
    } = *ctx;
    drop(segments);

    let result = normalize(kind, len, raw);
    debug!(queue = queue.id(), token, %kind, raw, result, "aio finished");

    queue.stats().record_completion(kind, len, raw, result);
    let sink = Arc::clone(queue.sink());
    drop(queue);

    sink.post_completion(token, result);
}

/// [`finish`] for foreign callback threads. A panic is logged and swallowed
/// so it never unwinds into the remote service's code.
pub(crate) fn finish_on_callback(ctx: Box<CompletionContext>, raw: i64) {
    let token = ctx.token();
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| finish(ctx, raw))) {
        let msg = panic
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("non-string payload");
        error!(token, raw, "Completion sink panicked: {}", msg);
    }
}
