//! Request dispatcher
//!
//! One entry point per operation kind. Each allocates a completion context,
//! binds it to a remote completion handle, submits, and returns without
//! waiting. The outcome of a successfully submitted request arrives later,
//! exactly once, through the queue's completion channel; a failed call posts
//! nothing and its error is the only signal.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::completion::CompletionContext;
use crate::error::{Error, Result};
use crate::queue::Queue;
use crate::remote::{AioCompletion, AioImage, AioOp, Rejected};
use crate::request::{IoKind, Request};

/// Dispatches requests against an open image.
#[derive(Debug)]
pub struct Dispatcher<'a, I: AioImage> {
    image: &'a I,
}

impl<'a, I: AioImage> Dispatcher<'a, I> {
    pub fn new(image: &'a I) -> Self {
        Self { image }
    }

    /// Vectored write of the request's segments at `req.offset`.
    pub fn submit_write(&self, queue: &Arc<Queue>, req: &Request) -> Result<()> {
        self.dispatch(IoKind::Write, queue, req, AioOp::Writev { offset: req.offset })
    }

    /// Vectored read into the request's segments at `req.offset`.
    pub fn submit_read(&self, queue: &Arc<Queue>, req: &Request) -> Result<()> {
        self.dispatch(IoKind::Read, queue, req, AioOp::Readv { offset: req.offset })
    }

    pub fn submit_flush(&self, queue: &Arc<Queue>, req: &Request) -> Result<()> {
        self.dispatch(IoKind::Flush, queue, req, AioOp::Flush)
    }

    pub fn submit_discard(&self, queue: &Arc<Queue>, req: &Request) -> Result<()> {
        let op = AioOp::Discard {
            offset: req.offset,
            len: u64::from(req.len),
        };
        self.dispatch(IoKind::Discard, queue, req, op)
    }

    /// Zero-fill `req.len` bytes at `req.offset`.
    ///
    /// Fails immediately with [`Error::UnsupportedOperation`] when the image
    /// has no native zero-fill; no context is created in that case.
    pub fn submit_write_zero(&self, queue: &Arc<Queue>, req: &Request) -> Result<()> {
        if !self.image.supports_write_zeroes() {
            error!(queue = queue.id(), token = req.token, "write_zeros is not supported");
            queue.stats().record_sync_failure();
            return Err(Error::UnsupportedOperation {
                op: IoKind::WriteZeroes,
            });
        }

        let op = AioOp::WriteZeroes {
            offset: req.offset,
            len: u64::from(req.len),
        };
        self.dispatch(IoKind::WriteZeroes, queue, req, op)
    }

    /// Route by `req.kind`.
    pub fn submit(&self, queue: &Arc<Queue>, req: &Request) -> Result<()> {
        match req.kind {
            IoKind::Write => self.submit_write(queue, req),
            IoKind::Read => self.submit_read(queue, req),
            IoKind::Flush => self.submit_flush(queue, req),
            IoKind::Discard => self.submit_discard(queue, req),
            IoKind::WriteZeroes => self.submit_write_zero(queue, req),
        }
    }

    fn dispatch(&self, kind: IoKind, queue: &Arc<Queue>, req: &Request, op: AioOp) -> Result<()> {
        let result = self.try_dispatch(kind, queue, req, op);
        if result.is_err() {
            queue.stats().record_sync_failure();
        }
        result
    }

    fn try_dispatch(&self, kind: IoKind, queue: &Arc<Queue>, req: &Request, op: AioOp) -> Result<()> {
        let mut ctx = CompletionContext::allocate(kind, queue, req).map_err(|e| {
            error!(queue = queue.id(), token = req.token, "Could not allocate completion context: {}", e);
            e
        })?;

        if kind.transfers_data() {
            ctx.translate(req).map_err(|e| {
                warn!(queue = queue.id(), token = req.token, "rejecting {}: {}", kind, e);
                e
            })?;
        }

        let completion = self.image.create_completion(ctx).map_err(|(code, ctx)| {
            error!(queue = queue.id(), token = req.token, code, "create completion failed");
            drop(ctx);
            Error::CompletionSetupFailure { code }
        })?;

        debug!(
            queue = queue.id(),
            token = req.token,
            offset = req.offset,
            len = req.len,
            segments = completion.segments().len(),
            "{}",
            kind
        );

        // Counted before submission: the completion may fire on another
        // thread before submit() returns.
        queue.stats().record_submit();
        match self.image.submit(op, completion) {
            Ok(()) => Ok(()),
            Err(Rejected { code, completion }) => {
                queue.stats().record_rejected();
                drop(completion.abandon());
                warn!(queue = queue.id(), token = req.token, code, "{} submission rejected", kind);
                Err(Error::SubmissionFailure { op: kind, code })
            }
        }
    }
}
