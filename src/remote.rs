//! Remote block-storage service seam
//!
//! These traits describe the slice of the librados/librbd API the backend
//! needs. The production implementation lives in [`crate::rbd`] (behind the
//! `rbd` feature); [`crate::mock`] provides an in-memory stand-in.
//!
//! Raw calls report failure the way librbd does, as a negative errno. Giving
//! those codes meaning (which open step failed, whether a submission was
//! rejected) is the job of [`crate::session`] and [`crate::dispatch`].

use std::path::Path;

use crate::completion::CompletionContext;
use crate::window::IoSegment;

/// Negative-errno result of a raw remote call.
pub type RawResult<T> = std::result::Result<T, i32>;

// =============================================================================
// Session Steps
// =============================================================================

/// Opens the cluster, pool and image that make up a session.
///
/// Each acquired resource releases itself on drop, so a partially opened
/// session unwinds in reverse acquisition order simply by going out of scope.
pub trait Connector {
    /// Cluster handle; shuts the connection down on drop
    type Cluster: Send + Sync;

    /// I/O context for one pool; destroyed on drop
    type IoCtx: Send + Sync;

    /// Open image; closed on drop
    type Image: AioImage;

    fn create_cluster(&self, cluster_name: &str, user: &str, flags: u64) -> RawResult<Self::Cluster>;

    fn read_conf_file(&self, cluster: &mut Self::Cluster, path: &Path) -> RawResult<()>;

    fn set_conf(&self, cluster: &mut Self::Cluster, key: &str, value: &str) -> RawResult<()>;

    fn connect(&self, cluster: &mut Self::Cluster) -> RawResult<()>;

    fn create_ioctx(&self, cluster: &Self::Cluster, pool: &str) -> RawResult<Self::IoCtx>;

    fn open_image(
        &self,
        ioctx: &Self::IoCtx,
        image: &str,
        snapshot: Option<&str>,
    ) -> RawResult<Self::Image>;
}

// =============================================================================
// Asynchronous I/O
// =============================================================================

/// Operation parameters for [`AioImage::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioOp {
    /// Vectored write of the context's segments at `offset`
    Writev { offset: u64 },

    /// Vectored read into the context's segments at `offset`
    Readv { offset: u64 },

    Flush,

    Discard { offset: u64, len: u64 },

    WriteZeroes { offset: u64, len: u64 },
}

/// A submission the remote service refused; the handle comes back unused.
#[derive(Debug)]
pub struct Rejected<C> {
    /// Negative errno returned by the service
    pub code: i32,

    /// The completion handle, never armed
    pub completion: C,
}

/// An image supporting callback-driven asynchronous I/O.
///
/// Once [`submit`](AioImage::submit) accepts an operation, the service must
/// invoke [`crate::completion::finish`] with the bound context exactly once,
/// from whatever thread it likes, after releasing its own handle.
pub trait AioImage: Send + Sync {
    type Completion: AioCompletion;

    /// Whether the image can zero-fill natively.
    fn supports_write_zeroes(&self) -> bool;

    /// Bind `ctx` to a new completion handle. On failure the context is
    /// handed back together with the service's error code.
    fn create_completion(
        &self,
        ctx: Box<CompletionContext>,
    ) -> std::result::Result<Self::Completion, (i32, Box<CompletionContext>)>;

    /// Submit `op` against `completion`. Read and write take their segment
    /// list from the bound context.
    fn submit(&self, op: AioOp, completion: Self::Completion) -> std::result::Result<(), Rejected<Self::Completion>>;
}

/// A completion handle that has not been armed yet.
pub trait AioCompletion: Send {
    /// The bound context. Valid until the handle is submitted.
    fn context(&self) -> &CompletionContext;

    /// Segments of the bound context, in submission order.
    fn segments(&self) -> &[IoSegment] {
        self.context().segments()
    }

    /// Release the handle after a rejected submission and reclaim the context.
    /// The bridge is never invoked for an abandoned handle.
    fn abandon(self) -> Box<CompletionContext>;
}
