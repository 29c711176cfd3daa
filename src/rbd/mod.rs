//! librados/librbd implementation of the remote service seam
//!
//! # Feature Flags
//!
//! - `rbd` - Link against librados and librbd
//! - `write-zeroes` - Use `rbd_aio_write_zeroes` (librbd from Ceph Mimic on)
//!
//! # Safety
//!
//! Every raw handle is owned by exactly one RAII wrapper. The completion
//! context pointer handed to librbd comes from `Box::into_raw` and is turned
//! back into a `Box` exactly once: by [`rbd_finish_aio`] after the operation
//! finished, or by the submitting thread when the completion is never armed.

pub mod ffi;

use std::ffi::{c_int, c_void, CString};
use std::mem::ManuallyDrop;
use std::path::Path;
use std::ptr;

use tracing::warn;

use crate::completion::{self, CompletionContext};
use crate::remote::{AioCompletion, AioImage, AioOp, Connector, RawResult, Rejected};
use crate::window::IoSegment;

const EINVAL: i32 = 22;

// The translated segment list is handed to librbd as-is.
const _: () = assert!(std::mem::size_of::<IoSegment>() == std::mem::size_of::<libc::iovec>());
const _: () = assert!(std::mem::align_of::<IoSegment>() == std::mem::align_of::<libc::iovec>());

fn cstring(s: &str) -> RawResult<CString> {
    CString::new(s).map_err(|_| -EINVAL)
}

fn check(r: c_int) -> RawResult<()> {
    if r < 0 {
        Err(r)
    } else {
        Ok(())
    }
}

// =============================================================================
// Handles
// =============================================================================

/// librados cluster handle; shut down on drop.
#[derive(Debug)]
pub struct RbdCluster {
    handle: ffi::rados_t,
}

// SAFETY: librados handles are thread-safe.
unsafe impl Send for RbdCluster {}
unsafe impl Sync for RbdCluster {}

impl Drop for RbdCluster {
    fn drop(&mut self) {
        unsafe { ffi::rados_shutdown(self.handle) };
    }
}

/// Pool I/O context; destroyed on drop.
#[derive(Debug)]
pub struct RbdIoCtx {
    handle: ffi::rados_ioctx_t,
}

// SAFETY: as above.
unsafe impl Send for RbdIoCtx {}
unsafe impl Sync for RbdIoCtx {}

impl Drop for RbdIoCtx {
    fn drop(&mut self) {
        unsafe { ffi::rados_ioctx_destroy(self.handle) };
    }
}

/// Open librbd image; closed on drop.
#[derive(Debug)]
pub struct RbdImage {
    handle: ffi::rbd_image_t,
}

// SAFETY: librbd serializes access to an image internally.
unsafe impl Send for RbdImage {}
unsafe impl Sync for RbdImage {}

impl Drop for RbdImage {
    fn drop(&mut self) {
        let r = unsafe { ffi::rbd_close(self.handle) };
        if r < 0 {
            warn!(code = r, "rbd_close failed");
        }
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Opens sessions through librados/librbd.
#[derive(Debug, Clone, Copy, Default)]
pub struct RbdConnector;

impl Connector for RbdConnector {
    type Cluster = RbdCluster;
    type IoCtx = RbdIoCtx;
    type Image = RbdImage;

    fn create_cluster(&self, cluster_name: &str, user: &str, flags: u64) -> RawResult<RbdCluster> {
        let cluster_name = cstring(cluster_name)?;
        let user = cstring(user)?;
        let mut handle: ffi::rados_t = ptr::null_mut();

        check(unsafe { ffi::rados_create2(&mut handle, cluster_name.as_ptr(), user.as_ptr(), flags) })?;
        Ok(RbdCluster { handle })
    }

    fn read_conf_file(&self, cluster: &mut RbdCluster, path: &Path) -> RawResult<()> {
        let path = cstring(&path.to_string_lossy())?;
        check(unsafe { ffi::rados_conf_read_file(cluster.handle, path.as_ptr()) })
    }

    fn set_conf(&self, cluster: &mut RbdCluster, key: &str, value: &str) -> RawResult<()> {
        let key = cstring(key)?;
        let value = cstring(value)?;
        check(unsafe { ffi::rados_conf_set(cluster.handle, key.as_ptr(), value.as_ptr()) })
    }

    fn connect(&self, cluster: &mut RbdCluster) -> RawResult<()> {
        check(unsafe { ffi::rados_connect(cluster.handle) })
    }

    fn create_ioctx(&self, cluster: &RbdCluster, pool: &str) -> RawResult<RbdIoCtx> {
        let pool = cstring(pool)?;
        let mut handle: ffi::rados_ioctx_t = ptr::null_mut();

        check(unsafe { ffi::rados_ioctx_create(cluster.handle, pool.as_ptr(), &mut handle) })?;
        Ok(RbdIoCtx { handle })
    }

    fn open_image(&self, ioctx: &RbdIoCtx, image: &str, snapshot: Option<&str>) -> RawResult<RbdImage> {
        let image = cstring(image)?;
        let snapshot = snapshot.map(cstring).transpose()?;
        let mut handle: ffi::rbd_image_t = ptr::null_mut();

        let r = unsafe {
            match &snapshot {
                Some(snap) => {
                    ffi::rbd_open_read_only(ioctx.handle, image.as_ptr(), &mut handle, snap.as_ptr())
                }
                None => ffi::rbd_open(ioctx.handle, image.as_ptr(), &mut handle, ptr::null()),
            }
        };
        check(r)?;
        Ok(RbdImage { handle })
    }
}

// =============================================================================
// Asynchronous I/O
// =============================================================================

/// Completion bridge entry point, called by librbd on its finisher thread.
unsafe extern "C" fn rbd_finish_aio(cb: ffi::rbd_completion_t, arg: *mut c_void) {
    let raw = ffi::rbd_aio_get_return_value(cb) as i64;
    ffi::rbd_aio_release(cb);

    // SAFETY: `arg` is the pointer leaked in `create_completion`; librbd calls
    // this exactly once per armed completion.
    let ctx = Box::from_raw(arg.cast::<CompletionContext>());
    completion::finish_on_callback(ctx, raw);
}

/// librbd completion bound to a leaked [`CompletionContext`].
///
/// Dropping an unarmed completion releases it and frees the context.
#[derive(Debug)]
pub struct RbdCompletion {
    raw: ffi::rbd_completion_t,
    ctx: *mut CompletionContext,
}

// SAFETY: the completion is only touched by the submitting thread until it is
// armed, after which librbd owns it.
unsafe impl Send for RbdCompletion {}

impl AioCompletion for RbdCompletion {
    fn context(&self) -> &CompletionContext {
        // SAFETY: the context stays alive until the completion is armed.
        unsafe { &*self.ctx }
    }

    fn abandon(self) -> Box<CompletionContext> {
        let this = ManuallyDrop::new(self);
        unsafe {
            ffi::rbd_aio_release(this.raw);
            Box::from_raw(this.ctx)
        }
    }
}

impl Drop for RbdCompletion {
    fn drop(&mut self) {
        unsafe {
            ffi::rbd_aio_release(self.raw);
            drop(Box::from_raw(self.ctx));
        }
    }
}

impl RbdImage {
    #[cfg(feature = "write-zeroes")]
    unsafe fn aio_write_zeroes(&self, offset: u64, len: u64, c: ffi::rbd_completion_t) -> c_int {
        ffi::rbd_aio_write_zeroes(self.handle, offset, len as libc::size_t, c, 0, 0)
    }

    #[cfg(not(feature = "write-zeroes"))]
    unsafe fn aio_write_zeroes(&self, _offset: u64, _len: u64, _c: ffi::rbd_completion_t) -> c_int {
        -libc::EOPNOTSUPP
    }
}

impl AioImage for RbdImage {
    type Completion = RbdCompletion;

    fn supports_write_zeroes(&self) -> bool {
        cfg!(feature = "write-zeroes")
    }

    fn create_completion(
        &self,
        ctx: Box<CompletionContext>,
    ) -> std::result::Result<RbdCompletion, (i32, Box<CompletionContext>)> {
        let ctx = Box::into_raw(ctx);
        let mut raw: ffi::rbd_completion_t = ptr::null_mut();

        let r = unsafe { ffi::rbd_aio_create_completion(ctx.cast(), Some(rbd_finish_aio), &mut raw) };
        if r < 0 {
            // SAFETY: librbd did not take the pointer.
            return Err((r, unsafe { Box::from_raw(ctx) }));
        }
        Ok(RbdCompletion { raw, ctx })
    }

    fn submit(&self, op: AioOp, completion: RbdCompletion) -> std::result::Result<(), Rejected<RbdCompletion>> {
        let c = completion.raw;
        let (iov, iovcnt) = {
            let segments = completion.segments();
            (segments.as_ptr().cast::<libc::iovec>(), segments.len() as c_int)
        };

        // SAFETY: the iovec array is the context's segment list. librbd may
        // read it until the operation completes, and the context is only freed
        // in rbd_finish_aio after that.
        let r = unsafe {
            match op {
                AioOp::Writev { offset } => ffi::rbd_aio_writev(self.handle, iov, iovcnt, offset, c),
                AioOp::Readv { offset } => ffi::rbd_aio_readv(self.handle, iov, iovcnt, offset, c),
                AioOp::Flush => ffi::rbd_aio_flush(self.handle, c),
                AioOp::Discard { offset, len } => ffi::rbd_aio_discard(self.handle, offset, len, c),
                AioOp::WriteZeroes { offset, len } => self.aio_write_zeroes(offset, len, c),
            }
        };

        if r < 0 {
            return Err(Rejected { code: r, completion });
        }

        // Armed: the context now belongs to rbd_finish_aio.
        std::mem::forget(completion);
        Ok(())
    }
}
