//! FFI bindings for librados and librbd
//!
//! These are minimal bindings for the specific functions we need.
//! Linking is set up by `build.rs` when the `rbd` feature is enabled.

#![allow(non_camel_case_types)]

use std::ffi::{c_char, c_int, c_void};

use libc::{iovec, ssize_t};

/// Cluster handle
pub type rados_t = *mut c_void;

/// Pool I/O context
pub type rados_ioctx_t = *mut c_void;

/// Open image
pub type rbd_image_t = *mut c_void;

/// Asynchronous completion
pub type rbd_completion_t = *mut c_void;

/// Completion callback, invoked on a librbd finisher thread
pub type rbd_callback_t = Option<unsafe extern "C" fn(cb: rbd_completion_t, arg: *mut c_void)>;

// =============================================================================
// librados
// =============================================================================

extern "C" {
    /// Create a cluster handle for `name` (e.g. `client.admin`) in
    /// `clustername`.
    ///
    /// # Returns
    /// 0 on success, negative errno on failure
    pub fn rados_create2(
        pcluster: *mut rados_t,
        clustername: *const c_char,
        name: *const c_char,
        flags: u64,
    ) -> c_int;

    /// Read a Ceph configuration file into the cluster handle.
    pub fn rados_conf_read_file(cluster: rados_t, path: *const c_char) -> c_int;

    /// Set a single configuration option.
    pub fn rados_conf_set(cluster: rados_t, option: *const c_char, value: *const c_char) -> c_int;

    /// Connect to the cluster.
    pub fn rados_connect(cluster: rados_t) -> c_int;

    /// Disconnect and free the cluster handle.
    ///
    /// # Safety
    /// All I/O contexts created from the handle must be destroyed first.
    pub fn rados_shutdown(cluster: rados_t);

    /// Create an I/O context for `pool_name`.
    pub fn rados_ioctx_create(
        cluster: rados_t,
        pool_name: *const c_char,
        ioctx: *mut rados_ioctx_t,
    ) -> c_int;

    /// Destroy an I/O context.
    pub fn rados_ioctx_destroy(io: rados_ioctx_t);
}

// =============================================================================
// librbd
// =============================================================================

extern "C" {
    /// Open an image for read/write. `snap_name` may be NULL for the head.
    pub fn rbd_open(
        io: rados_ioctx_t,
        name: *const c_char,
        image: *mut rbd_image_t,
        snap_name: *const c_char,
    ) -> c_int;

    /// Open an image read-only.
    pub fn rbd_open_read_only(
        io: rados_ioctx_t,
        name: *const c_char,
        image: *mut rbd_image_t,
        snap_name: *const c_char,
    ) -> c_int;

    /// Close an image.
    pub fn rbd_close(image: rbd_image_t) -> c_int;

    // -------------------------------------------------------------------------
    // Completions
    // -------------------------------------------------------------------------

    /// Create a completion that invokes `complete_cb(c, cb_arg)` when the
    /// operation it is submitted with finishes.
    pub fn rbd_aio_create_completion(
        cb_arg: *mut c_void,
        complete_cb: rbd_callback_t,
        c: *mut rbd_completion_t,
    ) -> c_int;

    /// Result of a finished operation: bytes transferred, 0, or negative errno.
    pub fn rbd_aio_get_return_value(c: rbd_completion_t) -> ssize_t;

    /// Release a completion.
    pub fn rbd_aio_release(c: rbd_completion_t);

    // -------------------------------------------------------------------------
    // Asynchronous I/O
    // -------------------------------------------------------------------------

    pub fn rbd_aio_writev(
        image: rbd_image_t,
        iov: *const iovec,
        iovcnt: c_int,
        off: u64,
        c: rbd_completion_t,
    ) -> c_int;

    pub fn rbd_aio_readv(
        image: rbd_image_t,
        iov: *const iovec,
        iovcnt: c_int,
        off: u64,
        c: rbd_completion_t,
    ) -> c_int;

    pub fn rbd_aio_flush(image: rbd_image_t, c: rbd_completion_t) -> c_int;

    pub fn rbd_aio_discard(image: rbd_image_t, off: u64, len: u64, c: rbd_completion_t) -> c_int;
}

#[cfg(feature = "write-zeroes")]
extern "C" {
    /// Zero-fill a range. Available since Ceph Mimic.
    pub fn rbd_aio_write_zeroes(
        image: rbd_image_t,
        off: u64,
        len: libc::size_t,
        c: rbd_completion_t,
        zero_flags: c_int,
        op_flags: c_int,
    ) -> c_int;
}
