//! Shared memory window and buffer translation
//!
//! The front end hands the dispatcher scatter/gather lists whose offsets are
//! relative to a memory region it shares with the kernel driver (the UIO
//! data area). librbd needs absolute addresses, so each request's list is
//! translated once, bounds-checked against the mapped extent, into a list of
//! [`IoSegment`]s that is layout-compatible with `struct iovec`.
//!
//! # Example
//!
//! ```ignore
//! use rbd_dispatch::{RelSegment, ShmWindow};
//!
//! let window = unsafe { ShmWindow::from_raw_parts(map_base, map_len) };
//! let iov = window.translate(&[RelSegment::new(0, 4096)])?;
//! assert_eq!(iov[0].addr(), map_base as usize);
//! ```

use std::ptr::NonNull;

use crate::error::{Error, Result};

/// A `(relative offset, length)` piece of a request buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelSegment {
    /// Offset from the window base
    pub offset: u64,

    /// Length in bytes
    pub len: u64,
}

impl RelSegment {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }
}

/// An absolute `(address, length)` piece inside the shared memory window.
///
/// `#[repr(C)]` with the same layout as `struct iovec`, so a `&[IoSegment]`
/// can be passed to librbd's vectored calls directly.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoSegment {
    base: *mut u8,
    len: usize,
}

// SAFETY: an IoSegment is an address into the shared window, which outlives
// every request referencing it. Moving the address across threads is what
// the remote service does with it anyway.
unsafe impl Send for IoSegment {}
unsafe impl Sync for IoSegment {}

impl IoSegment {
    /// Absolute address of the segment.
    #[inline]
    pub fn addr(&self) -> usize {
        self.base as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    /// View the segment's bytes.
    ///
    /// # Safety
    ///
    /// The window the segment was translated from must still be mapped, and
    /// nothing may be writing to the range concurrently.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.base, self.len)
    }

    /// Mutable view of the segment's bytes.
    ///
    /// # Safety
    ///
    /// As for [`IoSegment::as_slice`], and no other reference to the range may
    /// exist while the returned slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.base, self.len)
    }
}

/// The caller-owned shared memory window of one queue.
///
/// The window does not own or map the memory. Whoever constructs it promises
/// the region stays mapped for as long as any request translated against it
/// is in flight.
#[derive(Debug, Clone, Copy)]
pub struct ShmWindow {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the window is a plain (base, len) pair; the mapping it names is
// shared with the kernel and with the remote service by construction.
unsafe impl Send for ShmWindow {}
unsafe impl Sync for ShmWindow {}

impl ShmWindow {
    /// Create a window over `len` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// `base..base + len` must be a valid mapping that outlives every request
    /// submitted against this window.
    pub unsafe fn from_raw_parts(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Translate one segment, checking it lies inside the window.
    pub fn resolve(&self, index: usize, seg: RelSegment) -> Result<IoSegment> {
        let out_of_bounds = || Error::SegmentOutOfBounds {
            index,
            offset: seg.offset,
            len: seg.len,
            window_len: self.len,
        };

        let end = seg.offset.checked_add(seg.len).ok_or_else(out_of_bounds)?;
        if end > self.len as u64 {
            return Err(out_of_bounds());
        }

        // SAFETY: offset + len <= window len, so the address stays inside the
        // mapping named by this window.
        let base = unsafe { self.base.as_ptr().add(seg.offset as usize) };
        Ok(IoSegment {
            base,
            len: seg.len as usize,
        })
    }

    /// Translate a whole scatter/gather list, preserving order.
    pub fn translate(&self, segments: &[RelSegment]) -> Result<Vec<IoSegment>> {
        let mut out = Vec::with_capacity(segments.len());
        self.translate_into(segments, &mut out)?;
        Ok(out)
    }

    /// Translate into a caller-provided list. Nothing is pushed unless every
    /// segment is in bounds.
    pub fn translate_into(&self, segments: &[RelSegment], out: &mut Vec<IoSegment>) -> Result<()> {
        let start = out.len();
        for (index, seg) in segments.iter().enumerate() {
            match self.resolve(index, *seg) {
                Ok(iov) => out.push(iov),
                Err(e) => {
                    out.truncate(start);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRegion;
    use assert_matches::assert_matches;

    #[test]
    fn test_translate_adds_base() {
        let region = MockRegion::new(64 * 1024).unwrap();
        let window = region.window();

        let iov = window
            .translate(&[RelSegment::new(4096, 512), RelSegment::new(0, 1024)])
            .unwrap();

        assert_eq!(iov.len(), 2);
        assert_eq!(iov[0].addr(), window.base() + 4096);
        assert_eq!(iov[0].len(), 512);
        assert_eq!(iov[1].addr(), window.base());
        assert_eq!(iov[1].len(), 1024);
    }

    #[test]
    fn test_segment_ending_at_window_end() {
        let region = MockRegion::new(8192).unwrap();
        let window = region.window();
        let iov = window.translate(&[RelSegment::new(4096, 4096)]).unwrap();
        assert_eq!(iov[0].addr() + iov[0].len(), window.base() + window.len());
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let region = MockRegion::new(8192).unwrap();
        let window = region.window();

        let result = window.translate(&[RelSegment::new(0, 4096), RelSegment::new(6144, 4096)]);
        assert_matches!(
            result,
            Err(Error::SegmentOutOfBounds {
                index: 1,
                offset: 6144,
                len: 4096,
                window_len: 8192
            })
        );
    }

    #[test]
    fn test_overflowing_segment_rejected() {
        let region = MockRegion::new(4096).unwrap();
        let window = region.window();
        let result = window.translate(&[RelSegment::new(u64::MAX, 2)]);
        assert_matches!(result, Err(Error::SegmentOutOfBounds { index: 0, .. }));
    }

    #[test]
    fn test_translate_into_leaves_output_untouched_on_error() {
        let region = MockRegion::new(4096).unwrap();
        let window = region.window();
        let mut out = Vec::new();
        let result = window.translate_into(
            &[RelSegment::new(0, 512), RelSegment::new(4000, 512)],
            &mut out,
        );
        assert!(result.is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_io_segment_matches_iovec_layout() {
        assert_eq!(
            std::mem::size_of::<IoSegment>(),
            2 * std::mem::size_of::<usize>()
        );
        assert_eq!(
            std::mem::align_of::<IoSegment>(),
            std::mem::align_of::<usize>()
        );
    }
}
