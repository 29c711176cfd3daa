//! Request descriptors handed to the dispatcher by the front-end queue.

use crate::error::{Error, Result};
use crate::window::RelSegment;

/// Kind of block operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoKind {
    Write,
    Read,
    Flush,
    Discard,
    WriteZeroes,
}

impl IoKind {
    /// Whether the operation moves data through the shared memory window.
    pub fn transfers_data(&self) -> bool {
        matches!(self, IoKind::Write | IoKind::Read)
    }
}

impl std::fmt::Display for IoKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoKind::Write => write!(f, "write"),
            IoKind::Read => write!(f, "read"),
            IoKind::Flush => write!(f, "flush"),
            IoKind::Discard => write!(f, "discard"),
            IoKind::WriteZeroes => write!(f, "write-zeroes"),
        }
    }
}

/// A single request as delivered by the front-end queue.
///
/// The descriptor is read-only to the dispatcher. `token` is opaque and is
/// echoed back unchanged with the request's completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Operation kind, used by [`crate::RbdBackend::submit`] to route
    pub kind: IoKind,

    /// Byte offset on the image
    pub offset: u64,

    /// Byte length of the operation
    pub len: u32,

    /// Scatter/gather list relative to the queue's shared memory window
    pub segments: Vec<RelSegment>,

    /// Correlation token
    pub token: u64,
}

impl Request {
    /// Write request covering `segments`; the length is their sum.
    ///
    /// Fails with [`Error::TransferTooLarge`] if the sum does not fit in `len`.
    pub fn write(token: u64, offset: u64, segments: Vec<RelSegment>) -> Result<Self> {
        Self::with_segments(IoKind::Write, token, offset, segments)
    }

    /// Read request covering `segments`; the length is their sum.
    pub fn read(token: u64, offset: u64, segments: Vec<RelSegment>) -> Result<Self> {
        Self::with_segments(IoKind::Read, token, offset, segments)
    }

    pub fn flush(token: u64) -> Self {
        Self {
            kind: IoKind::Flush,
            offset: 0,
            len: 0,
            segments: Vec::new(),
            token,
        }
    }

    pub fn discard(token: u64, offset: u64, len: u32) -> Self {
        Self {
            kind: IoKind::Discard,
            offset,
            len,
            segments: Vec::new(),
            token,
        }
    }

    pub fn write_zeroes(token: u64, offset: u64, len: u32) -> Self {
        Self {
            kind: IoKind::WriteZeroes,
            offset,
            len,
            segments: Vec::new(),
            token,
        }
    }

    fn with_segments(kind: IoKind, token: u64, offset: u64, segments: Vec<RelSegment>) -> Result<Self> {
        let total = segments
            .iter()
            .try_fold(0u64, |acc, s| acc.checked_add(s.len))
            .unwrap_or(u64::MAX);
        let len = u32::try_from(total).map_err(|_| Error::TransferTooLarge { len: total })?;
        Ok(Self {
            kind,
            offset,
            len,
            segments,
            token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_io_kind_display() {
        assert_eq!(format!("{}", IoKind::Write), "write");
        assert_eq!(format!("{}", IoKind::Read), "read");
        assert_eq!(format!("{}", IoKind::Flush), "flush");
        assert_eq!(format!("{}", IoKind::Discard), "discard");
        assert_eq!(format!("{}", IoKind::WriteZeroes), "write-zeroes");
    }

    #[test]
    fn test_request_length_from_segments() {
        let req = Request::write(
            7,
            4096,
            vec![RelSegment::new(0, 512), RelSegment::new(8192, 1536)],
        )
        .unwrap();
        assert_eq!(req.kind, IoKind::Write);
        assert_eq!(req.len, 2048);
        assert_eq!(req.token, 7);
        assert!(req.kind.transfers_data());
    }

    #[test]
    fn test_oversize_segment_list_rejected() {
        // Exactly 4 GiB would wrap to a zero length.
        assert_matches!(
            Request::write(1, 0, vec![RelSegment::new(0, 1 << 32)]),
            Err(Error::TransferTooLarge { len }) if len == 1 << 32
        );
        assert_matches!(
            Request::read(2, 0, vec![RelSegment::new(0, 1 << 32), RelSegment::new(0, 4096)]),
            Err(Error::TransferTooLarge { len }) if len == (1 << 32) + 4096
        );
        assert_matches!(
            Request::read(3, 0, vec![RelSegment::new(0, u64::MAX), RelSegment::new(0, 1)]),
            Err(Error::TransferTooLarge { .. })
        );

        let req = Request::read(4, 0, vec![RelSegment::new(0, u64::from(u32::MAX))]).unwrap();
        assert_eq!(req.len, u32::MAX);
    }

    #[test]
    fn test_segmentless_requests() {
        let req = Request::discard(1, 0, 8192);
        assert_eq!(req.len, 8192);
        assert!(req.segments.is_empty());
        assert!(!req.kind.transfers_data());
        assert!(Request::flush(2).segments.is_empty());
    }
}
