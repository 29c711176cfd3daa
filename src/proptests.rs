//! Property-Based Tests for Translation, Normalization and Dispatch
//!
//! # Test Properties
//!
//! 1. **Translation**: in-bounds lists map to `base + offset` in order;
//!    any out-of-bounds segment rejects the whole list at its index
//! 2. **Normalization**: read/write report 0 exactly on a full transfer;
//!    flush/discard/write-zeroes pass the raw result through
//! 3. **Data Roundtrip**: bytes written through the dispatcher read back
//!    unchanged, whatever the scatter/gather shape

#![cfg(test)]

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use crate::completion::{normalize, Completion, CompletionQueue};
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::mock::{MockImage, MockImageSpec, MockRegion};
use crate::queue::Queue;
use crate::request::{IoKind, Request};
use crate::window::RelSegment;

const WINDOW: usize = 64 * 1024;

// =============================================================================
// Property Strategies
// =============================================================================

/// Segments that fit inside a window of `WINDOW` bytes.
fn in_bounds_segments() -> impl Strategy<Value = Vec<RelSegment>> {
    prop::collection::vec(
        (0u64..WINDOW as u64).prop_flat_map(|offset| {
            (Just(offset), 0u64..=(WINDOW as u64 - offset))
                .prop_map(|(offset, len)| RelSegment::new(offset, len))
        }),
        0..16,
    )
}

/// Non-overlapping segments: a random split of `[0, total)` with gaps.
fn disjoint_segments() -> impl Strategy<Value = Vec<RelSegment>> {
    prop::collection::vec((0u64..256, 1u64..2048), 1..8).prop_map(|parts| {
        let mut next = 0u64;
        parts
            .into_iter()
            .map(|(gap, len)| {
                let seg = RelSegment::new(next + gap, len);
                next += gap + len;
                seg
            })
            .collect()
    })
}

fn data_kind() -> impl Strategy<Value = IoKind> {
    prop_oneof![Just(IoKind::Read), Just(IoKind::Write)]
}

fn passthrough_kind() -> impl Strategy<Value = IoKind> {
    prop_oneof![
        Just(IoKind::Flush),
        Just(IoKind::Discard),
        Just(IoKind::WriteZeroes)
    ]
}

// =============================================================================
// Translation Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Property: every in-bounds segment maps to base + offset, same length,
    /// same position.
    #[test]
    fn prop_translate_preserves_order_and_offsets(segs in in_bounds_segments()) {
        let region = MockRegion::new(WINDOW).unwrap();
        let window = region.window();

        let iov = window.translate(&segs).unwrap();

        prop_assert_eq!(iov.len(), segs.len());
        for (out, seg) in iov.iter().zip(&segs) {
            prop_assert_eq!(out.addr(), window.base() + seg.offset as usize);
            prop_assert_eq!(out.len() as u64, seg.len);
            prop_assert!(out.addr() + out.len() <= window.base() + window.len());
        }
    }

    /// Property: one bad segment anywhere rejects the list, reporting the
    /// first bad index.
    #[test]
    fn prop_out_of_bounds_segment_rejects_list(
        mut segs in in_bounds_segments(),
        position in any::<prop::sample::Index>(),
        overshoot in 1u64..4096,
    ) {
        let region = MockRegion::new(WINDOW).unwrap();
        let window = region.window();

        let index = position.index(segs.len() + 1);
        segs.insert(index, RelSegment::new(WINDOW as u64 - 1, overshoot + 1));

        match window.translate(&segs) {
            Err(Error::SegmentOutOfBounds { index: got, window_len, .. }) => {
                prop_assert_eq!(got, index);
                prop_assert_eq!(window_len, WINDOW);
            }
            other => prop_assert!(false, "expected SegmentOutOfBounds, got {:?}", other),
        }
    }
}

// =============================================================================
// Normalization Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    /// Property: read/write succeed iff the full length transferred.
    #[test]
    fn prop_data_ops_succeed_only_on_full_transfer(
        kind in data_kind(),
        expected in 1u32..=u32::MAX,
        raw in any::<i64>(),
    ) {
        let result = normalize(kind, expected, raw);
        prop_assert_eq!(result == 0, raw == i64::from(expected));
        if raw != i64::from(expected) && raw != 0 {
            prop_assert_eq!(result, raw);
        }
    }

    /// Property: other kinds report the raw result unchanged.
    #[test]
    fn prop_passthrough_kinds(kind in passthrough_kind(), len in any::<u32>(), raw in any::<i64>()) {
        prop_assert_eq!(normalize(kind, len, raw), raw);
    }
}

// =============================================================================
// Dispatch Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: a write followed by a read at the same image offset returns
    /// the written bytes in the read buffers.
    #[test]
    fn prop_write_read_roundtrip(
        segs in disjoint_segments(),
        block in 0u64..64,
        seed in any::<u8>(),
    ) {
        let region = MockRegion::new(2 * WINDOW).unwrap();
        let cq = CompletionQueue::new();
        let queue = Arc::new(Queue::new(0, region.window(), Arc::new(cq.clone())));
        let image = MockImage::new(MockImageSpec::default());
        let d = Dispatcher::new(&image);

        let mut expected = Vec::new();
        for (i, seg) in segs.iter().enumerate() {
            let bytes: Vec<u8> = (0..seg.len).map(|n| seed ^ (n as u8) ^ (i as u8)).collect();
            region.write_at(seg.offset as usize, &bytes);
            expected.extend_from_slice(&bytes);
        }

        let offset = block * 4096;
        let write = Request::write(1, offset, segs.clone()).unwrap();
        d.submit_write(&queue, &write).unwrap();
        prop_assert_eq!(cq.recv_timeout(Duration::from_secs(5)), Some(Completion::new(1, 0)));
        prop_assert_eq!(image.read_image(offset, expected.len()), expected.clone());

        // Read back into the second half of the region.
        let shifted: Vec<RelSegment> = segs
            .iter()
            .map(|s| RelSegment::new(s.offset + WINDOW as u64, s.len))
            .collect();
        d.submit_read(&queue, &Request::read(2, offset, shifted.clone()).unwrap()).unwrap();
        prop_assert_eq!(cq.recv_timeout(Duration::from_secs(5)), Some(Completion::new(2, 0)));

        let mut got = Vec::new();
        for seg in &shifted {
            got.extend(region.read_at(seg.offset as usize, seg.len as usize));
        }
        prop_assert_eq!(got, expected);
    }
}
