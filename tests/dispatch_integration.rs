//! End-to-end dispatch tests over the in-memory RBD image
//!
//! Every scenario drives the public backend: open a session, register a
//! queue over a shared region, submit, and observe the completion channel.

#![cfg(feature = "mock-rbd")]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;

use rbd_dispatch::mock::{CompletionMode, LifecycleEvent, MockConnector, MockImageSpec, MockRegion};
use rbd_dispatch::remote::AioOp;
use rbd_dispatch::session::OpenStep;
use rbd_dispatch::{
    Completion, CompletionQueue, Error, IoKind, Queue, RbdBackend, RelSegment, Request, SessionConfig,
};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);
const REGION: usize = 1024 * 1024;

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    backend: RbdBackend<MockConnector>,
    region: MockRegion,
    cq: CompletionQueue,
    queue: Arc<Queue>,
}

impl Harness {
    fn new(spec: MockImageSpec) -> Self {
        let connector = MockConnector::new();
        connector.register_image("rbd", "disk0", spec);

        let mut backend = RbdBackend::new(connector, SessionConfig::new("rbd", "disk0"));
        backend.open().unwrap();

        let region = MockRegion::new(REGION).unwrap();
        let cq = CompletionQueue::new();
        let queue = backend.add_queue(region.window(), Arc::new(cq.clone())).unwrap();

        Self {
            backend,
            region,
            cq,
            queue,
        }
    }

    fn manual() -> Self {
        Self::new(MockImageSpec {
            mode: CompletionMode::Manual,
            ..MockImageSpec::default()
        })
    }

    fn image(&self) -> &rbd_dispatch::mock::MockImage {
        self.backend.image().unwrap()
    }

    fn next(&self) -> Completion {
        self.cq.recv_timeout(WAIT).expect("completion did not arrive")
    }
}

// =============================================================================
// Result Normalization
// =============================================================================

mod normalization {
    use super::*;

    #[test]
    fn test_write_full_length_posts_zero() {
        let h = Harness::manual();
        h.backend
            .submit_write(&h.queue, &Request::write(100, 0, vec![RelSegment::new(0, 4096)]).unwrap())
            .unwrap();

        let op = h.image().pending()[0];
        assert_eq!(op.op, AioOp::Writev { offset: 0 });
        h.image().complete(op.id, Some(4096));

        assert_eq!(h.next(), Completion::new(100, 0));
    }

    #[test]
    fn test_short_read_posts_byte_count() {
        let h = Harness::manual();
        h.backend
            .submit_read(&h.queue, &Request::read(101, 0, vec![RelSegment::new(0, 4096)]).unwrap())
            .unwrap();

        let op = h.image().pending()[0];
        h.image().complete(op.id, Some(2048));

        let c = h.next();
        assert_eq!(c, Completion::new(101, 2048));
        assert!(!c.is_success());
        assert_eq!(h.queue.stats().snapshot().short_transfers, 1);
    }

    #[test]
    fn test_discard_passes_remote_error_through() {
        let h = Harness::manual();
        h.backend
            .submit_discard(&h.queue, &Request::discard(102, 0, 8192))
            .unwrap();

        let op = h.image().pending()[0];
        assert_eq!(op.op, AioOp::Discard { offset: 0, len: 8192 });
        h.image().complete(op.id, Some(-5));

        assert_eq!(h.next(), Completion::new(102, -5));
    }

    #[test]
    fn test_flush_success() {
        let h = Harness::new(MockImageSpec::default());
        h.backend.submit_flush(&h.queue, &Request::flush(103)).unwrap();
        assert_eq!(h.next(), Completion::new(103, 0));
    }

    #[test]
    fn test_zero_byte_read_is_not_success() {
        let h = Harness::manual();
        h.backend
            .submit_read(&h.queue, &Request::read(104, 0, vec![RelSegment::new(0, 512)]).unwrap())
            .unwrap();

        let op = h.image().pending()[0];
        h.image().complete(op.id, Some(0));

        assert_eq!(h.next().result, -5);
    }
}

// =============================================================================
// Exactly-Once Delivery
// =============================================================================

mod delivery {
    use super::*;

    #[test]
    fn test_reverse_order_completions_match_tokens() {
        let h = Harness::manual();
        h.backend
            .submit_write(&h.queue, &Request::write(1, 0, vec![RelSegment::new(0, 4096)]).unwrap())
            .unwrap();
        h.backend
            .submit_read(&h.queue, &Request::read(2, 8192, vec![RelSegment::new(4096, 1024)]).unwrap())
            .unwrap();

        let pending = h.image().pending();
        assert_eq!(pending.len(), 2);
        assert_eq!((pending[0].token, pending[1].token), (1, 2));

        h.image().complete(pending[1].id, Some(512));
        h.image().complete(pending[0].id, None);

        let mut got = vec![h.next(), h.next()];
        got.sort_by_key(|c| c.token);
        assert_eq!(got, vec![Completion::new(1, 0), Completion::new(2, 512)]);
        assert_eq!(h.cq.recv_timeout(QUIET), None);
    }

    #[test]
    fn test_many_requests_across_callback_threads() {
        let h = Harness::new(MockImageSpec {
            callback_threads: 4,
            ..MockImageSpec::default()
        });

        let n = 512u64;
        for token in 0..n {
            // Each request gets its own slice of the region.
            let seg = RelSegment::new(token * 1024, 1024);
            let req = match token % 4 {
                0 => Request::write(token, token * 4096, vec![seg]).unwrap(),
                1 => Request::read(token, token * 4096, vec![seg]).unwrap(),
                2 => Request::flush(token),
                _ => Request::discard(token, token * 4096, 4096),
            };
            h.backend.submit(&h.queue, &req).unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..n {
            let c = h.next();
            assert_eq!(c.result, 0, "token {} failed", c.token);
            assert!(seen.insert(c.token), "token {} posted twice", c.token);
        }
        assert_eq!(seen.len() as u64, n);
        assert_eq!(h.cq.recv_timeout(QUIET), None);

        let stats = h.backend.stats();
        assert_eq!(stats.submitted, n);
        assert_eq!(stats.completed, n);
        assert_eq!(stats.in_flight(), 0);
    }

    #[test]
    fn test_concurrent_submitters_share_one_image() {
        let h = Harness::new(MockImageSpec {
            callback_threads: 2,
            ..MockImageSpec::default()
        });

        std::thread::scope(|s| {
            for t in 0..4u64 {
                let backend = &h.backend;
                let queue = &h.queue;
                s.spawn(move || {
                    for i in 0..64u64 {
                        let token = t * 1000 + i;
                        backend.submit_flush(queue, &Request::flush(token)).unwrap();
                    }
                });
            }
        });

        let tokens: HashSet<u64> = (0..256).map(|_| h.next().token).collect();
        assert_eq!(tokens.len(), 256);
    }

    #[tokio::test]
    async fn test_async_front_end_sink() {
        let h = Harness::new(MockImageSpec::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let queue = h.backend.add_queue(h.region.window(), Arc::new(tx)).unwrap();

        h.backend
            .submit_write(&queue, &Request::write(7, 0, vec![RelSegment::new(0, 4096)]).unwrap())
            .unwrap();

        let c = tokio::time::timeout(WAIT, rx.recv()).await.unwrap();
        assert_eq!(c, Some(Completion::new(7, 0)));
        assert_eq!(queue.id(), 1);
    }
}

// =============================================================================
// Synchronous Failures
// =============================================================================

mod sync_failures {
    use super::*;

    #[test]
    fn test_write_zero_unsupported_never_completes() {
        let h = Harness::new(MockImageSpec {
            write_zeroes: false,
            ..MockImageSpec::default()
        });

        let result = h
            .backend
            .submit_write_zero(&h.queue, &Request::write_zeroes(1, 0, 4096));

        assert_matches!(
            result,
            Err(Error::UnsupportedOperation {
                op: IoKind::WriteZeroes
            })
        );
        assert_eq!(h.image().submissions(), 0);
        assert_eq!(h.cq.recv_timeout(QUIET), None);
    }

    #[test]
    fn test_write_zero_supported_zeroes_range() {
        let h = Harness::new(MockImageSpec::default());
        h.image().write_image(4096, &[0xAB; 4096]);

        h.backend
            .submit_write_zero(&h.queue, &Request::write_zeroes(1, 4096, 4096))
            .unwrap();

        assert_eq!(h.next(), Completion::new(1, 0));
        assert!(h.image().read_image(4096, 4096).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_rejected_submission_never_completes() {
        let h = Harness::new(MockImageSpec::default());
        let baseline = Arc::strong_count(&h.queue);
        h.image().reject_next_submission(-108);

        let result = h
            .backend
            .submit_read(&h.queue, &Request::read(9, 0, vec![RelSegment::new(0, 4096)]).unwrap());

        assert_matches!(
            result,
            Err(Error::SubmissionFailure {
                op: IoKind::Read,
                code: -108
            })
        );
        assert_eq!(result.unwrap_err().errno(), -108);
        assert_eq!(Arc::strong_count(&h.queue), baseline);
        assert_eq!(h.cq.recv_timeout(QUIET), None);

        // The next request goes through normally.
        h.backend.submit_flush(&h.queue, &Request::flush(10)).unwrap();
        assert_eq!(h.next(), Completion::new(10, 0));
    }

    /// Front end that keeps a token outstanding after a synchronous failure,
    /// in case a completion for it still arrives.
    struct TolerantConsumer {
        outstanding: HashSet<u64>,
        posts: Vec<Completion>,
    }

    impl TolerantConsumer {
        fn new() -> Self {
            Self {
                outstanding: HashSet::new(),
                posts: Vec::new(),
            }
        }

        fn submit(&mut self, h: &Harness, req: &Request) -> rbd_dispatch::Result<()> {
            self.outstanding.insert(req.token);
            h.backend.submit(&h.queue, req)
        }

        fn absorb(&mut self, cq: &CompletionQueue) {
            for c in cq.drain() {
                self.outstanding.remove(&c.token);
                self.posts.push(c);
            }
        }
    }

    #[test]
    fn test_rejected_submission_no_late_completion() {
        let mut h = Harness::new(MockImageSpec {
            callback_threads: 4,
            ..MockImageSpec::default()
        });
        let mut consumer = TolerantConsumer::new();

        h.image().reject_next_submission(-108);
        let rejected = Request::read(9, 0, vec![RelSegment::new(0, 4096)]).unwrap();
        assert_matches!(
            consumer.submit(&h, &rejected),
            Err(Error::SubmissionFailure { code: -108, .. })
        );

        for token in 10..20 {
            consumer.submit(&h, &Request::flush(token)).unwrap();
        }
        for _ in 10..20 {
            let c = h.next();
            consumer.outstanding.remove(&c.token);
            consumer.posts.push(c);
        }

        // Closing joins the callback threads, so any late post has landed.
        h.backend.close();
        consumer.absorb(&h.cq);

        assert_eq!(consumer.posts.len(), 10);
        assert!(consumer.posts.iter().all(|c| c.token != 9));
        assert_eq!(consumer.outstanding, HashSet::from([9]));
    }

    #[test]
    fn test_completion_setup_failure_never_completes() {
        let h = Harness::new(MockImageSpec::default());
        h.image().fail_next_completion(-12);

        assert_matches!(
            h.backend.submit_flush(&h.queue, &Request::flush(1)),
            Err(Error::CompletionSetupFailure { code: -12 })
        );
        assert_eq!(h.cq.recv_timeout(QUIET), None);
        assert_eq!(h.backend.stats().sync_failures, 1);
    }

    #[test]
    fn test_segment_outside_window() {
        let h = Harness::new(MockImageSpec::default());

        let req = Request::write(1, 0, vec![RelSegment::new(0, 512), RelSegment::new(REGION as u64, 1)]).unwrap();
        assert_matches!(
            h.backend.submit_write(&h.queue, &req),
            Err(Error::SegmentOutOfBounds { index: 1, .. })
        );
        assert_eq!(h.image().completions_created(), 0);
    }
}

// =============================================================================
// Data Path
// =============================================================================

mod data_path {
    use super::*;

    #[test]
    fn test_scatter_write_gather_read() {
        let h = Harness::new(MockImageSpec::default());

        h.region.write_at(0, &[1u8; 1024]);
        h.region.write_at(65536, &[2u8; 3072]);
        let write = Request::write(
            1,
            8192,
            vec![RelSegment::new(0, 1024), RelSegment::new(65536, 3072)],
        )
        .unwrap();
        h.backend.submit_write(&h.queue, &write).unwrap();
        assert_eq!(h.next(), Completion::new(1, 0));

        let image_bytes = h.image().read_image(8192, 4096);
        assert!(image_bytes[..1024].iter().all(|&b| b == 1));
        assert!(image_bytes[1024..].iter().all(|&b| b == 2));

        let read = Request::read(2, 8192 + 512, vec![RelSegment::new(200_000, 1024)]).unwrap();
        h.backend.submit_read(&h.queue, &read).unwrap();
        assert_eq!(h.next(), Completion::new(2, 0));

        let got = h.region.read_at(200_000, 1024);
        assert!(got[..512].iter().all(|&b| b == 1));
        assert!(got[512..].iter().all(|&b| b == 2));

        let stats = h.backend.stats();
        assert_eq!(stats.bytes_written, 4096);
        assert_eq!(stats.bytes_read, 1024);
    }

    #[test]
    fn test_read_past_image_end_fails() {
        let h = Harness::new(MockImageSpec {
            size: 8192,
            ..MockImageSpec::default()
        });

        h.backend
            .submit_read(&h.queue, &Request::read(1, 4096, vec![RelSegment::new(0, 8192)]).unwrap())
            .unwrap();
        assert_eq!(h.next(), Completion::new(1, -22));
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

mod lifecycle {
    use super::*;

    fn connector() -> MockConnector {
        let c = MockConnector::new();
        c.register_image("rbd", "disk0", MockImageSpec::default());
        c
    }

    #[test]
    fn test_open_failure_at_each_step_unwinds() {
        let cases = [
            (OpenStep::CreateCluster, 0usize),
            (OpenStep::ReadConf, 1),
            (OpenStep::Connect, 1),
            (OpenStep::CreateIoCtx, 1),
            (OpenStep::OpenImage, 2),
        ];

        for (step, released) in cases {
            let c = connector();
            c.fail_at(step, -5);
            let mut backend = RbdBackend::new(c.clone(), SessionConfig::new("rbd", "disk0"));

            let err = backend.open().unwrap_err();
            assert_eq!(err.errno(), -5, "{}", step);
            assert!(!backend.is_open());

            let releases: Vec<LifecycleEvent> = c
                .events()
                .into_iter()
                .filter(|e| {
                    matches!(
                        e,
                        LifecycleEvent::ImageClosed(_)
                            | LifecycleEvent::IoCtxDestroyed(_)
                            | LifecycleEvent::ClusterShutdown
                    )
                })
                .collect();
            assert_eq!(releases.len(), released, "{}", step);
            if released > 0 {
                assert_eq!(releases.last(), Some(&LifecycleEvent::ClusterShutdown));
            }
        }
    }

    #[test]
    fn test_close_order_and_reopen() {
        let c = connector();
        let mut backend = RbdBackend::new(c.clone(), SessionConfig::new("rbd", "disk0"));
        backend.open().unwrap();
        c.clear_events();

        backend.close();
        assert_eq!(
            c.events(),
            vec![
                LifecycleEvent::ImageClosed("disk0".into()),
                LifecycleEvent::IoCtxDestroyed("rbd".into()),
                LifecycleEvent::ClusterShutdown,
            ]
        );

        backend.open().unwrap();
        assert!(backend.is_open());
        backend.release();
    }

    #[test]
    fn test_conf_overrides_applied() {
        let c = connector();
        let mut config = SessionConfig::new("rbd", "disk0");
        config
            .conf_overrides
            .insert("rbd_concurrent_management_ops".into(), "20".into());

        let mut backend = RbdBackend::new(c.clone(), config);
        backend.open().unwrap();

        let sets: Vec<LifecycleEvent> = c
            .events()
            .into_iter()
            .filter(|e| matches!(e, LifecycleEvent::ConfSet(..)))
            .collect();
        assert_eq!(
            sets,
            vec![
                LifecycleEvent::ConfSet("rbd_cache".into(), "false".into()),
                LifecycleEvent::ConfSet("rbd_concurrent_management_ops".into(), "20".into()),
            ]
        );
    }
}
