//! In-memory RBD stand-in for testing without a Ceph cluster
//!
//! This module provides a functional mock of the remote service. Use it for:
//!
//! - Unit and integration testing without librbd installed
//! - Exercising front ends on development machines
//! - CI/CD pipelines
//!
//! The mock behaves like librbd where the dispatcher can observe it:
//! completions fire on the mock's own callback threads, never on the
//! submitting thread, and each accepted submission fires exactly once. In
//! [`CompletionMode::Manual`] operations park until the test releases them,
//! in any order and with any raw result.
//!
//! Enable with: `cargo build --features mock-rbd` (on by default)

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::completion::{self, CompletionContext};
use crate::error::{Error, Result};
use crate::remote::{AioCompletion, AioImage, AioOp, Connector, RawResult, Rejected};
use crate::request::IoKind;
use crate::session::OpenStep;
use crate::window::{IoSegment, ShmWindow};

/// Alignment of [`MockRegion`] allocations (page size, like the UIO map)
pub const MOCK_REGION_ALIGNMENT: usize = 4096;

const ENOENT: i32 = 2;
const EINVAL: i32 = 22;

// =============================================================================
// Shared Memory Region
// =============================================================================

/// Page-aligned heap allocation standing in for a queue's UIO data area.
///
/// Hand out a [`ShmWindow`] with [`MockRegion::window`]; the region must
/// outlive every request submitted against that window.
#[derive(Debug)]
pub struct MockRegion {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

// SAFETY: MockRegion owns its memory; concurrent access goes through raw
// copies the same way the kernel and librbd share a real UIO map.
unsafe impl Send for MockRegion {}
unsafe impl Sync for MockRegion {}

impl MockRegion {
    /// Allocate a zero-initialized region of `size` bytes.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("region size must be greater than 0".into()));
        }

        let layout = Layout::from_size_align(size, MOCK_REGION_ALIGNMENT)
            .map_err(|e| Error::Config(format!("invalid region layout: {}", e)))?;

        // SAFETY: layout has non-zero size (checked above)
        let ptr = unsafe { alloc_zeroed(layout) };

        NonNull::new(ptr).map_or_else(
            || {
                Err(Error::AllocationFailure {
                    segments: size / MOCK_REGION_ALIGNMENT,
                })
            },
            |ptr| Ok(Self { ptr, size, layout }),
        )
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Window over the whole region.
    pub fn window(&self) -> ShmWindow {
        // SAFETY: the allocation is valid for `size` bytes until drop; callers
        // keep the region alive while requests are in flight.
        unsafe { ShmWindow::from_raw_parts(self.ptr, self.size) }
    }

    /// Copy `data` into the region at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        assert!(
            offset + data.len() <= self.size,
            "write past region end: {} + {} > {}",
            offset,
            data.len(),
            self.size
        );
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
    }

    /// Copy `len` bytes out of the region at `offset`.
    pub fn read_at(&self, offset: usize, len: usize) -> Vec<u8> {
        assert!(
            offset + len <= self.size,
            "read past region end: {} + {} > {}",
            offset,
            len,
            self.size
        );
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), len);
        }
        out
    }
}

impl Drop for MockRegion {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

// =============================================================================
// Image
// =============================================================================

/// When accepted operations complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Hand each operation to a callback thread as soon as it is submitted
    #[default]
    Immediate,

    /// Park operations until [`MockImage::complete`] releases them
    Manual,
}

/// Shape and behaviour of a mock image.
#[derive(Debug, Clone)]
pub struct MockImageSpec {
    /// Image size in bytes
    pub size: u64,

    /// Whether write-zeroes is supported
    pub write_zeroes: bool,

    /// Completion mode
    pub mode: CompletionMode,

    /// Number of callback threads
    pub callback_threads: usize,
}

impl Default for MockImageSpec {
    fn default() -> Self {
        Self {
            size: 16 * 1024 * 1024,
            write_zeroes: true,
            mode: CompletionMode::Immediate,
            callback_threads: 1,
        }
    }
}

/// An operation parked in manual mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOp {
    pub id: u64,
    pub op: AioOp,
    pub kind: IoKind,
    pub token: u64,
}

/// Unarmed completion handle of the mock image.
#[derive(Debug)]
pub struct MockCompletion {
    id: u64,
    ctx: Box<CompletionContext>,
}

impl AioCompletion for MockCompletion {
    fn context(&self) -> &CompletionContext {
        &self.ctx
    }

    fn abandon(self) -> Box<CompletionContext> {
        self.ctx
    }
}

struct Job {
    op: AioOp,
    completion: MockCompletion,
    raw_override: Option<i64>,
}

struct ImageInner {
    spec: MockImageSpec,
    data: Arc<RwLock<Vec<u8>>>,
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    pending: DashMap<u64, Job>,
    next_id: AtomicU64,
    completions_created: AtomicU64,
    submissions: AtomicU64,
    fired: Arc<AtomicU64>,
    fail_completion: Mutex<Option<i32>>,
    reject_submission: Mutex<Option<i32>>,
}

impl Drop for ImageInner {
    fn drop(&mut self) {
        // Parked operations never complete; the channel closing stops workers.
        self.pending.clear();
        self.jobs.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// In-memory image with asynchronous, callback-thread completions.
///
/// Cloning shares the image.
#[derive(Clone)]
pub struct MockImage {
    inner: Arc<ImageInner>,
}

impl std::fmt::Debug for MockImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockImage")
            .field("spec", &self.inner.spec)
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl MockImage {
    pub fn new(spec: MockImageSpec) -> Self {
        let data = Arc::new(RwLock::new(vec![0u8; spec.size as usize]));
        let fired = Arc::new(AtomicU64::new(0));
        let (tx, rx) = channel::unbounded::<Job>();

        let workers = (0..spec.callback_threads.max(1))
            .map(|n| {
                let rx = rx.clone();
                let data = Arc::clone(&data);
                let fired = Arc::clone(&fired);
                std::thread::Builder::new()
                    .name(format!("mock-rbd-cb-{}", n))
                    .spawn(move || callback_loop(rx, data, fired))
                    .expect("failed to spawn mock callback thread")
            })
            .collect();

        Self {
            inner: Arc::new(ImageInner {
                spec,
                data,
                jobs: Some(tx),
                workers,
                pending: DashMap::new(),
                next_id: AtomicU64::new(1),
                completions_created: AtomicU64::new(0),
                submissions: AtomicU64::new(0),
                fired,
                fail_completion: Mutex::new(None),
                reject_submission: Mutex::new(None),
            }),
        }
    }

    pub fn spec(&self) -> &MockImageSpec {
        &self.inner.spec
    }

    /// Make the next `create_completion` fail with `code`.
    pub fn fail_next_completion(&self, code: i32) {
        *self.inner.fail_completion.lock() = Some(code);
    }

    /// Make the next `submit` reject with `code`.
    pub fn reject_next_submission(&self, code: i32) {
        *self.inner.reject_submission.lock() = Some(code);
    }

    /// Completion handles created so far.
    pub fn completions_created(&self) -> u64 {
        self.inner.completions_created.load(Ordering::Relaxed)
    }

    /// Submissions accepted so far.
    pub fn submissions(&self) -> u64 {
        self.inner.submissions.load(Ordering::Relaxed)
    }

    /// Completion callbacks fired so far.
    pub fn completions_fired(&self) -> u64 {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Parked operations in submission order.
    pub fn pending(&self) -> Vec<PendingOp> {
        let mut ops: Vec<PendingOp> = self
            .inner
            .pending
            .iter()
            .map(|entry| PendingOp {
                id: *entry.key(),
                op: entry.op,
                kind: entry.completion.ctx.kind(),
                token: entry.completion.ctx.token(),
            })
            .collect();
        ops.sort_by_key(|p| p.id);
        ops
    }

    /// Release a parked operation. It executes against the image on a
    /// callback thread; `raw` replaces the result librbd would have reported.
    /// Returns `false` if no such operation is parked.
    pub fn complete(&self, id: u64, raw: Option<i64>) -> bool {
        match self.inner.pending.remove(&id) {
            Some((_, mut job)) => {
                job.raw_override = raw;
                self.dispatch_job(job);
                true
            }
            None => false,
        }
    }

    /// Release every parked operation, newest first.
    pub fn complete_all_reversed(&self) -> usize {
        let ops = self.pending();
        for op in ops.iter().rev() {
            self.complete(op.id, None);
        }
        ops.len()
    }

    /// Copy bytes out of the image.
    pub fn read_image(&self, offset: u64, len: usize) -> Vec<u8> {
        let data = self.inner.data.read();
        let start = offset as usize;
        data[start..start + len].to_vec()
    }

    /// Overwrite bytes of the image directly.
    pub fn write_image(&self, offset: u64, bytes: &[u8]) {
        let mut data = self.inner.data.write();
        let start = offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn dispatch_job(&self, job: Job) {
        if let Some(tx) = &self.inner.jobs {
            // Workers only stop once the image is dropped.
            let _ = tx.send(job);
        }
    }
}

impl AioImage for MockImage {
    type Completion = MockCompletion;

    fn supports_write_zeroes(&self) -> bool {
        self.inner.spec.write_zeroes
    }

    fn create_completion(
        &self,
        ctx: Box<CompletionContext>,
    ) -> std::result::Result<MockCompletion, (i32, Box<CompletionContext>)> {
        if let Some(code) = self.inner.fail_completion.lock().take() {
            return Err((code, ctx));
        }
        self.inner.completions_created.fetch_add(1, Ordering::Relaxed);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(MockCompletion { id, ctx })
    }

    fn submit(&self, op: AioOp, completion: MockCompletion) -> std::result::Result<(), Rejected<MockCompletion>> {
        if let Some(code) = self.inner.reject_submission.lock().take() {
            return Err(Rejected { code, completion });
        }
        self.inner.submissions.fetch_add(1, Ordering::Relaxed);

        let job = Job {
            op,
            completion,
            raw_override: None,
        };
        match self.inner.spec.mode {
            CompletionMode::Immediate => self.dispatch_job(job),
            CompletionMode::Manual => {
                trace!(id = job.completion.id, ?op, "parking mock aio");
                self.inner.pending.insert(job.completion.id, job);
            }
        }
        Ok(())
    }
}

fn callback_loop(rx: Receiver<Job>, data: Arc<RwLock<Vec<u8>>>, fired: Arc<AtomicU64>) {
    for job in rx {
        let Job {
            op,
            completion: MockCompletion { id, ctx },
            raw_override,
        } = job;

        let actual = execute(&data, op, ctx.segments());
        let raw = raw_override.unwrap_or(actual);
        debug!(id, ?op, raw, "mock aio complete");

        fired.fetch_add(1, Ordering::Release);
        completion::finish_on_callback(ctx, raw);
    }
}

/// Apply `op` to the image bytes, returning what librbd would report.
fn execute(data: &RwLock<Vec<u8>>, op: AioOp, segments: &[IoSegment]) -> i64 {
    let total: usize = segments.iter().map(IoSegment::len).sum();
    match op {
        AioOp::Writev { offset } => {
            let mut data = data.write();
            let Some(mut pos) = start_of(offset, total as u64, data.len()) else {
                return -i64::from(EINVAL);
            };
            for seg in segments {
                // SAFETY: segments were translated against a live window.
                let src = unsafe { seg.as_slice() };
                data[pos..pos + src.len()].copy_from_slice(src);
                pos += src.len();
            }
            total as i64
        }
        AioOp::Readv { offset } => {
            let data = data.read();
            let Some(mut pos) = start_of(offset, total as u64, data.len()) else {
                return -i64::from(EINVAL);
            };
            for seg in segments {
                // SAFETY: as above; the front end leaves read buffers alone
                // while the request is in flight.
                let dst = unsafe { seg.as_mut_slice() };
                dst.copy_from_slice(&data[pos..pos + dst.len()]);
                pos += dst.len();
            }
            total as i64
        }
        AioOp::Flush => 0,
        AioOp::Discard { offset, len } | AioOp::WriteZeroes { offset, len } => {
            let mut data = data.write();
            match start_of(offset, len, data.len()) {
                Some(start) => {
                    data[start..start + len as usize].fill(0);
                    0
                }
                None => -i64::from(EINVAL),
            }
        }
    }
}

fn start_of(offset: u64, len: u64, size: usize) -> Option<usize> {
    let end = offset.checked_add(len)?;
    (end <= size as u64).then_some(offset as usize)
}

// =============================================================================
// Cluster
// =============================================================================

/// Lifecycle steps recorded by [`MockConnector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    ClusterCreated,
    ConfRead(PathBuf),
    ConfSet(String, String),
    Connected,
    IoCtxCreated(String),
    ImageOpened(String),
    ImageClosed(String),
    IoCtxDestroyed(String),
    ClusterShutdown,
}

type EventLog = Arc<Mutex<Vec<LifecycleEvent>>>;

#[derive(Default)]
struct ConnectorInner {
    images: DashMap<(String, String), MockImageSpec>,
    fault: Mutex<Option<(OpenStep, i32)>>,
    events: EventLog,
}

/// Mock cluster: registered pools and images, step fault injection, and a
/// log of every acquire/release.
#[derive(Clone, Default)]
pub struct MockConnector {
    inner: Arc<ConnectorInner>,
}

impl std::fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnector")
            .field("images", &self.inner.images.len())
            .finish()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an image (and implicitly its pool).
    pub fn register_image(&self, pool: &str, image: &str, spec: MockImageSpec) {
        self.inner
            .images
            .insert((pool.to_string(), image.to_string()), spec);
    }

    /// Fail `step` with `code` on the next open.
    pub fn fail_at(&self, step: OpenStep, code: i32) {
        *self.inner.fault.lock() = Some((step, code));
    }

    /// Everything acquired and released so far, in order.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.inner.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.inner.events.lock().clear();
    }

    fn check(&self, step: OpenStep) -> RawResult<()> {
        let mut fault = self.inner.fault.lock();
        match fault.take() {
            Some((at, code)) if at == step => Err(code),
            other => {
                *fault = other;
                Ok(())
            }
        }
    }

    fn record(&self, event: LifecycleEvent) {
        self.inner.events.lock().push(event);
    }

    fn has_pool(&self, pool: &str) -> bool {
        self.inner.images.iter().any(|e| e.key().0 == pool)
    }
}

/// Mock cluster handle.
pub struct MockCluster {
    connected: bool,
    conf: HashMap<String, String>,
    events: EventLog,
}

impl MockCluster {
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn conf(&self, key: &str) -> Option<&str> {
        self.conf.get(key).map(String::as_str)
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        self.events.lock().push(LifecycleEvent::ClusterShutdown);
    }
}

/// Mock pool I/O context.
pub struct MockIoCtx {
    pool: String,
    events: EventLog,
}

impl Drop for MockIoCtx {
    fn drop(&mut self) {
        self.events
            .lock()
            .push(LifecycleEvent::IoCtxDestroyed(self.pool.clone()));
    }
}

/// Image opened through [`MockConnector`]; logs its close on drop.
pub struct MockOpenImage {
    name: String,
    image: MockImage,
    events: EventLog,
}

impl std::fmt::Debug for MockOpenImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockOpenImage")
            .field("name", &self.name)
            .field("image", &self.image)
            .finish()
    }
}

impl MockOpenImage {
    /// The shared image, for driving completions from tests.
    pub fn image(&self) -> &MockImage {
        &self.image
    }
}

impl std::ops::Deref for MockOpenImage {
    type Target = MockImage;

    fn deref(&self) -> &MockImage {
        &self.image
    }
}

impl Drop for MockOpenImage {
    fn drop(&mut self) {
        self.events
            .lock()
            .push(LifecycleEvent::ImageClosed(self.name.clone()));
    }
}

impl AioImage for MockOpenImage {
    type Completion = MockCompletion;

    fn supports_write_zeroes(&self) -> bool {
        self.image.supports_write_zeroes()
    }

    fn create_completion(
        &self,
        ctx: Box<CompletionContext>,
    ) -> std::result::Result<MockCompletion, (i32, Box<CompletionContext>)> {
        self.image.create_completion(ctx)
    }

    fn submit(&self, op: AioOp, completion: MockCompletion) -> std::result::Result<(), Rejected<MockCompletion>> {
        self.image.submit(op, completion)
    }
}

impl Connector for MockConnector {
    type Cluster = MockCluster;
    type IoCtx = MockIoCtx;
    type Image = MockOpenImage;

    fn create_cluster(&self, _cluster_name: &str, _user: &str, _flags: u64) -> RawResult<MockCluster> {
        self.check(OpenStep::CreateCluster)?;
        self.record(LifecycleEvent::ClusterCreated);
        Ok(MockCluster {
            connected: false,
            conf: HashMap::new(),
            events: Arc::clone(&self.inner.events),
        })
    }

    fn read_conf_file(&self, _cluster: &mut MockCluster, path: &Path) -> RawResult<()> {
        self.check(OpenStep::ReadConf)?;
        self.record(LifecycleEvent::ConfRead(path.to_path_buf()));
        Ok(())
    }

    fn set_conf(&self, cluster: &mut MockCluster, key: &str, value: &str) -> RawResult<()> {
        cluster.conf.insert(key.to_string(), value.to_string());
        self.record(LifecycleEvent::ConfSet(key.to_string(), value.to_string()));
        Ok(())
    }

    fn connect(&self, cluster: &mut MockCluster) -> RawResult<()> {
        self.check(OpenStep::Connect)?;
        cluster.connected = true;
        self.record(LifecycleEvent::Connected);
        Ok(())
    }

    fn create_ioctx(&self, _cluster: &MockCluster, pool: &str) -> RawResult<MockIoCtx> {
        self.check(OpenStep::CreateIoCtx)?;
        if !self.has_pool(pool) {
            return Err(-ENOENT);
        }
        self.record(LifecycleEvent::IoCtxCreated(pool.to_string()));
        Ok(MockIoCtx {
            pool: pool.to_string(),
            events: Arc::clone(&self.inner.events),
        })
    }

    fn open_image(&self, ioctx: &MockIoCtx, image: &str, _snapshot: Option<&str>) -> RawResult<MockOpenImage> {
        self.check(OpenStep::OpenImage)?;
        let spec = self
            .inner
            .images
            .get(&(ioctx.pool.clone(), image.to_string()))
            .map(|e| e.value().clone())
            .ok_or(-ENOENT)?;
        self.record(LifecycleEvent::ImageOpened(image.to_string()));
        Ok(MockOpenImage {
            name: image.to_string(),
            image: MockImage::new(spec),
            events: Arc::clone(&self.inner.events),
        })
    }
}
