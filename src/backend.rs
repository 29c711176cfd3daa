//! RBD backend
//!
//! [`RbdBackend`] is the operation table a front end drives: `open`,
//! `close`, `release` and one `submit_*` entry per operation kind. It owns the
//! session and the registry of front-end queues.
//!
//! Submissions take `&self` and may run concurrently from several queue
//! threads. `open` and `close` take `&mut self`, so the session cannot be torn
//! down underneath a submission.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::completion::CompletionSink;
use crate::config::SessionConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::queue::{Queue, QueueStatsSnapshot};
use crate::remote::Connector;
use crate::request::Request;
use crate::session::Session;
use crate::window::ShmWindow;

/// Block backend over an RBD image.
pub struct RbdBackend<C: Connector> {
    config: SessionConfig,
    connector: C,
    session: Option<Session<C>>,
    queues: RwLock<Vec<Arc<Queue>>>,
}

impl<C: Connector> RbdBackend<C> {
    /// Create a closed backend.
    pub fn new(connector: C, config: SessionConfig) -> Self {
        Self {
            config,
            connector,
            session: None,
            queues: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Open the session described by the configuration.
    pub fn open(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Err(Error::AlreadyOpen);
        }
        self.config.validate()?;

        info!(image = %self.config.image_spec(), "Opening RBD backend");
        self.session = Some(Session::open(&self.connector, &self.config)?);
        Ok(())
    }

    /// Close the session. Requests still in flight are not waited for.
    pub fn close(&mut self) {
        let Some(session) = self.session.take() else {
            debug!("close on a backend that is not open");
            return;
        };

        let in_flight = self.stats().in_flight();
        if in_flight > 0 {
            warn!(in_flight, "Closing RBD backend with requests in flight");
        }

        session.close();
        info!(image = %self.config.image_spec(), "RBD backend closed");
    }

    /// Close (if needed) and free the backend.
    pub fn release(mut self) {
        self.close();
    }

    /// Register a front-end queue. Queue ids are assigned in registration
    /// order; once all `u16` ids are taken, registration fails.
    pub fn add_queue(&self, window: ShmWindow, sink: Arc<dyn CompletionSink>) -> Result<Arc<Queue>> {
        let mut queues = self.queues.write();
        let id = u16::try_from(queues.len()).map_err(|_| Error::TooManyQueues {
            limit: usize::from(u16::MAX) + 1,
        })?;
        let queue = Arc::new(Queue::new(id, window, sink));
        debug!(queue = queue.id(), window = ?queue.window(), "Added queue");
        queues.push(Arc::clone(&queue));
        Ok(queue)
    }

    pub fn queues(&self) -> Vec<Arc<Queue>> {
        self.queues.read().clone()
    }

    /// The open image.
    pub fn image(&self) -> Result<&C::Image> {
        self.session
            .as_ref()
            .map(Session::image)
            .ok_or(Error::NotOpen)
    }

    fn dispatcher(&self) -> Result<Dispatcher<'_, C::Image>> {
        self.image().map(Dispatcher::new)
    }

    pub fn submit_write(&self, queue: &Arc<Queue>, req: &Request) -> Result<()> {
        self.dispatcher()?.submit_write(queue, req)
    }

    pub fn submit_read(&self, queue: &Arc<Queue>, req: &Request) -> Result<()> {
        self.dispatcher()?.submit_read(queue, req)
    }

    pub fn submit_flush(&self, queue: &Arc<Queue>, req: &Request) -> Result<()> {
        self.dispatcher()?.submit_flush(queue, req)
    }

    pub fn submit_discard(&self, queue: &Arc<Queue>, req: &Request) -> Result<()> {
        self.dispatcher()?.submit_discard(queue, req)
    }

    pub fn submit_write_zero(&self, queue: &Arc<Queue>, req: &Request) -> Result<()> {
        self.dispatcher()?.submit_write_zero(queue, req)
    }

    /// Route by `req.kind`.
    pub fn submit(&self, queue: &Arc<Queue>, req: &Request) -> Result<()> {
        self.dispatcher()?.submit(queue, req)
    }

    /// Statistics summed over every registered queue.
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.queues
            .read()
            .iter()
            .map(|q| q.stats().snapshot())
            .fold(QueueStatsSnapshot::default(), QueueStatsSnapshot::merge)
    }
}

impl<C: Connector> std::fmt::Debug for RbdBackend<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RbdBackend")
            .field("image", &self.config.image_spec())
            .field("open", &self.is_open())
            .field("queues", &self.queues.read().len())
            .finish()
    }
}
