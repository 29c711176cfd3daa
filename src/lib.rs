//! rbd-dispatch - Asynchronous RBD I/O dispatch for userspace block backends
//!
//! Takes block requests from a front-end device queue (read, write, flush,
//! discard, write-zeroes), submits each as an asynchronous librbd operation,
//! and reports every outcome back through one completion channel.
//!
//! # Architecture
//!
//! ```text
//! front-end queue ──▶ RbdBackend ──▶ Dispatcher ──▶ librbd (async submit)
//!                                                      │
//!                                       librbd finisher thread
//!                                                      ▼
//!        CompletionSink ◀── post ◀── normalize ◀── completion::finish
//! ```
//!
//! Every request accepted by a `submit_*` call completes exactly once, with
//! the request's token. A request the call rejects never completes; the
//! returned [`Error`] is the only signal.
//!
//! # Modules
//!
//! - [`backend`] - Operation table and queue registry
//! - [`completion`] - Completion contexts, bridge and channels
//! - [`config`] - Session configuration
//! - [`dispatch`] - Per-operation submission
//! - [`error`] - Error types
//! - [`queue`] - Front-end queue handle and statistics
//! - [`remote`] - Traits over the remote block service
//! - [`request`] - Request descriptors
//! - [`session`] - Cluster/pool/image lifecycle
//! - [`window`] - Shared memory window and buffer translation
//! - [`rbd`] - librados/librbd binding (feature `rbd`)
//! - [`mock`] - In-memory RBD stand-in (feature `mock-rbd`)

pub mod backend;
pub mod completion;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod queue;
pub mod remote;
pub mod request;
pub mod session;
pub mod window;

// librbd binding (feature-gated)
#[cfg(feature = "rbd")]
pub mod rbd;

#[cfg(any(test, feature = "mock-rbd"))]
pub mod mock;

mod proptests;

// Re-export commonly used types
pub use backend::RbdBackend;
pub use completion::{Completion, CompletionQueue, CompletionSink};
pub use config::SessionConfig;
pub use error::{Error, Result};
pub use queue::{Queue, QueueStatsSnapshot};
pub use request::{IoKind, Request};
pub use window::{IoSegment, RelSegment, ShmWindow};

#[cfg(feature = "rbd")]
pub use rbd::RbdConnector;

/// Returns the crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
