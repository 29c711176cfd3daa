//! Error types for the RBD dispatch backend

use thiserror::Error;

use crate::request::IoKind;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

const EIO: i32 = 5;
const ENOMEM: i32 = 12;
const EINVAL: i32 = 22;
const ENOTCONN: i32 = 107;
const EALREADY: i32 = 114;
const EOPNOTSUPP: i32 = 95;
const ENOSPC: i32 = 28;

/// Errors that can occur while opening a session or dispatching a request.
///
/// Every variant is a synchronous failure: when a `submit_*` call returns one
/// of these, no completion will ever be posted for that request.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Dispatch Errors
    // =========================================================================
    /// Completion context could not be allocated
    #[error("Failed to allocate completion context for {segments} segments")]
    AllocationFailure { segments: usize },

    /// Remote completion handle could not be created
    #[error("Failed to create completion handle: {}", strerror(*code))]
    CompletionSetupFailure { code: i32 },

    /// Operation not supported by the open image
    #[error("Operation not supported: {op}")]
    UnsupportedOperation { op: IoKind },

    /// Remote service rejected the operation at submit time
    #[error("Submission of {op} rejected: {}", strerror(*code))]
    SubmissionFailure { op: IoKind, code: i32 },

    /// A buffer segment falls outside the shared memory window
    #[error("Segment {index} ({offset}+{len}) exceeds window of {window_len} bytes")]
    SegmentOutOfBounds {
        index: usize,
        offset: u64,
        len: u64,
        window_len: usize,
    },

    /// Segment list sums to more than a request can describe
    #[error("Transfer of {len} bytes exceeds the {} byte request limit", u32::MAX)]
    TransferTooLarge { len: u64 },

    /// Every queue id is taken
    #[error("Queue limit of {limit} reached")]
    TooManyQueues { limit: usize },

    /// No session is open
    #[error("Backend session is not open")]
    NotOpen,

    /// A session is already open
    #[error("Backend session is already open")]
    AlreadyOpen,

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// Cluster handle creation failed
    #[error("Couldn't create the cluster handle: {}", strerror(*code))]
    ClusterCreate { code: i32 },

    /// Reading the Ceph configuration file failed
    #[error("Cannot read config file {path}: {}", strerror(*code))]
    ConfRead { path: String, code: i32 },

    /// Connecting to the cluster failed
    #[error("Cannot connect to cluster: {}", strerror(*code))]
    Connect { code: i32 },

    /// I/O context creation for the pool failed
    #[error("Cannot create ioctx to {pool} pool: {}", strerror(*code))]
    IoCtxCreate { pool: String, code: i32 },

    /// Opening the image failed
    #[error("Cannot open image({image}): {}", strerror(*code))]
    ImageOpen { image: String, code: i32 },

    // =========================================================================
    // Ambient Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Negative errno equivalent, for front ends that speak C return codes.
    pub fn errno(&self) -> i32 {
        match self {
            Error::AllocationFailure { .. } => -ENOMEM,
            Error::CompletionSetupFailure { code }
            | Error::SubmissionFailure { code, .. }
            | Error::ClusterCreate { code }
            | Error::ConfRead { code, .. }
            | Error::Connect { code }
            | Error::IoCtxCreate { code, .. }
            | Error::ImageOpen { code, .. } => negative(*code),
            Error::UnsupportedOperation { .. } => -EOPNOTSUPP,
            Error::SegmentOutOfBounds { .. } | Error::TransferTooLarge { .. } | Error::Config(_) => {
                -EINVAL
            }
            Error::TooManyQueues { .. } => -ENOSPC,
            Error::NotOpen => -ENOTCONN,
            Error::AlreadyOpen => -EALREADY,
            Error::Io(e) => e.raw_os_error().map_or(-EIO, |c| -c),
        }
    }
}

/// Returned codes are negative errnos; anything else collapses to `-EIO`.
fn negative(code: i32) -> i32 {
    if code < 0 {
        code
    } else {
        -EIO
    }
}

/// Render a negative errno the way `strerror(-code)` would.
pub(crate) fn strerror(code: i32) -> String {
    std::io::Error::from_raw_os_error(code.saturating_abs()).to_string()
}
