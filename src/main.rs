//! rbd-dispatch probe
//!
//! Opens the configured RBD image through the dispatch backend, pushes a
//! flush (and optionally a read) through the full submit/complete path, and
//! prints the resulting queue statistics.
//!
//! ```text
//! rbd-dispatch --config session.yaml --read-bytes 4096
//! rbd-dispatch --pool rbd --image disk0 --mock --log-json
//! ```

use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rbd_dispatch::remote::Connector;
use rbd_dispatch::{Completion, QueueStatsSnapshot, RbdBackend, RelSegment, Request, SessionConfig, ShmWindow};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Probe an RBD image through the asynchronous dispatch path
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Session configuration file (YAML or JSON)
    #[arg(long, env = "RBD_DISPATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Pool name (overrides the configuration file)
    #[arg(long, env = "RBD_POOL")]
    pool: Option<String>,

    /// Image name (overrides the configuration file)
    #[arg(long, env = "RBD_IMAGE")]
    image: Option<String>,

    /// Snapshot to open read-only
    #[arg(long, env = "RBD_SNAPSHOT")]
    snapshot: Option<String>,

    /// Ceph client name
    #[arg(long, env = "CEPH_USER")]
    user: Option<String>,

    /// Bytes to read from offset 0 after the flush (0 skips the read)
    #[arg(long, default_value = "0")]
    read_bytes: u32,

    /// Seconds to wait for each completion
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// Run against the in-memory image instead of a cluster
    #[arg(long)]
    mock: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => SessionConfig::default(),
        };

        if let Some(pool) = &self.pool {
            config.pool = pool.clone();
        }
        if let Some(image) = &self.image {
            config.image = image.clone();
        }
        if let Some(snapshot) = &self.snapshot {
            config.snapshot = Some(snapshot.clone());
        }
        if let Some(user) = &self.user {
            config.user = user.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = args.session_config()?;
    info!("Starting rbd-dispatch probe");
    info!("  Image: {}", config.image_spec());
    info!("  Cluster: {} as {}", config.cluster_name, config.user);
    info!("  Read probe: {} bytes", args.read_bytes);

    let stats = if args.mock {
        run_mock(&args, config).await?
    } else {
        run_rbd(&args, config).await?
    };

    println!("{}", serde_json::to_string_pretty(&stats)?);

    if stats.async_failures > 0 || stats.sync_failures > 0 || stats.in_flight() > 0 {
        bail!("probe finished with failures");
    }
    info!("Probe complete");
    Ok(())
}

#[cfg(feature = "mock-rbd")]
async fn run_mock(args: &Args, config: SessionConfig) -> anyhow::Result<QueueStatsSnapshot> {
    use rbd_dispatch::mock::{MockConnector, MockImageSpec};

    let connector = MockConnector::new();
    connector.register_image(&config.pool, &config.image, MockImageSpec::default());
    probe(args, RbdBackend::new(connector, config)).await
}

#[cfg(not(feature = "mock-rbd"))]
async fn run_mock(_args: &Args, _config: SessionConfig) -> anyhow::Result<QueueStatsSnapshot> {
    bail!("built without the in-memory image; rebuild with --features mock-rbd")
}

#[cfg(feature = "rbd")]
async fn run_rbd(args: &Args, config: SessionConfig) -> anyhow::Result<QueueStatsSnapshot> {
    probe(args, RbdBackend::new(rbd_dispatch::RbdConnector, config)).await
}

#[cfg(not(feature = "rbd"))]
async fn run_rbd(_args: &Args, _config: SessionConfig) -> anyhow::Result<QueueStatsSnapshot> {
    bail!("built without librbd support; rebuild with --features rbd or pass --mock")
}

// =============================================================================
// Probe
// =============================================================================

async fn probe<C: Connector>(args: &Args, mut backend: RbdBackend<C>) -> anyhow::Result<QueueStatsSnapshot> {
    backend.open().context("opening RBD backend")?;

    // A timed-out read may still land in the buffer, so it is never freed.
    let buffer: &'static mut [u8] = Box::leak(vec![0u8; args.read_bytes.max(1) as usize].into_boxed_slice());
    let base = NonNull::new(buffer.as_mut_ptr()).context("null probe buffer")?;
    // SAFETY: the buffer is leaked and therefore outlives every request.
    let window = unsafe { ShmWindow::from_raw_parts(base, buffer.len()) };

    let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
    let queue = backend.add_queue(window, Arc::new(tx))?;
    let timeout = Duration::from_secs(args.timeout_secs);

    let mut requests = vec![Request::flush(1)];
    if args.read_bytes > 0 {
        requests.push(Request::read(2, 0, vec![RelSegment::new(0, u64::from(args.read_bytes))])?);
    }

    for req in &requests {
        if let Err(e) = backend.submit(&queue, req) {
            error!("{} submission failed: {}", req.kind, e);
            continue;
        }

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(c)) if c.is_success() => info!(token = c.token, "{} completed", req.kind),
            Ok(Some(c)) => warn!(token = c.token, result = c.result, "{} failed", req.kind),
            Ok(None) => bail!("completion channel closed"),
            Err(_) => {
                error!("{} did not complete within {:?}", req.kind, timeout);
                break;
            }
        }
    }

    let stats = backend.stats();
    backend.release();
    Ok(stats)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
