//! Build script for rbd-dispatch
//!
//! This script handles:
//! - Linking librados and librbd when the `rbd` feature is enabled
//! - Setting up library search paths
//!
//! # Prerequisites
//!
//! ```bash
//! # Ubuntu/Debian:
//! sudo apt-get install librados-dev librbd-dev
//!
//! # Fedora/RHEL:
//! sudo dnf install librados-devel librbd-devel
//! ```
//!
//! # Environment Variables
//!
//! - `CEPH_DIR` - Path to a Ceph installation (default: /usr)

use std::env;
use std::path::PathBuf;

fn main() {
    // Only run linking logic when rbd feature is enabled
    if env::var_os("CARGO_FEATURE_RBD").is_none() {
        return;
    }

    println!("cargo:rerun-if-env-changed=CEPH_DIR");

    #[cfg(feature = "pkg-config")]
    {
        if find_with_pkg_config() {
            return;
        }
    }

    let ceph_dir = env::var("CEPH_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/usr"));

    // =========================================================================
    // Library Search Paths
    // =========================================================================

    for lib_dir in [ceph_dir.join("lib"), ceph_dir.join("lib64")] {
        if lib_dir.exists() {
            println!("cargo:rustc-link-search=native={}", lib_dir.display());
        }
    }

    // Multiarch layout (Debian/Ubuntu)
    if let Ok(triple) = env::var("TARGET") {
        let multiarch = ceph_dir.join("lib").join(triple.replace("-unknown-", "-"));
        if multiarch.exists() {
            println!("cargo:rustc-link-search=native={}", multiarch.display());
        }
    }

    // =========================================================================
    // Ceph Libraries
    // =========================================================================

    // rados_create2, rados_connect, rados_ioctx_create, ...
    println!("cargo:rustc-link-lib=rados");

    // rbd_open, rbd_aio_*, ...
    println!("cargo:rustc-link-lib=rbd");
}

// =============================================================================
// Alternative: pkg-config based discovery
// =============================================================================

/// Use pkg-config to find librados and librbd.
///
/// Enable with: cargo build --features "rbd,pkg-config"
#[cfg(feature = "pkg-config")]
fn find_with_pkg_config() -> bool {
    use pkg_config::Config;

    let rados = Config::new().probe("librados");
    let rbd = Config::new().probe("librbd");
    rados.is_ok() && rbd.is_ok()
}
