//! Session lifecycle
//!
//! A [`Session`] holds the cluster handle, the pool's I/O context and the open
//! image. Each is an RAII value, so a failed [`Session::open`] releases what
//! it already acquired in reverse order, and dropping a session closes the
//! image, destroys the I/O context and shuts the cluster down, in that order.

use tracing::{error, info, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::remote::Connector;

/// Steps of [`Session::open`], in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenStep {
    CreateCluster,
    ReadConf,
    Connect,
    CreateIoCtx,
    OpenImage,
}

impl std::fmt::Display for OpenStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenStep::CreateCluster => write!(f, "create cluster"),
            OpenStep::ReadConf => write!(f, "read conf"),
            OpenStep::Connect => write!(f, "connect"),
            OpenStep::CreateIoCtx => write!(f, "create ioctx"),
            OpenStep::OpenImage => write!(f, "open image"),
        }
    }
}

/// An open image and the cluster resources backing it.
pub struct Session<C: Connector> {
    // Fields drop in declaration order: image, ioctx, cluster.
    image: C::Image,
    ioctx: C::IoCtx,
    cluster: C::Cluster,
}

impl<C: Connector> Session<C> {
    /// Connect to the cluster and open the configured image.
    pub fn open(connector: &C, config: &SessionConfig) -> Result<Self> {
        let mut cluster = connector
            .create_cluster(&config.cluster_name, &config.user, config.flags)
            .map_err(|code| {
                error!(code, "Couldn't create the cluster handle");
                Error::ClusterCreate { code }
            })?;
        info!(cluster = %config.cluster_name, user = %config.user, "Created cluster handle");

        connector
            .read_conf_file(&mut cluster, &config.ceph_conf)
            .map_err(|code| {
                error!(path = %config.ceph_conf.display(), code, "Cannot read config file");
                Error::ConfRead {
                    path: config.ceph_conf.display().to_string(),
                    code,
                }
            })?;
        info!(path = %config.ceph_conf.display(), "Read the config file");

        for (key, value) in &config.conf_overrides {
            if let Err(code) = connector.set_conf(&mut cluster, key, value) {
                warn!(key = %key, value = %value, code, "Could not apply conf override");
            }
        }

        connector.connect(&mut cluster).map_err(|code| {
            error!(code, "Cannot connect to cluster");
            Error::Connect { code }
        })?;
        info!("Connected to the cluster");

        let ioctx = connector
            .create_ioctx(&cluster, &config.pool)
            .map_err(|code| {
                error!(pool = %config.pool, code, "Cannot create ioctx");
                Error::IoCtxCreate {
                    pool: config.pool.clone(),
                    code,
                }
            })?;
        info!(pool = %config.pool, "Created I/O context");

        let image = connector
            .open_image(&ioctx, &config.image, config.snapshot.as_deref())
            .map_err(|code| {
                error!(image = %config.image, code, "Cannot open image");
                Error::ImageOpen {
                    image: config.image.clone(),
                    code,
                }
            })?;
        info!(image = %config.image_spec(), "Opened image");

        Ok(Self {
            image,
            ioctx,
            cluster,
        })
    }

    #[inline]
    pub fn image(&self) -> &C::Image {
        &self.image
    }

    #[inline]
    pub fn ioctx(&self) -> &C::IoCtx {
        &self.ioctx
    }

    #[inline]
    pub fn cluster(&self) -> &C::Cluster {
        &self.cluster
    }

    /// Close the image, destroy the I/O context, shut the cluster down.
    pub fn close(self) {
        let Self {
            image,
            ioctx,
            cluster,
        } = self;

        drop(image);
        info!("Closed image");
        drop(ioctx);
        info!("Destroyed I/O context");
        drop(cluster);
        info!("Shut down cluster handle");
    }
}

impl<C: Connector> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}
