//! Session configuration
//!
//! A [`SessionConfig`] names the cluster, pool and image a backend opens. It
//! deserializes from YAML or JSON; every field except `pool` and `image` has a
//! default matching a stock Ceph client setup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default cluster name
pub const DEFAULT_CLUSTER_NAME: &str = "ceph";

/// Default client name
pub const DEFAULT_USER: &str = "client.admin";

/// Default Ceph configuration file
pub const DEFAULT_CEPH_CONF: &str = "/etc/ceph/ceph.conf";

/// Configuration for opening an RBD session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Cluster name passed to the cluster handle
    pub cluster_name: String,

    /// Client (user) name, e.g. `client.admin`
    pub user: String,

    /// Path to the Ceph configuration file
    pub ceph_conf: PathBuf,

    /// Pool holding the image
    pub pool: String,

    /// Image name
    pub image: String,

    /// Open the image at this snapshot (read-only) instead of the head
    pub snapshot: Option<String>,

    /// Flags for cluster handle creation
    pub flags: u64,

    /// Options applied with `rados_conf_set` after the configuration file.
    /// Failures to apply them are logged and ignored.
    pub conf_overrides: BTreeMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let mut conf_overrides = BTreeMap::new();
        conf_overrides.insert("rbd_cache".to_string(), "false".to_string());

        Self {
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            user: DEFAULT_USER.to_string(),
            ceph_conf: PathBuf::from(DEFAULT_CEPH_CONF),
            pool: String::new(),
            image: String::new(),
            snapshot: None,
            flags: 0,
            conf_overrides,
        }
    }
}

impl SessionConfig {
    /// Configuration for `pool/image` with every other field defaulted.
    pub fn new(pool: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Load from a `.yaml`/`.yml` or `.json` file and validate.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&text)?,
            Some("json") => Self::from_json(&text)?,
            _ => {
                return Err(Error::Config(format!(
                    "unsupported config format: {}",
                    path.display()
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Config(format!("invalid YAML: {}", e)))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(format!("invalid JSON: {}", e)))
    }

    /// Check that the configuration names something to open.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(Error::Config("cluster_name must not be empty".into()));
        }
        if self.user.is_empty() {
            return Err(Error::Config("user must not be empty".into()));
        }
        if self.pool.is_empty() {
            return Err(Error::Config("pool must not be empty".into()));
        }
        if self.image.is_empty() {
            return Err(Error::Config("image must not be empty".into()));
        }
        if self.snapshot.as_deref() == Some("") {
            return Err(Error::Config("snapshot must not be empty when set".into()));
        }
        if self.cluster_name.contains('\0')
            || self.user.contains('\0')
            || self.pool.contains('\0')
            || self.image.contains('\0')
        {
            return Err(Error::Config("names must not contain NUL bytes".into()));
        }
        Ok(())
    }

    /// `pool/image[@snapshot]`, as rbd tooling spells it.
    pub fn image_spec(&self) -> String {
        match &self.snapshot {
            Some(snap) => format!("{}/{}@{}", self.pool, self.image, snap),
            None => format!("{}/{}", self.pool, self.image),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::new("rbd", "disk0");
        assert_eq!(config.cluster_name, "ceph");
        assert_eq!(config.user, "client.admin");
        assert_eq!(config.ceph_conf, PathBuf::from("/etc/ceph/ceph.conf"));
        assert_eq!(config.conf_overrides.get("rbd_cache").map(String::as_str), Some("false"));
        assert!(config.validate().is_ok());
        assert_eq!(config.image_spec(), "rbd/disk0");
    }

    #[test]
    fn test_from_yaml() {
        let config = SessionConfig::from_yaml(
            "pool: rbd\nimage: vm-100-disk-0\nsnapshot: nightly\nconf_overrides:\n  rbd_cache: \"true\"\n",
        )
        .unwrap();
        assert_eq!(config.pool, "rbd");
        assert_eq!(config.snapshot.as_deref(), Some("nightly"));
        assert_eq!(config.user, DEFAULT_USER);
        assert_eq!(config.conf_overrides.get("rbd_cache").map(String::as_str), Some("true"));
        assert_eq!(config.image_spec(), "rbd/vm-100-disk-0@nightly");
    }

    #[test]
    fn test_from_json() {
        let config =
            SessionConfig::from_json(r#"{"pool": "data", "image": "img", "user": "client.tcmu"}"#)
                .unwrap();
        assert_eq!(config.user, "client.tcmu");
        assert_eq!(config.cluster_name, DEFAULT_CLUSTER_NAME);
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert_matches!(
            SessionConfig::from_yaml("pool: rbd\nimage: a\nrbd_cache: false\n"),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_validate() {
        assert_matches!(SessionConfig::default().validate(), Err(Error::Config(_)));
        assert_matches!(SessionConfig::new("rbd", "").validate(), Err(Error::Config(_)));

        let mut config = SessionConfig::new("rbd", "disk");
        config.snapshot = Some(String::new());
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_from_file_by_extension() {
        let dir = std::env::temp_dir().join(format!("rbd-dispatch-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let yaml = dir.join("session.yaml");
        std::fs::write(&yaml, "pool: rbd\nimage: disk\n").unwrap();
        assert_eq!(SessionConfig::from_file(&yaml).unwrap().image, "disk");

        let txt = dir.join("session.txt");
        std::fs::write(&txt, "pool: rbd\n").unwrap();
        assert_matches!(SessionConfig::from_file(&txt), Err(Error::Config(_)));

        assert_matches!(
            SessionConfig::from_file(dir.join("missing.json")),
            Err(Error::Io(_))
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
