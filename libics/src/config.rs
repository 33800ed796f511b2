//! Driver configuration.
//!
//! Loaded from a YAML file. The path comes from the command line, else from
//! the environment:
//! - `ICS_CSI_CONFIG`: path of the configuration file. Defaults to
//!   `/etc/ics-csi/csi-config.yaml`.
//!
//! ```yaml
//! global:
//!   cluster_id: k8s-cluster-1
//!   resolver_pool_size: 4
//! virtual_centers:
//!   - host: 10.0.0.10
//!     port: 443
//!     user: admin
//!     password: secret
//!     insecure: true
//!     datacenters: "dc-a, dc-b"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::IcsError;
use crate::resolver::DEFAULT_POOL_SIZE;
use crate::vcenter::{DEFAULT_SCHEME, VirtualCenterConfig, parse_datacenter_paths};

pub const CONFIG_PATH_ENV: &str = "ICS_CSI_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ics-csi/csi-config.yaml";

/// Configuration file path from the environment, read at first access.
pub static CONFIG_PATH: LazyLock<PathBuf> = LazyLock::new(|| {
    std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
});

fn default_port() -> u16 {
    443
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default = "default_pool_size")]
    pub resolver_pool_size: usize,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            resolver_pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

/// One `virtual_centers` entry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualCenterEntry {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub insecure: bool,
    /// Comma-separated datacenter ids or names; empty searches all.
    #[serde(default)]
    pub datacenters: String,
}

impl fmt::Debug for VirtualCenterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualCenterEntry")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .field("datacenters", &self.datacenters)
            .finish()
    }
}

impl VirtualCenterEntry {
    pub fn to_virtual_center_config(&self) -> VirtualCenterConfig {
        VirtualCenterConfig {
            scheme: DEFAULT_SCHEME.to_owned(),
            host: self.host.clone(),
            port: self.port,
            username: self.user.clone(),
            password: self.password.clone(),
            insecure: self.insecure,
            datacenter_paths: parse_datacenter_paths(&self.datacenters),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub virtual_centers: Vec<VirtualCenterEntry>,
}

impl DriverConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, IcsError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| IcsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the file at `path`.
    pub fn load(path: &Path) -> Result<Self, IcsError> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| IcsError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_yaml(&yaml)
    }

    /// Load from `path`, or from [`CONFIG_PATH`] when `None`.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, IcsError> {
        Self::load(path.unwrap_or(CONFIG_PATH.as_path()))
    }

    pub fn validate(&self) -> Result<(), IcsError> {
        if self.virtual_centers.is_empty() {
            return Err(IcsError::Config("no virtual center configured".into()));
        }
        for (i, vc) in self.virtual_centers.iter().enumerate() {
            if vc.host.trim().is_empty() {
                return Err(IcsError::Config(format!("virtual_centers[{i}]: host is empty")));
            }
            if vc.port == 0 {
                return Err(IcsError::Config(format!(
                    "virtual_centers[{i}] ({}): port must be non-zero",
                    vc.host
                )));
            }
        }
        if self.global.resolver_pool_size == 0 {
            return Err(IcsError::Config("resolver_pool_size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn virtual_center_configs(&self) -> Vec<VirtualCenterConfig> {
        self.virtual_centers
            .iter()
            .map(VirtualCenterEntry::to_virtual_center_config)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = r#"
global:
  cluster_id: k8s-1
virtual_centers:
  - host: 10.0.0.10
    user: admin
    password: secret
    insecure: true
    datacenters: " dc-a, ,dc-b "
  - host: 10.0.0.11
    port: 8443
    user: ops
    password: other
"#;

    #[test]
    fn parses_sample() {
        let config = DriverConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.global.cluster_id, "k8s-1");
        assert_eq!(config.global.resolver_pool_size, DEFAULT_POOL_SIZE);

        let vcs = config.virtual_center_configs();
        assert_eq!(vcs.len(), 2);
        assert_eq!(vcs[0].port, 443);
        assert!(vcs[0].insecure);
        assert_eq!(vcs[0].datacenter_paths, vec!["dc-a", "dc-b"]);
        assert_eq!(vcs[1].port, 8443);
        assert!(vcs[1].datacenter_paths.is_empty());
    }

    #[test]
    fn rejects_empty_virtual_centers() {
        let err = DriverConfig::from_yaml("global: {}\n").unwrap_err();
        assert!(matches!(err, IcsError::Config(_)));
    }

    #[test]
    fn rejects_empty_host_and_zero_port() {
        let yaml = "virtual_centers:\n  - host: ''\n    user: a\n    password: b\n";
        assert!(DriverConfig::from_yaml(yaml).is_err());

        let yaml = "virtual_centers:\n  - host: vc\n    port: 0\n    user: a\n    password: b\n";
        assert!(DriverConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn debug_hides_password() {
        let config = DriverConfig::from_yaml(SAMPLE).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret"));
        assert!(!debug.contains("other"));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = DriverConfig::load(file.path()).unwrap();
        assert_eq!(config.virtual_centers.len(), 2);

        let err = DriverConfig::load(Path::new("/nonexistent/csi.yaml")).unwrap_err();
        assert!(matches!(err, IcsError::Config(_)));
    }
}
