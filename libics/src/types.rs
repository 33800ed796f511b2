//! CSI data model: volumes, capabilities, requests and plugin metadata.
//!
//! These types are what the [`crate::CsiController`] and
//! [`crate::CsiIdentity`] traits exchange. They are all
//! [`Serialize`]/[`Deserialize`] so the CLI can print them as JSON.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Management-plane id of a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

/// How a volume is consumed on the node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AccessType {
    /// Formatted and mounted as a filesystem.
    #[default]
    Mount,
    /// Exposed as a raw block device.
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    #[serde(default)]
    pub access_type: AccessType,
    /// Filesystem type for mount volumes, e.g. `"ext4"`.
    #[serde(default = "default_fs_type")]
    pub fs_type: String,
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

fn default_fs_type() -> String {
    "ext4".to_owned()
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            access_type: AccessType::Mount,
            fs_type: default_fs_type(),
            mount_flags: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes, a whole number of GiB.
    pub capacity_bytes: u64,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Requests & responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    /// Desired capacity in bytes. Zero selects the default size.
    pub capacity_bytes: u64,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage class parameters. Keys are matched case-insensitively.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

impl CreateVolumeRequest {
    /// Look up a storage class parameter ignoring key case.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Context handed to the node plugin after a volume is attached.
pub type PublishContext = HashMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExpandVolumeResponse {
    pub capacity_bytes: u64,
    /// Whether the node must grow the filesystem afterwards.
    pub node_expansion_required: bool,
}

// ---------------------------------------------------------------------------
// Plugin info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub vendor_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Volumes can be expanded while attached.
    OnlineExpansion,
}
