//! CSI Identity service trait.

use async_trait::async_trait;

use crate::error::IcsError;
use crate::types::{PluginCapability, PluginInfo};

/// Identity service: plugin discovery and health probing.
#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Return the plugin name and version.
    async fn get_plugin_info(&self) -> Result<PluginInfo, IcsError>;

    /// Liveness probe. Returns `true` when the plugin is healthy.
    async fn probe(&self) -> Result<bool, IcsError>;

    /// Advertise the capabilities supported by this plugin.
    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, IcsError>;
}
