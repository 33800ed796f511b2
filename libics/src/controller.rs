//! CSI Controller service trait.
//!
//! The Controller service owns the centralized volume lifecycle: creation,
//! deletion, attaching to and detaching from node VMs, and expansion.

use async_trait::async_trait;

use crate::error::IcsError;
use crate::types::{
    CreateVolumeRequest, ExpandVolumeResponse, PublishContext, Volume, VolumeCapability, VolumeId,
};

#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, IcsError>;

    /// Delete a volume and its data.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), IcsError>;

    /// Attach a volume to the VM backing `node_id` (the Kubernetes node
    /// name). The returned context is forwarded to the node plugin.
    async fn controller_publish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<PublishContext, IcsError>;

    /// Detach a volume from the VM backing `node_id`.
    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), IcsError>;

    /// Grow a volume to at least `capacity_bytes`.
    async fn controller_expand_volume(
        &self,
        volume_id: &VolumeId,
        capacity_bytes: u64,
        capability: Option<&VolumeCapability>,
    ) -> Result<ExpandVolumeResponse, IcsError>;
}
