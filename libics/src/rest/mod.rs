//! Management-plane REST surface.
//!
//! The core never talks HTTP directly. It goes through [`ManagementApi`], an
//! authenticated session against one virtual center, obtained from a
//! [`Connector`]. [`client::RestClient`] is the production implementation;
//! [`crate::sim::SimManagementPlane`] is the in-memory one used by tests.

pub mod client;
pub mod payload;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::IcsError;
use crate::task::Task;
use crate::vcenter::VirtualCenterConfig;

pub use payload::{
    CreateVolumeRequest, DatacenterInfo, TaskInfo, VmDisk, VmInfo, VmNic, VolumeInfo,
};

/// An authenticated session against one management plane.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// List every datacenter of the management plane.
    async fn get_all_datacenters(&self) -> Result<Vec<DatacenterInfo>, IcsError>;

    /// Fetch one datacenter by id.
    async fn get_datacenter(&self, datacenter_id: &str) -> Result<DatacenterInfo, IcsError>;

    /// List the VMs placed in a datacenter.
    async fn get_datacenter_vm_list(&self, datacenter_id: &str) -> Result<Vec<VmInfo>, IcsError>;

    /// Fetch the live document of one VM by its management-plane id.
    async fn get_vm(&self, vm_id: &str) -> Result<VmInfo, IcsError>;

    /// Replace a VM document (disk attach/detach). Returns the remote task.
    async fn set_vm(&self, vm: &VmInfo) -> Result<Task, IcsError>;

    /// Start creating a volume.
    async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<Task, IcsError>;

    /// Start deleting a volume, optionally removing its data.
    async fn delete_volume(&self, volume_id: &str, remove_data: bool) -> Result<Task, IcsError>;

    /// Fetch one volume by id.
    async fn get_volume(&self, volume_id: &str) -> Result<VolumeInfo, IcsError>;

    /// Replace a volume document (resize). Returns the remote task.
    async fn set_volume(&self, volume: &VolumeInfo) -> Result<Task, IcsError>;

    /// List the volumes stored in a datastore.
    async fn get_volumes_in_datastore(&self, datastore_id: &str)
    -> Result<Vec<VolumeInfo>, IcsError>;

    /// Read the current state of a remote task.
    async fn get_task_info(&self, task_id: &str) -> Result<TaskInfo, IcsError>;
}

/// Establishes authenticated sessions.
///
/// Each call must return a fresh session; the virtual center handle replaces
/// its previous session with the returned one.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &VirtualCenterConfig,
    ) -> Result<Arc<dyn ManagementApi>, IcsError>;
}
