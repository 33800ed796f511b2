//! Volume operations on one virtual center.
//!
//! Every operation reconnects the virtual center, issues the remote command
//! and waits for its task with the [`TaskPoller`]. A task that reports
//! `ERROR` becomes [`IcsError::TaskFailed`]; one still running when polling
//! gives up becomes [`IcsError::TaskIncomplete`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::error::IcsError;
use crate::rest::{CreateVolumeRequest, ManagementApi, VmDisk, VolumeInfo};
use crate::task::{Task, TaskPoller};
use crate::vcenter::VirtualCenterRegistry;
use crate::vm::VirtualMachine;

pub const GIB: u64 = 1024 * 1024 * 1024;
/// Capacity used when a request does not ask for one.
pub const DEFAULT_VOLUME_SIZE_GIB: u64 = 10;

const DATASTORE_TYPE: &str = "LOCAL";
const VOLUME_POLICY: &str = "THIN";
const VOLUME_DESCRIPTION: &str = "CSI Persistent Volume";
/// VNC password written back with every VM update.
const VNC_PASSWORD: &str = "00000000";

/// Number of `unit`-sized allocation units needed to hold `bytes`.
pub fn round_up_size(bytes: u64, unit: u64) -> u64 {
    bytes.div_ceil(unit)
}

/// Parameters of a new volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub capacity_gb: u64,
    pub datastore_id: String,
}

/// Disk slot for attaching `volume` on the SCSI bus.
pub fn scsi_disk(volume: VolumeInfo) -> VmDisk {
    let mut volume = volume;
    volume.disk_type = "SAS".into();
    VmDisk {
        id: volume.id.clone(),
        enabled: false,
        bus_model: "SCSI".into(),
        read_write_model: "NONE".into(),
        enable_native_io: false,
        queue_num: 1,
        volume,
        ..Default::default()
    }
}

#[derive(Debug, Clone)]
pub struct VolumeManager {
    registry: Arc<VirtualCenterRegistry>,
    host: String,
    poller: TaskPoller,
}

impl VolumeManager {
    /// Manager for the volumes of the virtual center registered as `host`.
    pub fn new(registry: Arc<VirtualCenterRegistry>, host: impl Into<String>) -> Self {
        Self {
            registry,
            host: host.into(),
            poller: TaskPoller::default(),
        }
    }

    pub fn with_poller(mut self, poller: TaskPoller) -> Self {
        self.poller = poller;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_registered(&self) -> bool {
        self.registry.get(&self.host).is_ok()
    }

    async fn connect(&self) -> Result<Arc<dyn ManagementApi>, IcsError> {
        let vc = self.registry.get(&self.host)?;
        vc.connect().await?;
        vc.client().await
    }

    async fn wait(&self, api: &dyn ManagementApi, task: &Task, op: &str) -> Result<(), IcsError> {
        debug!(%task, op, "waiting for task");
        self.poller.wait(api, task).await.inspect_err(|e| {
            error!(%task, op, error = %e, "task did not finish");
        })
    }

    /// Create a volume and return its id.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn create_volume(&self, spec: &VolumeSpec) -> Result<String, IcsError> {
        if spec.name.is_empty() {
            return Err(IcsError::InvalidArgument("volume name is empty".into()));
        }
        if spec.datastore_id.is_empty() {
            return Err(IcsError::InvalidArgument("datastore is not specified".into()));
        }

        let api = self.connect().await?;
        let req = CreateVolumeRequest {
            name: spec.name.clone(),
            size: spec.capacity_gb.to_string(),
            data_store_type: DATASTORE_TYPE.into(),
            data_store_id: spec.datastore_id.clone(),
            volume_policy: VOLUME_POLICY.into(),
            description: VOLUME_DESCRIPTION.into(),
            bootable: false,
            shared: false,
        };
        let task = api.create_volume(&req).await?;
        self.wait(api.as_ref(), &task, "create").await?;

        let volumes = api.get_volumes_in_datastore(&spec.datastore_id).await?;
        let volume = volumes
            .into_iter()
            .find(|v| v.name == spec.name)
            .ok_or_else(|| {
                IcsError::internal(format!(
                    "volume {} not found in datastore {} after creation",
                    spec.name, spec.datastore_id
                ))
            })?;
        info!(volume_id = %volume.id, "volume created");
        Ok(volume.id)
    }

    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn delete_volume(&self, volume_id: &str, remove_data: bool) -> Result<(), IcsError> {
        let api = self.connect().await?;
        let task = api.delete_volume(volume_id, remove_data).await?;
        self.wait(api.as_ref(), &task, "delete").await?;
        info!("volume deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn expand_volume(&self, volume_id: &str, capacity_gb: u64) -> Result<(), IcsError> {
        let api = self.connect().await?;
        let mut volume = api.get_volume(volume_id).await?;
        volume.size = capacity_gb as f64;
        let task = api.set_volume(&volume).await?;
        self.wait(api.as_ref(), &task, "expand").await?;
        info!(capacity_gb, "volume expanded");
        Ok(())
    }

    /// Attach a volume to `vm` and return the SCSI id of the new disk.
    ///
    /// `vm` is renewed (without reconnecting) once the task finishes.
    #[instrument(skip(self, vm), fields(host = %self.host, vm = %vm))]
    pub async fn attach_volume(
        &self,
        vm: &mut VirtualMachine,
        volume_id: &str,
    ) -> Result<String, IcsError> {
        let api = self.connect().await?;
        let volume = api.get_volume(volume_id).await?;

        let mut doc = vm.info.clone();
        doc.disks.push(scsi_disk(volume));
        doc.vnc_passwd = Some(VNC_PASSWORD.into());
        let task = api.set_vm(&doc).await?;
        self.wait(api.as_ref(), &task, "attach").await?;

        vm.renew(&self.registry, false).await?;
        let disk = vm.disk_for_volume(volume_id).ok_or_else(|| {
            IcsError::internal(format!("volume {volume_id} is not attached after the task finished"))
        })?;
        info!(scsi_id = %disk.scsi_id, "volume attached");
        Ok(disk.scsi_id.clone())
    }

    #[instrument(skip(self, vm), fields(host = %self.host, vm = %vm))]
    pub async fn detach_volume(&self, vm: &VirtualMachine, volume_id: &str) -> Result<(), IcsError> {
        let api = self.connect().await?;

        let mut doc = vm.info.clone();
        let before = doc.disks.len();
        doc.disks.retain(|disk| disk.id != volume_id);
        if doc.disks.len() == before {
            return Err(IcsError::InvalidArgument(format!(
                "volume {volume_id} is not attached to {vm}"
            )));
        }
        doc.vnc_passwd = Some(VNC_PASSWORD.into());

        let task = api.set_vm(&doc).await?;
        self.wait(api.as_ref(), &task, "detach").await?;
        info!("volume detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datacenter::Datacenter;
    use crate::rest::Connector;
    use crate::sim::SimManagementPlane;

    fn setup() -> (Arc<SimManagementPlane>, Arc<VirtualCenterRegistry>, VolumeManager) {
        let sim = SimManagementPlane::shared("vc-1");
        sim.add_datacenter("dc-1", "dc");
        let registry = Arc::new(VirtualCenterRegistry::new(
            Arc::clone(&sim) as Arc<dyn Connector>
        ));
        registry.register(sim.config());
        let manager = VolumeManager::new(Arc::clone(&registry), "vc-1");
        (sim, registry, manager)
    }

    async fn node_vm(sim: &SimManagementPlane, registry: &VirtualCenterRegistry) -> VirtualMachine {
        sim.add_vm("dc-1", "node-1", "u-1");
        Datacenter {
            id: "dc-1".into(),
            name: "dc".into(),
            virtual_center_host: "vc-1".into(),
        }
        .lookup_vm(registry, "", "u-1")
        .await
        .unwrap()
    }

    #[test]
    fn rounds_up_to_whole_units() {
        assert_eq!(round_up_size(1, GIB), 1);
        assert_eq!(round_up_size(GIB, GIB), 1);
        assert_eq!(round_up_size(GIB + 1, GIB), 2);
        assert_eq!(round_up_size(0, GIB), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn create_returns_new_volume_id() {
        let (sim, _registry, manager) = setup();
        let id = manager
            .create_volume(&VolumeSpec {
                name: "pvc-1".into(),
                capacity_gb: 5,
                datastore_id: "ds-1".into(),
            })
            .await
            .unwrap();
        let volume = sim.volume(&id).unwrap();
        assert_eq!(volume.name, "pvc-1");
        assert_eq!(volume.size, 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_task_is_reported() {
        let (sim, _registry, manager) = setup();
        let id = sim.add_volume("ds-1", "pvc-1", 1.0);
        sim.script_next_command(&["RUNNING", "ERROR"]);
        let err = manager.delete_volume(&id, true).await.unwrap_err();
        assert!(matches!(err, IcsError::TaskFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unfinished_task_is_incomplete() {
        let (sim, _registry, manager) = setup();
        let id = sim.add_volume("ds-1", "pvc-1", 1.0);
        sim.script_next_command(&["RUNNING"]);
        let err = manager.expand_volume(&id, 20).await.unwrap_err();
        assert!(matches!(err, IcsError::TaskIncomplete { state, .. } if state == "RUNNING"));
    }

    #[tokio::test(start_paused = true)]
    async fn expand_sets_size() {
        let (sim, _registry, manager) = setup();
        let id = sim.add_volume("ds-1", "pvc-1", 1.0);
        manager.expand_volume(&id, 20).await.unwrap();
        assert_eq!(sim.volume(&id).unwrap().size, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_then_detach() {
        let (sim, registry, manager) = setup();
        let mut vm = node_vm(&sim, &registry).await;
        let id = sim.add_volume("ds-1", "pvc-1", 1.0);

        let scsi = manager.attach_volume(&mut vm, &id).await.unwrap();
        assert!(!scsi.is_empty());
        assert_eq!(vm.info.disks.len(), 1);
        assert_eq!(vm.info.disks[0].bus_model, "SCSI");
        assert_eq!(vm.info.vnc_passwd.as_deref(), Some(VNC_PASSWORD));

        manager.detach_volume(&vm, &id).await.unwrap();
        assert!(sim.vm(vm.id()).unwrap().disks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn detach_unknown_disk_is_rejected() {
        let (sim, registry, manager) = setup();
        let vm = node_vm(&sim, &registry).await;
        let err = manager.detach_volume(&vm, "vol-x").await.unwrap_err();
        assert!(matches!(err, IcsError::InvalidArgument(_)));
        assert_eq!(sim.calls().set_vm, 0);
    }
}
