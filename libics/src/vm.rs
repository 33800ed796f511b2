use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::datacenter::Datacenter;
use crate::error::IcsError;
use crate::rest::{VmDisk, VmInfo};
use crate::vcenter::VirtualCenterRegistry;

/// A resolved virtual machine.
///
/// `info` is a snapshot of the remote document and is stale as soon as it is
/// fetched. Call [`VirtualMachine::renew`] before trusting placement or disk
/// fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub uuid: String,
    pub name: String,
    pub virtual_center_host: String,
    pub datacenter: Datacenter,
    pub info: VmInfo,
}

impl fmt::Display for VirtualMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) in {}", self.name, self.uuid, self.datacenter)
    }
}

impl VirtualMachine {
    pub fn new(datacenter: Datacenter, info: VmInfo) -> Self {
        Self {
            uuid: info.uuid.clone(),
            name: info.name.clone(),
            virtual_center_host: datacenter.virtual_center_host.clone(),
            datacenter,
            info,
        }
    }

    /// Management-plane id of the VM.
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Re-fetch the VM document through the live virtual center handle,
    /// reconnecting first when `reconnect` is set.
    pub async fn renew(
        &mut self,
        registry: &VirtualCenterRegistry,
        reconnect: bool,
    ) -> Result<(), IcsError> {
        let vc = registry.get(&self.virtual_center_host)?;
        if reconnect {
            vc.connect().await?;
        }
        let info = vc.client().await?.get_vm(&self.info.id).await?;
        debug!(vm = %self, state = %info.state, reconnect, "renewed VM");
        self.name = info.name.clone();
        self.info = info;
        Ok(())
    }

    /// The disk slot backed by `volume_id`, if attached.
    pub fn disk_for_volume(&self, volume_id: &str) -> Option<&VmDisk> {
        self.info.disks.iter().find(|d| d.volume.id == volume_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::rest::Connector;
    use crate::sim::SimManagementPlane;

    #[tokio::test]
    async fn renew_fetches_live_state() {
        let sim = SimManagementPlane::shared("vc-1");
        sim.add_datacenter("dc-1", "dc");
        let vm_id = sim.add_vm("dc-1", "node-1", "u-1");
        let registry = VirtualCenterRegistry::new(Arc::clone(&sim) as Arc<dyn Connector>);
        registry.register(sim.config());

        let dc = Datacenter {
            id: "dc-1".into(),
            name: "dc".into(),
            virtual_center_host: "vc-1".into(),
        };
        let mut vm = dc.lookup_vm(&registry, "", "u-1").await.unwrap();
        assert_eq!(vm.info.state, "STARTED");

        sim.set_vm_state(&vm_id, "STOPPED");
        vm.renew(&registry, false).await.unwrap();
        assert_eq!(vm.info.state, "STOPPED");
        assert_eq!(sim.calls().connects, 1);

        vm.renew(&registry, true).await.unwrap();
        assert_eq!(sim.calls().connects, 2);
        assert_eq!(sim.calls().get_vm, 2);
    }

    #[tokio::test]
    async fn renew_unknown_host_fails() {
        let sim = SimManagementPlane::shared("vc-1");
        let registry = VirtualCenterRegistry::new(Arc::clone(&sim) as Arc<dyn Connector>);
        let mut vm = VirtualMachine::new(
            Datacenter {
                id: "dc-1".into(),
                name: "dc".into(),
                virtual_center_host: "gone".into(),
            },
            VmInfo {
                id: "vm-1".into(),
                ..Default::default()
            },
        );
        let err = vm.renew(&registry, true).await.unwrap_err();
        assert_eq!(err, IcsError::NotRegistered("gone".into()));
    }
}
