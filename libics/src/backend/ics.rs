//! ICS storage backend for CSI.
//!
//! [`IcsBackend`] implements [`CsiIdentity`] and [`CsiController`] on top of
//! a [`VolumeManager`] for the volume lifecycle and the [`NodeRegistry`] for
//! finding the VM behind a Kubernetes node.
//!
//! Capacities are rounded up to whole GiB, the unit the management plane
//! allocates in.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::controller::CsiController;
use crate::error::IcsError;
use crate::identity::CsiIdentity;
use crate::node_registry::NodeRegistry;
use crate::types::*;
use crate::volume::{DEFAULT_VOLUME_SIZE_GIB, GIB, VolumeManager, VolumeSpec, round_up_size};

pub const PLUGIN_NAME: &str = "csi.ics.inspur.com";

/// Storage class parameter naming the target datastore.
pub const PARAM_DATASTORE: &str = "datastoreurl";
/// Storage class parameter naming the filesystem type.
pub const PARAM_FS_TYPE: &str = "fstype";

pub const ATTR_DISK_TYPE: &str = "type";
pub const ATTR_DISK_UUID: &str = "diskUUID";
pub const ATTR_FS_TYPE: &str = "fstype";
pub const DISK_TYPE: &str = "ics-disk";

pub struct IcsBackend {
    volumes: VolumeManager,
    nodes: Arc<NodeRegistry>,
}

impl IcsBackend {
    pub fn new(volumes: VolumeManager, nodes: Arc<NodeRegistry>) -> Self {
        Self { volumes, nodes }
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }
}

fn require(value: &str, what: &str) -> Result<(), IcsError> {
    if value.is_empty() {
        return Err(IcsError::InvalidArgument(format!("{what} is empty")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for IcsBackend {
    async fn get_plugin_info(&self) -> Result<PluginInfo, IcsError> {
        Ok(PluginInfo {
            name: PLUGIN_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, IcsError> {
        // Healthy once the volume manager's virtual center is registered.
        Ok(self.volumes.is_registered())
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, IcsError> {
        Ok(vec![
            PluginCapability::ControllerService,
            PluginCapability::OnlineExpansion,
        ])
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for IcsBackend {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, IcsError> {
        require(&req.name, "volume name")?;

        let bytes = if req.capacity_bytes == 0 {
            DEFAULT_VOLUME_SIZE_GIB * GIB
        } else {
            req.capacity_bytes
        };
        let capacity_gb = round_up_size(bytes, GIB);

        let datastore_id = req
            .parameter(PARAM_DATASTORE)
            .filter(|ds| !ds.is_empty())
            .ok_or_else(|| {
                IcsError::InvalidArgument(format!(
                    "storage class parameter {PARAM_DATASTORE} is not set"
                ))
            })?
            .to_owned();
        let fs_type = req.parameter(PARAM_FS_TYPE).unwrap_or_default().to_owned();

        let volume_id = self
            .volumes
            .create_volume(&VolumeSpec {
                name: req.name.clone(),
                capacity_gb,
                datastore_id,
            })
            .await?;

        Ok(Volume {
            volume_id: VolumeId(volume_id),
            capacity_bytes: capacity_gb * GIB,
            volume_context: HashMap::from([
                (ATTR_DISK_TYPE.to_owned(), DISK_TYPE.to_owned()),
                (ATTR_FS_TYPE.to_owned(), fs_type),
            ]),
        })
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), IcsError> {
        require(&volume_id.0, "volume id")?;
        self.volumes.delete_volume(&volume_id.0, true).await
    }

    #[instrument(skip(self))]
    async fn controller_publish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<PublishContext, IcsError> {
        require(&volume_id.0, "volume id")?;
        require(node_id, "node id")?;

        let mut vm = self.nodes.get_node_by_name(node_id).await?;
        let disk_uuid = self.volumes.attach_volume(&mut vm, &volume_id.0).await?;
        info!(%disk_uuid, "volume published");

        Ok(HashMap::from([
            (ATTR_DISK_TYPE.to_owned(), DISK_TYPE.to_owned()),
            (ATTR_DISK_UUID.to_owned(), disk_uuid),
        ]))
    }

    #[instrument(skip(self))]
    async fn controller_unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<(), IcsError> {
        require(&volume_id.0, "volume id")?;
        require(node_id, "node id")?;

        let vm = self.nodes.get_node_by_name(node_id).await?;
        self.volumes.detach_volume(&vm, &volume_id.0).await
    }

    #[instrument(skip(self, capability))]
    async fn controller_expand_volume(
        &self,
        volume_id: &VolumeId,
        capacity_bytes: u64,
        capability: Option<&VolumeCapability>,
    ) -> Result<ExpandVolumeResponse, IcsError> {
        require(&volume_id.0, "volume id")?;
        let capacity_gb = round_up_size(capacity_bytes, GIB);
        self.volumes
            .expand_volume(&volume_id.0, capacity_gb)
            .await?;

        // Raw block volumes have no filesystem to grow.
        let node_expansion_required =
            !matches!(capability, Some(cap) if cap.access_type == AccessType::Block);
        Ok(ExpandVolumeResponse {
            capacity_bytes: capacity_gb * GIB,
            node_expansion_required,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::VmResolver;
    use crate::rest::Connector;
    use crate::sim::SimManagementPlane;
    use crate::vcenter::VirtualCenterRegistry;

    fn make_backend() -> (Arc<SimManagementPlane>, IcsBackend) {
        let sim = SimManagementPlane::shared("vc-1");
        sim.add_datacenter("dc-1", "dc");
        sim.add_vm("dc-1", "worker-1", "uuid-w1");
        let registry = Arc::new(VirtualCenterRegistry::new(
            Arc::clone(&sim) as Arc<dyn Connector>
        ));
        registry.register(sim.config());
        let nodes = Arc::new(NodeRegistry::new(VmResolver::new(Arc::clone(&registry))));
        let backend = IcsBackend::new(VolumeManager::new(registry, "vc-1"), nodes);
        (sim, backend)
    }

    fn create_request(name: &str, bytes: u64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.into(),
            capacity_bytes: bytes,
            parameters: HashMap::from([
                ("DatastoreURL".into(), "ds-1".into()),
                ("fsType".into(), "xfs".into()),
            ]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn plugin_info() {
        let (_sim, backend) = make_backend();
        let info = backend.get_plugin_info().await.unwrap();
        assert_eq!(info.name, PLUGIN_NAME);
        assert!(backend.probe().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn create_rounds_capacity_up() {
        let (sim, backend) = make_backend();
        let vol = backend
            .create_volume(create_request("pvc-1", GIB + 1))
            .await
            .unwrap();
        assert_eq!(vol.capacity_bytes, 2 * GIB);
        assert_eq!(vol.volume_context[ATTR_FS_TYPE], "xfs");
        assert_eq!(sim.volume(&vol.volume_id.0).unwrap().size, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn create_defaults_to_ten_gib() {
        let (_sim, backend) = make_backend();
        let vol = backend
            .create_volume(create_request("pvc-1", 0))
            .await
            .unwrap();
        assert_eq!(vol.capacity_bytes, DEFAULT_VOLUME_SIZE_GIB * GIB);
    }

    #[tokio::test]
    async fn create_requires_datastore() {
        let (_sim, backend) = make_backend();
        let err = backend
            .create_volume(CreateVolumeRequest {
                name: "pvc-1".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IcsError::InvalidArgument(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_and_unpublish() {
        let (sim, backend) = make_backend();
        backend
            .nodes()
            .register_node("uuid-w1", "worker-1")
            .await
            .unwrap();
        let vol = backend
            .create_volume(create_request("pvc-1", GIB))
            .await
            .unwrap();

        let ctx = backend
            .controller_publish_volume(&vol.volume_id, "worker-1")
            .await
            .unwrap();
        assert_eq!(ctx[ATTR_DISK_TYPE], DISK_TYPE);
        assert!(!ctx[ATTR_DISK_UUID].is_empty());

        backend
            .controller_unpublish_volume(&vol.volume_id, "worker-1")
            .await
            .unwrap();
        let calls = sim.calls();
        assert_eq!(calls.set_vm, 2);
    }

    #[tokio::test]
    async fn publish_unknown_node_fails() {
        let (_sim, backend) = make_backend();
        let err = backend
            .controller_publish_volume(&VolumeId::from("vol-1"), "ghost")
            .await
            .unwrap_err();
        assert_eq!(err, IcsError::NodeNotFound("ghost".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn expand_reports_node_expansion() {
        let (sim, backend) = make_backend();
        let id = VolumeId(sim.add_volume("ds-1", "pvc-1", 1.0));

        let rsp = backend
            .controller_expand_volume(&id, 3 * GIB - 5, None)
            .await
            .unwrap();
        assert_eq!(rsp.capacity_bytes, 3 * GIB);
        assert!(rsp.node_expansion_required);

        let block = VolumeCapability {
            access_type: AccessType::Block,
            ..Default::default()
        };
        let rsp = backend
            .controller_expand_volume(&id, 4 * GIB, Some(&block))
            .await
            .unwrap();
        assert!(!rsp.node_expansion_required);
    }

    #[tokio::test]
    async fn empty_ids_are_rejected() {
        let (_sim, backend) = make_backend();
        assert!(matches!(
            backend.delete_volume(&VolumeId::from("")).await,
            Err(IcsError::InvalidArgument(_))
        ));
        assert!(matches!(
            backend
                .controller_unpublish_volume(&VolumeId::from("v"), "")
                .await,
            Err(IcsError::InvalidArgument(_))
        ));
    }
}
