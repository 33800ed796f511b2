//! Wires the driver configuration into the libics components.

use std::sync::Arc;

use anyhow::{Context, Result};
use libics::config::DriverConfig;
use libics::{
    Connector, IcsBackend, KubeNodeUuidSource, NodeRegistry, RestConnector, VirtualCenterRegistry,
    VmResolver, VolumeManager,
};
use tracing::{info, warn};

pub struct Driver {
    pub registry: Arc<VirtualCenterRegistry>,
    pub resolver: VmResolver,
    pub backend: IcsBackend,
}

impl Driver {
    /// Build the driver over `connector`.
    ///
    /// Volumes are managed on the first configured virtual center.
    pub fn new(
        config: &DriverConfig,
        connector: Arc<dyn Connector>,
        insecure: bool,
        kube: Option<KubeNodeUuidSource>,
    ) -> Result<Self> {
        let registry = Arc::new(VirtualCenterRegistry::new(connector));
        for vc in config.virtual_center_configs() {
            let vc = if insecure { vc.with_insecure(true) } else { vc };
            info!(virtual_center = %vc, "registering virtual center");
            registry.register(vc);
        }
        let volume_host = config
            .virtual_centers
            .first()
            .map(|vc| vc.host.clone())
            .context("no virtual center configured")?;

        let resolver =
            VmResolver::with_pool_size(Arc::clone(&registry), config.global.resolver_pool_size);
        let mut nodes = NodeRegistry::new(resolver.clone());
        if let Some(source) = kube {
            nodes = nodes.with_uuid_source(Arc::new(source));
        }

        let volumes = VolumeManager::new(Arc::clone(&registry), volume_host);
        Ok(Self {
            registry,
            resolver,
            backend: IcsBackend::new(volumes, Arc::new(nodes)),
        })
    }

    /// Build the driver against the real management planes, asking
    /// Kubernetes for node UUIDs unless `use_kube` is false.
    pub async fn connect(config: &DriverConfig, insecure: bool, use_kube: bool) -> Result<Self> {
        let kube = if use_kube {
            match KubeNodeUuidSource::try_default().await {
                Ok(source) => Some(source),
                Err(e) => {
                    warn!(error = %e, "kubernetes unavailable, node UUIDs must be given");
                    None
                }
            }
        } else {
            None
        };
        Self::new(config, Arc::new(RestConnector), insecure, kube)
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        self.backend.nodes()
    }
}

#[cfg(test)]
mod tests {
    use libics::sim::SimManagementPlane;

    use super::*;

    const CONFIG: &str = r#"
global:
  resolver_pool_size: 2
virtual_centers:
  - host: vc-1
    user: admin
    password: admin
"#;

    #[tokio::test]
    async fn registers_configured_virtual_centers() {
        let config = DriverConfig::from_yaml(CONFIG).unwrap();
        let sim = SimManagementPlane::shared("vc-1");
        let driver = Driver::new(&config, sim, true, None).unwrap();

        let vc = driver.registry.get("vc-1").unwrap();
        assert!(vc.config().insecure);
        assert_eq!(driver.registry.len(), 1);
        assert_eq!(driver.resolver.pool_size(), 2);
    }

    #[tokio::test]
    async fn resolves_through_configured_registry() {
        let config = DriverConfig::from_yaml(CONFIG).unwrap();
        let sim = SimManagementPlane::shared("vc-1");
        sim.add_datacenter("dc-1", "dc");
        sim.add_vm("dc-1", "worker-1", "abc");
        let driver = Driver::new(&config, sim, false, None).unwrap();

        driver.nodes().register_node("", "worker-1").await.unwrap();
        let vm = driver.nodes().get_node_by_name("worker-1").await.unwrap();
        assert_eq!(vm.uuid, "abc");
    }
}
