//! Kubernetes node UUID lookup.
//!
//! Used by the node registry when a node was registered with an empty UUID.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use tracing::{debug, instrument, warn};

use crate::error::IcsError;

/// Prefix the cloud provider puts in front of the VM UUID in
/// `spec.providerID`.
pub const PROVIDER_PREFIX: &str = "ics://";

/// Source of the VM UUID backing a Kubernetes node.
#[async_trait]
pub trait NodeUuidSource: Send + Sync {
    async fn node_vm_uuid(&self, node_name: &str) -> Result<String, IcsError>;
}

/// Strip [`PROVIDER_PREFIX`] from a provider id. Ids without the prefix are
/// returned unchanged.
pub fn uuid_from_provider_id(provider_id: &str) -> &str {
    provider_id
        .strip_prefix(PROVIDER_PREFIX)
        .unwrap_or(provider_id)
}

/// Pick the VM UUID of `node`: the provider id when set, else the lower-cased
/// system UUID reported by the kubelet.
pub fn node_uuid(node: &Node) -> String {
    let provider_id = node
        .spec
        .as_ref()
        .and_then(|spec| spec.provider_id.as_deref())
        .unwrap_or_default();
    if !provider_id.is_empty() {
        return uuid_from_provider_id(provider_id).to_owned();
    }

    warn!(
        node = node.metadata.name.as_deref().unwrap_or_default(),
        "node has no providerID, using system UUID"
    );
    node.status
        .as_ref()
        .and_then(|status| status.node_info.as_ref())
        .map(|info| info.system_uuid.to_lowercase())
        .unwrap_or_default()
}

/// [`NodeUuidSource`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeNodeUuidSource {
    nodes: Api<Node>,
}

impl std::fmt::Debug for KubeNodeUuidSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeNodeUuidSource").finish_non_exhaustive()
    }
}

impl KubeNodeUuidSource {
    pub fn new(client: Client) -> Self {
        Self {
            nodes: Api::all(client),
        }
    }

    /// Build from the in-cluster or kubeconfig environment.
    pub async fn try_default() -> Result<Self, IcsError> {
        let client = Client::try_default()
            .await
            .map_err(|e| IcsError::Kubernetes(e.to_string()))?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl NodeUuidSource for KubeNodeUuidSource {
    #[instrument(skip(self))]
    async fn node_vm_uuid(&self, node_name: &str) -> Result<String, IcsError> {
        let node = self
            .nodes
            .get(node_name)
            .await
            .map_err(|e| IcsError::Kubernetes(format!("get node {node_name}: {e}")))?;
        let uuid = node_uuid(&node);
        debug!(%uuid, "retrieved node UUID");
        Ok(uuid)
    }
}
