//! Node registry: Kubernetes node name to VM UUID to resolved VM.
//!
//! Two independent concurrent maps, one keyed by node name and one by VM
//! UUID, so work on different nodes never contends. There is no transaction
//! across the two maps: a node can be registered but not yet discovered.
//!
//! Register and unregister of the *same* node name are serialized by a
//! per-name lock. Different names use different locks.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::error::IcsError;
use crate::kubernetes::NodeUuidSource;
use crate::resolver::VmResolver;
use crate::vcenter::VirtualCenterRegistry;
use crate::vm::VirtualMachine;

pub struct NodeRegistry {
    resolver: VmResolver,
    /// node name -> VM UUID (possibly empty)
    name_to_uuid: DashMap<String, String>,
    /// VM UUID -> last resolved VM
    nodes: DashMap<String, VirtualMachine>,
    name_locks: DashMap<String, Arc<Mutex<()>>>,
    uuid_source: Option<Arc<dyn NodeUuidSource>>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("registered", &self.name_to_uuid.len())
            .field("discovered", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

impl NodeRegistry {
    pub fn new(resolver: VmResolver) -> Self {
        Self {
            resolver,
            name_to_uuid: DashMap::new(),
            nodes: DashMap::new(),
            name_locks: DashMap::new(),
            uuid_source: None,
        }
    }

    /// Use `source` to fill in node UUIDs that were registered empty.
    pub fn with_uuid_source(mut self, source: Arc<dyn NodeUuidSource>) -> Self {
        self.uuid_source = Some(source);
        self
    }

    fn registry(&self) -> &VirtualCenterRegistry {
        self.resolver.registry()
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.name_locks
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Record `name -> uuid` and discover the VM right away.
    ///
    /// The mapping is kept even when discovery fails; the node is then known
    /// but not yet discovered. An empty `uuid` is replaced by the one
    /// discovery finds.
    #[instrument(skip(self))]
    pub async fn register_node(&self, uuid: &str, name: &str) -> Result<(), IcsError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let previous = self.name_to_uuid.insert(name.to_owned(), uuid.to_owned());
        if let Some(old) = previous.filter(|old| !old.is_empty() && old != uuid) {
            self.nodes.remove(&old);
            info!(%old, "dropped VM of previous registration");
        }
        info!("registered node");

        let vm = self.discover(uuid, name).await.inspect_err(|e| {
            error!(error = %e, "failed to discover VM for node");
        })?;
        if uuid.is_empty() {
            self.name_to_uuid.insert(name.to_owned(), vm.uuid);
        }
        Ok(())
    }

    /// Resolve the VM for `uuid` and cache it. A search miss is returned as
    /// [`IcsError::VmNotFound`] unchanged.
    #[instrument(skip(self))]
    pub async fn discover_node(&self, uuid: &str, name: &str) -> Result<(), IcsError> {
        self.discover(uuid, name).await.map(|_| ())
    }

    async fn discover(&self, uuid: &str, name: &str) -> Result<VirtualMachine, IcsError> {
        let vm = self.resolver.resolve(name, uuid).await?;
        info!(vm = %vm, "discovered node");
        // A node registered without a UUID is cached under the one found.
        let key = if uuid.is_empty() { &vm.uuid } else { uuid };
        self.nodes.insert(key.to_owned(), vm.clone());
        Ok(vm)
    }

    /// Cached UUID of a node.
    ///
    /// An empty cached UUID is fetched from Kubernetes and stored; a name
    /// that was never registered is [`IcsError::NodeNotFound`].
    pub async fn get_node_uuid(&self, name: &str) -> Result<String, IcsError> {
        let cached = self
            .name_to_uuid
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| IcsError::NodeNotFound(name.to_owned()))?;
        if !cached.is_empty() {
            return Ok(cached);
        }

        debug!(node = name, "empty node UUID in cache");
        let uuid = self.fetch_uuid(name).await?;
        self.name_to_uuid.insert(name.to_owned(), uuid.clone());
        Ok(uuid)
    }

    async fn fetch_uuid(&self, name: &str) -> Result<String, IcsError> {
        let Some(source) = self.uuid_source.as_ref() else {
            warn!(node = name, "no kubernetes source to fetch node UUID from");
            return Err(IcsError::NodeNotFound(name.to_owned()));
        };
        let uuid = source.node_vm_uuid(name).await.inspect_err(|e| {
            error!(node = name, error = %e, "failed to fetch node UUID from kubernetes");
        })?;
        if uuid.is_empty() {
            return Err(IcsError::NodeNotFound(name.to_owned()));
        }
        Ok(uuid)
    }

    /// Return the VM of a node, always fresh.
    ///
    /// An undiscovered node is discovered and cached. A cached one is
    /// renewed with a reconnect on every call.
    #[instrument(skip(self))]
    pub async fn get_node(&self, uuid: &str, name: &str) -> Result<VirtualMachine, IcsError> {
        let cached = self.nodes.get(uuid).map(|entry| entry.value().clone());
        let Some(mut vm) = cached else {
            debug!("node not discovered yet");
            return self.discover(uuid, name).await;
        };

        vm.renew(self.registry(), true).await.inspect_err(|e| {
            error!(vm = %vm, error = %e, "failed to renew VM");
        })?;
        // Do not resurrect an entry unregistered while renewing.
        if let Some(mut entry) = self.nodes.get_mut(uuid) {
            *entry = vm.clone();
        }
        Ok(vm)
    }

    /// [`Self::get_node`] by node name.
    pub async fn get_node_by_name(&self, name: &str) -> Result<VirtualMachine, IcsError> {
        let uuid = self.get_node_uuid(name).await?;
        self.get_node(&uuid, name).await
    }

    /// Renew and return every discovered node.
    ///
    /// Each virtual center is reconnected at most once per sweep. The first
    /// renewal failure aborts the sweep and no partial result is returned.
    /// Nodes added or removed concurrently may or may not be included.
    #[instrument(skip(self))]
    pub async fn get_all_nodes(&self) -> Result<Vec<VirtualMachine>, IcsError> {
        self.fill_empty_uuids().await;

        let snapshot: Vec<(String, VirtualMachine)> = self
            .nodes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut reconnected: HashSet<String> = HashSet::new();
        let mut vms = Vec::with_capacity(snapshot.len());
        for (uuid, mut vm) in snapshot {
            let reconnect = reconnected.insert(vm.virtual_center_host.clone());
            debug!(vm = %vm, reconnect, "renewing VM");
            vm.renew(self.registry(), reconnect).await.inspect_err(|e| {
                error!(vm = %vm, error = %e, "failed to renew VM, aborting sweep");
            })?;
            if let Some(mut entry) = self.nodes.get_mut(&uuid) {
                *entry = vm.clone();
            }
            vms.push(vm);
        }
        Ok(vms)
    }

    async fn fill_empty_uuids(&self) {
        let empty: Vec<String> = self
            .name_to_uuid
            .iter()
            .filter(|entry| entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        for name in empty {
            match self.fetch_uuid(&name).await {
                Ok(uuid) => {
                    self.name_to_uuid.insert(name, uuid);
                }
                Err(e) => warn!(node = %name, error = %e, "skipping node without UUID"),
            }
        }
    }

    /// Forget a node. Unknown names are [`IcsError::NodeNotFound`].
    #[instrument(skip(self))]
    pub async fn unregister_node(&self, name: &str) -> Result<(), IcsError> {
        if !self.name_to_uuid.contains_key(name) {
            return Err(IcsError::NodeNotFound(name.to_owned()));
        }
        let lock = self.name_lock(name);
        let guard = lock.lock().await;

        let removed = self.name_to_uuid.remove(name);
        if let Some((_, uuid)) = &removed {
            self.nodes.remove(uuid);
        }
        drop(guard);
        // Keep the lock while another task still holds a clone of it.
        self.name_locks.remove_if(name, |_, l| Arc::strong_count(l) <= 2);

        let (_, uuid) = removed.ok_or_else(|| IcsError::NodeNotFound(name.to_owned()))?;
        info!(%uuid, "unregistered node");
        Ok(())
    }

    /// Registered node names.
    pub fn node_names(&self) -> Vec<String> {
        self.name_to_uuid
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// `true` once the VM of `uuid` has been discovered.
    pub fn is_discovered(&self, uuid: &str) -> bool {
        self.nodes.contains_key(uuid)
    }
}
