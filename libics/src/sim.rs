//! In-memory simulated management plane.
//!
//! [`SimManagementPlane`] implements both [`ManagementApi`] and [`Connector`]
//! against state held in memory, so the registry, resolver, node registry and
//! volume manager can be driven end to end without a real virtual center.
//! [`SimFleet`] routes connections for several simulated hosts.
//!
//! Remote commands complete immediately and return a task whose state
//! sequence can be scripted; failures can be injected per operation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::error::IcsError;
use crate::rest::{
    Connector, CreateVolumeRequest, DatacenterInfo, ManagementApi, TaskInfo, VmInfo, VolumeInfo,
};
use crate::task::Task;
use crate::vcenter::VirtualCenterConfig;

/// Snapshot of the calls a simulated plane has served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCalls {
    pub connects: u64,
    pub datacenter_lists: u64,
    pub vm_lists: u64,
    pub get_vm: u64,
    pub set_vm: u64,
    pub commands: u64,
    pub task_polls: u64,
}

#[derive(Default)]
struct Counters {
    connects: AtomicU64,
    datacenter_lists: AtomicU64,
    vm_lists: AtomicU64,
    get_vm: AtomicU64,
    set_vm: AtomicU64,
    commands: AtomicU64,
    task_polls: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> SimCalls {
        SimCalls {
            connects: self.connects.load(Ordering::SeqCst),
            datacenter_lists: self.datacenter_lists.load(Ordering::SeqCst),
            vm_lists: self.vm_lists.load(Ordering::SeqCst),
            get_vm: self.get_vm.load(Ordering::SeqCst),
            set_vm: self.set_vm.load(Ordering::SeqCst),
            commands: self.commands.load(Ordering::SeqCst),
            task_polls: self.task_polls.load(Ordering::SeqCst),
        }
    }
}

#[derive(Default)]
struct Failures {
    connect: bool,
    datacenter_list: bool,
    vm_list: HashSet<String>,
    get_vm: bool,
}

#[derive(Default)]
struct Inventory {
    datacenters: Vec<DatacenterInfo>,
    vms: Vec<VmInfo>,
    volumes: Vec<VolumeInfo>,
}

struct SimState {
    host: String,
    inventory: Mutex<Inventory>,
    failures: Mutex<Failures>,
    /// Remaining states per task id; the last state repeats forever.
    tasks: DashMap<String, VecDeque<String>>,
    /// State sequence handed to the next remote command.
    next_command_states: Mutex<Option<Vec<String>>>,
    vm_list_delay: Mutex<Option<Duration>>,
    listed_datacenters: Mutex<Vec<String>>,
    counters: Counters,
    next_id: AtomicU64,
}

/// In-memory management plane for one host.
#[derive(Clone)]
pub struct SimManagementPlane {
    state: Arc<SimState>,
}

impl std::fmt::Debug for SimManagementPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimManagementPlane")
            .field("host", &self.state.host)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimManagementPlane {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            state: Arc::new(SimState {
                host: host.into(),
                inventory: Mutex::new(Inventory::default()),
                failures: Mutex::new(Failures::default()),
                tasks: DashMap::new(),
                next_command_states: Mutex::new(None),
                vm_list_delay: Mutex::new(None),
                listed_datacenters: Mutex::new(Vec::new()),
                counters: Counters::default(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Same as [`Self::new`], already wrapped for use as a shared connector.
    pub fn shared(host: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(host))
    }

    pub fn host(&self) -> &str {
        &self.state.host
    }

    /// Connection config pointing at this plane.
    pub fn config(&self) -> VirtualCenterConfig {
        VirtualCenterConfig::new(self.state.host.clone(), 443, "admin", "admin")
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}-{n}")
    }

    // ------------------------------------------------------------------
    // Inventory
    // ------------------------------------------------------------------

    pub fn add_datacenter(&self, id: &str, name: &str) {
        lock(&self.state.inventory).datacenters.push(DatacenterInfo {
            id: id.to_owned(),
            name: name.to_owned(),
            ..Default::default()
        });
    }

    /// Place a VM in a datacenter and return its management-plane id.
    pub fn add_vm(&self, datacenter_id: &str, name: &str, uuid: &str) -> String {
        let id = self.next_id("vm");
        lock(&self.state.inventory).vms.push(VmInfo {
            id: id.clone(),
            name: name.to_owned(),
            uuid: uuid.to_owned(),
            state: "STARTED".into(),
            datacenter_id: datacenter_id.to_owned(),
            host_name: format!("{}-host", self.state.host),
            ..Default::default()
        });
        id
    }

    /// Add a volume to a datastore and return its id.
    pub fn add_volume(&self, datastore_id: &str, name: &str, size_gb: f64) -> String {
        let id = self.next_id("vol");
        lock(&self.state.inventory).volumes.push(VolumeInfo {
            id: id.clone(),
            uuid: id.clone(),
            name: name.to_owned(),
            size: size_gb,
            data_store_id: datastore_id.to_owned(),
            volume_status: "AVAILABLE".into(),
            ..Default::default()
        });
        id
    }

    /// Current document of a VM, if it exists.
    pub fn vm(&self, vm_id: &str) -> Option<VmInfo> {
        lock(&self.state.inventory)
            .vms
            .iter()
            .find(|vm| vm.id == vm_id)
            .cloned()
    }

    /// Current document of a volume, if it exists.
    pub fn volume(&self, volume_id: &str) -> Option<VolumeInfo> {
        lock(&self.state.inventory)
            .volumes
            .iter()
            .find(|v| v.id == volume_id)
            .cloned()
    }

    /// Change a VM's power state without going through the API.
    pub fn set_vm_state(&self, vm_id: &str, state: &str) {
        if let Some(vm) = lock(&self.state.inventory)
            .vms
            .iter_mut()
            .find(|vm| vm.id == vm_id)
        {
            vm.state = state.to_owned();
        }
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Script the states `get_task_info` reports for `task_id`, one per
    /// poll. The last state repeats once the script is exhausted.
    pub fn script_task(&self, task_id: &str, states: &[&str]) {
        self.state.tasks.insert(
            task_id.to_owned(),
            states.iter().map(|s| (*s).to_owned()).collect(),
        );
    }

    /// Script the task returned by the next remote command. Commands issued
    /// without a script get a task that reports `FINISHED` immediately.
    pub fn script_next_command(&self, states: &[&str]) {
        *lock(&self.state.next_command_states) =
            Some(states.iter().map(|s| (*s).to_owned()).collect());
    }

    fn start_task(&self) -> Task {
        let task_id = self.next_id("task");
        let states = lock(&self.state.next_command_states)
            .take()
            .unwrap_or_else(|| vec!["FINISHED".to_owned()]);
        self.state
            .tasks
            .insert(task_id.clone(), states.into_iter().collect());
        Counters::bump(&self.state.counters.commands);
        Task::new(task_id)
    }

    // ------------------------------------------------------------------
    // Failure injection
    // ------------------------------------------------------------------

    pub fn fail_connect(&self, fail: bool) {
        lock(&self.state.failures).connect = fail;
    }

    pub fn fail_datacenter_list(&self, fail: bool) {
        lock(&self.state.failures).datacenter_list = fail;
    }

    /// Make VM listing of one datacenter fail with a server error.
    pub fn fail_vm_list(&self, datacenter_id: &str) {
        lock(&self.state.failures)
            .vm_list
            .insert(datacenter_id.to_owned());
    }

    pub fn fail_get_vm(&self, fail: bool) {
        lock(&self.state.failures).get_vm = fail;
    }

    /// Delay every VM listing, to keep lookups in flight.
    pub fn set_vm_list_delay(&self, delay: Duration) {
        *lock(&self.state.vm_list_delay) = Some(delay);
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    pub fn calls(&self) -> SimCalls {
        self.state.counters.snapshot()
    }

    /// Datacenter ids whose VM list was requested, in request order.
    pub fn listed_datacenters(&self) -> Vec<String> {
        lock(&self.state.listed_datacenters).clone()
    }

    fn not_found(what: &str, id: &str) -> IcsError {
        IcsError::rest(404, format!("{what} {id} not found"))
    }
}

#[async_trait]
impl ManagementApi for SimManagementPlane {
    async fn get_all_datacenters(&self) -> Result<Vec<DatacenterInfo>, IcsError> {
        Counters::bump(&self.state.counters.datacenter_lists);
        if lock(&self.state.failures).datacenter_list {
            return Err(IcsError::rest(500, "datacenter listing failed"));
        }
        Ok(lock(&self.state.inventory).datacenters.clone())
    }

    async fn get_datacenter(&self, datacenter_id: &str) -> Result<DatacenterInfo, IcsError> {
        lock(&self.state.inventory)
            .datacenters
            .iter()
            .find(|dc| dc.id == datacenter_id)
            .cloned()
            .ok_or_else(|| Self::not_found("datacenter", datacenter_id))
    }

    async fn get_datacenter_vm_list(&self, datacenter_id: &str) -> Result<Vec<VmInfo>, IcsError> {
        Counters::bump(&self.state.counters.vm_lists);
        lock(&self.state.listed_datacenters).push(datacenter_id.to_owned());

        let delay = *lock(&self.state.vm_list_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if lock(&self.state.failures).vm_list.contains(datacenter_id) {
            return Err(IcsError::rest(
                500,
                format!("listing VMs of {datacenter_id} failed"),
            ));
        }

        let inventory = lock(&self.state.inventory);
        if !inventory.datacenters.iter().any(|dc| dc.id == datacenter_id) {
            return Err(Self::not_found("datacenter", datacenter_id));
        }
        Ok(inventory
            .vms
            .iter()
            .filter(|vm| vm.datacenter_id == datacenter_id)
            .cloned()
            .collect())
    }

    async fn get_vm(&self, vm_id: &str) -> Result<VmInfo, IcsError> {
        Counters::bump(&self.state.counters.get_vm);
        if lock(&self.state.failures).get_vm {
            return Err(IcsError::rest(500, format!("fetching VM {vm_id} failed")));
        }
        self.vm(vm_id).ok_or_else(|| Self::not_found("vm", vm_id))
    }

    async fn set_vm(&self, vm: &VmInfo) -> Result<Task, IcsError> {
        Counters::bump(&self.state.counters.set_vm);
        {
            let mut inventory = lock(&self.state.inventory);
            let slot = inventory
                .vms
                .iter_mut()
                .find(|existing| existing.id == vm.id)
                .ok_or_else(|| Self::not_found("vm", &vm.id))?;

            let mut updated = vm.clone();
            // The server assigns SCSI ids to newly attached disks.
            for (index, disk) in updated.disks.iter_mut().enumerate() {
                if disk.scsi_id.is_empty() {
                    disk.scsi_id = format!("scsi0-0-{index}-{}", disk.volume.id);
                }
            }
            *slot = updated;
        }
        debug!(vm_id = %vm.id, disks = vm.disks.len(), "simulated VM update");
        Ok(self.start_task())
    }

    async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<Task, IcsError> {
        let size = req
            .size
            .parse::<f64>()
            .map_err(|e| IcsError::rest(400, format!("invalid size {:?}: {e}", req.size)))?;
        self.add_volume(&req.data_store_id, &req.name, size);
        Ok(self.start_task())
    }

    async fn delete_volume(&self, volume_id: &str, _remove_data: bool) -> Result<Task, IcsError> {
        {
            let mut inventory = lock(&self.state.inventory);
            let before = inventory.volumes.len();
            inventory.volumes.retain(|v| v.id != volume_id);
            if inventory.volumes.len() == before {
                return Err(Self::not_found("volume", volume_id));
            }
        }
        Ok(self.start_task())
    }

    async fn get_volume(&self, volume_id: &str) -> Result<VolumeInfo, IcsError> {
        self.volume(volume_id)
            .ok_or_else(|| Self::not_found("volume", volume_id))
    }

    async fn set_volume(&self, volume: &VolumeInfo) -> Result<Task, IcsError> {
        {
            let mut inventory = lock(&self.state.inventory);
            let slot = inventory
                .volumes
                .iter_mut()
                .find(|v| v.id == volume.id)
                .ok_or_else(|| Self::not_found("volume", &volume.id))?;
            *slot = volume.clone();
        }
        Ok(self.start_task())
    }

    async fn get_volumes_in_datastore(
        &self,
        datastore_id: &str,
    ) -> Result<Vec<VolumeInfo>, IcsError> {
        Ok(lock(&self.state.inventory)
            .volumes
            .iter()
            .filter(|v| v.data_store_id == datastore_id)
            .cloned()
            .collect())
    }

    async fn get_task_info(&self, task_id: &str) -> Result<TaskInfo, IcsError> {
        Counters::bump(&self.state.counters.task_polls);
        let mut states = self
            .state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Self::not_found("task", task_id))?;
        let state = if states.len() > 1 {
            states.pop_front().unwrap_or_default()
        } else {
            states.front().cloned().unwrap_or_default()
        };
        let detail = if state == "ERROR" {
            format!("task {task_id} failed")
        } else {
            String::new()
        };
        Ok(TaskInfo {
            id: task_id.to_owned(),
            state,
            process: 0,
            detail,
        })
    }
}

#[async_trait]
impl Connector for SimManagementPlane {
    async fn connect(
        &self,
        config: &VirtualCenterConfig,
    ) -> Result<Arc<dyn ManagementApi>, IcsError> {
        Counters::bump(&self.state.counters.connects);
        if lock(&self.state.failures).connect {
            return Err(IcsError::connection(&config.host, "connection refused"));
        }
        Ok(Arc::new(self.clone()))
    }
}

/// Routes connections to the simulated plane registered for each host.
#[derive(Debug, Default)]
pub struct SimFleet {
    planes: HashMap<String, SimManagementPlane>,
}

impl SimFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plane(mut self, plane: SimManagementPlane) -> Self {
        self.planes.insert(plane.host().to_owned(), plane);
        self
    }

    pub fn plane(&self, host: &str) -> Option<&SimManagementPlane> {
        self.planes.get(host)
    }
}

#[async_trait]
impl Connector for SimFleet {
    async fn connect(
        &self,
        config: &VirtualCenterConfig,
    ) -> Result<Arc<dyn ManagementApi>, IcsError> {
        match self.planes.get(&config.host) {
            Some(plane) => plane.connect(config).await,
            None => Err(IcsError::connection(&config.host, "no route to host")),
        }
    }
}
