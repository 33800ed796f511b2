//! Concurrent VM resolution across every datacenter.
//!
//! [`VmResolver::resolve`] starts the datacenter enumerator and a fixed pool
//! of workers that pull datacenters from it and search each one for the VM.
//! The first worker to find a match cancels the shared token, which stops
//! the enumerator and every sibling. A per-datacenter miss is not an error;
//! any other lookup failure cancels the search and is returned.
//!
//! Outcome precedence: found VM, then the first non-miss error, then
//! [`IcsError::VmNotFound`]. Every spawned task is joined before `resolve`
//! returns.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::datacenter::{Datacenter, DatacenterStream, enumerate_datacenters};
use crate::error::IcsError;
use crate::vcenter::VirtualCenterRegistry;
use crate::vm::VirtualMachine;

/// Default number of concurrent datacenter lookups.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Datacenter buffer slots per worker.
const BUFFER_PER_WORKER: usize = 10;

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Datacenter>>>;

/// Finds a VM by UUID or name across all registered virtual centers.
#[derive(Debug, Clone)]
pub struct VmResolver {
    registry: Arc<VirtualCenterRegistry>,
    pool_size: usize,
}

impl VmResolver {
    pub fn new(registry: Arc<VirtualCenterRegistry>) -> Self {
        Self::with_pool_size(registry, DEFAULT_POOL_SIZE)
    }

    pub fn with_pool_size(registry: Arc<VirtualCenterRegistry>, pool_size: usize) -> Self {
        Self {
            registry,
            pool_size: pool_size.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<VirtualCenterRegistry> {
        &self.registry
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Resolve a VM. A non-empty `uuid` is the search key; otherwise `name`.
    pub async fn resolve(&self, name: &str, uuid: &str) -> Result<VirtualMachine, IcsError> {
        self.resolve_with_cancel(name, uuid, &CancellationToken::new())
            .await
    }

    /// Like [`Self::resolve`], but also stops when `parent` is cancelled. A
    /// search cut short that way with nothing found returns
    /// [`IcsError::Cancelled`].
    #[instrument(skip(self, parent), fields(pool = self.pool_size))]
    pub async fn resolve_with_cancel(
        &self,
        name: &str,
        uuid: &str,
        parent: &CancellationToken,
    ) -> Result<VirtualMachine, IcsError> {
        if name.is_empty() && uuid.is_empty() {
            return Err(IcsError::InvalidArgument(
                "either a VM name or a UUID is required".into(),
            ));
        }

        let cancel = parent.child_token();
        let DatacenterStream {
            datacenters,
            mut errors,
            handle: enumerator,
        } = enumerate_datacenters(
            Arc::clone(&self.registry),
            cancel.clone(),
            self.pool_size * BUFFER_PER_WORKER,
        );
        let datacenters: SharedReceiver = Arc::new(Mutex::new(datacenters));

        let (result_tx, mut results) = mpsc::channel(self.pool_size);
        let mut workers = JoinSet::new();
        for worker in 0..self.pool_size {
            workers.spawn(lookup_worker(
                worker,
                Arc::clone(&self.registry),
                Arc::clone(&datacenters),
                cancel.clone(),
                result_tx.clone(),
                name.to_owned(),
                uuid.to_owned(),
            ));
        }
        drop(result_tx);

        let mut found: Option<VirtualMachine> = None;
        let mut first_error: Option<IcsError> = None;
        let mut errors_open = true;

        // Runs until every worker has dropped its result sender.
        loop {
            tokio::select! {
                result = results.recv() => match result {
                    Some(Ok(vm)) => {
                        if found.is_none() {
                            info!(vm = %vm, "found VM, cancelling remaining lookups");
                            found = Some(vm);
                        }
                        cancel.cancel();
                    }
                    Some(Err(e)) => {
                        first_error.get_or_insert(e);
                        cancel.cancel();
                    }
                    None => break,
                },
                err = errors.recv(), if errors_open => match err {
                    Some(IcsError::Cancelled) => {}
                    Some(e) => {
                        error!(error = %e, "datacenter enumeration failed, cancelling lookups");
                        first_error.get_or_insert(e);
                        cancel.cancel();
                    }
                    None => errors_open = false,
                },
            }
        }

        cancel.cancel();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "lookup worker aborted");
            }
        }
        if let Err(e) = enumerator.await {
            warn!(error = %e, "datacenter enumerator aborted");
        }
        // The enumerator may have failed after the workers drained its stream.
        if errors_open {
            if let Ok(e) = errors.try_recv() {
                if !matches!(e, IcsError::Cancelled) {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(vm) = found {
            return Ok(vm);
        }
        if let Some(e) = first_error {
            error!(error = %e, "VM resolution failed");
            return Err(e);
        }
        if parent.is_cancelled() {
            return Err(IcsError::Cancelled);
        }
        info!("VM not found in any datacenter");
        Err(IcsError::vm_not_found(name, uuid))
    }
}

async fn lookup_worker(
    worker: usize,
    registry: Arc<VirtualCenterRegistry>,
    datacenters: SharedReceiver,
    cancel: CancellationToken,
    results: mpsc::Sender<Result<VirtualMachine, IcsError>>,
    name: String,
    uuid: String,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            dc = async { datacenters.lock().await.recv().await } => dc,
        };
        let Some(dc) = next else {
            debug!(worker, "datacenter stream exhausted");
            break;
        };

        let lookup = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            lookup = dc.lookup_vm(&registry, &name, &uuid) => lookup,
        };
        match lookup {
            Ok(vm) => {
                let _ = results.send(Ok(vm)).await;
                break;
            }
            Err(e) if e.is_vm_not_found() => {
                debug!(worker, datacenter = %dc, "VM not in datacenter, continuing");
            }
            Err(e) => {
                error!(worker, datacenter = %dc, error = %e, "lookup failed");
                let _ = results.send(Err(e)).await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::rest::Connector;
    use crate::sim::{SimFleet, SimManagementPlane};

    fn resolver_over(planes: &[&SimManagementPlane]) -> VmResolver {
        let mut fleet = SimFleet::new();
        for plane in planes {
            fleet = fleet.with_plane((*plane).clone());
        }
        let registry = VirtualCenterRegistry::new(Arc::new(fleet) as Arc<dyn Connector>);
        for plane in planes {
            registry.register(plane.config());
        }
        VmResolver::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn finds_vm_wherever_it_lives() {
        for target in 0..6 {
            let sim = SimManagementPlane::new("vc-1");
            for i in 0..6 {
                sim.add_datacenter(&format!("dc-{i}"), &format!("dc{i}"));
                sim.add_vm(&format!("dc-{i}"), &format!("node-{i}"), &format!("uuid-{i}"));
            }
            let resolver = resolver_over(&[&sim]);
            let vm = resolver
                .resolve("", &format!("uuid-{target}"))
                .await
                .unwrap();
            assert_eq!(vm.uuid, format!("uuid-{target}"));
            assert_eq!(vm.datacenter.id, format!("dc-{target}"));
        }
    }

    #[tokio::test]
    async fn resolves_by_name_when_uuid_empty() {
        let sim = SimManagementPlane::new("vc-1");
        sim.add_datacenter("dc-1", "dc");
        sim.add_vm("dc-1", "worker-7", "u-7");
        let vm = resolver_over(&[&sim])
            .resolve("worker-7", "")
            .await
            .unwrap();
        assert_eq!(vm.uuid, "u-7");
    }

    #[tokio::test]
    async fn exhaustion_visits_every_datacenter() {
        let sim = SimManagementPlane::new("vc-1");
        for i in 0..9 {
            sim.add_datacenter(&format!("dc-{i}"), "dc");
        }
        let err = resolver_over(&[&sim])
            .resolve("ghost", "missing")
            .await
            .unwrap_err();
        assert_eq!(err, IcsError::vm_not_found("ghost", "missing"));
        assert_eq!(sim.calls().vm_lists, 9);
    }

    #[tokio::test]
    async fn lookup_error_fails_fast() {
        let sim = SimManagementPlane::new("vc-1");
        sim.add_datacenter("dc-bad", "bad");
        for i in 0..40 {
            sim.add_datacenter(&format!("dc-{i}"), "dc");
        }
        sim.fail_vm_list("dc-bad");
        sim.set_vm_list_delay(Duration::from_millis(20));

        let err = resolver_over(&[&sim])
            .resolve("", "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, IcsError::Rest { status: 500, .. }));
        // The failing datacenter is first in line; only the lookups already
        // in flight on sibling workers may have been issued.
        assert!(
            sim.calls().vm_lists <= DEFAULT_POOL_SIZE as u64 * 2,
            "issued {} lookups",
            sim.calls().vm_lists
        );
    }

    #[tokio::test]
    async fn connect_failure_is_returned() {
        let sim = SimManagementPlane::new("vc-1");
        sim.add_datacenter("dc-1", "dc");
        sim.fail_connect(true);
        let err = resolver_over(&[&sim]).resolve("", "x").await.unwrap_err();
        assert!(matches!(err, IcsError::Connection { .. }));
    }

    #[tokio::test]
    async fn found_beats_not_found_on_other_plane() {
        let a = SimManagementPlane::new("vc-a");
        a.add_datacenter("dc-a", "a");
        let b = SimManagementPlane::new("vc-b");
        b.add_datacenter("dc-b", "b");
        b.add_vm("dc-b", "node", "abc");

        let vm = resolver_over(&[&a, &b]).resolve("", "abc").await.unwrap();
        assert_eq!(vm.virtual_center_host, "vc-b");
    }

    #[tokio::test]
    async fn parent_cancellation_stops_search() {
        let sim = SimManagementPlane::new("vc-1");
        for i in 0..8 {
            sim.add_datacenter(&format!("dc-{i}"), "dc");
        }
        sim.set_vm_list_delay(Duration::from_secs(3600));
        let resolver = resolver_over(&[&sim]);
        let parent = CancellationToken::new();

        let canceller = {
            let parent = parent.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                parent.cancel();
            })
        };
        let err = resolver
            .resolve_with_cancel("", "x", &parent)
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert_eq!(err, IcsError::Cancelled);
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let sim = SimManagementPlane::new("vc-1");
        let err = resolver_over(&[&sim]).resolve("", "").await.unwrap_err();
        assert!(matches!(err, IcsError::InvalidArgument(_)));
        assert_eq!(sim.calls().connects, 0);
    }
}
