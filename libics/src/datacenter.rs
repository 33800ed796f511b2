//! Datacenter handles and the asynchronous datacenter enumerator.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::error::IcsError;
use crate::rest::DatacenterInfo;
use crate::vcenter::VirtualCenterRegistry;
use crate::vm::VirtualMachine;

/// A datacenter on one management plane.
///
/// The owning virtual center is referenced by host and looked up in the
/// registry on every call, so a handle never outlives a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datacenter {
    pub id: String,
    pub name: String,
    pub virtual_center_host: String,
}

impl fmt::Display for Datacenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) @ {}", self.name, self.id, self.virtual_center_host)
    }
}

impl Datacenter {
    pub fn from_info(info: DatacenterInfo, virtual_center_host: &str) -> Self {
        Self {
            id: info.id,
            name: info.name,
            virtual_center_host: virtual_center_host.to_owned(),
        }
    }

    /// Find a VM in this datacenter.
    ///
    /// A non-empty `uuid` is matched exactly and `name` is only used for
    /// logging; otherwise the VM is matched by `name`. Returns
    /// [`IcsError::VmNotFound`] when nothing in this datacenter matches.
    pub async fn lookup_vm(
        &self,
        registry: &VirtualCenterRegistry,
        name: &str,
        uuid: &str,
    ) -> Result<VirtualMachine, IcsError> {
        if name.is_empty() && uuid.is_empty() {
            return Err(IcsError::InvalidArgument(
                "either a VM name or a UUID is required".into(),
            ));
        }

        let vc = registry.get(&self.virtual_center_host)?;
        let api = vc.client().await?;
        let vms = api.get_datacenter_vm_list(&self.id).await?;

        let found = if uuid.is_empty() {
            vms.into_iter().find(|vm| vm.name == name)
        } else {
            vms.into_iter().find(|vm| vm.uuid == uuid)
        };

        match found {
            Some(info) => {
                debug!(datacenter = %self, vm = %info.name, uuid = %info.uuid, "found VM");
                Ok(VirtualMachine::new(self.clone(), info))
            }
            None => Err(IcsError::vm_not_found(name, uuid)),
        }
    }

    /// Re-fetch this datacenter's attributes, reconnecting first when
    /// `reconnect` is set.
    pub async fn renew(
        &mut self,
        registry: &VirtualCenterRegistry,
        reconnect: bool,
    ) -> Result<(), IcsError> {
        let vc = registry.get(&self.virtual_center_host)?;
        if reconnect {
            vc.connect().await?;
        }
        let info = vc.client().await?.get_datacenter(&self.id).await?;
        self.name = info.name;
        Ok(())
    }
}

/// Output of [`enumerate_datacenters`].
///
/// `datacenters` yields every datacenter that passes its virtual center's
/// allow-list. `errors` carries at most one terminal error; after it is sent
/// no further datacenter is produced. Both channels close when the producer
/// task ends.
#[derive(Debug)]
pub struct DatacenterStream {
    pub datacenters: mpsc::Receiver<Datacenter>,
    pub errors: mpsc::Receiver<IcsError>,
    pub handle: JoinHandle<()>,
}

/// Stream all datacenters across all registered virtual centers.
///
/// Virtual centers are visited in the order [`VirtualCenterRegistry::get_all`]
/// returns them, each one is reconnected before listing, and any connect or
/// listing failure halts the whole enumeration. Cancelling `cancel` stops
/// production and reports [`IcsError::Cancelled`] on the error channel.
pub fn enumerate_datacenters(
    registry: Arc<VirtualCenterRegistry>,
    cancel: CancellationToken,
    buffer: usize,
) -> DatacenterStream {
    let (dc_tx, dc_rx) = mpsc::channel(buffer.max(1));
    let (err_tx, err_rx) = mpsc::channel(1);

    let handle = tokio::spawn(async move {
        if let Err(e) = produce(&registry, &cancel, &dc_tx).await {
            // Capacity is one and this is the only send, so it never blocks.
            let _ = err_tx.try_send(e);
        }
    });

    DatacenterStream {
        datacenters: dc_rx,
        errors: err_rx,
        handle,
    }
}

#[instrument(skip_all)]
async fn produce(
    registry: &VirtualCenterRegistry,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<Datacenter>,
) -> Result<(), IcsError> {
    for vc in registry.get_all() {
        if cancel.is_cancelled() {
            debug!("enumeration cancelled");
            return Err(IcsError::Cancelled);
        }

        let listed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IcsError::Cancelled),
            listed = async {
                vc.connect().await?;
                vc.get_datacenters().await
            } => listed,
        };
        let datacenters = listed.inspect_err(|e| {
            error!(host = %vc.host(), error = %e, "failed to enumerate datacenters, halting");
        })?;

        for dc in datacenters {
            debug!(datacenter = %dc, "publishing datacenter");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("enumeration cancelled");
                    return Err(IcsError::Cancelled);
                }
                sent = tx.send(dc) => {
                    if sent.is_err() {
                        // Every consumer is gone.
                        return Ok(());
                    }
                }
            }
        }
    }
    info!("datacenter enumeration finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::Connector;
    use crate::sim::{SimFleet, SimManagementPlane};

    fn fleet_registry(planes: &[&SimManagementPlane]) -> Arc<VirtualCenterRegistry> {
        let mut fleet = SimFleet::new();
        for plane in planes {
            fleet = fleet.with_plane((*plane).clone());
        }
        let registry = VirtualCenterRegistry::new(Arc::new(fleet) as Arc<dyn Connector>);
        for plane in planes {
            registry.register(plane.config());
        }
        Arc::new(registry)
    }

    async fn collect(stream: DatacenterStream) -> (Vec<Datacenter>, Option<IcsError>) {
        let DatacenterStream {
            mut datacenters,
            mut errors,
            handle,
        } = stream;
        let mut out = Vec::new();
        while let Some(dc) = datacenters.recv().await {
            out.push(dc);
        }
        handle.await.unwrap();
        (out, errors.recv().await)
    }

    #[tokio::test]
    async fn lookup_matches_uuid_exactly() {
        let sim = SimManagementPlane::new("vc-1");
        sim.add_datacenter("dc-1", "dc");
        sim.add_vm("dc-1", "node-a", "ABC-123");
        let registry = fleet_registry(&[&sim]);

        let dc = Datacenter {
            id: "dc-1".into(),
            name: "dc".into(),
            virtual_center_host: "vc-1".into(),
        };
        let vm = dc.lookup_vm(&registry, "", "ABC-123").await.unwrap();
        assert_eq!(vm.name, "node-a");
        let err = dc.lookup_vm(&registry, "", "abc-123").await.unwrap_err();
        assert!(err.is_vm_not_found());

        let vm = dc.lookup_vm(&registry, "node-a", "").await.unwrap();
        assert_eq!(vm.uuid, "ABC-123");

        // A uuid takes precedence over the name.
        let err = dc.lookup_vm(&registry, "node-a", "zzz").await.unwrap_err();
        assert!(err.is_vm_not_found());
    }

    #[tokio::test]
    async fn lookup_requires_an_identifier() {
        let sim = SimManagementPlane::new("vc-1");
        let registry = fleet_registry(&[&sim]);
        let dc = Datacenter {
            id: "dc-1".into(),
            name: "dc".into(),
            virtual_center_host: "vc-1".into(),
        };
        let err = dc.lookup_vm(&registry, "", "").await.unwrap_err();
        assert!(matches!(err, IcsError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn enumerates_every_plane() {
        let a = SimManagementPlane::new("vc-a");
        a.add_datacenter("dc-1", "one");
        a.add_datacenter("dc-2", "two");
        let b = SimManagementPlane::new("vc-b");
        b.add_datacenter("dc-3", "three");
        let registry = fleet_registry(&[&a, &b]);

        let (dcs, err) = collect(enumerate_datacenters(
            registry,
            CancellationToken::new(),
            4,
        ))
        .await;

        let mut ids: Vec<_> = dcs.iter().map(|dc| dc.id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, ["dc-1", "dc-2", "dc-3"]);
        assert!(err.is_none());
        // Every plane is reconnected once for the enumeration.
        assert_eq!(a.calls().connects, 1);
        assert_eq!(b.calls().connects, 1);
    }

    #[tokio::test]
    async fn connect_failure_halts_enumeration() {
        let a = SimManagementPlane::new("vc-a");
        a.add_datacenter("dc-1", "one");
        a.fail_connect(true);
        let registry = fleet_registry(&[&a]);

        let (dcs, err) = collect(enumerate_datacenters(
            registry,
            CancellationToken::new(),
            4,
        ))
        .await;
        assert!(dcs.is_empty());
        assert!(matches!(err, Some(IcsError::Connection { .. })));
    }

    #[tokio::test]
    async fn listing_failure_is_the_only_error() {
        let a = SimManagementPlane::new("vc-a");
        a.fail_datacenter_list(true);
        let registry = fleet_registry(&[&a]);

        let stream = enumerate_datacenters(registry, CancellationToken::new(), 4);
        let DatacenterStream {
            mut datacenters,
            mut errors,
            handle,
        } = stream;
        handle.await.unwrap();
        assert!(datacenters.recv().await.is_none());
        assert!(matches!(
            errors.recv().await,
            Some(IcsError::Rest { status: 500, .. })
        ));
        assert!(errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_stops_production() {
        let a = SimManagementPlane::new("vc-a");
        for i in 0..8 {
            a.add_datacenter(&format!("dc-{i}"), "dc");
        }
        let registry = fleet_registry(&[&a]);
        let cancel = CancellationToken::new();

        // A buffer of one fills immediately; the producer then blocks on send
        // until it observes the cancellation.
        let stream = enumerate_datacenters(registry, cancel.clone(), 1);
        let DatacenterStream {
            mut datacenters,
            mut errors,
            handle,
        } = stream;
        assert!(datacenters.recv().await.is_some());
        cancel.cancel();
        handle.await.unwrap();

        let mut rest = 0;
        while datacenters.recv().await.is_some() {
            rest += 1;
        }
        assert!(rest < 7);
        assert_eq!(errors.recv().await, Some(IcsError::Cancelled));
    }

    #[tokio::test]
    async fn renew_refreshes_name() {
        let sim = SimManagementPlane::new("vc-1");
        sim.add_datacenter("dc-1", "fresh");
        let registry = fleet_registry(&[&sim]);
        let mut dc = Datacenter {
            id: "dc-1".into(),
            name: "stale".into(),
            virtual_center_host: "vc-1".into(),
        };
        dc.renew(&registry, true).await.unwrap();
        assert_eq!(dc.name, "fresh");
        assert_eq!(sim.calls().connects, 1);
    }
}
