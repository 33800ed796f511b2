//! Virtual center registry.
//!
//! A [`VirtualCenterRegistry`] is a long-lived service object built once at
//! process start and shared by reference. It owns one [`VirtualCenter`]
//! handle per management-plane host. Each handle guards its own session with
//! a lock, so connecting to one host never serializes work against another.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

use crate::datacenter::Datacenter;
use crate::error::IcsError;
use crate::rest::{Connector, ManagementApi};

/// Default connection scheme.
pub const DEFAULT_SCHEME: &str = "https";

/// Connection settings for one management plane. Immutable once registered.
#[derive(Clone, PartialEq, Eq)]
pub struct VirtualCenterConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Accept invalid TLS certificates.
    pub insecure: bool,
    /// Datacenter ids or names to search. Empty means every datacenter.
    pub datacenter_paths: Vec<String>,
}

impl VirtualCenterConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_owned(),
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            insecure: false,
            datacenter_paths: Vec::new(),
        }
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_datacenter_paths(mut self, paths: Vec<String>) -> Self {
        self.datacenter_paths = paths;
        self
    }

    /// Whether a datacenter passes this config's allow-list. Entries match
    /// either the datacenter id or its display name.
    pub fn allows_datacenter(&self, id: &str, name: &str) -> bool {
        self.datacenter_paths.is_empty()
            || self
                .datacenter_paths
                .iter()
                .any(|path| path == id || path == name)
    }
}

/// Split a comma-separated datacenter list, trimming whitespace and dropping
/// empty entries.
pub fn parse_datacenter_paths(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

impl fmt::Debug for VirtualCenterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualCenterConfig")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .field("datacenter_paths", &self.datacenter_paths)
            .finish()
    }
}

impl fmt::Display for VirtualCenterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Handle to one registered management plane.
///
/// The session is `None` until the first [`Self::connect`] and is replaced
/// wholesale on every reconnect.
pub struct VirtualCenter {
    config: VirtualCenterConfig,
    connector: Arc<dyn Connector>,
    session: Mutex<Option<Arc<dyn ManagementApi>>>,
}

impl fmt::Debug for VirtualCenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualCenter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl VirtualCenter {
    fn new(config: VirtualCenterConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &VirtualCenterConfig {
        &self.config
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Establish or re-establish the authenticated session.
    ///
    /// Serialized per handle: concurrent callers queue on the handle's lock
    /// and each replaces the session in turn. Errors are returned as-is; no
    /// retry happens here.
    #[instrument(skip(self), fields(host = %self.config.host))]
    pub async fn connect(&self) -> Result<(), IcsError> {
        let mut session = self.session.lock().await;
        match self.connector.connect(&self.config).await {
            Ok(api) => {
                *session = Some(api);
                debug!("virtual center connected");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "virtual center connect failed");
                Err(e)
            }
        }
    }

    /// Return the current session, connecting first if there is none.
    pub async fn client(&self) -> Result<Arc<dyn ManagementApi>, IcsError> {
        let mut session = self.session.lock().await;
        if let Some(api) = session.as_ref() {
            return Ok(Arc::clone(api));
        }
        let api = self.connector.connect(&self.config).await?;
        *session = Some(Arc::clone(&api));
        debug!(host = %self.config.host, "virtual center connected on first use");
        Ok(api)
    }

    /// `true` once a session has been established.
    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// List the datacenters of this management plane that pass the
    /// allow-list.
    pub async fn get_datacenters(&self) -> Result<Vec<Datacenter>, IcsError> {
        let api = self.client().await?;
        let all = api.get_all_datacenters().await.inspect_err(|e| {
            error!(host = %self.config.host, error = %e, "failed to list datacenters");
        })?;

        let total = all.len();
        let datacenters: Vec<Datacenter> = all
            .into_iter()
            .filter(|dc| self.config.allows_datacenter(&dc.id, &dc.name))
            .map(|dc| Datacenter::from_info(dc, &self.config.host))
            .collect();
        debug!(
            host = %self.config.host,
            total,
            selected = datacenters.len(),
            "listed datacenters",
        );
        Ok(datacenters)
    }
}

/// Registry of every management plane the driver talks to.
pub struct VirtualCenterRegistry {
    connector: Arc<dyn Connector>,
    virtual_centers: DashMap<String, Arc<VirtualCenter>>,
}

impl fmt::Debug for VirtualCenterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualCenterRegistry")
            .field("hosts", &self.hosts())
            .finish_non_exhaustive()
    }
}

impl VirtualCenterRegistry {
    /// Create an empty registry whose handles open sessions with `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            virtual_centers: DashMap::new(),
        }
    }

    /// Register a management plane. Idempotent per host: if the host is
    /// already known the existing handle is returned and `config` is ignored.
    pub fn register(&self, config: VirtualCenterConfig) -> Arc<VirtualCenter> {
        let host = config.host.clone();
        let entry = self.virtual_centers.entry(host.clone()).or_insert_with(|| {
            info!(%host, "registering virtual center");
            Arc::new(VirtualCenter::new(config, Arc::clone(&self.connector)))
        });
        Arc::clone(entry.value())
    }

    /// Look up the handle for `host`.
    pub fn get(&self, host: &str) -> Result<Arc<VirtualCenter>, IcsError> {
        self.virtual_centers
            .get(host)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| IcsError::NotRegistered(host.to_owned()))
    }

    /// Snapshot of every registered handle. Safe to call while other tasks
    /// register new hosts; those may or may not appear in the snapshot.
    pub fn get_all(&self) -> Vec<Arc<VirtualCenter>> {
        self.virtual_centers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Registered hosts.
    pub fn hosts(&self) -> Vec<String> {
        self.virtual_centers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove a host. Returns `NotRegistered` if it was unknown.
    pub fn unregister(&self, host: &str) -> Result<(), IcsError> {
        self.virtual_centers
            .remove(host)
            .map(|_| info!(%host, "unregistered virtual center"))
            .ok_or_else(|| IcsError::NotRegistered(host.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.virtual_centers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.virtual_centers.is_empty()
    }
}
