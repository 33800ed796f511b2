//! ICS REST API HTTP client with session-token authentication.
//!
//! Talks to `https://{host}:{port}/...`. A session token is obtained with
//! `POST /authentication` and sent as the `Authorization` header on every
//! request. When the server answers `401` the token is renewed once and the
//! request retried.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use super::payload::{LoginRequest, LoginResponse, PageResponse, TaskResponse};
use super::{
    Connector, CreateVolumeRequest, DatacenterInfo, ManagementApi, TaskInfo, VmInfo, VolumeInfo,
};
use crate::error::IcsError;
use crate::task::Task;
use crate::vcenter::VirtualCenterConfig;

/// API version header value expected by the management plane.
const API_VERSION: &str = "5.6";
/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Idle pooled connections are dropped after this long.
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Session-authenticated client for one virtual center.
pub struct RestClient {
    http: Client,
    base_url: String,
    host: String,
    username: String,
    password: String,
    session: RwLock<Option<String>>,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl RestClient {
    /// Build a client from config. No session is created until
    /// [`Self::login`] is called.
    pub fn new(config: &VirtualCenterConfig) -> Result<Self, IcsError> {
        let http = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(SESSION_IDLE_TIMEOUT)
            .build()
            .map_err(|e| IcsError::connection(&config.host, format!("build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: format!("{}://{}:{}", config.scheme, config.host, config.port),
            host: config.host.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            session: RwLock::new(None),
        })
    }

    /// Base URL for API calls.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create a new session, replacing the current token.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn login(&self) -> Result<(), IcsError> {
        let url = format!("{}/authentication", self.base_url);
        let body = LoginRequest {
            username: &self.username,
            password: &self.password,
            locale: "cn",
            domain: "internal",
            captcha: "",
        };

        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .header("version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| IcsError::connection(&self.host, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(IcsError::connection(
                &self.host,
                format!("login rejected with status {status}: {body}"),
            ));
        }

        let login: LoginResponse = resp
            .json()
            .await
            .map_err(|e| IcsError::connection(&self.host, format!("parse login response: {e}")))?;
        if login.session_id.is_empty() {
            return Err(IcsError::connection(
                &self.host,
                format!("login returned no session: {}", login.message),
            ));
        }

        *self.session.write().await = Some(login.session_id);
        debug!("session established");
        Ok(())
    }

    async fn execute<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, IcsError>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}/{}", self.base_url, path);
        let token = self.session.read().await.clone().unwrap_or_default();

        let mut req = self
            .http
            .request(method, &url)
            .header("version", API_VERSION)
            .header(AUTHORIZATION, token);
        if let Some(body) = body {
            req = req.json(body);
        }
        req.send()
            .await
            .map_err(|e| IcsError::connection(&self.host, e))
    }

    /// Send a request and decode the JSON response, renewing the session
    /// once if it has expired.
    async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, IcsError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        debug!(%method, path, "sending request");
        let mut resp = self.execute(method.clone(), path, body).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            warn!(host = %self.host, path, "session rejected, logging in again");
            self.login().await?;
            resp = self.execute(method, path, body).await?;
        }
        Self::parse_response(resp).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, IcsError> {
        self.send::<(), T>(Method::GET, path, None).await
    }

    async fn parse_response<T: DeserializeOwned>(resp: Response) -> Result<T, IcsError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(IcsError::rest(status.as_u16(), body));
        }
        resp.json::<T>()
            .await
            .map_err(|e| IcsError::rest(status.as_u16(), format!("decode response: {e}")))
    }
}

#[async_trait]
impl ManagementApi for RestClient {
    async fn get_all_datacenters(&self) -> Result<Vec<DatacenterInfo>, IcsError> {
        self.get("datacenters").await
    }

    async fn get_datacenter(&self, datacenter_id: &str) -> Result<DatacenterInfo, IcsError> {
        self.get(&format!("datacenters/{datacenter_id}")).await
    }

    async fn get_datacenter_vm_list(&self, datacenter_id: &str) -> Result<Vec<VmInfo>, IcsError> {
        let page: PageResponse<VmInfo> =
            self.get(&format!("datacenters/{datacenter_id}/vms")).await?;
        Ok(page.items)
    }

    async fn get_vm(&self, vm_id: &str) -> Result<VmInfo, IcsError> {
        self.get(&format!("vms/{vm_id}")).await
    }

    async fn set_vm(&self, vm: &VmInfo) -> Result<Task, IcsError> {
        let rsp: TaskResponse = self
            .send(Method::PUT, &format!("vms/{}", vm.id), Some(vm))
            .await?;
        Ok(Task::new(rsp.task_id))
    }

    async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<Task, IcsError> {
        let rsp: TaskResponse = self.send(Method::POST, "volumes", Some(req)).await?;
        Ok(Task::new(rsp.task_id))
    }

    async fn delete_volume(&self, volume_id: &str, remove_data: bool) -> Result<Task, IcsError> {
        let rsp: TaskResponse = self
            .send::<(), _>(
                Method::DELETE,
                &format!("volumes/{volume_id}/?removeData={remove_data}"),
                None,
            )
            .await?;
        Ok(Task::new(rsp.task_id))
    }

    async fn get_volume(&self, volume_id: &str) -> Result<VolumeInfo, IcsError> {
        self.get(&format!("volumes/{volume_id}")).await
    }

    async fn set_volume(&self, volume: &VolumeInfo) -> Result<Task, IcsError> {
        let rsp: TaskResponse = self
            .send(Method::PUT, &format!("volumes/{}", volume.id), Some(volume))
            .await?;
        Ok(Task::new(rsp.task_id))
    }

    async fn get_volumes_in_datastore(
        &self,
        datastore_id: &str,
    ) -> Result<Vec<VolumeInfo>, IcsError> {
        let page: PageResponse<VolumeInfo> =
            self.get(&format!("storages/{datastore_id}/volumes")).await?;
        Ok(page.items)
    }

    async fn get_task_info(&self, task_id: &str) -> Result<TaskInfo, IcsError> {
        self.get(&format!("tasks/{task_id}")).await
    }
}

/// [`Connector`] that opens a [`RestClient`] session.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestConnector;

#[async_trait]
impl Connector for RestConnector {
    async fn connect(
        &self,
        config: &VirtualCenterConfig,
    ) -> Result<Arc<dyn ManagementApi>, IcsError> {
        let client = RestClient::new(config)?;
        client.login().await?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_uses_scheme_host_and_port() {
        let config = VirtualCenterConfig::new("10.0.0.5", 8443, "admin", "pw");
        let client = RestClient::new(&config).expect("client");
        assert_eq!(client.base_url(), "https://10.0.0.5:8443");
    }

    #[test]
    fn debug_does_not_leak_password() {
        let config = VirtualCenterConfig::new("10.0.0.5", 443, "admin", "s3cret");
        let client = RestClient::new(&config).expect("client");
        assert!(!format!("{client:?}").contains("s3cret"));
    }
}
