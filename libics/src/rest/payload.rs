//! JSON payloads exchanged with the ICS REST API.
//!
//! Only the fields the driver reads or edits are typed. Documents that are
//! sent back to the server after modification (VMs, disks, volumes) keep every
//! other field in a flattened `extra` map so a `PUT` never drops attributes
//! the driver does not know about.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Login request body for `POST /authentication`.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub locale: &'a str,
    pub domain: &'a str,
    pub captcha: &'a str,
}

/// Login response. The server spells the session field `sessonId`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(rename = "sessonId", alias = "sessionId", default)]
    pub session_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub message: String,
}

/// Paged list wrapper used by most collection endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse<T> {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

/// Response body of every call that starts a remote task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub task_id: String,
}

/// Polled task status (`GET /tasks/{id}`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub process: u32,
    #[serde(default, alias = "message")]
    pub detail: String,
}

/// A datacenter as listed by the management plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatacenterInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub host_num: u32,
    #[serde(default)]
    pub vm_num: u32,
}

/// A virtual machine document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    /// Power state, e.g. `STARTED` / `STOPPED`.
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub host_id: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub host_ip: String,
    #[serde(default, rename = "dataCenterId")]
    pub datacenter_id: String,
    #[serde(default)]
    pub disks: Vec<VmDisk>,
    #[serde(default)]
    pub nics: Vec<VmNic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc_passwd: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A disk slot on a VM, backed by a volume.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmDisk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub scsi_id: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bus_model: String,
    #[serde(default)]
    pub read_write_model: String,
    #[serde(default, rename = "enableNativeIO")]
    pub enable_native_io: bool,
    #[serde(default)]
    pub queue_num: u32,
    #[serde(default)]
    pub volume: VolumeInfo,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A network interface on a VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmNic {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub network_name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A volume document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    /// Size in GiB.
    #[serde(default)]
    pub size: f64,
    #[serde(default)]
    pub data_store_id: String,
    #[serde(default)]
    pub disk_type: String,
    #[serde(default)]
    pub volume_status: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Body of `POST /volumes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    pub name: String,
    /// Size in GiB, sent as a decimal string.
    pub size: String,
    pub data_store_type: String,
    pub data_store_id: String,
    pub volume_policy: String,
    pub description: String,
    pub bootable: bool,
    pub shared: bool,
}
