//! Structured messages of the provider worker RPC contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use virtrigaud_api::provider::ProviderCapabilities;
pub use virtrigaud_api::vm::ObservedPowerState;

/// Opaque reference to an asynchronous provider task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskRef(pub String);

impl TaskRef {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Power operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerOp {
    On,
    Off,
    OffGraceful,
    Reset,
    Suspend,
}

/// One disk in a create/reconfigure request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskCreate {
    pub name: String,
    pub size_gib: u32,
    #[serde(rename = "type")]
    pub disk_type: Option<String>,
}

/// One network attachment in a create request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkAttach {
    /// Provider-side network identity (portgroup, bridge, ...).
    pub network: String,
    pub model: Option<String>,
    pub mtu: Option<u32>,
    pub vlan: Option<u16>,
}

/// Image source for a create request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSource {
    pub template_name: Option<String>,
    pub url: Option<String>,
    pub format: Option<String>,
}

/// Resolved placement constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConstraints {
    pub cluster: Option<String>,
    pub datastore: Option<String>,
    pub folder: Option<String>,
    pub host: Option<String>,
}

/// VM creation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateRequest {
    pub name: String,
    pub cpus: u32,
    pub memory_mib: u32,
    pub firmware: Option<String>,
    pub disks: Vec<DiskCreate>,
    pub networks: Vec<NetworkAttach>,
    pub image: Option<ImageSource>,
    pub user_data: Option<String>,
    pub placement: Option<PlacementConstraints>,
    pub power_on: bool,
    pub tags: Vec<String>,
    /// Extra-config pairs, passed through unchanged.
    pub extra_config: BTreeMap<String, String>,
}

/// VM creation response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateResponse {
    pub id: String,
    pub task: Option<TaskRef>,
}

/// Spec delta for reconfiguration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconfigureRequest {
    pub cpus: Option<u32>,
    pub memory_mib: Option<u32>,
    /// Full desired disk list when disks changed.
    pub disks: Option<Vec<DiskCreate>>,
}

/// Describe response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescribeResponse {
    pub exists: bool,
    pub power_state: ObservedPowerState,
    pub ips: Vec<String>,
    pub console_url: Option<String>,
    /// Provider-specific opaque details.
    pub details: BTreeMap<String, String>,
}

/// Task polling result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskStatusInfo {
    pub done: bool,
    pub error: Option<String>,
    /// Percentage, when the provider reports one.
    pub progress: Option<u8>,
}

/// Snapshot creation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotCreateRequest {
    pub vm_id: String,
    pub name: String,
    pub include_memory: bool,
    pub description: String,
}

/// Snapshot creation response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotCreateResponse {
    pub snapshot_id: String,
    pub task: Option<TaskRef>,
}

/// Clone request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneRequest {
    pub source_vm_id: Option<String>,
    pub source_snapshot_id: Option<String>,
    pub source_template: Option<String>,
    pub target_name: String,
    /// Copy-on-write clone; requires the linked-clones capability.
    pub linked: bool,
    pub power_on: bool,
}

/// Clone response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneResponse {
    pub id: String,
    pub task: Option<TaskRef>,
}

/// Image preparation request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagePrepareRequest {
    pub image_name: String,
    pub template_name: Option<String>,
    pub url: Option<String>,
    pub format: Option<String>,
    pub checksum: Option<String>,
}

/// Image preparation response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagePrepareResponse {
    /// Already present on the hypervisor; nothing to do.
    pub ready: bool,
    pub task: Option<TaskRef>,
}

/// Credentials forwarded to the worker for staging channel access.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingCredentials {
    pub bearer_token: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_region: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
}

/// Disk export request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportDiskRequest {
    pub vm_id: String,
    pub disk_id: Option<String>,
    pub snapshot_id: Option<String>,
    pub dest_url: String,
    pub format: String,
    pub compress: bool,
    pub credentials: Option<StagingCredentials>,
}

/// Disk export response. Replaying the request after the export finished
/// returns the completed record with the checksum filled in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportDiskResponse {
    pub export_id: String,
    pub task: Option<TaskRef>,
    pub estimated_size_bytes: Option<u64>,
    /// SHA-256, lowercase hex, once the export completed.
    pub checksum: Option<String>,
}

/// Disk import request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportDiskRequest {
    pub source_url: String,
    pub storage_hint: Option<String>,
    pub format: String,
    pub target_name: String,
    pub verify_checksum: bool,
    pub expected_checksum: Option<String>,
    pub credentials: Option<StagingCredentials>,
}

/// Disk import response; same replay semantics as export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportDiskResponse {
    pub import_id: String,
    pub task: Option<TaskRef>,
    pub size_bytes: Option<u64>,
    /// SHA-256, lowercase hex, once the import completed.
    pub checksum: Option<String>,
}

/// A VM discovered during adoption listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveredVm {
    pub id: String,
    pub name: String,
    pub power_state: ObservedPowerState,
    pub cpus: u32,
    pub memory_mib: u32,
}
