//! Mock provider worker for testing and development.
//!
//! Simulates a hypervisor in memory without a real worker process. The
//! contract's idempotence rules are honoured: Create is keyed by name,
//! Delete and the snapshot operations tolerate replays, and export/import
//! replays return the completed record. Faults can be injected per method
//! to exercise the reconcilers' error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use bytes::Bytes;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use virtrigaud_storage::{StagingFactory, TransferDest, TransferSource, UploadRequest};

use crate::client::ProviderRpc;
use crate::error::{ProviderError, Result};
use crate::types::*;

struct MockVm {
    id: String,
    name: String,
    power: ObservedPowerState,
    cpus: u32,
    memory_mib: u32,
    firmware: Option<String>,
    disks: Vec<DiskCreate>,
    ips: Vec<String>,
    console_url: String,
    /// Bytes served by disk exports.
    disk_content: Bytes,
}

struct MockSnapshot {
    id: String,
    name: String,
    include_memory: bool,
}

struct MockTask {
    remaining: u32,
    error: Option<String>,
}

#[derive(Default)]
struct State {
    vms: HashMap<String, MockVm>,
    names: HashMap<String, String>,
    snapshots: HashMap<String, Vec<MockSnapshot>>,
    tasks: HashMap<String, MockTask>,
    exports: HashMap<String, ExportDiskResponse>,
    imports: HashMap<String, ImportDiskResponse>,
    prepared_images: HashMap<String, bool>,
    ip_counter: u32,
}

/// In-memory provider worker.
pub struct MockProvider {
    state: RwLock<State>,
    faults: Mutex<Vec<(String, ProviderError)>>,
    capabilities: RwLock<ProviderCapabilities>,
    available: AtomicBool,
    /// Polls an async task needs before reporting done. Zero makes every
    /// operation synchronous.
    task_polls: u32,
    staging: Option<StagingFactory>,
}

impl MockProvider {
    pub fn new() -> Self {
        info!("creating mock provider worker");
        Self {
            state: RwLock::new(State::default()),
            faults: Mutex::new(Vec::new()),
            capabilities: RwLock::new(ProviderCapabilities {
                snapshots: true,
                memory_snapshots: true,
                linked_clones: true,
                online_reconfigure: true,
                online_disk_expansion: true,
                image_import: true,
                supported_disk_types: vec!["thin".into(), "thick".into()],
                supported_network_types: vec!["bridge".into(), "portgroup".into()],
            }),
            available: AtomicBool::new(true),
            task_polls: 0,
            staging: None,
        }
    }

    /// Make async-capable operations return a task that needs `polls`
    /// status queries before completing.
    pub fn with_task_polls(mut self, polls: u32) -> Self {
        self.task_polls = polls;
        self
    }

    /// Attach a staging factory so export/import move real bytes.
    pub fn with_staging(mut self, staging: StagingFactory) -> Self {
        self.staging = Some(staging);
        self
    }

    /// Override the reported capability set.
    pub fn set_capabilities(&self, caps: ProviderCapabilities) {
        *self.capabilities.write().unwrap() = caps;
    }

    /// Flip worker availability; Validate fails while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Inject a one-shot fault for the named method.
    pub fn fail_next(&self, method: &str, error: ProviderError) {
        self.faults.lock().unwrap().push((method.to_string(), error));
    }

    fn take_fault(&self, method: &str) -> Result<()> {
        let mut faults = self.faults.lock().unwrap();
        if let Some(pos) = faults.iter().position(|(m, _)| m == method) {
            let (_, err) = faults.remove(pos);
            return Err(err);
        }
        Ok(())
    }

    fn state(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap()
    }

    fn new_task(&self, state: &mut State, label: &str) -> Option<TaskRef> {
        if self.task_polls == 0 {
            return None;
        }
        let task = TaskRef::new(format!("task-{}-{}", label, Uuid::new_v4()));
        state.tasks.insert(
            task.0.clone(),
            MockTask {
                remaining: self.task_polls,
                error: None,
            },
        );
        Some(task)
    }

    fn next_ip(state: &mut State) -> String {
        state.ip_counter += 1;
        format!("10.0.0.{}", state.ip_counter)
    }

    // Test accessors.

    /// Replace a VM's exported disk content.
    pub fn set_disk_content(&self, vm_id: &str, content: Bytes) {
        if let Some(vm) = self.state().vms.get_mut(vm_id) {
            vm.disk_content = content;
        }
    }

    /// Simulate an out-of-band deletion: remove the VM without going
    /// through the contract.
    pub fn remove_out_of_band(&self, vm_id: &str) {
        let mut state = self.state();
        if let Some(vm) = state.vms.remove(vm_id) {
            state.names.remove(&vm.name);
            state.snapshots.remove(vm_id);
        }
    }

    pub fn vm_count(&self) -> usize {
        self.state.read().unwrap().vms.len()
    }

    pub fn vm_exists(&self, vm_id: &str) -> bool {
        self.state.read().unwrap().vms.contains_key(vm_id)
    }

    pub fn vm_id_by_name(&self, name: &str) -> Option<String> {
        self.state.read().unwrap().names.get(name).cloned()
    }

    pub fn snapshot_count(&self, vm_id: &str) -> usize {
        self.state
            .read()
            .unwrap()
            .snapshots
            .get(vm_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// (name, include_memory) pairs for a VM's snapshots.
    pub fn snapshot_names(&self, vm_id: &str) -> Vec<(String, bool)> {
        self.state
            .read()
            .unwrap()
            .snapshots
            .get(vm_id)
            .map(|s| s.iter().map(|snap| (snap.name.clone(), snap.include_memory)).collect())
            .unwrap_or_default()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ProviderRpc for MockProvider {
    async fn validate(&self) -> Result<()> {
        self.take_fault("Validate")?;
        if !self.available.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable("worker marked unavailable".into()));
        }
        Ok(())
    }

    async fn capabilities(&self) -> Result<ProviderCapabilities> {
        self.take_fault("GetCapabilities")?;
        Ok(self.capabilities.read().unwrap().clone())
    }

    #[instrument(skip(self, req), fields(vm_name = %req.name))]
    async fn create(&self, req: CreateRequest) -> Result<CreateResponse> {
        self.take_fault("Create")?;

        let mut state = self.state();
        if let Some(existing) = state.names.get(&req.name) {
            debug!(vm_id = %existing, "create replayed, returning existing VM");
            return Ok(CreateResponse {
                id: existing.clone(),
                task: None,
            });
        }

        let id = format!("mock-{}", Uuid::new_v4());
        let power = if req.power_on {
            ObservedPowerState::On
        } else {
            ObservedPowerState::Off
        };
        let ips = if req.power_on {
            vec![Self::next_ip(&mut state)]
        } else {
            Vec::new()
        };

        let vm = MockVm {
            id: id.clone(),
            name: req.name.clone(),
            power,
            cpus: req.cpus,
            memory_mib: req.memory_mib,
            firmware: req.firmware,
            disks: req.disks,
            ips,
            console_url: format!("vnc://mock/{}", id),
            disk_content: Bytes::from(format!("mock-disk-{}", id)),
        };

        state.names.insert(req.name, id.clone());
        state.vms.insert(id.clone(), vm);
        let task = self.new_task(&mut state, "create");

        info!(vm_id = %id, "mock VM created");
        Ok(CreateResponse { id, task })
    }

    async fn delete(&self, vm_id: &str) -> Result<Option<TaskRef>> {
        self.take_fault("Delete")?;

        let mut state = self.state();
        match state.vms.remove(vm_id) {
            Some(vm) => {
                state.names.remove(&vm.name);
                state.snapshots.remove(vm_id);
                let task = self.new_task(&mut state, "delete");
                info!(vm_id, "mock VM deleted");
                Ok(task)
            }
            // Replayed delete is a no-op.
            None => Ok(None),
        }
    }

    async fn power(&self, vm_id: &str, op: PowerOp) -> Result<Option<TaskRef>> {
        self.take_fault("Power")?;

        let mut state = self.state();
        let needs_ip = {
            let vm = state
                .vms
                .get(vm_id)
                .ok_or_else(|| ProviderError::NotFound(vm_id.to_string()))?;
            matches!(op, PowerOp::On | PowerOp::Reset) && vm.ips.is_empty()
        };
        let ip = needs_ip.then(|| Self::next_ip(&mut state));
        let vm = state
            .vms
            .get_mut(vm_id)
            .ok_or_else(|| ProviderError::NotFound(vm_id.to_string()))?;

        match op {
            PowerOp::On | PowerOp::Reset => {
                vm.power = ObservedPowerState::On;
                if let Some(ip) = ip {
                    vm.ips.push(ip);
                }
            }
            PowerOp::Off | PowerOp::OffGraceful => {
                vm.power = ObservedPowerState::Off;
                vm.ips.clear();
            }
            PowerOp::Suspend => vm.power = ObservedPowerState::Suspended,
        }

        debug!(vm_id, op = ?op, "mock power op applied");
        let task = self.new_task(&mut state, "power");
        Ok(task)
    }

    async fn reconfigure(&self, vm_id: &str, req: ReconfigureRequest) -> Result<Option<TaskRef>> {
        self.take_fault("Reconfigure")?;

        let online = self.capabilities.read().unwrap().online_reconfigure;
        let mut state = self.state();
        let vm = state
            .vms
            .get_mut(vm_id)
            .ok_or_else(|| ProviderError::NotFound(vm_id.to_string()))?;

        if vm.power == ObservedPowerState::On && !online {
            return Err(ProviderError::Unsupported(
                "online reconfigure not supported; power off first".into(),
            ));
        }

        if let Some(cpus) = req.cpus {
            vm.cpus = cpus;
        }
        if let Some(memory_mib) = req.memory_mib {
            vm.memory_mib = memory_mib;
        }
        if let Some(disks) = req.disks {
            vm.disks = disks;
        }

        info!(vm_id, "mock VM reconfigured");
        let task = self.new_task(&mut state, "reconfigure");
        Ok(task)
    }

    async fn describe(&self, vm_id: &str) -> Result<DescribeResponse> {
        self.take_fault("Describe")?;

        let state = self.state.read().unwrap();
        match state.vms.get(vm_id) {
            Some(vm) => {
                let mut details = std::collections::BTreeMap::new();
                details.insert("hypervisor".to_string(), "mock".to_string());
                details.insert("name".to_string(), vm.name.clone());
                if let Some(firmware) = &vm.firmware {
                    details.insert("firmware".to_string(), firmware.clone());
                }
                Ok(DescribeResponse {
                    exists: true,
                    power_state: vm.power,
                    ips: vm.ips.clone(),
                    console_url: Some(vm.console_url.clone()),
                    details,
                })
            }
            None => Ok(DescribeResponse {
                exists: false,
                ..Default::default()
            }),
        }
    }

    async fn task_status(&self, task: &TaskRef) -> Result<TaskStatusInfo> {
        self.take_fault("TaskStatus")?;

        let mut state = self.state();
        match state.tasks.get_mut(&task.0) {
            Some(t) if t.remaining > 0 => {
                t.remaining -= 1;
                Ok(TaskStatusInfo {
                    done: false,
                    error: None,
                    progress: Some(50),
                })
            }
            Some(t) => Ok(TaskStatusInfo {
                done: true,
                error: t.error.clone(),
                progress: Some(100),
            }),
            // Completed tasks may be garbage collected by the worker.
            None => Ok(TaskStatusInfo {
                done: true,
                error: None,
                progress: Some(100),
            }),
        }
    }

    async fn snapshot_create(&self, req: SnapshotCreateRequest) -> Result<SnapshotCreateResponse> {
        self.take_fault("SnapshotCreate")?;

        {
            let caps = self.capabilities.read().unwrap();
            if !caps.snapshots {
                return Err(ProviderError::Unsupported("snapshots not supported".into()));
            }
            if req.include_memory && !caps.memory_snapshots {
                return Err(ProviderError::Unsupported(
                    "memory snapshots not supported".into(),
                ));
            }
        }

        let mut state = self.state();
        if !state.vms.contains_key(&req.vm_id) {
            return Err(ProviderError::NotFound(req.vm_id));
        }

        let snapshots = state.snapshots.entry(req.vm_id.clone()).or_default();
        if let Some(existing) = snapshots.iter().find(|s| s.name == req.name) {
            debug!(snapshot_id = %existing.id, "snapshot create replayed");
            return Ok(SnapshotCreateResponse {
                snapshot_id: existing.id.clone(),
                task: None,
            });
        }

        let snapshot_id = format!("snap-{}", Uuid::new_v4());
        snapshots.push(MockSnapshot {
            id: snapshot_id.clone(),
            name: req.name,
            include_memory: req.include_memory,
        });
        let task = self.new_task(&mut state, "snapshot");

        info!(vm_id = %req.vm_id, snapshot_id = %snapshot_id, "mock snapshot created");
        Ok(SnapshotCreateResponse { snapshot_id, task })
    }

    async fn snapshot_delete(&self, vm_id: &str, snapshot_id: &str) -> Result<Option<TaskRef>> {
        self.take_fault("SnapshotDelete")?;

        let mut state = self.state();
        if let Some(snapshots) = state.snapshots.get_mut(vm_id) {
            snapshots.retain(|s| s.id != snapshot_id);
        }
        let task = self.new_task(&mut state, "snapshot-delete");
        Ok(task)
    }

    async fn snapshot_revert(&self, vm_id: &str, snapshot_id: &str) -> Result<Option<TaskRef>> {
        self.take_fault("SnapshotRevert")?;

        let mut state = self.state();
        let known = state
            .snapshots
            .get(vm_id)
            .map(|s| s.iter().any(|snap| snap.id == snapshot_id))
            .unwrap_or(false);
        if !known {
            return Err(ProviderError::NotFound(format!(
                "snapshot {snapshot_id} on {vm_id}"
            )));
        }
        let task = self.new_task(&mut state, "snapshot-revert");
        Ok(task)
    }

    async fn clone_vm(&self, req: CloneRequest) -> Result<CloneResponse> {
        self.take_fault("Clone")?;

        if req.linked && !self.capabilities.read().unwrap().linked_clones {
            return Err(ProviderError::Unsupported("linked clones not supported".into()));
        }

        let mut state = self.state();
        if let Some(existing) = state.names.get(&req.target_name) {
            return Ok(CloneResponse {
                id: existing.clone(),
                task: None,
            });
        }

        let (cpus, memory_mib, firmware, disks, content) = match &req.source_vm_id {
            Some(source_id) => {
                let source = state
                    .vms
                    .get(source_id)
                    .ok_or_else(|| ProviderError::NotFound(source_id.clone()))?;
                (
                    source.cpus,
                    source.memory_mib,
                    source.firmware.clone(),
                    source.disks.clone(),
                    source.disk_content.clone(),
                )
            }
            None => (2, 2048, None, Vec::new(), Bytes::from_static(b"mock-template-disk")),
        };

        let id = format!("mock-{}", Uuid::new_v4());
        let vm = MockVm {
            id: id.clone(),
            name: req.target_name.clone(),
            power: if req.power_on {
                ObservedPowerState::On
            } else {
                ObservedPowerState::Off
            },
            cpus,
            memory_mib,
            firmware,
            disks,
            ips: Vec::new(),
            console_url: format!("vnc://mock/{}", id),
            disk_content: content,
        };
        state.names.insert(req.target_name, id.clone());
        state.vms.insert(id.clone(), vm);
        let task = self.new_task(&mut state, "clone");

        info!(vm_id = %id, "mock VM cloned");
        Ok(CloneResponse { id, task })
    }

    async fn image_prepare(&self, req: ImagePrepareRequest) -> Result<ImagePrepareResponse> {
        self.take_fault("ImagePrepare")?;

        let mut state = self.state();
        if state.prepared_images.get(&req.image_name).copied().unwrap_or(false) {
            return Ok(ImagePrepareResponse {
                ready: true,
                task: None,
            });
        }
        state.prepared_images.insert(req.image_name.clone(), true);

        // Pre-existing templates need no import work.
        if req.template_name.is_some() {
            return Ok(ImagePrepareResponse {
                ready: true,
                task: None,
            });
        }

        let task = self.new_task(&mut state, "image-prepare");
        Ok(ImagePrepareResponse {
            ready: task.is_none(),
            task,
        })
    }

    #[instrument(skip(self, req), fields(vm_id = %req.vm_id, dest = %req.dest_url))]
    async fn export_disk(&self, req: ExportDiskRequest) -> Result<ExportDiskResponse> {
        self.take_fault("ExportDisk")?;

        let content = {
            let state = self.state();
            if let Some(record) = state.exports.get(&req.dest_url) {
                debug!("export replayed, returning completed record");
                return Ok(record.clone());
            }
            if let Some(snapshot_id) = &req.snapshot_id {
                let known = state
                    .snapshots
                    .get(&req.vm_id)
                    .map(|s| s.iter().any(|snap| snap.id == *snapshot_id))
                    .unwrap_or(false);
                if !known {
                    return Err(ProviderError::NotFound(format!(
                        "snapshot {snapshot_id} on {}",
                        req.vm_id
                    )));
                }
            }
            state
                .vms
                .get(&req.vm_id)
                .ok_or_else(|| ProviderError::NotFound(req.vm_id.clone()))?
                .disk_content
                .clone()
        };

        let staging = self
            .staging
            .as_ref()
            .ok_or_else(|| ProviderError::Internal("no staging channel configured".into()))?;
        let driver = staging
            .driver_for_url(&req.dest_url)
            .map_err(|e| ProviderError::Internal(e.to_string()))?;

        let size = content.len() as u64;
        let upload = driver
            .upload(UploadRequest::new(&req.dest_url, TransferSource::Bytes(content)))
            .await
            .map_err(map_storage_error)?;

        let mut state = self.state();
        let response = ExportDiskResponse {
            export_id: format!("exp-{}", Uuid::new_v4()),
            task: self.new_task(&mut state, "export"),
            estimated_size_bytes: Some(size),
            checksum: Some(upload.checksum),
        };
        state.exports.insert(req.dest_url, response.clone());

        info!(export_id = %response.export_id, "mock disk export complete");
        Ok(response)
    }

    #[instrument(skip(self, req), fields(source = %req.source_url))]
    async fn import_disk(&self, req: ImportDiskRequest) -> Result<ImportDiskResponse> {
        self.take_fault("ImportDisk")?;

        {
            let state = self.state.read().unwrap();
            if let Some(record) = state.imports.get(&req.source_url) {
                debug!("import replayed, returning completed record");
                return Ok(record.clone());
            }
        }

        let staging = self
            .staging
            .as_ref()
            .ok_or_else(|| ProviderError::Internal("no staging channel configured".into()))?;
        let driver = staging
            .driver_for_url(&req.source_url)
            .map_err(|e| ProviderError::Internal(e.to_string()))?;

        let download = driver
            .download(virtrigaud_storage::DownloadRequest::new(
                &req.source_url,
                TransferDest::Writer(Box::new(tokio::io::sink())),
            ))
            .await
            .map_err(map_storage_error)?;

        if req.verify_checksum {
            if let Some(expected) = &req.expected_checksum {
                if *expected != download.checksum {
                    return Err(ProviderError::ChecksumMismatch {
                        expected: expected.clone(),
                        actual: download.checksum,
                    });
                }
            }
        }

        let mut state = self.state();
        let response = ImportDiskResponse {
            import_id: format!("imp-{}", Uuid::new_v4()),
            task: self.new_task(&mut state, "import"),
            size_bytes: Some(download.size_bytes),
            checksum: Some(download.checksum),
        };
        state.imports.insert(req.source_url, response.clone());

        info!(import_id = %response.import_id, "mock disk import complete");
        Ok(response)
    }

    async fn list_vms(&self) -> Result<Vec<DiscoveredVm>> {
        self.take_fault("ListVMs")?;

        let state = self.state.read().unwrap();
        let mut vms: Vec<DiscoveredVm> = state
            .vms
            .values()
            .map(|vm| DiscoveredVm {
                id: vm.id.clone(),
                name: vm.name.clone(),
                power_state: vm.power,
                cpus: vm.cpus,
                memory_mib: vm.memory_mib,
            })
            .collect();
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vms)
    }
}

fn map_storage_error(e: virtrigaud_storage::StorageError) -> ProviderError {
    use virtrigaud_storage::StorageError;
    match e {
        StorageError::NotFound(s) => ProviderError::NotFound(s),
        StorageError::PermissionDenied(s) => ProviderError::InvalidSpec(s),
        StorageError::ChecksumMismatch { expected, actual } => {
            ProviderError::ChecksumMismatch { expected, actual }
        }
        StorageError::Network(s) => ProviderError::Network(s),
        other => ProviderError::Internal(other.to_string()),
    }
}
