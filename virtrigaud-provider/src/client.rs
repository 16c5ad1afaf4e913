//! The provider worker RPC contract.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::*;

/// Uniform contract every provider worker honours.
///
/// Create, Delete, Power and the snapshot operations are idempotent when
/// replayed with the same target identity: a duplicate call is a no-op that
/// returns the existing state. Export and import follow the same rule, so a
/// reconciler that parked on a task can replay the request after completion
/// to read the final record.
#[async_trait]
pub trait ProviderRpc: Send + Sync {
    /// Check connectivity and credentials.
    async fn validate(&self) -> Result<()>;

    /// Report feature bits.
    async fn capabilities(&self) -> Result<ProviderCapabilities>;

    async fn create(&self, req: CreateRequest) -> Result<CreateResponse>;

    async fn delete(&self, vm_id: &str) -> Result<Option<TaskRef>>;

    async fn power(&self, vm_id: &str, op: PowerOp) -> Result<Option<TaskRef>>;

    async fn reconfigure(&self, vm_id: &str, req: ReconfigureRequest) -> Result<Option<TaskRef>>;

    async fn describe(&self, vm_id: &str) -> Result<DescribeResponse>;

    async fn task_status(&self, task: &TaskRef) -> Result<TaskStatusInfo>;

    /// Convenience predicate over [`ProviderRpc::task_status`].
    async fn is_task_complete(&self, task: &TaskRef) -> Result<bool> {
        Ok(self.task_status(task).await?.done)
    }

    async fn snapshot_create(&self, req: SnapshotCreateRequest) -> Result<SnapshotCreateResponse>;

    async fn snapshot_delete(&self, vm_id: &str, snapshot_id: &str) -> Result<Option<TaskRef>>;

    async fn snapshot_revert(&self, vm_id: &str, snapshot_id: &str) -> Result<Option<TaskRef>>;

    async fn clone_vm(&self, req: CloneRequest) -> Result<CloneResponse>;

    async fn image_prepare(&self, req: ImagePrepareRequest) -> Result<ImagePrepareResponse>;

    async fn export_disk(&self, req: ExportDiskRequest) -> Result<ExportDiskResponse>;

    async fn import_disk(&self, req: ImportDiskRequest) -> Result<ImportDiskResponse>;

    /// List VMs present on the hypervisor, for adoption.
    async fn list_vms(&self) -> Result<Vec<DiscoveredVm>>;
}

impl std::fmt::Debug for dyn ProviderRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ProviderRpc")
    }
}
