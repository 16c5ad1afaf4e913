//! VMMigration reconciler: the cold-migration engine.
//!
//! A finite state machine that survives controller restarts: every phase
//! transition is written to status before the next phase's side effect
//! runs, and every provider call is idempotent, so a replay after a crash
//! converges on the same path. Long-running work is parked as a task
//! reference in status and resumed by the work queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use virtrigaud_api::condition::{set_condition, Condition, ConditionStatus, ConditionType};
use virtrigaud_api::migration::{DiskInfo, MigrationPhase, StagingStorageSpec, VMMigration};
use virtrigaud_api::provider::Provider;
use virtrigaud_api::vm::{ImportedDiskRef, PowerState, VirtualMachine, VirtualMachineSpec};
use virtrigaud_api::{condition, Object, ObjectKey, VMSnapshot, MIGRATION_ANNOTATION};
use virtrigaud_provider::{
    ExportDiskRequest, ImportDiskRequest, ProviderError, ProviderRpc, SnapshotCreateRequest,
    StagingCredentials, TaskRef,
};
use virtrigaud_store::{Api, EventType};
use virtrigaud_storage::{s3::S3Config, StagingConfig, StagingStore};

use crate::context::Ctx;
use crate::finalizer::{self, MIGRATION_FINALIZER};
use crate::reconcile::{Action, ReconcileResult, Reconciler};
use crate::requeue;

/// Default per-phase timeout.
const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(4 * 3600);

/// Cap on the retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30 * 60);

pub struct MigrationReconciler {
    ctx: Arc<Ctx>,
}

impl MigrationReconciler {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }

    async fn write(&self, api: &Api<VMMigration>, mut mig: VMMigration) -> anyhow::Result<VMMigration> {
        mig.status.observed_generation = mig.meta.generation;
        Ok(api.update_status(&mig).await?)
    }

    /// Record a phase transition; the new phase's side effects run on a
    /// later pass, after this write landed.
    async fn transition(
        &self,
        api: &Api<VMMigration>,
        mut mig: VMMigration,
        phase: MigrationPhase,
        message: impl Into<String>,
    ) -> anyhow::Result<VMMigration> {
        let from = mig.status.phase;
        let message = message.into();
        info!(migration = %mig.key(), from = from.as_str(), to = phase.as_str(), "phase transition");
        self.ctx
            .recorder
            .record(
                VMMigration::KIND,
                &mig.key(),
                EventType::Normal,
                "PhaseTransition",
                format!("{} -> {}", from.as_str(), phase.as_str()),
            )
            .await;
        mig.status.phase = phase;
        mig.status.phase_started_at = Some(Utc::now());
        mig.status.message = message;
        self.write(api, mig).await
    }

    /// Move to Failed. The Failed handler applies the retry policy on the
    /// next pass.
    async fn fail(
        &self,
        api: &Api<VMMigration>,
        mut mig: VMMigration,
        reason: &str,
        message: impl Into<String>,
        fatal: bool,
    ) -> ReconcileResult {
        let message = message.into();
        warn!(migration = %mig.key(), reason, message = %message, fatal, "migration failed");
        self.ctx
            .recorder
            .record(VMMigration::KIND, &mig.key(), EventType::Warning, "MigrationFailed", message.clone())
            .await;
        mig.status.phase = MigrationPhase::Failed;
        mig.status.phase_started_at = Some(Utc::now());
        mig.status.task_ref = None;
        mig.status.message = message.clone();
        mig.status.fatal = mig.status.fatal || fatal;
        set_condition(
            &mut mig.status.conditions,
            Condition::new(ConditionType::ReconcileError, ConditionStatus::True, reason, message),
        );
        self.write(api, mig).await?;
        Ok(Action::requeue_now())
    }

    async fn fail_provider_error(
        &self,
        api: &Api<VMMigration>,
        mig: VMMigration,
        e: &ProviderError,
    ) -> ReconcileResult {
        let fatal = matches!(
            e,
            ProviderError::InvalidSpec(_) | ProviderError::Unsupported(_)
        );
        self.fail(api, mig, e.kind(), e.to_string(), fatal).await
    }

    /// A dependency is missing or not ready: condition plus a flat 30 s
    /// requeue, no phase change, no back-off growth.
    async fn wait_deps(
        &self,
        api: &Api<VMMigration>,
        mut mig: VMMigration,
        message: impl Into<String>,
    ) -> ReconcileResult {
        let message = message.into();
        debug!(migration = %mig.key(), reason = %message, "waiting for dependencies");
        set_condition(
            &mut mig.status.conditions,
            Condition::new(
                ConditionType::WaitingForDependencies,
                ConditionStatus::True,
                "DependencyMissing",
                message,
            ),
        );
        self.write(api, mig).await?;
        Ok(Action::RequeueAfter(requeue::TRANSIENT))
    }

    fn phase_timeout(mig: &VMMigration) -> Duration {
        mig.spec
            .options
            .phase_timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PHASE_TIMEOUT)
    }

    async fn source_vm(&self, mig: &VMMigration) -> anyhow::Result<Option<VirtualMachine>> {
        let api: Api<VirtualMachine> = self.ctx.api();
        Ok(api
            .get(&ObjectKey::new(&mig.meta.namespace, &mig.spec.source.vm_ref.name))
            .await?)
    }

    /// Name of the Provider resource exporting the source VM.
    fn source_provider_name(mig: &VMMigration, source_vm: &VirtualMachine) -> String {
        mig.spec
            .source
            .provider_ref
            .as_ref()
            .map(|r| r.name.clone())
            .unwrap_or_else(|| source_vm.spec.provider_ref.name.clone())
    }

    /// Resolve a usable provider and its pooled client, or a wait reason.
    async fn usable_provider(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Result<(Provider, Arc<dyn ProviderRpc>), String>> {
        let api: Api<Provider> = self.ctx.api();
        let Some(provider) = api.get(&ObjectKey::new(namespace, name)).await? else {
            return Ok(Err(format!("Provider {name} not found")));
        };
        if !provider.is_usable() {
            return Ok(Err(format!("Provider {name} not ready")));
        }
        match self.ctx.client_for(&provider).await {
            Ok(client) => Ok(Ok((provider, client))),
            Err(e) => Ok(Err(format!("provider worker {name}: {e}"))),
        }
    }

    /// Staging claim name; deterministic so retries re-use the volume.
    fn staging_claim(mig: &VMMigration) -> String {
        format!("vmmig-{}-staging", mig.meta.name)
    }

    fn staging_config(mig: &VMMigration) -> StagingConfig {
        match &mig.spec.storage {
            StagingStorageSpec::S3 {
                endpoint,
                bucket,
                region,
                credentials,
                ..
            } => StagingConfig::S3(S3Config {
                endpoint: endpoint.clone(),
                bucket: bucket.clone(),
                region: region.clone().unwrap_or_else(|| "us-east-1".to_string()),
                access_key: credentials.access_key.clone().unwrap_or_default(),
                secret_key: credentials.secret_key.clone().unwrap_or_default(),
            }),
            StagingStorageSpec::Http {
                base_url,
                bearer_token,
                ..
            } => StagingConfig::Http {
                base_url: base_url.clone(),
                bearer_token: bearer_token.clone(),
            },
            StagingStorageSpec::Nfs { .. } => StagingConfig::Nfs,
            StagingStorageSpec::Pvc { claim_name, .. } => StagingConfig::Pvc {
                claim: claim_name
                    .clone()
                    .or_else(|| mig.status.staging_pvc_name.clone())
                    .unwrap_or_else(|| Self::staging_claim(mig)),
            },
        }
    }

    fn staging_credentials(mig: &VMMigration) -> Option<StagingCredentials> {
        match &mig.spec.storage {
            StagingStorageSpec::S3 {
                endpoint,
                region,
                credentials,
                ..
            } => Some(StagingCredentials {
                s3_endpoint: Some(endpoint.clone()),
                s3_region: region.clone(),
                s3_access_key: credentials.access_key.clone(),
                s3_secret_key: credentials.secret_key.clone(),
                ..Default::default()
            }),
            StagingStorageSpec::Http { bearer_token, .. } => Some(StagingCredentials {
                bearer_token: bearer_token.clone(),
                ..Default::default()
            }),
            _ => None,
        }
    }

    fn driver(&self, mig: &VMMigration) -> Result<Arc<dyn StagingStore>, String> {
        self.ctx
            .staging
            .driver(&Self::staging_config(mig))
            .map_err(|e| e.to_string())
    }

    /// Disk format on the staging channel.
    fn disk_format(mig: &VMMigration, source_vm: &VirtualMachine) -> String {
        mig.spec.options.disk_format.clone().unwrap_or_else(|| {
            source_vm
                .spec
                .imported_disk
                .as_ref()
                .and_then(|d| d.format.clone())
                .unwrap_or_else(|| "qcow2".to_string())
        })
    }

    /// Deterministic staging object URL, derived from migration identity.
    fn staging_object_url(mig: &VMMigration, driver: &Arc<dyn StagingStore>, format: &str) -> String {
        driver.object_url(&format!(
            "{}/{}/disk0.{}",
            mig.meta.namespace, mig.meta.name, format
        ))
    }

    // ------------------------------------------------------------------
    // Phase handlers
    // ------------------------------------------------------------------

    async fn handle_pending(&self, api: &Api<VMMigration>, mut mig: VMMigration) -> ReconcileResult {
        if mig.status.started_at.is_none() {
            mig.status.started_at = Some(Utc::now());
        }
        self.transition(api, mig, MigrationPhase::Validating, "validating inputs").await?;
        Ok(Action::requeue_now())
    }

    async fn handle_validating(&self, api: &Api<VMMigration>, mut mig: VMMigration) -> ReconcileResult {
        let Some(source_vm) = self.source_vm(&mig).await? else {
            let msg = format!("source VM {} not found", mig.spec.source.vm_ref.name);
            return self.wait_deps(api, mig, msg).await;
        };
        if source_vm.status.id.is_none() {
            return self
                .wait_deps(api, mig, format!("source VM {} has no provider ID", source_vm.meta.name))
                .await;
        }

        let src_provider = Self::source_provider_name(&mig, &source_vm);
        if let Err(msg) = self.usable_provider(&mig.meta.namespace, &src_provider).await? {
            return self.wait_deps(api, mig, msg).await;
        }
        if let Err(msg) = self
            .usable_provider(&mig.meta.namespace, &mig.spec.target.provider_ref.name)
            .await?
        {
            return self.wait_deps(api, mig, msg).await;
        }

        // Cross-format conversion is not implemented; reject it up front
        // rather than discovering it mid-pipeline.
        let source_format = source_vm
            .spec
            .imported_disk
            .as_ref()
            .and_then(|d| d.format.clone())
            .unwrap_or_else(|| "qcow2".to_string());
        let target_format = Self::disk_format(&mig, &source_vm);
        if target_format != source_format {
            return self
                .fail(
                    api,
                    mig,
                    "ValidationError",
                    format!("format conversion {source_format} -> {target_format} is not supported"),
                    true,
                )
                .await;
        }

        // Auto-provision the staging claim name so the scheduler-side
        // provisioner and all later phases agree on it.
        if let StagingStorageSpec::Pvc { claim_name, .. } = &mig.spec.storage {
            if claim_name.is_none() && mig.status.staging_pvc_name.is_none() {
                mig.status.staging_pvc_name = Some(Self::staging_claim(&mig));
            }
        }
        if let Err(msg) = self.driver(&mig) {
            return self.fail(api, mig, "ValidationError", msg, true).await;
        }

        mig.status.disk_info = Some(DiskInfo {
            format: target_format,
            ..mig.status.disk_info.clone().unwrap_or_default()
        });
        condition::clear_condition(&mut mig.status.conditions, ConditionType::WaitingForDependencies);

        let next = if mig.spec.source.create_snapshot || mig.spec.source.snapshot_ref.is_some() {
            MigrationPhase::Snapshotting
        } else {
            MigrationPhase::Exporting
        };
        self.transition(api, mig, next, "inputs validated").await?;
        Ok(Action::requeue_now())
    }

    async fn handle_snapshotting(&self, api: &Api<VMMigration>, mut mig: VMMigration) -> ReconcileResult {
        let Some(source_vm) = self.source_vm(&mig).await? else {
            return self.wait_deps(api, mig, "source VM disappeared").await;
        };
        let src_provider = Self::source_provider_name(&mig, &source_vm);
        let (_, client) = match self.usable_provider(&mig.meta.namespace, &src_provider).await? {
            Ok(ok) => ok,
            Err(msg) => return self.wait_deps(api, mig, msg).await,
        };

        if let Some(task) = mig.status.task_ref.clone() {
            match client.task_status(&TaskRef::new(task)).await {
                Err(e) => return self.fail_provider_error(api, mig, &e).await,
                Ok(st) if !st.done => return Ok(Action::RequeueAfter(requeue::TRANSIENT)),
                Ok(st) => {
                    mig.status.task_ref = None;
                    if let Some(err) = st.error {
                        return self.fail(api, mig, "TaskFailed", err, false).await;
                    }
                    self.transition(api, mig, MigrationPhase::Exporting, "snapshot ready").await?;
                    return Ok(Action::requeue_now());
                }
            }
        }

        // Adopt an explicit snapshot instead of creating one.
        if let Some(snap_ref_name) = mig.spec.source.snapshot_ref.as_ref().map(|r| r.name.clone()) {
            let snaps: Api<VMSnapshot> = self.ctx.api();
            let Some(snap) = snaps
                .get(&ObjectKey::new(&mig.meta.namespace, &snap_ref_name))
                .await?
            else {
                let msg = format!("VMSnapshot {} not found", snap_ref_name);
                return self.wait_deps(api, mig, msg).await;
            };
            let Some(snapshot_id) = snap.status.snapshot_id.clone() else {
                let msg = format!("VMSnapshot {} has no snapshot ID", snap_ref_name);
                return self.wait_deps(api, mig, msg).await;
            };
            mig.status.snapshot_id = Some(snapshot_id);
            mig.status.snapshot_created = false;
            self.transition(api, mig, MigrationPhase::Exporting, "snapshot adopted").await?;
            return Ok(Action::requeue_now());
        }

        // Already created on a previous pass.
        if mig.status.snapshot_id.is_some() {
            self.transition(api, mig, MigrationPhase::Exporting, "snapshot ready").await?;
            return Ok(Action::requeue_now());
        }

        // The ID can vanish mid-migration if the source VM is recovering
        // from an out-of-band deletion.
        let Some(vm_id) = source_vm.status.id.clone() else {
            return self.wait_deps(api, mig, "source VM has no provider ID").await;
        };
        // Deterministic name: a replay after a crash resumes the same
        // snapshot instead of taking another.
        let name = format!("vmmig-{}-{}", mig.meta.namespace, mig.meta.name);
        let resp = match client
            .snapshot_create(SnapshotCreateRequest {
                vm_id,
                name,
                include_memory: false,
                description: format!("migration {}", mig.annotation_value()),
            })
            .await
        {
            Ok(resp) => resp,
            Err(e) => return self.fail_provider_error(api, mig, &e).await,
        };

        mig.status.snapshot_id = Some(resp.snapshot_id);
        mig.status.snapshot_created = true;
        mig.status.task_ref = resp.task.map(|t| t.0);
        let parked = mig.status.task_ref.is_some();
        self.write(api, mig).await?;
        Ok(if parked {
            Action::RequeueAfter(requeue::TRANSIENT)
        } else {
            Action::requeue_now()
        })
    }

    fn export_request(
        mig: &VMMigration,
        source_vm: &VirtualMachine,
        url: &str,
        format: &str,
    ) -> ExportDiskRequest {
        ExportDiskRequest {
            vm_id: source_vm.status.id.clone().unwrap_or_default(),
            disk_id: None,
            snapshot_id: mig.status.snapshot_id.clone(),
            dest_url: url.to_string(),
            format: format.to_string(),
            compress: mig.spec.options.compress,
            credentials: Self::staging_credentials(mig),
        }
    }

    async fn handle_exporting(&self, api: &Api<VMMigration>, mut mig: VMMigration) -> ReconcileResult {
        let Some(source_vm) = self.source_vm(&mig).await? else {
            return self.wait_deps(api, mig, "source VM disappeared").await;
        };
        let src_provider = Self::source_provider_name(&mig, &source_vm);
        let (_, client) = match self.usable_provider(&mig.meta.namespace, &src_provider).await? {
            Ok(ok) => ok,
            Err(msg) => return self.wait_deps(api, mig, msg).await,
        };
        let driver = match self.driver(&mig) {
            Ok(driver) => driver,
            Err(msg) => return self.fail(api, mig, "ValidationError", msg, true).await,
        };

        let format = Self::disk_format(&mig, &source_vm);
        let url = mig
            .status
            .staging_url
            .clone()
            .unwrap_or_else(|| Self::staging_object_url(&mig, &driver, &format));
        mig.status.staging_url = Some(url.clone());

        if let Some(task) = mig.status.task_ref.clone() {
            match client.task_status(&TaskRef::new(task)).await {
                Err(e) => return self.fail_provider_error(api, mig, &e).await,
                Ok(st) if !st.done => return Ok(Action::RequeueAfter(requeue::TRANSIENT)),
                Ok(st) => {
                    mig.status.task_ref = None;
                    if let Some(err) = st.error {
                        return self.fail(api, mig, "TaskFailed", err, false).await;
                    }
                    // Replay the idempotent export to read the final record.
                    let replay = Self::export_request(&mig, &source_vm, &url, &format);
                    match client.export_disk(replay).await {
                        Ok(resp) => return self.finish_export(api, mig, resp, &driver, &url).await,
                        Err(e) => return self.fail_provider_error(api, mig, &e).await,
                    }
                }
            }
        }

        // Completed on a previous pass.
        if mig.status.export_id.is_some()
            && mig
                .status
                .disk_info
                .as_ref()
                .map(|d| d.source_checksum.is_some())
                .unwrap_or(false)
        {
            return self.after_export(api, mig).await;
        }

        let req = Self::export_request(&mig, &source_vm, &url, &format);
        match client.export_disk(req).await {
            Err(e) => self.fail_provider_error(api, mig, &e).await,
            Ok(resp) if resp.task.is_some() => {
                mig.status.export_id = Some(resp.export_id);
                mig.status.task_ref = resp.task.map(|t| t.0);
                self.write(api, mig).await?;
                Ok(Action::RequeueAfter(requeue::TRANSIENT))
            }
            Ok(resp) => self.finish_export(api, mig, resp, &driver, &url).await,
        }
    }

    /// Record the export outcome: ID, size and the source checksum (from
    /// the response, or from staging metadata when the worker omitted it).
    async fn finish_export(
        &self,
        api: &Api<VMMigration>,
        mut mig: VMMigration,
        resp: virtrigaud_provider::ExportDiskResponse,
        driver: &Arc<dyn StagingStore>,
        url: &str,
    ) -> ReconcileResult {
        let checksum = match resp.checksum {
            Some(checksum) => Some(checksum),
            None => match driver.get_metadata(url).await {
                Ok(meta) => meta.checksum,
                Err(e) => {
                    return self
                        .fail(api, mig, "TaskFailed", format!("staging metadata: {e}"), false)
                        .await;
                }
            },
        };

        mig.status.export_id = Some(resp.export_id);
        let mut disk_info = mig.status.disk_info.clone().unwrap_or_default();
        disk_info.source_checksum = checksum;
        disk_info.size_bytes = resp.estimated_size_bytes.or(disk_info.size_bytes);
        mig.status.disk_info = Some(disk_info);

        info!(migration = %mig.key(), export_id = ?mig.status.export_id, "disk export complete");
        self.after_export(api, mig).await
    }

    /// Exporting is done. The default pipeline exports straight into the
    /// staging channel and source/target formats were validated equal, so
    /// Transferring and Converting have no work and are skipped.
    async fn after_export(&self, api: &Api<VMMigration>, mig: VMMigration) -> ReconcileResult {
        let key = mig.key();
        self.ctx
            .recorder
            .record(VMMigration::KIND, &key, EventType::Normal, "TransferSkipped", "export wrote directly to the staging channel")
            .await;
        self.ctx
            .recorder
            .record(VMMigration::KIND, &key, EventType::Normal, "ConversionSkipped", "source and target formats match")
            .await;
        self.transition(api, mig, MigrationPhase::Importing, "disk staged").await?;
        Ok(Action::requeue_now())
    }

    fn import_request(mig: &VMMigration, url: &str, format: &str) -> ImportDiskRequest {
        let expected = mig
            .status
            .disk_info
            .as_ref()
            .and_then(|d| d.source_checksum.clone());
        ImportDiskRequest {
            source_url: url.to_string(),
            storage_hint: None,
            format: format.to_string(),
            target_name: mig.spec.target.name.clone(),
            verify_checksum: mig.spec.options.verify_checksums,
            expected_checksum: if mig.spec.options.verify_checksums {
                expected
            } else {
                None
            },
            credentials: Self::staging_credentials(mig),
        }
    }

    async fn handle_importing(&self, api: &Api<VMMigration>, mut mig: VMMigration) -> ReconcileResult {
        let (_, client) = match self
            .usable_provider(&mig.meta.namespace, &mig.spec.target.provider_ref.name)
            .await?
        {
            Ok(ok) => ok,
            Err(msg) => return self.wait_deps(api, mig, msg).await,
        };

        let Some(url) = mig.status.staging_url.clone() else {
            return self.fail(api, mig, "Internal", "no staging URL recorded", true).await;
        };
        let format = mig
            .status
            .disk_info
            .as_ref()
            .map(|d| d.format.clone())
            .unwrap_or_else(|| "qcow2".to_string());

        if let Some(task) = mig.status.task_ref.clone() {
            match client.task_status(&TaskRef::new(task)).await {
                Err(e) => return self.fail_provider_error(api, mig, &e).await,
                Ok(st) if !st.done => return Ok(Action::RequeueAfter(requeue::TRANSIENT)),
                Ok(st) => {
                    mig.status.task_ref = None;
                    if let Some(err) = st.error {
                        return self.fail(api, mig, "TaskFailed", err, false).await;
                    }
                    let replay = Self::import_request(&mig, &url, &format);
                    match client.import_disk(replay).await {
                        Ok(resp) => return self.finish_import(api, mig, resp).await,
                        Err(e) => return self.fail_provider_error(api, mig, &e).await,
                    }
                }
            }
        }

        if mig.status.import_id.is_some() {
            self.transition(api, mig, MigrationPhase::Creating, "disk imported").await?;
            return Ok(Action::requeue_now());
        }

        let req = Self::import_request(&mig, &url, &format);
        match client.import_disk(req).await {
            Err(ProviderError::ChecksumMismatch { expected, actual }) => {
                // Fatal for this phase; the retry policy may re-export.
                self.fail(
                    api,
                    mig,
                    "ChecksumMismatch",
                    format!("expected {expected}, got {actual}"),
                    false,
                )
                .await
            }
            Err(e) => self.fail_provider_error(api, mig, &e).await,
            Ok(resp) if resp.task.is_some() => {
                mig.status.import_id = Some(resp.import_id);
                mig.status.task_ref = resp.task.map(|t| t.0);
                self.write(api, mig).await?;
                Ok(Action::RequeueAfter(requeue::TRANSIENT))
            }
            Ok(resp) => self.finish_import(api, mig, resp).await,
        }
    }

    async fn finish_import(
        &self,
        api: &Api<VMMigration>,
        mut mig: VMMigration,
        resp: virtrigaud_provider::ImportDiskResponse,
    ) -> ReconcileResult {
        mig.status.import_id = Some(resp.import_id);
        let mut disk_info = mig.status.disk_info.clone().unwrap_or_default();
        disk_info.target_checksum = resp.checksum;
        disk_info.size_bytes = resp.size_bytes.or(disk_info.size_bytes);
        mig.status.disk_info = Some(disk_info);

        info!(migration = %mig.key(), import_id = ?mig.status.import_id, "disk import complete");
        self.transition(api, mig, MigrationPhase::Creating, "disk imported").await?;
        Ok(Action::requeue_now())
    }

    async fn handle_creating(&self, api: &Api<VMMigration>, mut mig: VMMigration) -> ReconcileResult {
        let vms: Api<VirtualMachine> = self.ctx.api();
        let target_key = ObjectKey::new(mig.target_namespace(), &mig.spec.target.name);

        match vms.get(&target_key).await? {
            None => {
                let Some(source_vm) = self.source_vm(&mig).await? else {
                    return self.wait_deps(api, mig, "source VM disappeared").await;
                };
                let target_vm = Self::build_target_vm(&mig, &source_vm);
                vms.create(&target_vm).await?;
                info!(migration = %mig.key(), target = %target_key, "target VM created");
                self.ctx
                    .recorder
                    .record(VMMigration::KIND, &mig.key(), EventType::Normal, "TargetVMCreated", target_key.to_string())
                    .await;
                // The target VM's own reconciler drives the hypervisor
                // create; this reconciler only observes.
                Ok(Action::RequeueAfter(requeue::TRANSIENT))
            }
            Some(target_vm) => {
                let ready = condition::is_condition_true(
                    &target_vm.status.conditions,
                    ConditionType::Ready,
                );
                match (&target_vm.status.id, ready) {
                    (Some(id), true) => {
                        mig.status.target_vm_id = Some(id.clone());
                        self.transition(api, mig, MigrationPhase::ValidatingTarget, "target VM ready")
                            .await?;
                        Ok(Action::requeue_now())
                    }
                    _ => Ok(Action::RequeueAfter(requeue::TRANSIENT)),
                }
            }
        }
    }

    fn build_target_vm(mig: &VMMigration, source_vm: &VirtualMachine) -> VirtualMachine {
        let target = &mig.spec.target;
        let format = mig
            .status
            .disk_info
            .as_ref()
            .map(|d| d.format.clone());

        let mut vm = VirtualMachine::new(
            mig.target_namespace(),
            &target.name,
            VirtualMachineSpec {
                provider_ref: target.provider_ref.clone(),
                class_ref: target
                    .class_ref
                    .clone()
                    .unwrap_or_else(|| source_vm.spec.class_ref.clone()),
                image_ref: None,
                networks: target.networks.clone(),
                disks: source_vm.spec.disks.clone(),
                power_state: PowerState::On,
                user_data: None,
                placement: target.placement.clone(),
                tags: source_vm.spec.tags.clone(),
                imported_disk: Some(ImportedDiskRef {
                    import_id: mig.status.import_id.clone().unwrap_or_default(),
                    format,
                }),
                extra_config: source_vm.spec.extra_config.clone(),
            },
        );
        for (k, v) in &target.annotations {
            vm.meta.annotations.insert(k.clone(), v.clone());
        }
        vm.meta
            .annotations
            .insert(MIGRATION_ANNOTATION.to_string(), mig.annotation_value());
        vm
    }

    async fn handle_validating_target(
        &self,
        api: &Api<VMMigration>,
        mut mig: VMMigration,
    ) -> ReconcileResult {
        let vms: Api<VirtualMachine> = self.ctx.api();
        let target_key = ObjectKey::new(mig.target_namespace(), &mig.spec.target.name);
        let Some(target_vm) = vms.get(&target_key).await? else {
            return self.fail(api, mig, "Internal", "target VM disappeared", false).await;
        };

        let ready =
            condition::is_condition_true(&target_vm.status.conditions, ConditionType::Ready);
        match (&target_vm.status.id, ready) {
            (Some(id), true) => {
                mig.status.target_vm_id = Some(id.clone());
                set_condition(
                    &mut mig.status.conditions,
                    Condition::new(ConditionType::Ready, ConditionStatus::True, "MigrationComplete", ""),
                );
                self.ctx
                    .recorder
                    .record(VMMigration::KIND, &mig.key(), EventType::Normal, "MigrationReady", format!("target VM id {id}"))
                    .await;
                self.transition(api, mig, MigrationPhase::Ready, "migration complete").await?;
                Ok(Action::requeue_now())
            }
            _ => Ok(Action::RequeueAfter(requeue::TRANSIENT)),
        }
    }

    /// Ready-phase cleanup, gated per step and recorded once complete.
    async fn handle_ready(&self, api: &Api<VMMigration>, mut mig: VMMigration) -> ReconcileResult {
        if mig.status.cleanup_done {
            return Ok(Action::Done);
        }
        let key = mig.key();

        // 1. Staging artifacts.
        if !mig.status.storage_cleaned {
            if let Some(url) = mig.status.staging_url.clone() {
                match self.driver(&mig) {
                    Ok(driver) => match driver.delete(&url).await {
                        Ok(()) => mig.status.storage_cleaned = true,
                        Err(e) if e.is_not_found() => mig.status.storage_cleaned = true,
                        Err(e) => {
                            warn!(migration = %key, error = %e, "staging cleanup failed, will retry");
                            self.ctx
                                .recorder
                                .record(VMMigration::KIND, &key, EventType::Warning, "StorageCleanupFailed", e.to_string())
                                .await;
                            self.write(api, mig).await?;
                            return Ok(Action::RequeueAfter(requeue::TRANSIENT));
                        }
                    },
                    Err(e) => {
                        warn!(migration = %key, error = %e, "staging driver unavailable for cleanup");
                        self.write(api, mig).await?;
                        return Ok(Action::RequeueAfter(requeue::TRANSIENT));
                    }
                }
            } else {
                mig.status.storage_cleaned = true;
            }
        }

        // 2. The migration-created snapshot (never a user-supplied one).
        if mig.status.snapshot_created {
            if let Some(snapshot_id) = mig.status.snapshot_id.clone() {
                if let Some(source_vm) = self.source_vm(&mig).await? {
                    if let Some(vm_id) = source_vm.status.id.clone() {
                        let src_provider = Self::source_provider_name(&mig, &source_vm);
                        match self.usable_provider(&mig.meta.namespace, &src_provider).await? {
                            Ok((_, client)) => {
                                if let Err(e) = client.snapshot_delete(&vm_id, &snapshot_id).await {
                                    warn!(migration = %key, error = %e, "snapshot cleanup failed, will retry");
                                    self.write(api, mig).await?;
                                    return Ok(Action::RequeueAfter(requeue::TRANSIENT));
                                }
                                mig.status.snapshot_created = false;
                            }
                            Err(msg) => {
                                warn!(migration = %key, reason = %msg, "source provider unavailable for snapshot cleanup");
                                self.write(api, mig).await?;
                                return Ok(Action::RequeueAfter(requeue::TRANSIENT));
                            }
                        }
                    }
                }
            }
        }

        // 3. The source VM, when requested.
        if mig.spec.source.delete_after_migration {
            let vms: Api<VirtualMachine> = self.ctx.api();
            let source_key = ObjectKey::new(&mig.meta.namespace, &mig.spec.source.vm_ref.name);
            if vms.get(&source_key).await?.is_some() {
                vms.delete(&source_key).await?;
                self.ctx
                    .recorder
                    .record(VMMigration::KIND, &key, EventType::Normal, "SourceVMDeleted", source_key.to_string())
                    .await;
            }
        }

        mig.status.cleanup_done = true;
        mig.status.completed_at = Some(Utc::now());
        info!(migration = %key, "cleanup complete");
        self.write(api, mig).await?;
        Ok(Action::Done)
    }

    /// Failed-phase handling: absorbing without a policy or after a fatal
    /// error; otherwise retry with exponential delay.
    async fn handle_failed(&self, api: &Api<VMMigration>, mut mig: VMMigration) -> ReconcileResult {
        if mig.status.fatal {
            return Ok(Action::Done);
        }
        let Some(policy) = mig.spec.options.retry_policy.clone() else {
            return Ok(Action::Done);
        };
        if mig.status.retry_count >= policy.max_retries {
            debug!(migration = %mig.key(), retries = mig.status.retry_count, "retry budget exhausted");
            return Ok(Action::Done);
        }

        let delay_secs = policy.retry_delay_seconds as f64
            * policy.backoff_multiplier.powi(mig.status.retry_count as i32);
        let delay = Duration::from_secs_f64(delay_secs.max(0.0)).min(MAX_RETRY_DELAY);

        let reference = mig
            .status
            .last_retry_time
            .or(mig.status.phase_started_at)
            .unwrap_or_else(Utc::now);
        let elapsed = (Utc::now() - reference).to_std().unwrap_or_default();
        if elapsed < delay {
            return Ok(Action::RequeueAfter(delay - elapsed));
        }

        let attempt = mig.status.retry_count + 1;
        info!(migration = %mig.key(), attempt, "retrying migration");
        self.ctx
            .recorder
            .record(VMMigration::KIND, &mig.key(), EventType::Normal, "Retrying", format!("attempt {attempt}"))
            .await;
        mig.status.retry_count = attempt;
        mig.status.last_retry_time = Some(Utc::now());
        mig.status.task_ref = None;
        mig.status.phase = MigrationPhase::Pending;
        mig.status.phase_started_at = Some(Utc::now());
        mig.status.message = format!("retry attempt {attempt}");
        set_condition(
            &mut mig.status.conditions,
            Condition::new(
                ConditionType::Retrying,
                ConditionStatus::True,
                "RetryScheduled",
                format!("attempt {attempt}"),
            ),
        );
        self.write(api, mig).await?;
        Ok(Action::requeue_now())
    }

    /// Deletion path: remove the annotated target VM, clean staging and
    /// the created snapshot, then release the finalizer. Errors are
    /// recorded but never block finalizer removal.
    async fn finalize(&self, api: &Api<VMMigration>, mut mig: VMMigration) -> ReconcileResult {
        if !mig.meta.has_finalizer(MIGRATION_FINALIZER) {
            return Ok(Action::Done);
        }
        let key = mig.key();

        // Partially created target VM carrying our annotation.
        let vms: Api<VirtualMachine> = self.ctx.api();
        let target_key = ObjectKey::new(mig.target_namespace(), &mig.spec.target.name);
        if let Some(target_vm) = vms.get(&target_key).await? {
            let ours = target_vm.meta.annotations.get(MIGRATION_ANNOTATION)
                == Some(&mig.annotation_value());
            if ours && !mig.status.cleanup_done {
                if let Err(e) = vms.delete(&target_key).await {
                    warn!(migration = %key, error = %e, "target VM deletion failed");
                } else {
                    self.ctx
                        .recorder
                        .record(VMMigration::KIND, &key, EventType::Normal, "TargetVMDeleted", target_key.to_string())
                        .await;
                }
            }
        }

        // Staging artifacts, best-effort.
        if !mig.status.storage_cleaned {
            if let Some(url) = mig.status.staging_url.clone() {
                match self.driver(&mig) {
                    Ok(driver) => match driver.delete(&url).await {
                        Ok(()) => mig.status.storage_cleaned = true,
                        Err(e) if e.is_not_found() => mig.status.storage_cleaned = true,
                        Err(e) => {
                            warn!(migration = %key, error = %e, "staging cleanup failed during deletion")
                        }
                    },
                    Err(e) => {
                        warn!(migration = %key, error = %e, "staging driver unavailable during deletion")
                    }
                }
            }
        }

        // Migration-created snapshot, best-effort.
        if mig.status.snapshot_created {
            if let (Some(snapshot_id), Ok(Some(source_vm))) =
                (mig.status.snapshot_id.clone(), self.source_vm(&mig).await)
            {
                if let Some(vm_id) = source_vm.status.id.clone() {
                    let src_provider = Self::source_provider_name(&mig, &source_vm);
                    if let Ok(Ok((_, client))) =
                        self.usable_provider(&mig.meta.namespace, &src_provider).await
                    {
                        if let Err(e) = client.snapshot_delete(&vm_id, &snapshot_id).await {
                            warn!(migration = %key, error = %e, "snapshot cleanup failed during deletion");
                        }
                    }
                }
            }
        }

        let mig = self.write(api, mig).await?;
        finalizer::remove(api, &mig, MIGRATION_FINALIZER).await?;
        info!(migration = %key, "finalizer released");
        Ok(Action::Done)
    }
}

#[async_trait]
impl Reconciler for MigrationReconciler {
    fn kind(&self) -> &'static str {
        VMMigration::KIND
    }

    #[instrument(skip(self), fields(migration = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult {
        let api: Api<VMMigration> = self.ctx.api();
        let Some(mig) = api.get(key).await? else {
            return Ok(Action::Done);
        };

        if mig.meta.is_deleting() {
            return self.finalize(&api, mig).await;
        }

        if finalizer::ensure(&api, &mig, MIGRATION_FINALIZER).await?.is_some() {
            return Ok(Action::requeue_now());
        }

        // Phase timeout for non-terminal phases.
        if !mig.status.phase.is_terminal() {
            if let Some(started) = mig.status.phase_started_at {
                let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
                if elapsed > Self::phase_timeout(&mig) {
                    let phase = mig.status.phase.as_str();
                    return self
                        .fail(
                            &api,
                            mig,
                            "Timeout",
                            format!("phase {phase} exceeded its timeout"),
                            false,
                        )
                        .await;
                }
            }
        }

        match mig.status.phase {
            MigrationPhase::Pending => self.handle_pending(&api, mig).await,
            MigrationPhase::Validating => self.handle_validating(&api, mig).await,
            MigrationPhase::Snapshotting => self.handle_snapshotting(&api, mig).await,
            MigrationPhase::Exporting => self.handle_exporting(&api, mig).await,
            // Reserved phases: the default pipeline exports directly to
            // the staging channel and rejects cross-format migrations, so
            // nothing parks here; pass through if ever entered.
            MigrationPhase::Transferring | MigrationPhase::Converting => {
                self.transition(&api, mig, MigrationPhase::Importing, "passthrough").await?;
                Ok(Action::requeue_now())
            }
            MigrationPhase::Importing => self.handle_importing(&api, mig).await,
            MigrationPhase::Creating => self.handle_creating(&api, mig).await,
            MigrationPhase::ValidatingTarget => self.handle_validating_target(&api, mig).await,
            MigrationPhase::Ready => self.handle_ready(&api, mig).await,
            MigrationPhase::Failed => self.handle_failed(&api, mig).await,
        }
    }
}
