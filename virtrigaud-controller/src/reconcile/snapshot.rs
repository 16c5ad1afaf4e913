//! VMSnapshot reconciler.
//!
//! Pending -> Creating -> Ready, with retention sweeping: a snapshot past
//! its max age deletes itself, and one whose parent VM is gone does the
//! same when the policy asks for it. Deletion calls SnapshotDelete on the
//! provider and releases the finalizer only on success.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use virtrigaud_api::condition::{set_condition, Condition, ConditionStatus, ConditionType};
use virtrigaud_api::provider::Provider;
use virtrigaud_api::snapshot::{SnapshotPhase, VMSnapshot};
use virtrigaud_api::vm::VirtualMachine;
use virtrigaud_api::{Object, ObjectKey};
use virtrigaud_provider::{ProviderRpc, SnapshotCreateRequest, TaskRef};
use virtrigaud_store::{Api, EventType};

use crate::context::Ctx;
use crate::finalizer::{self, SNAPSHOT_FINALIZER};
use crate::reconcile::{Action, ReconcileResult, Reconciler};
use crate::requeue;

pub struct SnapshotReconciler {
    ctx: Arc<Ctx>,
}

struct Deps {
    vm: VirtualMachine,
    vm_id: String,
    client: Arc<dyn ProviderRpc>,
}

impl SnapshotReconciler {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }

    async fn resolve_deps(&self, snap: &VMSnapshot) -> anyhow::Result<Result<Deps, String>> {
        let ns = snap.meta.namespace.as_str();
        let vms: Api<VirtualMachine> = self.ctx.api();
        let Some(vm) = vms.get(&ObjectKey::new(ns, &snap.spec.vm_ref.name)).await? else {
            return Ok(Err(format!("VM {} not found", snap.spec.vm_ref.name)));
        };
        let Some(vm_id) = vm.status.id.clone() else {
            return Ok(Err(format!("VM {} has no provider ID", vm.meta.name)));
        };

        let providers: Api<Provider> = self.ctx.api();
        let Some(provider) = providers
            .get(&ObjectKey::new(ns, &vm.spec.provider_ref.name))
            .await?
        else {
            return Ok(Err(format!("Provider {} not found", vm.spec.provider_ref.name)));
        };
        if !provider.is_usable() {
            return Ok(Err(format!("Provider {} not ready", provider.meta.name)));
        }
        let client = match self.ctx.client_for(&provider).await {
            Ok(client) => client,
            Err(e) => return Ok(Err(format!("provider worker: {e}"))),
        };

        Ok(Ok(Deps { vm, vm_id, client }))
    }

    /// Retention sweep. Returns an action when the snapshot scheduled its
    /// own deletion.
    async fn sweep_retention(
        &self,
        api: &Api<VMSnapshot>,
        snap: &VMSnapshot,
    ) -> anyhow::Result<Option<Action>> {
        let Some(retention) = &snap.spec.retention else {
            return Ok(None);
        };
        let key = snap.key();

        if let (Some(max_age), Some(created_at)) = (retention.max_age_seconds, snap.status.created_at)
        {
            let age = (Utc::now() - created_at).to_std().unwrap_or_default();
            if age > Duration::from_secs(max_age) {
                info!(snapshot = %key, age_secs = age.as_secs(), "max age exceeded, self-deleting");
                self.ctx
                    .recorder
                    .record(VMSnapshot::KIND, &key, EventType::Normal, "RetentionExpired", format!("age {}s exceeds {max_age}s", age.as_secs()))
                    .await;
                api.delete(&key).await?;
                return Ok(Some(Action::requeue_now()));
            }
        }

        if retention.delete_on_vm_delete {
            let vms: Api<VirtualMachine> = self.ctx.api();
            let vm_key = ObjectKey::new(&snap.meta.namespace, &snap.spec.vm_ref.name);
            if vms.get(&vm_key).await?.is_none() {
                info!(snapshot = %key, "parent VM gone, self-deleting");
                self.ctx
                    .recorder
                    .record(VMSnapshot::KIND, &key, EventType::Normal, "ParentVMDeleted", vm_key.to_string())
                    .await;
                api.delete(&key).await?;
                return Ok(Some(Action::requeue_now()));
            }
        }

        Ok(None)
    }

    async fn finalize(&self, api: &Api<VMSnapshot>, mut snap: VMSnapshot) -> ReconcileResult {
        if !snap.meta.has_finalizer(SNAPSHOT_FINALIZER) {
            return Ok(Action::Done);
        }
        let key = snap.key();
        snap.status.phase = SnapshotPhase::Deleting;

        let Some(snapshot_id) = snap.status.snapshot_id.clone() else {
            // Nothing was created provider-side.
            finalizer::remove(api, &snap, SNAPSHOT_FINALIZER).await?;
            return Ok(Action::Done);
        };

        match self.resolve_deps(&snap).await? {
            Ok(deps) => {
                if let Err(e) = deps.client.snapshot_delete(&deps.vm_id, &snapshot_id).await {
                    warn!(snapshot = %key, error = %e, "provider snapshot delete failed");
                    return Ok(Action::RequeueAfter(requeue::TRANSIENT));
                }
                info!(snapshot = %key, "provider snapshot deleted");
            }
            Err(reason) => {
                // The parent VM or its provider resource being gone means
                // there is nothing left to delete; a merely unready
                // provider still blocks.
                let vms: Api<VirtualMachine> = self.ctx.api();
                let vm_gone = vms
                    .get(&ObjectKey::new(&snap.meta.namespace, &snap.spec.vm_ref.name))
                    .await?
                    .is_none();
                if !vm_gone {
                    debug!(snapshot = %key, reason = %reason, "deletion blocked on dependencies");
                    return Ok(Action::RequeueAfter(requeue::TRANSIENT));
                }
                warn!(snapshot = %key, "parent VM gone, releasing finalizer");
            }
        }

        finalizer::remove(api, &snap, SNAPSHOT_FINALIZER).await?;
        Ok(Action::Done)
    }
}

#[async_trait]
impl Reconciler for SnapshotReconciler {
    fn kind(&self) -> &'static str {
        VMSnapshot::KIND
    }

    #[instrument(skip(self), fields(snapshot = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult {
        let api: Api<VMSnapshot> = self.ctx.api();
        let Some(mut snap) = api.get(key).await? else {
            return Ok(Action::Done);
        };

        if snap.meta.is_deleting() {
            return self.finalize(&api, snap).await;
        }

        if finalizer::ensure(&api, &snap, SNAPSHOT_FINALIZER).await?.is_some() {
            return Ok(Action::requeue_now());
        }

        if let Some(action) = self.sweep_retention(&api, &snap).await? {
            return Ok(action);
        }

        let deps = match self.resolve_deps(&snap).await? {
            Ok(deps) => deps,
            Err(msg) => {
                set_condition(
                    &mut snap.status.conditions,
                    Condition::new(
                        ConditionType::WaitingForDependencies,
                        ConditionStatus::True,
                        "DependencyMissing",
                        msg,
                    ),
                );
                snap.status.observed_generation = snap.meta.generation;
                api.update_status(&snap).await?;
                return Ok(Action::RequeueAfter(requeue::TRANSIENT));
            }
        };

        if let Some(task) = snap.status.task_ref.clone() {
            match deps.client.task_status(&TaskRef::new(task)).await {
                Err(e) => {
                    warn!(snapshot = %key, error = %e, "task poll failed");
                    return Ok(Action::RequeueAfter(requeue::ERROR));
                }
                Ok(st) if !st.done => return Ok(Action::RequeueAfter(requeue::TRANSIENT)),
                Ok(st) => {
                    snap.status.task_ref = None;
                    if let Some(err) = st.error {
                        self.ctx
                            .recorder
                            .record(VMSnapshot::KIND, key, EventType::Warning, "TaskFailed", err.clone())
                            .await;
                        snap.status.phase = SnapshotPhase::Failed;
                        snap.status.message = err;
                        snap.status.observed_generation = snap.meta.generation;
                        api.update_status(&snap).await?;
                        return Ok(Action::RequeueAfter(requeue::ERROR));
                    }
                }
            }
        }

        match snap.status.phase {
            SnapshotPhase::Pending | SnapshotPhase::Failed => {
                let name = snap
                    .spec
                    .name_hint
                    .clone()
                    .unwrap_or_else(|| format!("vmsnap-{}", snap.meta.name));
                let resp = match deps
                    .client
                    .snapshot_create(SnapshotCreateRequest {
                        vm_id: deps.vm_id.clone(),
                        name,
                        include_memory: snap.spec.include_memory,
                        description: snap.spec.description.clone(),
                    })
                    .await
                {
                    Ok(resp) => resp,
                    Err(e) => {
                        self.ctx
                            .recorder
                            .record(VMSnapshot::KIND, key, EventType::Warning, "CreateFailed", e.to_string())
                            .await;
                        snap.status.message = e.to_string();
                        snap.status.observed_generation = snap.meta.generation;
                        api.update_status(&snap).await?;
                        return Ok(Action::RequeueAfter(requeue::ERROR));
                    }
                };

                info!(snapshot = %key, snapshot_id = %resp.snapshot_id, vm = %deps.vm.meta.name, "snapshot created");
                snap.status.snapshot_id = Some(resp.snapshot_id);
                snap.status.task_ref = resp.task.map(|t| t.0);
                snap.status.phase = SnapshotPhase::Creating;
                snap.status.message.clear();
                snap.status.observed_generation = snap.meta.generation;
                api.update_status(&snap).await?;
                Ok(Action::requeue_now())
            }
            SnapshotPhase::Creating => {
                // The create task (if any) completed above.
                snap.status.phase = SnapshotPhase::Ready;
                snap.status.created_at = Some(Utc::now());
                set_condition(
                    &mut snap.status.conditions,
                    Condition::new(ConditionType::Ready, ConditionStatus::True, "SnapshotReady", ""),
                );
                self.ctx
                    .recorder
                    .record(VMSnapshot::KIND, key, EventType::Normal, "Ready", "")
                    .await;
                snap.status.observed_generation = snap.meta.generation;
                api.update_status(&snap).await?;
                Ok(Action::RequeueAfter(requeue::STOPPED_STABLE))
            }
            SnapshotPhase::Ready => {
                // Periodic pass keeps the retention sweep live.
                Ok(Action::RequeueAfter(requeue::STOPPED_STABLE))
            }
            SnapshotPhase::Deleting => Ok(Action::Done),
        }
    }
}
