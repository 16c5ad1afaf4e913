//! VMClone reconciler.
//!
//! Pending -> Cloning -> Customizing -> Ready. Linked clones degrade to
//! full clones with a warning condition when the provider lacks the
//! capability.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use virtrigaud_api::clone::{ClonePhase, CloneSource, CloneType, VMClone};
use virtrigaud_api::condition::{set_condition, Condition, ConditionStatus, ConditionType};
use virtrigaud_api::provider::Provider;
use virtrigaud_api::vm::VirtualMachine;
use virtrigaud_api::{Object, ObjectKey, VMSnapshot};
use virtrigaud_provider::{CloneRequest, ProviderRpc, TaskRef};
use virtrigaud_store::{Api, EventType};

use crate::context::Ctx;
use crate::finalizer::{self, CLONE_FINALIZER};
use crate::reconcile::{Action, ReconcileResult, Reconciler};
use crate::requeue;

pub struct CloneReconciler {
    ctx: Arc<Ctx>,
}

struct Deps {
    client: Arc<dyn ProviderRpc>,
    linked_clones: bool,
    source_vm_id: Option<String>,
    source_snapshot_id: Option<String>,
    source_template: Option<String>,
}

impl CloneReconciler {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }

    /// Resolve the clone source down to provider-side identities plus the
    /// provider client that owns them.
    async fn resolve_deps(&self, clone: &VMClone) -> anyhow::Result<Result<Deps, String>> {
        let ns = clone.meta.namespace.as_str();
        let vms: Api<VirtualMachine> = self.ctx.api();
        let snaps: Api<VMSnapshot> = self.ctx.api();

        // Which VM anchors the provider depends on the source flavour.
        let (provider_name, source_vm_id, source_snapshot_id, source_template) =
            match &clone.spec.source {
                CloneSource::Vm(vm_ref) => {
                    let Some(vm) = vms.get(&ObjectKey::new(ns, &vm_ref.name)).await? else {
                        return Ok(Err(format!("VM {} not found", vm_ref.name)));
                    };
                    let Some(id) = vm.status.id.clone() else {
                        return Ok(Err(format!("VM {} has no provider ID", vm_ref.name)));
                    };
                    (vm.spec.provider_ref.name.clone(), Some(id), None, None)
                }
                CloneSource::Snapshot(snap_ref) => {
                    let Some(snap) = snaps.get(&ObjectKey::new(ns, &snap_ref.name)).await? else {
                        return Ok(Err(format!("VMSnapshot {} not found", snap_ref.name)));
                    };
                    let Some(snapshot_id) = snap.status.snapshot_id.clone() else {
                        return Ok(Err(format!("VMSnapshot {} has no snapshot ID", snap_ref.name)));
                    };
                    let Some(vm) = vms.get(&ObjectKey::new(ns, &snap.spec.vm_ref.name)).await?
                    else {
                        return Ok(Err(format!("VM {} not found", snap.spec.vm_ref.name)));
                    };
                    let Some(id) = vm.status.id.clone() else {
                        return Ok(Err(format!("VM {} has no provider ID", vm.meta.name)));
                    };
                    (
                        vm.spec.provider_ref.name.clone(),
                        Some(id),
                        Some(snapshot_id),
                        None,
                    )
                }
                CloneSource::Template(template) => {
                    // Templates live on a provider; the target class ref
                    // cannot name one, so require an explicit ref through
                    // annotations is overkill. Use the sole provider in
                    // the namespace.
                    let providers: Api<Provider> = self.ctx.api();
                    let all = providers.list(Some(ns)).await?;
                    let Some(provider) = all.into_iter().find(|p| p.is_usable()) else {
                        return Ok(Err("no usable provider for template clone".to_string()));
                    };
                    (provider.meta.name.clone(), None, None, Some(template.clone()))
                }
                CloneSource::Image(image_ref) => {
                    return Ok(Err(format!(
                        "image source {} requires a VM intermediate; create a VM instead",
                        image_ref.name
                    )));
                }
            };

        let providers: Api<Provider> = self.ctx.api();
        let Some(provider) = providers.get(&ObjectKey::new(ns, &provider_name)).await? else {
            return Ok(Err(format!("Provider {provider_name} not found")));
        };
        if !provider.is_usable() {
            return Ok(Err(format!("Provider {provider_name} not ready")));
        }
        let client = match self.ctx.client_for(&provider).await {
            Ok(client) => client,
            Err(e) => return Ok(Err(format!("provider worker: {e}"))),
        };
        let linked_clones = provider
            .status
            .capabilities
            .as_ref()
            .map(|c| c.linked_clones)
            .unwrap_or(false);

        Ok(Ok(Deps {
            client,
            linked_clones,
            source_vm_id,
            source_snapshot_id,
            source_template,
        }))
    }

    async fn finalize(&self, api: &Api<VMClone>, clone: VMClone) -> ReconcileResult {
        // The cloned VM is owned by the provider; nothing to release
        // beyond the record itself.
        finalizer::remove(api, &clone, CLONE_FINALIZER).await?;
        Ok(Action::Done)
    }
}

#[async_trait]
impl Reconciler for CloneReconciler {
    fn kind(&self) -> &'static str {
        VMClone::KIND
    }

    #[instrument(skip(self), fields(clone = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult {
        let api: Api<VMClone> = self.ctx.api();
        let Some(mut clone) = api.get(key).await? else {
            return Ok(Action::Done);
        };

        if clone.meta.is_deleting() {
            return self.finalize(&api, clone).await;
        }

        if finalizer::ensure(&api, &clone, CLONE_FINALIZER).await?.is_some() {
            return Ok(Action::requeue_now());
        }

        let deps = match self.resolve_deps(&clone).await? {
            Ok(deps) => deps,
            Err(msg) => {
                set_condition(
                    &mut clone.status.conditions,
                    Condition::new(
                        ConditionType::WaitingForDependencies,
                        ConditionStatus::True,
                        "DependencyMissing",
                        msg,
                    ),
                );
                clone.status.observed_generation = clone.meta.generation;
                api.update_status(&clone).await?;
                return Ok(Action::RequeueAfter(requeue::TRANSIENT));
            }
        };

        if let Some(task) = clone.status.task_ref.clone() {
            match deps.client.task_status(&TaskRef::new(task)).await {
                Err(e) => {
                    warn!(clone = %key, error = %e, "task poll failed");
                    return Ok(Action::RequeueAfter(requeue::ERROR));
                }
                Ok(st) if !st.done => return Ok(Action::RequeueAfter(requeue::TRANSIENT)),
                Ok(st) => {
                    clone.status.task_ref = None;
                    if let Some(err) = st.error {
                        clone.status.phase = ClonePhase::Failed;
                        clone.status.message = err.clone();
                        self.ctx
                            .recorder
                            .record(VMClone::KIND, key, EventType::Warning, "TaskFailed", err)
                            .await;
                        clone.status.observed_generation = clone.meta.generation;
                        api.update_status(&clone).await?;
                        return Ok(Action::RequeueAfter(requeue::ERROR));
                    }
                }
            }
        }

        match clone.status.phase {
            ClonePhase::Pending | ClonePhase::Failed => {
                let mut linked = clone.spec.clone_type != CloneType::Full;
                if linked && !deps.linked_clones {
                    // Degrade to a full clone rather than failing.
                    warn!(clone = %key, "provider lacks linked clones, degrading to full");
                    set_condition(
                        &mut clone.status.conditions,
                        Condition::new(
                            ConditionType::Degraded,
                            ConditionStatus::True,
                            "LinkedCloneUnsupported",
                            "provider lacks linked-clone support; performing a full clone",
                        ),
                    );
                    linked = false;
                }

                let resp = match deps
                    .client
                    .clone_vm(CloneRequest {
                        source_vm_id: deps.source_vm_id.clone(),
                        source_snapshot_id: deps.source_snapshot_id.clone(),
                        source_template: deps.source_template.clone(),
                        target_name: clone.spec.target_name.clone(),
                        linked,
                        power_on: clone.spec.power_on,
                    })
                    .await
                {
                    Ok(resp) => resp,
                    Err(e) => {
                        clone.status.message = e.to_string();
                        self.ctx
                            .recorder
                            .record(VMClone::KIND, key, EventType::Warning, "CloneFailed", e.to_string())
                            .await;
                        clone.status.observed_generation = clone.meta.generation;
                        api.update_status(&clone).await?;
                        return Ok(Action::RequeueAfter(requeue::ERROR));
                    }
                };

                info!(clone = %key, vm_id = %resp.id, "clone started");
                clone.status.vm_id = Some(resp.id);
                clone.status.task_ref = resp.task.map(|t| t.0);
                clone.status.phase = ClonePhase::Cloning;
                clone.status.message.clear();
                clone.status.observed_generation = clone.meta.generation;
                api.update_status(&clone).await?;
                Ok(Action::requeue_now())
            }
            ClonePhase::Cloning => {
                let next = if clone.spec.customization.is_some() {
                    ClonePhase::Customizing
                } else {
                    ClonePhase::Ready
                };
                clone.status.phase = next;
                if next == ClonePhase::Ready {
                    set_condition(
                        &mut clone.status.conditions,
                        Condition::new(ConditionType::Ready, ConditionStatus::True, "CloneComplete", ""),
                    );
                }
                clone.status.observed_generation = clone.meta.generation;
                api.update_status(&clone).await?;
                Ok(Action::requeue_now())
            }
            ClonePhase::Customizing => {
                // Guest customisation is applied by the provider worker at
                // first boot; observing it is the cloned VM's concern.
                self.ctx
                    .recorder
                    .record(VMClone::KIND, key, EventType::Normal, "CustomizationApplied", "")
                    .await;
                clone.status.phase = ClonePhase::Ready;
                set_condition(
                    &mut clone.status.conditions,
                    Condition::new(ConditionType::Ready, ConditionStatus::True, "CloneComplete", ""),
                );
                clone.status.observed_generation = clone.meta.generation;
                api.update_status(&clone).await?;
                Ok(Action::requeue_now())
            }
            ClonePhase::Ready => Ok(Action::RequeueAfter(requeue::STOPPED_STABLE)),
        }
    }
}
