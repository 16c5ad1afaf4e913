//! VirtualMachine reconciler.
//!
//! Realises a single VM on its referenced provider: create, power
//! convergence, reconfiguration (with an OffGraceful -> Reconfigure -> On
//! staging when online reconfigure is unsupported), self-healing against
//! out-of-band deletion, and the finalizer path.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use virtrigaud_api::condition::{
    clear_condition, is_condition_true, set_condition, Condition, ConditionStatus, ConditionType,
};
use virtrigaud_api::provider::{Provider, ProviderCapabilities, ProviderType};
use virtrigaud_api::quantity::{bytes_to_gib_clamped, bytes_to_mib_clamped};
use virtrigaud_api::vm::{
    ObservedHardware, ObservedPowerState, PowerState, VirtualMachine, VirtualMachineStatus,
    VmPhase,
};
use virtrigaud_api::vmclass::Firmware;
use virtrigaud_api::{Object, ObjectKey, VMClass, VMImage, VMNetworkAttachment, VMPlacementPolicy};
use virtrigaud_provider::{
    CreateRequest, DescribeResponse, DiskCreate, ImageSource, NetworkAttach,
    PlacementConstraints, PowerOp, ProviderError, ProviderRpc, ReconfigureRequest, TaskRef,
};
use virtrigaud_store::{Api, EventType};

use crate::context::Ctx;
use crate::finalizer::{self, VM_FINALIZER};
use crate::reconcile::{Action, ReconcileResult, Reconciler};
use crate::requeue;

/// Resolved dependencies for one reconciliation pass.
struct Deps {
    provider: Provider,
    client: Arc<dyn ProviderRpc>,
    image: Option<VMImage>,
    networks: Vec<VMNetworkAttachment>,
    capabilities: ProviderCapabilities,
    desired_hw: ObservedHardware,
    firmware: Firmware,
    disks: Vec<DiskCreate>,
    placement_policy: Option<VMPlacementPolicy>,
}

enum DepOutcome {
    Ready(Box<Deps>),
    /// A dependency is missing or not ready; requeue without failing.
    Wait(String),
    /// The spec itself is invalid; do not retry until it changes.
    Invalid(String),
}

pub struct VmReconciler {
    ctx: Arc<Ctx>,
}

impl VmReconciler {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }

    async fn resolve_deps(&self, vm: &VirtualMachine) -> anyhow::Result<DepOutcome> {
        let ns = vm.meta.namespace.as_str();

        let providers: Api<Provider> = self.ctx.api();
        let provider_name = vm.spec.provider_ref.name.as_str();
        let Some(provider) = providers.get(&ObjectKey::new(ns, provider_name)).await? else {
            return Ok(DepOutcome::Wait(format!("Provider {provider_name} not found")));
        };
        if !provider.is_usable() {
            return Ok(DepOutcome::Wait(format!("Provider {provider_name} not ready")));
        }

        let classes: Api<VMClass> = self.ctx.api();
        let class_name = vm.spec.class_ref.name.as_str();
        let Some(class) = classes.get(&ObjectKey::new(ns, class_name)).await? else {
            return Ok(DepOutcome::Wait(format!("VMClass {class_name} not found")));
        };

        let images: Api<VMImage> = self.ctx.api();
        let image = match &vm.spec.image_ref {
            Some(image_ref) => {
                let Some(image) = images.get(&ObjectKey::new(ns, &image_ref.name)).await? else {
                    return Ok(DepOutcome::Wait(format!("VMImage {} not found", image_ref.name)));
                };
                match image.status.phase {
                    virtrigaud_api::ImagePhase::Failed => {
                        return Ok(DepOutcome::Invalid(format!(
                            "VMImage {} failed preparation",
                            image_ref.name
                        )));
                    }
                    virtrigaud_api::ImagePhase::Ready => {}
                    // Images without a prepare policy are usable as-is.
                    _ if image.spec.prepare.is_some() => {
                        return Ok(DepOutcome::Wait(format!(
                            "VMImage {} not ready",
                            image_ref.name
                        )));
                    }
                    _ => {}
                }
                if image.variant_for(provider.spec.provider_type).is_none() {
                    return Ok(DepOutcome::Invalid(format!(
                        "VMImage {} has no {} variant",
                        image_ref.name,
                        provider.spec.provider_type.as_str()
                    )));
                }
                Some(image)
            }
            None => None,
        };

        let attachments: Api<VMNetworkAttachment> = self.ctx.api();
        let mut networks = Vec::with_capacity(vm.spec.networks.len());
        for net_ref in &vm.spec.networks {
            let Some(att) = attachments.get(&ObjectKey::new(ns, &net_ref.name)).await? else {
                return Ok(DepOutcome::Wait(format!(
                    "VMNetworkAttachment {} not found",
                    net_ref.name
                )));
            };
            networks.push(att);
        }

        let placement_policy = match vm.spec.placement.as_ref().and_then(|p| p.policy_ref.as_ref())
        {
            Some(policy_ref) => {
                let policies: Api<VMPlacementPolicy> = self.ctx.api();
                let Some(policy) = policies.get(&ObjectKey::new(ns, &policy_ref.name)).await?
                else {
                    return Ok(DepOutcome::Wait(format!(
                        "VMPlacementPolicy {} not found",
                        policy_ref.name
                    )));
                };
                // Hard constraints must hold; a hint outside them is an
                // impossible placement, not something to retry.
                if let Some(hints) = vm.spec.placement.as_ref() {
                    let hard = &policy.spec.hard;
                    if let Some(cluster) = &hints.cluster {
                        if !hard.clusters.is_empty() && !hard.clusters.contains(cluster) {
                            return Ok(DepOutcome::Invalid(format!(
                                "cluster {cluster} conflicts with placement policy {}",
                                policy.meta.name
                            )));
                        }
                    }
                    if let Some(datastore) = &hints.datastore {
                        if !hard.datastores.is_empty() && !hard.datastores.contains(datastore) {
                            return Ok(DepOutcome::Invalid(format!(
                                "datastore {datastore} conflicts with placement policy {}",
                                policy.meta.name
                            )));
                        }
                    }
                    if let Some(host) = &hints.host {
                        if !hard.hosts.is_empty() && !hard.hosts.contains(host) {
                            return Ok(DepOutcome::Invalid(format!(
                                "host {host} conflicts with placement policy {}",
                                policy.meta.name
                            )));
                        }
                    }
                }
                Some(policy)
            }
            None => None,
        };

        let client = match self.ctx.client_for(&provider).await {
            Ok(client) => client,
            Err(e) => return Ok(DepOutcome::Wait(format!("provider worker: {e}"))),
        };

        let capabilities = match provider.status.capabilities.clone() {
            Some(caps) => caps,
            None => match client.capabilities().await {
                Ok(caps) => caps,
                Err(e) => return Ok(DepOutcome::Wait(format!("provider capabilities: {e}"))),
            },
        };

        let memory_bytes = match class.spec.memory.as_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(DepOutcome::Invalid(format!(
                    "VMClass {class_name} memory: {e}"
                )));
            }
        };
        let desired_hw = ObservedHardware {
            cpus: class.spec.cpus,
            memory_mib: bytes_to_mib_clamped(memory_bytes),
        };

        let mut disks = Vec::with_capacity(vm.spec.disks.len());
        for disk in &vm.spec.disks {
            let size = disk
                .size
                .clone()
                .or_else(|| class.spec.disk_defaults.as_ref().and_then(|d| d.size.clone()));
            let size_gib = match size {
                Some(q) => match q.as_bytes() {
                    Ok(bytes) => bytes_to_gib_clamped(bytes),
                    Err(e) => {
                        return Ok(DepOutcome::Invalid(format!("disk {}: {e}", disk.name)));
                    }
                },
                None => {
                    return Ok(DepOutcome::Invalid(format!(
                        "disk {} has no size and the class has no default",
                        disk.name
                    )));
                }
            };
            disks.push(DiskCreate {
                name: disk.name.clone(),
                size_gib,
                disk_type: disk.disk_type.clone().or_else(|| {
                    class
                        .spec
                        .disk_defaults
                        .as_ref()
                        .and_then(|d| d.disk_type.clone())
                }),
            });
        }

        Ok(DepOutcome::Ready(Box::new(Deps {
            provider,
            client,
            image,
            networks,
            capabilities,
            desired_hw,
            firmware: class.spec.firmware,
            disks,
            placement_policy,
        })))
    }

    fn build_create_request(vm: &VirtualMachine, deps: &Deps) -> CreateRequest {
        let provider_type = deps.provider.spec.provider_type;

        let image = deps.image.as_ref().and_then(|img| {
            img.variant_for(provider_type).map(|variant| ImageSource {
                template_name: variant.template_name.clone(),
                url: variant.url.clone(),
                format: variant.format.clone(),
            })
        });

        let networks = deps
            .networks
            .iter()
            .map(|att| network_attach(provider_type, att))
            .collect();

        // Precedence: explicit hints, then the policy's constraints, then
        // the provider defaults.
        let defaults = &deps.provider.spec.defaults;
        let hints = vm.spec.placement.as_ref();
        let policy = deps.placement_policy.as_ref();
        let placement = PlacementConstraints {
            cluster: hints
                .and_then(|p| p.cluster.clone())
                .or_else(|| policy.and_then(|p| p.spec.hard.clusters.first().cloned()))
                .or_else(|| defaults.cluster.clone()),
            datastore: hints
                .and_then(|p| p.datastore.clone())
                .or_else(|| policy.and_then(|p| p.spec.hard.datastores.first().cloned()))
                .or_else(|| defaults.datastore.clone()),
            folder: hints
                .and_then(|p| p.folder.clone())
                .or_else(|| policy.and_then(|p| p.spec.soft.folders.first().cloned()))
                .or_else(|| defaults.folder.clone()),
            host: hints
                .and_then(|p| p.host.clone())
                .or_else(|| policy.and_then(|p| p.spec.hard.hosts.first().cloned())),
        };

        CreateRequest {
            name: vm.meta.name.clone(),
            cpus: deps.desired_hw.cpus,
            memory_mib: deps.desired_hw.memory_mib,
            firmware: Some(deps.firmware.as_str().to_string()),
            disks: deps.disks.clone(),
            networks,
            image,
            user_data: vm.spec.user_data.as_ref().and_then(|u| u.inline.clone()),
            placement: Some(placement),
            power_on: vm.spec.power_state == PowerState::On,
            tags: vm.spec.tags.clone(),
            extra_config: vm.spec.extra_config.clone(),
        }
    }

    /// Issue Create and record the returned identity immediately.
    async fn create_vm(
        &self,
        api: &Api<VirtualMachine>,
        mut vm: VirtualMachine,
        deps: &Deps,
    ) -> ReconcileResult {
        let req = Self::build_create_request(&vm, deps);
        let resp = match deps.client.create(req).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(vm = %vm.key(), error = %e, "create failed");
                self.ctx
                    .recorder
                    .record(VirtualMachine::KIND, &vm.key(), EventType::Warning, "CreateFailed", e.to_string())
                    .await;
                fail_condition(&mut vm.status, e.kind(), e.to_string());
                vm.status.observed_generation = vm.meta.generation;
                api.update_status(&vm).await?;
                return rpc_error_action(&e);
            }
        };

        info!(vm = %vm.key(), id = %resp.id, "VM created on provider");
        self.ctx
            .recorder
            .record(VirtualMachine::KIND, &vm.key(), EventType::Normal, "Created", format!("provider id {}", resp.id))
            .await;

        vm.status.id = Some(resp.id);
        clear_condition(&mut vm.status.conditions, ConditionType::ReconcileError);
        match resp.task {
            Some(task) => {
                vm.status.task_ref = Some(task.0);
                vm.status.phase = VmPhase::Provisioning;
                set_condition(
                    &mut vm.status.conditions,
                    Condition::new(ConditionType::Provisioning, ConditionStatus::True, "CreateInProgress", ""),
                );
            }
            None => {
                vm.status.hardware = Some(deps.desired_hw);
                vm.status.phase = VmPhase::Provisioning;
            }
        }
        vm.status.observed_generation = vm.meta.generation;
        api.update_status(&vm).await?;
        Ok(Action::requeue_now())
    }

    async fn finalize(&self, api: &Api<VirtualMachine>, mut vm: VirtualMachine) -> ReconcileResult {
        if !vm.meta.has_finalizer(VM_FINALIZER) {
            return Ok(Action::Done);
        }
        let key = vm.key();
        vm.status.phase = VmPhase::Deleting;
        set_condition(
            &mut vm.status.conditions,
            Condition::new(ConditionType::Deleting, ConditionStatus::True, "DeletionRequested", ""),
        );

        let providers: Api<Provider> = self.ctx.api();
        let provider = providers
            .get(&ObjectKey::new(&vm.meta.namespace, &vm.spec.provider_ref.name))
            .await?;
        let Some(provider) = provider else {
            // The provider is irrecoverably absent; do not block deletion.
            warn!(vm = %key, "provider resource gone, releasing finalizer");
            self.ctx
                .recorder
                .record(VirtualMachine::KIND, &key, EventType::Warning, "ProviderGone", "releasing finalizer without provider-side cleanup")
                .await;
            finalizer::remove(api, &vm, VM_FINALIZER).await?;
            return Ok(Action::Done);
        };

        let client = match self.ctx.client_for(&provider).await {
            Ok(client) => client,
            Err(e) => {
                debug!(vm = %key, error = %e, "provider unreachable during deletion");
                return Ok(Action::RequeueAfter(requeue::TRANSIENT));
            }
        };

        if let Some(task) = vm.status.task_ref.clone() {
            let st = match client.task_status(&TaskRef::new(task)).await {
                Ok(st) => st,
                Err(_) => return Ok(Action::RequeueAfter(requeue::TRANSIENT)),
            };
            if !st.done {
                return Ok(Action::RequeueAfter(requeue::TRANSIENT));
            }
            vm.status.task_ref = None;
            if let Some(err) = st.error {
                warn!(vm = %key, error = %err, "delete task failed, retrying");
            }
        }

        if let Some(id) = vm.status.id.clone() {
            let desc = match client.describe(&id).await {
                Ok(desc) => desc,
                Err(_) => return Ok(Action::RequeueAfter(requeue::TRANSIENT)),
            };
            if desc.exists {
                match client.delete(&id).await {
                    Ok(Some(task)) => {
                        vm.status.task_ref = Some(task.0);
                        vm.status.observed_generation = vm.meta.generation;
                        api.update_status(&vm).await?;
                        return Ok(Action::RequeueAfter(requeue::TRANSIENT));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(vm = %key, error = %e, "provider delete failed");
                        return Ok(Action::RequeueAfter(requeue::TRANSIENT));
                    }
                }
            }
        }

        info!(vm = %key, "provider-side VM removed, releasing finalizer");
        self.ctx
            .recorder
            .record(VirtualMachine::KIND, &key, EventType::Normal, "Deleted", "provider confirmed removal")
            .await;
        finalizer::remove(api, &vm, VM_FINALIZER).await?;
        Ok(Action::Done)
    }
}

#[async_trait]
impl Reconciler for VmReconciler {
    fn kind(&self) -> &'static str {
        VirtualMachine::KIND
    }

    #[instrument(skip(self), fields(vm = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult {
        let api: Api<VirtualMachine> = self.ctx.api();
        let Some(mut vm) = api.get(key).await? else {
            return Ok(Action::Done);
        };

        if vm.meta.is_deleting() {
            return self.finalize(&api, vm).await;
        }

        if finalizer::ensure(&api, &vm, VM_FINALIZER).await?.is_some() {
            return Ok(Action::requeue_now());
        }

        let deps = match self.resolve_deps(&vm).await? {
            DepOutcome::Ready(deps) => {
                set_condition(
                    &mut vm.status.conditions,
                    Condition::new(
                        ConditionType::WaitingForDependencies,
                        ConditionStatus::False,
                        "Resolved",
                        "",
                    ),
                );
                deps
            }
            DepOutcome::Wait(msg) => {
                debug!(vm = %key, reason = %msg, "waiting for dependencies");
                set_condition(
                    &mut vm.status.conditions,
                    Condition::new(
                        ConditionType::WaitingForDependencies,
                        ConditionStatus::True,
                        "DependencyMissing",
                        msg,
                    ),
                );
                set_condition(
                    &mut vm.status.conditions,
                    Condition::new(ConditionType::Ready, ConditionStatus::False, "WaitingForDependencies", ""),
                );
                vm.status.observed_generation = vm.meta.generation;
                api.update_status(&vm).await?;
                return Ok(Action::RequeueAfter(requeue::TRANSIENT));
            }
            DepOutcome::Invalid(msg) => {
                warn!(vm = %key, reason = %msg, "spec invalid");
                self.ctx
                    .recorder
                    .record(VirtualMachine::KIND, key, EventType::Warning, "ValidationError", msg.clone())
                    .await;
                fail_condition(&mut vm.status, "ValidationError", msg);
                vm.status.observed_generation = vm.meta.generation;
                api.update_status(&vm).await?;
                // No retry until the spec changes.
                return Ok(Action::Done);
            }
        };

        // Poll a parked task before anything else.
        if let Some(task) = vm.status.task_ref.clone() {
            match deps.client.task_status(&TaskRef::new(task)).await {
                Err(e) => {
                    fail_condition(&mut vm.status, e.kind(), e.to_string());
                    vm.status.observed_generation = vm.meta.generation;
                    api.update_status(&vm).await?;
                    return rpc_error_action(&e);
                }
                Ok(st) if !st.done => {
                    return Ok(Action::RequeueAfter(requeue::TRANSIENT));
                }
                Ok(st) => {
                    vm.status.task_ref = None;
                    if let Some(err) = st.error {
                        self.ctx
                            .recorder
                            .record(VirtualMachine::KIND, key, EventType::Warning, "TaskFailed", err.clone())
                            .await;
                        fail_condition(&mut vm.status, "TaskFailed", err);
                        vm.status.observed_generation = vm.meta.generation;
                        api.update_status(&vm).await?;
                        return Ok(Action::RequeueAfter(requeue::ERROR));
                    }
                    if matches!(vm.status.phase, VmPhase::Provisioning | VmPhase::Reconfiguring) {
                        vm.status.hardware = Some(deps.desired_hw);
                    }
                    clear_condition(&mut vm.status.conditions, ConditionType::ReconcileError);
                }
            }
        }

        // No provider identity yet: create.
        let Some(id) = vm.status.id.clone() else {
            return self.create_vm(&api, vm, &deps).await;
        };

        let desc = match deps.client.describe(&id).await {
            Ok(desc) => desc,
            Err(e) => {
                fail_condition(&mut vm.status, e.kind(), e.to_string());
                vm.status.observed_generation = vm.meta.generation;
                api.update_status(&vm).await?;
                return rpc_error_action(&e);
            }
        };

        // Self-healing: the provider lost the VM out of band.
        if !desc.exists {
            warn!(vm = %key, id = %id, "provider no longer knows the VM, re-creating");
            self.ctx
                .recorder
                .record(VirtualMachine::KIND, key, EventType::Warning, "OutOfBandDeletion", format!("provider id {id} vanished"))
                .await;
            vm.status.id = None;
            vm.status.hardware = None;
            vm.status.ips.clear();
            vm.status.phase = VmPhase::Pending;
            vm.status.observed_generation = vm.meta.generation;
            let vm = api.update_status(&vm).await?;
            return self.create_vm(&api, vm, &deps).await;
        }

        let is_on = desc.power_state == ObservedPowerState::On;
        let drift = vm
            .status
            .hardware
            .map(|observed| observed != deps.desired_hw)
            .unwrap_or(false);

        if drift {
            return self.reconcile_hardware(&api, vm, &id, &deps, &desc, is_on).await;
        }

        // Power convergence.
        let pending_cycle =
            is_condition_true(&vm.status.conditions, ConditionType::ReconfigurePendingPowerCycle);
        let wants_on = vm.spec.power_state == PowerState::On;
        if wants_on != is_on {
            let op = if wants_on {
                PowerOp::On
            } else if vm.spec.power_state == PowerState::OffGraceful {
                PowerOp::OffGraceful
            } else {
                PowerOp::Off
            };
            debug!(vm = %key, op = ?op, "reconciling power state");
            match deps.client.power(&id, op).await {
                Ok(task) => {
                    vm.status.task_ref = task.map(|t| t.0);
                }
                Err(e) => {
                    fail_condition(&mut vm.status, e.kind(), e.to_string());
                    vm.status.observed_generation = vm.meta.generation;
                    api.update_status(&vm).await?;
                    return rpc_error_action(&e);
                }
            }
            merge_describe(&mut vm.status, &desc);
            vm.status.phase = if pending_cycle {
                VmPhase::Reconfiguring
            } else if is_on {
                VmPhase::Running
            } else {
                VmPhase::PoweredOff
            };
            set_condition(
                &mut vm.status.conditions,
                Condition::new(ConditionType::Ready, ConditionStatus::False, "Converging", ""),
            );
            vm.status.observed_generation = vm.meta.generation;
            api.update_status(&vm).await?;
            return Ok(Action::RequeueAfter(requeue::TRANSIENT));
        }

        // Stable: merge observation, settle conditions.
        merge_describe(&mut vm.status, &desc);
        vm.status.phase = if is_on { VmPhase::Running } else { VmPhase::PoweredOff };
        clear_condition(&mut vm.status.conditions, ConditionType::ReconfigurePendingPowerCycle);
        clear_condition(&mut vm.status.conditions, ConditionType::Provisioning);
        clear_condition(&mut vm.status.conditions, ConditionType::ReconcileError);
        set_condition(
            &mut vm.status.conditions,
            Condition::new(
                ConditionType::Ready,
                ConditionStatus::True,
                if is_on { "Running" } else { "PoweredOff" },
                "",
            ),
        );
        vm.status.observed_generation = vm.meta.generation;
        let vm = api.update_status(&vm).await?;
        Ok(Action::RequeueAfter(requeue::for_vm(&vm.status)))
    }
}

impl VmReconciler {
    /// Converge hardware: reconfigure directly when possible, or stage an
    /// OffGraceful -> Reconfigure -> On cycle when online reconfigure is
    /// unsupported.
    async fn reconcile_hardware(
        &self,
        api: &Api<VirtualMachine>,
        mut vm: VirtualMachine,
        id: &str,
        deps: &Deps,
        desc: &DescribeResponse,
        is_on: bool,
    ) -> ReconcileResult {
        let key = vm.key();

        if is_on && !deps.capabilities.online_reconfigure {
            info!(vm = %key, "staging power cycle for offline reconfigure");
            set_condition(
                &mut vm.status.conditions,
                Condition::new(
                    ConditionType::ReconfigurePendingPowerCycle,
                    ConditionStatus::True,
                    "OfflineReconfigureRequired",
                    "provider cannot reconfigure a running VM",
                ),
            );
            match deps.client.power(id, PowerOp::OffGraceful).await {
                Ok(task) => vm.status.task_ref = task.map(|t| t.0),
                Err(e) => {
                    fail_condition(&mut vm.status, e.kind(), e.to_string());
                    vm.status.observed_generation = vm.meta.generation;
                    api.update_status(&vm).await?;
                    return rpc_error_action(&e);
                }
            }
            merge_describe(&mut vm.status, desc);
            vm.status.phase = VmPhase::Running;
            vm.status.observed_generation = vm.meta.generation;
            api.update_status(&vm).await?;
            return Ok(Action::RequeueAfter(requeue::TRANSIENT));
        }

        // Record the observed power-off before reconfiguring, so the phase
        // history reflects the staged cycle.
        if !is_on && vm.status.phase == VmPhase::Running {
            merge_describe(&mut vm.status, desc);
            vm.status.phase = VmPhase::PoweredOff;
            vm.status.observed_generation = vm.meta.generation;
            api.update_status(&vm).await?;
            return Ok(Action::requeue_now());
        }

        info!(vm = %key, cpus = deps.desired_hw.cpus, memory_mib = deps.desired_hw.memory_mib, "reconfiguring");
        self.ctx
            .recorder
            .record(VirtualMachine::KIND, &key, EventType::Normal, "Reconfiguring", format!("{}c/{}MiB", deps.desired_hw.cpus, deps.desired_hw.memory_mib))
            .await;
        let req = ReconfigureRequest {
            cpus: Some(deps.desired_hw.cpus),
            memory_mib: Some(deps.desired_hw.memory_mib),
            disks: None,
        };
        match deps.client.reconfigure(id, req).await {
            Ok(task) => {
                vm.status.phase = VmPhase::Reconfiguring;
                set_condition(
                    &mut vm.status.conditions,
                    Condition::new(ConditionType::Reconfiguring, ConditionStatus::True, "InProgress", ""),
                );
                match task {
                    Some(t) => vm.status.task_ref = Some(t.0),
                    None => {
                        vm.status.hardware = Some(deps.desired_hw);
                        clear_condition(&mut vm.status.conditions, ConditionType::Reconfiguring);
                    }
                }
            }
            Err(e) => {
                fail_condition(&mut vm.status, e.kind(), e.to_string());
                vm.status.observed_generation = vm.meta.generation;
                api.update_status(&vm).await?;
                return rpc_error_action(&e);
            }
        }
        vm.status.observed_generation = vm.meta.generation;
        api.update_status(&vm).await?;
        Ok(Action::requeue_now())
    }
}

/// Outcome for a failed provider RPC whose condition is already written.
/// Transient failures propagate as errors so the work queue applies its
/// exponential back-off; the rest requeue on the flat error interval.
fn rpc_error_action(e: &ProviderError) -> ReconcileResult {
    if e.is_retryable() {
        Err(anyhow::anyhow!("provider RPC failed: {e}"))
    } else {
        Ok(Action::RequeueAfter(requeue::ERROR))
    }
}

fn merge_describe(status: &mut VirtualMachineStatus, desc: &DescribeResponse) {
    status.power_state = desc.power_state;
    status.ips = desc.ips.clone();
    status.console_url = desc.console_url.clone();
    status.provider_details = desc.details.clone();
}

fn fail_condition(status: &mut VirtualMachineStatus, reason: &str, message: impl Into<String>) {
    set_condition(
        &mut status.conditions,
        Condition::new(ConditionType::ReconcileError, ConditionStatus::True, reason, message),
    );
    set_condition(
        &mut status.conditions,
        Condition::new(ConditionType::Ready, ConditionStatus::False, reason, ""),
    );
}

/// Map an attachment to the provider-facing network binding for a
/// hypervisor type. The mock type takes whichever variant is declared.
fn network_attach(provider_type: ProviderType, att: &VMNetworkAttachment) -> NetworkAttach {
    let spec = &att.spec;
    let from_vsphere = |v: &virtrigaud_api::network::VSphereNetwork| NetworkAttach {
        network: v.portgroup.clone(),
        vlan: v.vlan,
        ..Default::default()
    };
    let from_libvirt = |v: &virtrigaud_api::network::LibvirtNetwork| NetworkAttach {
        network: v.bridge.clone(),
        model: v.model.clone(),
        mtu: v.mtu,
        ..Default::default()
    };
    let from_proxmox = |v: &virtrigaud_api::network::ProxmoxNetwork| NetworkAttach {
        network: v.bridge.clone(),
        vlan: v.vlan,
        ..Default::default()
    };

    let mapped = match provider_type {
        ProviderType::VSphere => spec.vsphere.as_ref().map(from_vsphere),
        ProviderType::Libvirt => spec.libvirt.as_ref().map(from_libvirt),
        ProviderType::Proxmox => spec.proxmox.as_ref().map(from_proxmox),
        ProviderType::Mock => spec
            .libvirt
            .as_ref()
            .map(from_libvirt)
            .or_else(|| spec.vsphere.as_ref().map(from_vsphere))
            .or_else(|| spec.proxmox.as_ref().map(from_proxmox)),
    };

    mapped.unwrap_or_else(|| NetworkAttach {
        network: att.meta.name.clone(),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtrigaud_api::network::{LibvirtNetwork, VMNetworkAttachmentSpec, VSphereNetwork};

    #[test]
    fn test_network_attach_picks_variant_for_type() {
        let mut spec = VMNetworkAttachmentSpec::default();
        spec.vsphere = Some(VSphereNetwork {
            portgroup: "pg-app".into(),
            vlan: Some(100),
        });
        spec.libvirt = Some(LibvirtNetwork {
            bridge: "br0".into(),
            model: Some("virtio".into()),
            mtu: Some(9000),
        });
        let att = VMNetworkAttachment::new("default", "app-net", spec);

        let vs = network_attach(ProviderType::VSphere, &att);
        assert_eq!(vs.network, "pg-app");
        assert_eq!(vs.vlan, Some(100));

        let lv = network_attach(ProviderType::Libvirt, &att);
        assert_eq!(lv.network, "br0");
        assert_eq!(lv.mtu, Some(9000));

        // No proxmox variant declared: fall back to the attachment name.
        let px = network_attach(ProviderType::Proxmox, &att);
        assert_eq!(px.network, "app-net");
    }

    #[test]
    fn test_fail_condition_sets_ready_false() {
        let mut status = VirtualMachineStatus::default();
        fail_condition(&mut status, "TaskFailed", "boom");
        assert!(is_condition_true(&status.conditions, ConditionType::ReconcileError));
        assert!(!is_condition_true(&status.conditions, ConditionType::Ready));
    }
}
