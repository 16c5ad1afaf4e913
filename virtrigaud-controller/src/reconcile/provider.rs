//! Provider reconciler.
//!
//! Keeps the runtime phase and ProviderAvailable condition in step with
//! the worker's Validate endpoint, caches the capability set, and runs the
//! adoption sweep for providers carrying the adopt annotation: discovered
//! hypervisor VMs that nothing in the store manages are synthesised into
//! VM resources, with an auto-generated VMClass when no shape matches.
//! Adoption failures never block the Provider from being Ready.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use virtrigaud_api::condition::{set_condition, Condition, ConditionStatus, ConditionType};
use virtrigaud_api::provider::{Provider, ProviderRuntimePhase};
use virtrigaud_api::quantity::Quantity;
use virtrigaud_api::vm::{ImportedDiskRef, ObservedPowerState, PowerState, VirtualMachine, VirtualMachineSpec};
use virtrigaud_api::{LocalObjectRef, Object, ObjectKey, VMClass, ADOPTED_LABEL};
use virtrigaud_provider::DiscoveredVm;
use virtrigaud_store::{Api, EventType};

use crate::context::Ctx;
use crate::finalizer::{self, PROVIDER_FINALIZER};
use crate::reconcile::{Action, ReconcileResult, Reconciler};
use crate::requeue;

/// Default adoption discovery interval.
const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(3600);

pub struct ProviderReconciler {
    ctx: Arc<Ctx>,
}

/// Parsed adoption filter.
#[derive(Default, Debug)]
struct AdoptionFilter {
    name_regex: Option<Regex>,
    power_state: Option<ObservedPowerState>,
    min_cpu: Option<u32>,
    max_cpu: Option<u32>,
    min_memory_mib: Option<u64>,
    max_memory_mib: Option<u64>,
}

impl AdoptionFilter {
    /// Parse the filter map. Unknown keys are a validation error.
    fn parse(filter: &BTreeMap<String, String>) -> Result<Self, String> {
        let mut parsed = Self::default();
        for (key, value) in filter {
            match key.as_str() {
                "name-regex" => {
                    parsed.name_regex = Some(
                        Regex::new(value).map_err(|e| format!("filter name-regex: {e}"))?,
                    );
                }
                "power-state" => {
                    parsed.power_state = Some(match value.as_str() {
                        "On" => ObservedPowerState::On,
                        "Off" => ObservedPowerState::Off,
                        other => return Err(format!("filter power-state: unknown value {other:?}")),
                    });
                }
                "min-cpu" => {
                    parsed.min_cpu =
                        Some(value.parse().map_err(|_| format!("filter min-cpu: {value:?}"))?);
                }
                "max-cpu" => {
                    parsed.max_cpu =
                        Some(value.parse().map_err(|_| format!("filter max-cpu: {value:?}"))?);
                }
                "min-memory" => {
                    parsed.min_memory_mib =
                        Some(value.parse().map_err(|_| format!("filter min-memory: {value:?}"))?);
                }
                "max-memory" => {
                    parsed.max_memory_mib =
                        Some(value.parse().map_err(|_| format!("filter max-memory: {value:?}"))?);
                }
                other => return Err(format!("unrecognised filter key {other:?}")),
            }
        }
        Ok(parsed)
    }

    fn matches(&self, vm: &DiscoveredVm) -> bool {
        if let Some(re) = &self.name_regex {
            if !re.is_match(&vm.name) {
                return false;
            }
        }
        if let Some(power) = self.power_state {
            if vm.power_state != power {
                return false;
            }
        }
        if let Some(min) = self.min_cpu {
            if vm.cpus < min {
                return false;
            }
        }
        if let Some(max) = self.max_cpu {
            if vm.cpus > max {
                return false;
            }
        }
        if let Some(min) = self.min_memory_mib {
            if (vm.memory_mib as u64) < min {
                return false;
            }
        }
        if let Some(max) = self.max_memory_mib {
            if (vm.memory_mib as u64) > max {
                return false;
            }
        }
        true
    }
}

impl ProviderReconciler {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }

    /// VMClass for a discovered shape: reuse one with the same cpu/memory
    /// pair, or synthesise one named after the shape.
    async fn class_for_shape(
        &self,
        namespace: &str,
        cpus: u32,
        memory_mib: u32,
    ) -> anyhow::Result<String> {
        let classes: Api<VMClass> = self.ctx.api();
        let memory = Quantity::from_mib(memory_mib as u64);

        for class in classes.list(Some(namespace)).await? {
            if class.spec.cpus == cpus && class.spec.memory == memory {
                return Ok(class.meta.name);
            }
        }

        let name = format!("adopted-{}c-{}mi", cpus, memory_mib);
        let class = VMClass::with_shape(namespace, &name, cpus, memory);
        match classes.create(&class).await {
            Ok(_) => {
                info!(class = %name, "auto-generated VMClass for adopted shape");
            }
            Err(e) if matches!(e, virtrigaud_store::StoreError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(name)
    }

    /// One discovery round: list hypervisor VMs, exclude managed ones,
    /// apply the filter, synthesise resources.
    async fn run_adoption(&self, provider: &Provider) -> anyhow::Result<AdoptionRound> {
        let mut round = AdoptionRound::default();

        let filter = match &provider.spec.adoption {
            Some(adoption) => match AdoptionFilter::parse(&adoption.filter) {
                Ok(filter) => filter,
                Err(msg) => {
                    round.validation_error = Some(msg);
                    return Ok(round);
                }
            },
            None => AdoptionFilter::default(),
        };

        let client = self.ctx.client_for(provider).await?;
        let discovered = client.list_vms().await?;
        round.discovered = discovered.len() as u32;

        let vms: Api<VirtualMachine> = self.ctx.api();
        let managed: HashSet<String> = vms
            .list(None)
            .await?
            .into_iter()
            .filter_map(|vm| vm.status.id)
            .collect();

        for candidate in discovered {
            if managed.contains(&candidate.id) {
                continue;
            }
            if !filter.matches(&candidate) {
                debug!(vm = %candidate.name, "adoption candidate filtered out");
                continue;
            }

            match self.adopt_vm(provider, &candidate).await {
                Ok(()) => round.adopted += 1,
                Err(e) => {
                    warn!(vm = %candidate.name, error = %e, "adoption failed");
                    round.failed += 1;
                }
            }
        }

        Ok(round)
    }

    async fn adopt_vm(&self, provider: &Provider, candidate: &DiscoveredVm) -> anyhow::Result<()> {
        let namespace = provider.meta.namespace.as_str();
        let class_name = self
            .class_for_shape(namespace, candidate.cpus.max(1), candidate.memory_mib.max(1))
            .await?;

        let mut vm = VirtualMachine::new(
            namespace,
            sanitize_name(&candidate.name),
            VirtualMachineSpec {
                provider_ref: LocalObjectRef::new(&provider.meta.name),
                class_ref: LocalObjectRef::new(class_name),
                power_state: if candidate.power_state == ObservedPowerState::On {
                    PowerState::On
                } else {
                    PowerState::Off
                },
                imported_disk: Some(ImportedDiskRef {
                    import_id: format!("adopted-{}", candidate.id),
                    format: None,
                }),
                ..Default::default()
            },
        );
        vm.meta.labels.insert(ADOPTED_LABEL.to_string(), "true".to_string());
        // Pre-assigning the provider identity makes the VM reconciler
        // manage the existing machine instead of creating a new one.
        vm.status.id = Some(candidate.id.clone());
        vm.status.power_state = candidate.power_state;

        let vms: Api<VirtualMachine> = self.ctx.api();
        match vms.create(&vm).await {
            Ok(_) => {
                info!(vm = %vm.meta.name, id = %candidate.id, "VM adopted");
                self.ctx
                    .recorder
                    .record(Provider::KIND, &provider.key(), EventType::Normal, "VMAdopted", vm.meta.name.clone())
                    .await;
                Ok(())
            }
            Err(e) if matches!(e, virtrigaud_store::StoreError::AlreadyExists { .. }) => {
                // A resource with this name exists but manages a different
                // machine; surface rather than overwrite.
                Err(anyhow::anyhow!("name {} already taken in the store", vm.meta.name))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn finalize(&self, api: &Api<Provider>, provider: Provider) -> ReconcileResult {
        if provider.meta.has_finalizer(PROVIDER_FINALIZER) {
            self.ctx.resolver.evict(&provider.key().to_string()).await;
            finalizer::remove(api, &provider, PROVIDER_FINALIZER).await?;
        }
        Ok(Action::Done)
    }
}

#[derive(Default)]
struct AdoptionRound {
    discovered: u32,
    adopted: u32,
    failed: u32,
    validation_error: Option<String>,
}

#[async_trait]
impl Reconciler for ProviderReconciler {
    fn kind(&self) -> &'static str {
        Provider::KIND
    }

    #[instrument(skip(self), fields(provider = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult {
        let api: Api<Provider> = self.ctx.api();
        let Some(mut provider) = api.get(key).await? else {
            return Ok(Action::Done);
        };

        if provider.meta.is_deleting() {
            return self.finalize(&api, provider).await;
        }

        if finalizer::ensure(&api, &provider, PROVIDER_FINALIZER).await?.is_some() {
            return Ok(Action::requeue_now());
        }

        // Health: validate the worker and cache its capability set.
        let client = match self.ctx.client_for(&provider).await {
            Ok(client) => client,
            Err(e) => {
                provider.status.runtime_phase = ProviderRuntimePhase::Failed;
                provider.status.message = e.to_string();
                set_condition(
                    &mut provider.status.conditions,
                    Condition::new(ConditionType::ProviderAvailable, ConditionStatus::False, e.kind(), e.to_string()),
                );
                provider.status.observed_generation = provider.meta.generation;
                api.update_status(&provider).await?;
                return Ok(Action::RequeueAfter(requeue::ERROR));
            }
        };

        if let Err(e) = client.validate().await {
            warn!(provider = %key, error = %e, "worker validation failed");
            provider.status.runtime_phase = ProviderRuntimePhase::Degraded;
            provider.status.message = e.to_string();
            set_condition(
                &mut provider.status.conditions,
                Condition::new(ConditionType::ProviderAvailable, ConditionStatus::False, e.kind(), e.to_string()),
            );
            provider.status.observed_generation = provider.meta.generation;
            api.update_status(&provider).await?;
            return Ok(Action::RequeueAfter(requeue::ERROR));
        }

        match client.capabilities().await {
            Ok(caps) => provider.status.capabilities = Some(caps),
            Err(e) => {
                debug!(provider = %key, error = %e, "capability query failed, keeping cached set");
            }
        }

        provider.status.runtime_phase = ProviderRuntimePhase::Ready;
        provider.status.message.clear();
        set_condition(
            &mut provider.status.conditions,
            Condition::new(ConditionType::ProviderAvailable, ConditionStatus::True, "Validated", ""),
        );
        set_condition(
            &mut provider.status.conditions,
            Condition::new(ConditionType::Ready, ConditionStatus::True, "WorkerReady", ""),
        );

        // Adoption sweep, interval-gated. Failures never block readiness.
        if provider.adoption_enabled() {
            let interval = provider
                .spec
                .adoption
                .as_ref()
                .and_then(|a| a.interval_seconds)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_DISCOVERY_INTERVAL);
            let due = provider
                .status
                .adoption
                .last_discovery_time
                .map(|last| (Utc::now() - last).to_std().unwrap_or_default() >= interval)
                .unwrap_or(true);

            if due {
                // Persist health before the sweep so adoption sees a
                // usable provider.
                provider.status.observed_generation = provider.meta.generation;
                provider = api.update_status(&provider).await?;

                match self.run_adoption(&provider).await {
                    Ok(round) => {
                        if let Some(msg) = round.validation_error {
                            self.ctx
                                .recorder
                                .record(Provider::KIND, key, EventType::Warning, "ValidationError", msg.clone())
                                .await;
                            provider.status.adoption.message = msg;
                        } else {
                            provider.status.adoption.discovered_vms = round.discovered;
                            provider.status.adoption.adopted_vms += round.adopted;
                            provider.status.adoption.failed_adoptions += round.failed;
                            provider.status.adoption.message = format!(
                                "discovered {}, adopted {}, failed {}",
                                round.discovered, round.adopted, round.failed
                            );
                        }
                    }
                    Err(e) => {
                        warn!(provider = %key, error = %e, "adoption sweep failed");
                        provider.status.adoption.message = e.to_string();
                    }
                }
                provider.status.adoption.last_discovery_time = Some(Utc::now());
            }
        }

        provider.status.observed_generation = provider.meta.generation;
        api.update_status(&provider).await?;
        Ok(Action::RequeueAfter(requeue::RUNNING_STABLE))
    }
}

/// Store-legal name from a discovered VM name.
fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    sanitized.trim_matches('-').to_string()
}
