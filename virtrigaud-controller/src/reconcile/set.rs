//! VMSet reconciler: replica management and rolling updates.
//!
//! Invariant held throughout an update: the number of Ready replicas never
//! drops below `replicas - maxUnavailable`. New-template replicas are
//! created up to `maxSurge` beyond the desired count, and old-template
//! replicas are deleted only while the invariant holds.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use virtrigaud_api::condition::{is_condition_true, set_condition, Condition, ConditionStatus, ConditionType};
use virtrigaud_api::set::VMSet;
use virtrigaud_api::vm::VirtualMachine;
use virtrigaud_api::{Object, ObjectKey, OwnerReference};
use virtrigaud_store::{Api, EventType};

use crate::context::Ctx;
use crate::finalizer::{self, SET_FINALIZER};
use crate::reconcile::{Action, ReconcileResult, Reconciler};
use crate::requeue;

/// Label carrying the template revision a replica was stamped from.
pub const REVISION_LABEL: &str = "virtrigaud.io/revision";

pub struct SetReconciler {
    ctx: Arc<Ctx>,
}

impl SetReconciler {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }

    /// Hash of the template; replicas stamped from it carry the value in
    /// their revision label.
    fn template_hash(set: &VMSet) -> String {
        let serialized = serde_json::to_vec(&set.spec.template).unwrap_or_default();
        hex::encode(Sha256::digest(&serialized))[..12].to_string()
    }

    /// Replicas owned by this set via controller reference.
    async fn owned_replicas(&self, set: &VMSet) -> anyhow::Result<Vec<VirtualMachine>> {
        let vms: Api<VirtualMachine> = self.ctx.api();
        let all = vms.list(Some(&set.meta.namespace)).await?;
        Ok(all
            .into_iter()
            .filter(|vm| {
                vm.meta
                    .controller_owner()
                    .map(|owner| owner.uid == set.meta.uid)
                    .unwrap_or(false)
            })
            .collect())
    }

    fn build_replica(set: &VMSet, revision: &str) -> VirtualMachine {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", set.meta.name, &suffix[..5]);

        let mut vm = VirtualMachine::new(&set.meta.namespace, name, set.spec.template.spec.clone());
        for (k, v) in set.spec.selector.iter().chain(set.spec.template.labels.iter()) {
            vm.meta.labels.insert(k.clone(), v.clone());
        }
        vm.meta.labels.insert(REVISION_LABEL.to_string(), revision.to_string());
        vm.meta.owner_references.push(OwnerReference {
            kind: VMSet::KIND.to_string(),
            name: set.meta.name.clone(),
            uid: set.meta.uid.clone(),
            controller: true,
        });
        vm
    }

    fn is_ready(vm: &VirtualMachine) -> bool {
        is_condition_true(&vm.status.conditions, ConditionType::Ready)
    }

    async fn finalize(&self, api: &Api<VMSet>, set: VMSet) -> ReconcileResult {
        if !set.meta.has_finalizer(SET_FINALIZER) {
            return Ok(Action::Done);
        }
        let replicas = self.owned_replicas(&set).await?;
        let vms: Api<VirtualMachine> = self.ctx.api();

        let mut remaining = 0usize;
        for replica in &replicas {
            if replica.meta.is_deleting() {
                remaining += 1;
                continue;
            }
            vms.delete(&replica.key()).await?;
            remaining += 1;
        }
        if remaining > 0 {
            debug!(set = %set.key(), remaining, "waiting for replicas to drain");
            return Ok(Action::RequeueAfter(requeue::TRANSIENT));
        }

        finalizer::remove(api, &set, SET_FINALIZER).await?;
        Ok(Action::Done)
    }
}

#[async_trait]
impl Reconciler for SetReconciler {
    fn kind(&self) -> &'static str {
        VMSet::KIND
    }

    #[instrument(skip(self), fields(set = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult {
        let api: Api<VMSet> = self.ctx.api();
        let Some(mut set) = api.get(key).await? else {
            return Ok(Action::Done);
        };

        if set.meta.is_deleting() {
            return self.finalize(&api, set).await;
        }

        if finalizer::ensure(&api, &set, SET_FINALIZER).await?.is_some() {
            return Ok(Action::requeue_now());
        }

        let revision = Self::template_hash(&set);
        let vms: Api<VirtualMachine> = self.ctx.api();
        let replicas = self.owned_replicas(&set).await?;

        let desired = set.spec.replicas as usize;
        let max_surge = set.spec.update_strategy.max_surge as usize;
        let max_unavailable = set.spec.update_strategy.max_unavailable as usize;
        let min_ready = desired.saturating_sub(max_unavailable);

        let live: Vec<&VirtualMachine> =
            replicas.iter().filter(|vm| !vm.meta.is_deleting()).collect();
        let total = live.len();
        let ready = live.iter().filter(|vm| Self::is_ready(vm)).count();
        let updated: Vec<&&VirtualMachine> = live
            .iter()
            .filter(|vm| vm.meta.labels.get(REVISION_LABEL) == Some(&revision))
            .collect();
        let outdated: Vec<&&VirtualMachine> = live
            .iter()
            .filter(|vm| vm.meta.labels.get(REVISION_LABEL) != Some(&revision))
            .collect();

        let mut changed = false;

        if total < desired {
            // Scale up with current-revision replicas.
            let missing = desired - total;
            info!(set = %key, missing, "scaling up");
            for _ in 0..missing {
                let replica = Self::build_replica(&set, &revision);
                vms.create(&replica).await?;
                self.ctx
                    .recorder
                    .record(VMSet::KIND, key, EventType::Normal, "ReplicaCreated", replica.meta.name.clone())
                    .await;
            }
            changed = true;
        } else if total > desired + if outdated.is_empty() { 0 } else { max_surge } {
            // Scale down, preferring outdated then not-ready replicas.
            let excess = total - desired;
            let mut candidates: Vec<&VirtualMachine> = Vec::new();
            candidates.extend(outdated.iter().filter(|vm| !Self::is_ready(vm)).map(|vm| **vm));
            candidates.extend(outdated.iter().filter(|vm| Self::is_ready(vm)).map(|vm| **vm));
            candidates.extend(updated.iter().filter(|vm| !Self::is_ready(vm)).map(|vm| **vm));
            candidates.extend(updated.iter().filter(|vm| Self::is_ready(vm)).map(|vm| **vm));
            for replica in candidates.into_iter().take(excess) {
                info!(set = %key, replica = %replica.meta.name, "scaling down");
                vms.delete(&replica.key()).await?;
                self.ctx
                    .recorder
                    .record(VMSet::KIND, key, EventType::Normal, "ReplicaDeleted", replica.meta.name.clone())
                    .await;
            }
            changed = true;
        } else if !outdated.is_empty() {
            // Rolling update: surge first, then retire old replicas while
            // the availability invariant holds.
            if total < desired + max_surge {
                let surge = (desired + max_surge) - total;
                info!(set = %key, surge, "surging new-revision replicas");
                for _ in 0..surge {
                    let replica = Self::build_replica(&set, &revision);
                    vms.create(&replica).await?;
                    self.ctx
                        .recorder
                        .record(VMSet::KIND, key, EventType::Normal, "ReplicaCreated", replica.meta.name.clone())
                        .await;
                }
                changed = true;
            }

            let mut deletable_ready = ready.saturating_sub(min_ready);
            let mut retire: Vec<&VirtualMachine> = Vec::new();
            for replica in &outdated {
                if !Self::is_ready(replica) {
                    retire.push(**replica);
                } else if deletable_ready > 0 {
                    deletable_ready -= 1;
                    retire.push(**replica);
                }
            }
            for replica in retire {
                info!(set = %key, replica = %replica.meta.name, "retiring old-revision replica");
                vms.delete(&replica.key()).await?;
                self.ctx
                    .recorder
                    .record(VMSet::KIND, key, EventType::Normal, "ReplicaRetired", replica.meta.name.clone())
                    .await;
                changed = true;
            }
        }

        set.status.replicas = total as u32;
        set.status.ready_replicas = ready as u32;
        set.status.updated_replicas = updated.len() as u32;
        set.status.current_revision = revision;
        let settled = !changed && total == desired && ready == desired && outdated.is_empty();
        set_condition(
            &mut set.status.conditions,
            Condition::new(
                ConditionType::Ready,
                if settled { ConditionStatus::True } else { ConditionStatus::False },
                if settled { "AllReplicasReady" } else { "Converging" },
                format!("{ready}/{desired} ready"),
            ),
        );
        set.status.observed_generation = set.meta.generation;
        api.update_status(&set).await?;

        Ok(if settled {
            Action::RequeueAfter(requeue::RUNNING_STABLE)
        } else {
            Action::RequeueAfter(requeue::TRANSIENT)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtrigaud_api::set::VMSetSpec;

    #[test]
    fn test_template_hash_changes_with_template() {
        let mut set = VMSet::new("default", "web", VMSetSpec::default());
        let first = SetReconciler::template_hash(&set);
        assert_eq!(first, SetReconciler::template_hash(&set));

        set.spec.template.spec.tags.push("v2".into());
        assert_ne!(first, SetReconciler::template_hash(&set));
    }

    #[test]
    fn test_build_replica_carries_selector_and_owner() {
        let mut spec = VMSetSpec::default();
        spec.selector.insert("app".into(), "web".into());
        let mut set = VMSet::new("default", "web", spec);
        set.meta.uid = "uid-1".into();

        let replica = SetReconciler::build_replica(&set, "rev1");
        assert!(replica.meta.name.starts_with("web-"));
        assert_eq!(replica.meta.labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(replica.meta.labels.get(REVISION_LABEL).map(String::as_str), Some("rev1"));
        let owner = replica.meta.controller_owner().unwrap();
        assert_eq!(owner.uid, "uid-1");
        assert_eq!(owner.kind, VMSet::KIND);
    }
}
