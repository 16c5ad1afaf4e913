//! The VMSet resource: a replicated group of VMs with rolling updates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::meta::{Object, ObjectMeta};
use crate::vm::VirtualMachineSpec;

/// Rolling update parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateStrategy {
    /// How many replicas may be unavailable during an update.
    pub max_unavailable: u32,
    /// How many extra replicas may exist during an update.
    pub max_surge: u32,
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        Self {
            max_unavailable: 1,
            max_surge: 1,
        }
    }
}

/// Template stamped onto every replica.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMSetTemplate {
    pub labels: BTreeMap<String, String>,
    pub spec: VirtualMachineSpec,
}

/// Desired state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMSetSpec {
    pub replicas: u32,
    /// Label selector matching owned replicas.
    pub selector: BTreeMap<String, String>,
    pub template: VMSetTemplate,
    pub update_strategy: UpdateStrategy,
}

/// Observed state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMSetStatus {
    pub replicas: u32,
    pub ready_replicas: u32,
    /// Replicas stamped from the current template revision.
    pub updated_replicas: u32,
    /// Hash of the current template, stamped onto replicas.
    pub current_revision: String,
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
}

/// The VMSet resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VMSet {
    pub meta: ObjectMeta,
    pub spec: VMSetSpec,
    #[serde(default)]
    pub status: VMSetStatus,
}

impl VMSet {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: VMSetSpec) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec,
            status: VMSetStatus::default(),
        }
    }
}

impl Object for VMSet {
    const KIND: &'static str = "VMSet";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}
