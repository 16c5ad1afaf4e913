//! The VMPlacementPolicy resource.

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::meta::{Object, ObjectMeta};

/// Hard constraints; every listed value must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardConstraints {
    pub clusters: Vec<String>,
    pub datastores: Vec<String>,
    pub hosts: Vec<String>,
}

/// Soft constraints; best-effort.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftConstraints {
    pub folders: Vec<String>,
    pub zones: Vec<String>,
}

/// Anti-affinity flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiAffinity {
    pub host: bool,
    pub cluster: bool,
    pub datastore: bool,
}

/// Desired state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMPlacementPolicySpec {
    pub hard: HardConstraints,
    pub soft: SoftConstraints,
    pub anti_affinity: AntiAffinity,
}

/// Observed state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMPlacementPolicyStatus {
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
}

/// The VMPlacementPolicy resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VMPlacementPolicy {
    pub meta: ObjectMeta,
    pub spec: VMPlacementPolicySpec,
    #[serde(default)]
    pub status: VMPlacementPolicyStatus,
}

impl VMPlacementPolicy {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        spec: VMPlacementPolicySpec,
    ) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec,
            status: VMPlacementPolicyStatus::default(),
        }
    }
}

impl Object for VMPlacementPolicy {
    const KIND: &'static str = "VMPlacementPolicy";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}
