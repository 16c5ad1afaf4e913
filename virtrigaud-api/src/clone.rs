//! The VMClone resource.

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::meta::{LocalObjectRef, Object, ObjectMeta};
use crate::vm::UserData;

/// What the clone is taken from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CloneSource {
    Vm(LocalObjectRef),
    Snapshot(LocalObjectRef),
    Template(String),
    Image(LocalObjectRef),
}

impl Default for CloneSource {
    fn default() -> Self {
        Self::Vm(LocalObjectRef::default())
    }
}

/// Clone strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloneType {
    Full,
    Linked,
    Instant,
}

impl Default for CloneType {
    fn default() -> Self {
        Self::Full
    }
}

/// Guest customisation applied after cloning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneCustomization {
    pub hostname: Option<String>,
    pub user_data: Option<UserData>,
}

/// Desired state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMCloneSpec {
    pub source: CloneSource,
    pub target_name: String,
    pub class_ref: Option<LocalObjectRef>,
    pub clone_type: CloneType,
    pub power_on: bool,
    pub customization: Option<CloneCustomization>,
}

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClonePhase {
    Pending,
    Cloning,
    Customizing,
    Ready,
    Failed,
}

impl Default for ClonePhase {
    fn default() -> Self {
        Self::Pending
    }
}

/// Observed state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMCloneStatus {
    pub phase: ClonePhase,
    /// Provider identity of the cloned VM.
    pub vm_id: Option<String>,
    pub task_ref: Option<String>,
    pub message: String,
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
}

/// The VMClone resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VMClone {
    pub meta: ObjectMeta,
    pub spec: VMCloneSpec,
    #[serde(default)]
    pub status: VMCloneStatus,
}

impl VMClone {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: VMCloneSpec) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec,
            status: VMCloneStatus::default(),
        }
    }
}

impl Object for VMClone {
    const KIND: &'static str = "VMClone";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}
