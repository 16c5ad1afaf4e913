//! The VMSnapshot resource.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::meta::{LocalObjectRef, Object, ObjectMeta};

/// Retention policy for a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Self-delete once this age is exceeded.
    pub max_age_seconds: Option<u64>,
    /// Self-delete when the parent VM is gone.
    pub delete_on_vm_delete: bool,
}

/// Desired state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMSnapshotSpec {
    pub vm_ref: LocalObjectRef,
    /// Name hint passed to the provider; a deterministic name is derived
    /// from the object identity when unset.
    pub name_hint: Option<String>,
    pub include_memory: bool,
    pub description: String,
    pub retention: Option<RetentionPolicy>,
}

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPhase {
    Pending,
    Creating,
    Ready,
    Deleting,
    Failed,
}

impl Default for SnapshotPhase {
    fn default() -> Self {
        Self::Pending
    }
}

/// Observed state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMSnapshotStatus {
    pub phase: SnapshotPhase,
    /// Assigned on first successful create; never changes afterwards.
    pub snapshot_id: Option<String>,
    pub task_ref: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub message: String,
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
}

/// The VMSnapshot resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VMSnapshot {
    pub meta: ObjectMeta,
    pub spec: VMSnapshotSpec,
    #[serde(default)]
    pub status: VMSnapshotStatus,
}

impl VMSnapshot {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: VMSnapshotSpec) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec,
            status: VMSnapshotStatus::default(),
        }
    }
}

impl Object for VMSnapshot {
    const KIND: &'static str = "VMSnapshot";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}
