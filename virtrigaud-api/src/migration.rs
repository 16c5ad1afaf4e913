//! The VMMigration resource: a one-shot cold migration between providers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::meta::{LocalObjectRef, Object, ObjectMeta};
use crate::quantity::Quantity;

/// Migration source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSource {
    pub vm_ref: LocalObjectRef,
    /// Adopt this snapshot instead of creating one.
    pub snapshot_ref: Option<LocalObjectRef>,
    /// Take a snapshot before exporting.
    pub create_snapshot: bool,
    /// Delete the source VM once the migration is Ready.
    pub delete_after_migration: bool,
    /// Override; the source VM's own provider ref when unset.
    pub provider_ref: Option<LocalObjectRef>,
}

/// Migration target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationTarget {
    pub name: String,
    /// The migration's own namespace when unset.
    pub namespace: Option<String>,
    pub provider_ref: LocalObjectRef,
    pub class_ref: Option<LocalObjectRef>,
    pub networks: Vec<LocalObjectRef>,
    pub placement: Option<crate::vm::PlacementHints>,
    pub annotations: BTreeMap<String, String>,
}

/// Inline S3 credentials. Secret references are resolved by the
/// credential store, which is external to this control plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Credentials {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub secret_ref: Option<LocalObjectRef>,
}

/// Staging storage configuration; one variant per supported channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StagingStorageSpec {
    S3 {
        endpoint: String,
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        credentials: S3Credentials,
    },
    Http {
        base_url: String,
        #[serde(default)]
        bearer_token: Option<String>,
        #[serde(default)]
        secret_ref: Option<LocalObjectRef>,
    },
    Nfs {
        export_path: String,
    },
    Pvc {
        /// Existing claim; auto-provisioned when unset.
        #[serde(default)]
        claim_name: Option<String>,
        #[serde(default)]
        size: Option<Quantity>,
    },
}

impl Default for StagingStorageSpec {
    fn default() -> Self {
        Self::Pvc {
            claim_name: None,
            size: None,
        }
    }
}

/// Retry policy applied in the Failed phase. Absent means Failed is
/// absorbing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_seconds: 300,
            backoff_multiplier: 2.0,
        }
    }
}

/// Migration options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationOptions {
    /// Disk format on the staging channel; the source disk's format when
    /// unset.
    pub disk_format: Option<String>,
    pub compress: bool,
    pub verify_checksums: bool,
    /// Per-phase timeout; 4 hours when unset.
    pub phase_timeout_seconds: Option<u64>,
    pub retry_policy: Option<RetryPolicy>,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            disk_format: None,
            compress: false,
            verify_checksums: true,
            phase_timeout_seconds: None,
            retry_policy: None,
        }
    }
}

/// Desired state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMMigrationSpec {
    pub source: MigrationSource,
    pub target: MigrationTarget,
    pub storage: StagingStorageSpec,
    pub options: MigrationOptions,
}

/// Migration phase. Transitions form a monotone path; Failed is reachable
/// from any non-terminal phase, and a retry resets to Pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationPhase {
    Pending,
    Validating,
    Snapshotting,
    Exporting,
    Transferring,
    Converting,
    Importing,
    Creating,
    ValidatingTarget,
    Ready,
    Failed,
}

impl Default for MigrationPhase {
    fn default() -> Self {
        Self::Pending
    }
}

impl MigrationPhase {
    /// Position along the monotone path. Failed has no position.
    pub fn order(&self) -> Option<u8> {
        match self {
            MigrationPhase::Pending => Some(0),
            MigrationPhase::Validating => Some(1),
            MigrationPhase::Snapshotting => Some(2),
            MigrationPhase::Exporting => Some(3),
            MigrationPhase::Transferring => Some(4),
            MigrationPhase::Converting => Some(5),
            MigrationPhase::Importing => Some(6),
            MigrationPhase::Creating => Some(7),
            MigrationPhase::ValidatingTarget => Some(8),
            MigrationPhase::Ready => Some(9),
            MigrationPhase::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationPhase::Ready | MigrationPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::Pending => "Pending",
            MigrationPhase::Validating => "Validating",
            MigrationPhase::Snapshotting => "Snapshotting",
            MigrationPhase::Exporting => "Exporting",
            MigrationPhase::Transferring => "Transferring",
            MigrationPhase::Converting => "Converting",
            MigrationPhase::Importing => "Importing",
            MigrationPhase::Creating => "Creating",
            MigrationPhase::ValidatingTarget => "ValidatingTarget",
            MigrationPhase::Ready => "Ready",
            MigrationPhase::Failed => "Failed",
        }
    }
}

/// Disk transfer bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskInfo {
    pub format: String,
    pub size_bytes: Option<u64>,
    /// SHA-256, lowercase hex, recorded after export.
    pub source_checksum: Option<String>,
    /// SHA-256, lowercase hex, recorded after import.
    pub target_checksum: Option<String>,
}

/// Observed state. Every phase transition is written here before the next
/// irreversible side effect, so a controller restart replays safely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMMigrationStatus {
    pub phase: MigrationPhase,
    pub message: String,
    pub snapshot_id: Option<String>,
    /// True when the snapshot was created by this migration (as opposed to
    /// adopted from spec.source.snapshot_ref) and must be cleaned up.
    pub snapshot_created: bool,
    pub export_id: Option<String>,
    pub import_id: Option<String>,
    pub target_vm_id: Option<String>,
    pub retry_count: u32,
    pub last_retry_time: Option<DateTime<Utc>>,
    /// Name of the auto-provisioned staging claim, when PVC staging is used.
    pub staging_pvc_name: Option<String>,
    /// Staging object URL, deterministic across retries.
    pub staging_url: Option<String>,
    pub disk_info: Option<DiskInfo>,
    /// Storage cleanup has run (attempted exactly once, idempotent deletes).
    pub storage_cleaned: bool,
    /// Full Ready-phase cleanup has run.
    pub cleanup_done: bool,
    /// True when the failure is non-recoverable; the retry policy is not
    /// applied.
    pub fatal: bool,
    /// Reference to the in-flight provider task, if any.
    pub task_ref: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub phase_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
}

/// The VMMigration resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VMMigration {
    pub meta: ObjectMeta,
    pub spec: VMMigrationSpec,
    #[serde(default)]
    pub status: VMMigrationStatus,
}

impl VMMigration {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: VMMigrationSpec) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec,
            status: VMMigrationStatus::default(),
        }
    }

    /// The `<namespace>/<name>` value stamped onto the target VM's
    /// migration annotation.
    pub fn annotation_value(&self) -> String {
        format!("{}/{}", self.meta.namespace, self.meta.name)
    }

    /// Namespace the target VM lives in.
    pub fn target_namespace(&self) -> &str {
        self.spec
            .target
            .namespace
            .as_deref()
            .unwrap_or(&self.meta.namespace)
    }
}

impl Object for VMMigration {
    const KIND: &'static str = "VMMigration";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_is_monotone() {
        let path = [
            MigrationPhase::Pending,
            MigrationPhase::Validating,
            MigrationPhase::Snapshotting,
            MigrationPhase::Exporting,
            MigrationPhase::Transferring,
            MigrationPhase::Converting,
            MigrationPhase::Importing,
            MigrationPhase::Creating,
            MigrationPhase::ValidatingTarget,
            MigrationPhase::Ready,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].order().unwrap() < pair[1].order().unwrap());
        }
        assert_eq!(MigrationPhase::Failed.order(), None);
    }

    #[test]
    fn test_terminal_phases() {
        assert!(MigrationPhase::Ready.is_terminal());
        assert!(MigrationPhase::Failed.is_terminal());
        assert!(!MigrationPhase::Exporting.is_terminal());
    }

    #[test]
    fn test_storage_spec_tagged_roundtrip() {
        let spec = StagingStorageSpec::S3 {
            endpoint: "https://minio.example.com".into(),
            bucket: "staging".into(),
            prefix: Some("migrations".into()),
            region: None,
            credentials: S3Credentials::default(),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "s3");
        let back: StagingStorageSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec, back);
    }

    #[test]
    fn test_annotation_value() {
        let mig = VMMigration::new("default", "m1", VMMigrationSpec::default());
        assert_eq!(mig.annotation_value(), "default/m1");
        assert_eq!(mig.target_namespace(), "default");
    }
}
