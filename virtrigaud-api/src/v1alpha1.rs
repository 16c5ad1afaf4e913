//! The legacy `v1alpha1` served version.
//!
//! Conversion to and from the storage version is a stateless field mapping:
//! no defaulting, nothing dropped. Kinds whose schema never changed between
//! versions are re-exported as-is and convert by identity; VirtualMachine
//! and VMMigration carried the old flat layout and convert field-by-field.

use serde::{Deserialize, Serialize};

use crate::meta::{LocalObjectRef, ObjectMeta};
use crate::migration as v1beta1_migration;
use crate::vm as v1beta1_vm;

// Unchanged kinds are served under both versions with the same schema.
pub use crate::clone::VMClone;
pub use crate::image::VMImage;
pub use crate::network::VMNetworkAttachment;
pub use crate::placement::VMPlacementPolicy;
pub use crate::provider::Provider;
pub use crate::set::VMSet;
pub use crate::snapshot::VMSnapshot;
pub use crate::vmclass::VMClass;

/// v1alpha1 VirtualMachine spec: references were plain name strings and
/// placement hints were top-level fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualMachineSpec {
    pub provider: String,
    pub class: String,
    pub image: Option<String>,
    pub networks: Vec<String>,
    pub disks: Vec<v1beta1_vm::DiskSpec>,
    pub power_state: v1beta1_vm::PowerState,
    pub user_data: Option<v1beta1_vm::UserData>,
    pub placement_policy: Option<String>,
    pub cluster: Option<String>,
    pub datastore: Option<String>,
    pub folder: Option<String>,
    pub host: Option<String>,
    pub tags: Vec<String>,
    pub imported_disk: Option<v1beta1_vm::ImportedDiskRef>,
    pub extra_config: std::collections::BTreeMap<String, String>,
}

/// v1alpha1 VirtualMachine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub meta: ObjectMeta,
    pub spec: VirtualMachineSpec,
    #[serde(default)]
    pub status: v1beta1_vm::VirtualMachineStatus,
}

impl From<v1beta1_vm::VirtualMachine> for VirtualMachine {
    fn from(vm: v1beta1_vm::VirtualMachine) -> Self {
        let placement = vm.spec.placement;
        Self {
            meta: vm.meta,
            spec: VirtualMachineSpec {
                provider: vm.spec.provider_ref.name,
                class: vm.spec.class_ref.name,
                image: vm.spec.image_ref.map(|r| r.name),
                networks: vm.spec.networks.into_iter().map(|r| r.name).collect(),
                disks: vm.spec.disks,
                power_state: vm.spec.power_state,
                user_data: vm.spec.user_data,
                placement_policy: placement
                    .as_ref()
                    .and_then(|p| p.policy_ref.as_ref().map(|r| r.name.clone())),
                cluster: placement.as_ref().and_then(|p| p.cluster.clone()),
                datastore: placement.as_ref().and_then(|p| p.datastore.clone()),
                folder: placement.as_ref().and_then(|p| p.folder.clone()),
                host: placement.as_ref().and_then(|p| p.host.clone()),
                tags: vm.spec.tags,
                imported_disk: vm.spec.imported_disk,
                extra_config: vm.spec.extra_config,
            },
            status: vm.status,
        }
    }
}

impl From<VirtualMachine> for v1beta1_vm::VirtualMachine {
    fn from(vm: VirtualMachine) -> Self {
        let has_placement = vm.spec.placement_policy.is_some()
            || vm.spec.cluster.is_some()
            || vm.spec.datastore.is_some()
            || vm.spec.folder.is_some()
            || vm.spec.host.is_some();
        Self {
            meta: vm.meta,
            spec: v1beta1_vm::VirtualMachineSpec {
                provider_ref: LocalObjectRef::new(vm.spec.provider),
                class_ref: LocalObjectRef::new(vm.spec.class),
                image_ref: vm.spec.image.map(LocalObjectRef::new),
                networks: vm.spec.networks.into_iter().map(LocalObjectRef::new).collect(),
                disks: vm.spec.disks,
                power_state: vm.spec.power_state,
                user_data: vm.spec.user_data,
                placement: has_placement.then(|| v1beta1_vm::PlacementHints {
                    policy_ref: vm.spec.placement_policy.map(LocalObjectRef::new),
                    cluster: vm.spec.cluster,
                    datastore: vm.spec.datastore,
                    folder: vm.spec.folder,
                    host: vm.spec.host,
                }),
                tags: vm.spec.tags,
                imported_disk: vm.spec.imported_disk,
                extra_config: vm.spec.extra_config,
            },
            status: vm.status,
        }
    }
}

/// v1alpha1 VMMigration options: the retry policy fields were flat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationOptions {
    pub disk_format: Option<String>,
    pub compress: bool,
    pub verify_checksums: bool,
    pub phase_timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_seconds: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

/// v1alpha1 VMMigration spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMMigrationSpec {
    pub source: v1beta1_migration::MigrationSource,
    pub target: v1beta1_migration::MigrationTarget,
    pub storage: v1beta1_migration::StagingStorageSpec,
    pub options: MigrationOptions,
}

/// v1alpha1 VMMigration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VMMigration {
    pub meta: ObjectMeta,
    pub spec: VMMigrationSpec,
    #[serde(default)]
    pub status: v1beta1_migration::VMMigrationStatus,
}

impl From<v1beta1_migration::VMMigration> for VMMigration {
    fn from(mig: v1beta1_migration::VMMigration) -> Self {
        let retry = mig.spec.options.retry_policy;
        Self {
            meta: mig.meta,
            spec: VMMigrationSpec {
                source: mig.spec.source,
                target: mig.spec.target,
                storage: mig.spec.storage,
                options: MigrationOptions {
                    disk_format: mig.spec.options.disk_format,
                    compress: mig.spec.options.compress,
                    verify_checksums: mig.spec.options.verify_checksums,
                    phase_timeout_seconds: mig.spec.options.phase_timeout_seconds,
                    max_retries: retry.as_ref().map(|r| r.max_retries),
                    retry_delay_seconds: retry.as_ref().map(|r| r.retry_delay_seconds),
                    backoff_multiplier: retry.as_ref().map(|r| r.backoff_multiplier),
                },
            },
            status: mig.status,
        }
    }
}

impl From<VMMigration> for v1beta1_migration::VMMigration {
    fn from(mig: VMMigration) -> Self {
        let retry_policy = match (
            mig.spec.options.max_retries,
            mig.spec.options.retry_delay_seconds,
            mig.spec.options.backoff_multiplier,
        ) {
            (None, None, None) => None,
            (max_retries, retry_delay_seconds, backoff_multiplier) => {
                let defaults = v1beta1_migration::RetryPolicy::default();
                Some(v1beta1_migration::RetryPolicy {
                    max_retries: max_retries.unwrap_or(defaults.max_retries),
                    retry_delay_seconds: retry_delay_seconds
                        .unwrap_or(defaults.retry_delay_seconds),
                    backoff_multiplier: backoff_multiplier.unwrap_or(defaults.backoff_multiplier),
                })
            }
        };
        Self {
            meta: mig.meta,
            spec: v1beta1_migration::VMMigrationSpec {
                source: mig.spec.source,
                target: mig.spec.target,
                storage: mig.spec.storage,
                options: v1beta1_migration::MigrationOptions {
                    disk_format: mig.spec.options.disk_format,
                    compress: mig.spec.options.compress,
                    verify_checksums: mig.spec.options.verify_checksums,
                    phase_timeout_seconds: mig.spec.options.phase_timeout_seconds,
                    retry_policy,
                },
            },
            status: mig.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::Quantity;
    use crate::vm::{DiskSpec, PlacementHints};

    #[test]
    fn test_vm_conversion_roundtrip() {
        let mut spec = v1beta1_vm::VirtualMachineSpec::default();
        spec.provider_ref = LocalObjectRef::new("vsphere-prod");
        spec.class_ref = LocalObjectRef::new("small");
        spec.image_ref = Some(LocalObjectRef::new("ubuntu-22"));
        spec.networks = vec![LocalObjectRef::new("app-net")];
        spec.disks = vec![DiskSpec {
            name: "data".into(),
            size: Some(Quantity::from_gib(50)),
            disk_type: None,
        }];
        spec.placement = Some(PlacementHints {
            policy_ref: Some(LocalObjectRef::new("spread")),
            cluster: Some("c1".into()),
            datastore: None,
            folder: Some("prod".into()),
            host: None,
        });
        spec.extra_config.insert("k".into(), "v".into());

        let vm = v1beta1_vm::VirtualMachine::new("default", "web-01", spec);
        let legacy: VirtualMachine = vm.clone().into();
        let back: v1beta1_vm::VirtualMachine = legacy.into();
        assert_eq!(vm, back);
    }

    #[test]
    fn test_migration_conversion_roundtrip() {
        let mut spec = v1beta1_migration::VMMigrationSpec::default();
        spec.options.retry_policy = Some(v1beta1_migration::RetryPolicy {
            max_retries: 2,
            retry_delay_seconds: 60,
            backoff_multiplier: 2.0,
        });
        let mig = v1beta1_migration::VMMigration::new("default", "m1", spec);
        let legacy: VMMigration = mig.clone().into();
        assert_eq!(legacy.spec.options.max_retries, Some(2));
        let back: v1beta1_migration::VMMigration = legacy.into();
        assert_eq!(mig, back);
    }

    #[test]
    fn test_migration_no_retry_policy_stays_absent() {
        let mig = v1beta1_migration::VMMigration::new(
            "default",
            "m1",
            v1beta1_migration::VMMigrationSpec::default(),
        );
        let legacy: VMMigration = mig.clone().into();
        let back: v1beta1_migration::VMMigration = legacy.into();
        assert!(back.spec.options.retry_policy.is_none());
    }
}
