//! # virtrigaud API
//!
//! The typed resource surface of the virtrigaud control plane: object
//! metadata, conditions, resource quantities and the nine resource kinds
//! served under the `infra.virtrigaud.io` group.
//!
//! The storage version is `v1beta1` (the types in the crate root); a second
//! served version `v1alpha1` converts losslessly in both directions via the
//! [`v1alpha1`] module.

pub mod clone;
pub mod condition;
pub mod image;
pub mod meta;
pub mod migration;
pub mod network;
pub mod placement;
pub mod provider;
pub mod quantity;
pub mod set;
pub mod snapshot;
pub mod v1alpha1;
pub mod vm;
pub mod vmclass;

pub use condition::{Condition, ConditionStatus, ConditionType};
pub use meta::{LocalObjectRef, Object, ObjectKey, ObjectMeta, OwnerReference, GROUP, STORAGE_VERSION};
pub use quantity::{Quantity, QuantityError};

pub use clone::{ClonePhase, CloneSource, CloneType, VMClone, VMCloneSpec, VMCloneStatus};
pub use image::{ImagePhase, VMImage, VMImageSpec, VMImageStatus};
pub use migration::{
    DiskInfo, MigrationPhase, RetryPolicy, StagingStorageSpec, VMMigration, VMMigrationSpec,
    VMMigrationStatus,
};
pub use network::{IpAllocation, VMNetworkAttachment, VMNetworkAttachmentSpec};
pub use placement::{VMPlacementPolicy, VMPlacementPolicySpec};
pub use provider::{Provider, ProviderRuntimePhase, ProviderSpec, ProviderStatus, ProviderType};
pub use set::{VMSet, VMSetSpec, VMSetStatus};
pub use snapshot::{SnapshotPhase, VMSnapshot, VMSnapshotSpec, VMSnapshotStatus};
pub use vm::{PowerState, VirtualMachine, VirtualMachineSpec, VirtualMachineStatus, VmPhase};
pub use vmclass::{Firmware, VMClass, VMClassSpec};

/// Annotation placed on a Provider resource to enable adoption of
/// pre-existing hypervisor VMs.
pub const ADOPT_ANNOTATION: &str = "virtrigaud.io/adopt";

/// Annotation back-pointer placed on a VM created by a migration,
/// value `<namespace>/<name>` of the owning VMMigration.
pub const MIGRATION_ANNOTATION: &str = "virtrigaud.io/migration";

/// Label placed on VM resources synthesised by provider adoption.
pub const ADOPTED_LABEL: &str = "virtrigaud.io/adopted";
