//! The VirtualMachine resource: desired machine state and observed status.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::meta::{LocalObjectRef, Object, ObjectMeta};
use crate::quantity::Quantity;

/// Desired power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    On,
    Off,
    OffGraceful,
}

impl Default for PowerState {
    fn default() -> Self {
        Self::On
    }
}

impl PowerState {
    /// Whether the desired state is any flavour of "off".
    pub fn wants_off(&self) -> bool {
        matches!(self, PowerState::Off | PowerState::OffGraceful)
    }
}

/// Power state as observed through the provider's Describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservedPowerState {
    On,
    Off,
    Suspended,
    Crashed,
    Unknown,
}

impl Default for ObservedPowerState {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Coarse lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmPhase {
    Pending,
    Provisioning,
    Running,
    PoweredOff,
    Reconfiguring,
    Deleting,
}

impl Default for VmPhase {
    fn default() -> Self {
        Self::Pending
    }
}

/// One disk on the VM. Unset fields inherit the class disk defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskSpec {
    pub name: String,
    pub size: Option<Quantity>,
    #[serde(rename = "type")]
    pub disk_type: Option<String>,
}

/// Guest customisation data, inline or from a secret.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserData {
    pub inline: Option<String>,
    pub secret_ref: Option<LocalObjectRef>,
}

/// Placement hints, optionally referencing a VMPlacementPolicy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementHints {
    pub policy_ref: Option<LocalObjectRef>,
    pub cluster: Option<String>,
    pub datastore: Option<String>,
    pub folder: Option<String>,
    pub host: Option<String>,
}

/// Reference to an already-imported disk, set when the VM was created by
/// adoption or by a migration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportedDiskRef {
    pub import_id: String,
    pub format: Option<String>,
}

/// Desired state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualMachineSpec {
    pub provider_ref: LocalObjectRef,
    pub class_ref: LocalObjectRef,
    pub image_ref: Option<LocalObjectRef>,
    /// Ordered references to VMNetworkAttachment objects.
    pub networks: Vec<LocalObjectRef>,
    pub disks: Vec<DiskSpec>,
    pub power_state: PowerState,
    pub user_data: Option<UserData>,
    pub placement: Option<PlacementHints>,
    pub tags: Vec<String>,
    /// Present when the VM was materialised from an existing disk
    /// (adoption, migration) instead of an image.
    pub imported_disk: Option<ImportedDiskRef>,
    /// Hypervisor extra-config key/value pairs, passed through unchanged.
    pub extra_config: BTreeMap<String, String>,
}

/// Hardware the provider last confirmed, used to detect reconfigure drift.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservedHardware {
    pub cpus: u32,
    pub memory_mib: u32,
}

/// Observed state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualMachineStatus {
    /// Provider-assigned identity. Never changes once assigned.
    pub id: Option<String>,
    pub power_state: ObservedPowerState,
    pub ips: Vec<String>,
    pub console_url: Option<String>,
    pub phase: VmPhase,
    /// Reference to the in-flight provider task, if any.
    pub task_ref: Option<String>,
    pub hardware: Option<ObservedHardware>,
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
    /// Provider-specific details merged from Describe.
    pub provider_details: BTreeMap<String, String>,
}

/// The VirtualMachine resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub meta: ObjectMeta,
    pub spec: VirtualMachineSpec,
    #[serde(default)]
    pub status: VirtualMachineStatus,
}

impl VirtualMachine {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        spec: VirtualMachineSpec,
    ) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec,
            status: VirtualMachineStatus::default(),
        }
    }
}

impl Object for VirtualMachine {
    const KIND: &'static str = "VirtualMachine";

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
    fn test_power_state_wants_off() {
        assert!(!PowerState::On.wants_off());
        assert!(PowerState::Off.wants_off());
        assert!(PowerState::OffGraceful.wants_off());
    }

    #[test]
    fn test_vm_roundtrip() {
        let mut spec = VirtualMachineSpec::default();
        spec.provider_ref = LocalObjectRef::new("vsphere-prod");
        spec.class_ref = LocalObjectRef::new("small");
        spec.extra_config.insert("guestinfo.role".into(), "web".into());

        let vm = VirtualMachine::new("default", "web-01", spec);
        let json = serde_json::to_string(&vm).unwrap();
        let back: VirtualMachine = serde_json::from_str(&json).unwrap();
        assert_eq!(vm, back);
        assert_eq!(back.spec.extra_config["guestinfo.role"], "web");
    }
}
