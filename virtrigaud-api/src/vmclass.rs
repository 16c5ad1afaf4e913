//! The VMClass resource: a reusable hardware template.

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::meta::{Object, ObjectMeta};
use crate::quantity::Quantity;

/// Firmware type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Firmware {
    #[serde(rename = "BIOS")]
    Bios,
    #[serde(rename = "UEFI")]
    Uefi,
}

impl Default for Firmware {
    fn default() -> Self {
        Self::Bios
    }
}

impl Firmware {
    /// Wire tag passed to provider workers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Firmware::Bios => "bios",
            Firmware::Uefi => "uefi",
        }
    }
}

/// Guest-tools installation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestToolsPolicy {
    Auto,
    Manual,
    Disabled,
}

impl Default for GuestToolsPolicy {
    fn default() -> Self {
        Self::Auto
    }
}

/// Defaults applied to disks that leave fields unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskDefaults {
    #[serde(rename = "type")]
    pub disk_type: Option<String>,
    pub size: Option<Quantity>,
}

/// Hyperthread placement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HyperthreadPolicy {
    Auto,
    Prefer,
    Avoid,
}

impl Default for HyperthreadPolicy {
    fn default() -> Self {
        Self::Auto
    }
}

/// Performance tuning knobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceProfile {
    pub latency_sensitive: bool,
    pub cpu_hot_add: bool,
    pub memory_hot_add: bool,
    pub nested_virtualization: bool,
    pub hyperthreading: HyperthreadPolicy,
}

/// Security profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityProfile {
    pub secure_boot: bool,
    pub vtpm: bool,
    pub encryption: bool,
}

/// Resource limits, reservations and shares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePolicy {
    pub cpu_limit_mhz: Option<u32>,
    pub cpu_reservation_mhz: Option<u32>,
    pub cpu_shares: Option<u32>,
    pub memory_limit: Option<Quantity>,
    pub memory_reservation: Option<Quantity>,
    pub memory_shares: Option<u32>,
}

/// Desired state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMClassSpec {
    pub cpus: u32,
    pub memory: Quantity,
    pub firmware: Firmware,
    pub disk_defaults: Option<DiskDefaults>,
    pub guest_tools: GuestToolsPolicy,
    pub performance: Option<PerformanceProfile>,
    pub security: Option<SecurityProfile>,
    pub resources: Option<ResourcePolicy>,
}

/// Observed state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMClassStatus {
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
}

/// The VMClass resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VMClass {
    pub meta: ObjectMeta,
    pub spec: VMClassSpec,
    #[serde(default)]
    pub status: VMClassStatus,
}

impl VMClass {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: VMClassSpec) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec,
            status: VMClassStatus::default(),
        }
    }

    /// Convenience constructor for a plain cpu/memory class.
    pub fn with_shape(
        namespace: impl Into<String>,
        name: impl Into<String>,
        cpus: u32,
        memory: Quantity,
    ) -> Self {
        Self::new(
            namespace,
            name,
            VMClassSpec {
                cpus,
                memory,
                ..Default::default()
            },
        )
    }
}

impl Object for VMClass {
    const KIND: &'static str = "VMClass";

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
    fn test_class_shape() {
        let class = VMClass::with_shape("default", "small", 2, Quantity::from_gib(4));
        assert_eq!(class.spec.cpus, 2);
        assert_eq!(class.spec.memory.as_bytes().unwrap(), 4 << 30);
        assert_eq!(class.spec.firmware, Firmware::Bios);
    }

    #[test]
    fn test_firmware_wire_tag() {
        assert_eq!(Firmware::Bios.as_str(), "bios");
        assert_eq!(Firmware::Uefi.as_str(), "uefi");
    }
}
