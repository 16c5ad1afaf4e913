//! The VMNetworkAttachment resource: per-hypervisor network bindings.

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::meta::{Object, ObjectMeta};

/// vSphere binding: portgroup plus optional VLAN.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VSphereNetwork {
    pub portgroup: String,
    pub vlan: Option<u16>,
}

/// Libvirt binding: bridge, NIC model and MTU.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibvirtNetwork {
    pub bridge: String,
    pub model: Option<String>,
    pub mtu: Option<u32>,
}

/// Proxmox binding: bridge plus optional VLAN.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxmoxNetwork {
    pub bridge: String,
    pub vlan: Option<u16>,
}

/// IP allocation mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpAllocation {
    Dhcp,
    Static {
        addresses: Vec<String>,
        gateway: Option<String>,
    },
    Pool {
        pool: String,
    },
}

impl Default for IpAllocation {
    fn default() -> Self {
        Self::Dhcp
    }
}

/// Desired state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMNetworkAttachmentSpec {
    pub vsphere: Option<VSphereNetwork>,
    pub libvirt: Option<LibvirtNetwork>,
    pub proxmox: Option<ProxmoxNetwork>,
    pub ip_allocation: IpAllocation,
}

/// Observed state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMNetworkAttachmentStatus {
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
}

/// The VMNetworkAttachment resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VMNetworkAttachment {
    pub meta: ObjectMeta,
    pub spec: VMNetworkAttachmentSpec,
    #[serde(default)]
    pub status: VMNetworkAttachmentStatus,
}

impl VMNetworkAttachment {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        spec: VMNetworkAttachmentSpec,
    ) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec,
            status: VMNetworkAttachmentStatus::default(),
        }
    }
}

impl Object for VMNetworkAttachment {
    const KIND: &'static str = "VMNetworkAttachment";

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }
}
