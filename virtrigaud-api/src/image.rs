//! The VMImage resource: a source descriptor with per-hypervisor variants.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::meta::{Object, ObjectMeta};
use crate::provider::ProviderType;

/// One hypervisor-specific way of sourcing the image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageVariant {
    /// Name of a template already present on the hypervisor.
    pub template_name: Option<String>,
    /// URL to fetch the image from.
    pub url: Option<String>,
    /// Disk format of the fetched image (qcow2, vmdk, raw).
    pub format: Option<String>,
    pub checksum: Option<String>,
    /// Checksum algorithm; sha256 when unset.
    pub checksum_algorithm: Option<String>,
}

/// How the image is made available on a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrepareMode {
    /// Import the image onto the hypervisor when missing.
    AutoImport,
    /// Fail unless the image already exists on the hypervisor.
    RequireExisting,
}

impl Default for PrepareMode {
    fn default() -> Self {
        Self::AutoImport
    }
}

/// Image preparation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreparePolicy {
    pub mode: PrepareMode,
    pub timeout_seconds: u64,
    pub retries: u32,
}

impl Default for PreparePolicy {
    fn default() -> Self {
        Self {
            mode: PrepareMode::AutoImport,
            timeout_seconds: 1800,
            retries: 3,
        }
    }
}

/// Desired state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMImageSpec {
    /// Per-hypervisor source variants, keyed by provider type.
    pub variants: BTreeMap<ProviderType, ImageVariant>,
    pub prepare: Option<PreparePolicy>,
}

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImagePhase {
    Pending,
    Importing,
    Preparing,
    Ready,
    Failed,
}

impl Default for ImagePhase {
    fn default() -> Self {
        Self::Pending
    }
}

/// Observed state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VMImageStatus {
    pub phase: ImagePhase,
    pub message: String,
    pub task_ref: Option<String>,
    pub attempts: u32,
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
}

/// The VMImage resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VMImage {
    pub meta: ObjectMeta,
    pub spec: VMImageSpec,
    #[serde(default)]
    pub status: VMImageStatus,
}

impl VMImage {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: VMImageSpec) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec,
            status: VMImageStatus::default(),
        }
    }

    /// The variant for a provider type, if declared.
    pub fn variant_for(&self, provider_type: ProviderType) -> Option<&ImageVariant> {
        self.spec.variants.get(&provider_type)
    }
}

impl Object for VMImage {
    const KIND: &'static str = "VMImage";

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
    fn test_variant_lookup() {
        let mut spec = VMImageSpec::default();
        spec.variants.insert(
            ProviderType::Libvirt,
            ImageVariant {
                url: Some("https://images.example.com/ubuntu-22.qcow2".into()),
                format: Some("qcow2".into()),
                ..Default::default()
            },
        );
        let image = VMImage::new("default", "ubuntu-22", spec);
        assert!(image.variant_for(ProviderType::Libvirt).is_some());
        assert!(image.variant_for(ProviderType::VSphere).is_none());
    }

    #[test]
    fn test_variant_map_roundtrip() {
        let mut spec = VMImageSpec::default();
        spec.variants.insert(ProviderType::Proxmox, ImageVariant::default());
        let json = serde_json::to_string(&spec).unwrap();
        let back: VMImageSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, back);
    }
}
