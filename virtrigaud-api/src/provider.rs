//! The Provider resource: connection metadata for one hypervisor plus the
//! runtime spec of its out-of-process worker.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::{is_condition_true, Condition, ConditionType};
use crate::meta::{LocalObjectRef, Object, ObjectMeta};

/// Supported hypervisor types.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    VSphere,
    Libvirt,
    Proxmox,
    /// In-memory worker used by tests and development mode.
    Mock,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::VSphere => "vsphere",
            ProviderType::Libvirt => "libvirt",
            ProviderType::Proxmox => "proxmox",
            ProviderType::Mock => "mock",
        }
    }
}

/// Container runtime spec for the worker deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerRuntimeSpec {
    pub image: String,
    pub replicas: u32,
    pub cpu_request: Option<String>,
    pub memory_request: Option<String>,
    pub liveness_probe_path: Option<String>,
    pub readiness_probe_path: Option<String>,
}

impl Default for WorkerRuntimeSpec {
    fn default() -> Self {
        Self {
            image: String::new(),
            replicas: 1,
            cpu_request: None,
            memory_request: None,
            liveness_probe_path: Some("/healthz".into()),
            readiness_probe_path: Some("/readyz".into()),
        }
    }
}

/// Optional client-side rate limiting toward the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSpec {
    pub requests_per_second: u32,
    pub burst: u32,
}

/// Optional health-check tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckSpec {
    pub interval_seconds: u64,
    pub timeout_seconds: u64,
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            timeout_seconds: 10,
            unhealthy_threshold: 3,
        }
    }
}

/// Placement defaults used when a VM leaves hints unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderDefaults {
    pub datastore: Option<String>,
    pub cluster: Option<String>,
    pub folder: Option<String>,
}

/// Adoption settings. Adoption only runs when the Provider also carries the
/// adopt annotation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdoptionSpec {
    /// Discovery interval; 1 hour when unset.
    pub interval_seconds: Option<u64>,
    /// Filter map. Legal keys: name-regex, power-state, min-cpu, max-cpu,
    /// min-memory, max-memory. Unknown keys are a validation error.
    pub filter: BTreeMap<String, String>,
}

/// Desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSpec {
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub endpoint: String,
    pub credential_secret_ref: Option<LocalObjectRef>,
    pub runtime: WorkerRuntimeSpec,
    pub rate_limit: Option<RateLimitSpec>,
    pub health_check: Option<HealthCheckSpec>,
    pub defaults: ProviderDefaults,
    pub adoption: Option<AdoptionSpec>,
}

impl Default for ProviderSpec {
    fn default() -> Self {
        Self {
            provider_type: ProviderType::Mock,
            endpoint: String::new(),
            credential_secret_ref: None,
            runtime: WorkerRuntimeSpec::default(),
            rate_limit: None,
            health_check: None,
            defaults: ProviderDefaults::default(),
            adoption: None,
        }
    }
}

/// Worker runtime phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderRuntimePhase {
    Pending,
    Starting,
    Ready,
    Degraded,
    Failed,
}

impl Default for ProviderRuntimePhase {
    fn default() -> Self {
        Self::Pending
    }
}

/// Feature bits reported by the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderCapabilities {
    pub snapshots: bool,
    pub memory_snapshots: bool,
    pub linked_clones: bool,
    pub online_reconfigure: bool,
    pub online_disk_expansion: bool,
    pub image_import: bool,
    pub supported_disk_types: Vec<String>,
    pub supported_network_types: Vec<String>,
}

/// Adoption bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdoptionStatus {
    pub discovered_vms: u32,
    pub adopted_vms: u32,
    pub failed_adoptions: u32,
    pub last_discovery_time: Option<DateTime<Utc>>,
    pub message: String,
}

/// Observed state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderStatus {
    pub runtime_phase: ProviderRuntimePhase,
    pub capabilities: Option<ProviderCapabilities>,
    pub adoption: AdoptionStatus,
    pub message: String,
    pub observed_generation: i64,
    pub conditions: Vec<Condition>,
}

/// The Provider resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub meta: ObjectMeta,
    pub spec: ProviderSpec,
    #[serde(default)]
    pub status: ProviderStatus,
}

impl Provider {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: ProviderSpec) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec,
            status: ProviderStatus::default(),
        }
    }

    /// A provider is usable only when its runtime phase is Ready and the
    /// ProviderAvailable condition is true.
    pub fn is_usable(&self) -> bool {
        self.status.runtime_phase == ProviderRuntimePhase::Ready
            && is_condition_true(&self.status.conditions, ConditionType::ProviderAvailable)
    }

    /// Whether the adopt annotation is present and truthy.
    pub fn adoption_enabled(&self) -> bool {
        self.meta
            .annotations
            .get(crate::ADOPT_ANNOTATION)
            .map(|v| v == "true")
            .unwrap_or(false)
    }
}

impl Object for Provider {
    const KIND: &'static str = "Provider";

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
    use crate::condition::{set_condition, ConditionStatus};

    #[test]
    fn test_usable_requires_ready_and_available() {
        let mut provider = Provider::new("default", "lv1", ProviderSpec::default());
        assert!(!provider.is_usable());

        provider.status.runtime_phase = ProviderRuntimePhase::Ready;
        assert!(!provider.is_usable());

        set_condition(
            &mut provider.status.conditions,
            Condition::new(
                ConditionType::ProviderAvailable,
                ConditionStatus::True,
                "Validated",
                "",
            ),
        );
        assert!(provider.is_usable());
    }

    #[test]
    fn test_adoption_enabled() {
        let mut provider = Provider::new("default", "lv1", ProviderSpec::default());
        assert!(!provider.adoption_enabled());
        provider
            .meta
            .annotations
            .insert(crate::ADOPT_ANNOTATION.into(), "true".into());
        assert!(provider.adoption_enabled());
    }
}
