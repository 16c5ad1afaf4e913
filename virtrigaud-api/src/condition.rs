//! Status conditions.
//!
//! A condition is a (type, status, reason, message, timestamp) tuple attached
//! to a resource's status. Setting a condition supersedes any prior condition
//! of the same type; `last_transition_time` only moves when the status value
//! actually changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical condition types used across the resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Ready,
    Provisioning,
    Reconfiguring,
    Deleting,
    ReconfigurePendingPowerCycle,
    WaitingForDependencies,
    ProviderAvailable,
    ReconcileError,
    Retrying,
    Degraded,
}

impl ConditionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Ready => "Ready",
            ConditionType::Provisioning => "Provisioning",
            ConditionType::Reconfiguring => "Reconfiguring",
            ConditionType::Deleting => "Deleting",
            ConditionType::ReconfigurePendingPowerCycle => "ReconfigurePendingPowerCycle",
            ConditionType::WaitingForDependencies => "WaitingForDependencies",
            ConditionType::ProviderAvailable => "ProviderAvailable",
            ConditionType::ReconcileError => "ReconcileError",
            ConditionType::Retrying => "Retrying",
            ConditionType::Degraded => "Degraded",
        }
    }
}

/// Condition status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// One condition tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Set `cond` on the list, superseding any prior condition of the same type.
///
/// `last_transition_time` is preserved when the status value did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut cond: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == cond.type_) {
        if existing.status == cond.status {
            cond.last_transition_time = existing.last_transition_time;
        }
        *existing = cond;
    } else {
        conditions.push(cond);
    }
}

/// Remove a condition of the given type, if present.
pub fn clear_condition(conditions: &mut Vec<Condition>, type_: ConditionType) {
    conditions.retain(|c| c.type_ != type_);
}

/// Look up a condition by type.
pub fn get_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// True when a condition of the given type exists with status True.
pub fn is_condition_true(conditions: &[Condition], type_: ConditionType) -> bool {
    get_condition(conditions, type_).map(|c| c.is_true()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_preserves_transition_time_on_same_status() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new(ConditionType::Ready, ConditionStatus::True, "Running", ""),
        );
        let first = conditions[0].last_transition_time;

        set_condition(
            &mut conditions,
            Condition::new(ConditionType::Ready, ConditionStatus::True, "StillRunning", ""),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].reason, "StillRunning");
    }

    #[test]
    fn test_set_condition_moves_transition_time_on_status_change() {
        let mut conditions = Vec::new();
        let mut old = Condition::new(ConditionType::Ready, ConditionStatus::True, "Running", "");
        old.last_transition_time = Utc::now() - chrono::Duration::hours(1);
        conditions.push(old.clone());

        set_condition(
            &mut conditions,
            Condition::new(ConditionType::Ready, ConditionStatus::False, "Stopped", ""),
        );
        assert!(conditions[0].last_transition_time > old.last_transition_time);
    }

    #[test]
    fn test_is_condition_true() {
        let mut conditions = Vec::new();
        assert!(!is_condition_true(&conditions, ConditionType::Ready));
        set_condition(
            &mut conditions,
            Condition::new(ConditionType::Ready, ConditionStatus::True, "Running", ""),
        );
        assert!(is_condition_true(&conditions, ConditionType::Ready));
    }
}
