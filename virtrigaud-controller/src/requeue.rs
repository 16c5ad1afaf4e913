//! Adaptive requeue intervals.
//!
//! The next interval is a function of observed phase and power state only,
//! never of wall-clock history: transient states poll fast, stable states
//! slow down.

use std::time::Duration;

use virtrigaud_api::vm::{ObservedPowerState, VirtualMachineStatus, VmPhase};

/// Transient states and dependency waits.
pub const TRANSIENT: Duration = Duration::from_secs(30);

/// Powered-on and stable.
pub const RUNNING_STABLE: Duration = Duration::from_secs(120);

/// Powered-off and stable.
pub const STOPPED_STABLE: Duration = Duration::from_secs(300);

/// Error conditions; the work queue layers exponential back-off on top.
pub const ERROR: Duration = Duration::from_secs(30);

/// Cap for queue-level exponential back-off.
pub const ERROR_BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Interval for a VM given its observed status.
pub fn for_vm(status: &VirtualMachineStatus) -> Duration {
    if status.task_ref.is_some() {
        return TRANSIENT;
    }
    match status.phase {
        VmPhase::Pending | VmPhase::Provisioning | VmPhase::Reconfiguring | VmPhase::Deleting => {
            TRANSIENT
        }
        VmPhase::Running => {
            // Powered on but still waiting for an address.
            if status.ips.is_empty() {
                TRANSIENT
            } else {
                RUNNING_STABLE
            }
        }
        VmPhase::PoweredOff => match status.power_state {
            ObservedPowerState::Off => STOPPED_STABLE,
            _ => TRANSIENT,
        },
    }
}

/// Queue-level back-off for reconcile errors: `ERROR * 2^failures`, capped.
pub fn error_backoff(consecutive_failures: u32) -> Duration {
    let shifted = ERROR
        .checked_mul(1u32 << consecutive_failures.min(4))
        .unwrap_or(ERROR_BACKOFF_CAP);
    shifted.min(ERROR_BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_is_function_of_state_only() {
        let mut status = VirtualMachineStatus::default();
        status.phase = VmPhase::Running;
        status.power_state = ObservedPowerState::On;
        status.ips = vec!["10.0.0.5".into()];
        assert_eq!(for_vm(&status), RUNNING_STABLE);
        // Same state, same interval.
        assert_eq!(for_vm(&status), for_vm(&status));
    }

    #[test]
    fn test_waiting_for_ip_polls_fast() {
        let mut status = VirtualMachineStatus::default();
        status.phase = VmPhase::Running;
        status.power_state = ObservedPowerState::On;
        assert_eq!(for_vm(&status), TRANSIENT);
    }

    #[test]
    fn test_stopped_stable_polls_slow() {
        let mut status = VirtualMachineStatus::default();
        status.phase = VmPhase::PoweredOff;
        status.power_state = ObservedPowerState::Off;
        assert_eq!(for_vm(&status), STOPPED_STABLE);
    }

    #[test]
    fn test_in_flight_task_polls_fast() {
        let mut status = VirtualMachineStatus::default();
        status.phase = VmPhase::Running;
        status.ips = vec!["10.0.0.5".into()];
        status.task_ref = Some("task-1".into());
        assert_eq!(for_vm(&status), TRANSIENT);
    }

    #[test]
    fn test_error_backoff_grows_and_caps() {
        assert_eq!(error_backoff(0), Duration::from_secs(30));
        assert_eq!(error_backoff(1), Duration::from_secs(60));
        assert_eq!(error_backoff(3), Duration::from_secs(240));
        assert_eq!(error_backoff(10), ERROR_BACKOFF_CAP);
    }
}
