//! End-to-end VirtualMachine scenarios on the in-memory store and mock
//! provider worker: create, out-of-band deletion recovery, offline
//! reconfigure staging, deletion with finalizer safety and reconcile
//! idempotence.

mod common;

use common::{ready, TestEnv, NS};

use virtrigaud_api::condition::is_condition_true;
use virtrigaud_api::vm::{ObservedPowerState, VmPhase};
use virtrigaud_api::{ConditionType, ObjectKey, Quantity};
use virtrigaud_store::Api;

#[tokio::test]
async fn s1_create_converges_within_three_reconciliations() {
    let worker = std::sync::Arc::new(virtrigaud_provider::MockProvider::new());
    let env = TestEnv::new(vec![("vsphere-prod", worker.clone())]);

    env.add_provider("vsphere-prod").await;
    env.add_class("small", 2, Quantity::from_gib(4)).await;
    env.add_vm("web-01", "vsphere-prod", "small").await;

    for _ in 0..3 {
        env.reconcile_vm("web-01").await;
    }

    let vm = env.get_vm("web-01").await.unwrap();
    assert!(vm.status.id.as_deref().map(|s| !s.is_empty()).unwrap_or(false));
    assert!(ready(&vm), "Ready should be True: {:?}", vm.status.conditions);
    assert_eq!(vm.status.power_state, ObservedPowerState::On);
    assert_eq!(vm.status.phase, VmPhase::Running);
    assert_eq!(
        vm.status.hardware.unwrap(),
        virtrigaud_api::vm::ObservedHardware { cpus: 2, memory_mib: 4096 }
    );
}

#[tokio::test]
async fn s2_out_of_band_deletion_recovers_with_new_id() {
    let worker = std::sync::Arc::new(virtrigaud_provider::MockProvider::new());
    let env = TestEnv::new(vec![("vsphere-prod", worker.clone())]);

    env.add_provider("vsphere-prod").await;
    env.add_class("small", 2, Quantity::from_gib(4)).await;
    env.add_vm("web-01", "vsphere-prod", "small").await;
    let vm = env.vm_until_ready("web-01", 5).await;
    let old_id = vm.status.id.clone().unwrap();

    // Simulate the provider losing the VM.
    worker.remove_out_of_band(&old_id);

    // One reconciliation clears the stale ID and issues a new Create.
    env.reconcile_vm("web-01").await;
    let vm = env.get_vm("web-01").await.unwrap();
    let new_id = vm.status.id.clone().expect("a new create was issued");
    assert_ne!(new_id, old_id);

    let vm = env.vm_until_ready("web-01", 5).await;
    assert_eq!(vm.status.id.unwrap(), new_id);
    assert!(worker.vm_exists(&new_id));
}

#[tokio::test]
async fn s3_offline_reconfigure_stages_power_cycle() {
    let worker = std::sync::Arc::new(virtrigaud_provider::MockProvider::new());
    let mut caps = virtrigaud_api::provider::ProviderCapabilities::default();
    caps.snapshots = true;
    caps.online_reconfigure = false;
    worker.set_capabilities(caps);

    let env = TestEnv::new(vec![("vsphere-prod", worker.clone())]);
    env.add_provider("vsphere-prod").await;
    env.add_class("small", 2, Quantity::from_gib(4)).await;
    env.add_class("large", 8, Quantity::from_gib(16)).await;
    env.add_vm("web-01", "vsphere-prod", "small").await;
    env.vm_until_ready("web-01", 5).await;

    // Grow the VM.
    let api: Api<virtrigaud_api::VirtualMachine> = env.ctx.api();
    let key = ObjectKey::new(NS, "web-01");
    let mut vm = api.get(&key).await.unwrap().unwrap();
    vm.spec.class_ref = virtrigaud_api::LocalObjectRef::new("large");
    api.update(&vm).await.unwrap();

    // Drive to completion, recording the observed phase path and whether
    // the staging condition ever appeared.
    let mut phases = Vec::new();
    let mut saw_pending_cycle = false;
    for _ in 0..12 {
        env.reconcile_vm("web-01").await;
        let vm = api.get(&key).await.unwrap().unwrap();
        if phases.last() != Some(&vm.status.phase) {
            phases.push(vm.status.phase);
        }
        saw_pending_cycle |= is_condition_true(
            &vm.status.conditions,
            ConditionType::ReconfigurePendingPowerCycle,
        );
        if ready(&vm) && vm.status.hardware.map(|h| h.cpus) == Some(8) {
            break;
        }
    }

    let vm = api.get(&key).await.unwrap().unwrap();
    assert!(saw_pending_cycle, "ReconfigurePendingPowerCycle was never surfaced");
    assert_eq!(
        vm.status.hardware.unwrap(),
        virtrigaud_api::vm::ObservedHardware { cpus: 8, memory_mib: 16384 }
    );
    assert!(ready(&vm));
    assert_eq!(vm.status.phase, VmPhase::Running);

    // The staged cycle passes through PoweredOff and Reconfiguring in
    // order before returning to Running.
    let off_idx = phases.iter().position(|p| *p == VmPhase::PoweredOff);
    let reconf_idx = phases.iter().position(|p| *p == VmPhase::Reconfiguring);
    assert!(off_idx.is_some(), "never observed PoweredOff: {phases:?}");
    assert!(reconf_idx.is_some(), "never observed Reconfiguring: {phases:?}");
    assert!(off_idx < reconf_idx, "unexpected order: {phases:?}");
    assert_eq!(*phases.last().unwrap(), VmPhase::Running);

    // Capability honesty: the offline path actually changed the shape,
    // which the mock only allows while powered off.
}

#[tokio::test]
async fn deletion_blocks_until_provider_confirms() {
    let worker = std::sync::Arc::new(virtrigaud_provider::MockProvider::new());
    let env = TestEnv::new(vec![("vsphere-prod", worker.clone())]);

    env.add_provider("vsphere-prod").await;
    env.add_class("small", 2, Quantity::from_gib(4)).await;
    env.add_vm("web-01", "vsphere-prod", "small").await;
    let vm = env.vm_until_ready("web-01", 5).await;
    let id = vm.status.id.clone().unwrap();
    assert!(worker.vm_exists(&id));

    let api: Api<virtrigaud_api::VirtualMachine> = env.ctx.api();
    let key = ObjectKey::new(NS, "web-01");
    api.delete(&key).await.unwrap();

    // Still present while the finalizer runs.
    assert!(api.get(&key).await.unwrap().is_some());

    for _ in 0..4 {
        env.reconcile_vm("web-01").await;
        if api.get(&key).await.unwrap().is_none() {
            break;
        }
    }

    // Finalizer safety: the store object is gone only once the provider
    // side artifact is too.
    assert!(api.get(&key).await.unwrap().is_none());
    assert!(!worker.vm_exists(&id));
}

#[tokio::test]
async fn reconcile_is_idempotent_without_external_change() {
    let worker = std::sync::Arc::new(virtrigaud_provider::MockProvider::new());
    let env = TestEnv::new(vec![("vsphere-prod", worker.clone())]);

    env.add_provider("vsphere-prod").await;
    env.add_class("small", 2, Quantity::from_gib(4)).await;
    env.add_vm("web-01", "vsphere-prod", "small").await;
    env.vm_until_ready("web-01", 5).await;

    env.reconcile_vm("web-01").await;
    let first = env.get_vm("web-01").await.unwrap();

    env.reconcile_vm("web-01").await;
    let second = env.get_vm("web-01").await.unwrap();

    // Same stored state after the second pass: spec and status agree.
    assert_eq!(first.spec, second.spec);
    assert_eq!(first.status, second.status);
    assert_eq!(worker.vm_count(), 1);
}

#[tokio::test]
async fn class_firmware_reaches_the_provider() {
    let worker = std::sync::Arc::new(virtrigaud_provider::MockProvider::new());
    let env = TestEnv::new(vec![("vsphere-prod", worker.clone())]);

    env.add_provider("vsphere-prod").await;
    let classes: Api<virtrigaud_api::VMClass> = env.ctx.api();
    let mut class = virtrigaud_api::VMClass::with_shape(NS, "secure", 2, Quantity::from_gib(4));
    class.spec.firmware = virtrigaud_api::Firmware::Uefi;
    classes.create(&class).await.unwrap();

    env.add_vm("web-01", "vsphere-prod", "secure").await;
    let vm = env.vm_until_ready("web-01", 5).await;

    // The class's firmware travels through the create request and shows
    // up in the provider's view of the machine.
    assert_eq!(
        vm.status.provider_details.get("firmware").map(String::as_str),
        Some("uefi")
    );
}

#[tokio::test]
async fn conflicting_placement_is_a_validation_error() {
    let worker = std::sync::Arc::new(virtrigaud_provider::MockProvider::new());
    let env = TestEnv::new(vec![("vsphere-prod", worker.clone())]);

    env.add_provider("vsphere-prod").await;
    env.add_class("small", 2, Quantity::from_gib(4)).await;

    let policies: Api<virtrigaud_api::VMPlacementPolicy> = env.ctx.api();
    let mut policy_spec = virtrigaud_api::VMPlacementPolicySpec::default();
    policy_spec.hard.clusters = vec!["cluster-a".into()];
    policies
        .create(&virtrigaud_api::VMPlacementPolicy::new(NS, "pinned", policy_spec))
        .await
        .unwrap();

    let vms: Api<virtrigaud_api::VirtualMachine> = env.ctx.api();
    let mut spec = virtrigaud_api::VirtualMachineSpec::default();
    spec.provider_ref = virtrigaud_api::LocalObjectRef::new("vsphere-prod");
    spec.class_ref = virtrigaud_api::LocalObjectRef::new("small");
    spec.placement = Some(virtrigaud_api::vm::PlacementHints {
        policy_ref: Some(virtrigaud_api::LocalObjectRef::new("pinned")),
        cluster: Some("cluster-z".into()), // outside the hard set
        ..Default::default()
    });
    vms.create(&virtrigaud_api::VirtualMachine::new(NS, "web-01", spec))
        .await
        .unwrap();

    env.reconcile_vm("web-01").await; // finalizer
    let action = env.reconcile_vm("web-01").await;

    // Fatal: no requeue until the spec changes, and nothing was created.
    assert_eq!(action, virtrigaud_controller::reconcile::Action::Done);
    let vm = env.get_vm("web-01").await.unwrap();
    assert!(is_condition_true(&vm.status.conditions, ConditionType::ReconcileError));
    assert!(vm.status.id.is_none());
    assert_eq!(worker.vm_count(), 0);
}

#[tokio::test]
async fn missing_dependencies_surface_condition_and_wait() {
    let worker = std::sync::Arc::new(virtrigaud_provider::MockProvider::new());
    let env = TestEnv::new(vec![("vsphere-prod", worker.clone())]);

    env.add_provider("vsphere-prod").await;
    // No class created.
    env.add_vm("web-01", "vsphere-prod", "missing-class").await;

    env.reconcile_vm("web-01").await; // finalizer
    env.reconcile_vm("web-01").await; // dependency wait

    let vm = env.get_vm("web-01").await.unwrap();
    assert!(is_condition_true(&vm.status.conditions, ConditionType::WaitingForDependencies));
    assert!(vm.status.id.is_none());
    assert!(!ready(&vm));
}
