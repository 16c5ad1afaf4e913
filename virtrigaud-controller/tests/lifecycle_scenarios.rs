//! Lifecycle reconciler scenarios: snapshots with retention, clone
//! degradation, VMSet rolling updates, image preparation and provider
//! adoption.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{ready, TestEnv, NS};

use virtrigaud_api::clone::{CloneSource, CloneType, VMClone, VMCloneSpec};
use virtrigaud_api::condition::is_condition_true;
use virtrigaud_api::image::{ImageVariant, VMImage, VMImageSpec};
use virtrigaud_api::provider::{Provider, ProviderType};
use virtrigaud_api::set::{VMSet, VMSetSpec};
use virtrigaud_api::snapshot::{RetentionPolicy, SnapshotPhase, VMSnapshot, VMSnapshotSpec};
use virtrigaud_api::{
    ClonePhase, ConditionType, ImagePhase, LocalObjectRef, ObjectKey, Quantity, VirtualMachine,
    ADOPTED_LABEL, ADOPT_ANNOTATION,
};
use virtrigaud_controller::reconcile::set::REVISION_LABEL;
use virtrigaud_controller::reconcile::{
    clone::CloneReconciler, image::ImageReconciler, provider::ProviderReconciler,
    set::SetReconciler, snapshot::SnapshotReconciler, Reconciler,
};
use virtrigaud_provider::{CreateRequest, MockProvider, ProviderRpc};
use virtrigaud_store::Api;

async fn ready_vm(env: &TestEnv, name: &str) -> VirtualMachine {
    env.add_vm(name, "lv1", "small").await;
    env.vm_until_ready(name, 5).await
}

#[tokio::test]
async fn snapshot_lifecycle_create_ready_delete() {
    let worker = Arc::new(MockProvider::new());
    let env = TestEnv::new(vec![("lv1", worker.clone())]);
    env.add_provider("lv1").await;
    env.add_class("small", 2, Quantity::from_gib(4)).await;
    let vm = ready_vm(&env, "db-01").await;
    let vm_id = vm.status.id.clone().unwrap();

    let snaps: Api<VMSnapshot> = env.ctx.api();
    let snap = VMSnapshot::new(
        NS,
        "pre-upgrade",
        VMSnapshotSpec {
            vm_ref: LocalObjectRef::new("db-01"),
            description: "before upgrade".into(),
            ..Default::default()
        },
    );
    snaps.create(&snap).await.unwrap();

    let reconciler = SnapshotReconciler::new(env.ctx.clone());
    let key = ObjectKey::new(NS, "pre-upgrade");
    for _ in 0..4 {
        reconciler.reconcile(&key).await.unwrap();
        let snap = snaps.get(&key).await.unwrap().unwrap();
        if snap.status.phase == SnapshotPhase::Ready {
            break;
        }
    }

    let snap = snaps.get(&key).await.unwrap().unwrap();
    assert_eq!(snap.status.phase, SnapshotPhase::Ready);
    assert!(snap.status.snapshot_id.is_some());
    assert!(snap.status.created_at.is_some());
    assert_eq!(worker.snapshot_count(&vm_id), 1);

    // Deletion removes the provider-side snapshot before the finalizer.
    snaps.delete(&key).await.unwrap();
    for _ in 0..3 {
        reconciler.reconcile(&key).await.unwrap();
        if snaps.get(&key).await.unwrap().is_none() {
            break;
        }
    }
    assert!(snaps.get(&key).await.unwrap().is_none());
    assert_eq!(worker.snapshot_count(&vm_id), 0);
}

#[tokio::test]
async fn snapshot_self_deletes_when_parent_vm_is_gone() {
    let worker = Arc::new(MockProvider::new());
    let env = TestEnv::new(vec![("lv1", worker.clone())]);
    env.add_provider("lv1").await;
    env.add_class("small", 2, Quantity::from_gib(4)).await;
    ready_vm(&env, "db-01").await;

    let snaps: Api<VMSnapshot> = env.ctx.api();
    let snap = VMSnapshot::new(
        NS,
        "ephemeral",
        VMSnapshotSpec {
            vm_ref: LocalObjectRef::new("db-01"),
            retention: Some(RetentionPolicy {
                max_age_seconds: None,
                delete_on_vm_delete: true,
            }),
            ..Default::default()
        },
    );
    snaps.create(&snap).await.unwrap();

    let reconciler = SnapshotReconciler::new(env.ctx.clone());
    let key = ObjectKey::new(NS, "ephemeral");
    for _ in 0..4 {
        reconciler.reconcile(&key).await.unwrap();
    }
    assert_eq!(
        snaps.get(&key).await.unwrap().unwrap().status.phase,
        SnapshotPhase::Ready
    );

    // Tear down the parent VM completely.
    let vms: Api<VirtualMachine> = env.ctx.api();
    vms.delete(&ObjectKey::new(NS, "db-01")).await.unwrap();
    for _ in 0..4 {
        env.reconcile_vm("db-01").await;
        if env.get_vm("db-01").await.is_none() {
            break;
        }
    }
    assert!(env.get_vm("db-01").await.is_none());

    // The retention sweep notices and self-deletes; the finalizer path
    // releases without a provider-side artifact to remove.
    for _ in 0..4 {
        reconciler.reconcile(&key).await.unwrap();
        if snaps.get(&key).await.unwrap().is_none() {
            break;
        }
    }
    assert!(snaps.get(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn clone_degrades_to_full_when_linked_unsupported() {
    let worker = Arc::new(MockProvider::new());
    let mut caps = virtrigaud_api::provider::ProviderCapabilities::default();
    caps.snapshots = true;
    caps.linked_clones = false;
    caps.online_reconfigure = true;
    worker.set_capabilities(caps);

    let env = TestEnv::new(vec![("lv1", worker.clone())]);
    env.add_provider("lv1").await;
    env.add_class("small", 2, Quantity::from_gib(4)).await;
    ready_vm(&env, "db-01").await;

    let clones: Api<VMClone> = env.ctx.api();
    let clone = VMClone::new(
        NS,
        "db-01-copy",
        VMCloneSpec {
            source: CloneSource::Vm(LocalObjectRef::new("db-01")),
            target_name: "db-01-copy".into(),
            clone_type: CloneType::Linked,
            power_on: false,
            ..Default::default()
        },
    );
    clones.create(&clone).await.unwrap();

    let reconciler = CloneReconciler::new(env.ctx.clone());
    let key = ObjectKey::new(NS, "db-01-copy");
    for _ in 0..5 {
        reconciler.reconcile(&key).await.unwrap();
        let clone = clones.get(&key).await.unwrap().unwrap();
        if clone.status.phase == ClonePhase::Ready {
            break;
        }
    }

    let clone = clones.get(&key).await.unwrap().unwrap();
    assert_eq!(clone.status.phase, ClonePhase::Ready);
    assert!(clone.status.vm_id.is_some());
    // Degradation was surfaced, not failed.
    assert!(is_condition_true(&clone.status.conditions, ConditionType::Degraded));
    assert!(worker.vm_id_by_name("db-01-copy").is_some());
}

#[tokio::test]
async fn set_scales_up_and_rolls_template_updates() {
    let worker = Arc::new(MockProvider::new());
    let env = TestEnv::new(vec![("lv1", worker.clone())]);
    env.add_provider("lv1").await;
    env.add_class("small", 2, Quantity::from_gib(4)).await;

    let mut spec = VMSetSpec::default();
    spec.replicas = 2;
    spec.selector.insert("app".into(), "web".into());
    spec.template.spec.provider_ref = LocalObjectRef::new("lv1");
    spec.template.spec.class_ref = LocalObjectRef::new("small");

    let sets: Api<VMSet> = env.ctx.api();
    sets.create(&VMSet::new(NS, "web", spec)).await.unwrap();

    let reconciler = SetReconciler::new(env.ctx.clone());
    let key = ObjectKey::new(NS, "web");
    let vms: Api<VirtualMachine> = env.ctx.api();

    // Converge: the set creates replicas, the VM reconciler realises them.
    for _ in 0..10 {
        reconciler.reconcile(&key).await.unwrap();
        for vm in vms.list(Some(NS)).await.unwrap() {
            env.reconcile_vm(&vm.meta.name).await;
        }
        let set = sets.get(&key).await.unwrap().unwrap();
        if set.status.ready_replicas == 2 {
            break;
        }
    }
    let set = sets.get(&key).await.unwrap().unwrap();
    assert_eq!(set.status.replicas, 2);
    assert_eq!(set.status.ready_replicas, 2);
    let first_revision = set.status.current_revision.clone();

    // Roll a new template revision.
    let mut set = sets.get(&key).await.unwrap().unwrap();
    set.spec.template.spec.tags.push("v2".into());
    sets.update(&set).await.unwrap();

    let min_ready = 1; // replicas(2) - maxUnavailable(1)
    for _ in 0..20 {
        reconciler.reconcile(&key).await.unwrap();

        // Availability invariant during the rollout.
        let live: Vec<VirtualMachine> = vms
            .list(Some(NS))
            .await
            .unwrap()
            .into_iter()
            .filter(|vm| !vm.meta.is_deleting())
            .collect();
        let ready_count = live.iter().filter(|vm| ready(vm)).count();
        assert!(
            ready_count >= min_ready,
            "invariant violated: {ready_count} ready"
        );

        for vm in live {
            env.reconcile_vm(&vm.meta.name).await;
        }
        // Drain replicas the set retired.
        for vm in vms.list(Some(NS)).await.unwrap() {
            if vm.meta.is_deleting() {
                env.reconcile_vm(&vm.meta.name).await;
            }
        }

        let set = sets.get(&key).await.unwrap().unwrap();
        if set.status.ready_replicas == 2 && set.status.updated_replicas == 2 {
            break;
        }
    }

    let set = sets.get(&key).await.unwrap().unwrap();
    assert_eq!(set.status.ready_replicas, 2);
    assert_eq!(set.status.updated_replicas, 2);
    assert_ne!(set.status.current_revision, first_revision);
    for vm in vms.list(Some(NS)).await.unwrap() {
        assert_eq!(
            vm.meta.labels.get(REVISION_LABEL),
            Some(&set.status.current_revision)
        );
    }
}

#[tokio::test]
async fn image_prepares_to_ready_via_auto_import() {
    let worker = Arc::new(MockProvider::new());
    let env = TestEnv::new(vec![("lv1", worker.clone())]);
    env.add_provider("lv1").await;

    let mut spec = VMImageSpec::default();
    spec.variants.insert(
        ProviderType::Mock,
        ImageVariant {
            url: Some("https://images.example.com/ubuntu-22.qcow2".into()),
            format: Some("qcow2".into()),
            ..Default::default()
        },
    );

    let images: Api<VMImage> = env.ctx.api();
    images.create(&VMImage::new(NS, "ubuntu-22", spec)).await.unwrap();

    let reconciler = ImageReconciler::new(env.ctx.clone());
    let key = ObjectKey::new(NS, "ubuntu-22");
    for _ in 0..4 {
        reconciler.reconcile(&key).await.unwrap();
        let image = images.get(&key).await.unwrap().unwrap();
        if image.status.phase == ImagePhase::Ready {
            break;
        }
    }

    let image = images.get(&key).await.unwrap().unwrap();
    assert_eq!(image.status.phase, ImagePhase::Ready);
    assert!(is_condition_true(&image.status.conditions, ConditionType::Ready));
}

#[tokio::test]
async fn adoption_synthesises_vms_and_classes() {
    let worker = Arc::new(MockProvider::new());
    // Pre-existing machines on the hypervisor, outside the store.
    worker
        .create(CreateRequest {
            name: "legacy-db".into(),
            cpus: 4,
            memory_mib: 8192,
            power_on: true,
            ..Default::default()
        })
        .await
        .unwrap();
    worker
        .create(CreateRequest {
            name: "scratch-vm".into(),
            cpus: 1,
            memory_mib: 512,
            power_on: false,
            ..Default::default()
        })
        .await
        .unwrap();

    let env = TestEnv::new(vec![("lv1", worker.clone())]);

    // Provider with adoption enabled and a filter that keeps only the
    // legacy machine.
    let providers: Api<Provider> = env.ctx.api();
    let mut provider = Provider::new(
        NS,
        "lv1",
        virtrigaud_api::provider::ProviderSpec {
            provider_type: ProviderType::Mock,
            endpoint: "http://lv1:9090".into(),
            adoption: Some(virtrigaud_api::provider::AdoptionSpec {
                interval_seconds: Some(3600),
                filter: BTreeMap::from([("name-regex".to_string(), "^legacy-".to_string())]),
            }),
            ..Default::default()
        },
    );
    provider
        .meta
        .annotations
        .insert(ADOPT_ANNOTATION.to_string(), "true".to_string());
    providers.create(&provider).await.unwrap();

    let reconciler = ProviderReconciler::new(env.ctx.clone());
    let key = ObjectKey::new(NS, "lv1");
    for _ in 0..3 {
        reconciler.reconcile(&key).await.unwrap();
    }

    let provider = providers.get(&key).await.unwrap().unwrap();
    assert!(provider.is_usable());
    assert_eq!(provider.status.adoption.discovered_vms, 2);
    assert_eq!(provider.status.adoption.adopted_vms, 1);
    assert!(provider.status.adoption.last_discovery_time.is_some());

    // The adopted VM carries the label and the discovered identity.
    let adopted = env.get_vm("legacy-db").await.unwrap();
    assert_eq!(adopted.meta.labels.get(ADOPTED_LABEL).map(String::as_str), Some("true"));
    assert_eq!(adopted.status.id.as_deref(), worker.vm_id_by_name("legacy-db").as_deref());
    assert!(adopted.spec.imported_disk.is_some());

    // A class matching the discovered shape was auto-generated.
    let classes: Api<virtrigaud_api::VMClass> = env.ctx.api();
    let class = classes
        .get(&ObjectKey::new(NS, &adopted.spec.class_ref.name))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(class.spec.cpus, 4);
    assert_eq!(class.spec.memory, Quantity::from_mib(8192));

    // The filtered-out machine was not adopted.
    assert!(env.get_vm("scratch-vm").await.is_none());

    // A second sweep inside the interval is a no-op; outside it, the
    // already-managed machine is excluded.
    reconciler.reconcile(&key).await.unwrap();
    let provider = providers.get(&key).await.unwrap().unwrap();
    assert_eq!(provider.status.adoption.adopted_vms, 1);
}

#[tokio::test]
async fn adoption_rejects_unknown_filter_keys() {
    let worker = Arc::new(MockProvider::new());
    let env = TestEnv::new(vec![("lv1", worker.clone())]);

    let providers: Api<Provider> = env.ctx.api();
    let mut provider = Provider::new(
        NS,
        "lv1",
        virtrigaud_api::provider::ProviderSpec {
            provider_type: ProviderType::Mock,
            endpoint: "http://lv1:9090".into(),
            adoption: Some(virtrigaud_api::provider::AdoptionSpec {
                interval_seconds: Some(3600),
                filter: BTreeMap::from([("colour".to_string(), "blue".to_string())]),
            }),
            ..Default::default()
        },
    );
    provider
        .meta
        .annotations
        .insert(ADOPT_ANNOTATION.to_string(), "true".to_string());
    providers.create(&provider).await.unwrap();

    let reconciler = ProviderReconciler::new(env.ctx.clone());
    let key = ObjectKey::new(NS, "lv1");
    for _ in 0..3 {
        reconciler.reconcile(&key).await.unwrap();
    }

    // The validation error is surfaced without blocking readiness.
    let provider = providers.get(&key).await.unwrap().unwrap();
    assert!(provider.is_usable());
    assert!(provider.status.adoption.message.contains("unrecognised filter key"));
    assert_eq!(provider.status.adoption.adopted_vms, 0);
}
