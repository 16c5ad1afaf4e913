//! End-to-end cold-migration scenarios: the happy path across two
//! providers with checksum round-trip, retry-then-succeed on a transient
//! export failure, deletion mid-Creating, and the retry arithmetic.

mod common;

use std::sync::Arc;

use common::{ready, TestEnv, NS};

use virtrigaud_api::migration::{
    MigrationPhase, MigrationSource, MigrationTarget, RetryPolicy, StagingStorageSpec,
    VMMigration, VMMigrationSpec,
};
use virtrigaud_api::{LocalObjectRef, ObjectKey, Quantity};
use virtrigaud_controller::reconcile::{migration::MigrationReconciler, Action, Reconciler};
use virtrigaud_provider::{MockProvider, ProviderError};
use virtrigaud_store::Api;

fn migration_spec(source_vm: &str, target_name: &str) -> VMMigrationSpec {
    VMMigrationSpec {
        source: MigrationSource {
            vm_ref: LocalObjectRef::new(source_vm),
            create_snapshot: true,
            ..Default::default()
        },
        target: MigrationTarget {
            name: target_name.to_string(),
            provider_ref: LocalObjectRef::new("px1"),
            ..Default::default()
        },
        storage: StagingStorageSpec::Pvc {
            claim_name: None,
            size: None,
        },
        ..Default::default()
    }
}

struct MigrationRun {
    env: TestEnv,
    source: Arc<MockProvider>,
    reconciler: MigrationReconciler,
    key: ObjectKey,
}

impl MigrationRun {
    async fn new(spec: VMMigrationSpec) -> (Self, String) {
        let (env, workers) = TestEnv::with_workers(&["lv1", "px1"]);
        let source = workers["lv1"].clone();

        env.add_provider("lv1").await;
        env.add_provider("px1").await;
        env.add_class("small", 2, Quantity::from_gib(4)).await;
        env.add_vm("source-vm", "lv1", "small").await;
        let vm = env.vm_until_ready("source-vm", 5).await;
        let source_id = vm.status.id.clone().unwrap();

        let migrations: Api<VMMigration> = env.ctx.api();
        let mig = VMMigration::new(NS, "m1", spec);
        migrations.create(&mig).await.unwrap();

        let reconciler = MigrationReconciler::new(env.ctx.clone());
        (
            Self {
                env,
                source,
                reconciler,
                key: ObjectKey::new(NS, "m1"),
            },
            source_id,
        )
    }

    async fn get(&self) -> Option<VMMigration> {
        let api: Api<VMMigration> = self.env.ctx.api();
        api.get(&self.key).await.unwrap()
    }

    /// Drive the migration (and the target VM's reconciler) until the
    /// given predicate holds, recording distinct phases along the way.
    async fn run_until(
        &self,
        max_passes: usize,
        drive_target_vm: bool,
        stop: impl Fn(&VMMigration) -> bool,
    ) -> Vec<MigrationPhase> {
        let mut phases = Vec::new();
        for _ in 0..max_passes {
            self.reconciler.reconcile(&self.key).await.expect("migration reconcile");
            if drive_target_vm {
                let target_name = {
                    let mig = self.get().await.expect("migration present");
                    mig.spec.target.name.clone()
                };
                if self.env.get_vm(&target_name).await.is_some() {
                    self.env.reconcile_vm(&target_name).await;
                }
            }
            let Some(mig) = self.get().await else { break };
            if phases.last() != Some(&mig.status.phase) {
                phases.push(mig.status.phase);
            }
            if stop(&mig) {
                break;
            }
        }
        phases
    }
}

#[tokio::test]
async fn s4_happy_path_migration_with_checksum_roundtrip() {
    let (run, source_id) = MigrationRun::new(migration_spec("source-vm", "web-01-moved")).await;

    // Ten-GiB qcow2 stand-in with a checksum known up front.
    let content = bytes::Bytes::from_static(b"pretend this is a 10 GiB qcow2 image");
    let expected_checksum = {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(&content))
    };
    run.source.set_disk_content(&source_id, content);

    let phases = run
        .run_until(40, true, |mig| {
            mig.status.phase == MigrationPhase::Ready && mig.status.cleanup_done
        })
        .await;

    assert_eq!(
        phases,
        vec![
            MigrationPhase::Pending,
            MigrationPhase::Validating,
            MigrationPhase::Snapshotting,
            MigrationPhase::Exporting,
            MigrationPhase::Importing,
            MigrationPhase::Creating,
            MigrationPhase::ValidatingTarget,
            MigrationPhase::Ready,
        ]
    );

    let mig = run.get().await.unwrap();
    let disk_info = mig.status.disk_info.clone().unwrap();
    assert_eq!(disk_info.source_checksum.as_deref(), Some(expected_checksum.as_str()));
    assert_eq!(disk_info.source_checksum, disk_info.target_checksum);
    assert!(mig.status.target_vm_id.is_some());
    assert!(mig.status.cleanup_done);

    // The target VM is Ready and back-pointed at the migration.
    let target = run.env.get_vm("web-01-moved").await.unwrap();
    assert!(ready(&target));
    assert_eq!(
        target.meta.annotations.get(virtrigaud_api::MIGRATION_ANNOTATION).map(String::as_str),
        Some("default/m1")
    );

    // Staging artifacts are gone after cleanup.
    let url = mig.status.staging_url.clone().unwrap();
    let driver = run.env.staging.driver_for_url(&url).unwrap();
    assert!(driver.get_metadata(&url).await.unwrap_err().is_not_found());

    // The migration-created snapshot was removed from the source.
    assert_eq!(run.source.snapshot_count(&source_id), 0);
}

#[tokio::test]
async fn s5_migration_retries_after_transient_export_failure() {
    let mut spec = migration_spec("source-vm", "web-01-moved");
    spec.options.retry_policy = Some(RetryPolicy {
        max_retries: 2,
        // Zero keeps the test fast; the delay arithmetic is covered below.
        retry_delay_seconds: 0,
        backoff_multiplier: 2.0,
    });
    let (run, _source_id) = MigrationRun::new(spec).await;

    run.source
        .fail_next("ExportDisk", ProviderError::Network("link flapped".into()));

    let phases = run
        .run_until(60, true, |mig| {
            mig.status.phase == MigrationPhase::Ready && mig.status.cleanup_done
        })
        .await;

    // Failed then reset to Pending, then the full path to Ready.
    assert!(phases.contains(&MigrationPhase::Failed), "phases: {phases:?}");
    let failed_idx = phases.iter().position(|p| *p == MigrationPhase::Failed).unwrap();
    assert_eq!(phases[failed_idx + 1], MigrationPhase::Pending);
    assert_eq!(*phases.last().unwrap(), MigrationPhase::Ready);

    let mig = run.get().await.unwrap();
    assert_eq!(mig.status.retry_count, 1);
    assert_eq!(mig.status.phase, MigrationPhase::Ready);
}

#[tokio::test]
async fn retry_waits_out_the_computed_delay() {
    let mut spec = migration_spec("source-vm", "web-01-moved");
    spec.options.retry_policy = Some(RetryPolicy {
        max_retries: 3,
        retry_delay_seconds: 3600,
        backoff_multiplier: 2.0,
    });
    let (run, _) = MigrationRun::new(spec).await;

    run.source
        .fail_next("ExportDisk", ProviderError::Network("injected".into()));

    // Drive into Failed.
    run.run_until(20, false, |mig| mig.status.phase == MigrationPhase::Failed)
        .await;

    // The next pass must not retry yet; it requeues the remaining wait.
    let action = run.reconciler.reconcile(&run.key).await.unwrap();
    match action {
        Action::RequeueAfter(delay) => {
            assert!(delay > std::time::Duration::from_secs(3000), "delay too small: {delay:?}");
        }
        other => panic!("expected a delayed requeue, got {other:?}"),
    }
    let mig = run.get().await.unwrap();
    assert_eq!(mig.status.phase, MigrationPhase::Failed);
    assert_eq!(mig.status.retry_count, 0);
}

#[tokio::test]
async fn retry_budget_is_bounded() {
    let mut spec = migration_spec("source-vm", "web-01-moved");
    spec.options.retry_policy = Some(RetryPolicy {
        max_retries: 1,
        retry_delay_seconds: 0,
        backoff_multiplier: 2.0,
    });
    let (run, _) = MigrationRun::new(spec).await;

    // Fail every export attempt: budget allows the initial attempt plus
    // one retry.
    run.source.fail_next("ExportDisk", ProviderError::Network("down".into()));
    run.source.fail_next("ExportDisk", ProviderError::Network("down".into()));
    run.source.fail_next("ExportDisk", ProviderError::Network("still down".into()));

    run.run_until(60, false, |mig| {
        mig.status.phase == MigrationPhase::Failed && mig.status.retry_count >= 1
    })
    .await;

    // Terminal: further passes stay in Failed.
    for _ in 0..3 {
        let action = run.reconciler.reconcile(&run.key).await.unwrap();
        assert_eq!(action, Action::Done);
    }
    let mig = run.get().await.unwrap();
    assert_eq!(mig.status.phase, MigrationPhase::Failed);
    assert_eq!(mig.status.retry_count, 1);
}

#[tokio::test]
async fn fatal_failures_do_not_consume_retries() {
    let mut spec = migration_spec("source-vm", "web-01-moved");
    spec.options.disk_format = Some("vmdk".into()); // source is qcow2
    spec.options.retry_policy = Some(RetryPolicy {
        max_retries: 3,
        retry_delay_seconds: 0,
        backoff_multiplier: 2.0,
    });
    let (run, _) = MigrationRun::new(spec).await;

    run.run_until(10, false, |mig| mig.status.phase == MigrationPhase::Failed)
        .await;

    let mig = run.get().await.unwrap();
    assert!(mig.status.fatal);
    assert_eq!(mig.status.retry_count, 0);

    // Absorbing despite the retry policy.
    let action = run.reconciler.reconcile(&run.key).await.unwrap();
    assert_eq!(action, Action::Done);
}

#[tokio::test]
async fn s6_deletion_mid_creating_cleans_up_everything() {
    let (run, source_id) = MigrationRun::new(migration_spec("source-vm", "web-01-moved")).await;

    // Drive to Creating without reconciling the target VM, so the
    // migration parks there.
    run.run_until(30, false, |mig| mig.status.phase == MigrationPhase::Creating)
        .await;
    // One more pass creates the target VM resource.
    run.reconciler.reconcile(&run.key).await.unwrap();

    let mig = run.get().await.unwrap();
    assert_eq!(mig.status.phase, MigrationPhase::Creating);
    let staging_url = mig.status.staging_url.clone().unwrap();
    let target = run.env.get_vm("web-01-moved").await.expect("target VM was created");
    assert_eq!(
        target.meta.annotations.get(virtrigaud_api::MIGRATION_ANNOTATION).map(String::as_str),
        Some("default/m1")
    );

    // Delete the migration mid-flight.
    let api: Api<VMMigration> = run.env.ctx.api();
    api.delete(&run.key).await.unwrap();
    run.reconciler.reconcile(&run.key).await.unwrap();

    // The migration is gone from the store.
    assert!(run.get().await.is_none());

    // The annotated target VM is being torn down; its reconciler finishes
    // the job.
    for _ in 0..4 {
        if run.env.get_vm("web-01-moved").await.is_none() {
            break;
        }
        run.env.reconcile_vm("web-01-moved").await;
    }
    assert!(run.env.get_vm("web-01-moved").await.is_none());

    // Staging artifacts are unreachable.
    let driver = run.env.staging.driver_for_url(&staging_url).unwrap();
    assert!(driver.get_metadata(&staging_url).await.unwrap_err().is_not_found());

    // The migration-created snapshot was cleaned off the source.
    assert_eq!(run.source.snapshot_count(&source_id), 0);
}

#[tokio::test]
async fn delete_after_migration_removes_source_vm() {
    let mut spec = migration_spec("source-vm", "web-01-moved");
    spec.source.delete_after_migration = true;
    let (run, _) = MigrationRun::new(spec).await;

    run.run_until(40, true, |mig| {
        mig.status.phase == MigrationPhase::Ready && mig.status.cleanup_done
    })
    .await;

    // The source VM resource is deleting; its reconciler releases the
    // provider artifact and the finalizer.
    for _ in 0..4 {
        if run.env.get_vm("source-vm").await.is_none() {
            break;
        }
        run.env.reconcile_vm("source-vm").await;
    }
    assert!(run.env.get_vm("source-vm").await.is_none());
}
