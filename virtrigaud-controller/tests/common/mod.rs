//! Shared harness for controller integration tests: an in-memory store,
//! mock provider workers and a tempdir-backed staging channel.
//
// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::sync::Arc;

use virtrigaud_api::provider::{ProviderSpec, ProviderType};
use virtrigaud_api::{
    LocalObjectRef, ObjectKey, PowerState, Provider, Quantity, VMClass, VirtualMachine,
    VirtualMachineSpec,
};
use virtrigaud_controller::context::Ctx;
use virtrigaud_controller::reconcile::{provider::ProviderReconciler, vm::VmReconciler, Action, Reconciler};
use virtrigaud_provider::{MockProvider, ProviderResolver, ProviderRpc, StaticClientFactory};
use virtrigaud_store::{Api, MemoryStore, RawStore, Recorder};
use virtrigaud_storage::StagingFactory;

pub const NS: &str = "default";

pub struct TestEnv {
    pub ctx: Arc<Ctx>,
    pub staging: StagingFactory,
    _tmp: tempfile::TempDir,
}

impl TestEnv {
    /// Build an environment with the given provider workers, keyed by the
    /// Provider resource name they will back.
    pub fn new(workers: Vec<(&str, Arc<MockProvider>)>) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let staging = StagingFactory::new(tmp.path().join("pvc"), tmp.path().join("nfs"));

        let mut factory = StaticClientFactory::new();
        for (name, worker) in workers {
            factory.insert(format!("{NS}/{name}"), worker as Arc<dyn ProviderRpc>);
        }

        let store: Arc<dyn RawStore> = Arc::new(MemoryStore::new());
        let ctx = Ctx::new(
            store,
            Arc::new(ProviderResolver::new(Arc::new(factory))),
            Recorder::new(),
            staging.clone(),
        );

        Self {
            ctx,
            staging,
            _tmp: tmp,
        }
    }

    /// Build an environment plus one staging-wired mock worker per name,
    /// so export/import move real bytes through the shared mounts.
    pub fn with_workers(names: &[&str]) -> (Self, std::collections::HashMap<String, Arc<MockProvider>>) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let staging = StagingFactory::new(tmp.path().join("pvc"), tmp.path().join("nfs"));

        let mut workers = std::collections::HashMap::new();
        let mut factory = StaticClientFactory::new();
        for name in names {
            let worker = Arc::new(MockProvider::new().with_staging(staging.clone()));
            factory.insert(
                format!("{NS}/{name}"),
                worker.clone() as Arc<dyn ProviderRpc>,
            );
            workers.insert(name.to_string(), worker);
        }

        let store: Arc<dyn RawStore> = Arc::new(MemoryStore::new());
        let ctx = Ctx::new(
            store,
            Arc::new(ProviderResolver::new(Arc::new(factory))),
            Recorder::new(),
            staging.clone(),
        );

        (
            Self {
                ctx,
                staging,
                _tmp: tmp,
            },
            workers,
        )
    }

    /// Create a Provider resource and reconcile it until usable.
    pub async fn add_provider(&self, name: &str) -> Provider {
        let api: Api<Provider> = self.ctx.api();
        let provider = Provider::new(
            NS,
            name,
            ProviderSpec {
                provider_type: ProviderType::Mock,
                endpoint: format!("http://{name}:9090"),
                ..Default::default()
            },
        );
        api.create(&provider).await.expect("create provider");

        let reconciler = ProviderReconciler::new(self.ctx.clone());
        let key = ObjectKey::new(NS, name);
        for _ in 0..4 {
            reconciler.reconcile(&key).await.expect("provider reconcile");
            let current = api.get(&key).await.unwrap().unwrap();
            if current.is_usable() {
                return current;
            }
        }
        panic!("provider {name} never became usable");
    }

    pub async fn add_class(&self, name: &str, cpus: u32, memory: Quantity) -> VMClass {
        let api: Api<VMClass> = self.ctx.api();
        api.create(&VMClass::with_shape(NS, name, cpus, memory))
            .await
            .expect("create class")
    }

    pub async fn add_vm(&self, name: &str, provider: &str, class: &str) -> VirtualMachine {
        let api: Api<VirtualMachine> = self.ctx.api();
        let vm = VirtualMachine::new(
            NS,
            name,
            VirtualMachineSpec {
                provider_ref: LocalObjectRef::new(provider),
                class_ref: LocalObjectRef::new(class),
                power_state: PowerState::On,
                ..Default::default()
            },
        );
        api.create(&vm).await.expect("create vm")
    }

    pub async fn reconcile_vm(&self, name: &str) -> Action {
        let reconciler = VmReconciler::new(self.ctx.clone());
        reconciler
            .reconcile(&ObjectKey::new(NS, name))
            .await
            .expect("vm reconcile")
    }

    /// Reconcile a VM until its Ready condition is true.
    pub async fn vm_until_ready(&self, name: &str, max_passes: usize) -> VirtualMachine {
        let api: Api<VirtualMachine> = self.ctx.api();
        let key = ObjectKey::new(NS, name);
        for _ in 0..max_passes {
            self.reconcile_vm(name).await;
            let vm = api.get(&key).await.unwrap().unwrap();
            if virtrigaud_api::condition::is_condition_true(
                &vm.status.conditions,
                virtrigaud_api::ConditionType::Ready,
            ) {
                return vm;
            }
        }
        panic!("VM {name} never became Ready");
    }

    pub async fn get_vm(&self, name: &str) -> Option<VirtualMachine> {
        let api: Api<VirtualMachine> = self.ctx.api();
        api.get(&ObjectKey::new(NS, name)).await.unwrap()
    }
}

/// Condition helper re-exported for scenario assertions.
pub fn ready(vm: &VirtualMachine) -> bool {
    virtrigaud_api::condition::is_condition_true(
        &vm.status.conditions,
        virtrigaud_api::ConditionType::Ready,
    )
}

