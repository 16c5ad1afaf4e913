//! Controller manager: wires store watches into per-kind work queues and
//! runs worker loops over the reconcilers.
//!
//! Queues deduplicate by object key and serialise per key, so concurrent
//! updates collapse to at most one pending reconciliation per object and
//! no two workers ever hold the same key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use virtrigaud_api::{
    Object, ObjectKey, Provider, VMClone, VMImage, VMMigration, VMSet, VMSnapshot,
    VirtualMachine,
};
use virtrigaud_store::StoreEvent;

use crate::context::Ctx;
use crate::queue::WorkQueue;
use crate::reconcile::{
    clone::CloneReconciler, image::ImageReconciler, migration::MigrationReconciler,
    provider::ProviderReconciler, set::SetReconciler, snapshot::SnapshotReconciler,
    vm::VmReconciler, Action, Reconciler,
};
use crate::requeue;

/// Default worker goroutine count per kind.
const DEFAULT_WORKERS_PER_KIND: usize = 2;

struct Controller {
    reconciler: Arc<dyn Reconciler>,
    queue: WorkQueue,
}

/// Hosts one controller per resource kind.
pub struct ControllerManager {
    ctx: Arc<Ctx>,
    controllers: HashMap<&'static str, Controller>,
    workers_per_kind: usize,
}

impl ControllerManager {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        let reconcilers: Vec<Arc<dyn Reconciler>> = vec![
            Arc::new(ProviderReconciler::new(ctx.clone())),
            Arc::new(VmReconciler::new(ctx.clone())),
            Arc::new(MigrationReconciler::new(ctx.clone())),
            Arc::new(SnapshotReconciler::new(ctx.clone())),
            Arc::new(CloneReconciler::new(ctx.clone())),
            Arc::new(SetReconciler::new(ctx.clone())),
            Arc::new(ImageReconciler::new(ctx.clone())),
        ];

        let controllers = reconcilers
            .into_iter()
            .map(|reconciler| {
                (
                    reconciler.kind(),
                    Controller {
                        reconciler,
                        queue: WorkQueue::new(),
                    },
                )
            })
            .collect();

        Self {
            ctx,
            controllers,
            workers_per_kind: DEFAULT_WORKERS_PER_KIND,
        }
    }

    pub fn with_workers_per_kind(mut self, workers: usize) -> Self {
        self.workers_per_kind = workers.max(1);
        self
    }

    /// Enqueue every stored object of every managed kind; used at startup
    /// so state converges without waiting for fresh events.
    async fn enqueue_existing(&self) -> anyhow::Result<()> {
        macro_rules! seed {
            ($ty:ty) => {
                if let Some(controller) = self.controllers.get(<$ty>::KIND) {
                    for obj in self.ctx.api::<$ty>().list(None).await? {
                        controller.queue.add(obj.key());
                    }
                }
            };
        }
        seed!(Provider);
        seed!(VirtualMachine);
        seed!(VMMigration);
        seed!(VMSnapshot);
        seed!(VMClone);
        seed!(VMSet);
        seed!(VMImage);
        Ok(())
    }

    /// Run until the process is stopped. Spawns the watch router and the
    /// per-kind worker pools.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        info!(
            kinds = self.controllers.len(),
            workers_per_kind = self.workers_per_kind,
            "starting controller manager"
        );

        self.enqueue_existing().await?;

        // Watch router: store events fan out to the owning kind's queue.
        {
            let manager = self.clone();
            let mut rx = manager.ctx.store.watch();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(StoreEvent { kind, key }) => {
                            if let Some(controller) = manager.controllers.get(kind) {
                                controller.queue.add(key);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "watch stream lagged, reseeding queues");
                            if let Err(e) = manager.enqueue_existing().await {
                                warn!(error = %e, "reseed after lag failed");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        // Periodic provider-pool health validation.
        {
            let resolver = self.ctx.resolver.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
                loop {
                    ticker.tick().await;
                    let failures = resolver.validate_all().await;
                    for (provider, error) in failures {
                        debug!(provider = %provider, error = %error, "pooled client failed validation");
                    }
                }
            });
        }

        let mut workers = Vec::new();
        for (kind, controller) in &self.controllers {
            for worker_idx in 0..self.workers_per_kind {
                let queue = controller.queue.clone();
                let reconciler = controller.reconciler.clone();
                let kind = *kind;
                workers.push(tokio::spawn(async move {
                    worker_loop(kind, worker_idx, queue, reconciler).await;
                }));
            }
        }

        for worker in workers {
            let _ = worker.await;
        }
        Ok(())
    }

    /// Stop accepting work; workers exit once drained.
    pub fn shutdown(&self) {
        for controller in self.controllers.values() {
            controller.queue.shutdown();
        }
    }

    /// Queue depth per kind, for the readiness endpoint.
    pub fn queue_depths(&self) -> HashMap<&'static str, usize> {
        self.controllers
            .iter()
            .map(|(kind, c)| (*kind, c.queue.len()))
            .collect()
    }
}

async fn worker_loop(
    kind: &'static str,
    worker_idx: usize,
    queue: WorkQueue,
    reconciler: Arc<dyn Reconciler>,
) {
    debug!(kind, worker = worker_idx, "worker started");
    let failures: Mutex<HashMap<ObjectKey, u32>> = Mutex::new(HashMap::new());

    while let Some(key) = queue.next().await {
        let result = reconciler.reconcile(&key).await;
        match result {
            Ok(Action::Done) => {
                failures.lock().unwrap().remove(&key);
            }
            Ok(Action::RequeueAfter(delay)) => {
                failures.lock().unwrap().remove(&key);
                queue.add_after(key.clone(), delay);
            }
            Err(e) => {
                let attempts = {
                    let mut failures = failures.lock().unwrap();
                    let entry = failures.entry(key.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                let delay = requeue::error_backoff(attempts - 1);
                warn!(
                    kind,
                    object = %key,
                    error = %e,
                    attempts,
                    delay_secs = delay.as_secs(),
                    "reconcile error, backing off"
                );
                queue.add_after(key.clone(), delay);
            }
        }
        queue.done(&key);
    }
    debug!(kind, worker = worker_idx, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use virtrigaud_provider::{ProviderResolver, StaticClientFactory};
    use virtrigaud_store::{MemoryStore, RawStore, Recorder};
    use virtrigaud_storage::StagingFactory;

    fn test_ctx() -> Arc<Ctx> {
        let store: Arc<dyn RawStore> = Arc::new(MemoryStore::new());
        Ctx::new(
            store,
            Arc::new(ProviderResolver::new(Arc::new(StaticClientFactory::new()))),
            Recorder::new(),
            StagingFactory::new("/tmp/virtrigaud-test/pvc", "/tmp/virtrigaud-test/nfs"),
        )
    }

    #[test]
    fn test_manager_hosts_all_kinds() {
        let manager = ControllerManager::new(test_ctx());
        let depths = manager.queue_depths();
        for kind in [
            "Provider",
            "VirtualMachine",
            "VMMigration",
            "VMSnapshot",
            "VMClone",
            "VMSet",
            "VMImage",
        ] {
            assert!(depths.contains_key(kind), "missing controller for {kind}");
        }
    }
}
