//! The shared reconciler skeleton.
//!
//! Every controller implements [`Reconciler`]: load the object, run the
//! finalizer path on deletion, ensure the finalizer, resolve dependencies,
//! poll any parked task, converge the one attribute it owns, write status
//! atomically and pick the next requeue interval. Errors that are expected
//! to self-heal come back as `RequeueAfter`; a hard error makes the work
//! queue apply its own exponential back-off.

pub mod clone;
pub mod image;
pub mod migration;
pub mod provider;
pub mod set;
pub mod snapshot;
pub mod vm;

use std::time::Duration;

use async_trait::async_trait;

use virtrigaud_api::ObjectKey;

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing more to do until the object changes.
    Done,
    /// Run again after the interval; zero means immediately.
    RequeueAfter(Duration),
}

impl Action {
    pub fn requeue_now() -> Self {
        Action::RequeueAfter(Duration::ZERO)
    }
}

pub type ReconcileResult = anyhow::Result<Action>;

/// One controller, owning one resource kind.
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn reconcile(&self, key: &ObjectKey) -> ReconcileResult;
}
