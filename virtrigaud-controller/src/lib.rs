//! # virtrigaud Controller
//!
//! The controller manager: per-kind work queues, the shared reconciler
//! skeleton and the reconcilers for every resource kind, including the
//! cold-migration engine.

pub mod cli;
pub mod config;
pub mod context;
pub mod finalizer;
pub mod http_server;
pub mod manager;
pub mod queue;
pub mod reconcile;
pub mod requeue;

pub use context::Ctx;
pub use manager::ControllerManager;
