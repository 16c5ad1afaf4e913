//! # virtrigaud Common
//!
//! Shared utilities for the virtrigaud controller-manager and its test
//! harnesses.
//!
//! ## Logging
//!
//! ```rust
//! virtrigaud_common::init_logging("info").unwrap();
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, TimedOperation};
