//! # virtrigaud Provider
//!
//! The uniform RPC contract every provider worker exposes, regardless of
//! hypervisor. The controller never links hypervisor SDKs; it talks to
//! out-of-process workers through [`ProviderRpc`].
//!
//! This crate ships:
//! - the contract trait and its structured messages,
//! - [`HttpProviderClient`], the Connect-style JSON-over-HTTP client used
//!   against real workers,
//! - [`MockProvider`], an in-memory worker with fault injection for tests
//!   and development mode,
//! - [`ProviderResolver`], the per-provider client pool with health
//!   validation and eviction.

pub mod client;
pub mod error;
pub mod http;
pub mod mock;
pub mod resolver;
pub mod types;

pub use client::ProviderRpc;
pub use error::{ProviderError, Result};
pub use http::HttpProviderClient;
pub use mock::MockProvider;
pub use resolver::{ClientFactory, HttpClientFactory, ProviderIdentity, ProviderResolver, StaticClientFactory};
pub use types::*;
