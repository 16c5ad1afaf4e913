//! # virtrigaud Storage
//!
//! The staging channel used by the migration engine to buffer disk images
//! between providers. One driver per supported URL scheme:
//!
//! - `pvc://<claim>/<path>` — cluster-managed persistent volume
//! - `nfs://<path>` — NFS share mounted by an external mounter
//! - `http(s)://host/path` — plain HTTP object endpoint, bearer auth
//! - `s3://bucket/key` — S3-compatible endpoint, SigV4-signed requests
//!
//! All drivers compute a SHA-256 checksum on the fly, report progress via a
//! callback, and (for filesystem-backed drivers) write to a temporary
//! sibling and rename on close so partial objects are never observable.

pub mod error;
pub mod factory;
pub mod file;
pub mod http;
pub mod io;
pub mod nfs;
pub mod pvc;
pub mod retry;
pub mod s3;
pub mod sign;
pub mod url;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

pub use error::{Result, StorageError};
pub use factory::{StagingConfig, StagingFactory};
pub use http::HttpDriver;
pub use nfs::NfsDriver;
pub use pvc::PvcDriver;
pub use s3::{S3Config, S3Driver};
pub use url::StagingUrl;

/// Progress callback: `(transferred_bytes, total_bytes_if_known)`.
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Where an upload reads from.
pub enum TransferSource {
    Path(PathBuf),
    Bytes(Bytes),
    Reader {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        size_hint: Option<u64>,
    },
}

/// Where a download writes to.
pub enum TransferDest {
    Path(PathBuf),
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
}

/// Upload request.
pub struct UploadRequest {
    pub url: String,
    pub source: TransferSource,
    /// When set, the upload fails with [`StorageError::ChecksumMismatch`]
    /// if the streamed content hashes differently.
    pub expected_checksum: Option<String>,
    /// User tags persisted alongside the object.
    pub tags: BTreeMap<String, String>,
    pub progress: Option<ProgressFn>,
}

impl UploadRequest {
    pub fn new(url: impl Into<String>, source: TransferSource) -> Self {
        Self {
            url: url.into(),
            source,
            expected_checksum: None,
            tags: BTreeMap::new(),
            progress: None,
        }
    }
}

/// Upload result.
#[derive(Debug, Clone)]
pub struct UploadResponse {
    pub url: String,
    pub size_bytes: u64,
    /// SHA-256, lowercase hex.
    pub checksum: String,
}

/// Download request.
pub struct DownloadRequest {
    pub url: String,
    pub dest: TransferDest,
    pub progress: Option<ProgressFn>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, dest: TransferDest) -> Self {
        Self {
            url: url.into(),
            dest,
            progress: None,
        }
    }
}

/// Download result.
#[derive(Debug, Clone)]
pub struct DownloadResponse {
    pub size_bytes: u64,
    /// SHA-256, lowercase hex.
    pub checksum: String,
}

/// Object metadata.
#[derive(Debug, Clone, Default)]
pub struct StagingMetadata {
    pub size_bytes: u64,
    /// SHA-256, lowercase hex, when known.
    pub checksum: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// The staging storage driver contract.
#[async_trait]
pub trait StagingStore: Send + Sync {
    async fn upload(&self, req: UploadRequest) -> Result<UploadResponse>;

    async fn download(&self, req: DownloadRequest) -> Result<DownloadResponse>;

    /// Delete an object. Returns [`StorageError::NotFound`] when the object
    /// does not exist, so callers can treat repeat deletes as success.
    async fn delete(&self, url: &str) -> Result<()>;

    async fn get_metadata(&self, url: &str) -> Result<StagingMetadata>;

    /// Check that a URL is well-formed and belongs to this driver.
    fn validate_url(&self, url: &str) -> Result<()>;

    /// Build the URL for an object path relative to this driver's root.
    fn object_url(&self, object_path: &str) -> String;

    /// Release held resources. Drivers without connections are a no-op.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
