//! Persistent-volume staging driver.
//!
//! Objects are addressed as `pvc://<claim>/<path>` and live under a fixed
//! mount point shared by the source and target provider workers. The
//! workers coordinate implicitly through the write-rename atomicity of the
//! file backend.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::{Result, StorageError};
use crate::file::FileBackend;
use crate::url::StagingUrl;
use crate::{
    DownloadRequest, DownloadResponse, StagingMetadata, StagingStore, UploadRequest,
    UploadResponse,
};

/// Default mount point for staging claims.
pub const DEFAULT_PVC_MOUNT_BASE: &str = "/var/lib/virtrigaud/staging";

/// Staging driver over one persistent volume claim.
pub struct PvcDriver {
    claim: String,
    backend: FileBackend,
}

impl PvcDriver {
    /// Create a driver for `claim`, mounted under `mount_base/<claim>`.
    pub fn new(mount_base: impl Into<PathBuf>, claim: impl Into<String>) -> Self {
        let claim = claim.into();
        let backend = FileBackend::new(mount_base.into().join(&claim));
        Self { claim, backend }
    }

    fn rel_path(&self, url: &str) -> Result<String> {
        match StagingUrl::parse(url)? {
            StagingUrl::Pvc { claim, path } if claim == self.claim => Ok(path),
            StagingUrl::Pvc { claim, .. } => Err(StorageError::InvalidUrl(format!(
                "URL targets claim {claim:?}, driver serves {:?}",
                self.claim
            ))),
            _ => Err(StorageError::InvalidUrl(url.to_string())),
        }
    }
}

#[async_trait]
impl StagingStore for PvcDriver {
    async fn upload(&self, req: UploadRequest) -> Result<UploadResponse> {
        let rel = self.rel_path(&req.url)?;
        let mut resp = self
            .backend
            .write(
                &rel,
                req.source,
                req.expected_checksum.as_deref(),
                &req.tags,
                req.progress.as_ref(),
            )
            .await?;
        resp.url = req.url;
        Ok(resp)
    }

    async fn download(&self, req: DownloadRequest) -> Result<DownloadResponse> {
        let rel = self.rel_path(&req.url)?;
        self.backend.read(&rel, req.dest, req.progress.as_ref()).await
    }

    async fn delete(&self, url: &str) -> Result<()> {
        let rel = self.rel_path(url)?;
        self.backend.delete(&rel).await
    }

    async fn get_metadata(&self, url: &str) -> Result<StagingMetadata> {
        let rel = self.rel_path(url)?;
        self.backend.metadata(&rel).await
    }

    fn validate_url(&self, url: &str) -> Result<()> {
        let rel = self.rel_path(url)?;
        self.backend.resolve(&rel).map(|_| ())
    }

    fn object_url(&self, object_path: &str) -> String {
        format!("pvc://{}/{}", self.claim, object_path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::TransferSource;

    #[tokio::test]
    async fn test_upload_download_delete_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PvcDriver::new(dir.path(), "vmmig-m1-staging");

        let url = driver.object_url("default/m1/disk0.qcow2");
        assert_eq!(url, "pvc://vmmig-m1-staging/default/m1/disk0.qcow2");
        driver.validate_url(&url).unwrap();

        let up = driver
            .upload(UploadRequest::new(
                &url,
                TransferSource::Bytes(Bytes::from_static(b"qcow2 bytes")),
            ))
            .await
            .unwrap();

        let meta = driver.get_metadata(&url).await.unwrap();
        assert_eq!(meta.checksum.as_deref(), Some(up.checksum.as_str()));

        driver.delete(&url).await.unwrap();
        assert!(driver.get_metadata(&url).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rejects_foreign_claim_and_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let driver = PvcDriver::new(dir.path(), "claim-a");

        assert!(driver.validate_url("pvc://claim-b/path").is_err());
        assert!(driver.validate_url("pvc://claim-a/../escape").is_err());
        assert!(driver.validate_url("s3://bucket/key").is_err());
    }
}
