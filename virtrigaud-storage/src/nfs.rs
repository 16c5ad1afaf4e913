//! NFS staging driver.
//!
//! The share itself is mounted by an external mounter; this driver does
//! file operations under the mount root. Objects are addressed as
//! `nfs://<path>` relative to the export.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::{Result, StorageError};
use crate::file::FileBackend;
use crate::url::StagingUrl;
use crate::{
    DownloadRequest, DownloadResponse, StagingMetadata, StagingStore, UploadRequest,
    UploadResponse,
};

/// Staging driver over a mounted NFS share.
pub struct NfsDriver {
    backend: FileBackend,
}

impl NfsDriver {
    pub fn new(mount_path: impl Into<PathBuf>) -> Self {
        Self {
            backend: FileBackend::new(mount_path),
        }
    }

    fn rel_path(&self, url: &str) -> Result<String> {
        match StagingUrl::parse(url)? {
            StagingUrl::Nfs { path } => Ok(path),
            _ => Err(StorageError::InvalidUrl(url.to_string())),
        }
    }
}

#[async_trait]
impl StagingStore for NfsDriver {
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
        format!("nfs://{}", object_path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::TransferSource;

    #[tokio::test]
    async fn test_roundtrip_under_mount() {
        let dir = tempfile::tempdir().unwrap();
        let driver = NfsDriver::new(dir.path());

        let url = driver.object_url("migrations/m1/disk0.raw");
        let up = driver
            .upload(UploadRequest::new(
                &url,
                TransferSource::Bytes(Bytes::from_static(b"raw image")),
            ))
            .await
            .unwrap();

        let meta = driver.get_metadata(&url).await.unwrap();
        assert_eq!(meta.size_bytes, up.size_bytes);
        driver.delete(&url).await.unwrap();
    }
}
