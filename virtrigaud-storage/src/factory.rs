//! Driver construction from a staging configuration.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Result, StorageError};
use crate::http::HttpDriver;
use crate::nfs::NfsDriver;
use crate::pvc::{PvcDriver, DEFAULT_PVC_MOUNT_BASE};
use crate::s3::{S3Config, S3Driver};
use crate::url::StagingUrl;
use crate::StagingStore;

/// Default mount point for NFS staging shares.
pub const DEFAULT_NFS_MOUNT_BASE: &str = "/var/lib/virtrigaud/nfs-staging";

/// Resolved staging configuration, one variant per channel.
#[derive(Debug, Clone)]
pub enum StagingConfig {
    S3(S3Config),
    Http {
        base_url: String,
        bearer_token: Option<String>,
    },
    Nfs,
    Pvc {
        claim: String,
    },
}

/// Builds staging drivers. Filesystem-backed drivers are rooted under the
/// factory's mount bases, so two factories with the same bases address the
/// same objects.
#[derive(Debug, Clone)]
pub struct StagingFactory {
    pvc_mount_base: PathBuf,
    nfs_mount_base: PathBuf,
}

impl StagingFactory {
    pub fn new(pvc_mount_base: impl Into<PathBuf>, nfs_mount_base: impl Into<PathBuf>) -> Self {
        Self {
            pvc_mount_base: pvc_mount_base.into(),
            nfs_mount_base: nfs_mount_base.into(),
        }
    }

    pub fn driver(&self, config: &StagingConfig) -> Result<Arc<dyn StagingStore>> {
        Ok(match config {
            StagingConfig::S3(s3) => Arc::new(S3Driver::new(s3.clone())),
            StagingConfig::Http {
                base_url,
                bearer_token,
            } => Arc::new(HttpDriver::new(base_url.clone(), bearer_token.clone())),
            StagingConfig::Nfs => Arc::new(NfsDriver::new(self.nfs_mount_base.clone())),
            StagingConfig::Pvc { claim } => {
                Arc::new(PvcDriver::new(self.pvc_mount_base.clone(), claim.clone()))
            }
        })
    }

    /// Build a driver from a staging URL alone. Only the filesystem-backed
    /// schemes carry enough information in the URL; HTTP and S3 need the
    /// full configuration with credentials.
    pub fn driver_for_url(&self, url: &str) -> Result<Arc<dyn StagingStore>> {
        match StagingUrl::parse(url)? {
            StagingUrl::Pvc { claim, .. } => self.driver(&StagingConfig::Pvc { claim }),
            StagingUrl::Nfs { .. } => self.driver(&StagingConfig::Nfs),
            other => Err(StorageError::InvalidUrl(format!(
                "{} URLs need a full staging configuration with credentials",
                other.scheme()
            ))),
        }
    }
}

impl Default for StagingFactory {
    fn default() -> Self {
        Self::new(DEFAULT_PVC_MOUNT_BASE, DEFAULT_NFS_MOUNT_BASE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_for_url_handles_filesystem_schemes() {
        let dir = tempfile::tempdir().unwrap();
        let factory = StagingFactory::new(dir.path().join("pvc"), dir.path().join("nfs"));

        assert!(factory.driver_for_url("pvc://claim-a/m1/disk0").is_ok());
        assert!(factory.driver_for_url("nfs://m1/disk0").is_ok());
        assert!(factory.driver_for_url("s3://bucket/key").is_err());
    }

    #[tokio::test]
    async fn test_two_factories_share_objects() {
        let dir = tempfile::tempdir().unwrap();
        let a = StagingFactory::new(dir.path().join("pvc"), dir.path().join("nfs"));
        let b = a.clone();

        let writer = a.driver_for_url("pvc://claim/m1/disk0").unwrap();
        writer
            .upload(crate::UploadRequest::new(
                "pvc://claim/m1/disk0",
                crate::TransferSource::Bytes(bytes::Bytes::from_static(b"shared")),
            ))
            .await
            .unwrap();

        let reader = b.driver_for_url("pvc://claim/m1/disk0").unwrap();
        let meta = reader.get_metadata("pvc://claim/m1/disk0").await.unwrap();
        assert_eq!(meta.size_bytes, 6);
    }
}
