//! Filesystem-backed storage core shared by the PVC and NFS drivers.
//!
//! Objects live under a fixed root. Writes go to a temporary sibling and
//! are renamed into place on close, so a partially written object is never
//! observable by the peer worker sharing the mount. Checksum and user tags
//! are persisted in a `<object>.metadata` sidecar so they survive restarts.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tokio::io::BufWriter;
use tracing::{debug, instrument, warn};

use crate::error::{Result, StorageError};
use crate::io::copy_with_checksum;
use crate::{
    DownloadResponse, ProgressFn, StagingMetadata, TransferDest, TransferSource, UploadResponse,
};

/// Sidecar suffix.
const METADATA_SUFFIX: &str = ".metadata";

/// Filesystem backend rooted at a mount point.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative object path under the root.
    ///
    /// Absolute paths and parent-directory traversal segments are rejected.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let rel_path = Path::new(rel);
        if rel_path.is_absolute() {
            return Err(StorageError::InvalidUrl(rel.to_string()));
        }
        for component in rel_path.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(StorageError::InvalidUrl(rel.to_string())),
            }
        }
        Ok(self.root.join(rel_path))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut s = path.as_os_str().to_os_string();
        s.push(METADATA_SUFFIX);
        PathBuf::from(s)
    }

    fn tmp_sibling(path: &Path) -> PathBuf {
        let mut s = path.as_os_str().to_os_string();
        s.push(".tmp");
        PathBuf::from(s)
    }

    #[instrument(skip(self, source, tags, progress), fields(rel = %rel))]
    pub async fn write(
        &self,
        rel: &str,
        source: TransferSource,
        expected_checksum: Option<&str>,
        tags: &BTreeMap<String, String>,
        progress: Option<&ProgressFn>,
    ) -> Result<UploadResponse> {
        let path = self.resolve(rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = Self::tmp_sibling(&path);
        let file = fs::File::create(&tmp).await?;
        let mut writer = BufWriter::new(file);

        let copy_result = match source {
            TransferSource::Path(src) => {
                let total = fs::metadata(&src).await?.len();
                let reader = fs::File::open(&src).await?;
                copy_with_checksum(reader, &mut writer, Some(total), progress).await
            }
            TransferSource::Bytes(bytes) => {
                let total = bytes.len() as u64;
                copy_with_checksum(&bytes[..], &mut writer, Some(total), progress).await
            }
            TransferSource::Reader { reader, size_hint } => {
                copy_with_checksum(reader, &mut writer, size_hint, progress).await
            }
        };

        let (size_bytes, checksum) = match copy_result {
            Ok(ok) => ok,
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                return Err(e);
            }
        };

        if let Some(expected) = expected_checksum {
            if expected != checksum {
                let _ = fs::remove_file(&tmp).await;
                return Err(StorageError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual: checksum,
                });
            }
        }

        let file = writer.into_inner();
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;

        self.write_sidecar(&path, size_bytes, &checksum, tags).await?;

        debug!(size_bytes, checksum = %checksum, "object written");
        Ok(UploadResponse {
            url: String::new(),
            size_bytes,
            checksum,
        })
    }

    async fn write_sidecar(
        &self,
        path: &Path,
        size_bytes: u64,
        checksum: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut content = format!("checksum={}\nsize={}\n", checksum, size_bytes);
        for (k, v) in tags {
            content.push_str(&format!("tag.{}={}\n", k, v));
        }

        let sidecar = Self::sidecar_path(path);
        let tmp = Self::tmp_sibling(&sidecar);
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &sidecar).await?;
        Ok(())
    }

    #[instrument(skip(self, dest, progress), fields(rel = %rel))]
    pub async fn read(
        &self,
        rel: &str,
        dest: TransferDest,
        progress: Option<&ProgressFn>,
    ) -> Result<DownloadResponse> {
        let path = self.resolve(rel)?;
        if !fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(rel.to_string()));
        }

        let total = fs::metadata(&path).await?.len();
        let reader = fs::File::open(&path).await?;

        let (size_bytes, checksum) = match dest {
            TransferDest::Path(dest_path) => {
                if let Some(parent) = dest_path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                let mut writer = BufWriter::new(fs::File::create(&dest_path).await?);
                copy_with_checksum(reader, &mut writer, Some(total), progress).await?
            }
            TransferDest::Writer(mut writer) => {
                copy_with_checksum(reader, &mut writer, Some(total), progress).await?
            }
        };

        Ok(DownloadResponse {
            size_bytes,
            checksum,
        })
    }

    pub async fn delete(&self, rel: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        if !fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(rel.to_string()));
        }
        fs::remove_file(&path).await?;

        let sidecar = Self::sidecar_path(&path);
        if let Err(e) = fs::remove_file(&sidecar).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "failed to remove metadata sidecar");
            }
        }
        debug!(rel, "object deleted");
        Ok(())
    }

    pub async fn metadata(&self, rel: &str) -> Result<StagingMetadata> {
        let path = self.resolve(rel)?;
        if !fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(rel.to_string()));
        }
        let size_bytes = fs::metadata(&path).await?.len();

        let mut meta = StagingMetadata {
            size_bytes,
            ..Default::default()
        };

        let sidecar = Self::sidecar_path(&path);
        match fs::read_to_string(&sidecar).await {
            Ok(content) => {
                for line in content.lines() {
                    let Some((key, value)) = line.split_once('=') else {
                        continue;
                    };
                    match key {
                        "checksum" => meta.checksum = Some(value.to_string()),
                        "size" => {}
                        _ => {
                            if let Some(tag) = key.strip_prefix("tag.") {
                                meta.tags.insert(tag.to_string(), value.to_string());
                            }
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn backend() -> (tempfile::TempDir, FileBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path());
        (dir, backend)
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let (_dir, backend) = backend();
        assert!(backend.resolve("a/b/c.qcow2").is_ok());
        assert!(backend.resolve("../escape").is_err());
        assert!(backend.resolve("a/../../escape").is_err());
        assert!(backend.resolve("/absolute").is_err());
    }

    #[tokio::test]
    async fn test_write_read_roundtrip_with_sidecar() {
        let (_dir, backend) = backend();
        let data = Bytes::from_static(b"disk image content");

        let mut tags = BTreeMap::new();
        tags.insert("migration".to_string(), "default/m1".to_string());

        let up = backend
            .write("m1/disk0.qcow2", TransferSource::Bytes(data.clone()), None, &tags, None)
            .await
            .unwrap();
        assert_eq!(up.size_bytes, data.len() as u64);

        let meta = backend.metadata("m1/disk0.qcow2").await.unwrap();
        assert_eq!(meta.checksum.as_deref(), Some(up.checksum.as_str()));
        assert_eq!(meta.tags["migration"], "default/m1");

        let out_path = _dir.path().join("out/disk0.qcow2");
        let down = backend
            .read("m1/disk0.qcow2", TransferDest::Path(out_path.clone()), None)
            .await
            .unwrap();
        assert_eq!(down.checksum, up.checksum);
        assert_eq!(std::fs::read(&out_path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_write_rejects_checksum_mismatch() {
        let (dir, backend) = backend();
        let err = backend
            .write(
                "m1/disk0.qcow2",
                TransferSource::Bytes(Bytes::from_static(b"payload")),
                Some("deadbeef"),
                &BTreeMap::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ChecksumMismatch { .. }));

        // Neither the object nor its temporary sibling may remain.
        assert!(!dir.path().join("m1/disk0.qcow2").exists());
        assert!(!dir.path().join("m1/disk0.qcow2.tmp").exists());
    }

    #[tokio::test]
    async fn test_delete_then_not_found() {
        let (_dir, backend) = backend();
        backend
            .write(
                "m1/disk0.qcow2",
                TransferSource::Bytes(Bytes::from_static(b"x")),
                None,
                &BTreeMap::new(),
                None,
            )
            .await
            .unwrap();

        backend.delete("m1/disk0.qcow2").await.unwrap();
        assert!(backend.delete("m1/disk0.qcow2").await.unwrap_err().is_not_found());
        assert!(backend.metadata("m1/disk0.qcow2").await.unwrap_err().is_not_found());
    }
}
