//! Streaming copy with on-the-fly SHA-256 and progress reporting.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::ProgressFn;

const COPY_BUFFER_SIZE: usize = 256 * 1024;

/// Copy `reader` into `writer`, hashing every byte.
///
/// Returns `(bytes_copied, sha256_lowercase_hex)`.
pub async fn copy_with_checksum<R, W>(
    mut reader: R,
    mut writer: W,
    total: Option<u64>,
    progress: Option<&ProgressFn>,
) -> Result<(u64, String)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut transferred: u64 = 0;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n]).await?;
        transferred += n as u64;
        if let Some(cb) = progress {
            cb(transferred, total);
        }
    }
    writer.flush().await?;

    Ok((transferred, hex::encode(hasher.finalize())))
}

/// SHA-256 of a byte slice, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_copy_computes_known_checksum() {
        let data = b"hello world";
        let mut out = Vec::new();
        let (n, checksum) = copy_with_checksum(&data[..], &mut out, None, None)
            .await
            .unwrap();
        assert_eq!(n, 11);
        assert_eq!(out, data);
        assert_eq!(
            checksum,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_copy_reports_progress() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = seen.clone();
        let progress: crate::ProgressFn = Arc::new(move |transferred, total| {
            seen_clone.store(transferred, Ordering::SeqCst);
            assert_eq!(total, Some(5));
        });

        let mut out = Vec::new();
        copy_with_checksum(&b"12345"[..], &mut out, Some(5), Some(&progress))
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }
}
