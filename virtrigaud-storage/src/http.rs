//! HTTP(S) staging driver.
//!
//! Talks to a plain HTTP object endpoint with optional bearer-token auth.
//! The object checksum is carried in an `x-staging-checksum-sha256` header
//! on upload and read back from the same header on metadata queries.
//! Network errors retry on a linear 2s-per-attempt schedule before being
//! propagated.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Body, Response, StatusCode};
use sha2::Digest;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use reader_stream::ReaderStream;

use crate::error::{Result, StorageError};
use crate::io::{copy_with_checksum, sha256_hex};
use crate::retry::{self, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE};
use crate::url::StagingUrl;
use crate::{
    DownloadRequest, DownloadResponse, StagingMetadata, StagingStore, TransferDest,
    TransferSource, UploadRequest, UploadResponse,
};

/// Checksum header used on upload and metadata queries.
pub const CHECKSUM_HEADER: &str = "x-staging-checksum-sha256";

pub(crate) mod reader_stream {
    //! File-to-stream adapter for streamed request bodies.

    use bytes::Bytes;
    use futures::Stream;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};

    pub struct ReaderStream<R> {
        reader: R,
        buf_size: usize,
    }

    impl<R: AsyncRead + Unpin> ReaderStream<R> {
        pub fn new(reader: R) -> Self {
            Self {
                reader,
                buf_size: 256 * 1024,
            }
        }
    }

    impl<R: AsyncRead + Unpin> Stream for ReaderStream<R> {
        type Item = std::io::Result<Bytes>;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            let this = self.get_mut();
            let mut buf = vec![0u8; this.buf_size];
            let mut read_buf = ReadBuf::new(&mut buf);
            match Pin::new(&mut this.reader).poll_read(cx, &mut read_buf) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
                Poll::Ready(Ok(())) => {
                    let n = read_buf.filled().len();
                    if n == 0 {
                        Poll::Ready(None)
                    } else {
                        buf.truncate(n);
                        Poll::Ready(Some(Ok(Bytes::from(buf))))
                    }
                }
            }
        }
    }
}

/// Replayable upload body: file and memory sources can be retried,
/// one-shot readers cannot.
enum UploadBody {
    File { path: PathBuf, size: u64, checksum: String },
    Mem { bytes: Bytes, checksum: String },
}

/// HTTP staging driver.
pub struct HttpDriver {
    client: reqwest::Client,
    bearer_token: Option<String>,
    base_url: String,
    max_retries: u32,
    retry_base: Duration,
}

impl HttpDriver {
    pub fn new(base_url: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            bearer_token,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base: DEFAULT_RETRY_BASE,
        }
    }

    /// Shrink the retry schedule; used by tests.
    pub fn with_retry_schedule(mut self, max_retries: u32, base: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base = base;
        self
    }

    fn check_http_url(&self, url: &str) -> Result<()> {
        match StagingUrl::parse(url)? {
            StagingUrl::Http { .. } => Ok(()),
            _ => Err(StorageError::InvalidUrl(url.to_string())),
        }
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn map_status(url: &str, status: StatusCode) -> Option<StorageError> {
        if status.is_success() {
            None
        } else if status == StatusCode::NOT_FOUND {
            Some(StorageError::NotFound(url.to_string()))
        } else if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
            Some(StorageError::PermissionDenied(url.to_string()))
        } else if status.is_server_error() {
            Some(StorageError::Network(format!("{url}: HTTP {status}")))
        } else {
            Some(StorageError::Other(format!("{url}: HTTP {status}")))
        }
    }

    async fn send_checked(&self, url: &str, req: reqwest::RequestBuilder) -> Result<Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| StorageError::Network(e.to_string()))?;
        match Self::map_status(url, resp.status()) {
            None => Ok(resp),
            Some(err) => Err(err),
        }
    }

    /// Run `attempt` with the driver's retry schedule.
    async fn with_retries<F, Fut, T>(&self, attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        retry::with_retries(self.max_retries, self.retry_base, attempt).await
    }

    async fn prepare_body(source: TransferSource) -> Result<UploadBody> {
        match source {
            TransferSource::Bytes(bytes) => {
                let checksum = sha256_hex(&bytes);
                Ok(UploadBody::Mem { bytes, checksum })
            }
            TransferSource::Path(path) => {
                // First pass hashes the file; the body streams it afterwards.
                let file = tokio::fs::File::open(&path).await?;
                let (size, checksum) =
                    copy_with_checksum(file, tokio::io::sink(), None, None).await?;
                Ok(UploadBody::File { path, size, checksum })
            }
            TransferSource::Reader { reader, .. } => {
                // One-shot readers are buffered so the checksum is known
                // before any byte leaves the process.
                let mut buf = Vec::new();
                let (_, checksum) = copy_with_checksum(reader, &mut buf, None, None).await?;
                Ok(UploadBody::Mem {
                    bytes: Bytes::from(buf),
                    checksum,
                })
            }
        }
    }
}

#[async_trait::async_trait]
impl StagingStore for HttpDriver {
    #[instrument(skip(self, req), fields(url = %req.url))]
    async fn upload(&self, req: UploadRequest) -> Result<UploadResponse> {
        self.check_http_url(&req.url)?;
        let body = Self::prepare_body(req.source).await?;

        let (size_bytes, checksum) = match &body {
            UploadBody::File { size, checksum, .. } => (*size, checksum.clone()),
            UploadBody::Mem { bytes, checksum } => (bytes.len() as u64, checksum.clone()),
        };

        if let Some(expected) = &req.expected_checksum {
            if *expected != checksum {
                return Err(StorageError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual: checksum,
                });
            }
        }

        let url = req.url.clone();
        self.with_retries(|| {
            let url = url.clone();
            let checksum = checksum.clone();
            let body = match &body {
                UploadBody::Mem { bytes, .. } => Ok(Body::from(bytes.clone())),
                UploadBody::File { path, .. } => Err(path.clone()),
            };
            async move {
                let body = match body {
                    Ok(body) => body,
                    Err(path) => {
                        let file = tokio::fs::File::open(&path).await?;
                        Body::wrap_stream(ReaderStream::new(file))
                    }
                };
                let request = self
                    .apply_auth(self.client.put(&url))
                    .header(CHECKSUM_HEADER, &checksum)
                    .body(body);
                self.send_checked(&url, request).await.map(|_| ())
            }
        })
        .await?;

        if let Some(cb) = &req.progress {
            cb(size_bytes, Some(size_bytes));
        }

        debug!(size_bytes, checksum = %checksum, "HTTP upload complete");
        Ok(UploadResponse {
            url: req.url,
            size_bytes,
            checksum,
        })
    }

    #[instrument(skip(self, req), fields(url = %req.url))]
    async fn download(&self, req: DownloadRequest) -> Result<DownloadResponse> {
        self.check_http_url(&req.url)?;

        let resp = self
            .with_retries(|| {
                let request = self.apply_auth(self.client.get(&req.url));
                let url = req.url.clone();
                async move { self.send_checked(&url, request).await }
            })
            .await?;

        let total = resp.content_length();
        let mut stream = resp.bytes_stream();

        let mut hasher = sha2::Sha256::new();
        let mut transferred: u64 = 0;
        let mut writer: Box<dyn tokio::io::AsyncWrite + Send + Unpin> = match req.dest {
            TransferDest::Path(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                Box::new(tokio::fs::File::create(&path).await?)
            }
            TransferDest::Writer(w) => w,
        };

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| StorageError::Network(e.to_string()))?;
            hasher.update(&chunk);
            writer.write_all(&chunk).await?;
            transferred += chunk.len() as u64;
            if let Some(cb) = &req.progress {
                cb(transferred, total);
            }
        }
        writer.flush().await?;

        Ok(DownloadResponse {
            size_bytes: transferred,
            checksum: hex::encode(hasher.finalize()),
        })
    }

    async fn delete(&self, url: &str) -> Result<()> {
        self.check_http_url(url)?;
        self.with_retries(|| {
            let request = self.apply_auth(self.client.delete(url));
            async move { self.send_checked(url, request).await.map(|_| ()) }
        })
        .await
    }

    async fn get_metadata(&self, url: &str) -> Result<StagingMetadata> {
        self.check_http_url(url)?;
        let resp = self
            .with_retries(|| {
                let request = self.apply_auth(self.client.head(url));
                async move { self.send_checked(url, request).await }
            })
            .await?;

        let checksum = resp
            .headers()
            .get(CHECKSUM_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        Ok(StagingMetadata {
            size_bytes: resp.content_length().unwrap_or(0),
            checksum,
            tags: Default::default(),
        })
    }

    fn validate_url(&self, url: &str) -> Result<()> {
        self.check_http_url(url)?;
        if !url.starts_with(&self.base_url) {
            return Err(StorageError::InvalidUrl(format!(
                "{url} is outside base {}",
                self.base_url
            )));
        }
        Ok(())
    }

    fn object_url(&self, object_path: &str) -> String {
        format!("{}/{}", self.base_url, object_path.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_and_validation() {
        let driver = HttpDriver::new("https://store.example.com/staging/", None);
        let url = driver.object_url("default/m1/disk0.qcow2");
        assert_eq!(url, "https://store.example.com/staging/default/m1/disk0.qcow2");
        driver.validate_url(&url).unwrap();
        assert!(driver.validate_url("https://elsewhere.example.com/x").is_err());
        assert!(driver.validate_url("pvc://claim/x").is_err());
    }
}
