//! S3-compatible staging driver.
//!
//! Objects are addressed as `s3://bucket/key` and served through an
//! S3-compatible HTTP endpoint with path-style addressing. Requests are
//! SigV4-signed; streamed bodies use the unsigned-payload sentinel. The
//! object checksum is stored as `x-amz-meta-checksum-sha256` user metadata
//! so it survives across workers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use reqwest::{Body, Response, StatusCode};
use sha2::Digest;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::error::{Result, StorageError};
use crate::http::reader_stream::ReaderStream;
use crate::io::{copy_with_checksum, sha256_hex};
use crate::retry::{self, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE};
use crate::sign::{SigV4Signer, UNSIGNED_PAYLOAD};
use crate::url::StagingUrl;
use crate::{
    DownloadRequest, DownloadResponse, StagingMetadata, StagingStore, TransferDest,
    TransferSource, UploadRequest, UploadResponse,
};

/// User-metadata header carrying the object checksum.
pub const CHECKSUM_META_HEADER: &str = "x-amz-meta-checksum-sha256";

/// SHA-256 of the empty string, used as the payload hash of bodyless
/// requests.
const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// S3 driver configuration.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Endpoint base, e.g. `https://minio.example.com`.
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

enum UploadBody {
    File { path: PathBuf, size: u64, checksum: String },
    Mem { bytes: Bytes, checksum: String },
}

/// S3-compatible staging driver.
pub struct S3Driver {
    client: reqwest::Client,
    config: S3Config,
    signer: SigV4Signer,
    max_retries: u32,
    retry_base: Duration,
}

impl S3Driver {
    pub fn new(config: S3Config) -> Self {
        let signer = SigV4Signer::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            config.region.clone(),
        );
        Self {
            client: reqwest::Client::new(),
            config,
            signer,
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

    fn key_of(&self, url: &str) -> Result<String> {
        match StagingUrl::parse(url)? {
            StagingUrl::S3 { bucket, key } if bucket == self.config.bucket => Ok(key),
            StagingUrl::S3 { bucket, .. } => Err(StorageError::InvalidUrl(format!(
                "URL targets bucket {bucket:?}, driver serves {:?}",
                self.config.bucket
            ))),
            _ => Err(StorageError::InvalidUrl(url.to_string())),
        }
    }

    /// Canonical URI path for a key; each segment percent-encoded.
    fn canonical_path(&self, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("/{}/{}", self.config.bucket, encoded.join("/"))
    }

    fn host(&self) -> String {
        self.config
            .endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string()
    }

    fn request_url(&self, key: &str) -> String {
        format!(
            "{}{}",
            self.config.endpoint.trim_end_matches('/'),
            self.canonical_path(key)
        )
    }

    /// Build a signed request with the given extra headers.
    fn signed(
        &self,
        method: reqwest::Method,
        key: &str,
        payload_hash: &str,
        extra_headers: &BTreeMap<String, String>,
    ) -> reqwest::RequestBuilder {
        let mut headers = extra_headers.clone();
        headers.insert("host".to_string(), self.host());

        let signed_headers = self.signer.sign(
            method.as_str(),
            &self.canonical_path(key),
            "",
            &headers,
            payload_hash,
            Utc::now(),
        );

        let mut req = self.client.request(method, self.request_url(key));
        for (k, v) in extra_headers.iter().chain(signed_headers.iter()) {
            req = req.header(k, v);
        }
        req
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

    async fn prepare_body(source: TransferSource) -> Result<UploadBody> {
        match source {
            TransferSource::Bytes(bytes) => {
                let checksum = sha256_hex(&bytes);
                Ok(UploadBody::Mem { bytes, checksum })
            }
            TransferSource::Path(path) => {
                let file = tokio::fs::File::open(&path).await?;
                let (size, checksum) =
                    copy_with_checksum(file, tokio::io::sink(), None, None).await?;
                Ok(UploadBody::File { path, size, checksum })
            }
            TransferSource::Reader { reader, .. } => {
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
impl StagingStore for S3Driver {
    #[instrument(skip(self, req), fields(url = %req.url))]
    async fn upload(&self, req: UploadRequest) -> Result<UploadResponse> {
        let key = self.key_of(&req.url)?;
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

        let mut meta_headers = BTreeMap::new();
        meta_headers.insert(CHECKSUM_META_HEADER.to_string(), checksum.clone());
        for (k, v) in &req.tags {
            meta_headers.insert(format!("x-amz-meta-tag-{}", k), v.clone());
        }

        retry::with_retries(self.max_retries, self.retry_base, || {
            let key = key.clone();
            let meta_headers = meta_headers.clone();
            let body_parts = match &body {
                UploadBody::Mem { bytes, checksum } => Ok((bytes.clone(), checksum.clone())),
                UploadBody::File { path, .. } => Err(path.clone()),
            };
            async move {
                let (request_body, payload_hash) = match body_parts {
                    Ok((bytes, checksum)) => (Body::from(bytes), checksum),
                    Err(path) => {
                        let file = tokio::fs::File::open(&path).await?;
                        (
                            Body::wrap_stream(ReaderStream::new(file)),
                            UNSIGNED_PAYLOAD.to_string(),
                        )
                    }
                };
                let request = self
                    .signed(reqwest::Method::PUT, &key, &payload_hash, &meta_headers)
                    .body(request_body);
                self.send_checked(&self.request_url(&key), request)
                    .await
                    .map(|_| ())
            }
        })
        .await?;

        if let Some(cb) = &req.progress {
            cb(size_bytes, Some(size_bytes));
        }

        debug!(size_bytes, checksum = %checksum, "S3 upload complete");
        Ok(UploadResponse {
            url: req.url,
            size_bytes,
            checksum,
        })
    }

    #[instrument(skip(self, req), fields(url = %req.url))]
    async fn download(&self, req: DownloadRequest) -> Result<DownloadResponse> {
        let key = self.key_of(&req.url)?;

        let resp = retry::with_retries(self.max_retries, self.retry_base, || {
            let request = self.signed(reqwest::Method::GET, &key, EMPTY_SHA256, &BTreeMap::new());
            let url = self.request_url(&key);
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
        let key = self.key_of(url)?;
        retry::with_retries(self.max_retries, self.retry_base, || {
            let request =
                self.signed(reqwest::Method::DELETE, &key, EMPTY_SHA256, &BTreeMap::new());
            let url = self.request_url(&key);
            async move { self.send_checked(&url, request).await.map(|_| ()) }
        })
        .await
    }

    async fn get_metadata(&self, url: &str) -> Result<StagingMetadata> {
        let key = self.key_of(url)?;
        let resp = retry::with_retries(self.max_retries, self.retry_base, || {
            let request = self.signed(reqwest::Method::HEAD, &key, EMPTY_SHA256, &BTreeMap::new());
            let url = self.request_url(&key);
            async move { self.send_checked(&url, request).await }
        })
        .await?;

        let checksum = resp
            .headers()
            .get(CHECKSUM_META_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut tags = BTreeMap::new();
        for (name, value) in resp.headers() {
            if let Some(tag) = name.as_str().strip_prefix("x-amz-meta-tag-") {
                if let Ok(v) = value.to_str() {
                    tags.insert(tag.to_string(), v.to_string());
                }
            }
        }

        Ok(StagingMetadata {
            size_bytes: resp.content_length().unwrap_or(0),
            checksum,
            tags,
        })
    }

    fn validate_url(&self, url: &str) -> Result<()> {
        self.key_of(url).map(|_| ())
    }

    fn object_url(&self, object_path: &str) -> String {
        format!(
            "s3://{}/{}",
            self.config.bucket,
            object_path.trim_start_matches('/')
        )
    }
}
