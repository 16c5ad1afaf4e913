//! Staging URL parsing.

use crate::error::{Result, StorageError};

/// A parsed staging URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingUrl {
    /// `s3://bucket/key`
    S3 { bucket: String, key: String },
    /// `http://...` or `https://...`, kept whole.
    Http { url: String },
    /// `nfs://relative/path` under the mounted share.
    Nfs { path: String },
    /// `pvc://<claim>/<path>`
    Pvc { claim: String, path: String },
}

impl StagingUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = || StorageError::InvalidUrl(url.to_string());

        if let Some(rest) = url.strip_prefix("s3://") {
            let (bucket, key) = rest.split_once('/').ok_or_else(invalid)?;
            if bucket.is_empty() || key.is_empty() {
                return Err(invalid());
            }
            return Ok(StagingUrl::S3 {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(StagingUrl::Http {
                url: url.to_string(),
            });
        }

        if let Some(rest) = url.strip_prefix("nfs://") {
            if rest.is_empty() {
                return Err(invalid());
            }
            return Ok(StagingUrl::Nfs {
                path: rest.trim_start_matches('/').to_string(),
            });
        }

        if let Some(rest) = url.strip_prefix("pvc://") {
            let (claim, path) = rest.split_once('/').ok_or_else(invalid)?;
            if claim.is_empty() || path.is_empty() {
                return Err(invalid());
            }
            return Ok(StagingUrl::Pvc {
                claim: claim.to_string(),
                path: path.to_string(),
            });
        }

        Err(invalid())
    }

    /// Scheme tag for logging.
    pub fn scheme(&self) -> &'static str {
        match self {
            StagingUrl::S3 { .. } => "s3",
            StagingUrl::Http { .. } => "http",
            StagingUrl::Nfs { .. } => "nfs",
            StagingUrl::Pvc { .. } => "pvc",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3() {
        let url = StagingUrl::parse("s3://staging/migrations/m1/disk0.qcow2").unwrap();
        assert_eq!(
            url,
            StagingUrl::S3 {
                bucket: "staging".into(),
                key: "migrations/m1/disk0.qcow2".into()
            }
        );
    }

    #[test]
    fn test_parse_pvc() {
        let url = StagingUrl::parse("pvc://vmmig-m1-staging/default/m1/disk0.qcow2").unwrap();
        assert_eq!(
            url,
            StagingUrl::Pvc {
                claim: "vmmig-m1-staging".into(),
                path: "default/m1/disk0.qcow2".into()
            }
        );
    }

    #[test]
    fn test_parse_nfs_and_http() {
        assert_eq!(
            StagingUrl::parse("nfs://exports/staging/disk0.raw").unwrap(),
            StagingUrl::Nfs {
                path: "exports/staging/disk0.raw".into()
            }
        );
        assert!(matches!(
            StagingUrl::parse("https://store.example.com/disk0").unwrap(),
            StagingUrl::Http { .. }
        ));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(StagingUrl::parse("ftp://nope").is_err());
        assert!(StagingUrl::parse("s3://bucket-only").is_err());
        assert!(StagingUrl::parse("pvc://claim-only").is_err());
        assert!(StagingUrl::parse("").is_err());
    }
}
