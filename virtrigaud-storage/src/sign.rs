//! AWS SigV4 request signing for the S3-compatible driver.
//!
//! Implements the canonical-request / string-to-sign / derived-key chain
//! documented at
//! <https://docs.aws.amazon.com/general/latest/gr/sigv4_signing.html>.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Sentinel payload hash for streamed bodies.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// SigV4 signer for one (credentials, region, service) tuple.
pub struct SigV4Signer {
    access_key: String,
    secret_key: String,
    region: String,
    service: String,
}

impl SigV4Signer {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: region.into(),
            service: "s3".to_string(),
        }
    }

    /// Sign a request, returning the headers to attach:
    /// `x-amz-date`, `x-amz-content-sha256`, `authorization`.
    ///
    /// `headers` must already contain every header included in the
    /// signature (at minimum `host`).
    pub fn sign(
        &self,
        method: &str,
        uri_path: &str,
        query: &str,
        headers: &BTreeMap<String, String>,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, String> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        let mut all_headers: BTreeMap<String, String> = headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.trim().to_string()))
            .collect();
        all_headers.insert("x-amz-date".to_string(), amz_date.clone());
        all_headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());

        let signed_header_names = all_headers
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers = all_headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect::<String>();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, uri_path, query, canonical_headers, signed_header_names, payload_hash
        );

        let scope = format!("{}/{}/{}/aws4_request", date_stamp, self.region, self.service);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signing_key = self.signing_key(&date_stamp);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, scope, signed_header_names, signature
        );

        let mut out = BTreeMap::new();
        out.insert("x-amz-date".to_string(), amz_date);
        out.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());
        out.insert("authorization".to_string(), authorization);
        out
    }

    fn signing_key(&self, date_stamp: &str) -> Vec<u8> {
        let k_secret = format!("AWS4{}", self.secret_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, self.service.as_bytes());
        hmac_sha256(&k_service, b"aws4_request")
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sign_produces_stable_authorization() {
        let signer = SigV4Signer::new("AKIDEXAMPLE", "secret", "us-east-1");
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), "minio.example.com".to_string());

        let first = signer.sign("PUT", "/staging/disk0", "", &headers, UNSIGNED_PAYLOAD, now);
        let second = signer.sign("PUT", "/staging/disk0", "", &headers, UNSIGNED_PAYLOAD, now);
        assert_eq!(first, second);

        let auth = &first["authorization"];
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240501/us-east-1/s3/aws4_request"));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
        assert_eq!(first["x-amz-date"], "20240501T120000Z");
    }

    #[test]
    fn test_signature_changes_with_path() {
        let signer = SigV4Signer::new("AKIDEXAMPLE", "secret", "us-east-1");
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), "minio.example.com".to_string());

        let a = signer.sign("GET", "/bucket/a", "", &headers, UNSIGNED_PAYLOAD, now);
        let b = signer.sign("GET", "/bucket/b", "", &headers, UNSIGNED_PAYLOAD, now);
        assert_ne!(a["authorization"], b["authorization"]);
    }
}
