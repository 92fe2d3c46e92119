//! # Storage: Presigned Object Access
//!
//! The broker never moves file bytes. It hands callers time-boxed URLs signed
//! with AWS Signature Version 4 (query-string form), which any S3-compatible
//! backend (AWS S3, MinIO, R2) verifies on its own. Signing is pure
//! computation, so presigning performs no network I/O; a backend that is
//! misconfigured is only discovered when the caller uses the URL.
//!
//! URLs are path-style (`{endpoint}/{bucket}/{key}`). For uploads the
//! `content-type` header is part of the signature, so the backend rejects a
//! PUT carrying any other type than the one the broker approved.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::StorageConfig;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";
/// Longest validity S3 accepts for a presigned URL (7 days).
const MAX_EXPIRES_SECS: u64 = 604_800;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object storage is not configured: missing {0}")]
    NotConfigured(&'static str),
    #[error("invalid storage endpoint: {0}")]
    InvalidEndpoint(String),
}

/// A signed request the caller performs directly against storage.
#[derive(Clone, Debug, PartialEq)]
pub struct PresignedRequest {
    pub url: String,
    pub method: &'static str,
    /// Headers the caller must send unchanged.
    pub headers: BTreeMap<String, String>,
    pub expires_at: DateTime<Utc>,
}

pub trait ObjectStore: Send + Sync {
    fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<PresignedRequest, StorageError>;

    fn presign_get(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<PresignedRequest, StorageError>;
}

/// SigV4 presigner for an S3-compatible bucket.
pub struct S3Presigner {
    config: StorageConfig,
}

impl S3Presigner {
    pub fn new(config: StorageConfig) -> Self {
        S3Presigner { config }
    }

    fn presign(
        &self,
        method: &'static str,
        key: &str,
        content_type: Option<&str>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<PresignedRequest, StorageError> {
        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .ok_or(StorageError::NotConfigured("STORAGE_ENDPOINT"))?;
        let bucket = self
            .config
            .bucket
            .as_deref()
            .ok_or(StorageError::NotConfigured("STORAGE_BUCKET"))?;
        let access_key = self
            .config
            .access_key
            .as_deref()
            .ok_or(StorageError::NotConfigured("STORAGE_ACCESS_KEY"))?;
        let secret_key = self
            .config
            .secret_key
            .as_deref()
            .ok_or(StorageError::NotConfigured("STORAGE_SECRET_KEY"))?;

        let base = url::Url::parse(endpoint)
            .map_err(|e| StorageError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(StorageError::InvalidEndpoint(format!(
                "unsupported scheme {:?}",
                base.scheme()
            )));
        }
        let host_name = base
            .host_str()
            .ok_or_else(|| StorageError::InvalidEndpoint(format!("{} has no host", endpoint)))?;
        let host = match base.port() {
            Some(port) => format!("{}:{}", host_name, port),
            None => host_name.to_string(),
        };

        let mut canonical_uri = base.path().trim_end_matches('/').to_string();
        canonical_uri.push('/');
        canonical_uri.push_str(&uri_encode_path(bucket));
        canonical_uri.push('/');
        canonical_uri.push_str(&uri_encode_path(key));

        let expires_secs = ttl.as_secs().clamp(1, MAX_EXPIRES_SECS);
        let mut headers = BTreeMap::new();
        if let Some(ct) = content_type {
            headers.insert("content-type".to_string(), ct.to_string());
        }

        let query = presigned_query(&SigningRequest {
            method,
            host: &host,
            canonical_uri: &canonical_uri,
            headers: &headers,
            region: &self.config.region,
            access_key,
            secret_key,
            timestamp: now,
            expires_secs,
        });

        let url = format!(
            "{}://{}{}?{}",
            base.scheme(),
            host,
            canonical_uri,
            query
        );
        let caller_headers = content_type
            .map(|ct| BTreeMap::from([("Content-Type".to_string(), ct.to_string())]))
            .unwrap_or_default();
        Ok(PresignedRequest {
            url,
            method,
            headers: caller_headers,
            expires_at: now + chrono::Duration::seconds(expires_secs as i64),
        })
    }
}

impl ObjectStore for S3Presigner {
    fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<PresignedRequest, StorageError> {
        self.presign("PUT", key, Some(content_type), ttl, now)
    }

    fn presign_get(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<PresignedRequest, StorageError> {
        self.presign("GET", key, None, ttl, now)
    }
}

/// Inputs to a SigV4 query-string signature.
pub struct SigningRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    /// Already URI-encoded absolute path.
    pub canonical_uri: &'a str,
    /// Extra signed headers, lowercase names. `host` is always signed.
    pub headers: &'a BTreeMap<String, String>,
    pub region: &'a str,
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub timestamp: DateTime<Utc>,
    pub expires_secs: u64,
}

/// Compute the presigned query string, `X-Amz-Signature` last.
pub fn presigned_query(req: &SigningRequest<'_>) -> String {
    let amz_date = req.timestamp.format("%Y%m%dT%H%M%SZ").to_string();
    let date = req.timestamp.format("%Y%m%d").to_string();
    let credential_scope = format!("{}/{}/{}/aws4_request", date, req.region, SERVICE);

    let mut signed: BTreeMap<&str, &str> = req
        .headers
        .iter()
        .map(|(k, v)| (k.as_str(), v.trim()))
        .collect();
    signed.insert("host", req.host);
    let canonical_headers: String = signed
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();
    let signed_headers = signed.keys().copied().collect::<Vec<_>>().join(";");

    let mut params: Vec<(String, String)> = vec![
        ("X-Amz-Algorithm".into(), ALGORITHM.into()),
        (
            "X-Amz-Credential".into(),
            format!("{}/{}", req.access_key, credential_scope),
        ),
        ("X-Amz-Date".into(), amz_date.clone()),
        ("X-Amz-Expires".into(), req.expires_secs.to_string()),
        ("X-Amz-SignedHeaders".into(), signed_headers.clone()),
    ];
    params.sort();
    let canonical_query = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\nUNSIGNED-PAYLOAD",
        req.method, req.canonical_uri, canonical_query, canonical_headers, signed_headers
    );
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        credential_scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac(format!("AWS4{}", req.secret_key).as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, req.region.as_bytes());
    let k_service = hmac(&k_region, SERVICE.as_bytes());
    let k_signing = hmac(&k_service, b"aws4_request");
    let signature = hex::encode(hmac(&k_signing, string_to_sign.as_bytes()));

    format!("{}&X-Amz-Signature={}", canonical_query, signature)
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts any key length"),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Percent-encode each path segment, keeping `/` separators.
fn uri_encode_path(path: &str) -> String {
    path.split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
