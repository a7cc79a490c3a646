//! HTTP client for the external S3-style object store.
//!
//! Objects live at `{base_url}/{bucket}/{key}`. Requests are authenticated
//! with an `Authorization: AK {access_key}:{expires}:{signature}` header,
//! where the signature is an MD5 over the secret key and a canonical string
//! that includes the expiry. Large
//! payloads go through the store's multipart protocol: initiate, upload parts
//! with bounded concurrency, complete.

use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt, stream};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Fixed part size for chunked uploads.
pub const PART_SIZE: usize = 5 * 1024 * 1024;

/// How many parts are in flight at once during a chunked upload.
pub const PART_CONCURRENCY: usize = 4;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Connection settings for the object store.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Root endpoint, e.g. `https://store.example.com`.
    pub base_url: String,
    /// Bucket all uploads go into.
    pub bucket: String,
    /// Access key identifying the caller.
    pub access_key: String,
    /// Secret key used for request signing.
    pub secret_key: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(if self.timeout_secs == 0 {
            DEFAULT_TIMEOUT_SECS
        } else {
            self.timeout_secs
        })
    }
}

/// Upload failures, classified so each class maps to a distinct user-facing
/// message. `SignatureMismatch` is the only class worth retrying in-process.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage denied the upload: the configured key has no write access")]
    PermissionDenied,
    #[error("storage bucket does not exist, check the bucket configuration")]
    BucketMissing,
    #[error("storage credentials were rejected, check the access/secret keys")]
    CredentialInvalid,
    #[error("storage rejected the request signature")]
    SignatureMismatch,
    #[error("storage service is temporarily unavailable: {0}")]
    Transient(String),
    #[error("storage request failed: {0}")]
    Http(String),
    #[error("storage returned a malformed response: {0}")]
    Malformed(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a completed upload.
#[derive(Clone, Debug)]
pub struct StoredObject {
    pub url: String,
    pub etag: String,
}

/// Metadata returned by a HEAD request.
#[derive(Clone, Debug)]
pub struct ObjectInfo {
    pub size: i64,
    pub content_type: Option<String>,
    pub etag: Option<String>,
}

#[derive(Deserialize)]
struct InitiateResponse {
    #[serde(rename = "uploadId")]
    upload_id: String,
}

#[derive(Deserialize)]
struct CompleteResponse {
    etag: String,
}

/// Client handle for the object store. Cheap to construct, so the owning
/// service can rebuild it for the signature-mismatch retry.
#[derive(Clone)]
pub struct ObjectStoreClient {
    http: reqwest::Client,
    cfg: StoreConfig,
}

impl ObjectStoreClient {
    pub fn new(cfg: StoreConfig) -> StoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout())
            .build()
            .map_err(|e| StoreError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, cfg })
    }

    /// Public URL for a key.
    pub fn object_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.cfg.base_url.trim_end_matches('/'),
            self.cfg.bucket,
            key
        )
    }

    fn sign(&self, method: &str, key: &str, expires: i64) -> String {
        let canonical = format!(
            "{}:{}:{}/{}:{}",
            self.cfg.secret_key, method, self.cfg.bucket, key, expires
        );
        format!("{:x}", md5::compute(canonical))
    }

    // The expiry travels with the signature so the store can recompute it.
    fn auth_header(&self, method: &str, key: &str) -> String {
        let expires = Utc::now().timestamp() + self.cfg.timeout_secs as i64;
        format!(
            "AK {}:{}:{}",
            self.cfg.access_key,
            expires,
            self.sign(method, key, expires)
        )
    }

    /// Pre-signed GET URL with a validity window.
    pub fn signed_url(&self, key: &str, ttl: Duration) -> String {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        format!(
            "{}?ak={}&expires={}&signature={}",
            self.object_url(key),
            self.cfg.access_key,
            expires,
            self.sign("GET", key, expires)
        )
    }

    /// Single-shot upload for payloads at or below the multipart threshold.
    pub async fn put_single(
        &self,
        bytes: Bytes,
        key: &str,
        content_type: &str,
    ) -> StoreResult<StoredObject> {
        let etag = format!("{:x}", md5::compute(&bytes));
        let response = self
            .http
            .put(self.object_url(key))
            .header("Authorization", self.auth_header("PUT", key))
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await
            .map_err(classify_transport)?;

        let response = check_status(response).await?;
        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
            .unwrap_or(etag);

        debug!(key, %etag, "single-shot upload complete");
        Ok(StoredObject {
            url: self.object_url(key),
            etag,
        })
    }

    /// Chunked upload: initiate, push fixed-size parts with bounded
    /// concurrency, then complete with the collected part etags.
    pub async fn put_multipart(
        &self,
        bytes: Bytes,
        key: &str,
        content_type: &str,
    ) -> StoreResult<StoredObject> {
        let url = self.object_url(key);
        let response = self
            .http
            .post(format!("{url}?uploads"))
            .header("Authorization", self.auth_header("POST", key))
            .header("Content-Type", content_type)
            .send()
            .await
            .map_err(classify_transport)?;
        let init: InitiateResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))?;

        let part_count = bytes.len().div_ceil(PART_SIZE).max(1);
        debug!(key, part_count, upload_id = %init.upload_id, "multipart upload initiated");

        let parts: Vec<(usize, Bytes)> = (0..part_count)
            .map(|i| {
                let start = i * PART_SIZE;
                let end = (start + PART_SIZE).min(bytes.len());
                (i + 1, bytes.slice(start..end))
            })
            .collect();

        let mut etags: Vec<(usize, String)> = stream::iter(parts)
            .map(|(number, chunk)| {
                let upload_id = init.upload_id.clone();
                async move {
                    self.upload_part(key, &upload_id, number, chunk)
                        .await
                        .map(|etag| (number, etag))
                }
            })
            .buffer_unordered(PART_CONCURRENCY)
            .try_collect()
            .await?;
        etags.sort_by_key(|(number, _)| *number);

        let body = json!({
            "parts": etags
                .iter()
                .map(|(number, etag)| json!({ "partNumber": number, "etag": etag }))
                .collect::<Vec<_>>(),
        });
        let response = self
            .http
            .post(format!("{url}?uploadId={}", init.upload_id))
            .header("Authorization", self.auth_header("POST", key))
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;
        let complete: CompleteResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))?;

        Ok(StoredObject {
            url,
            etag: complete.etag,
        })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: usize,
        chunk: Bytes,
    ) -> StoreResult<String> {
        let response = self
            .http
            .put(format!(
                "{}?uploadId={}&partNumber={}",
                self.object_url(key),
                upload_id,
                number
            ))
            .header("Authorization", self.auth_header("PUT", key))
            .body(chunk)
            .send()
            .await
            .map_err(classify_transport)?;
        let response = check_status(response).await?;
        response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
            .ok_or_else(|| StoreError::Malformed("part response missing etag".into()))
    }

    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        let response = self
            .http
            .delete(self.object_url(key))
            .header("Authorization", self.auth_header("DELETE", key))
            .send()
            .await
            .map_err(classify_transport)?;
        check_status(response).await?;
        Ok(())
    }

    pub async fn head_info(&self, key: &str) -> StoreResult<ObjectInfo> {
        let response = self
            .http
            .head(self.object_url(key))
            .header("Authorization", self.auth_header("HEAD", key))
            .send()
            .await
            .map_err(classify_transport)?;
        let response = check_status(response).await?;
        let headers = response.headers();
        Ok(ObjectInfo {
            size: headers
                .get("content-length")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            content_type: headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            etag: headers
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_matches('"').to_string()),
        })
    }
}

/// Map transport-level failures (timeout, refused connection) to `Transient`.
fn classify_transport(err: reqwest::Error) -> StoreError {
    if err.is_timeout() || err.is_connect() {
        StoreError::Transient(err.to_string())
    } else {
        StoreError::Http(err.to_string())
    }
}

/// Classify a non-success response into a `StoreError` variant.
async fn check_status(response: reqwest::Response) -> StoreResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status.as_u16(), &body))
}

fn classify_status(status: u16, body: &str) -> StoreError {
    let lowered = body.to_ascii_lowercase();
    match status {
        401 => StoreError::CredentialInvalid,
        403 if lowered.contains("signature") => StoreError::SignatureMismatch,
        403 => StoreError::PermissionDenied,
        404 => StoreError::BucketMissing,
        s if s >= 500 => StoreError::Transient(format!("status {s}")),
        s => StoreError::Http(format!("status {s}: {body}")),
    }
}

impl StoreError {
    /// Whether rebuilding the client and retrying once is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::SignatureMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_covers_each_class() {
        assert!(matches!(
            classify_status(401, ""),
            StoreError::CredentialInvalid
        ));
        assert!(matches!(
            classify_status(403, "SignatureDoesNotMatch"),
            StoreError::SignatureMismatch
        ));
        assert!(matches!(
            classify_status(403, "access denied"),
            StoreError::PermissionDenied
        ));
        assert!(matches!(classify_status(404, ""), StoreError::BucketMissing));
        assert!(matches!(
            classify_status(503, ""),
            StoreError::Transient(_)
        ));
        assert!(matches!(classify_status(418, "teapot"), StoreError::Http(_)));
    }

    #[test]
    fn only_signature_mismatch_is_retryable() {
        assert!(StoreError::SignatureMismatch.is_retryable());
        assert!(!StoreError::PermissionDenied.is_retryable());
        assert!(!StoreError::Transient("x".into()).is_retryable());
    }

    fn test_client() -> ObjectStoreClient {
        ObjectStoreClient::new(StoreConfig {
            base_url: "https://store.example.com".into(),
            bucket: "poems".into(),
            access_key: "ak".into(),
            secret_key: "sk".into(),
            timeout_secs: 30,
        })
        .unwrap()
    }

    #[test]
    fn auth_header_expiry_verifies_against_the_signature() {
        let client = test_client();
        let header = client.auth_header("PUT", "uploads/a.jpg");

        let rest = header.strip_prefix("AK ak:").unwrap();
        let (expires, signature) = rest.split_once(':').unwrap();
        let expires: i64 = expires.parse().unwrap();
        // The recipient can recompute the signature from what was sent.
        assert_eq!(signature, client.sign("PUT", "uploads/a.jpg", expires));
        assert!(expires > Utc::now().timestamp());
    }

    #[test]
    fn signed_url_carries_key_expiry_and_signature() {
        let client = test_client();
        let url = client.signed_url("uploads/a.jpg", Duration::from_secs(600));
        assert!(url.starts_with("https://store.example.com/poems/uploads/a.jpg?"));
        assert!(url.contains("ak=ak"));
        assert!(url.contains("expires="));
        assert!(url.contains("signature="));
    }
}
