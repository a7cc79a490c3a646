//! Image ingestion: resolve an inbound payload to bytes, opportunistically
//! re-encode, then pick the single-shot or chunked upload path by size.
//!
//! Bytes that the `image` crate cannot decode are stored unmodified instead
//! of failing the request.

use crate::{
    models::upload::{ImagePayload, StoredImage},
    services::object_store::{ObjectInfo, ObjectStoreClient, StoreConfig, StoreError, StoredObject},
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::Utc;
use image::{ImageReader, codecs::jpeg::JpegEncoder, imageops::FilterType};
use std::{io::Cursor, sync::RwLock, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Payloads above this size take the chunked upload path.
pub const MULTIPART_THRESHOLD: usize = 5 * 1024 * 1024;

/// Timeout for fetching a remote image URL.
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Longest edge kept when re-encoding.
const MAX_EDGE: u32 = 2048;

/// JPEG quality used for re-encoded images.
const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no image bytes in payload")]
    EmptyPayload,
    #[error("failed to fetch remote image: {0}")]
    RemoteFetch(String),
    #[error("image buffer is not valid base64: {0}")]
    InvalidBase64(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type IngestResult<T> = Result<T, IngestError>;

/// Which upload path a payload takes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadPath {
    Single,
    Chunked,
}

/// Caller intent: let the size threshold decide, or force the chunked path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadMode {
    Auto,
    Chunked,
}

/// Pick the upload path for a payload size.
pub fn upload_path(size: usize, mode: UploadMode) -> UploadPath {
    match mode {
        UploadMode::Chunked => UploadPath::Chunked,
        UploadMode::Auto if size > MULTIPART_THRESHOLD => UploadPath::Chunked,
        UploadMode::Auto => UploadPath::Single,
    }
}

/// Ingestion service. Owns the store client behind a lock so it can be
/// rebuilt from config for the one-shot signature-mismatch retry.
pub struct ImageService {
    store: RwLock<ObjectStoreClient>,
    store_cfg: StoreConfig,
    fetcher: reqwest::Client,
}

impl ImageService {
    pub fn new(store_cfg: StoreConfig) -> IngestResult<Self> {
        let store = ObjectStoreClient::new(store_cfg.clone())?;
        let fetcher = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            store: RwLock::new(store),
            store_cfg,
            fetcher,
        })
    }

    /// Base URL of the backing store.
    pub fn storage_base_url(&self) -> String {
        self.store_cfg.base_url.clone()
    }

    fn client(&self) -> ObjectStoreClient {
        match self.store.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn rebuild_client(&self) -> IngestResult<()> {
        let fresh = ObjectStoreClient::new(self.store_cfg.clone())?;
        match self.store.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        Ok(())
    }

    /// Resolve, re-encode, and store a payload under `folder`.
    pub async fn ingest(
        &self,
        payload: ImagePayload,
        folder: &str,
        mode: UploadMode,
    ) -> IngestResult<StoredImage> {
        let original_name = payload.filename();
        let (raw, content_type) = self.resolve(payload).await?;
        if raw.is_empty() {
            return Err(IngestError::EmptyPayload);
        }

        let (bytes, content_type) = prepare_bytes(raw, content_type);
        let key = object_key(folder, &content_type);
        let size = bytes.len();

        let stored = self.store_with_retry(bytes, &key, &content_type, mode).await?;

        Ok(StoredImage {
            url: stored.url,
            original_name,
            size: size as i64,
            content_type,
        })
    }

    /// Upload via the path `upload_path` selects, retrying exactly once with
    /// a freshly built client when the store reports a signature mismatch.
    async fn store_with_retry(
        &self,
        bytes: Bytes,
        key: &str,
        content_type: &str,
        mode: UploadMode,
    ) -> IngestResult<StoredObject> {
        let path = upload_path(bytes.len(), mode);
        debug!(key, size = bytes.len(), ?path, "storing image");

        match self.put(bytes.clone(), key, content_type, path).await {
            Ok(stored) => Ok(stored),
            Err(err) if err.is_retryable() => {
                warn!(key, "signature mismatch from store, retrying with a fresh client");
                self.rebuild_client()?;
                Ok(self.put(bytes, key, content_type, path).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put(
        &self,
        bytes: Bytes,
        key: &str,
        content_type: &str,
        path: UploadPath,
    ) -> Result<StoredObject, StoreError> {
        let client = self.client();
        match path {
            UploadPath::Single => client.put_single(bytes, key, content_type).await,
            UploadPath::Chunked => client.put_multipart(bytes, key, content_type).await,
        }
    }

    /// Best-effort removal of a stored object, addressed by its public URL.
    /// URLs that do not belong to the configured bucket are ignored.
    pub async fn remove_by_url(&self, url: &str) -> IngestResult<()> {
        let client = self.client();
        let prefix = format!(
            "{}/{}/",
            self.store_cfg.base_url.trim_end_matches('/'),
            self.store_cfg.bucket
        );
        let Some(key) = url.strip_prefix(&prefix) else {
            debug!(url, "url is not in the configured bucket, skipping delete");
            return Ok(());
        };
        client.delete(key).await?;
        Ok(())
    }

    /// Metadata for a stored object plus a time-limited signed URL.
    pub async fn describe(&self, key: &str, ttl: Duration) -> IngestResult<(ObjectInfo, String)> {
        let client = self.client();
        let info = client.head_info(key).await?;
        let signed = client.signed_url(key, ttl);
        Ok((info, signed))
    }

    /// Turn any payload variant into raw bytes plus a content type.
    async fn resolve(&self, payload: ImagePayload) -> IngestResult<(Bytes, Option<String>)> {
        match payload {
            ImagePayload::Bytes {
                data, content_type, ..
            } => Ok((data, content_type)),
            ImagePayload::RemoteUrl(url) => self.fetch_remote(&url).await,
            ImagePayload::Base64(buffer) => {
                let (data, content_type) = decode_base64_image(&buffer)?;
                Ok((data, content_type))
            }
        }
    }

    /// Fetch a remote image. Non-2xx or timeout is a hard failure here.
    async fn fetch_remote(&self, url: &str) -> IngestResult<(Bytes, Option<String>)> {
        let response = self
            .fetcher
            .get(url)
            .send()
            .await
            .map_err(|e| IngestError::RemoteFetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(IngestError::RemoteFetch(format!(
                "remote returned status {}",
                response.status()
            )));
        }
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let data = response
            .bytes()
            .await
            .map_err(|e| IngestError::RemoteFetch(e.to_string()))?;
        Ok((data, content_type))
    }
}

/// Decode a base64 image buffer, tolerating a `data:{mime};base64,` prefix.
pub fn decode_base64_image(buffer: &str) -> IngestResult<(Bytes, Option<String>)> {
    let (content_type, encoded) = match buffer.split_once(";base64,") {
        Some((header, rest)) => (
            header.strip_prefix("data:").map(str::to_string),
            rest,
        ),
        None => (None, buffer),
    };
    let decoded = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| IngestError::InvalidBase64(e.to_string()))?;
    Ok((Bytes::from(decoded), content_type))
}

/// Opportunistic re-encode: bounded resize plus fixed-quality JPEG. Any
/// decode or encode failure keeps the original bytes and content type.
fn prepare_bytes(raw: Bytes, content_type: Option<String>) -> (Bytes, String) {
    match reencode(&raw) {
        Some(encoded) => (Bytes::from(encoded), "image/jpeg".to_string()),
        None => {
            debug!(size = raw.len(), "re-encode failed, storing original bytes");
            let content_type = content_type.unwrap_or_else(|| "application/octet-stream".into());
            (raw, content_type)
        }
    }
}

fn reencode(raw: &[u8]) -> Option<Vec<u8>> {
    let img = ImageReader::new(Cursor::new(raw))
        .with_guessed_format()
        .ok()?
        .decode()
        .ok()?;
    let img = if img.width() > MAX_EDGE || img.height() > MAX_EDGE {
        img.resize(MAX_EDGE, MAX_EDGE, FilterType::Lanczos3)
    } else {
        img
    };
    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    // JPEG has no alpha channel.
    image::DynamicImage::ImageRgb8(img.to_rgb8())
        .write_with_encoder(encoder)
        .ok()?;
    Some(out)
}

/// Date-sharded object key: `{folder}/{yyyymmdd}/{uuid}.{ext}`.
fn object_key(folder: &str, content_type: &str) -> String {
    let ext = match content_type {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/jpeg" | "image/jpg" => "jpg",
        _ => "bin",
    };
    format!(
        "{}/{}/{}.{}",
        folder.trim_matches('/'),
        Utc::now().format("%Y%m%d"),
        Uuid::new_v4(),
        ext
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_decision_at_threshold_boundary() {
        assert_eq!(
            upload_path(MULTIPART_THRESHOLD - 1, UploadMode::Auto),
            UploadPath::Single
        );
        assert_eq!(
            upload_path(MULTIPART_THRESHOLD, UploadMode::Auto),
            UploadPath::Single
        );
        assert_eq!(
            upload_path(MULTIPART_THRESHOLD + 1, UploadMode::Auto),
            UploadPath::Chunked
        );
    }

    #[test]
    fn chunked_mode_overrides_size() {
        assert_eq!(upload_path(1, UploadMode::Chunked), UploadPath::Chunked);
    }

    #[test]
    fn corrupt_bytes_pass_through_unmodified() {
        let raw = Bytes::from_static(b"definitely not an image");
        let (bytes, content_type) = prepare_bytes(raw.clone(), Some("image/jpeg".into()));
        assert_eq!(bytes, raw);
        assert_eq!(content_type, "image/jpeg");
    }

    #[test]
    fn valid_png_is_reencoded_as_jpeg() {
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([120, 30, 200]));
        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let (bytes, content_type) = prepare_bytes(Bytes::from(png), Some("image/png".into()));
        assert_eq!(content_type, "image/jpeg");
        // JPEG magic bytes.
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn base64_decode_tolerates_data_uri_prefix() {
        let plain = general_purpose::STANDARD.encode(b"hello");
        let (bytes, content_type) = decode_base64_image(&plain).unwrap();
        assert_eq!(&bytes[..], b"hello");
        assert_eq!(content_type, None);

        let with_prefix = format!("data:image/png;base64,{plain}");
        let (bytes, content_type) = decode_base64_image(&with_prefix).unwrap();
        assert_eq!(&bytes[..], b"hello");
        assert_eq!(content_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn invalid_base64_is_rejected() {
        assert!(matches!(
            decode_base64_image("@@not base64@@"),
            Err(IngestError::InvalidBase64(_))
        ));
    }

    #[test]
    fn object_keys_are_folder_and_date_sharded() {
        let key = object_key("uploads", "image/jpeg");
        let parts: Vec<&str> = key.split('/').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "uploads");
        assert_eq!(parts[1].len(), 8);
        assert!(parts[2].ends_with(".jpg"));
    }
}
