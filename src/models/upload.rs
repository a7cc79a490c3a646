//! Inbound image payloads and the normalized result of storing one.

use bytes::Bytes;
use serde::Serialize;

/// The three ways an image can arrive at the service.
#[derive(Clone, Debug)]
pub enum ImagePayload {
    /// Raw bytes from a multipart upload.
    Bytes {
        data: Bytes,
        filename: Option<String>,
        content_type: Option<String>,
    },
    /// A remote URL to fetch before storing.
    RemoteUrl(String),
    /// A base64 buffer, with or without a `data:` URI prefix.
    Base64(String),
}

impl ImagePayload {
    /// Best-effort original filename for the payload.
    pub fn filename(&self) -> Option<String> {
        match self {
            ImagePayload::Bytes { filename, .. } => filename.clone(),
            ImagePayload::RemoteUrl(url) => url
                .rsplit('/')
                .next()
                .map(|seg| seg.split('?').next().unwrap_or(seg).to_string())
                .filter(|s| !s.is_empty()),
            ImagePayload::Base64(_) => None,
        }
    }
}

/// Normalized record for an image that made it into object storage.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StoredImage {
    /// Public URL of the stored object.
    pub url: String,

    /// Original filename, when one was known.
    pub original_name: Option<String>,

    /// Stored size in bytes.
    pub size: i64,

    /// Content type of the stored bytes.
    pub content_type: String,
}
