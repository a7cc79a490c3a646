//! The durable poem record and its API-facing projections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One generated poem together with everything we know about where it came
/// from: the source image, the recognized description, the prompt and model
/// that produced it, and the mutable feedback/share state.
///
/// Poem lines are stored as a JSON array in the `content` column so the row
/// round-trips through SQLite without a join table.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct PoemRecord {
    /// Internal UUID, assigned at creation.
    pub id: Uuid,

    /// Owning user, if the submission was not anonymous.
    pub user_id: Option<String>,

    /// Storage URL of the uploaded image, absent when storage was skipped
    /// or the image arrived as a remote URL / inline buffer.
    pub image_url: Option<String>,

    /// Original filename of the uploaded file.
    pub image_filename: Option<String>,

    /// Image size in bytes (0 when unknown).
    pub image_size: i64,

    /// Content type (MIME type) of the stored image.
    pub image_content_type: Option<String>,

    /// Base URL of the storage backend the image went to.
    pub storage_base_url: Option<String>,

    /// Free-text image description produced by inference.
    pub description: String,

    /// Poem body as a JSON array of lines.
    pub content: String,

    /// Optional poem title.
    pub title: Option<String>,

    /// Style tag, one of the four fixed styles.
    pub style: String,

    /// Number of lines in `content`. Kept equal to the array length.
    pub length: i64,

    /// Prompt text sent to the model.
    pub prompt: String,

    /// Model identifier that produced (or would have produced) the poem.
    pub model: String,

    /// Wall-clock processing duration of the generation request.
    pub processing_ms: i64,

    /// User rating, 1 through 5.
    pub rating: Option<i64>,

    /// User comment, at most 500 characters.
    pub comment: Option<String>,

    /// Whether the user liked the poem.
    pub liked: Option<bool>,

    /// Public visibility flag.
    pub is_public: bool,

    /// How many times the poem has been shared. Never decremented.
    pub share_count: i64,

    /// Request IP recorded at creation.
    pub client_ip: Option<String>,

    /// Request user agent recorded at creation.
    pub user_agent: Option<String>,

    /// When this record was created.
    pub created_at: DateTime<Utc>,

    /// When this record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl PoemRecord {
    /// Decode the JSON `content` column into lines. A malformed column
    /// degrades to an empty list rather than an error.
    pub fn lines(&self) -> Vec<String> {
        serde_json::from_str(&self.content).unwrap_or_default()
    }
}

/// Detail projection returned by the list and detail endpoints.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PoemDetail {
    pub id: String,
    pub user_id: Option<String>,
    pub content: Vec<String>,
    pub title: Option<String>,
    pub style: String,
    pub length: i64,
    pub description: String,
    pub image_url: Option<String>,
    pub rating: Option<i64>,
    pub comment: Option<String>,
    pub liked: Option<bool>,
    pub is_public: bool,
    pub share_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&PoemRecord> for PoemDetail {
    fn from(rec: &PoemRecord) -> Self {
        Self {
            id: rec.id.to_string(),
            user_id: rec.user_id.clone(),
            content: rec.lines(),
            title: rec.title.clone(),
            style: rec.style.clone(),
            length: rec.length,
            description: rec.description.clone(),
            image_url: rec.image_url.clone(),
            rating: rec.rating,
            comment: rec.comment.clone(),
            liked: rec.liked,
            is_public: rec.is_public,
            share_count: rec.share_count,
            created_at: rec.created_at,
            updated_at: rec.updated_at,
        }
    }
}
