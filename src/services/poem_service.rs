//! Poem generation orchestration and poem-record persistence.
//!
//! One request is a strictly ordered chain: optional upload, inference,
//! parsing, persistence. The governing rule is that no optional subsystem may
//! fail the user-visible request: a storage failure falls back to inlining
//! the raw bytes, an inference failure substitutes the canned poem for the
//! requested style, and a persistence failure returns the generated content
//! under a synthetic id. Only a missing image source rejects the request, and
//! that happens in the handler before this service is involved.

use crate::{
    models::{poem::PoemRecord, upload::ImagePayload},
    services::{
        image_service::{ImageService, UploadMode},
        inference::{ImageRef, InferenceClient, PoemStyle, build_prompt},
        parser::{self, ParsedPoem},
    },
};
use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

const POEM_COLUMNS: &str = "id, user_id, image_url, image_filename, image_size, \
     image_content_type, storage_base_url, description, content, title, style, \
     length, prompt, model, processing_ms, rating, comment, liked, is_public, \
     share_count, client_ip, user_agent, created_at, updated_at";

#[derive(Debug, Error)]
pub enum PoemError {
    #[error("poem `{0}` not found")]
    NotFound(String),
    #[error("not allowed to modify this poem")]
    Forbidden,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type PoemResult<T> = Result<T, PoemError>;

/// Everything the generation flow needs from one request.
#[derive(Debug)]
pub struct GenerateRequest {
    pub payload: ImagePayload,
    pub style_tag: Option<String>,
    pub user_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// The generation result handed back to the handler. Always present; the
/// degraded branches only change where the content came from.
#[derive(Debug)]
pub struct GenerateOutcome {
    /// Record id, or a synthetic `local-{millis}` id when persistence failed.
    pub id: String,
    pub lines: Vec<String>,
    pub title: Option<String>,
    pub style: PoemStyle,
    pub description: String,
    pub analysis: String,
    pub image_url: Option<String>,
    pub model: String,
    pub processing_ms: i64,
    pub persisted: bool,
}

/// Partial feedback update. Absent fields keep their stored values.
#[derive(Debug, Default)]
pub struct FeedbackPatch {
    pub rating: Option<i64>,
    pub comment: Option<String>,
    pub liked: Option<bool>,
}

#[derive(Clone, Copy, Debug, Default)]
pub enum SortOrder {
    #[default]
    Latest,
    Popular,
}

#[derive(Debug, Default)]
pub struct ListParams {
    pub page: i64,
    pub limit: i64,
    pub style: Option<String>,
    pub user_id: Option<String>,
    pub sort: SortOrder,
}

pub struct PoemService {
    db: Arc<SqlitePool>,
    images: Arc<ImageService>,
    inference: Arc<InferenceClient>,
    public_base_url: String,
}

impl PoemService {
    pub fn new(
        db: Arc<SqlitePool>,
        images: Arc<ImageService>,
        inference: Arc<InferenceClient>,
        public_base_url: String,
    ) -> Self {
        Self {
            db,
            images,
            inference,
            public_base_url,
        }
    }

    /// Run the full generation chain. Never fails: every error past input
    /// validation degrades into a fallback instead of propagating.
    pub async fn generate(&self, req: GenerateRequest) -> GenerateOutcome {
        let started = Instant::now();
        let style = PoemStyle::from_tag(req.style_tag.as_deref().unwrap_or(""));
        let prompt = build_prompt(style);

        let (image_ref, stored_url, stored_meta) = self.resolve_image(&req.payload).await;

        let parsed = match self
            .inference
            .complete(InferenceClient::system_prompt(), &prompt, &image_ref)
            .await
        {
            Ok(text) => parser::parse_poem_response(&text),
            Err(err) => {
                warn!(style = style.as_tag(), %err, "inference failed, using canned poem");
                let canned = style.canned();
                ParsedPoem {
                    description: canned.description.to_string(),
                    lines: canned.lines.iter().map(|l| l.to_string()).collect(),
                    title: Some(canned.title.to_string()),
                    analysis: canned.analysis.to_string(),
                }
            }
        };

        let processing_ms = started.elapsed().as_millis() as i64;
        let record = self.build_record(
            &req,
            style,
            &prompt,
            &parsed,
            stored_url,
            stored_meta,
            processing_ms,
        );

        let (id, persisted) = match self.insert_record(&record).await {
            Ok(()) => (record.id.to_string(), true),
            Err(err) => {
                warn!(%err, "persistence failed, returning non-durable result");
                (format!("local-{}", Utc::now().timestamp_millis()), false)
            }
        };

        info!(
            %id,
            style = style.as_tag(),
            persisted,
            processing_ms,
            "poem generated"
        );

        GenerateOutcome {
            id,
            lines: parsed.lines,
            title: parsed.title,
            style,
            description: parsed.description,
            analysis: parsed.analysis,
            image_url: record.image_url.clone(),
            model: self.inference.model_name().to_string(),
            processing_ms,
            persisted,
        }
    }

    /// Decide what the model sees. Only raw uploaded bytes go through
    /// storage; a storage failure silently falls back to inlining them.
    async fn resolve_image(
        &self,
        payload: &ImagePayload,
    ) -> (ImageRef, Option<String>, Option<(Option<String>, i64, Option<String>)>) {
        match payload {
            ImagePayload::Bytes {
                data, content_type, ..
            } => match self.images.ingest(payload.clone(), "poems", UploadMode::Auto).await {
                Ok(stored) => {
                    let meta = (
                        stored.original_name.clone(),
                        stored.size,
                        Some(stored.content_type.clone()),
                    );
                    (
                        ImageRef::Url(stored.url.clone()),
                        Some(stored.url),
                        Some(meta),
                    )
                }
                Err(err) => {
                    warn!(%err, "image storage failed, inlining raw bytes for inference");
                    let content_type = content_type.as_deref().unwrap_or("image/jpeg");
                    (ImageRef::inline(data, content_type), None, None)
                }
            },
            ImagePayload::RemoteUrl(url) => (ImageRef::Url(url.clone()), None, None),
            ImagePayload::Base64(buffer) => {
                let uri = if buffer.starts_with("data:") {
                    buffer.clone()
                } else {
                    format!("data:image/jpeg;base64,{buffer}")
                };
                (ImageRef::DataUri(uri), None, None)
            }
        }
    }

    fn build_record(
        &self,
        req: &GenerateRequest,
        style: PoemStyle,
        prompt: &str,
        parsed: &ParsedPoem,
        stored_url: Option<String>,
        stored_meta: Option<(Option<String>, i64, Option<String>)>,
        processing_ms: i64,
    ) -> PoemRecord {
        let now = Utc::now();
        let (filename, size, content_type) = stored_meta
            .unwrap_or_else(|| (req.payload.filename(), 0, None));
        PoemRecord {
            id: Uuid::new_v4(),
            user_id: req.user_id.clone(),
            image_url: stored_url,
            image_filename: filename,
            image_size: size,
            image_content_type: content_type,
            storage_base_url: Some(self.images.storage_base_url()),
            description: parsed.description.clone(),
            content: serde_json::to_string(&parsed.lines).unwrap_or_else(|_| "[]".into()),
            title: parsed.title.clone(),
            style: style.as_tag().to_string(),
            length: parsed.lines.len() as i64,
            prompt: prompt.to_string(),
            model: self.inference.model_name().to_string(),
            processing_ms,
            rating: None,
            comment: None,
            liked: None,
            is_public: true,
            share_count: 0,
            client_ip: req.client_ip.clone(),
            user_agent: req.user_agent.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn insert_record(&self, rec: &PoemRecord) -> Result<(), sqlx::Error> {
        let sql = format!(
            "INSERT INTO poems ({POEM_COLUMNS}) VALUES \
             (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(rec.id)
            .bind(&rec.user_id)
            .bind(&rec.image_url)
            .bind(&rec.image_filename)
            .bind(rec.image_size)
            .bind(&rec.image_content_type)
            .bind(&rec.storage_base_url)
            .bind(&rec.description)
            .bind(&rec.content)
            .bind(&rec.title)
            .bind(&rec.style)
            .bind(rec.length)
            .bind(&rec.prompt)
            .bind(&rec.model)
            .bind(rec.processing_ms)
            .bind(rec.rating)
            .bind(&rec.comment)
            .bind(rec.liked)
            .bind(rec.is_public)
            .bind(rec.share_count)
            .bind(&rec.client_ip)
            .bind(&rec.user_agent)
            .bind(rec.created_at)
            .bind(rec.updated_at)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Fetch one poem. A non-UUID id is reported as not found rather than a
    /// parse error, since synthetic `local-` ids are never durable.
    pub async fn find_by_id(&self, id: &str) -> PoemResult<PoemRecord> {
        let uuid = Uuid::parse_str(id).map_err(|_| PoemError::NotFound(id.to_string()))?;
        let sql = format!("SELECT {POEM_COLUMNS} FROM poems WHERE id = ?");
        sqlx::query_as::<_, PoemRecord>(&sql)
            .bind(uuid)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| PoemError::NotFound(id.to_string()))
    }

    /// Filtered, sorted, paginated listing plus the total matching count.
    pub async fn list(&self, params: ListParams) -> PoemResult<(Vec<PoemRecord>, i64)> {
        let limit = params.limit.clamp(1, 50);
        let page = params.page.max(1);
        let offset = (page - 1) * limit;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {POEM_COLUMNS} FROM poems WHERE 1 = 1"
        ));
        push_filters(&mut builder, &params);
        builder.push(match params.sort {
            SortOrder::Latest => " ORDER BY created_at DESC",
            SortOrder::Popular => " ORDER BY share_count DESC, created_at DESC",
        });
        builder.push(" LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);
        let rows: Vec<PoemRecord> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut count_builder =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM poems WHERE 1 = 1");
        push_filters(&mut count_builder, &params);
        let total: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&*self.db)
            .await?;

        Ok((rows, total))
    }

    /// Apply a partial feedback update and return the updated record.
    pub async fn update_feedback(&self, id: &str, patch: FeedbackPatch) -> PoemResult<PoemRecord> {
        let uuid = Uuid::parse_str(id).map_err(|_| PoemError::NotFound(id.to_string()))?;
        let sql = format!(
            "UPDATE poems SET \
                rating = COALESCE(?, rating), \
                comment = COALESCE(?, comment), \
                liked = COALESCE(?, liked), \
                updated_at = ? \
             WHERE id = ? \
             RETURNING {POEM_COLUMNS}"
        );
        sqlx::query_as::<_, PoemRecord>(&sql)
            .bind(patch.rating)
            .bind(patch.comment)
            .bind(patch.liked)
            .bind(Utc::now())
            .bind(uuid)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| PoemError::NotFound(id.to_string()))
    }

    /// Atomically bump the share counter. The increment happens server-side
    /// so concurrent shares cannot lose counts.
    pub async fn increment_share(&self, id: &str) -> PoemResult<(i64, String)> {
        let uuid = Uuid::parse_str(id).map_err(|_| PoemError::NotFound(id.to_string()))?;
        let count: Option<i64> = sqlx::query_scalar(
            "UPDATE poems SET share_count = share_count + 1, updated_at = ? \
             WHERE id = ? RETURNING share_count",
        )
        .bind(Utc::now())
        .bind(uuid)
        .fetch_optional(&*self.db)
        .await?;

        let count = count.ok_or_else(|| PoemError::NotFound(id.to_string()))?;
        Ok((count, self.share_url(id)))
    }

    pub fn share_url(&self, id: &str) -> String {
        format!("{}/poem/{}", self.public_base_url.trim_end_matches('/'), id)
    }

    /// Delete a poem. Anonymous records are deletable by anyone; owned
    /// records only by the matching user. The stored image is removed
    /// best-effort afterwards.
    pub async fn delete(&self, id: &str, requester: Option<&str>) -> PoemResult<()> {
        let record = self.find_by_id(id).await?;
        if let Some(owner) = &record.user_id {
            if requester != Some(owner.as_str()) {
                return Err(PoemError::Forbidden);
            }
        }
        sqlx::query("DELETE FROM poems WHERE id = ?")
            .bind(record.id)
            .execute(&*self.db)
            .await?;

        if let Some(url) = &record.image_url {
            if let Err(err) = self.images.remove_by_url(url).await {
                warn!(%err, url, "could not remove stored image for deleted poem");
            }
        }
        Ok(())
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, params: &ListParams) {
    if let Some(style) = &params.style {
        builder.push(" AND style = ");
        builder.push_bind(style.clone());
    }
    if let Some(user_id) = &params.user_id {
        builder.push(" AND user_id = ");
        builder.push_bind(user_id.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        inference::InferenceConfig,
        object_store::StoreConfig,
    };

    /// Pool with the real schema applied, mirroring the startup migration.
    async fn test_pool() -> Arc<SqlitePool> {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let sql = include_str!("../../migrations/0001_init.sql");
        for stmt in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(&pool).await.unwrap();
        }
        Arc::new(pool)
    }

    /// Service whose inference endpoint refuses connections, so every
    /// generation takes the canned-poem branch.
    fn test_service(db: Arc<SqlitePool>) -> PoemService {
        let images = Arc::new(
            ImageService::new(StoreConfig {
                base_url: "http://127.0.0.1:9".into(),
                bucket: "poems".into(),
                access_key: "test".into(),
                secret_key: "test".into(),
                timeout_secs: 1,
            })
            .unwrap(),
        );
        let inference = Arc::new(
            InferenceClient::new(InferenceConfig {
                base_url: "http://127.0.0.1:9".into(),
                api_key: None,
                model: "vision-test".into(),
                timeout_secs: 1,
            })
            .unwrap(),
        );
        PoemService::new(db, images, inference, "https://poems.example.com".into())
    }

    fn base64_request(style: &str, user_id: Option<&str>) -> GenerateRequest {
        GenerateRequest {
            payload: ImagePayload::Base64("aGVsbG8=".into()),
            style_tag: Some(style.to_string()),
            user_id: user_id.map(str::to_string),
            client_ip: Some("127.0.0.1".into()),
            user_agent: Some("tests".into()),
        }
    }

    #[tokio::test]
    async fn inference_failure_yields_canned_poem_for_requested_style() {
        let service = test_service(test_pool().await);
        let outcome = service.generate(base64_request("浪漫", None)).await;

        let canned = PoemStyle::Langman.canned();
        assert_eq!(outcome.style, PoemStyle::Langman);
        assert_eq!(outcome.title.as_deref(), Some(canned.title));
        assert_eq!(outcome.lines, canned.lines);
        assert!(outcome.persisted);

        // The degraded result is still durable and readable.
        let record = service.find_by_id(&outcome.id).await.unwrap();
        assert_eq!(record.style, "浪漫");
        assert_eq!(record.length, 4);
        assert_eq!(record.lines(), canned.lines);
    }

    #[tokio::test]
    async fn unrecognized_style_defaults_to_gufeng() {
        let service = test_service(test_pool().await);
        let outcome = service.generate(base64_request("limerick", None)).await;
        assert_eq!(outcome.style, PoemStyle::Gufeng);
        assert_eq!(outcome.lines, PoemStyle::Gufeng.canned().lines);
    }

    #[tokio::test]
    async fn persistence_failure_degrades_to_local_id() {
        // No schema applied, so the insert fails.
        let pool = Arc::new(SqlitePool::connect("sqlite::memory:").await.unwrap());
        let service = test_service(pool);
        let outcome = service.generate(base64_request("哲理", None)).await;

        assert!(!outcome.persisted);
        assert!(outcome.id.starts_with("local-"));
        assert_eq!(outcome.lines, PoemStyle::Zheli.canned().lines);
    }

    #[tokio::test]
    async fn share_count_increments_by_one_per_call() {
        let service = test_service(test_pool().await);
        let outcome = service.generate(base64_request("古风", None)).await;

        let (first, url) = service.increment_share(&outcome.id).await.unwrap();
        let (second, _) = service.increment_share(&outcome.id).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(
            url,
            format!("https://poems.example.com/poem/{}", outcome.id)
        );
    }

    #[tokio::test]
    async fn feedback_patch_is_partial() {
        let service = test_service(test_pool().await);
        let outcome = service.generate(base64_request("现代", None)).await;

        let record = service
            .update_feedback(
                &outcome.id,
                FeedbackPatch {
                    rating: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(record.rating, Some(5));

        let record = service
            .update_feedback(
                &outcome.id,
                FeedbackPatch {
                    liked: Some(true),
                    comment: Some("写得真好".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // The earlier rating survives a patch that does not mention it.
        assert_eq!(record.rating, Some(5));
        assert_eq!(record.liked, Some(true));
        assert_eq!(record.comment.as_deref(), Some("写得真好"));
    }

    #[tokio::test]
    async fn owned_records_reject_foreign_deletes() {
        let service = test_service(test_pool().await);
        let owned = service.generate(base64_request("古风", Some("alice"))).await;

        assert!(matches!(
            service.delete(&owned.id, Some("mallory")).await,
            Err(PoemError::Forbidden)
        ));
        assert!(matches!(
            service.delete(&owned.id, None).await,
            Err(PoemError::Forbidden)
        ));
        service.delete(&owned.id, Some("alice")).await.unwrap();
        assert!(matches!(
            service.find_by_id(&owned.id).await,
            Err(PoemError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn anonymous_records_are_deletable_by_anyone() {
        let service = test_service(test_pool().await);
        let outcome = service.generate(base64_request("古风", None)).await;
        service.delete(&outcome.id, Some("whoever")).await.unwrap();
    }

    #[tokio::test]
    async fn list_filters_by_style_and_paginates() {
        let service = test_service(test_pool().await);
        for style in ["古风", "古风", "现代"] {
            service.generate(base64_request(style, None)).await;
        }

        let (rows, total) = service
            .list(ListParams {
                page: 1,
                limit: 10,
                style: Some("古风".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows.len(), 2);

        let (rows, total) = service
            .list(ListParams {
                page: 2,
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let service = test_service(test_pool().await);
        assert!(matches!(
            service.find_by_id(&Uuid::new_v4().to_string()).await,
            Err(PoemError::NotFound(_))
        ));
        assert!(matches!(
            service.find_by_id("local-12345").await,
            Err(PoemError::NotFound(_))
        ));
    }
}
