//! Core data models for the photo-poetry service.
//!
//! These entities represent poem records and inbound image payloads. They map
//! cleanly to database tables via `sqlx::FromRow` and serialize naturally as
//! JSON via `serde`.

pub mod poem;
pub mod upload;
