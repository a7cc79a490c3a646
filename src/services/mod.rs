//! Service layer: ingestion, storage, inference, parsing, orchestration.

pub mod image_service;
pub mod inference;
pub mod object_store;
pub mod parser;
pub mod poem_service;
