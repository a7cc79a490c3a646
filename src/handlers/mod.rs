//! HTTP handlers, grouped by surface.

pub mod health_handlers;
pub mod image_handlers;
pub mod poem_handlers;
