//! # MusicChartsAI Common Library
//!
//! Shared code for the MusicChartsAI service:
//! - Configuration loading and root folder resolution
//! - Database initialization and schema
//! - Event types and the broadcast event bus
//! - SSE helpers

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
