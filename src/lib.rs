//! Geotagged photo capture pipeline.
//!
//! One capture action runs location fetch, still capture, watermark
//! compositing, local persistence, and remote upload hand-off in strict
//! sequence. Capture metadata lives in an embedded SQLite store; uploads go
//! through a durable outbox drained by a background worker.

pub mod annotate;
pub mod capture;
pub mod config;
pub mod db;
pub mod error;
pub mod geocode;
pub mod location;
pub mod logging;
pub mod pipeline;
pub mod upload;

pub use db::{CaptureRecord, CaptureStore};
pub use error::PipelineError;
pub use location::GeoPoint;
