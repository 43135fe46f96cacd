//! NDT Ingest Service
//!
//! Accepts uploaded inspection images, normalizes them to the detector's
//! canonical input size, stores them in the object store and enqueues one
//! processing message per file.
//!
//! ```text
//! POST /upload -> ImageNormalizer -> ObjectStore -> file-processing queue
//! ```

pub mod api;
pub mod config;
pub mod normalizer;
pub mod service;

pub use config::IngestConfig;
pub use normalizer::{ImageNormalizer, NormalizeError, NormalizedImage};
pub use service::{storage_key, IngestError, IngestReceipt, IngestionService, Upload};
