#![deny(missing_docs)]

//! Core library for the docpipe document extraction service.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Embedding model host and backends.
pub mod embedding;
/// Format detection, native text extraction, OCR and per-page routing.
pub mod extraction;
/// Structured logging and tracing setup.
pub mod logging;
/// Pipeline metrics helpers.
pub mod metrics;
/// Document processing pipeline: normalization, chunking, embedding.
pub mod processing;
