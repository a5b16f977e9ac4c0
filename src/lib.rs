//! D&B company matching library
//!
//! Resolves free-text company descriptions to DUNS numbers through the D&B
//! Direct+ cleanseMatch API, stages every raw response on disk and ingests
//! the staged data into a SQLite store keyed by DUNS.
//!
//! # Modules
//!
//! - `auth`: Token exchange and the single-flight credential cache.
//! - `backoff`: Retry policy with exponential backoff and jitter.
//! - `config`: Configuration management.
//! - `db`: Database connection and pool management.
//! - `db_storage`: Ingestion of staged responses into the relational store.
//! - `errors`: Error handling types.
//! - `extract`: Provider body to candidate translation.
//! - `matcher`: Single and batch matching.
//! - `models`: Core data models.
//! - `rate_limiter`: Shared requests-per-second ceiling.
//! - `response_store`: Durable staging of raw responses.
//! - `workflow`: Match, stage and ingest orchestration.

pub mod auth;
pub mod backoff;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod errors;
pub mod extract;
pub mod matcher;
pub mod models;
pub mod rate_limiter;
pub mod response_store;
pub mod workflow;
