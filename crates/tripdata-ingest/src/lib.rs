//! Trip-data ingestion pipeline
//!
//! Discovers monthly trip archives from a remote bucket listing, stages their
//! tabular payloads locally, normalizes rows across the historical schema
//! variants, and bulk-loads them into a relational store with idempotent,
//! resumable semantics.
//!
//! A pass moves through LISTING, STAGING, DEDUPING, and LOADING; every
//! mutating step is keyed by natural identifier and safe to re-run, so an
//! interrupted pass resumes on the next invocation without duplicating data.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tripdata_ingest::pipeline::LoadCoordinator;
//! use tripdata_ingest::repository::MemoryRepository;
//! use tripdata_ingest::IngestConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::default();
//!     let coordinator = LoadCoordinator::new(config, Arc::new(MemoryRepository::new()));
//!     let summary = coordinator.run_pass().await?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod error;
pub mod extract;
pub mod listing;
pub mod lock;
pub mod normalize;
pub mod pipeline;
pub mod repository;
pub mod staging;

pub use config::IngestConfig;
pub use error::{IngestError, Result};
pub use pipeline::{LoadCoordinator, PassState, PassSummary};
