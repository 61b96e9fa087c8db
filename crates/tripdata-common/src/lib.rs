//! Tripdata Common Library
//!
//! Shared types, utilities, and error handling for the tripdata workspace.
//!
//! # Overview
//!
//! This crate provides common functionality used across all tripdata
//! workspace members:
//!
//! - **Error Handling**: Custom error types and result types
//! - **Logging**: Centralized tracing configuration and initialization
//! - **Types**: Shared domain types (archive descriptors, file records,
//!   stations, bikes, rides)
//!
//! # Example
//!
//! ```no_run
//! use tripdata_common::types::ArchiveDescriptor;
//! use chrono::Utc;
//!
//! let archive = ArchiveDescriptor {
//!     name: "202101-citibike-tripdata.zip".to_string(),
//!     last_modified: Utc::now(),
//!     size_bytes: 1_048_576,
//! };
//! println!("candidate archive: {}", archive);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
