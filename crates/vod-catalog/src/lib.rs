//! Video catalog for the VOD pipeline.
//!
//! Three tables back the pipeline:
//! - `videos`: one row per upload with its processing state
//! - `video_streams`: one row per rendition, unique on
//!   `(video_id, resolution, format)`
//! - `pipeline_runs`: durable orchestrator progress
//!
//! [`PgCatalog`] is the production backend; [`MemoryCatalog`] serves tests
//! and local development.

pub mod error;
pub mod memory;
pub mod metrics;
pub mod postgres;
pub mod retry;
pub mod store;

pub use error::{CatalogError, CatalogResult};
pub use memory::MemoryCatalog;
pub use postgres::{CatalogConfig, PgCatalog};
pub use retry::{with_retry, RetryConfig};
pub use store::{resolution_area, sort_renditions, CatalogStore};
