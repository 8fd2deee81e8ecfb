//! HTTP surface of the VOD pipeline.
//!
//! This crate provides:
//! - The streaming cache gateway (detail, manifest/segment delivery, listing)
//! - Source uploads and run submission
//! - Health, readiness and Prometheus metrics endpoints

pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use gateway::{GatewayConfig, GatewayError, GatewayResult, StreamResponse, StreamingGateway};
pub use routes::create_router;
pub use state::{AppState, RunSubmitter};
