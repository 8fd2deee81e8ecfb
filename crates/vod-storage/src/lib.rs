//! Object storage for the VOD pipeline.
//!
//! This crate provides:
//! - The [`ObjectStore`] capability with S3 and in-memory implementations
//! - Signed read URLs (S3 presigning or CDN HMAC tokens)
//! - The rendition object key layout and content types
//! - The [`StreamCache`] capability with Redis and in-memory implementations

pub mod cache;
pub mod client;
pub mod delivery;
pub mod error;
pub mod keys;
pub mod store;

pub use cache::{MemoryStreamCache, NoopStreamCache, RedisStreamCache, StreamCache};
pub use client::{S3Config, S3ObjectStore};
pub use delivery::{CdnConfig, CdnSigner, DeliveryToken};
pub use error::{StorageError, StorageResult};
pub use store::{MemoryObjectStore, ObjectStore, StoredObject};
