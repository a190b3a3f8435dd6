//! Core types and shared functionality for reqcache.
//!
//! This crate provides:
//! - Cache keys and the [`BaseCache`] manager
//! - The caching policy engine
//! - Serializer pipelines
//! - Storage backends (memory, SQLite, filesystem, Redis, MongoDB/GridFS, DynamoDB)
//! - Unified error types
//! - Configuration structures

pub mod backends;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod policy;
pub mod serializers;

pub use backends::{BACKEND_NAMES, BackendSpec, Storage, init_backend};
pub use cache::{BaseCache, DeleteOptions, FilterOptions, KeyOptions, create_key};
pub use config::{CacheConfig, ConfigError};
pub use error::Error;
pub use models::{CachedRequest, CachedResponse, OriginResponse};
pub use policy::{CacheActions, CacheSettings, ExpireAfter, MatchHeaders, StaleSetting};
pub use serializers::{Payload, SerializerPipeline, init_serializer};
