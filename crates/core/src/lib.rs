//! Core types and shared functionality for crawlstore.
//!
//! This crate provides:
//! - Cache keys, the crawl result model and the size-bounded document codec
//! - The `CacheBackend` interface with the legacy SQLite and in-memory stores
//! - Percentage-based routing between the legacy and remote stores
//! - The resumable legacy-to-remote migrator
//! - Unified error types and layered configuration

pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod key;
pub mod migrate;
pub mod model;
pub mod router;

pub use backend::{BatchResult, CacheBackend, MemoryBackend, ScanItem, ScanPage};
pub use cache::CacheDb;
pub use codec::{Codec, Document, Encoded};
pub use config::{AppConfig, ConfigError, ReadConsistency};
pub use error::Error;
pub use key::CacheKey;
pub use migrate::{MigrationOptions, MigrationPhase, MigrationReport, Migrator};
pub use model::{CachedResult, MarkdownVariants, SessionState};
pub use router::{HybridRouter, RouteOverride, RouterPolicy, Target};
