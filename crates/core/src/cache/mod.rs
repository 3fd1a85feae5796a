//! Legacy SQLite cache store.
//!
//! This module provides the local crawl result cache using SQLite with async
//! access via tokio-rusqlite. It supports:
//!
//! - The legacy `crawled_data` row layout, read and written as-is
//! - Automatic schema migrations that adopt an existing database
//! - WAL mode for concurrent access
//! - Expiry filtering on read and an explicit purge

pub mod connection;
pub mod migrations;
pub mod results;
pub mod sessions;

pub use crate::Error;

pub use connection::CacheDb;
