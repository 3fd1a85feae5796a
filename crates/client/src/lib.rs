//! Remote store client for crawlstore.
//!
//! This crate provides the DynamoDB adapter (JSON protocol, SigV4 signing,
//! retry with backoff, throttling-aware batch reads) and the factory that
//! opens both cache stores from configuration.

pub mod dynamo;
pub mod factory;

pub use dynamo::{DynamoBackend, DynamoClient, DynamoConfig, DynamoError, RetryPolicy};
pub use factory::{Backends, open_backends};
