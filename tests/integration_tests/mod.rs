//! Integration tests module
//!
//! End-to-end tests for crawlq. The SQLite queue and the in-memory
//! coordination store stand in for PostgreSQL and Redis, and wiremock plays
//! the crawled site, so nothing here needs external services.

pub mod coordinator_test;
pub mod fixtures;
pub mod pipeline_test;
pub mod queue_test;
pub mod worker_test;
