//! Persistence for canonical facts, data sources and sync jobs.
//!
//! `SqliteStore` is the durable backend; `MemoryStore` backs tests and dry
//! runs. Both rely on unique-key upserts as the only concurrency guard.

pub mod memory;
pub mod sqlite;
pub mod traits;
