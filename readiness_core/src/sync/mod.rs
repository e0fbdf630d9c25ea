//! Multi-source synchronization.
//!
//! - `traits::Connector` is the contract each integration implements
//! - `engine::SyncEngine` resolves a data source, runs its connector and
//!   writes the resulting facts through a `FactStore`
//! - every attempt is tracked as a `models::SyncJob`

pub mod engine;
pub mod models;
pub mod traits;
