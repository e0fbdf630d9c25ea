//! Readiness core: canonical facts, the connector contract, persistence and
//! the sync job orchestrator.

pub mod config;
pub mod error;
pub mod facts;
pub mod models;
pub mod o11y;
pub mod retry;
pub mod store;
pub mod sync;

pub use error::{Error, Result};
pub use facts::{AgingBucket, AgingRow, HrAction, HrEvent, NpsRow, SalesDaily};
pub use models::{DateRange, ListQuery, OrgId, SourceId};
pub use store::traits::{AgingLedger, FactStore, SyncCatalog};
pub use sync::engine::SyncEngine;
pub use sync::models::{
    Credentials, DataSource, DataSourceInput, JobKind, JobStats, JobStatus, SourceKind, SyncJob,
    SyncJobQuery,
};
pub use sync::traits::{
    Capability, ConnectionCheck, Connector, ConnectorContext, DataSync, UploadBatch,
};
