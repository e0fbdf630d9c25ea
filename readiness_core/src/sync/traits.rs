use crate::facts::{AgingRow, HrEvent, NpsRow, SalesDaily};
use crate::models::{DateRange, ListQuery, OrgId, SourceId};
use crate::sync::models::{
    Credentials, DataSource, DataSourceInput, SourceKind, SyncJob, SyncJobQuery,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Fact families a connector can pull.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    SalesDaily,
    ArAging,
    ApAging,
    Nps,
    HrEvents,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::SalesDaily => "sales_daily",
            Capability::ArAging => "ar_aging",
            Capability::ApAging => "ap_aging",
            Capability::Nps => "nps",
            Capability::HrEvents => "hr_events",
        }
    }
}

/// Per-call context handed to a connector. Only the connector interprets
/// `credentials`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorContext {
    pub org_id: OrgId,
    pub source_id: SourceId,
    pub credentials: Credentials,
}

impl ConnectorContext {
    pub fn for_source(source: &DataSource) -> Self {
        Self {
            org_id: source.org_id,
            source_id: source.id,
            credentials: source.credentials.clone(),
        }
    }
}

/// Result of a credential check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionCheck {
    pub ok: bool,
    pub message: String,
    /// Records visible in the minimal read, when the source reports it.
    pub sample_size: Option<u64>,
}

fn unsupported(connector: &str, capability: Capability) -> Error {
    Error::Unsupported(format!(
        "connector '{connector}' does not provide {}",
        capability.as_str()
    ))
}

/// An integration with one external business system.
///
/// Implementations live in `readiness_integrations` or customer code. Each
/// fact-family operation defaults to `Error::Unsupported`; connectors override
/// the subset they advertise in `capabilities()`.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Source kind served by this connector.
    fn kind(&self) -> SourceKind;

    fn capabilities(&self) -> &'static [Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Minimal read that proves the credentials work. Must not persist anything.
    async fn test_connection(&self, ctx: &ConnectorContext) -> Result<ConnectionCheck>;

    async fn pull_sales_daily(
        &self,
        _ctx: &ConnectorContext,
        _from: NaiveDate,
        _to: NaiveDate,
    ) -> Result<Vec<SalesDaily>> {
        Err(unsupported(self.kind().as_str(), Capability::SalesDaily))
    }

    async fn pull_ar_aging(
        &self,
        _ctx: &ConnectorContext,
        _as_of: NaiveDate,
    ) -> Result<Vec<AgingRow>> {
        Err(unsupported(self.kind().as_str(), Capability::ArAging))
    }

    async fn pull_ap_aging(
        &self,
        _ctx: &ConnectorContext,
        _as_of: NaiveDate,
    ) -> Result<Vec<AgingRow>> {
        Err(unsupported(self.kind().as_str(), Capability::ApAging))
    }

    async fn pull_nps(
        &self,
        _ctx: &ConnectorContext,
        _from: NaiveDate,
        _to: NaiveDate,
    ) -> Result<Vec<NpsRow>> {
        Err(unsupported(self.kind().as_str(), Capability::Nps))
    }

    async fn pull_hr_events(
        &self,
        _ctx: &ConnectorContext,
        _from: NaiveDate,
        _to: NaiveDate,
    ) -> Result<Vec<HrEvent>> {
        Err(unsupported(self.kind().as_str(), Capability::HrEvents))
    }
}

/// Rows delivered through the manual upload path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadBatch {
    #[serde(default)]
    pub sales: Vec<SalesDaily>,
    #[serde(default)]
    pub nps: Vec<NpsRow>,
    #[serde(default)]
    pub hr_events: Vec<HrEvent>,
}

impl UploadBatch {
    pub fn is_empty(&self) -> bool {
        self.sales.is_empty() && self.nps.is_empty() && self.hr_events.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        for row in &self.sales {
            row.validate()?;
        }
        for row in &self.nps {
            row.validate()?;
        }
        for row in &self.hr_events {
            row.validate()?;
        }
        Ok(())
    }
}

/// Inbound trigger surface consumed by UI/ops tooling.
#[async_trait]
pub trait DataSync: Send + Sync {
    /// Register an in-process connector for its source kind.
    async fn register_connector(&self, connector: std::sync::Arc<dyn Connector>) -> Result<()>;

    /// Create or update a source, keyed on (org_id, code).
    async fn upsert_source(&self, input: DataSourceInput) -> Result<DataSource>;

    async fn list_sources(&self, org_id: OrgId, query: ListQuery) -> Result<Vec<DataSource>>;

    async fn deactivate_source(&self, org_id: OrgId, source_id: SourceId) -> Result<()>;

    /// Verify credentials with a bounded minimal read. Creates no job.
    async fn test_source(&self, org_id: OrgId, source_id: SourceId) -> Result<ConnectionCheck>;

    /// Pull and persist facts for a source. Defaults to the configured trailing window.
    async fn trigger_sync(
        &self,
        org_id: OrgId,
        source_id: SourceId,
        range: Option<DateRange>,
    ) -> Result<SyncJob>;

    /// Persist a manually uploaded batch for a `manual_upload` source.
    async fn ingest_upload(
        &self,
        org_id: OrgId,
        source_id: SourceId,
        batch: UploadBatch,
    ) -> Result<SyncJob>;

    async fn list_jobs(&self, org_id: OrgId, query: SyncJobQuery) -> Result<Vec<SyncJob>>;
}
