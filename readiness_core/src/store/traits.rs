use crate::facts::{AgingRow, HrEvent, NpsRow, SalesDaily};
use crate::models::{DateRange, ListQuery, OrgId, SourceId};
use crate::sync::models::{DataSource, JobStats, JobStatus, SyncJob, SyncJobQuery};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Which aging table a snapshot belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgingLedger {
    Receivable,
    Payable,
}

impl AgingLedger {
    pub fn table(&self) -> &'static str {
        match self {
            AgingLedger::Receivable => "ar_aging",
            AgingLedger::Payable => "ap_aging",
        }
    }
}

/// Durable storage for canonical facts.
///
/// Sales and aging writes are upserts on their natural keys and replace
/// existing amounts, so re-running a sync never double-counts. NPS and HR
/// events are insert-only. Every write returns without touching storage when
/// given an empty slice.
#[async_trait]
pub trait FactStore: Send + Sync {
    /// Upsert keyed on (org_id, date, channel). Returns rows written.
    async fn upsert_sales_daily(&self, org_id: OrgId, rows: &[SalesDaily]) -> Result<u64>;

    /// Upsert keyed on (org_id, as_of_date, bucket).
    async fn upsert_aging(&self, org_id: OrgId, ledger: AgingLedger, rows: &[AgingRow])
    -> Result<u64>;

    async fn insert_nps(&self, org_id: OrgId, rows: &[NpsRow]) -> Result<u64>;

    async fn insert_hr_events(&self, org_id: OrgId, rows: &[HrEvent]) -> Result<u64>;

    /// Rows ordered by (date, channel).
    async fn list_sales_daily(&self, org_id: OrgId, range: DateRange) -> Result<Vec<SalesDaily>>;

    /// Rows ordered by bucket.
    async fn list_aging(
        &self,
        org_id: OrgId,
        ledger: AgingLedger,
        as_of: NaiveDate,
    ) -> Result<Vec<AgingRow>>;

    async fn list_nps(&self, org_id: OrgId, range: DateRange) -> Result<Vec<NpsRow>>;

    async fn list_hr_events(&self, org_id: OrgId, range: DateRange) -> Result<Vec<HrEvent>>;
}

/// Data source configuration and sync job history.
#[async_trait]
pub trait SyncCatalog: Send + Sync {
    /// Insert or update on (org_id, code). An existing row keeps its id and
    /// `created_at`. Returns the stored source.
    async fn upsert_data_source(&self, source: &DataSource) -> Result<DataSource>;

    async fn get_data_source(&self, org_id: OrgId, source_id: SourceId)
    -> Result<Option<DataSource>>;

    async fn get_data_source_by_code(&self, org_id: OrgId, code: &str)
    -> Result<Option<DataSource>>;

    async fn list_data_sources(&self, org_id: OrgId, query: ListQuery) -> Result<Vec<DataSource>>;

    async fn set_data_source_active(
        &self,
        org_id: OrgId,
        source_id: SourceId,
        active: bool,
    ) -> Result<()>;

    async fn insert_sync_job(&self, job: &SyncJob) -> Result<()>;

    /// Terminal transition of a running job. Fails with `Conflict` when the
    /// job is missing or already finished.
    async fn finish_sync_job(
        &self,
        org_id: OrgId,
        job_id: uuid::Uuid,
        status: JobStatus,
        message: &str,
        stats: JobStats,
        finished_at: DateTime<Utc>,
    ) -> Result<SyncJob>;

    /// Newest first.
    async fn list_sync_jobs(&self, org_id: OrgId, query: SyncJobQuery) -> Result<Vec<SyncJob>>;
}
