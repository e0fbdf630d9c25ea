//! In-process store used by tests, dry runs and the CLI `--memory` mode.

use crate::facts::{AgingBucket, AgingRow, HrEvent, NpsRow, SalesDaily};
use crate::models::{DateRange, ListQuery, OrgId, SourceId};
use crate::store::traits::{AgingLedger, FactStore, SyncCatalog};
use crate::sync::models::{DataSource, JobStats, JobStatus, SyncJob, SyncJobQuery};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

type SalesKey = (OrgId, NaiveDate, String);
type AgingKey = (OrgId, AgingLedger, NaiveDate, AgingBucket);

#[derive(Clone, Default)]
pub struct MemoryStore {
    sales: Arc<RwLock<HashMap<SalesKey, SalesDaily>>>,
    aging: Arc<RwLock<HashMap<AgingKey, Decimal>>>,
    nps: Arc<RwLock<Vec<(OrgId, NpsRow)>>>,
    hr_events: Arc<RwLock<Vec<(OrgId, HrEvent)>>>,
    sources: Arc<RwLock<HashMap<(OrgId, String), DataSource>>>,
    jobs: Arc<RwLock<Vec<SyncJob>>>,
}

impl MemoryStore {
    #[tracing::instrument(level = "debug")]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FactStore for MemoryStore {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn upsert_sales_daily(&self, org_id: OrgId, rows: &[SalesDaily]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut sales = self.sales.write().await;
        for row in rows {
            row.validate()?;
            let channel = row.channel_key().to_string();
            let stored = SalesDaily {
                channel: Some(channel.clone()),
                ..row.clone()
            };
            sales.insert((org_id, row.date, channel), stored);
        }
        Ok(rows.len() as u64)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn upsert_aging(
        &self,
        org_id: OrgId,
        ledger: AgingLedger,
        rows: &[AgingRow],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut aging = self.aging.write().await;
        for row in rows {
            aging.insert((org_id, ledger, row.as_of_date, row.bucket), row.amount);
        }
        Ok(rows.len() as u64)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn insert_nps(&self, org_id: OrgId, rows: &[NpsRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut nps = self.nps.write().await;
        for row in rows {
            row.validate()?;
            nps.push((org_id, row.clone()));
        }
        Ok(rows.len() as u64)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn insert_hr_events(&self, org_id: OrgId, rows: &[HrEvent]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut events = self.hr_events.write().await;
        for row in rows {
            row.validate()?;
            events.push((org_id, row.clone()));
        }
        Ok(rows.len() as u64)
    }

    async fn list_sales_daily(&self, org_id: OrgId, range: DateRange) -> Result<Vec<SalesDaily>> {
        let sales = self.sales.read().await;
        let mut rows: Vec<SalesDaily> = sales
            .iter()
            .filter(|((org, date, _), _)| *org == org_id && range.contains(*date))
            .map(|(_, row)| row.clone())
            .collect();
        rows.sort_by(|a, b| (a.date, a.channel_key()).cmp(&(b.date, b.channel_key())));
        Ok(rows)
    }

    async fn list_aging(
        &self,
        org_id: OrgId,
        ledger: AgingLedger,
        as_of: NaiveDate,
    ) -> Result<Vec<AgingRow>> {
        let aging = self.aging.read().await;
        let mut rows: Vec<AgingRow> = aging
            .iter()
            .filter(|((org, l, date, _), _)| *org == org_id && *l == ledger && *date == as_of)
            .map(|((_, _, date, bucket), amount)| AgingRow {
                as_of_date: *date,
                bucket: *bucket,
                amount: *amount,
            })
            .collect();
        rows.sort_by_key(|r| r.bucket);
        Ok(rows)
    }

    async fn list_nps(&self, org_id: OrgId, range: DateRange) -> Result<Vec<NpsRow>> {
        let nps = self.nps.read().await;
        Ok(nps
            .iter()
            .filter(|(org, row)| *org == org_id && range.contains(row.date))
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn list_hr_events(&self, org_id: OrgId, range: DateRange) -> Result<Vec<HrEvent>> {
        let events = self.hr_events.read().await;
        Ok(events
            .iter()
            .filter(|(org, row)| *org == org_id && range.contains(row.date))
            .map(|(_, row)| row.clone())
            .collect())
    }
}

#[async_trait]
impl SyncCatalog for MemoryStore {
    #[tracing::instrument(level = "debug", skip_all)]
    async fn upsert_data_source(&self, source: &DataSource) -> Result<DataSource> {
        let mut sources = self.sources.write().await;
        let key = (source.org_id, source.code.clone());
        let stored = match sources.get(&key) {
            Some(existing) => DataSource {
                id: existing.id,
                created_at: existing.created_at,
                ..source.clone()
            },
            None => source.clone(),
        };
        sources.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get_data_source(
        &self,
        org_id: OrgId,
        source_id: SourceId,
    ) -> Result<Option<DataSource>> {
        let sources = self.sources.read().await;
        Ok(sources
            .values()
            .find(|s| s.org_id == org_id && s.id == source_id)
            .cloned())
    }

    async fn get_data_source_by_code(
        &self,
        org_id: OrgId,
        code: &str,
    ) -> Result<Option<DataSource>> {
        let sources = self.sources.read().await;
        Ok(sources.get(&(org_id, code.to_string())).cloned())
    }

    async fn list_data_sources(&self, org_id: OrgId, query: ListQuery) -> Result<Vec<DataSource>> {
        let sources = self.sources.read().await;
        let mut rows: Vec<DataSource> = sources
            .values()
            .filter(|s| s.org_id == org_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(rows
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn set_data_source_active(
        &self,
        org_id: OrgId,
        source_id: SourceId,
        active: bool,
    ) -> Result<()> {
        let mut sources = self.sources.write().await;
        let source = sources
            .values_mut()
            .find(|s| s.org_id == org_id && s.id == source_id)
            .ok_or_else(|| Error::NotFound(format!("data source '{source_id}' not found")))?;
        source.active = active;
        source.touch(Utc::now());
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn insert_sync_job(&self, job: &SyncJob) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.iter().any(|j| j.id == job.id) {
            return Err(Error::Conflict(format!("sync job {} already exists", job.id)));
        }
        jobs.push(job.clone());
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn finish_sync_job(
        &self,
        org_id: OrgId,
        job_id: Uuid,
        status: JobStatus,
        message: &str,
        stats: JobStats,
        finished_at: DateTime<Utc>,
    ) -> Result<SyncJob> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.org_id == org_id && j.id == job_id)
            .ok_or_else(|| Error::Conflict(format!("sync job {job_id} not found")))?;
        job.finish(status, message, finished_at)?;
        job.stats = stats;
        Ok(job.clone())
    }

    async fn list_sync_jobs(&self, org_id: OrgId, query: SyncJobQuery) -> Result<Vec<SyncJob>> {
        let jobs = self.jobs.read().await;
        let mut rows: Vec<SyncJob> = jobs
            .iter()
            .filter(|j| j.org_id == org_id)
            .filter(|j| query.source_id.map_or(true, |s| j.source_id == s))
            .filter(|j| query.status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(rows
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }
}
