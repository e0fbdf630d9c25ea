use crate::config::EngineConfig;
use crate::models::{DateRange, ListQuery, OrgId, SourceId};
use crate::store::traits::{AgingLedger, FactStore, SyncCatalog};
use crate::sync::models::{
    DataSource, DataSourceInput, JobKind, JobStats, JobStatus, SourceKind, SyncJob, SyncJobQuery,
};
use crate::sync::traits::{
    Capability, ConnectionCheck, Connector, ConnectorContext, DataSync, UploadBatch,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Default `DataSync` implementation.
pub struct SyncEngine {
    catalog: Arc<dyn SyncCatalog>,
    facts: Arc<dyn FactStore>,
    connectors: RwLock<HashMap<SourceKind, Arc<dyn Connector>>>,
    config: EngineConfig,
}

/// What a sync does for a given source kind.
enum Dispatch {
    Pull(Arc<dyn Connector>),
    /// Data arrives through `ingest_upload`.
    ManualUpload,
    /// No connector registered for the kind, including `SourceKind::Other`.
    Unregistered,
}

impl SyncEngine {
    #[tracing::instrument(level = "debug", skip(catalog, facts))]
    pub fn new(catalog: Arc<dyn SyncCatalog>, facts: Arc<dyn FactStore>) -> Self {
        Self {
            catalog,
            facts,
            connectors: RwLock::new(HashMap::new()),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[tracing::instrument(level = "debug", skip_all, fields(org_id = %org_id, source_id = %source_id))]
    async fn load_source(&self, org_id: OrgId, source_id: SourceId) -> Result<DataSource> {
        self.catalog
            .get_data_source(org_id, source_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("data source '{source_id}' not found")))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(source_id = %source_id))]
    async fn load_active_source(&self, org_id: OrgId, source_id: SourceId) -> Result<DataSource> {
        let source = self.load_source(org_id, source_id).await?;
        if !source.active {
            return Err(Error::Conflict(format!(
                "data source '{}' is inactive",
                source.code
            )));
        }
        Ok(source)
    }

    #[tracing::instrument(level = "debug", skip(self, source), fields(kind = %source.kind))]
    async fn dispatch_for(&self, source: &DataSource) -> Dispatch {
        if source.kind == SourceKind::ManualUpload {
            return Dispatch::ManualUpload;
        }
        let connectors = self.connectors.read().await;
        match connectors.get(&source.kind) {
            Some(connector) => Dispatch::Pull(connector.clone()),
            None => {
                tracing::debug!("no connector registered");
                Dispatch::Unregistered
            }
        }
    }

    /// Pull every advertised fact family and write it through the fact store.
    #[tracing::instrument(level = "info", skip_all, fields(source_id = %ctx.source_id))]
    async fn pull_and_store(
        &self,
        connector: &dyn Connector,
        ctx: &ConnectorContext,
        range: DateRange,
    ) -> Result<JobStats> {
        let mut stats = JobStats::default();
        let org_id = ctx.org_id;

        for capability in connector.capabilities() {
            let written = match capability {
                Capability::SalesDaily => {
                    let rows = connector.pull_sales_daily(ctx, range.from, range.to).await;
                    match not_applicable_to_none(rows, *capability)? {
                        Some(rows) => self.facts.upsert_sales_daily(org_id, &rows).await?,
                        None => continue,
                    }
                }
                Capability::ArAging => {
                    let rows = connector.pull_ar_aging(ctx, range.to).await;
                    match not_applicable_to_none(rows, *capability)? {
                        Some(rows) => {
                            self.facts
                                .upsert_aging(org_id, AgingLedger::Receivable, &rows)
                                .await?
                        }
                        None => continue,
                    }
                }
                Capability::ApAging => {
                    let rows = connector.pull_ap_aging(ctx, range.to).await;
                    match not_applicable_to_none(rows, *capability)? {
                        Some(rows) => {
                            self.facts
                                .upsert_aging(org_id, AgingLedger::Payable, &rows)
                                .await?
                        }
                        None => continue,
                    }
                }
                Capability::Nps => {
                    let rows = connector.pull_nps(ctx, range.from, range.to).await;
                    match not_applicable_to_none(rows, *capability)? {
                        Some(rows) => self.facts.insert_nps(org_id, &rows).await?,
                        None => continue,
                    }
                }
                Capability::HrEvents => {
                    let rows = connector.pull_hr_events(ctx, range.from, range.to).await;
                    match not_applicable_to_none(rows, *capability)? {
                        Some(rows) => self.facts.insert_hr_events(org_id, &rows).await?,
                        None => continue,
                    }
                }
            };

            match capability {
                Capability::SalesDaily => stats.sales_rows += written,
                Capability::ArAging => stats.ar_aging_rows += written,
                Capability::ApAging => stats.ap_aging_rows += written,
                Capability::Nps => stats.nps_rows += written,
                Capability::HrEvents => stats.hr_rows += written,
            }
            tracing::debug!(capability = capability.as_str(), written, "facts stored");
        }

        Ok(stats)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn write_upload(&self, org_id: OrgId, batch: &UploadBatch) -> Result<JobStats> {
        Ok(JobStats {
            sales_rows: self.facts.upsert_sales_daily(org_id, &batch.sales).await?,
            nps_rows: self.facts.insert_nps(org_id, &batch.nps).await?,
            hr_rows: self.facts.insert_hr_events(org_id, &batch.hr_events).await?,
            ..Default::default()
        })
    }

    /// Record the job's durable `running` row before any external call.
    async fn start_job(&self, source: &DataSource, kind: JobKind) -> Result<SyncJob> {
        let job = SyncJob::new_running(source.org_id, source.id, kind, Utc::now());
        self.catalog.insert_sync_job(&job).await?;
        tracing::info!(job_id = %job.id, source_id = %source.id, kind = kind.as_str(), "sync job started");
        Ok(job)
    }

    /// Apply the single terminal transition for `outcome`.
    ///
    /// On failure the original error is returned after it has been recorded.
    async fn finish_job(
        &self,
        job: &SyncJob,
        outcome: Result<(JobStats, String)>,
    ) -> Result<SyncJob> {
        match outcome {
            Ok((stats, message)) => {
                match self
                    .catalog
                    .finish_sync_job(
                        job.org_id,
                        job.id,
                        JobStatus::Success,
                        &message,
                        stats,
                        Utc::now(),
                    )
                    .await
                {
                    Ok(done) => {
                        tracing::info!(job_id = %job.id, message = %done.message, "sync job succeeded");
                        Ok(done)
                    }
                    Err(e) => {
                        self.record_failure(job, &e, stats).await;
                        Err(e)
                    }
                }
            }
            Err(e) => {
                self.record_failure(job, &e, JobStats::default()).await;
                Err(e)
            }
        }
    }

    async fn record_failure(&self, job: &SyncJob, error: &Error, stats: JobStats) {
        let message = error_chain(error);
        tracing::warn!(job_id = %job.id, error = %message, "sync job failed");
        if let Err(store_err) = self
            .catalog
            .finish_sync_job(
                job.org_id,
                job.id,
                JobStatus::Error,
                &message,
                stats,
                Utc::now(),
            )
            .await
        {
            tracing::error!(job_id = %job.id, error = %store_err, "failed to record job error");
        }
    }
}

/// `error` followed by every wrapped cause, joined with `: `.
fn error_chain(error: &Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Maps `Error::Unsupported` to `None` so unsupported families are skipped.
fn not_applicable_to_none<T>(res: Result<T>, capability: Capability) -> Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_unsupported() => {
            tracing::debug!(capability = capability.as_str(), "capability not applicable");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl DataSync for SyncEngine {
    #[tracing::instrument(level = "debug", skip(self, connector))]
    async fn register_connector(&self, connector: Arc<dyn Connector>) -> Result<()> {
        let kind = connector.kind();
        if kind.as_str().trim().is_empty() {
            return Err(Error::InvalidInput("connector kind is empty".to_string()));
        }
        let mut connectors = self.connectors.write().await;
        connectors.insert(kind, connector);
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self, input), fields(org_id = %input.org_id, code = %input.code, kind = %input.kind))]
    async fn upsert_source(&self, input: DataSourceInput) -> Result<DataSource> {
        let source = DataSource::new(input, None)?;
        self.catalog.upsert_data_source(&source).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(org_id = %org_id))]
    async fn list_sources(&self, org_id: OrgId, query: ListQuery) -> Result<Vec<DataSource>> {
        self.catalog.list_data_sources(org_id, query).await
    }

    #[tracing::instrument(level = "info", skip_all, fields(org_id = %org_id, source_id = %source_id))]
    async fn deactivate_source(&self, org_id: OrgId, source_id: SourceId) -> Result<()> {
        self.catalog
            .set_data_source_active(org_id, source_id, false)
            .await
    }

    #[tracing::instrument(level = "info", skip_all, fields(org_id = %org_id, source_id = %source_id))]
    async fn test_source(&self, org_id: OrgId, source_id: SourceId) -> Result<ConnectionCheck> {
        let source = self.load_source(org_id, source_id).await?;
        let connector = match self.dispatch_for(&source).await {
            Dispatch::Pull(connector) => connector,
            Dispatch::ManualUpload => {
                return Ok(ConnectionCheck {
                    ok: true,
                    message: "manual upload source has no remote connection".to_string(),
                    sample_size: None,
                });
            }
            Dispatch::Unregistered => {
                return Ok(ConnectionCheck {
                    ok: false,
                    message: format!("no connector registered for kind '{}'", source.kind),
                    sample_size: None,
                });
            }
        };

        let ctx = ConnectorContext::for_source(&source);
        let timeout = self.config.test_timeout;
        match tokio::time::timeout(timeout, connector.test_connection(&ctx)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(format!(
                "connection test for '{}' exceeded {}ms",
                source.code,
                timeout.as_millis()
            ))),
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(org_id = %org_id, source_id = %source_id))]
    async fn trigger_sync(
        &self,
        org_id: OrgId,
        source_id: SourceId,
        range: Option<DateRange>,
    ) -> Result<SyncJob> {
        let range = match range {
            Some(r) => DateRange::new(r.from, r.to)?,
            None => DateRange::trailing_days(self.config.default_range_days),
        };

        // Configuration errors surface before any job exists.
        let source = self.load_active_source(org_id, source_id).await?;
        let dispatch = self.dispatch_for(&source).await;

        let job = self.start_job(&source, JobKind::Sync).await?;

        let outcome = match dispatch {
            Dispatch::Pull(connector) => {
                let ctx = ConnectorContext::for_source(&source);
                self.pull_and_store(connector.as_ref(), &ctx, range)
                    .await
                    .map(|stats| {
                        let message = format!(
                            "{} ({} to {})",
                            stats.summary(),
                            range.from,
                            range.to
                        );
                        (stats, message)
                    })
            }
            Dispatch::ManualUpload => Ok((
                JobStats::default(),
                "manual upload source: no automatic pull".to_string(),
            )),
            Dispatch::Unregistered => Ok((
                JobStats::default(),
                format!("no connector for kind '{}': nothing to sync", source.kind),
            )),
        };

        self.finish_job(&job, outcome).await
    }

    #[tracing::instrument(level = "info", skip_all, fields(org_id = %org_id, source_id = %source_id))]
    async fn ingest_upload(
        &self,
        org_id: OrgId,
        source_id: SourceId,
        batch: UploadBatch,
    ) -> Result<SyncJob> {
        let source = self.load_active_source(org_id, source_id).await?;
        if source.kind != SourceKind::ManualUpload {
            return Err(Error::InvalidInput(format!(
                "data source '{}' of kind '{}' does not accept uploads",
                source.code, source.kind
            )));
        }
        batch.validate()?;

        let job = self.start_job(&source, JobKind::Upload).await?;
        let outcome = self
            .write_upload(org_id, &batch)
            .await
            .map(|stats| (stats, format!("upload: {}", stats.summary())));
        self.finish_job(&job, outcome).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(org_id = %org_id))]
    async fn list_jobs(&self, org_id: OrgId, query: SyncJobQuery) -> Result<Vec<SyncJob>> {
        self.catalog.list_sync_jobs(org_id, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::{AgingBucket, AgingRow, HrEvent, NpsRow, SalesDaily};
    use crate::store::memory::MemoryStore;
    use crate::sync::models::Credentials;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[derive(Default)]
    struct FakeConnector {
        fail_with_auth: bool,
        hang: bool,
        pulls: AtomicU32,
    }

    #[async_trait]
    impl Connector for FakeConnector {
        fn kind(&self) -> SourceKind {
            SourceKind::Bitrix
        }

        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::SalesDaily, Capability::ArAging, Capability::Nps]
        }

        async fn test_connection(&self, _ctx: &ConnectorContext) -> Result<ConnectionCheck> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(ConnectionCheck {
                ok: true,
                message: "ok".to_string(),
                sample_size: Some(1),
            })
        }

        async fn pull_sales_daily(
            &self,
            _ctx: &ConnectorContext,
            from: NaiveDate,
            _to: NaiveDate,
        ) -> Result<Vec<SalesDaily>> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            if self.fail_with_auth {
                return Err(Error::Unauthorized("invalid_token".to_string()));
            }
            Ok(vec![SalesDaily {
                date: from,
                channel: Some("bitrix".to_string()),
                net_amount: Decimal::new(350, 0),
                gross_amount: Decimal::new(350, 0),
                orders: 2,
            }])
        }

        async fn pull_ar_aging(
            &self,
            _ctx: &ConnectorContext,
            as_of: NaiveDate,
        ) -> Result<Vec<AgingRow>> {
            Ok(AgingBucket::ALL
                .into_iter()
                .map(|bucket| AgingRow {
                    as_of_date: as_of,
                    bucket,
                    amount: Decimal::ZERO,
                })
                .collect())
        }

        // `pull_nps` is advertised but left at the default: treated as not applicable.
    }

    struct Harness {
        engine: SyncEngine,
        store: MemoryStore,
        org: OrgId,
    }

    async fn harness(connector: FakeConnector) -> Harness {
        let store = MemoryStore::new();
        let engine = SyncEngine::new(Arc::new(store.clone()), Arc::new(store.clone()));
        engine.register_connector(Arc::new(connector)).await.unwrap();
        Harness {
            engine,
            store,
            org: OrgId(Uuid::new_v4()),
        }
    }

    async fn add_source(h: &Harness, code: &str, kind: SourceKind, credentials: Credentials) -> DataSource {
        h.engine
            .upsert_source(DataSourceInput {
                org_id: h.org,
                code: code.to_string(),
                kind,
                name: code.to_string(),
                credentials,
                active: true,
            })
            .await
            .unwrap()
    }

    fn webhook() -> Credentials {
        Credentials::BitrixWebhook {
            base_url: "https://acme.bitrix24.com".to_string(),
            user_id: 1,
            token: "t".to_string(),
        }
    }

    fn may() -> DateRange {
        DateRange::new(d(2024, 5, 1), d(2024, 5, 31)).unwrap()
    }

    async fn all_jobs(h: &Harness) -> Vec<SyncJob> {
        h.engine
            .list_jobs(h.org, SyncJobQuery::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn successful_sync_records_success_and_rows() {
        let h = harness(FakeConnector::default()).await;
        let source = add_source(&h, "crm", SourceKind::Bitrix, webhook()).await;

        let job = h
            .engine
            .trigger_sync(h.org, source.id, Some(may()))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.stats.sales_rows, 1);
        assert_eq!(job.stats.ar_aging_rows, 4);
        assert_eq!(job.stats.nps_rows, 0);
        assert!(job.message.starts_with("sales: 1 rows, ar_aging: 4 rows"));
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn repeated_sync_does_not_duplicate_rows() {
        let h = harness(FakeConnector::default()).await;
        let source = add_source(&h, "crm", SourceKind::Bitrix, webhook()).await;

        h.engine.trigger_sync(h.org, source.id, Some(may())).await.unwrap();
        h.engine.trigger_sync(h.org, source.id, Some(may())).await.unwrap();

        let rows = h.store.list_sales_daily(h.org, may()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].net_amount, Decimal::new(350, 0));
        assert_eq!(all_jobs(&h).await.len(), 2);
    }

    #[tokio::test]
    async fn connector_error_is_recorded_and_returned() {
        let h = harness(FakeConnector {
            fail_with_auth: true,
            ..Default::default()
        })
        .await;
        let source = add_source(&h, "crm", SourceKind::Bitrix, webhook()).await;

        let err = h
            .engine
            .trigger_sync(h.org, source.id, Some(may()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(ref m) if m == "invalid_token"));

        let jobs = all_jobs(&h).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Error);
        assert!(jobs[0].message.contains("invalid_token"));
        assert!(jobs.iter().all(|j| j.status != JobStatus::Running));
    }

    #[tokio::test]
    async fn unknown_source_creates_no_job() {
        let h = harness(FakeConnector::default()).await;
        let err = h
            .engine
            .trigger_sync(h.org, SourceId::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(all_jobs(&h).await.is_empty());
    }

    #[tokio::test]
    async fn inactive_source_is_rejected_before_job() {
        let h = harness(FakeConnector::default()).await;
        let source = add_source(&h, "crm", SourceKind::Bitrix, webhook()).await;
        h.engine.deactivate_source(h.org, source.id).await.unwrap();

        let err = h
            .engine
            .trigger_sync(h.org, source.id, Some(may()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(all_jobs(&h).await.is_empty());
    }

    #[tokio::test]
    async fn manual_and_unrecognized_kinds_are_no_ops() {
        let h = harness(FakeConnector::default()).await;
        let manual = add_source(&h, "sheet", SourceKind::ManualUpload, Credentials::None).await;
        let future = add_source(
            &h,
            "future",
            SourceKind::Other("hubspot".to_string()),
            Credentials::None,
        )
        .await;

        let a = h.engine.trigger_sync(h.org, manual.id, Some(may())).await.unwrap();
        let b = h.engine.trigger_sync(h.org, future.id, Some(may())).await.unwrap();

        assert_eq!(a.status, JobStatus::Success);
        assert_eq!(b.status, JobStatus::Success);
        assert_eq!(a.stats.total() + b.stats.total(), 0);
    }

    #[tokio::test]
    async fn upload_writes_batch_for_manual_source() {
        let h = harness(FakeConnector::default()).await;
        let manual = add_source(&h, "sheet", SourceKind::ManualUpload, Credentials::None).await;
        let batch = UploadBatch {
            nps: vec![
                NpsRow::new(d(2024, 5, 3), None, 9, None).unwrap(),
                NpsRow::new(d(2024, 5, 4), None, 3, Some("slow".to_string())).unwrap(),
            ],
            ..Default::default()
        };

        let job = h.engine.ingest_upload(h.org, manual.id, batch).await.unwrap();
        assert_eq!(job.kind, JobKind::Upload);
        assert_eq!(job.stats.nps_rows, 2);
        assert_eq!(h.store.list_nps(h.org, may()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn upload_to_connector_source_is_rejected() {
        let h = harness(FakeConnector::default()).await;
        let source = add_source(&h, "crm", SourceKind::Bitrix, webhook()).await;
        let err = h
            .engine
            .ingest_upload(h.org, source.id, UploadBatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(all_jobs(&h).await.is_empty());
    }

    #[tokio::test]
    async fn test_source_times_out_without_job() {
        let h = harness(FakeConnector {
            hang: true,
            ..Default::default()
        })
        .await;
        let engine = h.engine;
        let engine = engine.with_config(EngineConfig {
            test_timeout: Duration::from_millis(20),
            ..EngineConfig::default()
        });
        let h = Harness { engine, ..h };
        let source = add_source(&h, "crm", SourceKind::Bitrix, webhook()).await;

        let err = h.engine.test_source(h.org, source.id).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(all_jobs(&h).await.is_empty());
    }

    /// Fact store whose aging writes fail with a wrapped I/O error.
    struct BrokenAgingStore(MemoryStore);

    #[async_trait]
    impl FactStore for BrokenAgingStore {
        async fn upsert_sales_daily(&self, org_id: OrgId, rows: &[SalesDaily]) -> Result<u64> {
            self.0.upsert_sales_daily(org_id, rows).await
        }

        async fn upsert_aging(
            &self,
            _org_id: OrgId,
            _ledger: AgingLedger,
            _rows: &[AgingRow],
        ) -> Result<u64> {
            Err(Error::backend(
                "sqlite_store",
                std::io::Error::new(std::io::ErrorKind::Other, "disk I/O error"),
            ))
        }

        async fn insert_nps(&self, org_id: OrgId, rows: &[NpsRow]) -> Result<u64> {
            self.0.insert_nps(org_id, rows).await
        }

        async fn insert_hr_events(&self, org_id: OrgId, rows: &[HrEvent]) -> Result<u64> {
            self.0.insert_hr_events(org_id, rows).await
        }

        async fn list_sales_daily(&self, org_id: OrgId, range: DateRange) -> Result<Vec<SalesDaily>> {
            self.0.list_sales_daily(org_id, range).await
        }

        async fn list_aging(
            &self,
            org_id: OrgId,
            ledger: AgingLedger,
            as_of: NaiveDate,
        ) -> Result<Vec<AgingRow>> {
            self.0.list_aging(org_id, ledger, as_of).await
        }

        async fn list_nps(&self, org_id: OrgId, range: DateRange) -> Result<Vec<NpsRow>> {
            self.0.list_nps(org_id, range).await
        }

        async fn list_hr_events(&self, org_id: OrgId, range: DateRange) -> Result<Vec<HrEvent>> {
            self.0.list_hr_events(org_id, range).await
        }
    }

    /// Catalog that refuses to record successful job completions.
    struct NoSuccessCatalog(MemoryStore);

    #[async_trait]
    impl SyncCatalog for NoSuccessCatalog {
        async fn upsert_data_source(&self, source: &DataSource) -> Result<DataSource> {
            self.0.upsert_data_source(source).await
        }

        async fn get_data_source(
            &self,
            org_id: OrgId,
            source_id: SourceId,
        ) -> Result<Option<DataSource>> {
            self.0.get_data_source(org_id, source_id).await
        }

        async fn get_data_source_by_code(
            &self,
            org_id: OrgId,
            code: &str,
        ) -> Result<Option<DataSource>> {
            self.0.get_data_source_by_code(org_id, code).await
        }

        async fn list_data_sources(&self, org_id: OrgId, query: ListQuery) -> Result<Vec<DataSource>> {
            self.0.list_data_sources(org_id, query).await
        }

        async fn set_data_source_active(
            &self,
            org_id: OrgId,
            source_id: SourceId,
            active: bool,
        ) -> Result<()> {
            self.0.set_data_source_active(org_id, source_id, active).await
        }

        async fn insert_sync_job(&self, job: &SyncJob) -> Result<()> {
            self.0.insert_sync_job(job).await
        }

        async fn finish_sync_job(
            &self,
            org_id: OrgId,
            job_id: Uuid,
            status: JobStatus,
            message: &str,
            stats: JobStats,
            finished_at: chrono::DateTime<Utc>,
        ) -> Result<SyncJob> {
            if status == JobStatus::Success {
                return Err(Error::BackendMessage("catalog write rejected".to_string()));
            }
            self.0
                .finish_sync_job(org_id, job_id, status, message, stats, finished_at)
                .await
        }

        async fn list_sync_jobs(&self, org_id: OrgId, query: SyncJobQuery) -> Result<Vec<SyncJob>> {
            self.0.list_sync_jobs(org_id, query).await
        }
    }

    async fn harness_with(
        catalog: Arc<dyn SyncCatalog>,
        facts: Arc<dyn FactStore>,
        store: MemoryStore,
    ) -> Harness {
        let engine = SyncEngine::new(catalog, facts);
        engine
            .register_connector(Arc::new(FakeConnector::default()))
            .await
            .unwrap();
        Harness {
            engine,
            store,
            org: OrgId(Uuid::new_v4()),
        }
    }

    #[tokio::test]
    async fn fact_store_failure_is_recorded_with_its_cause() {
        let store = MemoryStore::new();
        let h = harness_with(
            Arc::new(store.clone()),
            Arc::new(BrokenAgingStore(store.clone())),
            store,
        )
        .await;
        let source = add_source(&h, "crm", SourceKind::Bitrix, webhook()).await;

        let err = h
            .engine
            .trigger_sync(h.org, source.id, Some(may()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend { ref context, .. } if context == "sqlite_store"));

        let jobs = all_jobs(&h).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Error);
        assert_eq!(jobs[0].message, "backend error: sqlite_store: disk I/O error");
        assert!(jobs[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn failed_success_write_falls_back_to_error() {
        let store = MemoryStore::new();
        let h = harness_with(
            Arc::new(NoSuccessCatalog(store.clone())),
            Arc::new(store.clone()),
            store,
        )
        .await;
        let source = add_source(&h, "crm", SourceKind::Bitrix, webhook()).await;

        let err = h
            .engine
            .trigger_sync(h.org, source.id, Some(may()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendMessage(ref m) if m == "catalog write rejected"));

        let jobs = all_jobs(&h).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Error);
        assert!(jobs[0].message.contains("catalog write rejected"));
        // Stats of the completed pull are kept on the error row.
        assert_eq!(jobs[0].stats.sales_rows, 1);
    }

    #[test]
    fn error_chain_includes_wrapped_causes() {
        let err = Error::backend_reqwest(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert_eq!(error_chain(&err), "backend error: reqwest: connection refused");
        assert_eq!(
            error_chain(&Error::Unauthorized("expired".to_string())),
            "unauthorized: expired"
        );
    }

    #[derive(Clone, Default)]
    struct LogSink(Arc<std::sync::Mutex<Vec<u8>>>);

    struct LogSinkWriter(Arc<std::sync::Mutex<Vec<u8>>>);

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogSink {
        type Writer = LogSinkWriter;

        fn make_writer(&'a self) -> Self::Writer {
            LogSinkWriter(Arc::clone(&self.0))
        }
    }

    impl std::io::Write for LogSinkWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn sync_span_records_plain_ids() {
        let h = harness(FakeConnector::default()).await;
        let manual = add_source(&h, "sheet", SourceKind::ManualUpload, Credentials::None).await;

        let sink = LogSink::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(sink.clone())
            .json()
            .with_max_level(tracing::Level::INFO)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        h.engine.trigger_sync(h.org, manual.id, Some(may())).await.unwrap();

        let text = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        let started = text
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap())
            .find(|v| v["fields"]["message"] == "sync job started")
            .expect("start event");
        let span = &started["span"];
        assert_eq!(span["name"], "trigger_sync");
        assert_eq!(span["org_id"], h.org.to_string());
        assert_eq!(span["source_id"], manual.id.to_string());
        assert!(!text.contains("OrgId("));
    }

    #[tokio::test]
    async fn known_kind_without_connector_is_a_no_op() {
        let h = harness(FakeConnector::default()).await;
        let source = add_source(
            &h,
            "erp",
            SourceKind::Odoo,
            Credentials::OdooSession {
                base_url: "https://erp.example".to_string(),
                database: "prod".to_string(),
                username: "u".to_string(),
                password: "p".to_string(),
            },
        )
        .await;

        let job = h.engine.trigger_sync(h.org, source.id, None).await.unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.stats.total(), 0);

        let check = h.engine.test_source(h.org, source.id).await.unwrap();
        assert!(!check.ok);
    }
}
