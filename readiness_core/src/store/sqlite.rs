//! SQLite-backed `FactStore` + `SyncCatalog`.
//!
//! Persists canonical facts, data sources and sync jobs in a single WAL-mode
//! SQLite file. Unique indexes on the fact keys back the idempotent upserts.
//!
//! Usage:
//! ```ignore
//! let store = SqliteStore::new("/path/to/readiness.db", 5).await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::facts::{AgingBucket, AgingRow, HrAction, HrEvent, NpsRow, SalesDaily};
use crate::models::{DateRange, ListQuery, OrgId, SourceId};
use crate::store::traits::{AgingLedger, FactStore, SyncCatalog};
use crate::sync::models::{
    Credentials, DataSource, JobKind, JobStats, JobStatus, SourceKind, SyncJob, SyncJobQuery,
};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create (or open) the store at the given file path.
    ///
    /// Creates the file and parent directories if they don't exist and runs
    /// the schema migration.
    pub async fn new(path: impl AsRef<Path>, max_connections: u32) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::backend("sqlite_store", e))?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(|e| Error::backend("sqlite_store", e))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("sqlite_store", e))?;

        Self::migrate(pool).await
    }

    /// Private in-memory database. Limited to one connection so every query
    /// sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::backend("sqlite_store", e))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("sqlite_store", e))?;
        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| Error::backend("sqlite_store_migration", e))?;
        Ok(Self { pool })
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sales_daily (
    org_id TEXT NOT NULL,
    date TEXT NOT NULL,
    channel TEXT NOT NULL,
    net_amount TEXT NOT NULL,
    gross_amount TEXT NOT NULL,
    orders INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (org_id, date, channel)
);

CREATE TABLE IF NOT EXISTS ar_aging (
    org_id TEXT NOT NULL,
    as_of_date TEXT NOT NULL,
    bucket TEXT NOT NULL,
    amount TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (org_id, as_of_date, bucket)
);

CREATE TABLE IF NOT EXISTS ap_aging (
    org_id TEXT NOT NULL,
    as_of_date TEXT NOT NULL,
    bucket TEXT NOT NULL,
    amount TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (org_id, as_of_date, bucket)
);

CREATE TABLE IF NOT EXISTS nps_responses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id TEXT NOT NULL,
    date TEXT NOT NULL,
    respondent_id TEXT,
    score INTEGER NOT NULL,
    comment TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS nps_org_date_idx ON nps_responses(org_id, date);

CREATE TABLE IF NOT EXISTS hr_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    org_id TEXT NOT NULL,
    date TEXT NOT NULL,
    employee_id TEXT NOT NULL,
    action TEXT NOT NULL,
    department TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS hr_org_date_idx ON hr_events(org_id, date);

CREATE TABLE IF NOT EXISTS data_sources (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    code TEXT NOT NULL,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    credentials TEXT NOT NULL,
    active INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (org_id, code)
);

CREATE TABLE IF NOT EXISTS sync_jobs (
    id TEXT PRIMARY KEY,
    org_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    message TEXT NOT NULL,
    stats_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS sync_jobs_org_started_idx ON sync_jobs(org_id, started_at);
"#;

// ── Helpers ─────────────────────────────────────────────────────

fn db_err(e: sqlx::Error) -> Error {
    Error::backend("sqlite_store", e)
}

fn corrupt(column: &str, value: &str) -> Error {
    Error::BackendMessage(format!("sqlite_store: invalid {column} value '{value}'"))
}

fn parse_date(column: &str, s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| corrupt(column, s))
}

fn parse_dt(column: &str, s: &str) -> Result<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>().map_err(|_| corrupt(column, s))
}

fn parse_decimal(column: &str, s: &str) -> Result<Decimal> {
    Decimal::from_str(s).map_err(|_| corrupt(column, s))
}

fn parse_uuid(column: &str, s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|_| corrupt(column, s))
}

const SOURCE_COLUMNS: &str =
    "id, org_id, code, kind, name, credentials, active, created_at, updated_at";

const JOB_COLUMNS: &str =
    "id, org_id, source_id, kind, status, started_at, finished_at, message, stats_json";

// ── FactStore impl ──────────────────────────────────────────────

#[async_trait]
impl FactStore for SqliteStore {
    #[tracing::instrument(level = "debug", skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_sales_daily(&self, org_id: OrgId, rows: &[SalesDaily]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in rows {
            row.validate()?;
            sqlx::query(
                "INSERT INTO sales_daily (org_id, date, channel, net_amount, gross_amount, orders, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(org_id, date, channel) DO UPDATE SET
                   net_amount = excluded.net_amount,
                   gross_amount = excluded.gross_amount,
                   orders = excluded.orders,
                   updated_at = excluded.updated_at",
            )
            .bind(org_id.to_string())
            .bind(row.date.to_string())
            .bind(row.channel_key())
            .bind(row.net_amount.to_string())
            .bind(row.gross_amount.to_string())
            .bind(row.orders as i64)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(rows.len() as u64)
    }

    #[tracing::instrument(level = "debug", skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_aging(
        &self,
        org_id: OrgId,
        ledger: AgingLedger,
        rows: &[AgingRow],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        // Table name comes from a closed enum, never from input.
        let sql = format!(
            "INSERT INTO {} (org_id, as_of_date, bucket, amount, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(org_id, as_of_date, bucket) DO UPDATE SET
               amount = excluded.amount,
               updated_at = excluded.updated_at",
            ledger.table()
        );
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in rows {
            sqlx::query(&sql)
                .bind(org_id.to_string())
                .bind(row.as_of_date.to_string())
                .bind(row.bucket.as_str())
                .bind(row.amount.to_string())
                .bind(&now)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(rows.len() as u64)
    }

    #[tracing::instrument(level = "debug", skip(self, rows), fields(rows = rows.len()))]
    async fn insert_nps(&self, org_id: OrgId, rows: &[NpsRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in rows {
            row.validate()?;
            sqlx::query(
                "INSERT INTO nps_responses (org_id, date, respondent_id, score, comment, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(org_id.to_string())
            .bind(row.date.to_string())
            .bind(&row.respondent_id)
            .bind(i64::from(row.score))
            .bind(&row.comment)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(rows.len() as u64)
    }

    #[tracing::instrument(level = "debug", skip(self, rows), fields(rows = rows.len()))]
    async fn insert_hr_events(&self, org_id: OrgId, rows: &[HrEvent]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in rows {
            row.validate()?;
            sqlx::query(
                "INSERT INTO hr_events (org_id, date, employee_id, action, department, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(org_id.to_string())
            .bind(row.date.to_string())
            .bind(&row.employee_id)
            .bind(row.action.as_str())
            .bind(&row.department)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(rows.len() as u64)
    }

    async fn list_sales_daily(&self, org_id: OrgId, range: DateRange) -> Result<Vec<SalesDaily>> {
        let rows = sqlx::query(
            "SELECT date, channel, net_amount, gross_amount, orders
             FROM sales_daily
             WHERE org_id = ?1 AND date >= ?2 AND date <= ?3
             ORDER BY date, channel",
        )
        .bind(org_id.to_string())
        .bind(range.from.to_string())
        .bind(range.to.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_sales).collect()
    }

    async fn list_aging(
        &self,
        org_id: OrgId,
        ledger: AgingLedger,
        as_of: NaiveDate,
    ) -> Result<Vec<AgingRow>> {
        let sql = format!(
            "SELECT as_of_date, bucket, amount FROM {} WHERE org_id = ?1 AND as_of_date = ?2",
            ledger.table()
        );
        let rows = sqlx::query(&sql)
            .bind(org_id.to_string())
            .bind(as_of.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut out = rows.iter().map(row_to_aging).collect::<Result<Vec<_>>>()?;
        out.sort_by_key(|r| r.bucket);
        Ok(out)
    }

    async fn list_nps(&self, org_id: OrgId, range: DateRange) -> Result<Vec<NpsRow>> {
        let rows = sqlx::query(
            "SELECT date, respondent_id, score, comment FROM nps_responses
             WHERE org_id = ?1 AND date >= ?2 AND date <= ?3
             ORDER BY date, id",
        )
        .bind(org_id.to_string())
        .bind(range.from.to_string())
        .bind(range.to.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|r| {
                let date: String = r.get("date");
                let score: i64 = r.get("score");
                Ok(NpsRow {
                    date: parse_date("date", &date)?,
                    respondent_id: r.get("respondent_id"),
                    score: u8::try_from(score).map_err(|_| corrupt("score", &score.to_string()))?,
                    comment: r.get("comment"),
                })
            })
            .collect()
    }

    async fn list_hr_events(&self, org_id: OrgId, range: DateRange) -> Result<Vec<HrEvent>> {
        let rows = sqlx::query(
            "SELECT date, employee_id, action, department FROM hr_events
             WHERE org_id = ?1 AND date >= ?2 AND date <= ?3
             ORDER BY date, id",
        )
        .bind(org_id.to_string())
        .bind(range.from.to_string())
        .bind(range.to.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|r| {
                let date: String = r.get("date");
                let action: String = r.get("action");
                Ok(HrEvent {
                    date: parse_date("date", &date)?,
                    employee_id: r.get("employee_id"),
                    action: HrAction::parse_str(&action).ok_or_else(|| corrupt("action", &action))?,
                    department: r.get("department"),
                })
            })
            .collect()
    }
}

// ── SyncCatalog impl ────────────────────────────────────────────

#[async_trait]
impl SyncCatalog for SqliteStore {
    #[tracing::instrument(level = "debug", skip_all, fields(org_id = %source.org_id, code = %source.code))]
    async fn upsert_data_source(&self, source: &DataSource) -> Result<DataSource> {
        let credentials = serde_json::to_string(&source.credentials)
            .map_err(|e| Error::backend("serialize credentials", e))?;

        sqlx::query(
            "INSERT INTO data_sources (id, org_id, code, kind, name, credentials, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(org_id, code) DO UPDATE SET
               kind = excluded.kind,
               name = excluded.name,
               credentials = excluded.credentials,
               active = excluded.active,
               updated_at = excluded.updated_at",
        )
        .bind(source.id.to_string())
        .bind(source.org_id.to_string())
        .bind(&source.code)
        .bind(source.kind.as_str())
        .bind(&source.name)
        .bind(&credentials)
        .bind(source.active as i32)
        .bind(source.created_at.to_rfc3339())
        .bind(source.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.get_data_source_by_code(source.org_id, &source.code)
            .await?
            .ok_or_else(|| Error::BackendMessage("upserted data source not readable".to_string()))
    }

    async fn get_data_source(
        &self,
        org_id: OrgId,
        source_id: SourceId,
    ) -> Result<Option<DataSource>> {
        let row = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM data_sources WHERE org_id = ?1 AND id = ?2"
        ))
        .bind(org_id.to_string())
        .bind(source_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_source).transpose()
    }

    async fn get_data_source_by_code(
        &self,
        org_id: OrgId,
        code: &str,
    ) -> Result<Option<DataSource>> {
        let row = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM data_sources WHERE org_id = ?1 AND code = ?2"
        ))
        .bind(org_id.to_string())
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_source).transpose()
    }

    async fn list_data_sources(&self, org_id: OrgId, query: ListQuery) -> Result<Vec<DataSource>> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM data_sources WHERE org_id = ?1
             ORDER BY code
             LIMIT ?2 OFFSET ?3"
        ))
        .bind(org_id.to_string())
        .bind(query.limit as i64)
        .bind(query.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_source).collect()
    }

    async fn set_data_source_active(
        &self,
        org_id: OrgId,
        source_id: SourceId,
        active: bool,
    ) -> Result<()> {
        let res = sqlx::query(
            "UPDATE data_sources SET active = ?1, updated_at = ?2 WHERE org_id = ?3 AND id = ?4",
        )
        .bind(active as i32)
        .bind(Utc::now().to_rfc3339())
        .bind(org_id.to_string())
        .bind(source_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if res.rows_affected() == 0 {
            return Err(Error::NotFound(format!("data source '{source_id}' not found")));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(job_id = %job.id))]
    async fn insert_sync_job(&self, job: &SyncJob) -> Result<()> {
        let stats_json = serde_json::to_string(&job.stats)
            .map_err(|e| Error::backend("serialize job stats", e))?;

        sqlx::query(
            "INSERT INTO sync_jobs (id, org_id, source_id, kind, status, started_at, finished_at, message, stats_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(job.id.to_string())
        .bind(job.org_id.to_string())
        .bind(job.source_id.to_string())
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(job.started_at.to_rfc3339())
        .bind(job.finished_at.map(|t| t.to_rfc3339()))
        .bind(&job.message)
        .bind(&stats_json)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(org_id = %org_id, job_id = %job_id, status = status.as_str()))]
    async fn finish_sync_job(
        &self,
        org_id: OrgId,
        job_id: Uuid,
        status: JobStatus,
        message: &str,
        stats: JobStats,
        finished_at: DateTime<Utc>,
    ) -> Result<SyncJob> {
        if !status.is_terminal() {
            return Err(Error::InvalidInput(
                "job can only transition to success or error".to_string(),
            ));
        }
        let stats_json = serde_json::to_string(&stats)
            .map_err(|e| Error::backend("serialize job stats", e))?;

        // Only a running job may transition; this is the single terminal write.
        let res = sqlx::query(
            "UPDATE sync_jobs
             SET status = ?1, message = ?2, stats_json = ?3, finished_at = ?4
             WHERE org_id = ?5 AND id = ?6 AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(message)
        .bind(&stats_json)
        .bind(finished_at.to_rfc3339())
        .bind(org_id.to_string())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if res.rows_affected() == 0 {
            return Err(Error::Conflict(format!(
                "sync job {job_id} is missing or already finished"
            )));
        }

        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = ?1"))
            .bind(job_id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        row_to_job(&row)
    }

    async fn list_sync_jobs(&self, org_id: OrgId, query: SyncJobQuery) -> Result<Vec<SyncJob>> {
        let mut conditions = vec!["org_id = ?1".to_string()];
        let mut next_param = 2;

        if query.source_id.is_some() {
            conditions.push(format!("source_id = ?{next_param}"));
            next_param += 1;
        }
        if query.status.is_some() {
            conditions.push(format!("status = ?{next_param}"));
            next_param += 1;
        }

        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE {}
             ORDER BY started_at DESC
             LIMIT ?{next_param} OFFSET ?{}",
            conditions.join(" AND "),
            next_param + 1,
        );

        let mut q = sqlx::query(&sql).bind(org_id.to_string());
        if let Some(source_id) = query.source_id {
            q = q.bind(source_id.to_string());
        }
        if let Some(status) = query.status {
            q = q.bind(status.as_str());
        }
        q = q.bind(query.limit as i64);
        q = q.bind(query.offset as i64);

        let rows = q.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(row_to_job).collect()
    }
}

// ── Row mapping helpers ─────────────────────────────────────────

fn row_to_sales(r: &SqliteRow) -> Result<SalesDaily> {
    let date: String = r.get("date");
    let channel: String = r.get("channel");
    let net: String = r.get("net_amount");
    let gross: String = r.get("gross_amount");
    let orders: i64 = r.get("orders");

    Ok(SalesDaily {
        date: parse_date("date", &date)?,
        channel: Some(channel),
        net_amount: parse_decimal("net_amount", &net)?,
        gross_amount: parse_decimal("gross_amount", &gross)?,
        orders: orders.max(0) as u64,
    })
}

fn row_to_aging(r: &SqliteRow) -> Result<AgingRow> {
    let as_of: String = r.get("as_of_date");
    let bucket: String = r.get("bucket");
    let amount: String = r.get("amount");

    Ok(AgingRow {
        as_of_date: parse_date("as_of_date", &as_of)?,
        bucket: AgingBucket::from_str(&bucket).map_err(|_| corrupt("bucket", &bucket))?,
        amount: parse_decimal("amount", &amount)?,
    })
}

fn row_to_source(r: &SqliteRow) -> Result<DataSource> {
    let id: String = r.get("id");
    let org_id: String = r.get("org_id");
    let kind: String = r.get("kind");
    let credentials: String = r.get("credentials");
    let active: i32 = r.get("active");
    let created_at: String = r.get("created_at");
    let updated_at: String = r.get("updated_at");

    let credentials: Credentials = serde_json::from_str(&credentials)
        .map_err(|e| Error::backend("deserialize credentials", e))?;

    Ok(DataSource {
        id: SourceId(parse_uuid("id", &id)?),
        org_id: OrgId(parse_uuid("org_id", &org_id)?),
        code: r.get("code"),
        kind: SourceKind::parse_str(&kind),
        name: r.get("name"),
        credentials,
        active: active != 0,
        created_at: parse_dt("created_at", &created_at)?,
        updated_at: parse_dt("updated_at", &updated_at)?,
    })
}

fn row_to_job(r: &SqliteRow) -> Result<SyncJob> {
    let id: String = r.get("id");
    let org_id: String = r.get("org_id");
    let source_id: String = r.get("source_id");
    let kind: String = r.get("kind");
    let status: String = r.get("status");
    let started_at: String = r.get("started_at");
    let finished_at: Option<String> = r.get("finished_at");
    let stats_json: String = r.get("stats_json");

    Ok(SyncJob {
        id: parse_uuid("id", &id)?,
        org_id: OrgId(parse_uuid("org_id", &org_id)?),
        source_id: SourceId(parse_uuid("source_id", &source_id)?),
        kind: JobKind::parse_str(&kind).ok_or_else(|| corrupt("kind", &kind))?,
        status: JobStatus::parse_str(&status).ok_or_else(|| corrupt("status", &status))?,
        started_at: parse_dt("started_at", &started_at)?,
        finished_at: finished_at
            .as_deref()
            .map(|s| parse_dt("finished_at", s))
            .transpose()?,
        message: r.get("message"),
        stats: serde_json::from_str(&stats_json).map_err(|_| corrupt("stats_json", &stats_json))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::DataSourceInput;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn sales(date: NaiveDate, net: i64, orders: u64) -> SalesDaily {
        SalesDaily {
            date,
            channel: Some("bitrix".to_string()),
            net_amount: Decimal::new(net, 0),
            gross_amount: Decimal::new(net, 0),
            orders,
        }
    }

    #[tokio::test]
    async fn sales_upsert_is_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        let org = OrgId(Uuid::new_v4());
        let rows = vec![sales(d(2024, 5, 1), 350, 2), sales(d(2024, 5, 2), 10, 1)];

        store.upsert_sales_daily(org, &rows).await.unwrap();
        store.upsert_sales_daily(org, &rows).await.unwrap();

        let range = DateRange::new(d(2024, 5, 1), d(2024, 5, 31)).unwrap();
        let stored = store.list_sales_daily(org, range).await.unwrap();
        assert_eq!(stored, rows);
    }

    #[tokio::test]
    async fn sales_upsert_replaces_amounts() {
        let store = SqliteStore::in_memory().await.unwrap();
        let org = OrgId(Uuid::new_v4());
        store
            .upsert_sales_daily(org, &[sales(d(2024, 5, 1), 100, 1)])
            .await
            .unwrap();
        store
            .upsert_sales_daily(org, &[sales(d(2024, 5, 1), 350, 2)])
            .await
            .unwrap();

        let range = DateRange::new(d(2024, 5, 1), d(2024, 5, 1)).unwrap();
        let stored = store.list_sales_daily(org, range).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].net_amount, Decimal::new(350, 0));
        assert_eq!(stored[0].orders, 2);
    }

    #[tokio::test]
    async fn missing_channel_is_stored_under_sentinel() {
        let store = SqliteStore::in_memory().await.unwrap();
        let org = OrgId(Uuid::new_v4());
        let mut row = sales(d(2024, 5, 1), 5, 1);
        row.channel = None;
        store.upsert_sales_daily(org, &[row]).await.unwrap();

        let range = DateRange::new(d(2024, 5, 1), d(2024, 5, 1)).unwrap();
        let stored = store.list_sales_daily(org, range).await.unwrap();
        assert_eq!(stored[0].channel.as_deref(), Some(crate::facts::DEFAULT_CHANNEL));
    }

    #[tokio::test]
    async fn aging_ledgers_are_separate_tables() {
        let store = SqliteStore::in_memory().await.unwrap();
        let org = OrgId(Uuid::new_v4());
        let as_of = d(2024, 6, 30);
        let rows = vec![AgingRow {
            as_of_date: as_of,
            bucket: AgingBucket::Days31To60,
            amount: Decimal::new(500, 0),
        }];

        store
            .upsert_aging(org, AgingLedger::Receivable, &rows)
            .await
            .unwrap();
        store
            .upsert_aging(org, AgingLedger::Receivable, &rows)
            .await
            .unwrap();

        let ar = store
            .list_aging(org, AgingLedger::Receivable, as_of)
            .await
            .unwrap();
        let ap = store
            .list_aging(org, AgingLedger::Payable, as_of)
            .await
            .unwrap();
        assert_eq!(ar, rows);
        assert!(ap.is_empty());
    }

    #[tokio::test]
    async fn nps_is_insert_only() {
        let store = SqliteStore::in_memory().await.unwrap();
        let org = OrgId(Uuid::new_v4());
        let row = NpsRow::new(d(2024, 5, 1), Some("r1".to_string()), 9, None).unwrap();

        store.insert_nps(org, &[row.clone()]).await.unwrap();
        store.insert_nps(org, &[row.clone()]).await.unwrap();
        assert_eq!(store.insert_nps(org, &[]).await.unwrap(), 0);

        let range = DateRange::new(d(2024, 5, 1), d(2024, 5, 1)).unwrap();
        assert_eq!(store.list_nps(org, range).await.unwrap(), vec![row.clone(), row]);
    }

    #[tokio::test]
    async fn data_source_upsert_keeps_id_per_code() {
        let store = SqliteStore::in_memory().await.unwrap();
        let org = OrgId(Uuid::new_v4());
        let input = DataSourceInput {
            org_id: org,
            code: "books".to_string(),
            kind: SourceKind::Accounting,
            name: "Books".to_string(),
            credentials: Credentials::ApiKey {
                base_url: "https://books.example".to_string(),
                api_key: "k1".to_string(),
            },
            active: true,
        };
        let first = store
            .upsert_data_source(&DataSource::new(input.clone(), None).unwrap())
            .await
            .unwrap();

        let mut renamed = input;
        renamed.name = "Books v2".to_string();
        let second = store
            .upsert_data_source(&DataSource::new(renamed, None).unwrap())
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Books v2");
        assert_eq!(
            store
                .list_data_sources(org, ListQuery::default())
                .await
                .unwrap()
                .len(),
            1
        );

        store
            .set_data_source_active(org, first.id, false)
            .await
            .unwrap();
        let loaded = store.get_data_source(org, first.id).await.unwrap().unwrap();
        assert!(!loaded.active);
    }

    #[tokio::test]
    async fn corrupt_job_stats_are_reported() {
        let store = SqliteStore::in_memory().await.unwrap();
        let org = OrgId(Uuid::new_v4());
        let job = SyncJob::new_running(org, SourceId::new(), JobKind::Sync, Utc::now());
        store.insert_sync_job(&job).await.unwrap();
        sqlx::query("UPDATE sync_jobs SET stats_json = 'not json' WHERE id = ?1")
            .bind(job.id.to_string())
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store
            .list_sync_jobs(org, SyncJobQuery::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendMessage(ref m) if m.contains("stats_json")));
    }

    #[tokio::test]
    async fn job_finishes_exactly_once() {
        let store = SqliteStore::in_memory().await.unwrap();
        let org = OrgId(Uuid::new_v4());
        let job = SyncJob::new_running(org, SourceId::new(), JobKind::Sync, Utc::now());
        store.insert_sync_job(&job).await.unwrap();

        let done = store
            .finish_sync_job(
                org,
                job.id,
                JobStatus::Success,
                "sales: 1 rows",
                JobStats {
                    sales_rows: 1,
                    ..Default::default()
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(done.status, JobStatus::Success);
        assert_eq!(done.stats.sales_rows, 1);

        let again = store
            .finish_sync_job(
                org,
                job.id,
                JobStatus::Error,
                "late",
                JobStats::default(),
                Utc::now(),
            )
            .await;
        assert!(matches!(again, Err(Error::Conflict(_))));

        let listed = store
            .list_sync_jobs(
                org,
                SyncJobQuery {
                    status: Some(JobStatus::Success),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].message, "sales: 1 rows");
    }
}
