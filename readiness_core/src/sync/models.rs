use crate::models::{OrgId, SourceId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which connector family serves a data source.
///
/// Kinds written by newer deployments survive a round-trip as `Other` so the
/// orchestrator can treat them as no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceKind {
    Bitrix,
    Odoo,
    Accounting,
    ManualUpload,
    Other(String),
}

impl SourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            SourceKind::Bitrix => "bitrix",
            SourceKind::Odoo => "odoo",
            SourceKind::Accounting => "accounting",
            SourceKind::ManualUpload => "manual_upload",
            SourceKind::Other(s) => s.as_str(),
        }
    }

    pub fn parse_str(s: &str) -> Self {
        match s {
            "bitrix" => SourceKind::Bitrix,
            "odoo" => SourceKind::Odoo,
            "accounting" => SourceKind::Accounting,
            "manual_upload" => SourceKind::ManualUpload,
            other => SourceKind::Other(other.to_string()),
        }
    }
}

impl From<String> for SourceKind {
    fn from(value: String) -> Self {
        SourceKind::parse_str(&value)
    }
}

impl From<SourceKind> for String {
    fn from(value: SourceKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection secrets for a data source, one variant per authentication scheme.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    /// Inbound webhook: `{base_url}/rest/{user_id}/{token}/{method}.json`.
    BitrixWebhook {
        base_url: String,
        user_id: u64,
        token: String,
    },
    /// Delegated OAuth token passed as the `auth` query parameter.
    BitrixToken {
        base_url: String,
        access_token: String,
    },
    /// Database login for session-based RPC.
    OdooSession {
        base_url: String,
        database: String,
        username: String,
        password: String,
    },
    ApiKey {
        base_url: String,
        api_key: String,
    },
    /// Manual uploads carry no credentials.
    None,
}

impl Credentials {
    pub fn variant_name(&self) -> &'static str {
        match self {
            Credentials::BitrixWebhook { .. } => "bitrix_webhook",
            Credentials::BitrixToken { .. } => "bitrix_token",
            Credentials::OdooSession { .. } => "odoo_session",
            Credentials::ApiKey { .. } => "api_key",
            Credentials::None => "none",
        }
    }

    pub fn base_url(&self) -> Option<&str> {
        match self {
            Credentials::BitrixWebhook { base_url, .. }
            | Credentials::BitrixToken { base_url, .. }
            | Credentials::OdooSession { base_url, .. }
            | Credentials::ApiKey { base_url, .. } => Some(base_url.as_str()),
            Credentials::None => None,
        }
    }

    /// Whether this variant can drive a connector of `kind`.
    pub fn is_compatible_with(&self, kind: &SourceKind) -> bool {
        match kind {
            SourceKind::Bitrix => matches!(
                self,
                Credentials::BitrixWebhook { .. } | Credentials::BitrixToken { .. }
            ),
            SourceKind::Odoo => matches!(self, Credentials::OdooSession { .. }),
            SourceKind::Accounting => matches!(self, Credentials::ApiKey { .. }),
            SourceKind::ManualUpload => matches!(self, Credentials::None),
            SourceKind::Other(_) => true,
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(variant = self.variant_name()))]
    pub fn validate(&self) -> Result<()> {
        fn require(field: &str, value: &str) -> Result<()> {
            if value.trim().is_empty() {
                return Err(Error::InvalidInput(format!("credentials {field} is empty")));
            }
            Ok(())
        }

        if let Some(base_url) = self.base_url() {
            let parsed = url::Url::parse(base_url)
                .map_err(|e| Error::InvalidInput(format!("invalid base_url '{base_url}': {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(Error::InvalidInput(format!(
                    "base_url must be http(s), got '{}'",
                    parsed.scheme()
                )));
            }
        }

        match self {
            Credentials::BitrixWebhook { user_id, token, .. } => {
                if *user_id == 0 {
                    return Err(Error::InvalidInput(
                        "credentials user_id must be positive".to_string(),
                    ));
                }
                require("token", token)
            }
            Credentials::BitrixToken { access_token, .. } => require("access_token", access_token),
            Credentials::OdooSession {
                database,
                username,
                password,
                ..
            } => {
                require("database", database)?;
                require("username", username)?;
                require("password", password)
            }
            Credentials::ApiKey { api_key, .. } => require("api_key", api_key),
            Credentials::None => Ok(()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::BitrixWebhook {
                base_url, user_id, ..
            } => f
                .debug_struct("BitrixWebhook")
                .field("base_url", base_url)
                .field("user_id", user_id)
                .field("token", &"<redacted>")
                .finish(),
            Credentials::BitrixToken { base_url, .. } => f
                .debug_struct("BitrixToken")
                .field("base_url", base_url)
                .field("access_token", &"<redacted>")
                .finish(),
            Credentials::OdooSession {
                base_url,
                database,
                username,
                ..
            } => f
                .debug_struct("OdooSession")
                .field("base_url", base_url)
                .field("database", database)
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::ApiKey { base_url, .. } => f
                .debug_struct("ApiKey")
                .field("base_url", base_url)
                .field("api_key", &"<redacted>")
                .finish(),
            Credentials::None => f.write_str("None"),
        }
    }
}

/// Caller-supplied configuration for creating or updating a data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceInput {
    pub org_id: OrgId,
    /// Unique within an org, e.g. "crm-main".
    pub code: String,
    pub kind: SourceKind,
    pub name: String,
    pub credentials: Credentials,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl DataSourceInput {
    pub fn validate(&self) -> Result<()> {
        if self.code.trim().is_empty() {
            return Err(Error::InvalidInput("data source code is empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("data source name is empty".to_string()));
        }
        if !self.credentials.is_compatible_with(&self.kind) {
            return Err(Error::InvalidInput(format!(
                "credentials '{}' cannot be used with source kind '{}'",
                self.credentials.variant_name(),
                self.kind
            )));
        }
        self.credentials.validate()
    }
}

/// A configured integration for one organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: SourceId,
    pub org_id: OrgId,
    pub code: String,
    pub kind: SourceKind,
    pub name: String,
    pub credentials: Credentials,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DataSource {
    #[tracing::instrument(level = "debug", skip(input), fields(org_id = %input.org_id, code = %input.code))]
    pub fn new(input: DataSourceInput, now: Option<DateTime<Utc>>) -> Result<Self> {
        input.validate()?;
        let now = now.unwrap_or_else(Utc::now);
        Ok(Self {
            id: SourceId::new(),
            org_id: input.org_id,
            code: input.code,
            kind: input.kind,
            name: input.name,
            credentials: input.credentials,
            active: input.active,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Success,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(JobStatus::Running),
            "success" => Some(JobStatus::Success),
            "error" => Some(JobStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Sync,
    Upload,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Sync => "sync",
            JobKind::Upload => "upload",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(JobKind::Sync),
            "upload" => Some(JobKind::Upload),
            _ => None,
        }
    }
}

/// Rows written per fact family during one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub sales_rows: u64,
    pub ar_aging_rows: u64,
    pub ap_aging_rows: u64,
    pub nps_rows: u64,
    pub hr_rows: u64,
}

impl JobStats {
    pub fn total(&self) -> u64 {
        self.sales_rows + self.ar_aging_rows + self.ap_aging_rows + self.nps_rows + self.hr_rows
    }

    /// Short human-readable summary, e.g. "sales: 3 rows, ar_aging: 4 rows".
    pub fn summary(&self) -> String {
        let parts: Vec<String> = [
            ("sales", self.sales_rows),
            ("ar_aging", self.ar_aging_rows),
            ("ap_aging", self.ap_aging_rows),
            ("nps", self.nps_rows),
            ("hr_events", self.hr_rows),
        ]
        .into_iter()
        .filter(|(_, n)| *n > 0)
        .map(|(name, n)| format!("{name}: {n} rows"))
        .collect();
        if parts.is_empty() {
            "no rows written".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// One synchronization attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub org_id: OrgId,
    pub source_id: SourceId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: String,
    pub stats: JobStats,
}

impl SyncJob {
    pub fn new_running(
        org_id: OrgId,
        source_id: SourceId,
        kind: JobKind,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id,
            source_id,
            kind,
            status: JobStatus::Running,
            started_at,
            finished_at: None,
            message: String::new(),
            stats: JobStats::default(),
        }
    }

    /// The single terminal transition. Fails if the job already finished.
    pub fn finish(
        &mut self,
        status: JobStatus,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::InvalidInput(
                "job can only transition to success or error".to_string(),
            ));
        }
        if self.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "job {} already finished with status {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = status;
        self.message = message.into();
        self.finished_at = Some(at);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJobQuery {
    pub source_id: Option<SourceId>,
    pub status: Option<JobStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for SyncJobQuery {
    fn default() -> Self {
        Self {
            source_id: None,
            status: None,
            limit: 100,
            offset: 0,
        }
    }
}
