//! Odoo-style ERP connector over JSON-RPC.
//!
//! Customer invoices feed `SalesDaily` and receivables aging; vendor bills
//! feed payables aging. Each source keeps one login session, created lazily
//! and renewed once when the server reports it expired.

use crate::connectors::{http_client, trim_base, DEFAULT_HTTP_TIMEOUT, DEFAULT_MAX_PAGES};
use async_trait::async_trait;
use chrono::NaiveDate;
use readiness_core::facts::{parse_amount, AgingRollup, SalesRollup};
use readiness_core::{
    AgingRow, Capability, ConnectionCheck, Connector, ConnectorContext, Credentials, Error,
    Result, SalesDaily, SourceId, SourceKind,
};
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;

const SERVICE: &str = "odoo";
const CHANNEL: &str = "odoo";
const INVOICE_MODEL: &str = "account.move";
const SESSION_COOKIE: &str = "session_id";
const SESSION_EXPIRED_CODE: i64 = 100;

#[derive(Debug, Clone)]
pub struct OdooOptions {
    /// Records requested per `search_read` page.
    pub page_size: u32,
    pub max_pages: u32,
    pub http_timeout: Duration,
}

impl Default for OdooOptions {
    fn default() -> Self {
        Self {
            page_size: 200,
            max_pages: DEFAULT_MAX_PAGES,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

/// Login state of one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated { session_id: String, uid: i64 },
}

/// Which invoices an aging pull reads.
#[derive(Debug, Clone, Copy)]
enum Ledger {
    Receivable,
    Payable,
}

impl Ledger {
    fn move_type(self) -> &'static str {
        match self {
            Ledger::Receivable => "out_invoice",
            Ledger::Payable => "in_invoice",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<RpcErrorData>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorData {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
}

impl RpcError {
    fn is_session_expired(&self) -> bool {
        self.code == Some(SESSION_EXPIRED_CODE)
            || self
                .data
                .as_ref()
                .is_some_and(|d| d.name.contains("SessionExpired"))
    }

    fn is_access_denied(&self) -> bool {
        self.data
            .as_ref()
            .is_some_and(|d| d.name.contains("AccessDenied"))
    }

    fn describe(&self) -> String {
        match &self.data {
            Some(data) if !data.message.is_empty() => format!("{}: {}", self.message, data.message),
            _ => self.message.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthResult {
    /// `false` when the login is rejected.
    #[serde(default)]
    uid: Value,
    /// Older servers return the session id in the body as well.
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OdooInvoice {
    #[serde(default)]
    invoice_date: Value,
    #[serde(default)]
    amount_untaxed: Value,
    #[serde(default)]
    amount_total: Value,
    #[serde(default)]
    amount_residual: Value,
}

impl OdooInvoice {
    /// Odoo encodes an empty date as `false`.
    fn date(&self) -> Option<NaiveDate> {
        self.invoice_date
            .as_str()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    }
}

/// Failure of a single `call_kw`, keeping session expiry apart.
enum CallError {
    SessionExpired,
    Failed(Error),
}

impl From<Error> for CallError {
    fn from(e: Error) -> Self {
        CallError::Failed(e)
    }
}

struct Login<'a> {
    base_url: &'a str,
    database: &'a str,
    username: &'a str,
    password: &'a str,
}

impl<'a> Login<'a> {
    fn from_credentials(credentials: &'a Credentials) -> Result<Self> {
        match credentials {
            Credentials::OdooSession {
                base_url,
                database,
                username,
                password,
            } => Ok(Self {
                base_url: trim_base(base_url),
                database,
                username,
                password,
            }),
            other => Err(Error::InvalidInput(format!(
                "odoo connector cannot use '{}' credentials",
                other.variant_name()
            ))),
        }
    }
}

#[derive(Clone)]
pub struct OdooConnector {
    client: Client,
    options: OdooOptions,
    sessions: Arc<Mutex<HashMap<SourceId, Arc<Mutex<SessionState>>>>>,
}

impl OdooConnector {
    pub fn new() -> Result<Self> {
        Self::with_options(OdooOptions::default())
    }

    pub fn with_options(options: OdooOptions) -> Result<Self> {
        Ok(Self {
            client: http_client(options.http_timeout)?,
            options,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Current login state for a source; `Unauthenticated` if never used.
    pub async fn session_state(&self, source_id: SourceId) -> SessionState {
        let session = self.session_for(source_id).await;
        let state = session.lock().await;
        state.clone()
    }

    async fn session_for(&self, source_id: SourceId) -> Arc<Mutex<SessionState>> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(source_id)
            .or_insert_with(|| Arc::new(Mutex::new(SessionState::Unauthenticated)))
            .clone()
    }

    fn rpc_body(params: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": params,
            "id": 1,
        })
    }

    #[instrument(level = "debug", skip(self, login), fields(database = login.database))]
    async fn authenticate(&self, login: &Login<'_>) -> Result<SessionState> {
        let url = format!("{}/web/session/authenticate", login.base_url);
        let body = Self::rpc_body(json!({
            "db": login.database,
            "login": login.username,
            "password": login.password,
        }));
        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(Error::backend_reqwest)?;

        let status = resp.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(Error::Unauthorized(format!("odoo login failed: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(Error::upstream(SERVICE, format!("authenticate: HTTP {status}")));
        }

        let cookie_session = resp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(session_cookie_value);

        let parsed: RpcResponse<AuthResult> = resp
            .json()
            .await
            .map_err(|e| Error::upstream(SERVICE, format!("malformed authenticate response: {e}")))?;
        if let Some(err) = parsed.error {
            return Err(Error::Unauthorized(format!("odoo login failed: {}", err.describe())));
        }
        let result = parsed
            .result
            .ok_or_else(|| Error::upstream(SERVICE, "authenticate returned no result"))?;
        let Some(uid) = result.uid.as_i64() else {
            return Err(Error::Unauthorized(
                "odoo login rejected for the configured user".to_string(),
            ));
        };
        let session_id = cookie_session
            .or(result.session_id)
            .ok_or_else(|| Error::upstream(SERVICE, "authenticate returned no session id"))?;

        tracing::info!(uid, "odoo session established");
        Ok(SessionState::Authenticated { session_id, uid })
    }

    async fn call_kw_once<T: DeserializeOwned>(
        &self,
        base_url: &str,
        session_id: &str,
        model: &str,
        method: &str,
        args: &Value,
        kwargs: &Value,
    ) -> std::result::Result<T, CallError> {
        let url = format!("{base_url}/web/dataset/call_kw");
        let body = Self::rpc_body(json!({
            "model": model,
            "method": method,
            "args": args,
            "kwargs": kwargs,
        }));
        let resp = self
            .client
            .post(url)
            .header(COOKIE, format!("{SESSION_COOKIE}={session_id}"))
            .json(&body)
            .send()
            .await
            .map_err(Error::backend_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::upstream(SERVICE, format!("{model}.{method}: HTTP {status}")).into());
        }

        let parsed: RpcResponse<T> = resp.json().await.map_err(|e| {
            Error::upstream(SERVICE, format!("malformed {model}.{method} response: {e}"))
        })?;
        if let Some(err) = parsed.error {
            if err.is_session_expired() {
                return Err(CallError::SessionExpired);
            }
            if err.is_access_denied() {
                return Err(Error::Unauthorized(err.describe()).into());
            }
            return Err(Error::upstream(SERVICE, format!("{model}.{method}: {}", err.describe())).into());
        }
        parsed
            .result
            .ok_or_else(|| Error::upstream(SERVICE, format!("{model}.{method} returned no result")).into())
    }

    /// `call_kw` on the source's session, logging in when needed and
    /// re-authenticating once if the session expired.
    #[instrument(level = "debug", skip(self, ctx, args, kwargs), fields(source_id = %ctx.source_id))]
    async fn call_kw<T: DeserializeOwned>(
        &self,
        ctx: &ConnectorContext,
        model: &str,
        method: &str,
        args: Value,
        kwargs: Value,
    ) -> Result<T> {
        let login = Login::from_credentials(&ctx.credentials)?;
        let session = self.session_for(ctx.source_id).await;
        let mut state = session.lock().await;

        for attempt in 0..2 {
            let session_id = match &*state {
                SessionState::Authenticated { session_id, .. } => session_id.clone(),
                SessionState::Unauthenticated => {
                    let fresh = self.authenticate(&login).await?;
                    let SessionState::Authenticated { session_id, .. } = &fresh else {
                        return Err(Error::upstream(SERVICE, "authenticate returned no session"));
                    };
                    let session_id = session_id.clone();
                    *state = fresh;
                    session_id
                }
            };

            match self
                .call_kw_once(login.base_url, &session_id, model, method, &args, &kwargs)
                .await
            {
                Ok(value) => return Ok(value),
                Err(CallError::Failed(e)) => return Err(e),
                Err(CallError::SessionExpired) => {
                    tracing::info!(attempt, "odoo session expired");
                    *state = SessionState::Unauthenticated;
                }
            }
        }

        Err(Error::Unauthorized(
            "odoo session expired again after re-authentication".to_string(),
        ))
    }

    /// `search_read` across pages until a short page comes back.
    async fn search_read_all(
        &self,
        ctx: &ConnectorContext,
        domain: Value,
        fields: &[&str],
    ) -> Result<Vec<OdooInvoice>> {
        let page_size = self.options.page_size.max(1);
        let mut out = Vec::new();

        for page in 0..self.options.max_pages {
            let kwargs = json!({
                "domain": domain,
                "fields": fields,
                "offset": page * page_size,
                "limit": page_size,
                "order": "id asc",
            });
            let rows: Vec<OdooInvoice> = self
                .call_kw(ctx, INVOICE_MODEL, "search_read", json!([]), kwargs)
                .await?;
            let fetched = rows.len();
            out.extend(rows);
            tracing::debug!(page, fetched, "odoo page");
            if fetched < page_size as usize {
                return Ok(out);
            }
        }

        Err(Error::upstream(
            SERVICE,
            format!("search_read exceeded {} pages", self.options.max_pages),
        ))
    }

    async fn pull_aging(
        &self,
        ctx: &ConnectorContext,
        ledger: Ledger,
        as_of: NaiveDate,
    ) -> Result<Vec<AgingRow>> {
        let domain = json!([
            ["move_type", "=", ledger.move_type()],
            ["state", "=", "posted"],
            ["payment_state", "not in", ["paid", "in_payment", "reversed"]],
            ["invoice_date", "<=", as_of.to_string()],
        ]);
        let invoices = self
            .search_read_all(ctx, domain, &["invoice_date", "amount_residual"])
            .await?;
        aggregate_aging(&invoices, as_of)
    }
}

fn session_cookie_value(header: &str) -> Option<String> {
    let first = header.split(';').next()?.trim();
    let (name, value) = first.split_once('=')?;
    (name == SESSION_COOKIE && !value.is_empty()).then(|| value.to_string())
}

fn aggregate_sales(invoices: &[OdooInvoice]) -> Result<Vec<SalesDaily>> {
    let mut rollup = SalesRollup::new(Some(CHANNEL));
    for invoice in invoices {
        let Some(date) = invoice.date() else {
            continue;
        };
        rollup.add(
            date,
            parse_amount(&invoice.amount_untaxed)?,
            parse_amount(&invoice.amount_total)?,
        );
    }
    Ok(rollup.finish())
}

fn aggregate_aging(invoices: &[OdooInvoice], as_of: NaiveDate) -> Result<Vec<AgingRow>> {
    let mut rollup = AgingRollup::new(as_of);
    for invoice in invoices {
        let Some(date) = invoice.date() else {
            continue;
        };
        rollup.add(date, parse_amount(&invoice.amount_residual)?);
    }
    Ok(rollup.finish())
}

#[async_trait]
impl Connector for OdooConnector {
    fn kind(&self) -> SourceKind {
        SourceKind::Odoo
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::SalesDaily, Capability::ArAging, Capability::ApAging]
    }

    #[instrument(level = "info", skip(self, ctx), fields(source_id = %ctx.source_id))]
    async fn test_connection(&self, ctx: &ConnectorContext) -> Result<ConnectionCheck> {
        {
            // Always prove the stored password, not a cached session.
            let session = self.session_for(ctx.source_id).await;
            *session.lock().await = SessionState::Unauthenticated;
        }
        let count: u64 = self
            .call_kw(
                ctx,
                INVOICE_MODEL,
                "search_count",
                json!([[["move_type", "=", "out_invoice"]]]),
                json!({}),
            )
            .await?;
        Ok(ConnectionCheck {
            ok: true,
            message: format!("odoo reachable, {count} customer invoices visible"),
            sample_size: Some(count),
        })
    }

    #[instrument(level = "info", skip(self, ctx), fields(source_id = %ctx.source_id))]
    async fn pull_sales_daily(
        &self,
        ctx: &ConnectorContext,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<SalesDaily>> {
        let domain = json!([
            ["move_type", "=", "out_invoice"],
            ["state", "=", "posted"],
            ["invoice_date", ">=", from.to_string()],
            ["invoice_date", "<=", to.to_string()],
        ]);
        let invoices = self
            .search_read_all(ctx, domain, &["invoice_date", "amount_untaxed", "amount_total"])
            .await?;
        aggregate_sales(&invoices)
    }

    #[instrument(level = "info", skip(self, ctx), fields(source_id = %ctx.source_id))]
    async fn pull_ar_aging(&self, ctx: &ConnectorContext, as_of: NaiveDate) -> Result<Vec<AgingRow>> {
        self.pull_aging(ctx, Ledger::Receivable, as_of).await
    }

    #[instrument(level = "info", skip(self, ctx), fields(source_id = %ctx.source_id))]
    async fn pull_ap_aging(&self, ctx: &ConnectorContext, as_of: NaiveDate) -> Result<Vec<AgingRow>> {
        self.pull_aging(ctx, Ledger::Payable, as_of).await
    }
}
