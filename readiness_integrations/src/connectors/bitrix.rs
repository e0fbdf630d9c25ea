//! Bitrix24-style CRM connector.
//!
//! Won deals (`STAGE_SEMANTIC_ID = "S"`) are pulled page by page through the
//! REST `crm.deal.list` method and rolled up into one `SalesDaily` row per
//! close date.

use crate::connectors::{http_client, trim_base, DEFAULT_HTTP_TIMEOUT, DEFAULT_MAX_PAGES};
use async_trait::async_trait;
use chrono::NaiveDate;
use readiness_core::facts::{parse_amount, SalesRollup};
use readiness_core::retry::RetryPolicy;
use readiness_core::{
    Capability, ConnectionCheck, Connector, ConnectorContext, Credentials, Error, Result,
    SalesDaily, SourceKind,
};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::instrument;

const SERVICE: &str = "bitrix";
const CHANNEL: &str = "bitrix";
const WON_STAGE: &str = "S";

/// Error codes Bitrix uses for rejected credentials.
const AUTH_ERROR_CODES: &[&str] = &["invalid_token", "expired_token", "NO_AUTH_FOUND"];

#[derive(Debug, Clone)]
pub struct BitrixOptions {
    /// Total attempts for a call answered with HTTP 429.
    pub max_attempts: u32,
    pub rate_limit_delay: Duration,
    /// Pause between consecutive page requests.
    pub page_delay: Duration,
    pub max_pages: u32,
    pub http_timeout: Duration,
}

impl Default for BitrixOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rate_limit_delay: Duration::from_millis(600),
            page_delay: Duration::from_millis(350),
            max_pages: DEFAULT_MAX_PAGES,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BitrixEnvelope {
    #[serde(default)]
    result: Option<BitrixResult>,
    #[serde(default)]
    next: Option<u64>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// `result` is either the list itself or wrapped as `{ "items": [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BitrixResult {
    List(Vec<Value>),
    Items { items: Vec<Value> },
}

impl BitrixResult {
    fn into_items(self) -> Vec<Value> {
        match self {
            BitrixResult::List(items) | BitrixResult::Items { items } => items,
        }
    }
}

#[derive(Debug)]
struct BitrixPage {
    items: Vec<Value>,
    next: Option<u64>,
    total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BitrixDeal {
    #[serde(rename = "OPPORTUNITY", default)]
    opportunity: Value,
    #[serde(rename = "CLOSEDATE", default)]
    close_date: Option<String>,
    #[serde(rename = "STAGE_SEMANTIC_ID", default)]
    stage_semantic_id: Option<String>,
}

impl BitrixDeal {
    /// Date portion of `CLOSEDATE` (`2024-05-02T03:00:00+03:00` -> 2024-05-02).
    fn close_day(&self) -> Option<NaiveDate> {
        let raw = self.close_date.as_deref()?;
        let day = raw.get(..10)?;
        NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
    }
}

#[derive(Clone)]
pub struct BitrixConnector {
    client: Client,
    options: BitrixOptions,
}

impl BitrixConnector {
    pub fn new() -> Result<Self> {
        Self::with_options(BitrixOptions::default())
    }

    pub fn with_options(options: BitrixOptions) -> Result<Self> {
        Ok(Self {
            client: http_client(options.http_timeout)?,
            options,
        })
    }

    /// Endpoint for a REST method under the given credentials.
    pub fn method_url(credentials: &Credentials, method: &str) -> Result<Url> {
        let raw = match credentials {
            Credentials::BitrixWebhook {
                base_url,
                user_id,
                token,
            } => format!("{}/rest/{user_id}/{token}/{method}.json", trim_base(base_url)),
            Credentials::BitrixToken { base_url, .. } => {
                format!("{}/rest/{method}.json", trim_base(base_url))
            }
            other => {
                return Err(Error::InvalidInput(format!(
                    "bitrix connector cannot use '{}' credentials",
                    other.variant_name()
                )))
            }
        };
        let mut url = Url::parse(&raw)
            .map_err(|e| Error::InvalidInput(format!("invalid bitrix url '{raw}': {e}")))?;
        if let Credentials::BitrixToken { access_token, .. } = credentials {
            url.query_pairs_mut().append_pair("auth", access_token);
        }
        Ok(url)
    }

    fn classify_error(code: &str, description: Option<&str>) -> Error {
        let message = match description {
            Some(d) if !d.is_empty() => format!("{code}: {d}"),
            _ => code.to_string(),
        };
        if AUTH_ERROR_CODES.contains(&code) {
            Error::Unauthorized(message)
        } else {
            Error::upstream(SERVICE, message)
        }
    }

    #[instrument(level = "debug", skip(self, url, params))]
    async fn call_once(&self, url: Url, params: &Value, attempt: u32) -> Result<BitrixPage> {
        let resp = self
            .client
            .post(url)
            .json(params)
            .send()
            .await
            .map_err(Error::backend_reqwest)?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited {
                service: SERVICE.to_string(),
                attempts: attempt,
            });
        }

        let body = resp.text().await.map_err(Error::backend_reqwest)?;
        let parsed = serde_json::from_str::<BitrixEnvelope>(&body);

        if let Ok(BitrixEnvelope {
            error: Some(code), ..
        }) = &parsed
        {
            let description = parsed
                .as_ref()
                .ok()
                .and_then(|e| e.error_description.as_deref());
            return Err(Self::classify_error(code, description));
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(Error::upstream(SERVICE, format!("HTTP {status}")));
        }

        let envelope =
            parsed.map_err(|e| Error::upstream(SERVICE, format!("malformed response: {e}")))?;
        let result = envelope
            .result
            .ok_or_else(|| Error::upstream(SERVICE, "response has no result"))?;
        Ok(BitrixPage {
            items: result.into_items(),
            next: envelope.next,
            total: envelope.total,
        })
    }

    /// One REST call, retried on HTTP 429 only.
    async fn call(&self, ctx: &ConnectorContext, method: &str, params: &Value) -> Result<BitrixPage> {
        let url = Self::method_url(&ctx.credentials, method)?;
        let policy = RetryPolicy::fixed(self.options.max_attempts, self.options.rate_limit_delay);
        let this = self;
        policy
            .run(Error::is_rate_limited, move |attempt| {
                let url = url.clone();
                async move { this.call_once(url, params, attempt).await }
            })
            .await
    }

    /// Follows `next` until the server stops returning it.
    #[instrument(level = "debug", skip(self, ctx, params), fields(source_id = %ctx.source_id))]
    async fn list_all(&self, ctx: &ConnectorContext, method: &str, params: Value) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut start: Option<u64> = None;

        for page in 0..self.options.max_pages {
            if page > 0 {
                tokio::time::sleep(self.options.page_delay).await;
            }
            let mut body = params.clone();
            if let (Some(start), Some(obj)) = (start, body.as_object_mut()) {
                obj.insert("start".to_string(), json!(start));
            }

            let resp = self.call(ctx, method, &body).await?;
            tracing::debug!(page, fetched = resp.items.len(), next = ?resp.next, "bitrix page");
            items.extend(resp.items);
            match resp.next {
                Some(next) => start = Some(next),
                None => return Ok(items),
            }
        }

        Err(Error::upstream(
            SERVICE,
            format!("{method} exceeded {} pages", self.options.max_pages),
        ))
    }

    fn deal_list_params(from: NaiveDate, to: NaiveDate) -> Value {
        json!({
            "filter": {
                "STAGE_SEMANTIC_ID": WON_STAGE,
                ">=CLOSEDATE": from.to_string(),
                "<=CLOSEDATE": format!("{to}T23:59:59"),
            },
            "select": ["ID", "OPPORTUNITY", "CLOSEDATE", "STAGE_SEMANTIC_ID"],
            "order": { "ID": "ASC" },
        })
    }
}

/// Re-applies the won/date filter and groups deals by close date.
fn aggregate_deals(deals: Vec<Value>, from: NaiveDate, to: NaiveDate) -> Result<Vec<SalesDaily>> {
    let mut rollup = SalesRollup::new(Some(CHANNEL));
    for raw in deals {
        let deal: BitrixDeal = serde_json::from_value(raw)
            .map_err(|e| Error::upstream(SERVICE, format!("malformed deal: {e}")))?;
        if deal.stage_semantic_id.as_deref() != Some(WON_STAGE) {
            continue;
        }
        let Some(day) = deal.close_day() else {
            tracing::debug!(close_date = ?deal.close_date, "skipping deal without close date");
            continue;
        };
        if day < from || day > to {
            continue;
        }
        let amount = parse_amount(&deal.opportunity)?;
        rollup.add(day, amount, amount);
    }
    Ok(rollup.finish())
}

#[async_trait]
impl Connector for BitrixConnector {
    fn kind(&self) -> SourceKind {
        SourceKind::Bitrix
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::SalesDaily]
    }

    #[instrument(level = "info", skip(self, ctx), fields(source_id = %ctx.source_id))]
    async fn test_connection(&self, ctx: &ConnectorContext) -> Result<ConnectionCheck> {
        let params = json!({
            "order": { "ID": "DESC" },
            "select": ["ID"],
        });
        let page = self.call(ctx, "crm.deal.list", &params).await?;
        let sample_size = page.total.unwrap_or(page.items.len() as u64);
        Ok(ConnectionCheck {
            ok: true,
            message: format!("bitrix reachable, {sample_size} deals visible"),
            sample_size: Some(sample_size),
        })
    }

    #[instrument(level = "info", skip(self, ctx), fields(source_id = %ctx.source_id))]
    async fn pull_sales_daily(
        &self,
        ctx: &ConnectorContext,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<SalesDaily>> {
        let deals = self
            .list_all(ctx, "crm.deal.list", Self::deal_list_params(from, to))
            .await?;
        aggregate_deals(deals, from, to)
    }
}
