//! Accounting-system connector (API key, page-numbered invoice listing).
//!
//! Only sales are pulled. The invoice listing carries no residual or due
//! date, so aging is not advertised.

use crate::connectors::{http_client, trim_base, DEFAULT_HTTP_TIMEOUT, DEFAULT_MAX_PAGES};
use async_trait::async_trait;
use chrono::NaiveDate;
use readiness_core::facts::{parse_amount, SalesRollup};
use readiness_core::{
    Capability, ConnectionCheck, Connector, ConnectorContext, Credentials, Error, Result,
    SalesDaily, SourceKind,
};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::instrument;

const SERVICE: &str = "accounting";
const CHANNEL: &str = "accounting";
const API_KEY_HEADER: &str = "X-Api-Key";

#[derive(Debug, Deserialize)]
struct InvoicePage {
    #[serde(default)]
    invoices: Vec<AccountingInvoice>,
    #[serde(default)]
    next_page: Option<u32>,
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AccountingInvoice {
    issue_date: NaiveDate,
    #[serde(default)]
    net_amount: Value,
    #[serde(default)]
    gross_amount: Value,
    #[serde(default)]
    status: Option<String>,
}

impl AccountingInvoice {
    fn is_void(&self) -> bool {
        matches!(self.status.as_deref(), Some("void") | Some("voided"))
    }
}

#[derive(Clone)]
pub struct AccountingConnector {
    client: Client,
    max_pages: u32,
}

impl AccountingConnector {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_HTTP_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            max_pages: DEFAULT_MAX_PAGES,
        })
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    fn endpoint(credentials: &Credentials) -> Result<(String, &str)> {
        match credentials {
            Credentials::ApiKey { base_url, api_key } => {
                Ok((format!("{}/invoices", trim_base(base_url)), api_key.as_str()))
            }
            other => Err(Error::InvalidInput(format!(
                "accounting connector cannot use '{}' credentials",
                other.variant_name()
            ))),
        }
    }

    #[instrument(level = "debug", skip(self, ctx, query), fields(source_id = %ctx.source_id))]
    async fn fetch_page(
        &self,
        ctx: &ConnectorContext,
        query: &[(&str, String)],
    ) -> Result<InvoicePage> {
        let (url, api_key) = Self::endpoint(&ctx.credentials)?;
        let resp = self
            .client
            .get(url)
            .header(API_KEY_HEADER, api_key)
            .query(query)
            .send()
            .await
            .map_err(Error::backend_reqwest)?;

        match resp.status() {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(Error::Unauthorized(format!(
                    "accounting api key rejected: HTTP {}",
                    resp.status()
                )));
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(Error::RateLimited {
                    service: SERVICE.to_string(),
                    attempts: 1,
                });
            }
            s => return Err(Error::upstream(SERVICE, format!("HTTP {s}"))),
        }

        resp.json()
            .await
            .map_err(|e| Error::upstream(SERVICE, format!("malformed invoice page: {e}")))
    }
}

fn aggregate_invoices(invoices: &[AccountingInvoice]) -> Result<Vec<SalesDaily>> {
    let mut rollup = SalesRollup::new(Some(CHANNEL));
    for invoice in invoices.iter().filter(|i| !i.is_void()) {
        rollup.add(
            invoice.issue_date,
            parse_amount(&invoice.net_amount)?,
            parse_amount(&invoice.gross_amount)?,
        );
    }
    Ok(rollup.finish())
}

#[async_trait]
impl Connector for AccountingConnector {
    fn kind(&self) -> SourceKind {
        SourceKind::Accounting
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::SalesDaily]
    }

    #[instrument(level = "info", skip(self, ctx), fields(source_id = %ctx.source_id))]
    async fn test_connection(&self, ctx: &ConnectorContext) -> Result<ConnectionCheck> {
        let page = self.fetch_page(ctx, &[("page", "1".to_string())]).await?;
        let sample_size = page.total.unwrap_or(page.invoices.len() as u64);
        Ok(ConnectionCheck {
            ok: true,
            message: format!("accounting reachable, {sample_size} invoices visible"),
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
        let mut invoices = Vec::new();
        let mut page_no: u32 = 1;

        for _ in 0..self.max_pages {
            let query = [
                ("issued_from", from.to_string()),
                ("issued_to", to.to_string()),
                ("page", page_no.to_string()),
            ];
            let page = self.fetch_page(ctx, &query).await?;
            invoices.extend(
                page.invoices
                    .into_iter()
                    .filter(|i| i.issue_date >= from && i.issue_date <= to),
            );
            match page.next_page {
                Some(next) if next > page_no => page_no = next,
                Some(next) => {
                    return Err(Error::upstream(
                        SERVICE,
                        format!("next_page {next} does not advance past {page_no}"),
                    ))
                }
                None => return aggregate_invoices(&invoices),
            }
        }

        Err(Error::upstream(
            SERVICE,
            format!("invoice listing exceeded {} pages", self.max_pages),
        ))
    }
}
