//! Optional connectors, one per external system family.

#[cfg(feature = "accounting")]
pub mod accounting;
#[cfg(feature = "bitrix")]
pub mod bitrix;
#[cfg(feature = "odoo")]
pub mod odoo;

use readiness_core::{Error, Result};
use std::time::Duration;

pub(crate) const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default ceiling on pages fetched in one pull.
pub const DEFAULT_MAX_PAGES: u32 = 500;

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::backend("build reqwest client", e))
}

/// `base_url` without a trailing slash, so paths can be appended with `/`.
pub(crate) fn trim_base(base_url: &str) -> &str {
    base_url.trim_end_matches('/')
}
