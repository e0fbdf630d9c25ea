use crate::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber: `RUST_LOG`-style filtering (default `info`)
/// and JSON lines on stderr. Stdout is left to command output.
#[tracing::instrument(level = "info")]
pub fn init_global(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let res = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    res.map_err(|e| Error::Conflict(format!("tracing already initialized: {e}")))
}

/// `init_global` driven by `READINESS_LOG_FORMAT` (`json` unless set to `text`).
pub fn init_global_from_env() -> Result<()> {
    let json = !matches!(
        std::env::var("READINESS_LOG_FORMAT").as_deref(),
        Ok("text") | Ok("pretty")
    );
    init_global(json)
}
