use std::error::Error as StdError;

/// Common error type for `readiness_core` and the connectors built on it.
///
/// Storage and HTTP backends should preserve the underlying error chain via
/// `Error::backend`. Connector failures use the dedicated variants so the
/// orchestrator can record a distinguishable job message.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Credentials rejected by the external system.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Repeated HTTP 429 responses exhausted the retry budget.
    #[error("rate limited by {service} after {attempts} attempts")]
    RateLimited { service: String, attempts: u32 },

    /// The external system returned an explicit error payload or an unusable body.
    #[error("{service} error: {message}")]
    Upstream { service: String, message: String },

    /// The connector does not implement the requested fact family.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "readiness.error.backend", skip(source))]
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Convenience: wrap any error into `Backend` with "reqwest" context.
    pub fn backend_reqwest(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Backend {
            context: "reqwest".into(),
            source: Box::new(source),
        }
    }

    pub fn upstream(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
