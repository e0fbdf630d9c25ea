use crate::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite file holding facts, sources and jobs.
    pub db_path: PathBuf,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/readiness.db"),
            max_connections: 5,
        }
    }
}

impl StoreConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let db_path = std::env::var("READINESS_DB_PATH")
            .ok()
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let max_connections = parse_env("READINESS_DB_MAX_CONNECTIONS")?
            .unwrap_or(defaults.max_connections);
        Ok(Self {
            db_path,
            max_connections,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound for the credential test call. Full syncs are not bounded.
    pub test_timeout: Duration,
    /// Trailing window used when a sync is triggered without a range.
    pub default_range_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            test_timeout: Duration::from_millis(8_000),
            default_range_days: 30,
        }
    }
}

impl EngineConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let test_timeout = parse_env::<u64>("READINESS_TEST_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.test_timeout);
        let default_range_days =
            parse_env("READINESS_DEFAULT_RANGE_DAYS")?.unwrap_or(defaults.default_range_days);
        if default_range_days == 0 {
            return Err(Error::InvalidInput(
                "READINESS_DEFAULT_RANGE_DAYS must be positive".to_string(),
            ));
        }
        Ok(Self {
            test_timeout,
            default_range_days,
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::InvalidInput(format!("{name} has invalid value '{raw}'"))),
        Err(_) => Ok(None),
    }
}
