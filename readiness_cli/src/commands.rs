//! Command handlers. Each returns the JSON document printed by `main`.

use crate::cli::{Cli, Commands, SourceCommands};
use anyhow::{anyhow, Context};
use readiness_core::config::{EngineConfig, StoreConfig};
use readiness_core::store::memory::MemoryStore;
use readiness_core::store::sqlite::SqliteStore;
use readiness_core::{
    Credentials, DataSource, DataSourceInput, DataSync, DateRange, FactStore, JobStatus,
    ListQuery, OrgId, SourceId, SourceKind, SyncCatalog, SyncEngine, SyncJobQuery, UploadBatch,
};
use readiness_integrations::connectors::accounting::AccountingConnector;
use readiness_integrations::connectors::bitrix::BitrixConnector;
use readiness_integrations::connectors::odoo::OdooConnector;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

pub struct App {
    engine: SyncEngine,
    catalog: Arc<dyn SyncCatalog>,
}

impl App {
    /// Opens the store selected by `cli` and registers the built-in connectors.
    #[tracing::instrument(level = "debug", skip(cli))]
    pub async fn build(cli: &Cli) -> anyhow::Result<Self> {
        let (catalog, facts): (Arc<dyn SyncCatalog>, Arc<dyn FactStore>) = if cli.memory {
            let store = MemoryStore::new();
            (Arc::new(store.clone()), Arc::new(store))
        } else {
            let mut cfg = StoreConfig::from_env()?;
            if let Some(path) = &cli.db_path {
                cfg.db_path = path.clone();
            }
            let store = SqliteStore::new(&cfg.db_path, cfg.max_connections)
                .await
                .with_context(|| format!("open {}", cfg.db_path.display()))?;
            (Arc::new(store.clone()), Arc::new(store))
        };
        Self::with_stores(catalog, facts, EngineConfig::from_env()?).await
    }

    pub async fn with_stores(
        catalog: Arc<dyn SyncCatalog>,
        facts: Arc<dyn FactStore>,
        config: EngineConfig,
    ) -> anyhow::Result<Self> {
        let engine = SyncEngine::new(catalog.clone(), facts).with_config(config);
        engine
            .register_connector(Arc::new(BitrixConnector::new()?))
            .await?;
        engine
            .register_connector(Arc::new(OdooConnector::new()?))
            .await?;
        engine
            .register_connector(Arc::new(AccountingConnector::new()?))
            .await?;
        Ok(Self { engine, catalog })
    }

    /// Accepts either a source id or a source code.
    async fn resolve_source(&self, org_id: OrgId, raw: &str) -> anyhow::Result<SourceId> {
        if let Ok(id) = raw.parse::<SourceId>() {
            return Ok(id);
        }
        self.catalog
            .get_data_source_by_code(org_id, raw)
            .await?
            .map(|s| s.id)
            .ok_or_else(|| anyhow!("no data source with code '{raw}'"))
    }

    #[tracing::instrument(level = "info", skip(self, command))]
    pub async fn run(&self, org_id: OrgId, command: Commands) -> anyhow::Result<Value> {
        match command {
            Commands::Sources { action } => self.run_sources(org_id, action).await,
            Commands::Test { source } => {
                let source_id = self.resolve_source(org_id, &source).await?;
                let check = self.engine.test_source(org_id, source_id).await?;
                Ok(serde_json::to_value(check)?)
            }
            Commands::Sync { source, from, to } => {
                let source_id = self.resolve_source(org_id, &source).await?;
                let range = match (from, to) {
                    (Some(from), Some(to)) => Some(DateRange::new(from, to)?),
                    _ => None,
                };
                let job = self.engine.trigger_sync(org_id, source_id, range).await?;
                Ok(serde_json::to_value(job)?)
            }
            Commands::Upload { source, file } => {
                let source_id = self.resolve_source(org_id, &source).await?;
                let batch = read_batch(&file).await?;
                let job = self.engine.ingest_upload(org_id, source_id, batch).await?;
                Ok(serde_json::to_value(job)?)
            }
            Commands::Jobs {
                source,
                status,
                limit,
            } => {
                let source_id = match source {
                    Some(raw) => Some(self.resolve_source(org_id, &raw).await?),
                    None => None,
                };
                let status = status
                    .map(|s| JobStatus::parse_str(&s).ok_or_else(|| anyhow!("unknown job status '{s}'")))
                    .transpose()?;
                let jobs = self
                    .engine
                    .list_jobs(
                        org_id,
                        SyncJobQuery {
                            source_id,
                            status,
                            limit,
                            offset: 0,
                        },
                    )
                    .await?;
                Ok(serde_json::to_value(jobs)?)
            }
        }
    }

    async fn run_sources(&self, org_id: OrgId, action: SourceCommands) -> anyhow::Result<Value> {
        match action {
            SourceCommands::List { limit, offset } => {
                let sources = self
                    .engine
                    .list_sources(org_id, ListQuery { limit, offset })
                    .await?;
                Ok(Value::Array(sources.iter().map(source_view).collect()))
            }
            SourceCommands::Upsert {
                code,
                kind,
                name,
                credentials,
                credentials_file,
                inactive,
            } => {
                let raw = match (credentials, credentials_file) {
                    (Some(raw), _) => raw,
                    (None, Some(path)) => tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("read {}", path.display()))?,
                    (None, None) => r#"{"type":"none"}"#.to_string(),
                };
                let credentials: Credentials =
                    serde_json::from_str(&raw).context("parse credentials JSON")?;
                let source = self
                    .engine
                    .upsert_source(DataSourceInput {
                        org_id,
                        code,
                        kind: SourceKind::parse_str(&kind),
                        name,
                        credentials,
                        active: !inactive,
                    })
                    .await?;
                Ok(source_view(&source))
            }
            SourceCommands::Deactivate { source } => {
                let source_id = self.resolve_source(org_id, &source).await?;
                self.engine.deactivate_source(org_id, source_id).await?;
                Ok(json!({ "id": source_id.to_string(), "active": false }))
            }
        }
    }
}

/// Source summary without secrets.
fn source_view(source: &DataSource) -> Value {
    json!({
        "id": source.id.to_string(),
        "code": source.code,
        "kind": source.kind.as_str(),
        "name": source.name,
        "active": source.active,
        "credentials": source.credentials.variant_name(),
        "base_url": source.credentials.base_url(),
        "updated_at": source.updated_at,
    })
}

async fn read_batch(path: &Path) -> anyhow::Result<UploadBatch> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    let batch: UploadBatch = serde_json::from_str(&raw)
        .with_context(|| format!("parse upload batch {}", path.display()))?;
    if batch.is_empty() {
        return Err(anyhow!("upload batch {} has no rows", path.display()));
    }
    Ok(batch)
}
