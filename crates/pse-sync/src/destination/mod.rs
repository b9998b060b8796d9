//! Destination backends. Each one executes a [`ReplacementPlan`] all-or-nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use pse_core::{Company, DailyStockPrice, Entity};
use serde::{Deserialize, Serialize};

use crate::config::{DestinationKind, SyncConfig};
use crate::error::SyncError;
use crate::reconcile::{ExistingState, ReplacementPlan};

pub mod lake;
pub mod memory;
pub mod postgres;
pub mod warehouse;

pub use lake::LakeDestination;
pub use memory::MemoryDestination;
pub use postgres::PostgresDestination;
pub use warehouse::{BigQueryClient, BigQueryConfig, Credentials, WarehouseClient, WarehouseDestination};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Postgres,
    Warehouse,
    Lake,
    Memory,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Postgres => "postgres",
            Backend::Warehouse => "warehouse",
            Backend::Lake => "lake",
            Backend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub deleted: usize,
    pub inserted: usize,
    /// New table version, for versioned backends.
    pub version: Option<u64>,
}

pub trait HasBackend: Send + Sync {
    fn backend(&self) -> Backend;
}

#[async_trait]
pub trait Destination<T: Entity>: HasBackend {
    /// Committed rows for `keys`. Keys absent from the result do not exist.
    async fn lookup(&self, keys: &[T::Key]) -> Result<ExistingState<T::Key>, SyncError>;

    /// Deletes `plan.delete_keys` and inserts `plan.inserts` as one atomic unit.
    async fn apply(&self, plan: &ReplacementPlan<T>) -> Result<ApplyOutcome, SyncError>;
}

#[async_trait]
pub trait PriceCoverage: Send + Sync {
    /// Latest stored price date per symbol.
    async fn latest_price_dates(&self) -> Result<HashMap<String, NaiveDate>, SyncError>;
}

#[async_trait]
pub trait SchemaAdmin: Send + Sync {
    async fn initialize_schema(&self) -> Result<(), SyncError>;
}

/// Everything a sync job needs from one backend.
pub trait Store:
    Destination<Company> + Destination<DailyStockPrice> + PriceCoverage + SchemaAdmin
{
}

impl<S> Store for S where
    S: Destination<Company> + Destination<DailyStockPrice> + PriceCoverage + SchemaAdmin
{
}

/// Opens the backend `config.destination` names.
pub async fn connect_store(config: &SyncConfig) -> Result<Arc<dyn Store>, SyncError> {
    let store: Arc<dyn Store> = match config.destination {
        DestinationKind::Postgres => Arc::new(
            PostgresDestination::connect(&config.database_url, &config.pg_schema, config.write_timeout()).await?,
        ),
        DestinationKind::Bigquery => {
            let project_id = config
                .bigquery_project_id
                .clone()
                .ok_or_else(|| SyncError::config("BIGQUERY_PROJECT_ID is required for the bigquery destination"))?;
            let client = BigQueryClient::new(BigQueryConfig {
                api_base: config.bigquery_api_base.clone(),
                project_id: project_id.clone(),
                credentials: warehouse_credentials(config)?,
                timeout: config.write_timeout().unwrap_or(config.http_timeout()),
                user_agent: config.user_agent.clone(),
            })
            .map_err(|err| SyncError::config(format!("building warehouse client: {err}")))?;
            Arc::new(WarehouseDestination::new(client, project_id, config.bigquery_dataset_id.clone())?)
        }
        DestinationKind::Lake => Arc::new(
            LakeDestination::new(config.lake_uri.clone()).with_storage_options(config.lake_storage_options()),
        ),
        DestinationKind::Memory => Arc::new(MemoryDestination::new()),
    };
    Ok(store)
}

/// A static `BIGQUERY_ACCESS_TOKEN` wins over the service-account file.
pub fn warehouse_credentials(config: &SyncConfig) -> Result<Credentials, SyncError> {
    if let Some(token) = &config.bigquery_access_token {
        return Ok(Credentials::Static(token.clone()));
    }
    match &config.gcp_credentials_file {
        Some(path) => Credentials::service_account_file(path),
        None => Err(SyncError::config(
            "the bigquery destination needs GCP_CREDENTIALS_FILE or BIGQUERY_ACCESS_TOKEN",
        )),
    }
}

/// Places inside an apply where a test can force a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// Reject the write as if another writer had committed first.
    WriteConflict,
    /// After stale rows were removed, before new rows were written.
    AfterDelete,
    /// After all writes, before the commit.
    BeforeCommit,
}

/// One-shot armed failures; each armed point fires once.
#[derive(Debug, Default)]
pub struct FailPoints {
    armed: Mutex<Vec<FailPoint>>,
}

impl FailPoints {
    pub fn arm(&self, point: FailPoint) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.push(point);
        }
    }

    pub(crate) fn check(&self, point: FailPoint, table: &str, backend: &'static str) -> Result<(), SyncError> {
        let fired = match self.armed.lock() {
            Ok(mut armed) => match armed.iter().position(|p| *p == point) {
                Some(idx) => {
                    armed.remove(idx);
                    true
                }
                None => false,
            },
            Err(_) => false,
        };
        if !fired {
            return Ok(());
        }
        Err(match point {
            FailPoint::WriteConflict => SyncError::WriteConflict {
                table: table.to_string(),
                detail: "injected conflict".to_string(),
            },
            FailPoint::AfterDelete | FailPoint::BeforeCommit => {
                SyncError::statement(backend, format!("injected failure at {point:?} on {table}"))
            }
        })
    }
}

/// Splits `items` into chunks of at most `size` (at least one per chunk).
pub(crate) fn chunked<T>(items: &[T], size: usize) -> std::slice::Chunks<'_, T> {
    items.chunks(size.max(1))
}
