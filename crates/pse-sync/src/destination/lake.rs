//! Delta Lake backend: every apply is one `MERGE` commit to the table's log.
//!
//! A plan is tied to the table version its lookup saw. If the table moved on
//! before the commit, the apply fails with `WRITE_CONFLICT` and the caller
//! re-plans from a fresh lookup. Concurrent writers racing on the same commit
//! are caught by Delta's own conflict checker and surface the same way.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeDelta};
use pse_core::{column_index, table_columns, Cell, Company, DailyStockPrice, Entity, ExistingRow, Stamped, EXTRACTED_AT, INSERTED_AT};
use pse_storage::lake::{version_of, LakeError, LakeTable};
use tracing::{debug, info, info_span, Instrument};

use super::{ApplyOutcome, Backend, Destination, FailPoint, FailPoints, HasBackend, PriceCoverage, SchemaAdmin};
use crate::error::SyncError;
use crate::reconcile::{Eligibility, ExistingState, ReplacementPlan};

const BACKEND: &str = "lake";

#[derive(Debug, Clone)]
pub struct LakeDestination {
    uri: String,
    storage_options: HashMap<String, String>,
    fail_points: Arc<FailPoints>,
}

impl LakeDestination {
    /// `uri` is the parent of the table directories, e.g. `gs://bucket/delta-lake/pse`.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into().trim_end_matches('/').to_string(),
            storage_options: HashMap::new(),
            fail_points: Arc::new(FailPoints::default()),
        }
    }

    pub fn with_storage_options(mut self, options: HashMap<String, String>) -> Self {
        self.storage_options = options;
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn fail_points(&self) -> &FailPoints {
        &self.fail_points
    }

    pub fn table<T: Entity>(&self) -> LakeTable {
        LakeTable::new(
            format!("{}/{}", self.uri, T::TABLE),
            table_columns::<T>(),
            self.storage_options.clone(),
        )
    }

    /// Committed rows of the latest version, in key order.
    pub async fn rows<T: Entity>(&self) -> Result<Vec<Stamped<T>>, SyncError> {
        let mut rows = scan::<T>(&self.table::<T>(), None)
            .await?
            .1
            .iter()
            .map(|cells| Stamped::<T>::from_cells(cells).map_err(|err| SyncError::decode(BACKEND, err)))
            .collect::<Result<Vec<_>, _>>()?;
        rows.sort_by_key(|stamped| stamped.row.key());
        Ok(rows)
    }

    /// Drops data files no version within `retention` references.
    pub async fn vacuum(&self, retention: Duration) -> Result<usize, SyncError> {
        let retention = TimeDelta::from_std(retention)
            .map_err(|err| SyncError::config(format!("retention out of range: {err}")))?;
        let mut deleted = 0;
        for table in [self.table::<Company>(), self.table::<DailyStockPrice>()] {
            match table.vacuum(retention).await {
                Ok(files) => deleted += files,
                Err(LakeError::NotFound(_)) => debug!(table = table.uri(), "nothing to vacuum"),
                Err(err) => return Err(SyncError::from_lake(table.uri(), err)),
            }
        }
        Ok(deleted)
    }
}

/// Latest version and its rows, optionally limited to `symbol IN symbols`.
async fn scan<T: Entity>(
    table: &LakeTable,
    symbols: Option<&[String]>,
) -> Result<(u64, Vec<Vec<Cell>>), SyncError> {
    let lake_err = |err| SyncError::from_lake(T::TABLE, err);
    let loaded = table.load().await.map_err(lake_err)?;
    let filter = symbols.map(|values| (T::key_columns()[0].name, values));
    let rows = table.scan(&loaded, filter).await.map_err(lake_err)?;
    Ok((version_of(&loaded), rows))
}

fn leading_key_text<T: Entity>(key: &T::Key) -> Option<String> {
    match T::key_cells(key).into_iter().next() {
        Some(Cell::Text(Some(value))) => Some(value),
        _ => None,
    }
}

fn timestamp_at(cells: &[Cell], idx: usize) -> Option<chrono::DateTime<chrono::Utc>> {
    match cells.get(idx) {
        Some(Cell::Timestamp(value)) => *value,
        _ => None,
    }
}

impl LakeDestination {
    async fn merge_plan<T: Entity>(&self, plan: &ReplacementPlan<T>) -> Result<ApplyOutcome, SyncError> {
        let table = self.table::<T>();
        let lake_err = |err| SyncError::from_lake(T::TABLE, err);
        let loaded = table.load().await.map_err(lake_err)?;
        let version = version_of(&loaded);
        self.fail_points.check(FailPoint::WriteConflict, T::TABLE, BACKEND)?;
        if plan.state_version != Some(version) {
            return Err(SyncError::WriteConflict {
                table: T::TABLE.to_string(),
                detail: format!("planned against version {:?}, table is at {version}", plan.state_version),
            });
        }
        if plan.is_empty() {
            return Ok(ApplyOutcome {
                version: Some(version),
                ..ApplyOutcome::default()
            });
        }

        // Nothing is written until the merge commits, so a failure at
        // either point leaves the table on `version`.
        self.fail_points.check(FailPoint::AfterDelete, T::TABLE, BACKEND)?;
        self.fail_points.check(FailPoint::BeforeCommit, T::TABLE, BACKEND)?;

        let cells: Vec<Vec<Cell>> = plan.inserts.iter().map(Stamped::cells).collect();
        let guard = Eligibility::sql_predicate("s", "t");
        let merged = table.merge(loaded, &cells, &guard, &[INSERTED_AT]).await.map_err(lake_err)?;
        info!(version = merged.version, updated = merged.updated, inserted = merged.inserted, "lake commit");
        Ok(ApplyOutcome {
            deleted: merged.updated,
            inserted: merged.inserted + merged.updated,
            version: Some(merged.version),
        })
    }
}

impl HasBackend for LakeDestination {
    fn backend(&self) -> Backend {
        Backend::Lake
    }
}

#[async_trait]
impl<T: Entity> Destination<T> for LakeDestination {
    async fn lookup(&self, keys: &[T::Key]) -> Result<ExistingState<T::Key>, SyncError> {
        let wanted: BTreeSet<T::Key> = keys.iter().cloned().collect();
        let symbols: Vec<String> = wanted
            .iter()
            .filter_map(leading_key_text::<T>)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let (version, scanned) = scan::<T>(&self.table::<T>(), Some(&symbols)).await?;

        let key_width = T::key_columns().len();
        let extracted_idx = column_index::<T>(EXTRACTED_AT).unwrap_or(T::columns().len() - 1);
        let inserted_idx = column_index::<T>(INSERTED_AT).unwrap_or(T::columns().len());
        let mut rows = HashMap::new();
        for cells in scanned {
            let key = T::key_from_cells(&cells[..key_width.min(cells.len())])
                .map_err(|err| SyncError::decode(BACKEND, err))?;
            if !wanted.contains(&key) {
                continue;
            }
            let extracted_at = timestamp_at(&cells, extracted_idx)
                .ok_or_else(|| SyncError::statement(BACKEND, format!("{key} has no extracted_at")))?;
            rows.insert(
                key,
                ExistingRow {
                    extracted_at,
                    inserted_at: timestamp_at(&cells, inserted_idx),
                },
            );
        }
        debug!(table = T::TABLE, version, found = rows.len(), "lake lookup");
        Ok(ExistingState {
            rows,
            version: Some(version),
        })
    }

    async fn apply(&self, plan: &ReplacementPlan<T>) -> Result<ApplyOutcome, SyncError> {
        let span = info_span!("lake_apply", table = T::TABLE, deletes = plan.delete_keys.len(), inserts = plan.inserts.len());
        self.merge_plan(plan).instrument(span).await
    }
}

#[async_trait]
impl PriceCoverage for LakeDestination {
    async fn latest_price_dates(&self) -> Result<HashMap<String, NaiveDate>, SyncError> {
        let (_, rows) = scan::<DailyStockPrice>(&self.table::<DailyStockPrice>(), None).await?;
        let mut latest: HashMap<String, NaiveDate> = HashMap::new();
        for cells in rows {
            let key = DailyStockPrice::key_from_cells(&cells[..2.min(cells.len())])
                .map_err(|err| SyncError::decode(BACKEND, err))?;
            latest
                .entry(key.symbol)
                .and_modify(|d| *d = (*d).max(key.date))
                .or_insert(key.date);
        }
        Ok(latest)
    }
}

#[async_trait]
impl SchemaAdmin for LakeDestination {
    /// Creates missing tables. Existing tables and their data are left alone.
    async fn initialize_schema(&self) -> Result<(), SyncError> {
        for table in [self.table::<Company>(), self.table::<DailyStockPrice>()] {
            let version = table
                .create_if_missing()
                .await
                .map_err(|err| SyncError::from_lake(table.uri(), err))?;
            info!(table = table.uri(), version, "lake table ready");
        }
        Ok(())
    }
}
