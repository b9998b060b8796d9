//! Delta Lake tables addressed by URI: a local directory or `gs://bucket/prefix`.
//!
//! Rows cross this boundary as [`Cell`] vectors in table column order, key
//! columns first. Every write is a single Delta `MERGE`, so one apply is one
//! commit in the table log.

use std::collections::HashMap;
use std::sync::{Arc, Once};

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use deltalake::arrow::array::{Array, ArrayRef, Date32Array, Float64Array, StringArray, TimestampMicrosecondArray};
use deltalake::arrow::compute::cast;
use deltalake::arrow::datatypes::{DataType as ArrowType, Field, Schema, SchemaRef, TimeUnit};
use deltalake::arrow::error::ArrowError;
use deltalake::arrow::record_batch::RecordBatch;
use deltalake::datafusion::error::DataFusionError;
use deltalake::datafusion::prelude::{col, lit, SessionContext};
use deltalake::kernel::{DataType, PrimitiveType, StructField};
use deltalake::protocol::SaveMode;
use deltalake::{DeltaOps, DeltaTable, DeltaTableError};
use pse_core::{Cell, Column, ColumnType};
use thiserror::Error;
use tracing::{debug, info};

/// Storage option naming the service-account JSON used for `gs://` tables.
pub const GCS_SERVICE_ACCOUNT_PATH: &str = "google_service_account_path";

static GCS_HANDLERS: Once = Once::new();

#[derive(Debug, Error)]
pub enum LakeError {
    #[error("lake table {0} does not exist")]
    NotFound(String),
    #[error("concurrent commit to {table}: {detail}")]
    CommitConflict { table: String, detail: String },
    #[error("{table} does not match the expected schema: {reason}")]
    Schema { table: String, reason: String },
    #[error("object store error on {table}: {source}")]
    Store {
        table: String,
        #[source]
        source: DeltaTableError,
    },
    #[error("delta error on {table}: {source}")]
    Delta {
        table: String,
        #[source]
        source: DeltaTableError,
    },
    #[error("query error: {0}")]
    Query(#[from] DataFusionError),
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
}

impl LakeError {
    pub fn from_delta(table: &str, err: DeltaTableError) -> Self {
        let table = table.to_string();
        match err {
            DeltaTableError::NotATable(_) | DeltaTableError::InvalidTableLocation(_) => LakeError::NotFound(table),
            DeltaTableError::VersionAlreadyExists(version) => LakeError::CommitConflict {
                table,
                detail: format!("version {version} already exists"),
            },
            DeltaTableError::Transaction { source } => LakeError::CommitConflict {
                table,
                detail: source.to_string(),
            },
            err @ DeltaTableError::ObjectStore { .. } => LakeError::Store { table, source: err },
            other => LakeError::Delta { table, source: other },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub version: u64,
    pub inserted: usize,
    pub updated: usize,
}

/// Committed table version; a freshly created table is at 0.
pub fn version_of(table: &DeltaTable) -> u64 {
    u64::try_from(table.version()).unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct LakeTable {
    uri: String,
    columns: Vec<Column>,
    storage_options: HashMap<String, String>,
}

impl LakeTable {
    pub fn new(uri: impl Into<String>, columns: Vec<Column>, storage_options: HashMap<String, String>) -> Self {
        let uri = uri.into();
        if uri.starts_with("gs://") {
            GCS_HANDLERS.call_once(|| deltalake::gcp::register_handlers(None));
        }
        Self {
            uri,
            columns,
            storage_options,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    fn name(&self) -> &str {
        self.uri.trim_end_matches('/').rsplit('/').next().unwrap_or(&self.uri)
    }

    fn delta_err(&self) -> impl Fn(DeltaTableError) -> LakeError + '_ {
        move |err| LakeError::from_delta(&self.uri, err)
    }

    /// Latest committed version. `NotFound` when the table was never created.
    pub async fn load(&self) -> Result<DeltaTable, LakeError> {
        deltalake::open_table_with_storage_options(&self.uri, self.storage_options.clone())
            .await
            .map_err(self.delta_err())
    }

    /// Creates the table unless it exists. Existing data is left alone.
    pub async fn create_if_missing(&self) -> Result<u64, LakeError> {
        let ops = DeltaOps::try_from_uri_with_storage_options(&self.uri, self.storage_options.clone())
            .await
            .map_err(self.delta_err())?;
        let created = ops
            .create()
            .with_table_name(self.name())
            .with_columns(self.columns.iter().map(delta_field))
            .with_save_mode(SaveMode::Ignore)
            .await
            .map_err(self.delta_err());
        match created {
            Ok(table) => Ok(version_of(&table)),
            // Another writer created it first.
            Err(LakeError::CommitConflict { .. }) => Ok(version_of(&self.load().await?)),
            Err(err) => Err(err),
        }
    }

    /// Rows of `table` in column order, optionally limited to `column IN values`.
    pub async fn scan(&self, table: &DeltaTable, only: Option<(&str, &[String])>) -> Result<Vec<Vec<Cell>>, LakeError> {
        let ctx = SessionContext::new();
        let mut frame = ctx.read_table(Arc::new(table.clone()))?;
        if let Some((column, values)) = only {
            if values.is_empty() {
                return Ok(Vec::new());
            }
            let values = values.iter().map(|v| lit(v.as_str())).collect();
            frame = frame.filter(col(column).in_list(values, false))?;
        }
        let names: Vec<&str> = self.columns.iter().map(|c| c.name).collect();
        let batches = frame.select_columns(&names)?.collect().await?;

        let mut rows = Vec::new();
        for batch in &batches {
            rows.extend(batch_to_rows(batch, &self.columns).map_err(|reason| LakeError::Schema {
                table: self.uri.clone(),
                reason,
            })?);
        }
        debug!(table = %self.uri, version = version_of(table), rows = rows.len(), "scanned lake table");
        Ok(rows)
    }

    /// Upserts `rows` by key in one commit.
    ///
    /// A matched target row is overwritten only when `update_guard`, a SQL
    /// predicate over the aliases `s` (incoming) and `t` (stored), holds; the
    /// `keep` columns are never overwritten. Unmatched rows are inserted.
    pub async fn merge(
        &self,
        table: DeltaTable,
        rows: &[Vec<Cell>],
        update_guard: &str,
        keep: &[&str],
    ) -> Result<MergeOutcome, LakeError> {
        let source = SessionContext::new().read_batch(rows_to_batch(rows, &self.columns)?)?;
        let on = self
            .columns
            .iter()
            .filter(|c| c.key)
            .map(|c| format!("s.{0} = t.{0}", c.name))
            .collect::<Vec<_>>()
            .join(" AND ");

        let (table, metrics) = DeltaOps(table)
            .merge(source, on)
            .with_source_alias("s")
            .with_target_alias("t")
            .when_matched_update(|update| {
                self.columns
                    .iter()
                    .filter(|c| !c.key && !keep.contains(&c.name))
                    .fold(update.predicate(update_guard), |update, c| {
                        update.update(c.name, format!("s.{}", c.name))
                    })
            })
            .and_then(|merge| {
                merge.when_not_matched_insert(|insert| {
                    self.columns
                        .iter()
                        .fold(insert, |insert, c| insert.set(c.name, format!("s.{}", c.name)))
                })
            })
            .map_err(self.delta_err())?
            .await
            .map_err(self.delta_err())?;

        let outcome = MergeOutcome {
            version: version_of(&table),
            inserted: metrics.num_target_rows_inserted,
            updated: metrics.num_target_rows_updated,
        };
        info!(
            table = %self.uri,
            version = outcome.version,
            inserted = outcome.inserted,
            updated = outcome.updated,
            "merged into lake table"
        );
        Ok(outcome)
    }

    /// Deletes data files the log removed more than `retention` ago.
    pub async fn vacuum(&self, retention: TimeDelta) -> Result<usize, LakeError> {
        let table = self.load().await?;
        let (_, metrics) = DeltaOps(table)
            .vacuum()
            .with_retention_period(retention)
            .with_enforce_retention_duration(false)
            .with_dry_run(false)
            .await
            .map_err(self.delta_err())?;
        if !metrics.files_deleted.is_empty() {
            info!(table = %self.uri, deleted = metrics.files_deleted.len(), "vacuumed lake table");
        }
        Ok(metrics.files_deleted.len())
    }
}

fn delta_field(column: &Column) -> StructField {
    let ty = match column.ty {
        ColumnType::Text => PrimitiveType::String,
        ColumnType::Date => PrimitiveType::Date,
        ColumnType::Number => PrimitiveType::Double,
        ColumnType::Timestamp => PrimitiveType::Timestamp,
    };
    StructField::new(column.name, DataType::Primitive(ty), column.nullable)
}

fn epoch() -> NaiveDate {
    DateTime::UNIX_EPOCH.date_naive()
}

fn arrow_schema(columns: &[Column]) -> SchemaRef {
    Arc::new(Schema::new(
        columns
            .iter()
            .map(|c| Field::new(c.name, arrow_type(c.ty), c.nullable))
            .collect::<Vec<_>>(),
    ))
}

fn arrow_type(ty: ColumnType) -> ArrowType {
    match ty {
        ColumnType::Text => ArrowType::Utf8,
        ColumnType::Date => ArrowType::Date32,
        ColumnType::Number => ArrowType::Float64,
        ColumnType::Timestamp => ArrowType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
    }
}

fn rows_to_batch(rows: &[Vec<Cell>], columns: &[Column]) -> Result<RecordBatch, ArrowError> {
    let arrays = columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let cells = rows.iter().map(move |row| row.get(idx));
            let array: ArrayRef = match column.ty {
                ColumnType::Text => Arc::new(
                    cells
                        .map(|c| match c {
                            Some(Cell::Text(v)) => v.clone(),
                            _ => None,
                        })
                        .collect::<StringArray>(),
                ),
                ColumnType::Date => Arc::new(
                    cells
                        .map(|c| match c {
                            Some(Cell::Date(Some(d))) => i32::try_from((*d - epoch()).num_days()).ok(),
                            _ => None,
                        })
                        .collect::<Date32Array>(),
                ),
                ColumnType::Number => Arc::new(
                    cells
                        .map(|c| match c {
                            Some(Cell::Number(v)) => *v,
                            _ => None,
                        })
                        .collect::<Float64Array>(),
                ),
                ColumnType::Timestamp => Arc::new(
                    cells
                        .map(|c| match c {
                            Some(Cell::Timestamp(Some(t))) => Some(t.timestamp_micros()),
                            _ => None,
                        })
                        .collect::<TimestampMicrosecondArray>()
                        .with_timezone("UTC"),
                ),
            };
            array
        })
        .collect::<Vec<_>>();
    RecordBatch::try_new(arrow_schema(columns), arrays)
}

/// Scans may hand back view or dictionary encodings; each column is cast to
/// the table type before decoding.
fn batch_to_rows(batch: &RecordBatch, columns: &[Column]) -> Result<Vec<Vec<Cell>>, String> {
    if batch.num_columns() != columns.len() {
        return Err(format!("expected {} columns, found {}", columns.len(), batch.num_columns()));
    }
    let mut rows = vec![Vec::with_capacity(columns.len()); batch.num_rows()];
    for (idx, column) in columns.iter().enumerate() {
        let array = cast(batch.column(idx), &arrow_type(column.ty)).map_err(|e| format!("`{}`: {e}", column.name))?;
        let mismatch = || format!("column `{}` has type {}", column.name, array.data_type());
        match column.ty {
            ColumnType::Text => {
                let values = array.as_any().downcast_ref::<StringArray>().ok_or_else(mismatch)?;
                for (i, row) in rows.iter_mut().enumerate() {
                    row.push(Cell::Text((!values.is_null(i)).then(|| values.value(i).to_string())));
                }
            }
            ColumnType::Date => {
                let values = array.as_any().downcast_ref::<Date32Array>().ok_or_else(mismatch)?;
                for (i, row) in rows.iter_mut().enumerate() {
                    let day = (!values.is_null(i)).then(|| epoch() + TimeDelta::days(i64::from(values.value(i))));
                    row.push(Cell::Date(day));
                }
            }
            ColumnType::Number => {
                let values = array.as_any().downcast_ref::<Float64Array>().ok_or_else(mismatch)?;
                for (i, row) in rows.iter_mut().enumerate() {
                    row.push(Cell::Number((!values.is_null(i)).then(|| values.value(i))));
                }
            }
            ColumnType::Timestamp => {
                let values = array
                    .as_any()
                    .downcast_ref::<TimestampMicrosecondArray>()
                    .ok_or_else(mismatch)?;
                for (i, row) in rows.iter_mut().enumerate() {
                    let at = if values.is_null(i) {
                        None
                    } else {
                        Some(
                            DateTime::<Utc>::from_timestamp_micros(values.value(i))
                                .ok_or_else(|| format!("timestamp out of range in `{}`", column.name))?,
                        )
                    };
                    row.push(Cell::Timestamp(at));
                }
            }
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pse_core::{table_columns, DailyStockPrice, Entity, Stamped, INSERTED_AT};
    use tempfile::tempdir;

    const FRESHER: &str = "(t.extracted_at IS NULL OR s.extracted_at >= t.extracted_at)";

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 5, hour, 0, 0).single().unwrap()
    }

    fn price(symbol: &str, day: u32, close: Option<f64>, extracted_hour: u32, stamped_hour: u32) -> Vec<Cell> {
        Stamped {
            row: DailyStockPrice {
                symbol: symbol.into(),
                date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
                open: None,
                high: close,
                low: close,
                close,
                extracted_at: at(extracted_hour),
            },
            inserted_at: at(stamped_hour),
            updated_at: at(stamped_hour),
        }
        .cells()
    }

    fn table(dir: &std::path::Path) -> LakeTable {
        LakeTable::new(
            dir.join(DailyStockPrice::TABLE).display().to_string(),
            table_columns::<DailyStockPrice>(),
            HashMap::new(),
        )
    }

    async fn sorted(table: &LakeTable) -> Vec<Vec<Cell>> {
        let loaded = table.load().await.unwrap();
        let mut rows = table.scan(&loaded, None).await.unwrap();
        rows.sort_by_key(|r| format!("{:?}{:?}", r[0], r[1]));
        rows
    }

    #[tokio::test]
    async fn missing_table_reports_not_found() {
        let dir = tempdir().unwrap();
        assert!(matches!(table(dir.path()).load().await, Err(LakeError::NotFound(_))));
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let dir = tempdir().unwrap();
        let table = table(dir.path());
        assert_eq!(table.create_if_missing().await.unwrap(), 0);
        assert_eq!(table.create_if_missing().await.unwrap(), 0);
        assert!(sorted(&table).await.is_empty());
    }

    #[tokio::test]
    async fn merge_inserts_then_replaces_by_key() {
        let dir = tempdir().unwrap();
        let table = table(dir.path());
        table.create_if_missing().await.unwrap();

        let first = vec![price("AAA", 2, Some(10.5), 1, 8), price("BBB", 3, None, 1, 8)];
        let loaded = table.load().await.unwrap();
        let outcome = table.merge(loaded, &first, FRESHER, &[INSERTED_AT]).await.unwrap();
        assert_eq!((outcome.version, outcome.inserted, outcome.updated), (1, 2, 0));
        assert_eq!(sorted(&table).await, first);

        let loaded = table.load().await.unwrap();
        let outcome = table
            .merge(loaded, &[price("AAA", 2, Some(11.0), 2, 9)], FRESHER, &[INSERTED_AT])
            .await
            .unwrap();
        assert_eq!((outcome.version, outcome.inserted, outcome.updated), (2, 0, 1));

        let rows = sorted(&table).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][5], Cell::Number(Some(11.0)));
        assert_eq!(rows[0][7], Cell::Timestamp(Some(at(8))));
        assert_eq!(rows[0][8], Cell::Timestamp(Some(at(9))));
    }

    #[tokio::test]
    async fn guard_keeps_fresher_stored_rows() {
        let dir = tempdir().unwrap();
        let table = table(dir.path());
        table.create_if_missing().await.unwrap();
        let loaded = table.load().await.unwrap();
        table
            .merge(loaded, &[price("AAA", 2, Some(10.0), 5, 8)], FRESHER, &[INSERTED_AT])
            .await
            .unwrap();

        let loaded = table.load().await.unwrap();
        let outcome = table
            .merge(loaded, &[price("AAA", 2, Some(99.0), 1, 9)], FRESHER, &[INSERTED_AT])
            .await
            .unwrap();
        assert_eq!(outcome.updated, 0);
        assert_eq!(sorted(&table).await[0][5], Cell::Number(Some(10.0)));
    }

    #[tokio::test]
    async fn key_filter_limits_the_scan() {
        let dir = tempdir().unwrap();
        let table = table(dir.path());
        table.create_if_missing().await.unwrap();
        let loaded = table.load().await.unwrap();
        table
            .merge(
                loaded,
                &[price("AAA", 2, Some(1.0), 1, 8), price("BBB", 2, Some(2.0), 1, 8)],
                FRESHER,
                &[],
            )
            .await
            .unwrap();

        let loaded = table.load().await.unwrap();
        let only = ["BBB".to_string()];
        let rows = table.scan(&loaded, Some(("symbol", &only))).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], Cell::text("BBB"));
        assert!(table.scan(&loaded, Some(("symbol", &[]))).await.unwrap().is_empty());
    }

    #[test]
    fn conflicting_commits_are_classified() {
        let err = LakeError::from_delta("t", DeltaTableError::VersionAlreadyExists(3));
        assert!(matches!(err, LakeError::CommitConflict { .. }));
        let err = LakeError::from_delta("t", DeltaTableError::NotATable("no log".into()));
        assert!(matches!(err, LakeError::NotFound(_)));
    }
}
