#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use pse_core::{table_columns, Cell, Column, Company, DailyStockPrice, Entity, Stamped, EXTRACTED_AT, INSERTED_AT};
use pse_sync::destination::warehouse::{DmlStats, ParamValue, QueryResult, Statement};
use pse_sync::destination::{
    Destination, FailPoint, LakeDestination, MemoryDestination, SchemaAdmin, WarehouseClient, WarehouseDestination,
};
use pse_sync::SyncError;
use tempfile::TempDir;

#[async_trait]
pub trait Harness: Destination<DailyStockPrice> {
    async fn prices(&self) -> Vec<Stamped<DailyStockPrice>>;
    fn arm(&self, point: FailPoint);
}

#[async_trait]
impl Harness for MemoryDestination {
    async fn prices(&self) -> Vec<Stamped<DailyStockPrice>> {
        self.rows::<DailyStockPrice>().await
    }

    fn arm(&self, point: FailPoint) {
        self.fail_points().arm(point);
    }
}

#[async_trait]
impl Harness for LakeDestination {
    async fn prices(&self) -> Vec<Stamped<DailyStockPrice>> {
        self.rows::<DailyStockPrice>().await.unwrap()
    }

    fn arm(&self, point: FailPoint) {
        self.fail_points().arm(point);
    }
}

#[async_trait]
impl Harness for WarehouseDestination<FakeWarehouse> {
    async fn prices(&self) -> Vec<Stamped<DailyStockPrice>> {
        let mut rows: Vec<Stamped<DailyStockPrice>> = self
            .client()
            .rows(DailyStockPrice::TABLE)
            .iter()
            .map(|cells| Stamped::from_cells(cells).unwrap())
            .collect();
        rows.sort_by_key(|s| s.row.key());
        rows
    }

    fn arm(&self, point: FailPoint) {
        self.client().arm(point);
    }
}

pub async fn lake() -> (TempDir, LakeDestination) {
    let dir = tempfile::tempdir().unwrap();
    let lake = LakeDestination::new(dir.path().join("lake").display().to_string());
    lake.initialize_schema().await.unwrap();
    (dir, lake)
}

pub async fn warehouse() -> WarehouseDestination<FakeWarehouse> {
    let warehouse = WarehouseDestination::new(FakeWarehouse::default(), "pse-test", "pse").unwrap();
    warehouse.initialize_schema().await.unwrap();
    warehouse
}

/// In-process stand-in for BigQuery that runs the statements the warehouse
/// destination emits: scratch tables, parameterized inserts, the keyed
/// `MERGE` with its freshness guard, and the two lookup queries.
///
/// An armed fail point fails the next `MERGE`, the way a concurrent DML job
/// or a rejected statement would.
#[derive(Default)]
pub struct FakeWarehouse {
    tables: Mutex<HashMap<String, Vec<Vec<Cell>>>>,
    armed: Mutex<Vec<FailPoint>>,
}

fn schema_of(table: &str) -> Option<Vec<Column>> {
    let base = table.split("__tmp_ingest__").next().unwrap_or(table);
    if base == Company::TABLE {
        Some(table_columns::<Company>())
    } else if base == DailyStockPrice::TABLE {
        Some(table_columns::<DailyStockPrice>())
    } else {
        None
    }
}

/// Unqualified names of every backticked `project.dataset.table` in `sql`.
fn tables_in(sql: &str) -> Vec<String> {
    sql.split('`')
        .skip(1)
        .step_by(2)
        .filter(|ident| ident.matches('.').count() == 2)
        .filter_map(|ident| ident.rsplit('.').next())
        .map(str::to_string)
        .collect()
}

fn not_found(table: &str) -> SyncError {
    SyncError::unavailable("warehouse", format!("404 Not Found: Table {table} was not found"))
}

fn position(columns: &[Column], name: &str) -> usize {
    columns.iter().position(|c| c.name == name).unwrap()
}

impl FakeWarehouse {
    pub fn rows(&self, table: &str) -> Vec<Vec<Cell>> {
        self.tables.lock().unwrap().get(table).cloned().unwrap_or_default()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn arm(&self, point: FailPoint) {
        self.armed.lock().unwrap().push(point);
    }

    fn fire(&self, table: &str) -> Result<(), SyncError> {
        let mut armed = self.armed.lock().unwrap();
        if armed.is_empty() {
            return Ok(());
        }
        match armed.remove(0) {
            FailPoint::WriteConflict => Err(SyncError::WriteConflict {
                table: table.to_string(),
                detail: "Could not serialize access to table due to concurrent update".to_string(),
            }),
            point => Err(SyncError::statement("warehouse", format!("injected failure at {point:?}"))),
        }
    }

    fn merge(&self, target: &str, staging: &str) -> Result<QueryResult, SyncError> {
        self.fire(target)?;
        let columns = schema_of(target).ok_or_else(|| not_found(target))?;
        let key_width = columns.iter().filter(|c| c.key).count();
        let extracted = position(&columns, EXTRACTED_AT);
        let inserted = position(&columns, INSERTED_AT);

        let mut tables = self.tables.lock().unwrap();
        let staged = tables.get(staging).cloned().ok_or_else(|| not_found(staging))?;
        let stored = tables.get_mut(target).ok_or_else(|| not_found(target))?;
        let mut stats = DmlStats::default();
        for row in staged {
            match stored.iter().position(|t| t[..key_width] == row[..key_width]) {
                Some(found) => {
                    let existing = &mut stored[found];
                    let eligible = match (&existing[extracted], &row[extracted]) {
                        (Cell::Timestamp(None), _) => true,
                        (Cell::Timestamp(Some(t)), Cell::Timestamp(Some(s))) => s >= t,
                        _ => false,
                    };
                    if eligible {
                        for (idx, cell) in row.into_iter().enumerate().skip(key_width) {
                            if idx != inserted {
                                existing[idx] = cell;
                            }
                        }
                        stats.updated += 1;
                    }
                }
                None => {
                    stored.push(row);
                    stats.inserted += 1;
                }
            }
        }
        Ok(QueryResult {
            rows: Vec::new(),
            dml: Some(stats),
        })
    }

    fn lookup(&self, table: &str, statement: &Statement) -> Result<QueryResult, SyncError> {
        let columns = schema_of(table).ok_or_else(|| not_found(table))?;
        let key_width = columns.iter().filter(|c| c.key).count();
        let extracted = position(&columns, EXTRACTED_AT);
        let inserted = position(&columns, INSERTED_AT);
        let filters: Vec<&Vec<Cell>> = statement
            .params
            .iter()
            .filter_map(|p| match &p.value {
                ParamValue::Array(_, values) => Some(values),
                ParamValue::Scalar(_) => None,
            })
            .collect();

        let tables = self.tables.lock().unwrap();
        let stored = tables.get(table).ok_or_else(|| not_found(table))?;
        let rows = stored
            .iter()
            .filter(|row| filters.iter().enumerate().all(|(idx, values)| values.contains(&row[idx])))
            .map(|row| {
                let mut out = row[..key_width].to_vec();
                out.push(row[extracted].clone());
                out.push(row[inserted].clone());
                out
            })
            .collect();
        Ok(QueryResult { rows, dml: None })
    }

    fn latest_dates(&self, table: &str) -> Result<QueryResult, SyncError> {
        let tables = self.tables.lock().unwrap();
        let stored = tables.get(table).ok_or_else(|| not_found(table))?;
        let mut latest: HashMap<String, Cell> = HashMap::new();
        for row in stored {
            if let (Cell::Text(Some(symbol)), Cell::Date(Some(date))) = (&row[0], &row[1]) {
                let entry = latest.entry(symbol.clone()).or_insert(Cell::Date(Some(*date)));
                if matches!(entry, Cell::Date(Some(seen)) if *seen < *date) {
                    *entry = Cell::Date(Some(*date));
                }
            }
        }
        let rows = latest
            .into_iter()
            .map(|(symbol, date)| vec![Cell::text(symbol), date])
            .collect();
        Ok(QueryResult { rows, dml: None })
    }
}

#[async_trait]
impl WarehouseClient for FakeWarehouse {
    async fn execute(&self, statement: &Statement) -> Result<QueryResult, SyncError> {
        let sql = statement.sql.as_str();
        if sql.starts_with("CREATE SCHEMA") {
            return Ok(QueryResult::default());
        }
        let names = tables_in(sql);
        let table = names
            .first()
            .cloned()
            .ok_or_else(|| SyncError::statement("warehouse", format!("no table in {sql}")))?;

        if sql.starts_with("CREATE TABLE IF NOT EXISTS") {
            self.tables.lock().unwrap().entry(table).or_default();
        } else if sql.starts_with("CREATE TABLE") {
            if self.tables.lock().unwrap().insert(table.clone(), Vec::new()).is_some() {
                return Err(SyncError::statement("warehouse", format!("Already Exists: Table {table}")));
            }
        } else if sql.starts_with("DROP TABLE IF EXISTS") {
            self.tables.lock().unwrap().remove(&table);
        } else if sql.starts_with("INSERT INTO") {
            let width = schema_of(&table).ok_or_else(|| not_found(&table))?.len();
            let cells: Vec<Cell> = statement
                .params
                .iter()
                .filter_map(|p| match &p.value {
                    ParamValue::Scalar(cell) => Some(cell.clone()),
                    ParamValue::Array(..) => None,
                })
                .collect();
            let mut tables = self.tables.lock().unwrap();
            let staged = tables.get_mut(&table).ok_or_else(|| not_found(&table))?;
            staged.extend(cells.chunks(width).map(<[Cell]>::to_vec));
        } else if sql.starts_with("MERGE") {
            let staging = names.get(1).ok_or_else(|| SyncError::statement("warehouse", "MERGE without a source"))?;
            return self.merge(&table, staging);
        } else if sql.contains("IN UNNEST") {
            return self.lookup(&table, statement);
        } else if sql.contains("MAX(") {
            return self.latest_dates(&table);
        } else {
            return Err(SyncError::statement("warehouse", format!("unsupported statement: {sql}")));
        }
        Ok(QueryResult::default())
    }
}
