//! Canonical entity model shared by extraction, reconciliation and every destination backend.

use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Text,
    Date,
    Number,
    Timestamp,
}

/// One column of a persisted table. The same column list drives Postgres DDL,
/// warehouse MERGE text and the lake-table arrow schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    pub key: bool,
}

impl Column {
    pub const fn key(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
            key: true,
        }
    }

    pub const fn required(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
            key: false,
        }
    }

    pub const fn nullable(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: true,
            key: false,
        }
    }
}

pub const EXTRACTED_AT: &str = "extracted_at";
pub const INSERTED_AT: &str = "inserted_at";
pub const UPDATED_AT: &str = "updated_at";

/// Destination-assigned bookkeeping columns appended to every entity's attribute columns.
pub const STAMP_COLUMNS: [Column; 2] = [
    Column::required(INSERTED_AT, ColumnType::Timestamp),
    Column::required(UPDATED_AT, ColumnType::Timestamp),
];

/// A single typed value. Absent values stay absent (`None`), they never collapse to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Text(Option<String>),
    Date(Option<NaiveDate>),
    Number(Option<f64>),
    Timestamp(Option<DateTime<Utc>>),
}

impl Cell {
    pub fn null_of(ty: ColumnType) -> Self {
        match ty {
            ColumnType::Text => Cell::Text(None),
            ColumnType::Date => Cell::Date(None),
            ColumnType::Number => Cell::Number(None),
            ColumnType::Timestamp => Cell::Timestamp(None),
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Cell::Text(_) => ColumnType::Text,
            Cell::Date(_) => ColumnType::Date,
            Cell::Number(_) => ColumnType::Number,
            Cell::Timestamp(_) => ColumnType::Timestamp,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Cell::Text(v) => v.is_none(),
            Cell::Date(v) => v.is_none(),
            Cell::Number(v) => v.is_none(),
            Cell::Timestamp(v) => v.is_none(),
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(Some(value.into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellError {
    #[error("expected {expected} cells, got {actual}")]
    Arity { expected: usize, actual: usize },
    #[error("column `{column}` has the wrong type (expected {expected:?})")]
    Type {
        column: &'static str,
        expected: ColumnType,
    },
    #[error("column `{column}` is null but not nullable")]
    Null { column: &'static str },
}

/// A synchronized entity: identity key, freshness marker and a flat cell encoding.
pub trait Entity: Clone + fmt::Debug + Send + Sync + 'static {
    type Key: Clone + Ord + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;

    const TABLE: &'static str;

    /// Attribute columns, key columns first, `extracted_at` included.
    fn columns() -> &'static [Column];

    fn key(&self) -> Self::Key;

    fn extracted_at(&self) -> DateTime<Utc>;

    fn cells(&self) -> Vec<Cell>;

    fn from_cells(cells: &[Cell]) -> Result<Self, CellError>;

    fn key_cells(key: &Self::Key) -> Vec<Cell>;

    fn key_from_cells(cells: &[Cell]) -> Result<Self::Key, CellError>;

    fn key_columns() -> Vec<Column> {
        Self::columns().iter().copied().filter(|c| c.key).collect()
    }
}

/// Full persisted column set: entity attributes followed by `inserted_at`, `updated_at`.
pub fn table_columns<T: Entity>() -> Vec<Column> {
    T::columns().iter().copied().chain(STAMP_COLUMNS).collect()
}

pub fn column_index<T: Entity>(name: &str) -> Option<usize> {
    table_columns::<T>().iter().position(|c| c.name == name)
}

/// Company listing metadata; identity is `symbol`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub symbol: String,
    pub company_name: Option<String>,
    pub sector: Option<String>,
    pub subsector: Option<String>,
    pub listing_date: Option<NaiveDate>,
    pub extracted_at: DateTime<Utc>,
}

const COMPANY_COLUMNS: [Column; 6] = [
    Column::key("symbol", ColumnType::Text),
    Column::nullable("company_name", ColumnType::Text),
    Column::nullable("sector", ColumnType::Text),
    Column::nullable("subsector", ColumnType::Text),
    Column::nullable("listing_date", ColumnType::Date),
    Column::required(EXTRACTED_AT, ColumnType::Timestamp),
];

impl Entity for Company {
    type Key = String;

    const TABLE: &'static str = "company";

    fn columns() -> &'static [Column] {
        &COMPANY_COLUMNS
    }

    fn key(&self) -> String {
        self.symbol.clone()
    }

    fn extracted_at(&self) -> DateTime<Utc> {
        self.extracted_at
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::text(self.symbol.clone()),
            Cell::Text(self.company_name.clone()),
            Cell::Text(self.sector.clone()),
            Cell::Text(self.subsector.clone()),
            Cell::Date(self.listing_date),
            Cell::Timestamp(Some(self.extracted_at)),
        ]
    }

    fn from_cells(cells: &[Cell]) -> Result<Self, CellError> {
        check_arity(cells, COMPANY_COLUMNS.len())?;
        Ok(Self {
            symbol: required_text(&cells[0], "symbol")?,
            company_name: optional_text(&cells[1], "company_name")?,
            sector: optional_text(&cells[2], "sector")?,
            subsector: optional_text(&cells[3], "subsector")?,
            listing_date: optional_date(&cells[4], "listing_date")?,
            extracted_at: required_timestamp(&cells[5], EXTRACTED_AT)?,
        })
    }

    fn key_cells(key: &String) -> Vec<Cell> {
        vec![Cell::text(key.clone())]
    }

    fn key_from_cells(cells: &[Cell]) -> Result<String, CellError> {
        check_arity(cells, 1)?;
        required_text(&cells[0], "symbol")
    }
}

/// Identity of one daily price observation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PriceKey {
    pub symbol: String,
    pub date: NaiveDate,
}

impl PriceKey {
    pub fn new(symbol: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            symbol: symbol.into(),
            date,
        }
    }
}

impl fmt::Display for PriceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.date)
    }
}

/// One daily OHLC observation. Prices are absent when the source reports no trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStockPrice {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub extracted_at: DateTime<Utc>,
}

const PRICE_COLUMNS: [Column; 7] = [
    Column::key("symbol", ColumnType::Text),
    Column::key("date", ColumnType::Date),
    Column::nullable("open", ColumnType::Number),
    Column::nullable("high", ColumnType::Number),
    Column::nullable("low", ColumnType::Number),
    Column::nullable("close", ColumnType::Number),
    Column::required(EXTRACTED_AT, ColumnType::Timestamp),
];

impl Entity for DailyStockPrice {
    type Key = PriceKey;

    const TABLE: &'static str = "daily_stock_price";

    fn columns() -> &'static [Column] {
        &PRICE_COLUMNS
    }

    fn key(&self) -> PriceKey {
        PriceKey::new(self.symbol.clone(), self.date)
    }

    fn extracted_at(&self) -> DateTime<Utc> {
        self.extracted_at
    }

    fn cells(&self) -> Vec<Cell> {
        vec![
            Cell::text(self.symbol.clone()),
            Cell::Date(Some(self.date)),
            Cell::Number(self.open),
            Cell::Number(self.high),
            Cell::Number(self.low),
            Cell::Number(self.close),
            Cell::Timestamp(Some(self.extracted_at)),
        ]
    }

    fn from_cells(cells: &[Cell]) -> Result<Self, CellError> {
        check_arity(cells, PRICE_COLUMNS.len())?;
        Ok(Self {
            symbol: required_text(&cells[0], "symbol")?,
            date: required_date(&cells[1], "date")?,
            open: optional_number(&cells[2], "open")?,
            high: optional_number(&cells[3], "high")?,
            low: optional_number(&cells[4], "low")?,
            close: optional_number(&cells[5], "close")?,
            extracted_at: required_timestamp(&cells[6], EXTRACTED_AT)?,
        })
    }

    fn key_cells(key: &PriceKey) -> Vec<Cell> {
        vec![Cell::text(key.symbol.clone()), Cell::Date(Some(key.date))]
    }

    fn key_from_cells(cells: &[Cell]) -> Result<PriceKey, CellError> {
        check_arity(cells, 2)?;
        Ok(PriceKey {
            symbol: required_text(&cells[0], "symbol")?,
            date: required_date(&cells[1], "date")?,
        })
    }
}

/// A row as persisted: the entity plus destination-assigned timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub row: T,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<T: Entity> Stamped<T> {
    pub fn cells(&self) -> Vec<Cell> {
        let mut cells = self.row.cells();
        cells.push(Cell::Timestamp(Some(self.inserted_at)));
        cells.push(Cell::Timestamp(Some(self.updated_at)));
        cells
    }

    pub fn from_cells(cells: &[Cell]) -> Result<Self, CellError> {
        let width = T::columns().len();
        check_arity(cells, width + STAMP_COLUMNS.len())?;
        Ok(Self {
            row: T::from_cells(&cells[..width])?,
            inserted_at: required_timestamp(&cells[width], INSERTED_AT)?,
            updated_at: required_timestamp(&cells[width + 1], UPDATED_AT)?,
        })
    }
}

/// What reconciliation needs to know about a row already in the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingRow {
    pub extracted_at: DateTime<Utc>,
    pub inserted_at: Option<DateTime<Utc>>,
}

fn check_arity(cells: &[Cell], expected: usize) -> Result<(), CellError> {
    if cells.len() == expected {
        Ok(())
    } else {
        Err(CellError::Arity {
            expected,
            actual: cells.len(),
        })
    }
}

fn optional_text(cell: &Cell, column: &'static str) -> Result<Option<String>, CellError> {
    match cell {
        Cell::Text(v) => Ok(v.clone()),
        _ => Err(CellError::Type {
            column,
            expected: ColumnType::Text,
        }),
    }
}

fn required_text(cell: &Cell, column: &'static str) -> Result<String, CellError> {
    optional_text(cell, column)?.ok_or(CellError::Null { column })
}

fn optional_date(cell: &Cell, column: &'static str) -> Result<Option<NaiveDate>, CellError> {
    match cell {
        Cell::Date(v) => Ok(*v),
        _ => Err(CellError::Type {
            column,
            expected: ColumnType::Date,
        }),
    }
}

fn required_date(cell: &Cell, column: &'static str) -> Result<NaiveDate, CellError> {
    optional_date(cell, column)?.ok_or(CellError::Null { column })
}

fn optional_number(cell: &Cell, column: &'static str) -> Result<Option<f64>, CellError> {
    match cell {
        Cell::Number(v) => Ok(*v),
        _ => Err(CellError::Type {
            column,
            expected: ColumnType::Number,
        }),
    }
}

fn required_timestamp(cell: &Cell, column: &'static str) -> Result<DateTime<Utc>, CellError> {
    match cell {
        Cell::Timestamp(Some(v)) => Ok(*v),
        Cell::Timestamp(None) => Err(CellError::Null { column }),
        _ => Err(CellError::Type {
            column,
            expected: ColumnType::Timestamp,
        }),
    }
}
