//! Relational backend: each apply is a single transaction of chunked
//! delete-by-key and multi-row insert statements.

use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pse_core::{table_columns, Cell, Column, ColumnType, Company, DailyStockPrice, Entity, ExistingRow, EXTRACTED_AT, INSERTED_AT};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::query_builder::Separated;
use sqlx::{Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, info, info_span, Instrument};

use super::{chunked, ApplyOutcome, Backend, Destination, FailPoint, FailPoints, HasBackend, PriceCoverage, SchemaAdmin};
use crate::error::SyncError;
use crate::reconcile::{ExistingState, ReplacementPlan};

const BACKEND: &str = "postgres";
/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 60_000;

#[derive(Debug, Clone)]
pub struct PostgresDestination {
    pool: PgPool,
    schema: String,
    write_timeout: Option<Duration>,
    fail_points: std::sync::Arc<FailPoints>,
}

pub fn validate_identifier(name: &str) -> Result<(), SyncError> {
    let valid = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(SyncError::config(format!("invalid identifier {name:?}")))
    }
}

fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

fn column_list(columns: &[Column]) -> String {
    columns.iter().map(|c| quote(c.name)).collect::<Vec<_>>().join(", ")
}

fn sql_type(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Text => "TEXT",
        ColumnType::Date => "DATE",
        ColumnType::Number => "DOUBLE PRECISION",
        ColumnType::Timestamp => "TIMESTAMPTZ",
    }
}

/// `CREATE TABLE IF NOT EXISTS` for an entity's persisted column set.
pub fn create_table_sql<T: Entity>(schema: &str) -> String {
    let columns = table_columns::<T>();
    let mut defs: Vec<String> = columns
        .iter()
        .map(|c| {
            let null = if c.nullable { "" } else { " NOT NULL" };
            format!("{} {}{}", quote(c.name), sql_type(c.ty), null)
        })
        .collect();
    defs.push(format!("PRIMARY KEY ({})", column_list(&T::key_columns())));
    format!(
        "CREATE TABLE IF NOT EXISTS {}.{} (\n    {}\n)",
        quote(schema),
        quote(T::TABLE),
        defs.join(",\n    ")
    )
}

fn bind_cell<Sep: Display>(sep: &mut Separated<'_, '_, Postgres, Sep>, cell: Cell) {
    match cell {
        Cell::Text(value) => sep.push_bind(value),
        Cell::Date(value) => sep.push_bind(value),
        Cell::Number(value) => sep.push_bind(value),
        Cell::Timestamp(value) => sep.push_bind(value),
    };
}

fn decode_cell(row: &PgRow, idx: usize, ty: ColumnType) -> Result<Cell, sqlx::Error> {
    Ok(match ty {
        ColumnType::Text => Cell::Text(row.try_get(idx)?),
        ColumnType::Date => Cell::Date(row.try_get(idx)?),
        ColumnType::Number => Cell::Number(row.try_get(idx)?),
        ColumnType::Timestamp => Cell::Timestamp(row.try_get(idx)?),
    })
}

impl PostgresDestination {
    pub async fn connect(database_url: &str, schema: &str, write_timeout: Option<Duration>) -> Result<Self, SyncError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(15))
            .connect(database_url)
            .await
            .map_err(|err| SyncError::unavailable(BACKEND, err))?;
        Self::from_pool(pool, schema, write_timeout)
    }

    pub fn from_pool(pool: PgPool, schema: &str, write_timeout: Option<Duration>) -> Result<Self, SyncError> {
        validate_identifier(schema)?;
        Ok(Self {
            pool,
            schema: schema.to_string(),
            write_timeout,
            fail_points: Default::default(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn fail_points(&self) -> &FailPoints {
        &self.fail_points
    }

    fn qualified<T: Entity>(&self) -> String {
        format!("{}.{}", quote(&self.schema), quote(T::TABLE))
    }

    async fn apply_in_tx<T: Entity>(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        plan: &ReplacementPlan<T>,
    ) -> Result<usize, SyncError> {
        let pg_err = |err| SyncError::from_sqlx(T::TABLE, err);
        if let Some(timeout) = self.write_timeout {
            sqlx::query(&format!("SET LOCAL statement_timeout = {}", timeout.as_millis()))
                .execute(&mut **tx)
                .await
                .map_err(pg_err)?;
        }

        let key_columns = T::key_columns();
        let mut deleted = 0usize;
        for keys in chunked(&plan.delete_keys, MAX_BIND_PARAMS / key_columns.len().max(1)) {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "DELETE FROM {} WHERE ({}) IN ",
                self.qualified::<T>(),
                column_list(&key_columns)
            ));
            qb.push_tuples(keys, |mut b, key| {
                for cell in T::key_cells(key) {
                    bind_cell(&mut b, cell);
                }
            });
            let done = qb.build().execute(&mut **tx).await.map_err(pg_err)?;
            deleted += done.rows_affected() as usize;
        }
        self.fail_points.check(FailPoint::AfterDelete, T::TABLE, BACKEND)?;

        let columns = table_columns::<T>();
        for rows in chunked(&plan.inserts, MAX_BIND_PARAMS / columns.len()) {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {} ({}) ",
                self.qualified::<T>(),
                column_list(&columns)
            ));
            qb.push_values(rows, |mut b, stamped| {
                for cell in stamped.cells() {
                    bind_cell(&mut b, cell);
                }
            });
            qb.build().execute(&mut **tx).await.map_err(pg_err)?;
        }
        self.fail_points.check(FailPoint::BeforeCommit, T::TABLE, BACKEND)?;
        Ok(deleted)
    }

    /// Runs the plan in one transaction; any failure rolls back.
    async fn apply_transaction<T: Entity>(&self, plan: &ReplacementPlan<T>) -> Result<ApplyOutcome, SyncError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| SyncError::from_sqlx(T::TABLE, err))?;
        match self.apply_in_tx(&mut tx, plan).await {
            Ok(deleted) => {
                tx.commit().await.map_err(|err| SyncError::from_sqlx(T::TABLE, err))?;
                debug!(deleted, inserted = plan.inserts.len(), "transaction committed");
                Ok(ApplyOutcome {
                    deleted,
                    inserted: plan.inserts.len(),
                    version: None,
                })
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    debug!(error = %rollback, "rollback after failed apply also failed");
                }
                Err(err)
            }
        }
    }
}

impl HasBackend for PostgresDestination {
    fn backend(&self) -> Backend {
        Backend::Postgres
    }
}

#[async_trait]
impl<T: Entity> Destination<T> for PostgresDestination {
    async fn lookup(&self, keys: &[T::Key]) -> Result<ExistingState<T::Key>, SyncError> {
        let key_columns = T::key_columns();
        let mut rows = HashMap::with_capacity(keys.len());
        for chunk in chunked(keys, MAX_BIND_PARAMS / key_columns.len().max(1)) {
            let mut qb = QueryBuilder::<Postgres>::new(format!(
                "SELECT {}, {}, {} FROM {} WHERE ({}) IN ",
                column_list(&key_columns),
                quote(EXTRACTED_AT),
                quote(INSERTED_AT),
                self.qualified::<T>(),
                column_list(&key_columns)
            ));
            qb.push_tuples(chunk, |mut b, key| {
                for cell in T::key_cells(key) {
                    bind_cell(&mut b, cell);
                }
            });
            let fetched = qb
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(|err| SyncError::from_sqlx(T::TABLE, err))?;

            for row in fetched {
                let decode = |row: &PgRow| -> Result<(T::Key, ExistingRow), sqlx::Error> {
                    let cells = key_columns
                        .iter()
                        .enumerate()
                        .map(|(idx, column)| decode_cell(row, idx, column.ty))
                        .collect::<Result<Vec<_>, _>>()?;
                    let key = T::key_from_cells(&cells).map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
                    let extracted_at: DateTime<Utc> = row.try_get(key_columns.len())?;
                    let inserted_at: Option<DateTime<Utc>> = row.try_get(key_columns.len() + 1)?;
                    Ok((key, ExistingRow { extracted_at, inserted_at }))
                };
                let (key, existing) = decode(&row).map_err(|err| SyncError::from_sqlx(T::TABLE, err))?;
                rows.insert(key, existing);
            }
        }
        Ok(ExistingState { rows, version: None })
    }

    async fn apply(&self, plan: &ReplacementPlan<T>) -> Result<ApplyOutcome, SyncError> {
        if plan.is_empty() {
            return Ok(ApplyOutcome::default());
        }
        let span = info_span!("pg_apply", table = T::TABLE, deletes = plan.delete_keys.len(), inserts = plan.inserts.len());
        self.apply_transaction(plan).instrument(span).await
    }
}

#[async_trait]
impl PriceCoverage for PostgresDestination {
    async fn latest_price_dates(&self) -> Result<HashMap<String, NaiveDate>, SyncError> {
        let sql = format!(
            "SELECT \"symbol\", MAX(\"date\") AS latest_date FROM {} GROUP BY \"symbol\"",
            self.qualified::<DailyStockPrice>()
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| SyncError::from_sqlx(DailyStockPrice::TABLE, err))?;
        rows.iter()
            .map(|row| -> Result<(String, NaiveDate), sqlx::Error> { Ok((row.try_get(0)?, row.try_get(1)?)) })
            .collect::<Result<HashMap<_, _>, sqlx::Error>>()
            .map_err(|err| SyncError::from_sqlx(DailyStockPrice::TABLE, err))
    }
}

#[async_trait]
impl SchemaAdmin for PostgresDestination {
    async fn initialize_schema(&self) -> Result<(), SyncError> {
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", quote(&self.schema)),
            create_table_sql::<Company>(&self.schema),
            create_table_sql::<DailyStockPrice>(&self.schema),
        ];
        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|err| SyncError::from_sqlx("schema", err))?;
        }
        info!(schema = %self.schema, "postgres schema ready");
        Ok(())
    }
}
