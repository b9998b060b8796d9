//! In-process transactional store for tests and dry runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::NaiveDate;
use pse_core::{Company, DailyStockPrice, Entity, ExistingRow, Stamped};
use tokio::sync::Mutex;
use tracing::info;

use super::{ApplyOutcome, Backend, Destination, FailPoint, FailPoints, HasBackend, PriceCoverage, SchemaAdmin};
use crate::error::SyncError;
use crate::reconcile::{ExistingState, ReplacementPlan};

const BACKEND: &str = "memory";

#[derive(Debug)]
pub struct MemoryTable<T: Entity> {
    rows: BTreeMap<T::Key, Stamped<T>>,
}

impl<T: Entity> Default for MemoryTable<T> {
    fn default() -> Self {
        Self { rows: BTreeMap::new() }
    }
}

/// Entities the memory store keeps a table for.
pub trait MemoryEntity: Entity {
    fn table(store: &MemoryDestination) -> &Mutex<MemoryTable<Self>>;
}

impl MemoryEntity for Company {
    fn table(store: &MemoryDestination) -> &Mutex<MemoryTable<Self>> {
        &store.companies
    }
}

impl MemoryEntity for DailyStockPrice {
    fn table(store: &MemoryDestination) -> &Mutex<MemoryTable<Self>> {
        &store.prices
    }
}

#[derive(Debug, Default)]
pub struct MemoryDestination {
    companies: Mutex<MemoryTable<Company>>,
    prices: Mutex<MemoryTable<DailyStockPrice>>,
    fail_points: FailPoints,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_points(&self) -> &FailPoints {
        &self.fail_points
    }

    /// Committed rows in key order.
    pub async fn rows<T: MemoryEntity>(&self) -> Vec<Stamped<T>> {
        T::table(self).lock().await.rows.values().cloned().collect()
    }
}

impl HasBackend for MemoryDestination {
    fn backend(&self) -> Backend {
        Backend::Memory
    }
}

#[async_trait]
impl<T: MemoryEntity> Destination<T> for MemoryDestination {
    async fn lookup(&self, keys: &[T::Key]) -> Result<ExistingState<T::Key>, SyncError> {
        let table = T::table(self).lock().await;
        let rows = keys
            .iter()
            .filter_map(|key| {
                table.rows.get(key).map(|stored| {
                    (
                        key.clone(),
                        ExistingRow {
                            extracted_at: stored.row.extracted_at(),
                            inserted_at: Some(stored.inserted_at),
                        },
                    )
                })
            })
            .collect();
        Ok(ExistingState { rows, version: None })
    }

    async fn apply(&self, plan: &ReplacementPlan<T>) -> Result<ApplyOutcome, SyncError> {
        let mut table = T::table(self).lock().await;
        self.fail_points.check(FailPoint::WriteConflict, T::TABLE, BACKEND)?;

        // Work on a copy; the committed map is only swapped at the end.
        let mut working = table.rows.clone();
        let mut deleted = 0;
        for key in &plan.delete_keys {
            if working.remove(key).is_some() {
                deleted += 1;
            }
        }
        self.fail_points.check(FailPoint::AfterDelete, T::TABLE, BACKEND)?;

        for stamped in &plan.inserts {
            let key = stamped.row.key();
            if working.contains_key(&key) {
                return Err(SyncError::WriteConflict {
                    table: T::TABLE.to_string(),
                    detail: format!("{key} already exists"),
                });
            }
            working.insert(key, stamped.clone());
        }
        self.fail_points.check(FailPoint::BeforeCommit, T::TABLE, BACKEND)?;

        table.rows = working;
        Ok(ApplyOutcome {
            deleted,
            inserted: plan.inserts.len(),
            version: None,
        })
    }
}

#[async_trait]
impl PriceCoverage for MemoryDestination {
    async fn latest_price_dates(&self) -> Result<HashMap<String, NaiveDate>, SyncError> {
        let table = self.prices.lock().await;
        let mut latest: HashMap<String, NaiveDate> = HashMap::new();
        for key in table.rows.keys() {
            latest
                .entry(key.symbol.clone())
                .and_modify(|d| *d = (*d).max(key.date))
                .or_insert(key.date);
        }
        Ok(latest)
    }
}

#[async_trait]
impl SchemaAdmin for MemoryDestination {
    async fn initialize_schema(&self) -> Result<(), SyncError> {
        info!(backend = BACKEND, "memory tables need no schema");
        Ok(())
    }
}
