//! Incremental upsert planning.
//!
//! A batch is collapsed to one row per identity key, compared against what the
//! destination already holds, and turned into a [`ReplacementPlan`]: the keys to
//! delete and the stamped rows to insert. Planning never touches the destination;
//! executing the plan atomically is the destination's job.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use pse_core::{Entity, ExistingRow, Stamped, EXTRACTED_AT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::destination::Destination;
use crate::error::SyncError;

/// The replace-or-skip rule, written once. A row replaces what is stored unless
/// the stored row came from a strictly newer extraction. Equal freshness replaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Eligibility;

impl Eligibility {
    pub fn is_eligible(new_extracted_at: DateTime<Utc>, existing: Option<&ExistingRow>) -> bool {
        existing.map_or(true, |row| new_extracted_at >= row.extracted_at)
    }

    /// The same rule as a SQL boolean over two row aliases, for server-side MERGE.
    pub fn sql_predicate(new_alias: &str, existing_alias: &str) -> String {
        format!(
            "({existing_alias}.{EXTRACTED_AT} IS NULL OR {new_alias}.{EXTRACTED_AT} >= {existing_alias}.{EXTRACTED_AT})"
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    pub received: usize,
    pub eligible: usize,
    pub inserted_new: usize,
    pub replaced: usize,
    pub skipped_stale: usize,
    pub skipped_duplicate: usize,
}

impl ReconcileStats {
    pub fn absorb(&mut self, other: &ReconcileStats) {
        self.received += other.received;
        self.eligible += other.eligible;
        self.inserted_new += other.inserted_new;
        self.replaced += other.replaced;
        self.skipped_stale += other.skipped_stale;
        self.skipped_duplicate += other.skipped_duplicate;
    }
}

/// Committed destination state for a set of keys. `version` is set by backends
/// with optimistic concurrency; applying a plan against a moved version conflicts.
#[derive(Debug, Clone)]
pub struct ExistingState<K> {
    pub rows: HashMap<K, ExistingRow>,
    pub version: Option<u64>,
}

impl<K> Default for ExistingState<K> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
            version: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplacementPlan<T: Entity> {
    pub reconciled_at: DateTime<Utc>,
    /// Keys that exist in the destination and must be removed before `inserts` land.
    pub delete_keys: Vec<T::Key>,
    pub inserts: Vec<Stamped<T>>,
    pub stats: ReconcileStats,
    pub state_version: Option<u64>,
}

impl<T: Entity> ReplacementPlan<T> {
    pub fn is_empty(&self) -> bool {
        self.delete_keys.is_empty() && self.inserts.is_empty()
    }
}

/// Keeps the freshest row per key; on equal `extracted_at` the later row wins.
/// Output is ordered by key. Returns the number of rows dropped.
pub fn dedupe_batch<T: Entity>(batch: Vec<T>) -> (Vec<T>, usize) {
    let received = batch.len();
    let mut latest: BTreeMap<T::Key, T> = BTreeMap::new();
    for row in batch {
        let key = row.key();
        match latest.get(&key) {
            Some(kept) if kept.extracted_at() > row.extracted_at() => {}
            _ => {
                latest.insert(key, row);
            }
        }
    }
    let dropped = received - latest.len();
    (latest.into_values().collect(), dropped)
}

/// Pure planning step over an already looked-up state.
pub fn plan_replacement<T: Entity>(
    batch: Vec<T>,
    existing: &ExistingState<T::Key>,
    reconciled_at: DateTime<Utc>,
) -> ReplacementPlan<T> {
    let mut stats = ReconcileStats {
        received: batch.len(),
        ..ReconcileStats::default()
    };
    let (rows, dropped) = dedupe_batch(batch);
    stats.skipped_duplicate = dropped;

    let mut delete_keys = Vec::new();
    let mut inserts = Vec::new();
    for row in rows {
        let key = row.key();
        let current = existing.rows.get(&key);
        if !Eligibility::is_eligible(row.extracted_at(), current) {
            debug!(table = T::TABLE, %key, "stale row skipped");
            stats.skipped_stale += 1;
            continue;
        }
        stats.eligible += 1;
        let inserted_at = match current {
            Some(found) => {
                stats.replaced += 1;
                delete_keys.push(key);
                found.inserted_at.unwrap_or(reconciled_at)
            }
            None => {
                stats.inserted_new += 1;
                reconciled_at
            }
        };
        inserts.push(Stamped {
            row,
            inserted_at,
            updated_at: reconciled_at,
        });
    }

    ReplacementPlan {
        reconciled_at,
        delete_keys,
        inserts,
        stats,
        state_version: existing.version,
    }
}

/// Looks up the batch's keys in `destination` and plans against that state.
pub async fn reconcile<T, D>(
    batch: Vec<T>,
    destination: &D,
    reconciled_at: DateTime<Utc>,
) -> Result<ReplacementPlan<T>, SyncError>
where
    T: Entity,
    D: Destination<T> + ?Sized,
{
    let mut keys: Vec<T::Key> = batch.iter().map(Entity::key).collect();
    keys.sort();
    keys.dedup();
    let existing = destination.lookup(&keys).await?;
    let plan = plan_replacement(batch, &existing, reconciled_at);
    info!(
        table = T::TABLE,
        backend = destination.backend().as_str(),
        received = plan.stats.received,
        eligible = plan.stats.eligible,
        replaced = plan.stats.replaced,
        skipped_stale = plan.stats.skipped_stale,
        skipped_duplicate = plan.stats.skipped_duplicate,
        "reconciled batch"
    );
    Ok(plan)
}
