mod common;

use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use common::{lake, Harness};
use pse_core::{DailyStockPrice, PriceKey, Stamped};
use pse_storage::BackoffPolicy;
use pse_sync::destination::{Destination, FailPoint, LakeDestination, PriceCoverage};
use pse_sync::{reconcile, sync_batch, ReplacementPlan, SyncError};

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 5, hour, 0, 0).single().unwrap()
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

fn price(symbol: &str, d: u32, close: f64, extracted_hour: u32) -> DailyStockPrice {
    DailyStockPrice {
        symbol: symbol.to_string(),
        date: day(d),
        open: Some(close - 1.0),
        high: Some(close + 1.0),
        low: None,
        close: Some(close),
        extracted_at: at(extracted_hour),
    }
}

async fn apply<S: Harness>(store: &S, batch: Vec<DailyStockPrice>, reconciled_at: DateTime<Utc>) -> ReplacementPlan<DailyStockPrice> {
    let plan = reconcile(batch, store, reconciled_at).await.unwrap();
    store.apply(&plan).await.unwrap();
    plan
}

fn attributes(rows: &[Stamped<DailyStockPrice>]) -> Vec<(DailyStockPrice, DateTime<Utc>)> {
    rows.iter().map(|s| (s.row.clone(), s.inserted_at)).collect()
}

macro_rules! on_every_backend {
    ($name:ident) => {
        mod $name {
            #[tokio::test]
            async fn memory() {
                let store = pse_sync::destination::MemoryDestination::new();
                super::$name(&store).await;
            }

            #[tokio::test]
            async fn lake() {
                let (_dir, store) = super::lake().await;
                super::$name(&store).await;
            }

            #[tokio::test]
            async fn warehouse() {
                let store = super::common::warehouse().await;
                super::$name(&store).await;
            }
        }
    };
}

async fn equal_freshness_replaces_in_place<S: Harness>(store: &S) {
    apply(store, vec![price("AAA", 2, 10.0, 1)], at(8)).await;
    let plan = apply(store, vec![price("AAA", 2, 10.0, 1)], at(9)).await;

    assert_eq!(plan.stats.replaced, 1);
    assert_eq!(plan.delete_keys, vec![PriceKey::new("AAA", day(2))]);
    let rows = store.prices().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].row, price("AAA", 2, 10.0, 1));
    assert_eq!(rows[0].inserted_at, at(8));
    assert_eq!(rows[0].updated_at, at(9));
}
on_every_backend!(equal_freshness_replaces_in_place);

async fn older_extraction_is_skipped<S: Harness>(store: &S) {
    apply(store, vec![price("AAA", 2, 10.0, 2)], at(8)).await;
    let plan = apply(store, vec![price("AAA", 2, 99.0, 1)], at(9)).await;

    assert!(plan.is_empty());
    assert_eq!(plan.stats.skipped_stale, 1);
    let rows = store.prices().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].row.close, Some(10.0));
    assert_eq!(rows[0].updated_at, at(8));
}
on_every_backend!(older_extraction_is_skipped);

async fn unseen_key_is_inserted_once<S: Harness>(store: &S) {
    apply(store, vec![price("AAA", 2, 10.0, 1)], at(8)).await;
    let plan = apply(store, vec![price("BBB", 3, 20.0, 1)], at(9)).await;

    assert_eq!(plan.stats.inserted_new, 1);
    assert!(plan.delete_keys.is_empty());
    let rows = store.prices().await;
    let bbb: Vec<_> = rows.iter().filter(|s| s.row.symbol == "BBB" && s.row.date == day(3)).collect();
    assert_eq!(bbb.len(), 1);
    assert_eq!(bbb[0].inserted_at, at(9));
}
on_every_backend!(unseen_key_is_inserted_once);

async fn freshest_duplicate_in_batch_wins<S: Harness>(store: &S) {
    let plan = apply(store, vec![price("CCC", 4, 1.0, 1), price("CCC", 4, 3.0, 3)], at(9)).await;

    assert_eq!(plan.stats.skipped_duplicate, 1);
    let rows = store.prices().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].row.close, Some(3.0));
    assert_eq!(rows[0].row.extracted_at, at(3));
}
on_every_backend!(freshest_duplicate_in_batch_wins);

async fn reapplying_a_batch_changes_nothing<S: Harness>(store: &S) {
    let batch = vec![
        price("AAA", 2, 10.0, 1),
        price("AAA", 3, 11.0, 1),
        price("BBB", 2, 20.0, 2),
        price("BBB", 2, 21.0, 3),
    ];
    apply(store, batch.clone(), at(8)).await;
    let first = store.prices().await;
    apply(store, batch, at(9)).await;
    let second = store.prices().await;

    assert_eq!(first.len(), 3);
    assert_eq!(attributes(&first), attributes(&second));
}
on_every_backend!(reapplying_a_batch_changes_nothing);

async fn arrival_order_does_not_matter<S: Harness>(store: &S) {
    let older = price("AAA", 2, 10.0, 1);
    let newer = price("AAA", 2, 12.0, 4);
    apply(store, vec![newer.clone()], at(8)).await;
    apply(store, vec![older], at(9)).await;

    let rows = store.prices().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].row, newer);
}
on_every_backend!(arrival_order_does_not_matter);

async fn failure_after_delete_leaves_state_untouched<S: Harness>(store: &S) {
    apply(store, vec![price("AAA", 2, 10.0, 1), price("AAA", 3, 11.0, 1)], at(8)).await;
    let before = store.prices().await;

    for point in [FailPoint::AfterDelete, FailPoint::BeforeCommit] {
        store.arm(point);
        let plan = reconcile(vec![price("AAA", 2, 50.0, 5), price("ZZZ", 2, 1.0, 5)], store, at(9))
            .await
            .unwrap();
        let err = store.apply(&plan).await.unwrap_err();
        assert_eq!(err.code(), "BACKEND_STATEMENT");
        assert_eq!(store.prices().await, before);
    }

    apply(store, vec![price("AAA", 2, 50.0, 5)], at(10)).await;
    assert_eq!(store.prices().await[0].row.close, Some(50.0));
}
on_every_backend!(failure_after_delete_leaves_state_untouched);

fn no_wait(max_retries: usize) -> BackoffPolicy {
    BackoffPolicy {
        max_retries,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    }
}

async fn conflicts_are_retried_from_a_fresh_lookup<S: Harness>(store: &S) {
    store.arm(FailPoint::WriteConflict);
    let result = sync_batch(&[price("AAA", 2, 10.0, 1)], store, at(8), 2, &no_wait(2))
        .await
        .unwrap();
    assert_eq!(result.retries, 1);
    assert_eq!(store.prices().await.len(), 1);
}
on_every_backend!(conflicts_are_retried_from_a_fresh_lookup);

async fn retry_budget_is_bounded<S: Harness>(store: &S) {
    for _ in 0..3 {
        store.arm(FailPoint::WriteConflict);
    }
    let err = sync_batch(&[price("AAA", 2, 10.0, 1)], store, at(8), 2, &no_wait(2))
        .await
        .unwrap_err();
    match err {
        SyncError::RetriesExhausted { attempts, last, .. } => {
            assert_eq!(attempts, 3);
            assert_eq!(last.code(), "WRITE_CONFLICT");
        }
        other => panic!("expected RETRIES_EXHAUSTED, got {other}"),
    }
    assert!(store.prices().await.is_empty());
}
on_every_backend!(retry_budget_is_bounded);

#[tokio::test]
async fn lake_rejects_a_plan_made_against_an_old_version() {
    let (_dir, store) = lake().await;
    apply(&store, vec![price("AAA", 2, 10.0, 1)], at(8)).await;

    let stale_plan = reconcile(vec![price("AAA", 2, 11.0, 2)], &store, at(9)).await.unwrap();
    apply(&store, vec![price("BBB", 2, 20.0, 2)], at(9)).await;

    let err = Destination::<DailyStockPrice>::apply(&store, &stale_plan).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(store.prices().await.len(), 2);
    assert_eq!(store.prices().await[0].row.close, Some(10.0));

    let result = sync_batch(&[price("AAA", 2, 11.0, 2)], &store, at(10), 1, &no_wait(1))
        .await
        .unwrap();
    assert_eq!(result.retries, 0);
    assert_eq!(store.prices().await[0].row.close, Some(11.0));
}

#[tokio::test]
async fn lake_vacuum_reclaims_replaced_files() {
    let (_dir, store) = lake().await;
    apply(&store, vec![price("AAA", 2, 10.0, 1)], at(8)).await;
    apply(&store, vec![price("AAA", 2, 11.0, 2)], at(9)).await;

    assert_eq!(store.vacuum(Duration::from_secs(3600)).await.unwrap(), 0);
    assert!(store.vacuum(Duration::ZERO).await.unwrap() >= 1);
    assert_eq!(store.prices().await[0].row.close, Some(11.0));
}

#[tokio::test]
async fn lake_without_schema_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let store = LakeDestination::new(dir.path().join("missing").display().to_string());
    let err = reconcile(vec![price("AAA", 2, 10.0, 1)], &store, at(8)).await.unwrap_err();
    assert_eq!(err.code(), "BACKEND_UNAVAILABLE");
}

#[tokio::test]
async fn warehouse_merge_drops_its_staging_table() {
    let store = common::warehouse().await;
    apply(&store, vec![price("AAA", 2, 10.0, 1), price("BBB", 2, 5.0, 1)], at(8)).await;
    store.arm(FailPoint::BeforeCommit);
    let plan = reconcile(vec![price("AAA", 2, 11.0, 2)], &store, at(9)).await.unwrap();
    assert!(Destination::<DailyStockPrice>::apply(&store, &plan).await.is_err());

    assert_eq!(store.client().table_names(), vec!["company".to_string(), "daily_stock_price".to_string()]);
    let latest = store.latest_price_dates().await.unwrap();
    assert_eq!(latest.get("AAA"), Some(&day(2)));
    assert_eq!(latest.len(), 2);
}
