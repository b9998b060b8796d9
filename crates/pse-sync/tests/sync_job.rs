use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use pse_adapters::FixtureAdapter;
use pse_core::{Company, DailyStockPrice};
use pse_sync::destination::{LakeDestination, MemoryDestination, PriceCoverage};
use pse_sync::{BackfillRequest, JobAction, JobOptions, JobStatus, SyncJob};

fn bundle_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/pse-edge/sample/bundle.json")
}

fn adapter() -> Arc<FixtureAdapter> {
    Arc::new(FixtureAdapter::from_bundle_path(bundle_path()).expect("load bundle"))
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
}

fn options(reports: &Path) -> JobOptions {
    JobOptions {
        concurrency: 2,
        reports_dir: Some(reports.to_path_buf()),
        ..JobOptions::default()
    }
}

#[tokio::test]
async fn sync_loads_companies_and_prices_and_reports_missing_charts() {
    let reports = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryDestination::new());
    let job = SyncJob::new(adapter(), store.clone(), options(reports.path())).with_market_date(day(5));

    let report = job.run(JobAction::Sync).await;

    assert_eq!(report.status, JobStatus::PartialExtractionFailure);
    assert_eq!(report.extraction_units, 4);
    assert_eq!(report.extraction_failures.len(), 1);
    assert_eq!(report.extraction_failures[0].unit, "JFC");
    assert_eq!(report.error.as_ref().unwrap().code, "PARTIAL_EXTRACTION_FAILURE");

    assert_eq!(report.companies.malformed, 1);
    assert_eq!(report.companies.stats.inserted_new, 3);
    assert_eq!(report.prices.stats.inserted_new, 5);
    assert_eq!(report.prices.malformed, 0);

    let companies = store.rows::<Company>().await;
    let symbols: Vec<&str> = companies.iter().map(|c| c.row.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["AC", "BDO", "JFC"]);

    let latest = store.latest_price_dates().await.unwrap();
    assert_eq!(latest.get("AC"), Some(&day(3)));
    assert_eq!(latest.get("BDO"), Some(&day(4)));
    assert!(!latest.contains_key("JFC"));

    let written = reports.path().join(report.run_id.to_string()).join("job_report.json");
    let body: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(written).unwrap()).unwrap();
    assert_eq!(body["status"], "partial_extraction_failure");
}

#[tokio::test]
async fn second_sync_adds_no_duplicates() {
    let reports = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryDestination::new());
    let job = SyncJob::new(adapter(), store.clone(), options(reports.path())).with_market_date(day(5));

    job.run(JobAction::Sync).await;
    let first_companies = store.rows::<Company>().await;
    let first_prices = store.rows::<DailyStockPrice>().await;

    let report = job.run(JobAction::Sync).await;

    // BDO is already fresh; AC only reopens Jan 4-5, which the capture lacks.
    assert_eq!(report.extraction_units, 3);
    assert_eq!(report.companies.stats.replaced, 3);
    assert_eq!(report.prices.stats.received, 0);

    let companies = store.rows::<Company>().await;
    assert_eq!(companies.len(), 3);
    for (before, after) in first_companies.iter().zip(&companies) {
        assert_eq!(before.inserted_at, after.inserted_at);
        assert_eq!(before.row, after.row);
    }
    assert_eq!(store.rows::<DailyStockPrice>().await, first_prices);
}

#[tokio::test]
async fn lookback_reapplies_recent_days_in_place() {
    let reports = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryDestination::new());
    let job = SyncJob::new(adapter(), store.clone(), options(reports.path())).with_market_date(day(5));
    job.run(JobAction::Sync).await;

    let reopened = SyncJob::new(
        adapter(),
        store.clone(),
        JobOptions {
            lookback_days: 2,
            ..options(reports.path())
        },
    )
    .with_market_date(day(5));
    let report = reopened.run(JobAction::Sync).await;

    // AC reopens Jan 2-5 (two rows), BDO reopens Jan 3-5 (two rows).
    assert_eq!(report.prices.stats.received, 4);
    assert_eq!(report.prices.stats.replaced, 4);
    assert_eq!(store.rows::<DailyStockPrice>().await.len(), 5);
}

#[tokio::test]
async fn backfill_into_lake_walks_each_window() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LakeDestination::new(dir.path().join("lake").display().to_string()));
    let job = SyncJob::new(adapter(), store.clone(), options(&dir.path().join("reports"))).with_market_date(day(5));

    let init = job.run(JobAction::InitializeSchema).await;
    assert_eq!(init.status, JobStatus::Succeeded);

    let report = job
        .run(JobAction::Backfill(BackfillRequest {
            from: Some(day(1)),
            to: Some(day(4)),
            symbols: Some(vec!["ac".to_string(), "BDO".to_string()]),
            chunk_days: Some(2),
        }))
        .await;

    assert_eq!(report.status, JobStatus::Succeeded);
    assert_eq!(report.extraction_units, 5);
    assert_eq!(report.prices.stats.inserted_new, 5);
    assert_eq!(report.prices.batches, 2);

    assert_eq!(store.rows::<Company>().await.unwrap().len(), 3);
    let prices = store.rows::<DailyStockPrice>().await.unwrap();
    let keys: Vec<(String, NaiveDate)> = prices.iter().map(|p| (p.row.symbol.clone(), p.row.date)).collect();
    assert_eq!(
        keys,
        vec![
            ("AC".to_string(), day(2)),
            ("AC".to_string(), day(3)),
            ("BDO".to_string(), day(2)),
            ("BDO".to_string(), day(3)),
            ("BDO".to_string(), day(4)),
        ]
    );
}

#[tokio::test]
async fn sync_against_a_missing_lake_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LakeDestination::new(dir.path().join("never-created").display().to_string()));
    let job = SyncJob::new(adapter(), store, JobOptions::default()).with_market_date(day(5));

    let report = job.run(JobAction::Sync).await;

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.error.unwrap().code, "BACKEND_UNAVAILABLE");
}
