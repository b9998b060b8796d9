//! Runs only when `PSE_TEST_DATABASE_URL` points at a scratch Postgres database.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use pse_core::{Company, DailyStockPrice};
use pse_sync::destination::{Destination, FailPoint, PostgresDestination, PriceCoverage, SchemaAdmin};
use pse_sync::reconcile;

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 5, hour, 0, 0).single().unwrap()
}

fn price(symbol: &str, d: u32, close: f64, extracted_hour: u32) -> DailyStockPrice {
    DailyStockPrice {
        symbol: symbol.to_string(),
        date: NaiveDate::from_ymd_opt(2024, 1, d).unwrap(),
        open: None,
        high: None,
        low: None,
        close: Some(close),
        extracted_at: at(extracted_hour),
    }
}

async fn scratch_store() -> Option<(PostgresDestination, String)> {
    let Ok(url) = std::env::var("PSE_TEST_DATABASE_URL") else {
        eprintln!("PSE_TEST_DATABASE_URL not set; skipping");
        return None;
    };
    let schema = format!("pse_test_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let store = PostgresDestination::connect(&url, &schema, Some(Duration::from_secs(30)))
        .await
        .expect("connect");
    store.initialize_schema().await.expect("initialize schema");
    Some((store, schema))
}

async fn drop_schema(store: &PostgresDestination, schema: &str) {
    sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{schema}\" CASCADE"))
        .execute(store.pool())
        .await
        .expect("drop scratch schema");
}

#[tokio::test]
async fn replace_skip_and_rollback_against_postgres() {
    let Some((store, schema)) = scratch_store().await else {
        return;
    };

    let plan = reconcile(vec![price("AC", 2, 10.0, 1), price("AC", 3, 11.0, 1)], &store, at(8))
        .await
        .unwrap();
    Destination::<DailyStockPrice>::apply(&store, &plan).await.unwrap();

    let plan = reconcile(vec![price("AC", 2, 10.0, 1)], &store, at(9)).await.unwrap();
    assert_eq!(plan.stats.replaced, 1);
    assert_eq!(plan.inserts[0].inserted_at, at(8));
    Destination::<DailyStockPrice>::apply(&store, &plan).await.unwrap();

    let stale = reconcile(vec![price("AC", 3, 99.0, 0)], &store, at(9)).await.unwrap();
    assert!(stale.is_empty());

    store.fail_points().arm(FailPoint::AfterDelete);
    let plan = reconcile(vec![price("AC", 3, 12.0, 2)], &store, at(10)).await.unwrap();
    let err = Destination::<DailyStockPrice>::apply(&store, &plan).await.unwrap_err();
    assert_eq!(err.code(), "BACKEND_STATEMENT");

    let closes: Vec<(NaiveDate, Option<f64>)> = sqlx::query_as(&format!(
        "SELECT date, close FROM \"{schema}\".daily_stock_price ORDER BY date"
    ))
    .fetch_all(store.pool())
    .await
    .unwrap();
    assert_eq!(closes.len(), 2);
    assert_eq!(closes[1].1, Some(11.0));

    let latest = store.latest_price_dates().await.unwrap();
    assert_eq!(latest.get("AC"), NaiveDate::from_ymd_opt(2024, 1, 3).as_ref());

    let companies = reconcile(
        vec![Company {
            symbol: "AC".to_string(),
            company_name: Some("Ayala Corporation".to_string()),
            sector: Some("Holding Firms".to_string()),
            subsector: Some("Holding Firms".to_string()),
            listing_date: NaiveDate::from_ymd_opt(1976, 11, 8),
            extracted_at: at(1),
        }],
        &store,
        at(8),
    )
    .await
    .unwrap();
    let outcome = Destination::<Company>::apply(&store, &companies).await.unwrap();
    assert_eq!(outcome.inserted, 1);

    drop_schema(&store, &schema).await;
}
