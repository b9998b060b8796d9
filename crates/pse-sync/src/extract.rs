//! Bounded extraction pool. One unit per symbol; a failed unit never stops its siblings.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, Utc};
use pse_adapters::{
    normalize_batch, normalize_company, normalize_price, AdapterContext, AdapterError, FixtureAdapter, PriceRange,
    PseEdgeAdapter, SourceAdapter,
};
use pse_core::{Company, DailyStockPrice};
use pse_storage::{ArtifactStore, HttpClientConfig, HttpFetcher, RateLimit};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};

use crate::config::SyncConfig;

/// PSE trades on Manila time.
const MARKET_UTC_OFFSET_SECS: i32 = 8 * 3600;

pub fn market_today(now: DateTime<Utc>) -> NaiveDate {
    match FixedOffset::east_opt(MARKET_UTC_OFFSET_SECS) {
        Some(offset) => now.with_timezone(&offset).date_naive(),
        None => now.date_naive(),
    }
}

/// The live PSE Edge scraper, or a recorded bundle when `fixture_bundle` is set.
pub fn build_adapter(config: &SyncConfig) -> anyhow::Result<Arc<dyn SourceAdapter>> {
    if let Some(bundle) = &config.fixture_bundle {
        info!(bundle = %bundle.display(), "extracting from recorded fixture bundle");
        let adapter = FixtureAdapter::from_bundle_path(bundle)
            .with_context(|| format!("loading fixture bundle {}", bundle.display()))?;
        return Ok(Arc::new(adapter));
    }
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout(),
        user_agent: Some(config.user_agent.clone()),
        max_in_flight: config.concurrency.max(1),
        rate_limit: config.rate_limit_per_sec.and_then(RateLimit::per_second),
        ..HttpClientConfig::default()
    })?;
    let mut adapter = PseEdgeAdapter::new(Arc::new(fetcher));
    if let Some(dir) = &config.artifacts_dir {
        adapter = adapter.with_archive(ArtifactStore::new(dir.clone()));
    }
    Ok(Arc::new(adapter))
}

/// Incremental window for one symbol, or `None` when stored data is already fresh.
///
/// The window restarts the day after the latest stored date, pulled back by
/// `lookback_days`. Symbols with nothing stored are fetched from the beginning.
pub fn sync_window(
    latest_stored: Option<NaiveDate>,
    today: NaiveDate,
    lookback_days: i64,
    freshness_days: i64,
) -> Option<PriceRange> {
    let Some(latest) = latest_stored else {
        return Some(PriceRange { start: None, end: today });
    };
    let target_end = ChronoDuration::try_days(freshness_days)
        .and_then(|freshness| today.checked_sub_signed(freshness))
        .unwrap_or(if freshness_days > 0 { NaiveDate::MIN } else { NaiveDate::MAX });
    if lookback_days == 0 && latest >= target_end {
        return None;
    }
    let start = 1i64
        .checked_sub(lookback_days)
        .and_then(ChronoDuration::try_days)
        .and_then(|offset| latest.checked_add_signed(offset));
    match start {
        Some(start) if start > today => None,
        Some(start) => Some(PriceRange::new(start, today)),
        // A lookback reaching before the calendar starts means full history.
        None if lookback_days > 0 => Some(PriceRange { start: None, end: today }),
        None => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionFailure {
    pub unit: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct CompanyExtraction {
    pub companies: Vec<Company>,
    pub malformed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PriceExtraction {
    pub prices: Vec<DailyStockPrice>,
    pub malformed: usize,
    pub units: usize,
    pub failures: Vec<ExtractionFailure>,
}

pub async fn extract_companies(
    adapter: &dyn SourceAdapter,
    ctx: &AdapterContext,
) -> Result<CompanyExtraction, AdapterError> {
    let raw = adapter.list_companies(ctx).await?;
    let (companies, rejected) = normalize_batch(raw, normalize_company);
    info!(companies = companies.len(), malformed = rejected.len(), "company directory extracted");
    Ok(CompanyExtraction {
        companies,
        malformed: rejected.len(),
    })
}

/// Pulls price history for every `(symbol, range)` unit, at most `concurrency` at a time.
/// Output rows are ordered by symbol so batches are reproducible.
pub async fn extract_prices(
    adapter: Arc<dyn SourceAdapter>,
    ctx: &AdapterContext,
    units: Vec<(String, PriceRange)>,
    concurrency: usize,
) -> PriceExtraction {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let total = units.len();

    for (symbol, range) in units {
        let adapter = Arc::clone(&adapter);
        let permits = Arc::clone(&permits);
        let ctx = ctx.clone();
        let span = info_span!("extract_prices", run_id = %ctx.run_id, symbol = %symbol);
        tasks.spawn(
            async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => adapter.price_history(&ctx, &symbol, &range).await,
                    Err(_) => Err(AdapterError::Message("extraction pool closed".to_string())),
                };
                (symbol, outcome)
            }
            .instrument(span),
        );
    }

    let mut by_symbol: HashMap<String, Vec<DailyStockPrice>> = HashMap::new();
    let mut extraction = PriceExtraction {
        units: total,
        ..PriceExtraction::default()
    };
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((symbol, Ok(raw))) => {
                let (prices, rejected) = normalize_batch(raw, normalize_price);
                extraction.malformed += rejected.len();
                info!(%symbol, rows = prices.len(), malformed = rejected.len(), "price history extracted");
                by_symbol.insert(symbol, prices);
            }
            Ok((symbol, Err(err))) => {
                warn!(%symbol, error = %err, "price extraction failed");
                extraction.failures.push(ExtractionFailure {
                    unit: symbol,
                    error: err.to_string(),
                });
            }
            Err(join_err) => {
                warn!(error = %join_err, "price extraction task aborted");
                extraction.failures.push(ExtractionFailure {
                    unit: "<task>".to_string(),
                    error: join_err.to_string(),
                });
            }
        }
    }

    let mut symbols: Vec<String> = by_symbol.keys().cloned().collect();
    symbols.sort();
    for symbol in symbols {
        if let Some(prices) = by_symbol.remove(&symbol) {
            extraction.prices.extend(prices);
        }
    }
    extraction.failures.sort_by(|a, b| a.unit.cmp(&b.unit));
    extraction
}
