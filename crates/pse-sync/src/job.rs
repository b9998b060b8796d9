//! Sync, backfill and schema jobs: extraction feeding reconcile-and-apply, one batch at a time.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use pse_adapters::{AdapterContext, PriceRange, SourceAdapter};
use pse_core::{Company, Entity};
use pse_storage::BackoffPolicy;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::destination::{ApplyOutcome, Destination, Store};
use crate::error::SyncError;
use crate::extract::{extract_companies, extract_prices, market_today, sync_window, ExtractionFailure, PriceExtraction};
use crate::reconcile::{reconcile, ReconcileStats};
use crate::report::{EntityReport, JobReport};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub symbols: Option<Vec<String>>,
    /// Extraction window size; the whole range is one window when unset.
    pub chunk_days: Option<u32>,
}

impl BackfillRequest {
    /// Splits `from..=to` into consecutive windows of `chunk_days`.
    pub fn windows(&self, today: NaiveDate) -> Result<Vec<PriceRange>, SyncError> {
        let end = self.to.unwrap_or(today);
        let Some(start) = self.from else {
            return Ok(vec![PriceRange { start: None, end }]);
        };
        if start > end {
            return Err(SyncError::config(format!("backfill range {start}..{end} is empty")));
        }
        let step = match self.chunk_days {
            Some(0) => return Err(SyncError::config("chunk_days must be at least 1")),
            Some(days) => i64::from(days),
            None => return Ok(vec![PriceRange::new(start, end)]),
        };
        let mut windows = Vec::new();
        let mut cursor = start;
        loop {
            // A window reaching past the calendar's end is clipped to `end`.
            let last = ChronoDuration::try_days(step - 1)
                .and_then(|span| cursor.checked_add_signed(span))
                .map_or(end, |last| last.min(end));
            windows.push(PriceRange::new(cursor, last));
            match last.succ_opt() {
                Some(next) if last < end => cursor = next,
                _ => break,
            }
        }
        Ok(windows)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAction {
    Sync,
    Backfill(BackfillRequest),
    InitializeSchema,
}

impl JobAction {
    pub fn name(&self) -> &'static str {
        match self {
            JobAction::Sync => "sync",
            JobAction::Backfill(_) => "backfill",
            JobAction::InitializeSchema => "initialize-schema",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub concurrency: usize,
    pub lookback_days: i64,
    pub freshness_days: i64,
    pub price_batch_size: usize,
    pub company_batch_size: usize,
    pub conflict_retries: usize,
    pub retry_backoff: BackoffPolicy,
    pub symbols: Option<Vec<String>>,
    pub reports_dir: Option<PathBuf>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lookback_days: 0,
            freshness_days: 1,
            price_batch_size: 3000,
            company_batch_size: 100,
            conflict_retries: 3,
            retry_backoff: BackoffPolicy::default(),
            symbols: None,
            reports_dir: None,
        }
    }
}

impl JobOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            lookback_days: config.lookback_days,
            freshness_days: config.freshness_days,
            price_batch_size: config.price_batch_size,
            company_batch_size: config.company_batch_size,
            conflict_retries: config.conflict_retries,
            retry_backoff: BackoffPolicy::default(),
            symbols: config.symbols.clone(),
            reports_dir: Some(config.reports_dir.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub stats: ReconcileStats,
    pub outcome: ApplyOutcome,
    pub retries: usize,
}

/// Reconciles and applies one batch. A `WRITE_CONFLICT` discards the plan and
/// starts over from a fresh lookup, up to `max_retries` times.
pub async fn sync_batch<T, D>(
    batch: &[T],
    destination: &D,
    reconciled_at: DateTime<Utc>,
    max_retries: usize,
    backoff: &BackoffPolicy,
) -> Result<BatchResult, SyncError>
where
    T: Entity,
    D: Destination<T> + ?Sized,
{
    let mut attempt = 0usize;
    loop {
        let plan = reconcile(batch.to_vec(), destination, reconciled_at).await?;
        match destination.apply(&plan).await {
            Ok(outcome) => {
                return Ok(BatchResult {
                    stats: plan.stats,
                    outcome,
                    retries: attempt,
                })
            }
            Err(err) if err.is_retryable() && attempt < max_retries => {
                let delay = backoff.delay_for_attempt(attempt);
                attempt += 1;
                warn!(table = T::TABLE, attempt, ?delay, error = %err, "write conflict; re-planning batch");
                tokio::time::sleep(delay).await;
            }
            Err(err) if err.is_retryable() => {
                return Err(SyncError::RetriesExhausted {
                    table: T::TABLE.to_string(),
                    attempts: attempt + 1,
                    last: Box::new(err),
                })
            }
            Err(err) => return Err(err),
        }
    }
}

pub struct SyncJob {
    adapter: Arc<dyn SourceAdapter>,
    store: Arc<dyn Store>,
    options: JobOptions,
    market_date: Option<NaiveDate>,
}

impl SyncJob {
    pub fn new(adapter: Arc<dyn SourceAdapter>, store: Arc<dyn Store>, options: JobOptions) -> Self {
        Self {
            adapter,
            store,
            options,
            market_date: None,
        }
    }

    /// Pins "today" instead of reading the clock.
    pub fn with_market_date(mut self, date: NaiveDate) -> Self {
        self.market_date = Some(date);
        self
    }

    fn today(&self) -> NaiveDate {
        self.market_date.unwrap_or_else(|| market_today(Utc::now()))
    }

    /// Runs `action` to completion and returns its report. The report is also
    /// written under `reports_dir` when one is configured.
    pub async fn run(&self, action: JobAction) -> JobReport {
        let run_id = Uuid::new_v4();
        let backend = self.store.backend();
        let mut report = JobReport::new(run_id, action.name(), backend.as_str(), Utc::now());
        let span = info_span!("sync_job", %run_id, action = action.name(), backend = backend.as_str());

        let result = async {
            info!("job started");
            let ctx = AdapterContext::new(run_id);
            match &action {
                JobAction::InitializeSchema => self.store.initialize_schema().await,
                JobAction::Sync => self.run_sync(&ctx, &mut report).await,
                JobAction::Backfill(request) => self.run_backfill(&ctx, request, &mut report).await,
            }
        }
        .instrument(span)
        .await;

        report.finish(result, Utc::now());
        info!(%run_id, status = ?report.status, "job finished");
        if let Some(dir) = &self.options.reports_dir {
            match report.write(dir).await {
                Ok(path) => info!(path = %path.display(), "job report written"),
                Err(err) => warn!(error = %err, "job report not written"),
            }
        }
        report
    }

    fn in_universe(&self, symbol: &str) -> bool {
        self.options
            .symbols
            .as_ref()
            .map_or(true, |symbols| symbols.iter().any(|s| s == symbol))
    }

    /// Extracts and applies the company directory; returns the symbols to price.
    async fn sync_companies(&self, ctx: &AdapterContext, report: &mut JobReport) -> Result<Vec<String>, SyncError> {
        report.extraction_units += 1;
        let extraction = match extract_companies(self.adapter.as_ref(), ctx).await {
            Ok(extraction) => extraction,
            Err(err) => {
                warn!(error = %err, "company directory extraction failed");
                report.extraction_failures.push(ExtractionFailure {
                    unit: "company-directory".to_string(),
                    error: err.to_string(),
                });
                return Ok(Vec::new());
            }
        };
        report.companies.malformed += extraction.malformed;

        let companies: Vec<Company> = extraction
            .companies
            .into_iter()
            .filter(|c| self.in_universe(&c.symbol))
            .collect();
        apply_in_batches(
            &companies,
            Arc::clone(&self.store),
            self.options.company_batch_size,
            &self.options,
            &mut report.companies,
        )
        .await?;

        let mut symbols: Vec<String> = companies.into_iter().map(|c| c.symbol).collect();
        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }

    async fn apply_prices(&self, extraction: PriceExtraction, report: &mut JobReport) -> Result<(), SyncError> {
        report.extraction_units += extraction.units;
        report.extraction_failures.extend(extraction.failures);
        report.prices.malformed += extraction.malformed;
        apply_in_batches(
            &extraction.prices,
            Arc::clone(&self.store),
            self.options.price_batch_size,
            &self.options,
            &mut report.prices,
        )
        .await
    }

    async fn run_sync(&self, ctx: &AdapterContext, report: &mut JobReport) -> Result<(), SyncError> {
        let symbols = self.sync_companies(ctx, report).await?;
        let latest = self.store.latest_price_dates().await?;
        let today = self.today();

        let mut units = Vec::new();
        for symbol in symbols {
            match sync_window(
                latest.get(&symbol).copied(),
                today,
                self.options.lookback_days,
                self.options.freshness_days,
            ) {
                Some(range) => units.push((symbol, range)),
                None => info!(%symbol, "price data already fresh"),
            }
        }
        info!(units = units.len(), "extracting price history");
        let extraction = extract_prices(Arc::clone(&self.adapter), ctx, units, self.options.concurrency).await;
        self.apply_prices(extraction, report).await
    }

    async fn run_backfill(
        &self,
        ctx: &AdapterContext,
        request: &BackfillRequest,
        report: &mut JobReport,
    ) -> Result<(), SyncError> {
        let windows = request.windows(self.today())?;
        let mut symbols = self.sync_companies(ctx, report).await?;
        if let Some(requested) = &request.symbols {
            let requested: Vec<String> = requested.iter().map(|s| s.trim().to_ascii_uppercase()).collect();
            symbols = requested;
        }

        for window in windows {
            info!(start = ?window.start, end = %window.end, symbols = symbols.len(), "backfilling window");
            let units = symbols.iter().map(|s| (s.clone(), window)).collect();
            let extraction = extract_prices(Arc::clone(&self.adapter), ctx, units, self.options.concurrency).await;
            self.apply_prices(extraction, report).await?;
        }
        Ok(())
    }
}

async fn apply_in_batches<T>(
    rows: &[T],
    store: Arc<dyn Store>,
    batch_size: usize,
    options: &JobOptions,
    report: &mut EntityReport,
) -> Result<(), SyncError>
where
    T: Entity,
    dyn Store: Destination<T>,
{
    for batch in rows.chunks(batch_size.max(1)) {
        let span = info_span!("apply_batch", table = T::TABLE, rows = batch.len());
        let result = sync_batch(
            batch,
            store.as_ref(),
            Utc::now(),
            options.conflict_retries,
            &options.retry_backoff,
        )
        .instrument(span)
        .await?;
        report.record_batch(&result.stats, &result.outcome, result.retries);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[test]
    fn backfill_windows_cover_the_range_without_gaps() {
        let request = BackfillRequest {
            from: Some(day(1)),
            to: Some(day(10)),
            symbols: None,
            chunk_days: Some(4),
        };
        let windows = request.windows(day(20)).unwrap();
        assert_eq!(
            windows,
            vec![
                PriceRange::new(day(1), day(4)),
                PriceRange::new(day(5), day(8)),
                PriceRange::new(day(9), day(10)),
            ]
        );
    }

    #[test]
    fn oversized_chunks_collapse_to_one_window() {
        let request = BackfillRequest {
            from: Some(day(1)),
            to: Some(day(1)),
            symbols: None,
            chunk_days: Some(u32::MAX),
        };
        assert_eq!(request.windows(day(20)).unwrap(), vec![PriceRange::new(day(1), day(1))]);

        let request = BackfillRequest {
            to: Some(day(10)),
            ..request
        };
        assert_eq!(request.windows(day(20)).unwrap(), vec![PriceRange::new(day(1), day(10))]);
    }

    #[test]
    fn windows_stop_at_the_last_representable_day() {
        let last = NaiveDate::MAX;
        let first = last.pred_opt().and_then(|d| d.pred_opt()).unwrap();
        let request = BackfillRequest {
            from: Some(first),
            to: Some(last),
            symbols: None,
            chunk_days: Some(2),
        };
        let windows = request.windows(day(20)).unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1], PriceRange::new(last, last));
    }

    #[test]
    fn open_backfill_is_one_unbounded_window() {
        let windows = BackfillRequest::default().windows(day(20)).unwrap();
        assert_eq!(windows, vec![PriceRange { start: None, end: day(20) }]);
    }

    #[test]
    fn inverted_ranges_are_rejected() {
        let request = BackfillRequest {
            from: Some(day(10)),
            to: Some(day(1)),
            ..BackfillRequest::default()
        };
        assert_eq!(request.windows(day(20)).unwrap_err().code(), "CONFIG");
    }
}
