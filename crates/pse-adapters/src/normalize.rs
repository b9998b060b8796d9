//! Raw scraped records to canonical entities.
//!
//! Every timestamp becomes a UTC `DateTime`, every calendar date a `NaiveDate`.
//! Numeric fields that the source leaves blank stay `None`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use pse_core::{Company, DailyStockPrice};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("MALFORMED_RECORD: field `{field}`: {reason}")]
    MalformedRecord { field: &'static str, reason: String },
}

impl NormalizeError {
    pub fn field(&self) -> &'static str {
        match self {
            NormalizeError::MalformedRecord { field, .. } => field,
        }
    }
}

fn malformed(field: &'static str, reason: impl Into<String>) -> NormalizeError {
    NormalizeError::MalformedRecord {
        field,
        reason: reason.into(),
    }
}

/// One row of the company directory as scraped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCompanyRecord {
    pub symbol: Option<String>,
    pub company_name: Option<String>,
    pub sector: Option<String>,
    pub subsector: Option<String>,
    pub listing_date: Option<String>,
    pub extracted_at: Option<String>,
}

/// One chart point as returned by the upstream JSON endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPriceRecord {
    pub symbol: Option<String>,
    pub chart_date: Option<String>,
    pub open: Option<JsonValue>,
    pub high: Option<JsonValue>,
    pub low: Option<JsonValue>,
    pub close: Option<JsonValue>,
    pub extracted_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejected<R> {
    pub record: R,
    pub error: NormalizeError,
}

const NAIVE_TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%b %d, %Y %H:%M:%S",
];

const DATE_FORMATS: [&str; 5] = ["%Y-%m-%d", "%b %d, %Y", "%B %d, %Y", "%m/%d/%Y", "%m-%d-%Y"];

/// Accepts RFC 3339, RFC 2822 (HTTP `Date` headers) and zone-less forms, which are read as UTC.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(input) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub fn parse_date(input: &str) -> Option<NaiveDate> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(input, fmt).ok())
        .or_else(|| {
            NAIVE_TIMESTAMP_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
                .map(|naive| naive.date())
        })
        .or_else(|| parse_timestamp(input).map(|ts| ts.date_naive()))
}

/// Numbers may arrive as JSON numbers or strings like `"1,234.50"`. Null, blank
/// and `-` mean "no value", never zero.
pub fn parse_number(value: Option<&JsonValue>) -> Result<Option<f64>, String> {
    let parsed = match value {
        None | Some(JsonValue::Null) => return Ok(None),
        Some(JsonValue::Number(n)) => n.as_f64().ok_or_else(|| format!("unrepresentable number {n}"))?,
        Some(JsonValue::String(s)) => {
            let cleaned = s.trim().replace(',', "");
            if cleaned.is_empty() || cleaned == "-" {
                return Ok(None);
            }
            cleaned
                .parse::<f64>()
                .map_err(|_| format!("not a number: {s:?}"))?
        }
        Some(other) => return Err(format!("unexpected value {other}")),
    };
    if parsed.is_finite() {
        Ok(Some(parsed))
    } else {
        Err(format!("non-finite number {parsed}"))
    }
}

fn clean_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn normalize_symbol(value: Option<&str>) -> Result<String, NormalizeError> {
    let symbol = clean_text(value).ok_or_else(|| malformed("symbol", "missing"))?;
    if symbol.chars().any(char::is_whitespace) {
        return Err(malformed("symbol", format!("contains whitespace: {symbol:?}")));
    }
    Ok(symbol.to_ascii_uppercase())
}

fn normalize_extracted_at(value: Option<&str>) -> Result<DateTime<Utc>, NormalizeError> {
    let raw = clean_text(value).ok_or_else(|| malformed("extracted_at", "missing"))?;
    parse_timestamp(&raw).ok_or_else(|| malformed("extracted_at", format!("unparseable timestamp {raw:?}")))
}

pub fn normalize_company(raw: &RawCompanyRecord) -> Result<Company, NormalizeError> {
    let symbol = normalize_symbol(raw.symbol.as_deref())?;
    let listing_date = match clean_text(raw.listing_date.as_deref()) {
        None => None,
        Some(text) => Some(
            parse_date(&text)
                .ok_or_else(|| malformed("listing_date", format!("unparseable date {text:?}")))?,
        ),
    };
    Ok(Company {
        symbol,
        company_name: clean_text(raw.company_name.as_deref()),
        sector: clean_text(raw.sector.as_deref()),
        subsector: clean_text(raw.subsector.as_deref()),
        listing_date,
        extracted_at: normalize_extracted_at(raw.extracted_at.as_deref())?,
    })
}

pub fn normalize_price(raw: &RawPriceRecord) -> Result<DailyStockPrice, NormalizeError> {
    let symbol = normalize_symbol(raw.symbol.as_deref())?;
    let date_text = clean_text(raw.chart_date.as_deref()).ok_or_else(|| malformed("date", "missing"))?;
    let date = parse_date(&date_text)
        .ok_or_else(|| malformed("date", format!("unparseable date {date_text:?}")))?;
    Ok(DailyStockPrice {
        symbol,
        date,
        open: parse_number(raw.open.as_ref()).map_err(|r| malformed("open", r))?,
        high: parse_number(raw.high.as_ref()).map_err(|r| malformed("high", r))?,
        low: parse_number(raw.low.as_ref()).map_err(|r| malformed("low", r))?,
        close: parse_number(raw.close.as_ref()).map_err(|r| malformed("close", r))?,
        extracted_at: normalize_extracted_at(raw.extracted_at.as_deref())?,
    })
}

/// Normalizes a whole extraction. Malformed rows are logged and returned
/// separately; they never abort the rest of the batch.
pub fn normalize_batch<R, T, F>(records: Vec<R>, normalize: F) -> (Vec<T>, Vec<Rejected<R>>)
where
    R: std::fmt::Debug,
    F: Fn(&R) -> Result<T, NormalizeError>,
{
    let mut rows = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();
    for record in records {
        match normalize(&record) {
            Ok(row) => rows.push(row),
            Err(error) => {
                warn!(field = error.field(), %error, ?record, "skipping malformed record");
                rejected.push(Rejected { record, error });
            }
        }
    }
    (rows, rejected)
}
