//! Source adapter contract, the live PSE Edge scraper and a fixture-backed replay adapter.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use pse_storage::{ArtifactStore, FetchError, FetchRequest, FetchedResponse, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod normalize;

pub use normalize::{
    normalize_batch, normalize_company, normalize_price, NormalizeError, RawCompanyRecord,
    RawPriceRecord, Rejected,
};

pub const PSE_EDGE_SOURCE_ID: &str = "pse-edge";
pub const PSE_EDGE_BASE_URL: &str = "https://edge.pse.com.ph";

const DIRECTORY_PATH: &str = "/companyDirectory/search.ax";
const AUTOCOMPLETE_PATH: &str = "/autoComplete/searchCompanyNameSymbol.ax";
const CHART_PATH: &str = "/common/DisclosureCht.ax";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
        }
    }
}

/// Inclusive date window. A missing start means "from the listing date".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRange {
    pub start: Option<NaiveDate>,
    pub end: NaiveDate,
}

impl PriceRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |start| date >= start) && date <= self.end
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
    #[error("could not parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

fn parse_error(what: &'static str, reason: impl ToString) -> AdapterError {
    AdapterError::Parse {
        what,
        reason: reason.to_string(),
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn list_companies(&self, ctx: &AdapterContext) -> Result<Vec<RawCompanyRecord>, AdapterError>;

    async fn price_history(
        &self,
        ctx: &AdapterContext,
        symbol: &str,
        range: &PriceRange,
    ) -> Result<Vec<RawPriceRecord>, AdapterError>;
}

/// Identifiers PSE Edge needs before it will serve a price chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanySecurity {
    pub company_id: String,
    pub security_id: String,
    pub company_name: Option<String>,
    pub sector: Option<String>,
    pub subsector: Option<String>,
    pub listing_date: Option<String>,
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

/// Highest numbered pager link; a single page when no pager is rendered.
pub fn parse_page_count(html: &str) -> Result<u32, AdapterError> {
    let document = Html::parse_document(html);
    let pager = selector(r##"a[href="#"]"##)?;
    Ok(document
        .select(&pager)
        .filter_map(element_text)
        .filter_map(|text| text.parse::<u32>().ok())
        .max()
        .unwrap_or(1)
        .max(1))
}

/// Rows of one company directory page. Columns are located by header text.
pub fn parse_company_directory(html: &str, extracted_at: &str) -> Result<Vec<RawCompanyRecord>, AdapterError> {
    let document = Html::parse_document(html);
    let header_sel = selector("table thead th")?;
    let row_sel = selector("table tbody tr")?;
    let cell_sel = selector("td")?;

    let headers: Vec<String> = document
        .select(&header_sel)
        .map(|th| element_text(th).unwrap_or_default())
        .collect();
    let position = |name: &str| {
        headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .ok_or_else(|| parse_error("company directory", format!("missing column {name:?}")))
    };
    let name_idx = position("Company Name")?;
    let symbol_idx = position("Stock Symbol")?;
    let sector_idx = position("Sector")?;
    let subsector_idx = position("Subsector")?;
    let listing_idx = position("Listing Date")?;

    let mut records = Vec::new();
    for row in document.select(&row_sel) {
        let cells: Vec<Option<String>> = row.select(&cell_sel).map(element_text).collect();
        if cells.len() < headers.len() {
            continue;
        }
        records.push(RawCompanyRecord {
            symbol: cells[symbol_idx].clone(),
            company_name: cells[name_idx].clone(),
            sector: cells[sector_idx].clone(),
            subsector: cells[subsector_idx].clone(),
            listing_date: cells[listing_idx].clone(),
            extracted_at: Some(extracted_at.to_string()),
        });
    }
    Ok(records)
}

#[derive(Debug, Deserialize)]
struct AutocompleteEntry {
    symbol: Option<String>,
    #[serde(rename = "cmpyNm")]
    company_name: Option<String>,
    #[serde(rename = "cmpyId")]
    company_id: Option<JsonValue>,
}

/// Returns `(company_id, company_name)` for an exact symbol match.
pub fn parse_autocomplete(body: &[u8], symbol: &str) -> Result<Option<(String, Option<String>)>, AdapterError> {
    let entries: Vec<AutocompleteEntry> =
        serde_json::from_slice(body).map_err(|e| parse_error("company autocomplete", e))?;
    Ok(entries.into_iter().find_map(|entry| {
        if entry.symbol.as_deref().map(str::trim) != Some(symbol) {
            return None;
        }
        let company_id = match entry.company_id? {
            JsonValue::String(s) => s,
            other => other.to_string(),
        };
        Some((company_id, entry.company_name))
    }))
}

/// `cmDetail('29','117');return false;` yields `("29", "117")`.
fn parse_cm_detail(onclick: &str) -> Option<(String, String)> {
    let open = onclick.find('(')?;
    let close = onclick[open..].find(')')? + open;
    let mut args = onclick[open + 1..close]
        .split(',')
        .map(|arg| arg.trim().trim_matches('\'').trim_matches('"').to_string());
    let company_id = args.next().filter(|s| !s.is_empty())?;
    let security_id = args.next().filter(|s| !s.is_empty())?;
    Some((company_id, security_id))
}

/// Reads the single-company directory search result.
pub fn parse_company_detail(html: &str, company_id: &str) -> Result<CompanySecurity, AdapterError> {
    let document = Html::parse_document(html);
    let cell_sel = selector("td")?;
    let link_sel = selector("a[onclick]")?;

    let cells: Vec<ElementRef<'_>> = document.select(&cell_sel).collect();
    let first = cells
        .first()
        .ok_or_else(|| parse_error("company detail", "no result rows"))?;
    let onclick = first
        .select(&link_sel)
        .next()
        .and_then(|a| a.value().attr("onclick"))
        .ok_or_else(|| parse_error("company detail", "no cmDetail link"))?;
    let (_, security_id) =
        parse_cm_detail(onclick).ok_or_else(|| parse_error("company detail", format!("bad onclick {onclick:?}")))?;
    let text_at = |idx: usize| cells.get(idx).copied().and_then(element_text);

    Ok(CompanySecurity {
        company_id: company_id.to_string(),
        security_id,
        company_name: text_at(0),
        sector: text_at(2),
        subsector: text_at(3),
        listing_date: text_at(4),
    })
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    #[serde(rename = "chartData", default)]
    chart_data: Option<Vec<ChartPoint>>,
}

#[derive(Debug, Deserialize)]
struct ChartPoint {
    #[serde(rename = "CHART_DATE")]
    chart_date: Option<String>,
    #[serde(rename = "OPEN")]
    open: Option<JsonValue>,
    #[serde(rename = "HIGH")]
    high: Option<JsonValue>,
    #[serde(rename = "LOW")]
    low: Option<JsonValue>,
    #[serde(rename = "CLOSE")]
    close: Option<JsonValue>,
}

pub fn parse_chart_data(body: &[u8], symbol: &str, extracted_at: &str) -> Result<Vec<RawPriceRecord>, AdapterError> {
    let response: ChartResponse = serde_json::from_slice(body).map_err(|e| parse_error("price chart", e))?;
    Ok(response
        .chart_data
        .unwrap_or_default()
        .into_iter()
        .map(|point| RawPriceRecord {
            symbol: Some(symbol.to_string()),
            chart_date: point.chart_date,
            open: point.open,
            high: point.high,
            low: point.low,
            close: point.close,
            extracted_at: Some(extracted_at.to_string()),
        })
        .collect())
}

fn directory_form(page_no: u32, company_id: &str, sort_type: &str) -> Vec<(String, String)> {
    let page = if page_no == 0 {
        String::new()
    } else {
        page_no.to_string()
    };
    [
        ("pageNo", page.as_str()),
        ("companyId", company_id),
        ("keyword", company_id),
        ("sortType", sort_type),
        ("dateSortType", "DESC"),
        ("cmpySortType", "DESC"),
        ("symbolSortType", "ASC"),
        ("sector", "ALL"),
        ("subsector", "ALL"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Live scraper for the exchange's disclosure site.
#[derive(Debug, Clone)]
pub struct PseEdgeAdapter {
    http: Arc<HttpFetcher>,
    archive: Option<ArtifactStore>,
    base_url: String,
}

impl PseEdgeAdapter {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            http,
            archive: None,
            base_url: PSE_EDGE_BASE_URL.to_string(),
        }
    }

    pub fn with_archive(mut self, archive: ArtifactStore) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn autocomplete_url(&self, symbol: &str) -> Result<String, AdapterError> {
        reqwest::Url::parse_with_params(&self.url(AUTOCOMPLETE_PATH), &[("term", symbol)])
            .map(String::from)
            .map_err(|err| AdapterError::Message(format!("autocomplete url for {symbol:?}: {err}")))
    }

    fn xhr(&self, request: FetchRequest, referer: String) -> FetchRequest {
        request
            .header("Accept", "application/json, text/javascript, */*; q=0.01")
            .header("Origin", self.base_url.clone())
            .header("Referer", referer)
            .header("X-Requested-With", "XMLHttpRequest")
    }

    async fn fetch(
        &self,
        ctx: &AdapterContext,
        request: FetchRequest,
        extension: &str,
    ) -> Result<FetchedResponse, AdapterError> {
        let response = self.http.fetch(ctx.run_id, PSE_EDGE_SOURCE_ID, &request).await?;
        if let Some(archive) = &self.archive {
            if let Err(err) = archive
                .archive(ctx.started_at, PSE_EDGE_SOURCE_ID, extension, &response.body)
                .await
            {
                warn!(error = %err, url = %response.final_url, "failed to archive raw payload");
            }
        }
        Ok(response)
    }

    async fn directory_page(
        &self,
        ctx: &AdapterContext,
        form: Vec<(String, String)>,
    ) -> Result<(String, String), AdapterError> {
        let request = self.xhr(
            FetchRequest::post_form(self.url(DIRECTORY_PATH), form),
            self.url("/companyDirectory/form.do"),
        );
        let response = self.fetch(ctx, request, "html").await?;
        let served_at = served_at(&response);
        let html = String::from_utf8_lossy(&response.body).into_owned();
        Ok((html, served_at))
    }

    pub async fn company_security(
        &self,
        ctx: &AdapterContext,
        symbol: &str,
    ) -> Result<CompanySecurity, AdapterError> {
        let request = FetchRequest::get(self.autocomplete_url(symbol)?);
        let response = self.fetch(ctx, request, "json").await?;
        let (company_id, company_name) = parse_autocomplete(&response.body, symbol)?
            .ok_or_else(|| AdapterError::UnknownSymbol(symbol.to_string()))?;

        let (html, _) = self
            .directory_page(ctx, directory_form(0, &company_id, "cmpy"))
            .await?;
        let mut security = parse_company_detail(&html, &company_id)?;
        if company_name.is_some() {
            security.company_name = company_name;
        }
        Ok(security)
    }
}

/// The upstream `Date` header; falls back to the local clock when absent.
fn served_at(response: &FetchedResponse) -> String {
    response.date_header.clone().unwrap_or_else(|| {
        debug!(url = %response.final_url, "response has no Date header");
        Utc::now().to_rfc3339()
    })
}

#[async_trait]
impl SourceAdapter for PseEdgeAdapter {
    fn source_id(&self) -> &'static str {
        PSE_EDGE_SOURCE_ID
    }

    async fn list_companies(&self, ctx: &AdapterContext) -> Result<Vec<RawCompanyRecord>, AdapterError> {
        let (first_html, served) = self.directory_page(ctx, directory_form(1, "", "")).await?;
        let page_count = parse_page_count(&first_html)?;
        let mut records = parse_company_directory(&first_html, &served)?;

        for page_no in 2..=page_count {
            let (html, served) = self.directory_page(ctx, directory_form(page_no, "", "")).await?;
            records.extend(parse_company_directory(&html, &served)?);
        }
        info!(pages = page_count, companies = records.len(), "company directory extracted");
        Ok(records)
    }

    async fn price_history(
        &self,
        ctx: &AdapterContext,
        symbol: &str,
        range: &PriceRange,
    ) -> Result<Vec<RawPriceRecord>, AdapterError> {
        let security = self.company_security(ctx, symbol).await?;
        let start = match range.start {
            Some(start) => start,
            None => security
                .listing_date
                .as_deref()
                .and_then(normalize::parse_date)
                .ok_or_else(|| parse_error("listing date", format!("{symbol} has no usable listing date")))?,
        };
        let body = serde_json::json!({
            "cmpy_id": security.company_id,
            "security_id": security.security_id,
            "startDate": start.format("%m-%d-%Y").to_string(),
            "endDate": range.end.format("%m-%d-%Y").to_string(),
        });
        let request = self
            .xhr(
                FetchRequest::post_json(self.url(CHART_PATH), body),
                format!(
                    "{}?cmpy_id={}",
                    self.url("/companyPage/stockData.do"),
                    security.company_id
                ),
            )
            .header("Content-Type", "application/json");
        let response = self.fetch(ctx, request, "json").await?;
        let records = parse_chart_data(&response.body, symbol, &served_at(&response))?;
        debug!(symbol, %start, end = %range.end, rows = records.len(), "price chart extracted");
        Ok(records)
    }
}

/// On-disk capture of upstream responses, replayed by [`FixtureAdapter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source_id: String,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    /// `Date` header value the captured responses carried.
    pub served_at: String,
    pub company_pages: Vec<String>,
    pub price_charts: BTreeMap<String, String>,
    pub notes: Option<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Replays captured directory pages and chart payloads through the live parsers.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    served_at: String,
    company_pages: Vec<String>,
    price_charts: BTreeMap<String, Vec<u8>>,
}

impl FixtureAdapter {
    pub fn new(
        served_at: impl Into<String>,
        company_pages: Vec<String>,
        price_charts: BTreeMap<String, Vec<u8>>,
    ) -> Self {
        Self {
            served_at: served_at.into(),
            company_pages,
            price_charts,
        }
    }

    /// Loads a bundle and every file it references, relative to the bundle.
    pub fn from_bundle_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bundle = load_fixture_bundle(path)?;
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));

        let company_pages = bundle
            .company_pages
            .iter()
            .map(|rel| {
                let page = dir.join(rel);
                fs::read_to_string(&page).with_context(|| format!("reading fixture page {}", page.display()))
            })
            .collect::<Result<Vec<_>>>()?;
        let price_charts = bundle
            .price_charts
            .iter()
            .map(|(symbol, rel)| {
                let chart = dir.join(rel);
                fs::read(&chart)
                    .with_context(|| format!("reading fixture chart {}", chart.display()))
                    .map(|bytes| (symbol.to_ascii_uppercase(), bytes))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Self::new(bundle.served_at, company_pages, price_charts))
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_id(&self) -> &'static str {
        PSE_EDGE_SOURCE_ID
    }

    async fn list_companies(&self, _ctx: &AdapterContext) -> Result<Vec<RawCompanyRecord>, AdapterError> {
        let mut records = Vec::new();
        for page in &self.company_pages {
            records.extend(parse_company_directory(page, &self.served_at)?);
        }
        Ok(records)
    }

    async fn price_history(
        &self,
        _ctx: &AdapterContext,
        symbol: &str,
        range: &PriceRange,
    ) -> Result<Vec<RawPriceRecord>, AdapterError> {
        let body = self
            .price_charts
            .get(&symbol.to_ascii_uppercase())
            .ok_or_else(|| AdapterError::UnknownSymbol(symbol.to_string()))?;
        let records = parse_chart_data(body, symbol, &self.served_at)?;
        // Unparseable dates pass through so the normalizer can reject them.
        Ok(records
            .into_iter()
            .filter(|record| {
                record
                    .chart_date
                    .as_deref()
                    .and_then(normalize::parse_date)
                    .map_or(true, |date| range.contains(date))
            })
            .collect())
    }
}
