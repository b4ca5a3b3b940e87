//! Snapshot source contracts + the pump.fun, four.meme and CNN Fear & Greed adapters.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use snapwatch_core::{EntitySchema, Record};
use snapwatch_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "snapwatch-adapters";

const PUMP_FUN_ORIGIN: &str = "https://pump.fun";
const PUMP_FUN_FALLBACK_LIMIT: usize = 20;
const UNKNOWN: &str = "unknown";
const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    PumpFun,
    FourMeme,
    FearGreed,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::PumpFun => "pump_fun",
            SourceKind::FourMeme => "four_meme",
            SourceKind::FearGreed => "fear_greed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageFormat {
    Html,
    Json,
}

impl PageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            PageFormat::Html => "html",
            PageFormat::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Per-scan identifiers handed to adapters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl ScanContext {
    pub fn new(fetched_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding json page: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn kind(&self) -> SourceKind;
    fn schema(&self) -> &EntitySchema;
    fn page_format(&self) -> PageFormat;

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &ScanContext,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedPage, AdapterError> {
        let response = http.fetch_bytes(source_id, url).await?;
        debug!(run_id = %ctx.run_id, source_id, final_url = %response.final_url, "page fetched");
        Ok(FetchedPage {
            url: response.final_url,
            content_type: response
                .content_type
                .unwrap_or_else(|| default_content_type(self.page_format()).to_string()),
            body: response.body,
            fetched_at: ctx.fetched_at,
        })
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<Record>, AdapterError>;
}

fn default_content_type(format: PageFormat) -> &'static str {
    match format {
        PageFormat::Html => "text/html",
        PageFormat::Json => "application/json",
    }
}

/// Reads a previously saved page so it can be parsed without touching the network.
pub async fn load_page_file(
    path: impl AsRef<Path>,
    format: PageFormat,
    fetched_at: DateTime<Utc>,
) -> Result<FetchedPage> {
    let path = path.as_ref();
    let body = fs::read(path)
        .await
        .with_context(|| format!("reading saved page {}", path.display()))?;
    Ok(FetchedPage {
        url: format!("file://{}", path.display()),
        content_type: default_content_type(format).to_string(),
        body,
        fetched_at,
    })
}

pub fn pump_fun_schema() -> EntitySchema {
    EntitySchema::new(
        "pump_fun_coin",
        "ca_address",
        ["name", "title", "market_value", "reply_count", "link", "ca_address"],
    )
    .with_label_field("name")
}

pub fn four_meme_schema() -> EntitySchema {
    EntitySchema::new(
        "four_meme_coin",
        "contract_address",
        ["name", "contract_address", "market_cap", "icon_url", "trading_volume_24h"],
    )
    .with_label_field("name")
}

pub fn fear_greed_schema() -> EntitySchema {
    EntitySchema::new(
        "fear_greed_reading",
        "date",
        ["date", "value", "rating", "last_update"],
    )
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("bad selector {css:?}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<Vec<_>>().join(" "))
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope.select(sel).next().and_then(element_text)
}

fn first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

/// Last path segment of a link, without query string or fragment.
fn last_path_segment(href: &str) -> String {
    let path = href.split(['?', '#']).next().unwrap_or_default();
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

fn absolute_pump_link(href: &str) -> String {
    if href.starts_with('/') {
        format!("{PUMP_FUN_ORIGIN}{href}")
    } else {
        href.to_string()
    }
}

/// Amount following the first `$` after `marker`, e.g. `1.25M` in "market cap: $1.25M".
fn amount_after(text: &str, marker: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    let start = lower.find(marker)? + marker.len();
    let rest = &text[start..];
    let rest = &rest[rest.find('$')? + 1..];
    let rest = rest.trim_start();

    let number: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if !number.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let unit: String = rest[number.len()..]
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    Some(format!("{number}{unit}"))
}

/// Digits following `marker`, e.g. `342` in "replies: 342".
fn count_after(text: &str, marker: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    let start = lower.find(marker)? + marker.len();
    let digits: String = text[start..]
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Splits "Name (SYM)" into its parts.
fn split_name_symbol(text: &str) -> (String, String) {
    if let (Some(open), true) = (text.find('('), text.ends_with(')')) {
        let name = text[..open].trim();
        let symbol = text[open + 1..text.len() - 1].trim();
        if !name.is_empty() && !symbol.is_empty() {
            return (name.to_string(), symbol.to_string());
        }
    }
    (text.trim().to_string(), String::new())
}

#[derive(Debug, Clone)]
pub struct PumpFunBoardAdapter {
    schema: EntitySchema,
}

impl Default for PumpFunBoardAdapter {
    fn default() -> Self {
        Self {
            schema: pump_fun_schema(),
        }
    }
}

impl PumpFunBoardAdapter {
    fn card_record(
        link: ElementRef<'_>,
        title_sel: &Selector,
        symbol_sel: &Selector,
    ) -> Option<Record> {
        let href = link.value().attr("href")?;
        let coin_link = absolute_pump_link(href);
        let title = first_text(link, title_sel).unwrap_or_default();
        let symbol = first_text(link, symbol_sel).unwrap_or_default();
        let full_text = element_text(link).unwrap_or_default();
        let name = [&symbol, &title, &full_text]
            .into_iter()
            .find(|s| !s.is_empty())
            .cloned()
            .unwrap_or_default();

        Some(
            Record::new()
                .with("name", name)
                .with("title", title)
                .with(
                    "market_value",
                    amount_after(&full_text, "market cap:").unwrap_or_else(|| NOT_AVAILABLE.into()),
                )
                .with(
                    "reply_count",
                    count_after(&full_text, "replies:").unwrap_or_else(|| NOT_AVAILABLE.into()),
                )
                .with("ca_address", last_path_segment(&coin_link))
                .with("link", coin_link),
        )
    }

    fn fallback_record(link: ElementRef<'_>) -> Option<Record> {
        let coin_link = absolute_pump_link(link.value().attr("href")?);
        let (name, symbol) = split_name_symbol(&element_text(link).unwrap_or_default());
        Some(
            Record::new()
                .with("name", name)
                .with("symbol", symbol)
                .with("market_value", NOT_AVAILABLE)
                .with("reply_count", NOT_AVAILABLE)
                .with("ca_address", last_path_segment(&coin_link))
                .with("link", coin_link),
        )
    }
}

#[async_trait]
impl SnapshotSource for PumpFunBoardAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::PumpFun
    }

    fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    fn page_format(&self) -> PageFormat {
        PageFormat::Html
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<Record>, AdapterError> {
        let document = Html::parse_document(&page.text());
        let carousel_sel = selector(r#"section[data-sentry-component="CoinCarousel"]"#)?;
        let card_sel = selector("a.carousel-card")?;
        let coin_link_sel = selector(r#"a[href*="/coin/"]"#)?;
        let title_sel = selector(r#"div[class*="line-clamp-2"]"#)?;
        let symbol_sel = selector(r#"span[class*="text-[14px]"]"#)?;

        if let Some(carousel) = document.select(&carousel_sel).next() {
            let mut links: Vec<_> = carousel.select(&card_sel).collect();
            if links.is_empty() {
                links = carousel.select(&coin_link_sel).collect();
            }
            let records: Vec<_> = links
                .into_iter()
                .filter_map(|link| Self::card_record(link, &title_sel, &symbol_sel))
                .collect();
            if !records.is_empty() {
                info!(coins = records.len(), "extracted coins from carousel");
                return Ok(records);
            }
            debug!("carousel present but no coin cards found");
        } else {
            debug!("no CoinCarousel section on page");
        }

        let records: Vec<_> = document
            .root_element()
            .select(&coin_link_sel)
            .take(PUMP_FUN_FALLBACK_LIMIT)
            .filter_map(Self::fallback_record)
            .collect();
        info!(coins = records.len(), "extracted coins from plain coin links");
        Ok(records)
    }
}

#[derive(Debug, Clone)]
pub struct FourMemeRankingAdapter {
    schema: EntitySchema,
    table_title: String,
}

impl Default for FourMemeRankingAdapter {
    fn default() -> Self {
        Self {
            schema: four_meme_schema(),
            table_title: "Trading Volume".to_string(),
        }
    }
}

impl FourMemeRankingAdapter {
    fn row_record(
        &self,
        row: ElementRef<'_>,
        list_sel: &Selector,
        cell_sel: &Selector,
        name_sel: &Selector,
        img_sel: &Selector,
        token_sel: &Selector,
    ) -> Option<Record> {
        let list = row.select(list_sel).next()?;
        let cols: Vec<_> = list.select(cell_sel).collect();
        if cols.len() < 2 {
            return None;
        }

        let contract_address = row
            .value()
            .attr("href")
            .map(last_path_segment)
            .unwrap_or_default();
        let mut record = Record::new()
            .with(
                "name",
                first_text(cols[1], name_sel).unwrap_or_else(|| UNKNOWN.into()),
            )
            .with(
                "market_cap",
                cols.get(2)
                    .and_then(|c| element_text(*c))
                    .unwrap_or_else(|| UNKNOWN.into()),
            )
            .with("icon_url", first_attr(cols[1], img_sel, "src").unwrap_or_default())
            .with("contract_address", contract_address);

        if let Some(volume) = cols.get(4).and_then(|c| element_text(*c)) {
            record.set("trading_volume_24h", volume);
        }
        if let Some(token_col) = cols.get(3) {
            if let Some(token) = first_text(*token_col, token_sel) {
                record.set("raised_token", token);
                if let Some(icon) = first_attr(*token_col, img_sel, "src") {
                    record.set("raised_token_icon", icon);
                }
            }
        }
        Some(record)
    }
}

#[async_trait]
impl SnapshotSource for FourMemeRankingAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::FourMeme
    }

    fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    fn page_format(&self) -> PageFormat {
        PageFormat::Html
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<Record>, AdapterError> {
        let document = Html::parse_document(&page.text());
        // Titles and table containers come back in document order; each table belongs
        // to the closest title before it.
        let marker_sel =
            selector(r#"h2[class*="t-600-16-primary"], div[class*="gradient-primary"]"#)?;
        let row_sel = selector(r#"a[class*="hover:opacity-80"]"#)?;
        let list_sel = selector("ul")?;
        let cell_sel = selector("li")?;
        let name_sel = selector("div.truncate")?;
        let img_sel = selector("img")?;
        let token_sel = selector(r#"span[class*="t-600-12-white"]"#)?;

        let mut pending_title: Option<String> = None;
        let mut container = None;
        for marker in document.select(&marker_sel) {
            if marker.value().name() == "h2" {
                pending_title = element_text(marker);
                continue;
            }
            let Some(title) = pending_title.take() else {
                continue;
            };
            debug!(table = %title, "found ranking table");
            if title.contains(&self.table_title) {
                container = Some(marker);
                break;
            }
        }

        let Some(container) = container else {
            info!(table = %self.table_title, "ranking table not found on page");
            return Ok(Vec::new());
        };

        let records: Vec<_> = container
            .select(&row_sel)
            .filter_map(|row| {
                let record =
                    self.row_record(row, &list_sel, &cell_sel, &name_sel, &img_sel, &token_sel);
                if record.is_none() {
                    debug!("skipping ranking row without coin columns");
                }
                record
            })
            .collect();
        info!(coins = records.len(), table = %self.table_title, "extracted ranking rows");
        Ok(records)
    }
}

#[derive(Debug, Clone)]
pub struct FearGreedAdapter {
    schema: EntitySchema,
}

impl Default for FearGreedAdapter {
    fn default() -> Self {
        Self {
            schema: fear_greed_schema(),
        }
    }
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    path.iter().try_fold(value, |cur, key| cur.get(*key))
}

#[async_trait]
impl SnapshotSource for FearGreedAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::FearGreed
    }

    fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    fn page_format(&self) -> PageFormat {
        PageFormat::Json
    }

    fn parse_page(&self, page: &FetchedPage) -> Result<Vec<Record>, AdapterError> {
        let value: JsonValue = serde_json::from_slice(&page.body)?;
        let score = json_at(&value, &["fear_and_greed", "score"])
            .and_then(JsonValue::as_f64)
            .ok_or_else(|| AdapterError::Message("fear_and_greed.score missing".into()))?;
        let timestamp = json_at(&value, &["fear_and_greed", "timestamp"])
            .and_then(JsonValue::as_str)
            .ok_or_else(|| AdapterError::Message("fear_and_greed.timestamp missing".into()))?;
        let rating = json_at(&value, &["fear_and_greed", "rating"])
            .and_then(JsonValue::as_str)
            .unwrap_or_default();

        let date = DateTime::parse_from_rfc3339(timestamp)
            .map(|ts| ts.format("%Y-%m-%d").to_string())
            .map_err(|e| AdapterError::Message(format!("bad fear_and_greed.timestamp {timestamp:?}: {e}")))?;

        info!(%date, score, rating, "fear & greed reading");
        Ok(vec![Record::new()
            .with("date", date)
            .with("value", format_score(score))
            .with("rating", rating)
            .with("last_update", timestamp)])
    }
}

/// Scores are published with long fractions; one decimal is what the index shows.
fn format_score(score: f64) -> String {
    format!("{:.1}", score)
}

pub fn adapter_for_kind(kind: SourceKind) -> Box<dyn SnapshotSource> {
    match kind {
        SourceKind::PumpFun => Box::<PumpFunBoardAdapter>::default(),
        SourceKind::FourMeme => Box::<FourMemeRankingAdapter>::default(),
        SourceKind::FearGreed => Box::<FearGreedAdapter>::default(),
    }
}
