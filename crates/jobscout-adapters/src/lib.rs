//! Per-vendor pagination strategies + HTML text/link extraction.
//!
//! Each strategy turns one paginated vendor API into a complete record set:
//! fetch at cursor, extract records, append, check exhaustion (reported total
//! reached, empty page, or hard safety bound), advance or stop. Vendor shape
//! assumptions live here and nowhere else; records leave this crate already
//! in the canonical schema.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use jobscout_core::{CanonicalJob, Source};
use jobscout_storage::{FetchError, HttpFetcher};
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use serde_json::{json, Value as JsonValue};
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "jobscout-adapters";

/// Hard cap on records pulled from one source, regardless of the total the
/// server reports.
pub const MAX_RECORDS_PER_SOURCE: usize = 500;
/// Page caps for the page-number strategies.
pub const PAGE_NUMBER_MAX_PAGES: u64 = 5;
pub const GENERIC_MAX_PAGES: u64 = 10;

/// Opaque pagination position. Strategies interpret it as an offset, a start
/// index, a skip count, or a page number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor(pub u64);

/// One page request, already shaped for the vendor's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageRequest {
    Get { params: Vec<(String, String)> },
    Post { body: JsonValue },
}

/// Transport seam between strategies and the HTTP layer, so the pagination
/// loop (and its safety bounds) can be exercised against a fake client.
#[async_trait]
pub trait PageClient: Send + Sync {
    async fn get_json(
        &self,
        source: &str,
        url: &str,
        params: &[(String, String)],
    ) -> Result<JsonValue, FetchError>;

    async fn post_json(
        &self,
        source: &str,
        url: &str,
        body: &JsonValue,
    ) -> Result<JsonValue, FetchError>;
}

#[async_trait]
impl PageClient for HttpFetcher {
    async fn get_json(
        &self,
        source: &str,
        url: &str,
        params: &[(String, String)],
    ) -> Result<JsonValue, FetchError> {
        HttpFetcher::get_json(self, source, url, params).await
    }

    async fn post_json(
        &self,
        source: &str,
        url: &str,
        body: &JsonValue,
    ) -> Result<JsonValue, FetchError> {
        HttpFetcher::post_json(self, source, url, body).await
    }
}

pub trait PaginationStrategy: Send + Sync {
    fn vendor(&self) -> &'static str;
    fn initial_cursor(&self) -> Cursor;
    fn request(&self, cursor: Cursor) -> PageRequest;
    fn extract_records(&self, response: &JsonValue) -> Vec<CanonicalJob>;
    fn next_cursor(&self, cursor: Cursor, response: &JsonValue) -> Option<Cursor>;
    fn is_exhausted(&self, cursor: Cursor, response: &JsonValue, accumulated: usize) -> bool;
}

/// Drive a strategy to exhaustion. A fetch failure mid-pagination aborts the
/// whole source immediately; pages already fetched are not retried.
pub async fn paginate(
    strategy: &dyn PaginationStrategy,
    client: &dyn PageClient,
    source_name: &str,
    api_url: &str,
) -> Result<Vec<CanonicalJob>, FetchError> {
    let mut cursor = strategy.initial_cursor();
    let mut records = Vec::new();

    loop {
        let response = match strategy.request(cursor) {
            PageRequest::Get { params } => {
                client.get_json(source_name, api_url, &params).await?
            }
            PageRequest::Post { body } => client.post_json(source_name, api_url, &body).await?,
        };

        let page = strategy.extract_records(&response);
        debug!(
            vendor = strategy.vendor(),
            source = source_name,
            cursor = cursor.0,
            page_records = page.len(),
            accumulated = records.len() + page.len(),
            "fetched page"
        );
        records.extend(page);

        if strategy.is_exhausted(cursor, &response, records.len()) {
            break;
        }
        match strategy.next_cursor(cursor, &response) {
            Some(next) => cursor = next,
            None => break,
        }
    }

    Ok(records)
}

/// Pick a strategy from the API host, mirroring how the vendors actually
/// paginate. Anything unrecognized falls back to generic page numbering.
pub fn strategy_for(source: &Source, api_url: &str) -> Box<dyn PaginationStrategy> {
    let keywords = source.keywords.clone();
    if api_url.contains("amazon.jobs") {
        Box::new(OffsetIncrement {
            source_name: source.name.clone(),
        })
    } else if api_url.contains("microsoft.com") {
        Box::new(StartIncrement {
            source_name: source.name.clone(),
            keywords,
        })
    } else if api_url.contains("myworkdayjobs.com") {
        Box::new(PostBodyOffset {
            source_name: source.name.clone(),
            company: source.name.clone(),
            link_base: source.base_url.clone(),
            keywords,
        })
    } else if api_url.contains("api.lever.co") {
        Box::new(SkipIncrement {
            source_name: source.name.clone(),
        })
    } else if api_url.contains("boards-api.greenhouse.io") {
        Box::new(PageNumber {
            source_name: source.name.clone(),
        })
    } else {
        Box::new(GenericPageNumber {
            source_name: source.name.clone(),
            link_base: source.base_url.clone(),
            keywords,
        })
    }
}

fn array_len(response: &JsonValue, path: &[&str]) -> usize {
    let mut cur = response;
    for segment in path {
        match cur.get(segment) {
            Some(next) => cur = next,
            None => return 0,
        }
    }
    cur.as_array().map(Vec::len).unwrap_or(0)
}

fn json_u64(response: &JsonValue, path: &[&str]) -> u64 {
    let mut cur = response;
    for segment in path {
        match cur.get(segment) {
            Some(next) => cur = next,
            None => return 0,
        }
    }
    cur.as_u64().unwrap_or(0)
}

fn str_field(value: &JsonValue, key: &str) -> String {
    value.get(key).and_then(JsonValue::as_str).unwrap_or("").to_string()
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.trim().to_string()
    } else {
        text.chars().take(max).collect::<String>().trim().to_string()
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// The wire format the freshness filter understands.
fn format_stamp(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S+0000").to_string()
}

/// "February 13, 2026" -> "2026-02-13T00:00:00+0000"; anything else -> None.
fn parse_long_date(text: &str) -> Option<String> {
    let date = NaiveDate::parse_from_str(text.trim(), "%B %d, %Y").ok()?;
    Some(format!("{}T00:00:00+0000", date.format("%Y-%m-%d")))
}

static POSTED_DAYS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\+?\s*[Dd]ays?").expect("valid posted-days regex"));

/// Workday reports relative dates ("Posted Today", "Posted 4 Days Ago").
fn parse_relative_date(text: &str, now: DateTime<Utc>) -> Option<String> {
    if text.contains("Today") {
        return Some(format_stamp(now));
    }
    if text.contains("Yesterday") {
        return Some(format_stamp(now - Duration::days(1)));
    }
    let captures = POSTED_DAYS_RE.captures(text)?;
    let days: i64 = captures.get(1)?.as_str().parse().ok()?;
    Some(format_stamp(now - Duration::days(days)))
}

// ── Offset-increment (Amazon search.json) ──────────────────────────────

pub struct OffsetIncrement {
    pub source_name: String,
}

const AMAZON_PAGE_SIZE: u64 = 10;

impl PaginationStrategy for OffsetIncrement {
    fn vendor(&self) -> &'static str {
        "offset-increment"
    }

    fn initial_cursor(&self) -> Cursor {
        Cursor(0)
    }

    fn request(&self, cursor: Cursor) -> PageRequest {
        PageRequest::Get {
            params: vec![
                ("offset".to_string(), cursor.0.to_string()),
                ("result_limit".to_string(), AMAZON_PAGE_SIZE.to_string()),
                ("sort".to_string(), "recent".to_string()),
                ("category[]".to_string(), "software-development".to_string()),
                ("country[]".to_string(), "USA".to_string()),
            ],
        }
    }

    fn extract_records(&self, response: &JsonValue) -> Vec<CanonicalJob> {
        let Some(raw_jobs) = response.get("jobs").and_then(JsonValue::as_array) else {
            return Vec::new();
        };
        raw_jobs
            .iter()
            // The API may return international results even with the
            // country filter applied.
            .filter(|raw| str_field(raw, "country_code") == "USA")
            .map(|raw| {
                let city = str_field(raw, "city");
                let state = str_field(raw, "state");
                let location = match (city.is_empty(), state.is_empty()) {
                    (false, false) => format!("{city}, {state}"),
                    (false, true) => city,
                    (true, false) => state,
                    (true, true) => "Not specified".to_string(),
                };
                let job_path = str_field(raw, "job_path");
                let url = if job_path.is_empty() {
                    String::new()
                } else {
                    format!("https://www.amazon.jobs{job_path}")
                };
                let description = {
                    let short = str_field(raw, "description_short");
                    if short.is_empty() {
                        truncate_chars(&str_field(raw, "description"), 300)
                    } else {
                        short
                    }
                };
                CanonicalJob {
                    title: str_field(raw, "title"),
                    company: "Amazon".to_string(),
                    location,
                    url,
                    description,
                    date_posted: parse_long_date(&str_field(raw, "posted_date")),
                    source: self.source_name.clone(),
                    job_type: capitalize(&str_field(raw, "job_schedule_type")),
                }
            })
            .collect()
    }

    fn next_cursor(&self, cursor: Cursor, _response: &JsonValue) -> Option<Cursor> {
        Some(Cursor(cursor.0 + AMAZON_PAGE_SIZE))
    }

    fn is_exhausted(&self, _cursor: Cursor, response: &JsonValue, accumulated: usize) -> bool {
        let total = json_u64(response, &["hits"]) as usize;
        accumulated >= total
            || array_len(response, &["jobs"]) == 0
            || accumulated >= MAX_RECORDS_PER_SOURCE
    }
}

// ── Start-increment (Microsoft pcsx/search) ────────────────────────────

pub struct StartIncrement {
    pub source_name: String,
    pub keywords: Option<String>,
}

const MICROSOFT_LINK_BASE: &str = "https://apply.careers.microsoft.com";

impl PaginationStrategy for StartIncrement {
    fn vendor(&self) -> &'static str {
        "start-increment"
    }

    fn initial_cursor(&self) -> Cursor {
        Cursor(0)
    }

    fn request(&self, cursor: Cursor) -> PageRequest {
        PageRequest::Get {
            params: vec![
                ("domain".to_string(), "microsoft.com".to_string()),
                (
                    "query".to_string(),
                    self.keywords
                        .clone()
                        .unwrap_or_else(|| "Software Development".to_string()),
                ),
                ("start".to_string(), cursor.0.to_string()),
                ("sort_by".to_string(), "timestamp".to_string()),
                ("filter_include_remote".to_string(), "1".to_string()),
            ],
        }
    }

    fn extract_records(&self, response: &JsonValue) -> Vec<CanonicalJob> {
        let Some(positions) = response
            .get("data")
            .and_then(|d| d.get("positions"))
            .and_then(JsonValue::as_array)
        else {
            return Vec::new();
        };
        positions
            .iter()
            .map(|raw| {
                let locations: Vec<String> = raw
                    .get("locations")
                    .and_then(JsonValue::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(JsonValue::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let location = if locations.is_empty() {
                    "Not specified".to_string()
                } else {
                    locations.join(", ")
                };
                let position_url = str_field(raw, "positionUrl");
                let url = if position_url.is_empty() {
                    String::new()
                } else {
                    format!("{MICROSOFT_LINK_BASE}{position_url}")
                };
                let date_posted = raw
                    .get("postedTs")
                    .and_then(JsonValue::as_i64)
                    .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
                    .map(format_stamp);
                let display_id = str_field(raw, "displayJobId");
                let description = if display_id.is_empty() {
                    String::new()
                } else {
                    format!("Microsoft Job ID: {display_id}")
                };
                CanonicalJob {
                    title: str_field(raw, "name"),
                    company: "Microsoft".to_string(),
                    location,
                    url,
                    description,
                    date_posted,
                    source: self.source_name.clone(),
                    job_type: "Full-time".to_string(),
                }
            })
            .collect()
    }

    /// Advances by the count of records just returned.
    fn next_cursor(&self, cursor: Cursor, response: &JsonValue) -> Option<Cursor> {
        let returned = array_len(response, &["data", "positions"]) as u64;
        Some(Cursor(cursor.0 + returned))
    }

    fn is_exhausted(&self, _cursor: Cursor, response: &JsonValue, accumulated: usize) -> bool {
        let total = json_u64(response, &["data", "total"]) as usize;
        accumulated >= total
            || array_len(response, &["data", "positions"]) == 0
            || accumulated >= MAX_RECORDS_PER_SOURCE
    }
}

// ── POST-body offset (Workday wday/cxs) ────────────────────────────────

pub struct PostBodyOffset {
    pub source_name: String,
    pub company: String,
    pub link_base: String,
    pub keywords: Option<String>,
}

const WORKDAY_PAGE_SIZE: u64 = 20;

impl PaginationStrategy for PostBodyOffset {
    fn vendor(&self) -> &'static str {
        "post-body-offset"
    }

    fn initial_cursor(&self) -> Cursor {
        Cursor(0)
    }

    /// Workday carries the cursor in the POST body, not the query string.
    fn request(&self, cursor: Cursor) -> PageRequest {
        PageRequest::Post {
            body: json!({
                "limit": WORKDAY_PAGE_SIZE,
                "offset": cursor.0,
                "searchText": self.keywords.clone().unwrap_or_default(),
            }),
        }
    }

    fn extract_records(&self, response: &JsonValue) -> Vec<CanonicalJob> {
        let Some(postings) = response.get("jobPostings").and_then(JsonValue::as_array) else {
            return Vec::new();
        };
        let now = Utc::now();
        postings
            .iter()
            .map(|raw| {
                let external_path = str_field(raw, "externalPath");
                let url = if external_path.is_empty() {
                    String::new()
                } else {
                    format!("{}{external_path}", self.link_base.trim_end_matches('/'))
                };
                let location = {
                    let text = str_field(raw, "locationsText");
                    if text.is_empty() {
                        "Not specified".to_string()
                    } else {
                        text
                    }
                };
                let description = raw
                    .get("bulletFields")
                    .and_then(JsonValue::as_array)
                    .and_then(|arr| arr.first())
                    .and_then(JsonValue::as_str)
                    .unwrap_or("")
                    .to_string();
                CanonicalJob {
                    title: str_field(raw, "title"),
                    company: self.company.clone(),
                    location,
                    url,
                    description,
                    date_posted: parse_relative_date(&str_field(raw, "postedOn"), now),
                    source: self.source_name.clone(),
                    job_type: "Full-time".to_string(),
                }
            })
            .collect()
    }

    fn next_cursor(&self, cursor: Cursor, _response: &JsonValue) -> Option<Cursor> {
        Some(Cursor(cursor.0 + WORKDAY_PAGE_SIZE))
    }

    fn is_exhausted(&self, _cursor: Cursor, response: &JsonValue, accumulated: usize) -> bool {
        let total = json_u64(response, &["total"]) as usize;
        accumulated >= total
            || array_len(response, &["jobPostings"]) == 0
            || accumulated >= MAX_RECORDS_PER_SOURCE
    }
}

// ── Skip-increment (Lever postings) ────────────────────────────────────

pub struct SkipIncrement {
    pub source_name: String,
}

const LEVER_PAGE_SIZE: u64 = 100;

impl PaginationStrategy for SkipIncrement {
    fn vendor(&self) -> &'static str {
        "skip-increment"
    }

    fn initial_cursor(&self) -> Cursor {
        Cursor(0)
    }

    fn request(&self, cursor: Cursor) -> PageRequest {
        PageRequest::Get {
            params: vec![
                ("skip".to_string(), cursor.0.to_string()),
                ("limit".to_string(), LEVER_PAGE_SIZE.to_string()),
                ("mode".to_string(), "json".to_string()),
            ],
        }
    }

    /// Lever returns a flat array rather than an envelope object.
    fn extract_records(&self, response: &JsonValue) -> Vec<CanonicalJob> {
        let Some(postings) = response.as_array() else {
            return Vec::new();
        };
        postings
            .iter()
            .map(|raw| {
                let categories = raw.get("categories").cloned().unwrap_or(JsonValue::Null);
                let date_posted = raw
                    .get("createdAt")
                    .and_then(JsonValue::as_i64)
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
                    .map(format_stamp);
                let location = {
                    let loc = str_field(&categories, "location");
                    if loc.is_empty() {
                        "Not specified".to_string()
                    } else {
                        loc
                    }
                };
                CanonicalJob {
                    title: str_field(raw, "text"),
                    company: self.source_name.clone(),
                    location,
                    url: str_field(raw, "hostedUrl"),
                    description: truncate_chars(&str_field(raw, "descriptionPlain"), 300),
                    date_posted,
                    source: self.source_name.clone(),
                    job_type: str_field(&categories, "commitment"),
                }
            })
            .collect()
    }

    fn next_cursor(&self, cursor: Cursor, _response: &JsonValue) -> Option<Cursor> {
        Some(Cursor(cursor.0 + LEVER_PAGE_SIZE))
    }

    /// Lever reports no total; a short page means the end.
    fn is_exhausted(&self, _cursor: Cursor, response: &JsonValue, accumulated: usize) -> bool {
        let returned = response.as_array().map(Vec::len).unwrap_or(0);
        returned < LEVER_PAGE_SIZE as usize || accumulated >= MAX_RECORDS_PER_SOURCE
    }
}

// ── Page-number (Greenhouse boards API) ────────────────────────────────

pub struct PageNumber {
    pub source_name: String,
}

impl PaginationStrategy for PageNumber {
    fn vendor(&self) -> &'static str {
        "page-number"
    }

    fn initial_cursor(&self) -> Cursor {
        Cursor(1)
    }

    fn request(&self, cursor: Cursor) -> PageRequest {
        PageRequest::Get {
            params: vec![("page".to_string(), cursor.0.to_string())],
        }
    }

    fn extract_records(&self, response: &JsonValue) -> Vec<CanonicalJob> {
        let Some(raw_jobs) = response.get("jobs").and_then(JsonValue::as_array) else {
            return Vec::new();
        };
        raw_jobs
            .iter()
            .map(|raw| {
                let company = {
                    let name = str_field(raw, "company_name");
                    if name.is_empty() {
                        self.source_name.clone()
                    } else {
                        name
                    }
                };
                let location = raw
                    .get("location")
                    .map(|l| str_field(l, "name"))
                    .filter(|l| !l.is_empty())
                    .unwrap_or_else(|| "Not specified".to_string());
                CanonicalJob {
                    title: str_field(raw, "title"),
                    company,
                    location,
                    url: str_field(raw, "absolute_url"),
                    description: String::new(),
                    date_posted: {
                        let updated = str_field(raw, "updated_at");
                        if updated.is_empty() {
                            None
                        } else {
                            Some(updated)
                        }
                    },
                    source: self.source_name.clone(),
                    job_type: String::new(),
                }
            })
            .collect()
    }

    fn next_cursor(&self, cursor: Cursor, _response: &JsonValue) -> Option<Cursor> {
        Some(Cursor(cursor.0 + 1))
    }

    fn is_exhausted(&self, cursor: Cursor, response: &JsonValue, _accumulated: usize) -> bool {
        array_len(response, &["jobs"]) == 0 || cursor.0 >= PAGE_NUMBER_MAX_PAGES
    }
}

// ── Generic page-number (Jibe/iCIMS-style fallback) ────────────────────

pub struct GenericPageNumber {
    pub source_name: String,
    pub link_base: String,
    pub keywords: Option<String>,
}

const GENERIC_PAGE_SIZE: u64 = 50;

impl PaginationStrategy for GenericPageNumber {
    fn vendor(&self) -> &'static str {
        "generic-page-number"
    }

    fn initial_cursor(&self) -> Cursor {
        Cursor(1)
    }

    fn request(&self, cursor: Cursor) -> PageRequest {
        let mut params = vec![
            ("page".to_string(), cursor.0.to_string()),
            ("limit".to_string(), GENERIC_PAGE_SIZE.to_string()),
            ("sortBy".to_string(), "posted_date".to_string()),
            ("descending".to_string(), "true".to_string()),
        ];
        if let Some(keywords) = &self.keywords {
            params.push(("keywords".to_string(), keywords.clone()));
        }
        PageRequest::Get { params }
    }

    fn extract_records(&self, response: &JsonValue) -> Vec<CanonicalJob> {
        let Some(raw_jobs) = response.get("jobs").and_then(JsonValue::as_array) else {
            return Vec::new();
        };
        raw_jobs
            .iter()
            .map(|raw| {
                let data = raw.get("data").cloned().unwrap_or(JsonValue::Null);
                let city = str_field(&data, "city");
                let state = str_field(&data, "state");
                let description = str_field(&data, "description");
                let location = match (city.is_empty(), state.is_empty()) {
                    (false, false) => format!("{city}, {state}"),
                    (false, true) => city,
                    (true, false) => state,
                    (true, true) => {
                        if description.contains("Remote") {
                            "Remote".to_string()
                        } else {
                            "Not specified".to_string()
                        }
                    }
                };
                let slug = str_field(&data, "slug");
                let url = if slug.is_empty() {
                    String::new()
                } else {
                    format!(
                        "{}/careers-home/jobs/{slug}",
                        self.link_base.trim_end_matches('/')
                    )
                };
                let date_posted = {
                    let posted = str_field(&data, "posted_date");
                    if posted.is_empty() {
                        None
                    } else {
                        Some(posted)
                    }
                };
                CanonicalJob {
                    title: str_field(&data, "title"),
                    company: self.source_name.clone(),
                    location,
                    url,
                    description: truncate_chars(&description, 300),
                    date_posted,
                    source: self.source_name.clone(),
                    job_type: {
                        let t = str_field(&data, "employment_type");
                        if t.is_empty() {
                            "Full-time".to_string()
                        } else {
                            t
                        }
                    },
                }
            })
            .collect()
    }

    fn next_cursor(&self, cursor: Cursor, _response: &JsonValue) -> Option<Cursor> {
        Some(Cursor(cursor.0 + 1))
    }

    fn is_exhausted(&self, cursor: Cursor, response: &JsonValue, accumulated: usize) -> bool {
        let total = json_u64(response, &["totalCount"]) as usize;
        accumulated >= total
            || array_len(response, &["jobs"]) == 0
            || cursor.0 >= GENERIC_MAX_PAGES
    }
}

// ── HTML text + job-link extraction ─────────────────────────────────────

/// Character budget for extracted text handed to the extraction service.
pub const TEXT_BUDGET: usize = 4000;

const TRUNCATION_MARKER: &str = "\n\n[... content truncated ...]";

/// Elements that never contain listing content.
const STRIPPED_ELEMENTS: &[&str] = &[
    "script", "style", "nav", "footer", "header", "noscript", "svg", "iframe",
];

/// Main-content candidates, most specific first. The id/class candidates
/// match by substring, so `id="main-content"` or `class="careers-list"`
/// still select the region.
const MAIN_CONTENT_SELECTORS: &[&str] = &[
    "main",
    "div[role=\"main\"]",
    "[id*=\"content\" i], [id*=\"main\" i], [id*=\"jobs\" i], [id*=\"careers\" i]",
    "[class*=\"content\" i], [class*=\"main\" i], [class*=\"jobs\" i], [class*=\"careers\" i]",
    "body",
];

static BLANK_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid blank-lines regex"));
static MULTI_SPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" {2,}").expect("valid multi-space regex"));
static JOB_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(job|career|position|opening|role|apply|hiring|vacancy)")
        .expect("valid job-link regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLink {
    pub text: String,
    pub url: String,
}

/// Extract visible text from raw HTML, preferring a heuristically identified
/// main-content region and skipping chrome elements, bounded to `max_len`
/// characters.
pub fn extract_text(html: &str, max_len: usize) -> String {
    if html.is_empty() {
        return String::new();
    }

    let document = Html::parse_document(html);
    let region = main_content_region(&document);

    let mut text = String::new();
    collect_visible_text(region, &mut text);

    let text = BLANK_LINES_RE.replace_all(text.trim(), "\n\n");
    let text = MULTI_SPACE_RE.replace_all(&text, " ");

    if text.chars().count() > max_len {
        let mut truncated: String = text.chars().take(max_len).collect();
        truncated.push_str(TRUNCATION_MARKER);
        truncated
    } else {
        text.into_owned()
    }
}

fn main_content_region(document: &Html) -> ElementRef<'_> {
    for candidate in MAIN_CONTENT_SELECTORS {
        let selector = Selector::parse(candidate).expect("static selector");
        if let Some(region) = document.select(&selector).next() {
            return region;
        }
    }
    document.root_element()
}

fn collect_visible_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    out.push_str(trimmed);
                    out.push('\n');
                }
            }
            Node::Element(el) => {
                if !STRIPPED_ELEMENTS.contains(&el.name()) {
                    if let Some(child_ref) = ElementRef::wrap(child) {
                        collect_visible_text(child_ref, out);
                    }
                }
            }
            _ => {}
        }
    }
}

/// Anchors whose text or href look job-related, resolved to absolute URLs
/// and de-duplicated by the resolved URL.
pub fn extract_job_links(html: &str, base_url: &str) -> Vec<JobLink> {
    if html.is_empty() {
        return Vec::new();
    }

    let document = Html::parse_document(html);
    let anchor = Selector::parse("a[href]").expect("static selector");
    let base = Url::parse(base_url).ok();

    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for element in document.select(&anchor) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let text = element.text().collect::<String>().trim().to_string();

        let resolved = match &base {
            Some(base) => base.join(href).map(String::from).unwrap_or_default(),
            None => href.to_string(),
        };
        if !resolved.starts_with("http") {
            continue;
        }

        // Dedup applies within the job-looking candidates only; a plain
        // anchor sharing the URL must not shadow a later job anchor.
        if (JOB_LINK_RE.is_match(&text) || JOB_LINK_RE.is_match(href))
            && seen.insert(resolved.clone())
        {
            links.push(JobLink {
                text: truncate_chars(&text, 200),
                url: resolved,
            });
        }
    }

    links
}
