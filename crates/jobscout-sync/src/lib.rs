//! Pipeline orchestration: plan the configured sources, fetch each one,
//! normalize the records, and filter the merged set for freshness and
//! duplicates. Also hosts the fixed-interval scheduler that diffs each
//! cycle's results against the seen-job ledger and notifies on new postings.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jobscout_adapters::{extract_job_links, extract_text, paginate, strategy_for, TEXT_BUDGET};
use jobscout_core::{CanonicalJob, JobDraft, Source, SourceKind};
use jobscout_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, SeenJobLedger};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobscout-sync";

/// Postings older than this many days are dropped at the filter.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 2;
/// Records per normalization request, to keep the service within its
/// context window.
pub const NORMALIZE_BATCH_SIZE: usize = 3;

const EXTRACTION_ATTEMPTS: usize = 2;
const EXTRACTION_TEMPERATURE: f64 = 0.7;
const NORMALIZATION_TEMPERATURE: f64 = 0.3;
/// Job-looking links appended below the extracted page text.
const MAX_APPENDED_LINKS: usize = 20;

// ── Configuration ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub extraction_base_url: String,
    pub extraction_model: String,
    pub extraction_max_tokens: u32,
    pub extraction_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub max_retries: usize,
    pub output_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub max_age_days: i64,
    pub skip_normalization: bool,
    pub user_agent: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            extraction_base_url: "http://localhost:1234/v1".to_string(),
            extraction_model: "qwen3-8b".to_string(),
            extraction_max_tokens: 2048,
            extraction_timeout_secs: 120,
            request_timeout_secs: 30,
            max_retries: 3,
            output_dir: PathBuf::from("output"),
            ledger_path: PathBuf::from("data/seen_jobs.db"),
            max_age_days: DEFAULT_MAX_AGE_DAYS,
            skip_normalization: false,
            user_agent: HttpClientConfig::default().user_agent,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|raw| matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            extraction_base_url: env_string(
                "JOBSCOUT_EXTRACTION_BASE_URL",
                &defaults.extraction_base_url,
            ),
            extraction_model: env_string("JOBSCOUT_EXTRACTION_MODEL", &defaults.extraction_model),
            extraction_max_tokens: env_parsed(
                "JOBSCOUT_EXTRACTION_MAX_TOKENS",
                defaults.extraction_max_tokens,
            ),
            extraction_timeout_secs: env_parsed(
                "JOBSCOUT_EXTRACTION_TIMEOUT",
                defaults.extraction_timeout_secs,
            ),
            request_timeout_secs: env_parsed(
                "JOBSCOUT_REQUEST_TIMEOUT",
                defaults.request_timeout_secs,
            ),
            max_retries: env_parsed("JOBSCOUT_MAX_RETRIES", defaults.max_retries),
            output_dir: PathBuf::from(env_string(
                "JOBSCOUT_OUTPUT_DIR",
                &defaults.output_dir.to_string_lossy(),
            )),
            ledger_path: PathBuf::from(env_string(
                "JOBSCOUT_LEDGER_PATH",
                &defaults.ledger_path.to_string_lossy(),
            )),
            max_age_days: env_parsed("JOBSCOUT_MAX_AGE_DAYS", defaults.max_age_days),
            skip_normalization: env_flag(
                "JOBSCOUT_SKIP_NORMALIZATION",
                defaults.skip_normalization,
            ),
            user_agent: env_string("JOBSCOUT_USER_AGENT", &defaults.user_agent),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: StdDuration::from_secs(self.request_timeout_secs),
            user_agent: self.user_agent.clone(),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..BackoffPolicy::default()
            },
        }
    }
}

// ── Source registry ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RegistryFile {
    career_pages: Vec<RegistryEntry>,
}

#[derive(Debug, Deserialize)]
struct RegistryEntry {
    name: String,
    url: String,
    #[serde(rename = "type", default = "default_source_type")]
    kind: String,
    #[serde(default)]
    api_url: Option<String>,
    #[serde(default)]
    keywords: Option<String>,
}

fn default_source_type() -> String {
    "career_page".to_string()
}

pub fn load_source_registry(path: impl AsRef<Path>) -> anyhow::Result<Vec<Source>> {
    let raw = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("reading source registry {}", path.as_ref().display()))?;
    parse_source_registry(&raw)
}

pub fn parse_source_registry(raw: &str) -> anyhow::Result<Vec<Source>> {
    let file: RegistryFile = serde_yaml::from_str(raw).context("parsing source registry YAML")?;
    Ok(file
        .career_pages
        .into_iter()
        .map(|entry| Source {
            kind: if entry.kind == "api" {
                SourceKind::Api
            } else {
                SourceKind::Html
            },
            name: entry.name,
            base_url: entry.url,
            api_url: entry.api_url,
            keywords: entry.keywords,
        })
        .collect())
}

// ── Extraction service ──────────────────────────────────────────────────

pub const EXTRACTOR_SYSTEM_PROMPT: &str = "\
You are a job listing extractor. Your job is to extract job postings from the provided text content of a career/jobs page.

IMPORTANT INSTRUCTIONS:
1. Extract ONLY actual job postings, not general company info.
2. Return a JSON array of job objects.
3. Each job object must have these fields:
   - \"title\": job title (string)
   - \"company\": company name (string)
   - \"location\": job location (string, use \"Not specified\" if unknown)
   - \"url\": direct link to the job if available (string, use \"\" if not found)
   - \"description\": brief description of the role (string, 1-2 sentences max)
4. If no jobs are found, return an empty array: []
5. Return ONLY the JSON array, no other text.
6. Do NOT wrap the JSON in markdown code blocks.

/no_think";

pub const NORMALIZER_SYSTEM_PROMPT: &str = "\
You are a data normalizer for job listings. Your job is to clean and standardize job data.

INSTRUCTIONS:
1. Standardize location formats (e.g., \"NYC\" \u{2192} \"New York, NY\", \"SF\" \u{2192} \"San Francisco, CA\", \"Remote\" stays \"Remote\")
2. Clean job titles (remove extra whitespace, fix capitalization)
3. Ensure company names are properly capitalized
4. Keep descriptions concise (1-2 sentences)
5. Set job_type if detectable from title/description (Full-time, Part-time, Contract, Internship)
6. Return a JSON array of normalized job objects with these fields:
   - \"title\", \"company\", \"location\", \"url\", \"description\", \"date_posted\", \"source\", \"job_type\"
7. Return ONLY the JSON array, no other text.
8. Do NOT wrap the JSON in markdown code blocks.

/no_think";

fn extractor_user_prompt(source: &Source, content: &str) -> String {
    format!(
        "Extract all job postings from the following career page content.\n\
         Source: {}\n\
         Source URL: {}\n\n\
         Content:\n{}\n\n\
         Return ONLY a JSON array of job objects.",
        source.name, source.base_url, content
    )
}

fn normalizer_user_prompt(jobs_json: &str) -> String {
    format!(
        "Normalize the following job listings data. Standardize locations, clean titles, \
         and ensure consistency.\n\n\
         Raw job data:\n{jobs_json}\n\n\
         Return ONLY a JSON array of normalized job objects."
    )
}

/// Seam to the text-understanding backend. Both operations return the raw
/// response text; parsing and fallback live in the pipeline so a flaky
/// backend can never corrupt it.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Extract job postings from career-page text. The response should be a
    /// JSON array of records, but callers must tolerate anything.
    async fn extract_jobs(&self, page_text: &str, source: &Source) -> anyhow::Result<String>;

    /// Clean and standardize one batch of records.
    async fn normalize_batch(&self, jobs_json: &str, source: &Source) -> anyhow::Result<String>;
}

/// OpenAI-compatible chat-completions client (LM Studio, vLLM, etc.).
pub struct OpenAiCompatService {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiCompatService {
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(config.extraction_timeout_secs))
            .build()
            .context("building extraction service client")?;
        Ok(Self {
            client,
            base_url: config.extraction_base_url.trim_end_matches('/').to_string(),
            model: config.extraction_model.clone(),
            max_tokens: config.extraction_max_tokens,
        })
    }

    async fn chat(&self, system: &str, user: &str, temperature: f64) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "temperature": temperature,
            "max_tokens": self.max_tokens,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("calling extraction service")?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("extraction service returned {status}"));
        }
        let payload: JsonValue = response
            .json()
            .await
            .context("decoding extraction service response")?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("extraction service response missing message content"))
    }
}

#[async_trait]
impl ExtractionService for OpenAiCompatService {
    async fn extract_jobs(&self, page_text: &str, source: &Source) -> anyhow::Result<String> {
        self.chat(
            EXTRACTOR_SYSTEM_PROMPT,
            &extractor_user_prompt(source, page_text),
            EXTRACTION_TEMPERATURE,
        )
        .await
    }

    async fn normalize_batch(&self, jobs_json: &str, _source: &Source) -> anyhow::Result<String> {
        self.chat(
            NORMALIZER_SYSTEM_PROMPT,
            &normalizer_user_prompt(jobs_json),
            NORMALIZATION_TEMPERATURE,
        )
        .await
    }
}

/// Parse a service response into drafts, tolerating the usual quirks:
/// markdown code fences, chatter around the array, a bare object instead
/// of an array. Anything unsalvageable yields an empty vec.
pub fn parse_service_payload(raw: &str) -> Vec<JobDraft> {
    let mut text = raw.trim().to_string();
    if let Some(start) = text.rfind("```json") {
        text = text[start + "```json".len()..].to_string();
        if let Some(end) = text.find("```") {
            text.truncate(end);
        }
    } else if text.contains("```") {
        let parts: Vec<&str> = text.splitn(3, "```").collect();
        if parts.len() >= 2 {
            text = parts[1].to_string();
        }
    }
    let trimmed = text.trim();
    let candidate = match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    };

    let value: JsonValue = match serde_json::from_str(candidate) {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, "service payload is not valid JSON");
            return Vec::new();
        }
    };
    let items = match value {
        JsonValue::Array(items) => items,
        object @ JsonValue::Object(_) => vec![object],
        _ => return Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<JobDraft>(item) {
            Ok(draft) => Some(draft),
            Err(err) => {
                warn!(error = %err, "dropping malformed record from service payload");
                None
            }
        })
        .collect()
}

// ── Normalizer ──────────────────────────────────────────────────────────

/// Apply canonical defaults without touching populated fields.
pub fn apply_defaults(mut jobs: Vec<CanonicalJob>, source_name: &str) -> Vec<CanonicalJob> {
    for job in &mut jobs {
        if job.source.trim().is_empty() {
            job.source = source_name.to_string();
        }
        if job.date_posted.as_deref().is_some_and(|d| d.trim().is_empty()) {
            job.date_posted = None;
        }
    }
    jobs
}

pub struct Normalizer<'a> {
    service: &'a dyn ExtractionService,
    skip_normalization: bool,
}

impl<'a> Normalizer<'a> {
    pub fn new(service: &'a dyn ExtractionService, skip_normalization: bool) -> Self {
        Self {
            service,
            skip_normalization,
        }
    }

    /// API records arrive structured; only defaults are applied, never a
    /// service round-trip.
    pub fn finish_structured(&self, jobs: Vec<CanonicalJob>, source: &Source) -> Vec<CanonicalJob> {
        apply_defaults(jobs, &source.name)
    }

    /// Career-page path: extract drafts from the page text, then clean them
    /// up batch by batch unless normalization is disabled.
    pub async fn normalize_page_text(
        &self,
        page_text: &str,
        source: &Source,
    ) -> anyhow::Result<Vec<CanonicalJob>> {
        let drafts = self.extract_with_retry(page_text, source).await?;
        let jobs: Vec<CanonicalJob> = drafts
            .into_iter()
            .map(|draft| {
                let mut job = draft.into_canonical(&source.name);
                job.source = source.name.clone();
                if job.url.is_empty() {
                    job.url = source.base_url.clone();
                }
                job
            })
            .collect();
        if jobs.is_empty() || self.skip_normalization {
            return Ok(jobs);
        }
        Ok(self.normalize_batches(jobs, source).await)
    }

    /// An empty first extraction gets one more attempt; an empty second one
    /// is accepted as "no postings here".
    async fn extract_with_retry(
        &self,
        page_text: &str,
        source: &Source,
    ) -> anyhow::Result<Vec<JobDraft>> {
        if page_text.trim().is_empty() {
            return Err(anyhow!("no text content to parse for {}", source.name));
        }
        let mut last_error: Option<anyhow::Error> = None;
        for attempt in 0..EXTRACTION_ATTEMPTS {
            last_error = None;
            match self.service.extract_jobs(page_text, source).await {
                Ok(response) => {
                    let drafts = parse_service_payload(&response);
                    if !drafts.is_empty() {
                        return Ok(drafts);
                    }
                    debug!(source = %source.name, attempt, "empty extraction result");
                }
                Err(err) => {
                    warn!(source = %source.name, attempt, error = %err, "extraction call failed");
                    last_error =
                        Some(err.context(format!("extraction failed for {}", source.name)));
                }
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(Vec::new()),
        }
    }

    /// A batch whose response cannot be parsed (or whose record count does
    /// not match) falls back to its original records, so normalization can
    /// reword data but never lose it.
    async fn normalize_batches(
        &self,
        jobs: Vec<CanonicalJob>,
        source: &Source,
    ) -> Vec<CanonicalJob> {
        let total = jobs.len();
        let batches = total.div_ceil(NORMALIZE_BATCH_SIZE);
        let mut out = Vec::with_capacity(total);

        for (index, batch) in jobs.chunks(NORMALIZE_BATCH_SIZE).enumerate() {
            debug!(
                source = %source.name,
                batch = index + 1,
                batches,
                records = batch.len(),
                "normalizing batch"
            );
            let payload = match serde_json::to_string_pretty(batch) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(source = %source.name, error = %err, "serializing batch failed");
                    out.extend_from_slice(batch);
                    continue;
                }
            };
            match self.service.normalize_batch(&payload, source).await {
                Ok(response) => {
                    let drafts = parse_service_payload(&response);
                    if drafts.len() == batch.len() {
                        out.extend(
                            drafts
                                .into_iter()
                                .map(|draft| draft.into_canonical(&source.name)),
                        );
                    } else {
                        warn!(
                            source = %source.name,
                            batch = index + 1,
                            returned = drafts.len(),
                            expected = batch.len(),
                            "normalization changed record count, keeping originals for this batch"
                        );
                        out.extend_from_slice(batch);
                    }
                }
                Err(err) => {
                    warn!(
                        source = %source.name,
                        batch = index + 1,
                        error = %err,
                        "normalization call failed, keeping originals for this batch"
                    );
                    out.extend_from_slice(batch);
                }
            }
        }
        out
    }
}

// ── Dedup & freshness filter ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FilterStats {
    pub filtered_by_date: usize,
    pub duplicates_removed: usize,
    pub final_count: usize,
}

/// "2026-02-13T10:00:00+0000" first, then RFC 3339. Anything else is
/// unparseable and the record is kept (fail open).
pub fn parse_posted_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Drop stale and duplicate records. Blank-title records and identity-key
/// duplicates both land in `duplicates_removed`, so the three counters
/// always partition the input exactly.
pub fn filter_jobs(
    jobs: Vec<CanonicalJob>,
    now: DateTime<Utc>,
    max_age_days: i64,
) -> (Vec<CanonicalJob>, FilterStats) {
    let input_count = jobs.len();
    let cutoff = now - Duration::days(max_age_days);

    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    let mut filtered_by_date = 0usize;

    for job in jobs {
        if job.title.trim().is_empty() {
            continue;
        }
        if let Some(raw) = &job.date_posted {
            if let Some(posted) = parse_posted_date(raw) {
                if posted < cutoff {
                    filtered_by_date += 1;
                    continue;
                }
            }
        }
        if seen.insert(job.identity_key()) {
            kept.push(job);
        }
    }

    let stats = FilterStats {
        filtered_by_date,
        duplicates_removed: input_count - filtered_by_date - kept.len(),
        final_count: kept.len(),
    };
    (kept, stats)
}

// ── Pipeline state ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    pub source: Source,
    pub status: PlanStatus,
}

/// Accumulated pipeline state. The per-source buffers (`page_text`,
/// `fetched_records`) are replaced wholesale and cleared whenever the plan
/// advances; the run-wide lists (`normalized_jobs`, `errors`) only ever
/// append.
#[derive(Debug, Default)]
pub struct PipelineState {
    pub plan: Vec<PlanEntry>,
    pub current_index: usize,
    pub page_text: String,
    pub fetched_records: Vec<CanonicalJob>,
    pub normalized_jobs: Vec<CanonicalJob>,
    pub errors: Vec<String>,
}

fn append_merge<T>(target: &mut Vec<T>, mut addition: Vec<T>) {
    target.append(&mut addition);
}

fn replace<T>(slot: &mut T, value: T) {
    *slot = value;
}

impl PipelineState {
    pub fn new(sources: &[Source]) -> Self {
        Self {
            plan: sources
                .iter()
                .cloned()
                .map(|source| PlanEntry {
                    source,
                    status: PlanStatus::Pending,
                })
                .collect(),
            ..Self::default()
        }
    }

    pub fn mark_current(&mut self, status: PlanStatus) {
        if let Some(entry) = self.plan.get_mut(self.current_index) {
            entry.status = status;
        }
    }

    /// Move to the next plan entry, clearing the per-source buffers.
    pub fn advance(&mut self) {
        let next = self.current_index + 1;
        replace(&mut self.current_index, next);
        replace(&mut self.page_text, String::new());
        replace(&mut self.fetched_records, Vec::new());
    }

    pub fn absorb(&mut self, jobs: Vec<CanonicalJob>, errors: Vec<String>) {
        append_merge(&mut self.normalized_jobs, jobs);
        append_merge(&mut self.errors, errors);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Planned,
    Fetching(usize),
    Normalizing(usize),
    Deduping,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advance,
    Dedup,
}

/// After finishing a source: more plan entries left means advance,
/// otherwise move to the dedup phase.
pub fn should_continue(current_index: usize, plan_len: usize) -> Transition {
    if current_index + 1 < plan_len {
        Transition::Advance
    } else {
        Transition::Dedup
    }
}

// ── Source fetch seam ───────────────────────────────────────────────────

/// Uniform result of fetching one source: structured API sources yield
/// canonical records directly, career pages yield bounded page text for
/// the extraction service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchedSource {
    Records(Vec<CanonicalJob>),
    PageText(String),
}

#[async_trait]
pub trait SourceFetch: Send + Sync {
    async fn fetch(&self, source: &Source) -> anyhow::Result<FetchedSource>;
}

pub struct LiveSourceFetch<'a> {
    fetcher: &'a HttpFetcher,
}

impl<'a> LiveSourceFetch<'a> {
    pub fn new(fetcher: &'a HttpFetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl SourceFetch for LiveSourceFetch<'_> {
    async fn fetch(&self, source: &Source) -> anyhow::Result<FetchedSource> {
        match source.kind {
            SourceKind::Api => {
                let api_url = source
                    .api_url
                    .as_deref()
                    .ok_or_else(|| anyhow!("no API URL configured for {}", source.name))?;
                let strategy = strategy_for(source, api_url);
                let records = paginate(strategy.as_ref(), self.fetcher, &source.name, api_url)
                    .await
                    .with_context(|| format!("fetching {}", source.name))?;
                Ok(FetchedSource::Records(records))
            }
            SourceKind::Html => {
                let html = self
                    .fetcher
                    .get_text(&source.name, &source.base_url)
                    .await
                    .with_context(|| format!("fetching {}", source.name))?;
                let mut text = extract_text(&html, TEXT_BUDGET);
                let links = extract_job_links(&html, &source.base_url);
                if !links.is_empty() {
                    text.push_str("\n\nJob-related links found on this page:\n");
                    for link in links.iter().take(MAX_APPENDED_LINKS) {
                        text.push_str(&format!("- {}: {}\n", link.text, link.url));
                    }
                }
                Ok(FetchedSource::PageText(text))
            }
        }
    }
}

// ── Orchestrator ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct RunOutcome {
    pub jobs: Vec<CanonicalJob>,
    pub errors: Vec<String>,
    pub stats: FilterStats,
    pub plan: Vec<PlanEntry>,
}

pub struct Orchestrator<'a> {
    fetch: &'a dyn SourceFetch,
    service: &'a dyn ExtractionService,
    max_age_days: i64,
    skip_normalization: bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        fetch: &'a dyn SourceFetch,
        service: &'a dyn ExtractionService,
        max_age_days: i64,
        skip_normalization: bool,
    ) -> Self {
        Self {
            fetch,
            service,
            max_age_days,
            skip_normalization,
        }
    }

    /// Run the whole pipeline over the configured sources. A failing source
    /// records an error and marks its plan entry failed; the loop keeps
    /// going, so one bad source never costs the others.
    pub async fn run(&self, sources: &[Source]) -> RunOutcome {
        debug!(phase = ?Phase::Init, sources = sources.len(), "starting run");
        let mut state = PipelineState::new(sources);
        if state.plan.is_empty() {
            state.errors.push("no sources configured".to_string());
        }
        debug!(phase = ?Phase::Planned, entries = state.plan.len(), "plan built");

        let normalizer = Normalizer::new(self.service, self.skip_normalization);

        while state.current_index < state.plan.len() {
            let index = state.current_index;
            let source = state.plan[index].source.clone();
            debug!(phase = ?Phase::Fetching(index), source = %source.name, "fetching source");

            match self.fetch.fetch(&source).await {
                Ok(FetchedSource::Records(records)) => {
                    replace(&mut state.fetched_records, records);
                }
                Ok(FetchedSource::PageText(text)) => {
                    replace(&mut state.page_text, text);
                }
                Err(err) => {
                    warn!(source = %source.name, error = %err, "source fetch failed");
                    state.mark_current(PlanStatus::Failed);
                    state.absorb(Vec::new(), vec![format!("{}: {err:#}", source.name)]);
                    match should_continue(index, state.plan.len()) {
                        Transition::Advance => {
                            state.advance();
                            continue;
                        }
                        Transition::Dedup => break,
                    }
                }
            }

            debug!(phase = ?Phase::Normalizing(index), source = %source.name, "normalizing source");
            match source.kind {
                SourceKind::Api => {
                    let records = std::mem::take(&mut state.fetched_records);
                    let jobs = normalizer.finish_structured(records, &source);
                    info!(source = %source.name, jobs = jobs.len(), "source complete");
                    state.mark_current(PlanStatus::Done);
                    state.absorb(jobs, Vec::new());
                }
                SourceKind::Html => {
                    let text = std::mem::take(&mut state.page_text);
                    match normalizer.normalize_page_text(&text, &source).await {
                        Ok(jobs) => {
                            info!(source = %source.name, jobs = jobs.len(), "source complete");
                            state.mark_current(PlanStatus::Done);
                            state.absorb(jobs, Vec::new());
                        }
                        Err(err) => {
                            warn!(source = %source.name, error = %err, "normalization failed");
                            state.mark_current(PlanStatus::Failed);
                            state.absorb(Vec::new(), vec![format!("{}: {err:#}", source.name)]);
                        }
                    }
                }
            }

            match should_continue(index, state.plan.len()) {
                Transition::Advance => state.advance(),
                Transition::Dedup => break,
            }
        }

        debug!(
            phase = ?Phase::Deduping,
            candidates = state.normalized_jobs.len(),
            "filtering merged records"
        );
        let (jobs, stats) = filter_jobs(
            std::mem::take(&mut state.normalized_jobs),
            Utc::now(),
            self.max_age_days,
        );
        debug!(phase = ?Phase::Done, jobs = jobs.len(), "run finished");

        RunOutcome {
            jobs,
            errors: state.errors,
            stats,
            plan: state.plan,
        }
    }
}

// ── Scheduler & notification ────────────────────────────────────────────

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, new_jobs: &[CanonicalJob]) -> anyhow::Result<()>;
}

/// Default notifier: new postings are announced on the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, new_jobs: &[CanonicalJob]) -> anyhow::Result<()> {
        for job in new_jobs {
            info!(
                title = %job.title,
                company = %job.company,
                location = %job.location,
                url = %job.url,
                "new job posting"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_jobs: usize,
    pub new_jobs: usize,
    pub inserted: u64,
    pub stats: FilterStats,
    pub errors: Vec<String>,
}

/// One scheduled cycle: run the pipeline, diff against the ledger, notify,
/// then persist. The unseen set is computed before `mark_seen`; reversing
/// that order would make every posting look already-known.
pub async fn run_cycle(
    orchestrator: &Orchestrator<'_>,
    sources: &[Source],
    ledger: &SeenJobLedger,
    notifier: &dyn Notifier,
) -> anyhow::Result<CycleSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let outcome = orchestrator.run(sources).await;

    let new_jobs = ledger
        .get_new(&outcome.jobs)
        .await
        .context("diffing against seen-job ledger")?;
    let inserted = ledger
        .mark_seen(&outcome.jobs)
        .await
        .context("recording jobs in seen-job ledger")?;

    if new_jobs.is_empty() {
        info!(%run_id, "no new postings this cycle");
    } else if let Err(err) = notifier.notify(&new_jobs).await {
        warn!(%run_id, error = %err, "notification failed");
    }

    Ok(CycleSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        total_jobs: outcome.jobs.len(),
        new_jobs: new_jobs.len(),
        inserted,
        stats: outcome.stats,
        errors: outcome.errors,
    })
}

/// Fixed-interval scheduler. A failed cycle is logged and the next one
/// still runs on schedule; Ctrl-C stops the loop between cycles.
pub async fn run_scheduled(
    orchestrator: &Orchestrator<'_>,
    sources: &[Source],
    ledger: &SeenJobLedger,
    notifier: &dyn Notifier,
    interval: StdDuration,
) -> anyhow::Result<()> {
    loop {
        match run_cycle(orchestrator, sources, ledger, notifier).await {
            Ok(summary) => info!(
                run_id = %summary.run_id,
                total = summary.total_jobs,
                new = summary.new_jobs,
                errors = summary.errors.len(),
                "cycle complete"
            ),
            Err(err) => error!(error = %err, "cycle failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping scheduler");
                break;
            }
        }
    }
    Ok(())
}

// ── Test doubles ────────────────────────────────────────────────────────

pub mod testing {
    //! Doubles for the extraction-service and source-fetch seams.

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use jobscout_core::Source;

    use super::{ExtractionService, FetchedSource, SourceFetch};

    /// Replays scripted payloads in order; once the script runs out it
    /// echoes each request's input back, which acts as an identity
    /// normalization.
    pub struct ScriptedExtractionService {
        script: Mutex<VecDeque<anyhow::Result<String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedExtractionService {
        pub fn new(script: Vec<anyhow::Result<String>>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn echo() -> Self {
            Self::new(Vec::new())
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next(&self, fallback: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let popped = self
                .script
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front();
            match popped {
                Some(result) => result,
                None => Ok(fallback.to_string()),
            }
        }
    }

    #[async_trait]
    impl ExtractionService for ScriptedExtractionService {
        async fn extract_jobs(&self, page_text: &str, _source: &Source) -> anyhow::Result<String> {
            self.next(page_text)
        }

        async fn normalize_batch(
            &self,
            jobs_json: &str,
            _source: &Source,
        ) -> anyhow::Result<String> {
            self.next(jobs_json)
        }
    }

    /// Scripted per-source fetch results, consumed in call order.
    pub struct ScriptedSourceFetch {
        script: Mutex<VecDeque<anyhow::Result<FetchedSource>>>,
    }

    impl ScriptedSourceFetch {
        pub fn new(script: Vec<anyhow::Result<FetchedSource>>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl SourceFetch for ScriptedSourceFetch {
        async fn fetch(&self, source: &Source) -> anyhow::Result<FetchedSource> {
            self.script
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("no scripted fetch result for {}", source.name)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ScriptedExtractionService, ScriptedSourceFetch};
    use super::*;

    fn job(title: &str, company: &str, location: &str) -> CanonicalJob {
        CanonicalJob {
            title: title.to_string(),
            company: company.to_string(),
            location: location.to_string(),
            url: format!("https://example.com/{title}"),
            source: "Test".to_string(),
            ..CanonicalJob::default()
        }
    }

    fn dated(title: &str, posted: DateTime<Utc>) -> CanonicalJob {
        CanonicalJob {
            date_posted: Some(posted.format("%Y-%m-%dT%H:%M:%S+0000").to_string()),
            ..job(title, "Acme", "NYC")
        }
    }

    fn extraction_payload(titles: &[&str]) -> String {
        let items: Vec<JsonValue> = titles
            .iter()
            .map(|t| json!({"title": t, "company": "Acme", "location": "NYC"}))
            .collect();
        serde_json::to_string(&items).unwrap()
    }

    #[test]
    fn filter_counters_partition_the_input() {
        let now = Utc::now();
        let input = vec![
            dated("Fresh", now - Duration::days(1)),
            dated("Stale", now - Duration::days(3)),
            job("Engineer", "Acme", "NYC"),
            job("engineer", "ACME", "nyc"),
            job("", "Acme", "NYC"),
            CanonicalJob {
                date_posted: Some("last week".to_string()),
                ..job("Undated", "Acme", "NYC")
            },
        ];
        let input_count = input.len();
        let (kept, stats) = filter_jobs(input, now, DEFAULT_MAX_AGE_DAYS);

        assert_eq!(
            stats.filtered_by_date + stats.duplicates_removed + stats.final_count,
            input_count
        );
        assert_eq!(stats.filtered_by_date, 1);
        assert_eq!(stats.duplicates_removed, 2);
        assert_eq!(kept.len(), stats.final_count);
    }

    #[test]
    fn freshness_keeps_recent_and_unparseable_dates() {
        let now = Utc::now();
        let input = vec![
            dated("Recent", now - Duration::days(1)),
            dated("Old", now - Duration::days(3)),
            CanonicalJob {
                date_posted: Some("posted recently".to_string()),
                ..job("Vague", "Acme", "NYC")
            },
            job("Undated", "Beta", "LA"),
        ];
        let (kept, stats) = filter_jobs(input, now, DEFAULT_MAX_AGE_DAYS);

        let titles: Vec<&str> = kept.iter().map(|j| j.title.as_str()).collect();
        assert_eq!(titles, vec!["Recent", "Vague", "Undated"]);
        assert_eq!(stats.filtered_by_date, 1);
    }

    #[test]
    fn duplicates_collapse_across_case_and_whitespace() {
        let now = Utc::now();
        let input = vec![
            job("Engineer", "Acme", "New York"),
            job(" engineer ", "ACME", "new york"),
        ];
        let (kept, stats) = filter_jobs(input, now, DEFAULT_MAX_AGE_DAYS);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].title, "Engineer");
        assert_eq!(stats.duplicates_removed, 1);
    }

    #[test]
    fn filter_is_idempotent() {
        let now = Utc::now();
        let input = vec![
            dated("Fresh", now - Duration::days(1)),
            dated("Stale", now - Duration::days(5)),
            job("Engineer", "Acme", "NYC"),
            job("Engineer", "Acme", "NYC"),
        ];
        let (first, _) = filter_jobs(input, now, DEFAULT_MAX_AGE_DAYS);
        let (second, stats) = filter_jobs(first.clone(), now, DEFAULT_MAX_AGE_DAYS);

        assert_eq!(first, second);
        assert_eq!(stats.filtered_by_date, 0);
        assert_eq!(stats.duplicates_removed, 0);
    }

    #[test]
    fn rfc3339_dates_also_parse() {
        assert!(parse_posted_date("2026-02-13T10:00:00+0000").is_some());
        assert!(parse_posted_date("2026-02-13T10:00:00Z").is_some());
        assert!(parse_posted_date("2026-02-13T10:00:00+00:00").is_some());
        assert!(parse_posted_date("February 13").is_none());
    }

    #[test]
    fn payload_parsing_strips_fences_and_chatter() {
        let fenced = "Here you go:\n```json\n[{\"title\": \"Engineer\"}]\n```\nDone.";
        let drafts = parse_service_payload(fenced);
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].title.as_deref(), Some("Engineer"));

        let bare_object = "{\"title\": \"Solo\"}";
        assert_eq!(parse_service_payload(bare_object).len(), 1);

        assert!(parse_service_payload("no structured data here").is_empty());
    }

    #[test]
    fn should_continue_advances_until_plan_is_exhausted() {
        assert_eq!(should_continue(0, 3), Transition::Advance);
        assert_eq!(should_continue(1, 3), Transition::Advance);
        assert_eq!(should_continue(2, 3), Transition::Dedup);
        assert_eq!(should_continue(0, 1), Transition::Dedup);
    }

    #[test]
    fn advancing_clears_per_source_buffers_only() {
        let sources = vec![Source::html("A", "https://a.example"), Source::html("B", "https://b.example")];
        let mut state = PipelineState::new(&sources);
        state.page_text = "leftover".to_string();
        state.fetched_records = vec![job("Engineer", "Acme", "NYC")];
        state.absorb(vec![job("Kept", "Acme", "NYC")], vec!["err".to_string()]);

        state.advance();

        assert_eq!(state.current_index, 1);
        assert!(state.page_text.is_empty());
        assert!(state.fetched_records.is_empty());
        assert_eq!(state.normalized_jobs.len(), 1);
        assert_eq!(state.errors.len(), 1);
    }

    #[test]
    fn registry_parsing_maps_kinds_and_api_urls() {
        let yaml = r#"
career_pages:
  - name: "Amazon Jobs"
    url: "https://www.amazon.jobs"
    type: "api"
    api_url: "https://www.amazon.jobs/en/search.json"
  - name: "Acme Careers"
    url: "https://acme.example/careers"
"#;
        let sources = parse_source_registry(yaml).expect("parse");
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].kind, SourceKind::Api);
        assert_eq!(
            sources[0].api_url.as_deref(),
            Some("https://www.amazon.jobs/en/search.json")
        );
        assert_eq!(sources[1].kind, SourceKind::Html);
        assert_eq!(sources[1].api_url, None);
    }

    #[tokio::test]
    async fn extraction_retries_once_on_empty_result() {
        let service = ScriptedExtractionService::new(vec![
            Ok("[]".to_string()),
            Ok(extraction_payload(&["Engineer"])),
        ]);
        let normalizer = Normalizer::new(&service, true);
        let source = Source::html("Acme Careers", "https://acme.example/careers");

        let jobs = normalizer
            .normalize_page_text("Open roles: Engineer", &source)
            .await
            .expect("normalize");

        assert_eq!(service.calls(), 2);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].source, "Acme Careers");
        assert_eq!(jobs[0].url, "https://acme.example/careers");
    }

    #[tokio::test]
    async fn extraction_failure_on_final_attempt_surfaces() {
        let service = ScriptedExtractionService::new(vec![
            Err(anyhow!("connection refused")),
            Err(anyhow!("connection refused")),
        ]);
        let normalizer = Normalizer::new(&service, true);
        let source = Source::html("Acme Careers", "https://acme.example/careers");

        let result = normalizer.normalize_page_text("some text", &source).await;
        assert!(result.is_err());
        assert_eq!(service.calls(), 2);
    }

    #[tokio::test]
    async fn empty_page_text_is_an_error() {
        let service = ScriptedExtractionService::echo();
        let normalizer = Normalizer::new(&service, true);
        let source = Source::html("Acme Careers", "https://acme.example/careers");

        assert!(normalizer.normalize_page_text("   ", &source).await.is_err());
        assert_eq!(service.calls(), 0);
    }

    #[tokio::test]
    async fn normalization_batches_by_three() {
        let titles: Vec<String> = (0..7).map(|i| format!("Role {i}")).collect();
        let title_refs: Vec<&str> = titles.iter().map(String::as_str).collect();
        // One scripted extraction response; the echo fallback then acts as
        // an identity normalization for every batch.
        let service =
            ScriptedExtractionService::new(vec![Ok(extraction_payload(&title_refs))]);
        let normalizer = Normalizer::new(&service, false);
        let source = Source::html("Acme Careers", "https://acme.example/careers");

        let jobs = normalizer
            .normalize_page_text("Open roles", &source)
            .await
            .expect("normalize");

        assert_eq!(jobs.len(), 7);
        // 1 extraction call + ceil(7 / 3) = 3 normalization calls.
        assert_eq!(service.calls(), 4);
    }

    #[tokio::test]
    async fn bad_batch_response_keeps_original_records() {
        let service = ScriptedExtractionService::new(vec![
            Ok(extraction_payload(&["A", "B", "C"])),
            Ok("the model rambled instead of returning JSON".to_string()),
        ]);
        let normalizer = Normalizer::new(&service, false);
        let source = Source::html("Acme Careers", "https://acme.example/careers");

        let jobs = normalizer
            .normalize_page_text("Open roles", &source)
            .await
            .expect("normalize");

        let titles: Vec<&str> = jobs.iter().map(|j| j.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn one_failing_source_does_not_stop_the_run() {
        let sources = vec![
            Source::api("Broken API", "https://broken.example", "https://broken.example/api"),
            Source::api("Amazon Jobs", "https://www.amazon.jobs", "https://www.amazon.jobs/en/search.json"),
        ];
        let fetch = ScriptedSourceFetch::new(vec![
            Err(anyhow!("503 from upstream")),
            Ok(FetchedSource::Records(vec![job("Engineer", "Amazon", "Seattle, WA")])),
        ]);
        let service = ScriptedExtractionService::echo();
        let orchestrator = Orchestrator::new(&fetch, &service, DEFAULT_MAX_AGE_DAYS, false);

        let outcome = orchestrator.run(&sources).await;

        assert_eq!(outcome.jobs.len(), 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("Broken API"));
        assert_eq!(outcome.plan[0].status, PlanStatus::Failed);
        assert_eq!(outcome.plan[1].status, PlanStatus::Done);
    }

    #[tokio::test]
    async fn run_merges_and_dedups_across_sources() {
        let sources = vec![
            Source::api("Board A", "https://a.example", "https://a.example/api"),
            Source::api("Board B", "https://b.example", "https://b.example/api"),
        ];
        let fetch = ScriptedSourceFetch::new(vec![
            Ok(FetchedSource::Records(vec![
                job("Engineer", "Acme", "NYC"),
                job("Designer", "Acme", "NYC"),
            ])),
            Ok(FetchedSource::Records(vec![job(" ENGINEER ", "acme", "nyc")])),
        ]);
        let service = ScriptedExtractionService::echo();
        let orchestrator = Orchestrator::new(&fetch, &service, DEFAULT_MAX_AGE_DAYS, false);

        let outcome = orchestrator.run(&sources).await;

        assert_eq!(outcome.jobs.len(), 2);
        assert_eq!(outcome.stats.duplicates_removed, 1);
        assert!(outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn second_cycle_reports_nothing_new() {
        let sources = vec![Source::api("Board", "https://x.example", "https://x.example/api")];
        let ledger = SeenJobLedger::in_memory().await.expect("ledger");
        let service = ScriptedExtractionService::echo();
        let records = vec![job("Engineer", "Acme", "NYC")];

        let fetch = ScriptedSourceFetch::new(vec![Ok(FetchedSource::Records(records.clone()))]);
        let orchestrator = Orchestrator::new(&fetch, &service, DEFAULT_MAX_AGE_DAYS, false);
        let first = run_cycle(&orchestrator, &sources, &ledger, &LogNotifier)
            .await
            .expect("first cycle");
        assert_eq!(first.new_jobs, 1);
        assert_eq!(first.inserted, 1);

        let fetch = ScriptedSourceFetch::new(vec![Ok(FetchedSource::Records(records))]);
        let orchestrator = Orchestrator::new(&fetch, &service, DEFAULT_MAX_AGE_DAYS, false);
        let second = run_cycle(&orchestrator, &sources, &ledger, &LogNotifier)
            .await
            .expect("second cycle");
        assert_eq!(second.total_jobs, 1);
        assert_eq!(second.new_jobs, 0);
        assert_eq!(second.inserted, 0);
    }
}
