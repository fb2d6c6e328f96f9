//! HTTP fetch utilities with retry/backoff + the persistent seen-job ledger.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use jobscout_core::CanonicalJob;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info_span};

pub const CRATE_NAME: &str = "jobscout-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 5xx and 429 are transient; any other non-2xx is a permanent failure for
/// the current source.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retry timing separated from the execution loop so it can be tested
/// without real sleeps.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Exponential: base * 2^attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!(
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) ",
                "AppleWebKit/537.36 (KHTML, like Gecko) ",
                "Chrome/120.0.0.0 Safari/537.36"
            )
            .to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response body for {url}: {message}")]
    Decode { url: String, message: String },
}

enum RequestSpec<'a> {
    GetJson(&'a [(String, String)]),
    PostJson(&'a JsonValue),
    GetText,
}

enum FetchedBody {
    Json(JsonValue),
    Text(String),
}

/// Thin reqwest wrapper applying the retry policy. Transient failures are
/// retried with backoff sleeps; everything else surfaces immediately as a
/// `FetchError` the caller accumulates per source.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get_json(
        &self,
        source: &str,
        url: &str,
        params: &[(String, String)],
    ) -> Result<JsonValue, FetchError> {
        match self
            .fetch_with_retry(source, url, RequestSpec::GetJson(params))
            .await?
        {
            FetchedBody::Json(value) => Ok(value),
            FetchedBody::Text(_) => unreachable!("json request yields json body"),
        }
    }

    pub async fn post_json(
        &self,
        source: &str,
        url: &str,
        body: &JsonValue,
    ) -> Result<JsonValue, FetchError> {
        match self
            .fetch_with_retry(source, url, RequestSpec::PostJson(body))
            .await?
        {
            FetchedBody::Json(value) => Ok(value),
            FetchedBody::Text(_) => unreachable!("json request yields json body"),
        }
    }

    pub async fn get_text(&self, source: &str, url: &str) -> Result<String, FetchError> {
        match self
            .fetch_with_retry(source, url, RequestSpec::GetText)
            .await?
        {
            FetchedBody::Text(text) => Ok(text),
            FetchedBody::Json(_) => unreachable!("text request yields text body"),
        }
    }

    async fn fetch_with_retry(
        &self,
        source: &str,
        url: &str,
        spec: RequestSpec<'_>,
    ) -> Result<FetchedBody, FetchError> {
        let span = info_span!("http_fetch", source, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let request = match &spec {
                RequestSpec::GetJson(params) => self
                    .client
                    .get(url)
                    .query(params)
                    .header("Accept", "application/json"),
                RequestSpec::PostJson(body) => self.client.post(url).json(body),
                RequestSpec::GetText => self.client.get(url).header(
                    "Accept",
                    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                ),
            };

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return match spec {
                            RequestSpec::GetText => Ok(FetchedBody::Text(resp.text().await?)),
                            _ => {
                                let text = resp.text().await?;
                                let value =
                                    serde_json::from_str(&text).map_err(|e| FetchError::Decode {
                                        url: final_url,
                                        message: e.to_string(),
                                    })?;
                                Ok(FetchedBody::Json(value))
                            }
                        };
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, status = status.as_u16(), "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, error = %err, "retrying after request error");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger storage unavailable: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Persistent set of identity keys already surfaced in earlier cycles.
/// Entries are created on first observation and never updated or deleted;
/// the ledger only grows. The UNIQUE constraint on `dedup_key` is the sole
/// consistency guarantee, so record-at-a-time inserts stay safe across an
/// interrupted cycle.
#[derive(Debug, Clone)]
pub struct SeenJobLedger {
    pool: SqlitePool,
}

impl SeenJobLedger {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let ledger = Self { pool };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    pub async fn in_memory() -> Result<Self, LedgerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let ledger = Self { pool };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    async fn init_schema(&self) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS seen_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                dedup_key TEXT UNIQUE NOT NULL,
                title TEXT,
                company TEXT,
                url TEXT,
                first_seen_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_dedup_key ON seen_jobs(dedup_key)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Subset of `jobs` whose identity key is not in the ledger. Pure read.
    pub async fn get_new(&self, jobs: &[CanonicalJob]) -> Result<Vec<CanonicalJob>, LedgerError> {
        let mut new_jobs = Vec::new();
        for job in jobs {
            let seen = sqlx::query("SELECT 1 FROM seen_jobs WHERE dedup_key = ?1")
                .bind(job.identity_key())
                .fetch_optional(&self.pool)
                .await?;
            if seen.is_none() {
                new_jobs.push(job.clone());
            }
        }
        Ok(new_jobs)
    }

    /// Insert each job's identity key if absent. Idempotent: re-inserting a
    /// present key is a no-op, never an error. Returns the number of rows
    /// actually inserted.
    pub async fn mark_seen(&self, jobs: &[CanonicalJob]) -> Result<u64, LedgerError> {
        let now = Utc::now().to_rfc3339();
        let mut inserted = 0u64;
        for job in jobs {
            let result = sqlx::query(
                r#"
                INSERT INTO seen_jobs (dedup_key, title, company, url, first_seen_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(dedup_key) DO NOTHING
                "#,
            )
            .bind(job.identity_key())
            .bind(&job.title)
            .bind(&job.company)
            .bind(&job.url)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    pub async fn seen_count(&self) -> Result<i64, LedgerError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM seen_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(title: &str, company: &str, location: &str) -> CanonicalJob {
        CanonicalJob {
            title: title.to_string(),
            company: company.to_string(),
            location: location.to_string(),
            url: format!("https://example.com/{title}"),
            ..CanonicalJob::default()
        }
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(4));
    }

    #[test]
    fn status_classification_keeps_permanent_failures_out_of_retries() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn ledger_round_trip_returns_only_unseen_jobs() {
        let ledger = SeenJobLedger::in_memory().await.expect("ledger");
        let a = job("Engineer", "Acme", "NYC");
        let b = job("Designer", "Acme", "NYC");

        ledger.mark_seen(&[a.clone()]).await.expect("mark");
        let new_jobs = ledger
            .get_new(&[a.clone(), b.clone()])
            .await
            .expect("get_new");
        assert_eq!(new_jobs, vec![b]);
    }

    #[tokio::test]
    async fn mark_seen_is_idempotent() {
        let ledger = SeenJobLedger::in_memory().await.expect("ledger");
        let a = job("Engineer", "Acme", "NYC");

        assert_eq!(ledger.mark_seen(&[a.clone()]).await.expect("first"), 1);
        assert_eq!(ledger.mark_seen(&[a.clone()]).await.expect("second"), 0);
        assert_eq!(ledger.seen_count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn ledger_key_matches_dedup_semantics() {
        let ledger = SeenJobLedger::in_memory().await.expect("ledger");
        ledger
            .mark_seen(&[job("Engineer", "Acme", "NYC")])
            .await
            .expect("mark");
        let new_jobs = ledger
            .get_new(&[job(" engineer ", "ACME", "nyc")])
            .await
            .expect("get_new");
        assert!(new_jobs.is_empty());
    }

    #[tokio::test]
    async fn ledger_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("scout.db");
        {
            let ledger = SeenJobLedger::open(&path).await.expect("open");
            ledger
                .mark_seen(&[job("Engineer", "Acme", "NYC")])
                .await
                .expect("mark");
        }
        let reopened = SeenJobLedger::open(&path).await.expect("reopen");
        assert_eq!(reopened.seen_count().await.expect("count"), 1);
    }
}
