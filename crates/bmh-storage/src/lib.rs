//! Persisted identity ledger + rate-limited HTTP client utilities for BMH.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use bmh_core::{IdentityKey, Source};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bmh-storage";

/// Identity keys admitted for one business across all previous runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerDocument {
    pub business_id: Uuid,
    pub business_name: String,
    pub updated_at: DateTime<Utc>,
    pub keys: BTreeSet<IdentityKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerWrite {
    pub added: usize,
    pub total: usize,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger document {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Persistence collaborator used to seed and extend a job's identity index.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load_keys(&self, business_id: Uuid) -> Result<HashSet<IdentityKey>, LedgerError>;

    async fn record_keys(
        &self,
        business_id: Uuid,
        business_name: &str,
        keys: &[IdentityKey],
    ) -> Result<LedgerWrite, LedgerError>;
}

/// One JSON document per business, replaced atomically on every merge.
#[derive(Debug)]
pub struct FileLedgerStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileLedgerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_path(&self, business_id: Uuid) -> PathBuf {
        self.root.join(format!("{business_id}.json"))
    }

    pub async fn load_document(&self, business_id: Uuid) -> Result<Option<LedgerDocument>, LedgerError> {
        let path = self.document_path(business_id);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(LedgerError::Io { path, source }),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| LedgerError::Malformed { path, source })
    }

    async fn write_document(&self, doc: &LedgerDocument) -> Result<(), LedgerError> {
        let path = self.document_path(doc.business_id);
        fs::create_dir_all(&self.root)
            .await
            .map_err(|source| LedgerError::Io {
                path: self.root.clone(),
                source,
            })?;

        let bytes = serde_json::to_vec_pretty(doc).map_err(|source| LedgerError::Malformed {
            path: path.clone(),
            source,
        })?;
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(source) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(LedgerError::Io { path, source });
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for FileLedgerStore {
    async fn load_keys(&self, business_id: Uuid) -> Result<HashSet<IdentityKey>, LedgerError> {
        Ok(self
            .load_document(business_id)
            .await?
            .map(|doc| doc.keys.into_iter().collect())
            .unwrap_or_default())
    }

    async fn record_keys(
        &self,
        business_id: Uuid,
        business_name: &str,
        keys: &[IdentityKey],
    ) -> Result<LedgerWrite, LedgerError> {
        let _guard = self.write_lock.lock().await;
        let existing = self.load_document(business_id).await?;
        let is_new = existing.is_none();
        let mut doc = existing.unwrap_or_else(|| LedgerDocument {
            business_id,
            business_name: business_name.to_string(),
            updated_at: Utc::now(),
            keys: BTreeSet::new(),
        });

        let before = doc.keys.len();
        doc.keys.extend(keys.iter().cloned());
        let added = doc.keys.len() - before;
        if added == 0 && !is_new {
            return Ok(LedgerWrite {
                added,
                total: doc.keys.len(),
            });
        }

        doc.business_name = business_name.to_string();
        doc.updated_at = Utc::now();
        self.write_document(&doc).await?;
        debug!(%business_id, added, total = doc.keys.len(), "ledger updated");
        Ok(LedgerWrite {
            added,
            total: doc.keys.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

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
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 12,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Outbound request budget: `burst` requests at once, then one more every
/// `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub burst: u32,
    pub refill_every: Duration,
}

/// Shared limiter that `post_json` waits on before each remote call.
#[derive(Debug)]
pub struct RequestRateLimiter {
    config: RateLimitConfig,
    state: Mutex<RateState>,
}

#[derive(Debug, Clone, Copy)]
struct RateState {
    available: u32,
    next_refill: Instant,
}

impl RequestRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let config = RateLimitConfig {
            burst: config.burst.max(1),
            refill_every: config.refill_every.max(Duration::from_millis(1)),
        };
        Self {
            config,
            state: Mutex::new(RateState {
                available: config.burst,
                next_refill: Instant::now() + config.refill_every,
            }),
        }
    }

    /// Wait until a request slot is free and claim it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if now >= state.next_refill {
                    let period = self.config.refill_every;
                    let behind = (now - state.next_refill).as_nanos() / period.as_nanos();
                    let refills = u32::try_from(behind).unwrap_or(u32::MAX).saturating_add(1);
                    state.available = state.available.saturating_add(refills).min(self.config.burst);
                    state.next_refill = now + period;
                }
                if state.available > 0 {
                    state.available -= 1;
                    return;
                }
                state.next_refill.saturating_duration_since(now)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http client is shutting down")]
    Closed,
}

/// Shared client used by remote fetchers; bounded globally and per source.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<Source, Arc<Semaphore>>>,
    rate_limiter: Option<RequestRateLimiter>,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let rate_limiter = config.rate_limit.map(RequestRateLimiter::new);

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            rate_limiter,
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source: Source) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// POST a JSON body and decode a JSON response, retrying transient failures.
    pub async fn post_json<B, R>(
        &self,
        job_id: Uuid,
        source: Source,
        url: &str,
        body: &B,
    ) -> Result<R, HttpError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| HttpError::Closed)?;
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await.map_err(|_| HttpError::Closed)?;

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        let span = info_span!("http_post", %job_id, %source, url);
        self.post_with_retries(url, body).instrument(span).await
    }

    async fn post_with_retries<B, R>(&self, url: &str, body: &B) -> Result<R, HttpError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.post(url).json(body).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return resp.json::<R>().await.map_err(|source| HttpError::Decode {
                            url: final_url,
                            source,
                        });
                    }

                    if classify_status(status) == RetryDisposition::NonRetryable || !can_retry {
                        return Err(HttpError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    debug!(status = status.as_u16(), attempt, "retrying after status");
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable || !can_retry {
                        return Err(HttpError::Request {
                            url: url.to_string(),
                            source: err,
                        });
                    }
                    debug!(error = %err, attempt, "retrying after transport error");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{extract::State, http::StatusCode as AxumStatus, routing::post, Json, Router};
    use tempfile::tempdir;

    #[tokio::test]
    async fn ledger_merges_keys_across_writes() {
        let dir = tempdir().expect("tempdir");
        let store = FileLedgerStore::new(dir.path().join("ledger"));
        let business_id = Uuid::new_v4();

        assert!(store.load_keys(business_id).await.unwrap().is_empty());

        let first = store
            .record_keys(
                business_id,
                "Acme",
                &[
                    IdentityKey::native(Source::Google, "a"),
                    IdentityKey::native(Source::Google, "b"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(first, LedgerWrite { added: 2, total: 2 });

        let second = store
            .record_keys(
                business_id,
                "Acme",
                &[
                    IdentityKey::native(Source::Google, "b"),
                    IdentityKey::url(Some(Source::Reddit), "reddit.com/r/acme"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(second, LedgerWrite { added: 1, total: 3 });

        let keys = store.load_keys(business_id).await.unwrap();
        assert!(keys.contains(&IdentityKey::url(Some(Source::Reddit), "reddit.com/r/acme")));
        assert_eq!(keys.len(), 3);
        assert!(store.document_path(business_id).exists());
    }

    #[tokio::test]
    async fn malformed_ledger_document_is_reported() {
        let dir = tempdir().expect("tempdir");
        let store = FileLedgerStore::new(dir.path());
        let business_id = Uuid::new_v4();
        std::fs::write(store.document_path(business_id), b"{not json").unwrap();

        let err = store.load_keys(business_id).await.unwrap_err();
        assert!(matches!(err, LedgerError::Malformed { .. }));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn rate_limiter_allows_a_burst_then_waits_for_refill() {
        let limiter = RequestRateLimiter::new(RateLimitConfig {
            burst: 2,
            refill_every: Duration::from_millis(120),
        });
        let started = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(started.elapsed() < Duration::from_millis(100));

        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    async fn spawn_flaky_server(failures: usize) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/items",
                post(
                    move |State(hits): State<Arc<AtomicUsize>>, Json(body): Json<serde_json::Value>| async move {
                        let n = hits.fetch_add(1, Ordering::SeqCst);
                        if n < failures {
                            return Err(AxumStatus::SERVICE_UNAVAILABLE);
                        }
                        Ok(Json(serde_json::json!({ "echo": body, "attempt": n })))
                    },
                ),
            )
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}/items"), hits)
    }

    fn fast_client(max_retries: usize) -> HttpClient {
        HttpClient::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn post_json_retries_transient_statuses() {
        let (url, hits) = spawn_flaky_server(2).await;
        let client = fast_client(3);
        let resp: serde_json::Value = client
            .post_json(Uuid::new_v4(), Source::Reddit, &url, &serde_json::json!({"q": "acme"}))
            .await
            .unwrap();
        assert_eq!(resp["echo"]["q"], "acme");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn post_json_waits_on_the_rate_limit() {
        let (url, hits) = spawn_flaky_server(0).await;
        let client = HttpClient::new(HttpClientConfig {
            rate_limit: Some(RateLimitConfig {
                burst: 1,
                refill_every: Duration::from_millis(150),
            }),
            ..Default::default()
        })
        .unwrap();

        let started = Instant::now();
        for _ in 0..3 {
            let _: serde_json::Value = client
                .post_json(Uuid::new_v4(), Source::Internet, &url, &serde_json::json!({}))
                .await
                .unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(280));
    }

    #[tokio::test]
    async fn post_json_gives_up_after_retry_budget() {
        let (url, hits) = spawn_flaky_server(10).await;
        let client = fast_client(1);
        let err = client
            .post_json::<_, serde_json::Value>(Uuid::new_v4(), Source::Youtube, &url, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::HttpStatus { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
