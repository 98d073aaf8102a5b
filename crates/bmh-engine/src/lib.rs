//! Job orchestration, deduplication and progress reporting for BMH.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bmh_core::{
    BusinessDescriptor, CanonicalItem, DescriptorError, IdentityKey, JobState, RawItem, Source,
    SourceProgress, SourceStatus, SourceTarget,
};
use bmh_fetchers::{
    build_fetcher_set, BudgetTable, FetchBudget, FetchContext, FetcherSet, SourceFetcher, SourceRegistry,
};
use bmh_storage::{FileLedgerStore, HttpClient, HttpClientConfig, LedgerStore, RateLimitConfig};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "bmh-engine";

const FINGERPRINT_TEXT_CHARS: usize = 280;

const TRACKING_PARAMS: &[&str] = &[
    "fbclid",
    "gclid",
    "dclid",
    "msclkid",
    "yclid",
    "mc_cid",
    "mc_eid",
    "igshid",
    "_ga",
    "_gl",
    "ref_src",
    "si",
    "sessionid",
    "session_id",
    "sid",
    "jsessionid",
    "phpsessid",
    "clickid",
    "click_id",
];

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),
    #[error("Job not found")]
    NotFound { job_id: Uuid },
    #[error("invalid job transition from {from} to {to}")]
    InvalidTransition { from: JobState, to: JobState },
    #[error("all sources failed: {failed} of {attempted} dispatched sources returned errors and no items were collected")]
    AllSourcesFailed { failed: usize, attempted: usize },
}

impl From<DescriptorError> for EngineError {
    fn from(err: DescriptorError) -> Self {
        EngineError::Validation(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workspace_root: PathBuf,
    pub ledger_dir: PathBuf,
    pub ledger_enabled: bool,
    pub max_items_per_source: usize,
    pub source_ceiling_secs: u64,
    pub url_keys_per_source: bool,
    pub cleanup_enabled: bool,
    pub cleanup_cron: String,
    pub cleanup_max_age_hours: f64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_rate_burst: Option<u32>,
    pub http_rate_refill_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            ledger_dir: PathBuf::from("./ledger"),
            ledger_enabled: false,
            max_items_per_source: 100,
            source_ceiling_secs: 600,
            url_keys_per_source: false,
            cleanup_enabled: false,
            cleanup_cron: "0 0 * * * *".to_string(),
            cleanup_max_age_hours: 24.0,
            user_agent: "bmh-bot/0.1".to_string(),
            http_timeout_secs: 30,
            http_rate_burst: None,
            http_rate_refill_ms: 1000,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: std::env::var("BMH_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            ledger_dir: std::env::var("BMH_LEDGER_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.ledger_dir),
            ledger_enabled: env_flag("BMH_LEDGER_ENABLED"),
            max_items_per_source: env_parse("BMH_MAX_ITEMS_PER_SOURCE")
                .unwrap_or(defaults.max_items_per_source),
            source_ceiling_secs: env_parse("BMH_SOURCE_CEILING_SECS").unwrap_or(defaults.source_ceiling_secs),
            url_keys_per_source: env_flag("BMH_URL_KEYS_PER_SOURCE"),
            cleanup_enabled: env_flag("BMH_CLEANUP_ENABLED"),
            cleanup_cron: std::env::var("BMH_CLEANUP_CRON").unwrap_or(defaults.cleanup_cron),
            cleanup_max_age_hours: env_parse("BMH_CLEANUP_MAX_AGE_HOURS")
                .unwrap_or(defaults.cleanup_max_age_hours),
            user_agent: std::env::var("BMH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("BMH_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            http_rate_burst: env_parse("BMH_HTTP_RATE_BURST").or(defaults.http_rate_burst),
            http_rate_refill_ms: env_parse("BMH_HTTP_RATE_REFILL_MS").unwrap_or(defaults.http_rate_refill_ms),
        }
    }

    pub fn fetch_budget(&self) -> FetchBudget {
        FetchBudget {
            max_items: self.max_items_per_source,
            timeout: Duration::from_secs(self.source_ceiling_secs),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            rate_limit: self.http_rate_burst.filter(|burst| *burst > 0).map(|burst| RateLimitConfig {
                burst,
                refill_every: Duration::from_millis(self.http_rate_refill_ms),
            }),
            ..Default::default()
        }
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig {
            url_keys_per_source: self.url_keys_per_source,
        }
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Canonical form of a URL for identity purposes: no scheme, no `www.`, no
/// fragment, no trailing slash and no tracking parameters.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let candidate: Cow<'_, str> = if leading_scheme(trimmed).is_some() {
        Cow::Borrowed(trimmed)
    } else {
        Cow::Owned(format!("http://{trimmed}"))
    };
    match Url::parse(&candidate) {
        Ok(url) if url.host_str().is_some_and(|h| !h.is_empty()) => normalize_parsed_url(&url),
        _ => normalize_unparsed_url(trimmed),
    }
}

fn normalize_parsed_url(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let mut out = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if let Some(port) = url.port().filter(|p| !matches!(p, 80 | 443)) {
        let _ = write!(out, ":{port}");
    }
    out.push_str(url.path().trim_end_matches('/'));

    let kept = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .collect::<Vec<_>>();
    if !kept.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(kept)
            .finish();
        out.push('?');
        out.push_str(&query);
    }
    out
}

/// Length of a `scheme://` prefix, if the string starts with one.
fn leading_scheme(input: &str) -> Option<usize> {
    let (scheme, _) = input.split_once("://")?;
    let mut chars = scheme.chars();
    let starts_alpha = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    let rest_valid = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    (starts_alpha && rest_valid).then_some(scheme.len() + 3)
}

fn normalize_unparsed_url(trimmed: &str) -> String {
    let lowered = trimmed.to_lowercase();
    let without_scheme = &lowered[leading_scheme(&lowered).unwrap_or(0)..];
    let without_fragment = without_scheme.split('#').next().unwrap_or_default();
    let without_www = without_fragment.strip_prefix("www.").unwrap_or(without_fragment);
    without_www.trim_end_matches('/').to_string()
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hex digest standing in for identity when an item has neither id nor url.
///
/// Items with text hash source, author, the leading text and a day bucket.
/// Items without text can only be told apart by when they were retrieved, so
/// they hash source plus the retrieval minute.
pub fn content_fingerprint(raw: &RawItem) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.source.as_str().as_bytes());
    hasher.update([0x1f]);

    if raw.payload.has_text() {
        let author = collapse_whitespace(raw.payload.author.as_deref().unwrap_or_default()).to_lowercase();
        let text = collapse_whitespace(raw.payload.text.as_deref().unwrap_or_default())
            .to_lowercase()
            .chars()
            .take(FINGERPRINT_TEXT_CHARS)
            .collect::<String>();
        let bucket = match raw.payload.published_at {
            Some(ts) => ts.format("%Y-%m-%d").to_string(),
            None => collapse_whitespace(raw.payload.relative_date.as_deref().unwrap_or_default()).to_lowercase(),
        };
        for part in [author.as_str(), text.as_str(), bucket.as_str()] {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
    } else {
        hasher.update(raw.retrieved_at.format("%Y-%m-%dT%H:%M").to_string().as_bytes());
    }

    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DedupConfig {
    /// Scope URL identities to their source instead of sharing them across sources.
    pub url_keys_per_source: bool,
}

/// Keys seen by one job: the ones it admitted plus any loaded from earlier runs.
#[derive(Debug, Clone, Default)]
pub struct IdentityIndex {
    seeded: HashSet<IdentityKey>,
    admitted: HashSet<IdentityKey>,
}

impl IdentityIndex {
    pub fn seed(&mut self, keys: impl IntoIterator<Item = IdentityKey>) {
        self.seeded.extend(keys);
    }

    /// Returns false when the key was already present.
    pub fn insert(&mut self, key: IdentityKey) -> bool {
        if self.seeded.contains(&key) {
            return false;
        }
        self.admitted.insert(key)
    }

    pub fn admitted_len(&self) -> usize {
        self.admitted.len()
    }

    pub fn seeded_len(&self) -> usize {
        self.seeded.len()
    }

    pub fn admitted_keys(&self) -> impl Iterator<Item = &IdentityKey> {
        self.admitted.iter()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted(CanonicalItem),
    Rejected { identity_key: IdentityKey },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DedupEngine {
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Native id first, then normalized url, then content fingerprint.
    pub fn identity_key(&self, raw: &RawItem) -> IdentityKey {
        if let Some(native_id) = raw.native_id() {
            return IdentityKey::native(raw.source, native_id);
        }
        if let Some(url) = raw.url() {
            let scope = self.config.url_keys_per_source.then_some(raw.source);
            return IdentityKey::url(scope, &normalize_url(url));
        }
        IdentityKey::fingerprint(raw.source, &content_fingerprint(raw))
    }

    pub fn admit(
        &self,
        index: &mut IdentityIndex,
        raw: RawItem,
        business_id: Uuid,
        business_name: &str,
        scraped_at: DateTime<Utc>,
    ) -> Admission {
        let identity_key = self.identity_key(&raw);
        if !index.insert(identity_key.clone()) {
            return Admission::Rejected { identity_key };
        }
        Admission::Admitted(CanonicalItem::from_raw(
            raw,
            identity_key,
            business_id,
            business_name,
            scraped_at,
        ))
    }
}

/// One business's run. Mutated only through [`JobHandle::update`].
#[derive(Debug, Clone)]
pub struct Job {
    job_id: Uuid,
    business_id: Uuid,
    descriptor: BusinessDescriptor,
    state: JobState,
    sources: BTreeMap<Source, SourceProgress>,
    results: BTreeMap<Source, Vec<CanonicalItem>>,
    identity_index: IdentityIndex,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl Job {
    /// `descriptor` is expected to be validated already.
    pub fn new(job_id: Uuid, descriptor: BusinessDescriptor, created_at: DateTime<Utc>) -> Self {
        let sources = Source::ALL
            .iter()
            .map(|source| {
                let progress = if descriptor.target_for(*source).is_some() {
                    SourceProgress::queued()
                } else {
                    SourceProgress::skipped()
                };
                (*source, progress)
            })
            .collect();
        let results = Source::ALL.iter().map(|source| (*source, Vec::new())).collect();
        Self {
            job_id,
            business_id: descriptor.business_id(),
            descriptor,
            state: JobState::Pending,
            sources,
            results,
            identity_index: IdentityIndex::default(),
            created_at,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn business_id(&self) -> Uuid {
        self.business_id
    }

    pub fn descriptor(&self) -> &BusinessDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn source_progress(&self, source: Source) -> Option<&SourceProgress> {
        self.sources.get(&source)
    }

    pub fn sources(&self) -> &BTreeMap<Source, SourceProgress> {
        &self.sources
    }

    pub fn results(&self) -> &BTreeMap<Source, Vec<CanonicalItem>> {
        &self.results
    }

    pub fn identity_index(&self) -> &IdentityIndex {
        &self.identity_index
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn dispatched_sources(&self) -> Vec<Source> {
        self.sources
            .iter()
            .filter(|(_, progress)| progress.is_dispatched())
            .map(|(source, _)| *source)
            .collect()
    }

    pub fn targets(&self) -> Vec<SourceTarget> {
        self.dispatched_sources()
            .into_iter()
            .filter_map(|source| self.descriptor.target_for(source))
            .collect()
    }

    pub fn total_items(&self) -> usize {
        self.identity_index.admitted_len()
    }

    pub fn all_reviews(&self) -> Vec<CanonicalItem> {
        self.results.values().flatten().cloned().collect()
    }

    pub fn transition(&mut self, next: JobState, at: DateTime<Utc>) -> Result<(), EngineError> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        match next {
            JobState::Running => self.started_at = Some(at),
            JobState::Completed | JobState::Failed => self.completed_at = Some(at),
            JobState::Pending => {}
        }
        Ok(())
    }

    pub fn seed_identities(&mut self, keys: impl IntoIterator<Item = IdentityKey>) {
        self.identity_index.seed(keys);
    }

    pub fn mark_source_started(&mut self, source: Source, at: DateTime<Utc>) {
        if let Some(progress) = self.sources.get_mut(&source) {
            progress.started_at = Some(at);
        }
    }

    /// Run one item through dedup and append it to its source's results when admitted.
    pub fn admit(&mut self, engine: &DedupEngine, raw: RawItem, scraped_at: DateTime<Utc>) -> Admission {
        let admission = engine.admit(
            &mut self.identity_index,
            raw,
            self.business_id,
            &self.descriptor.name,
            scraped_at,
        );
        if let Admission::Admitted(item) = &admission {
            self.results.entry(item.source).or_default().push(item.clone());
            self.sources.entry(item.source).or_default().count += 1;
        }
        admission
    }

    pub fn finish_source(&mut self, source: Source, error: Option<String>, at: DateTime<Utc>) {
        if let Some(progress) = self.sources.get_mut(&source) {
            if progress.done {
                return;
            }
            progress.done = true;
            progress.error = error;
            progress.finished_at = Some(at);
        }
    }

    /// Close out dispatched sources whose task ended without reporting.
    pub fn fail_unfinished_sources(&mut self, at: DateTime<Utc>) -> usize {
        let unfinished = self
            .sources
            .iter()
            .filter(|(_, p)| p.is_dispatched() && !p.done)
            .map(|(s, _)| *s)
            .collect::<Vec<_>>();
        for source in &unfinished {
            self.finish_source(*source, Some("source task ended before reporting a result".into()), at);
        }
        unfinished.len()
    }

    /// Move a running job to its terminal state once every source has reported.
    pub fn finalize(&mut self, at: DateTime<Utc>) -> Result<JobState, EngineError> {
        let attempted = self.dispatched_sources().len();
        let failed = self
            .sources
            .values()
            .filter(|p| p.status() == SourceStatus::Failed)
            .count();
        let next = if self.total_items() == 0 && failed > 0 {
            JobState::Failed
        } else {
            JobState::Completed
        };
        self.transition(next, at)?;
        if next == JobState::Failed {
            self.error = Some(EngineError::AllSourcesFailed { failed, attempted }.to_string());
        }
        Ok(next)
    }

    pub fn is_expired(&self, max_age: TimeDelta, now: DateTime<Utc>) -> bool {
        if !self.state.is_terminal() {
            return false;
        }
        self.completed_at.is_some_and(|completed| now - completed >= max_age)
    }
}

/// Share of dispatched sources that are done. Skipped sources are ignored.
pub fn progress_percent(job: &Job) -> u8 {
    let dispatched = job.sources.values().filter(|p| p.is_dispatched()).collect::<Vec<_>>();
    if dispatched.is_empty() {
        return 100;
    }
    let done = dispatched.iter().filter(|p| p.done).count();
    let total = dispatched.len();
    ((done * 200 + total) / (2 * total)) as u8
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statistics {
    #[serde(flatten)]
    pub per_source: BTreeMap<Source, usize>,
    pub total_unique: usize,
}

pub fn statistics(job: &Job) -> Statistics {
    Statistics {
        per_source: Source::ALL
            .iter()
            .map(|source| (*source, job.results.get(source).map_or(0, Vec::len)))
            .collect(),
        total_unique: job.identity_index.admitted_len(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub status: SourceStatus,
    pub count: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub status: JobState,
    pub progress: u8,
    pub statistics: Statistics,
    pub sources: BTreeMap<Source, SourceReport>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl JobStatusView {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            status: job.state,
            progress: progress_percent(job),
            statistics: statistics(job),
            sources: job
                .sources
                .iter()
                .map(|(source, p)| {
                    let report = SourceReport {
                        status: p.status(),
                        count: p.count,
                        error: p.error.clone(),
                    };
                    (*source, report)
                })
                .collect(),
            start_time: job.created_at,
            end_time: job.completed_at,
            error: job.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResultsView {
    #[serde(flatten)]
    pub status: JobStatusView,
    pub business_name: String,
    pub total_reviews: usize,
    pub results: BTreeMap<Source, Vec<CanonicalItem>>,
    pub all_reviews: Vec<CanonicalItem>,
}

impl JobResultsView {
    pub fn from_job(job: &Job) -> Self {
        Self {
            status: JobStatusView::from_job(job),
            business_name: job.descriptor.name.clone(),
            total_reviews: job.total_items(),
            results: job.results.clone(),
            all_reviews: job.all_reviews(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub status: JobState,
    pub progress: u8,
    pub business_name: String,
    pub total_reviews: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl JobSummary {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            status: job.state,
            progress: progress_percent(job),
            business_name: job.descriptor.name.clone(),
            total_reviews: job.total_items(),
            start_time: job.created_at,
            end_time: job.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobList {
    pub jobs: Vec<JobSummary>,
    pub total_jobs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub job_id: Uuid,
    pub status: &'static str,
    pub message: String,
    pub business_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub removed: usize,
    pub removed_jobs: Vec<Uuid>,
    pub remaining_jobs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub active_jobs: usize,
}

/// A registered job plus its state broadcast.
#[derive(Debug)]
pub struct JobHandle {
    job_id: Uuid,
    job: Mutex<Job>,
    state_tx: watch::Sender<JobState>,
}

impl JobHandle {
    pub fn new(job: Job) -> Self {
        let (state_tx, _) = watch::channel(job.state());
        Self {
            job_id: job.job_id(),
            job: Mutex::new(job),
            state_tx,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn state(&self) -> JobState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    pub async fn read<R>(&self, f: impl FnOnce(&Job) -> R) -> R {
        let job = self.job.lock().await;
        f(&job)
    }

    pub async fn snapshot(&self) -> Job {
        self.read(Job::clone).await
    }

    /// Mutate the job under its lock and publish any state change.
    pub async fn update<R>(&self, f: impl FnOnce(&mut Job) -> R) -> R {
        let mut job = self.job.lock().await;
        let out = f(&mut job);
        let state = job.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        out
    }
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<BTreeMap<Uuid, Arc<JobHandle>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handle: Arc<JobHandle>) {
        self.jobs.write().await.insert(handle.job_id(), handle);
    }

    pub async fn get(&self, job_id: Uuid) -> Option<Arc<JobHandle>> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    pub async fn handles(&self) -> Vec<Arc<JobHandle>> {
        self.jobs.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Drop terminal jobs that completed at least `max_age` ago.
    pub async fn sweep(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<Uuid> {
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
        let mut jobs = self.jobs.write().await;
        let mut expired = Vec::new();
        for (job_id, handle) in jobs.iter() {
            if handle.read(|job| job.is_expired(max_age, now)).await {
                expired.push(*job_id);
            }
        }
        for job_id in &expired {
            jobs.remove(job_id);
        }
        expired
    }
}

/// Convert a client-supplied age in hours, rejecting negative or non-finite values.
pub fn max_age_from_hours(hours: f64) -> Result<Duration, EngineError> {
    if !hours.is_finite() || hours < 0.0 {
        return Err(EngineError::Validation(format!(
            "max_age_hours must be a non-negative number, got {hours}"
        )));
    }
    Duration::try_from_secs_f64(hours * 3600.0)
        .map_err(|err| EngineError::Validation(format!("max_age_hours out of range: {err}")))
}

/// Creates jobs, fans each one out to its source fetchers and answers queries.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<JobRegistry>,
    fetchers: FetcherSet,
    budgets: BudgetTable,
    dedup: Arc<DedupEngine>,
    ledger: Option<Arc<dyn LedgerStore>>,
}

impl Orchestrator {
    pub fn new(registry: Arc<JobRegistry>, fetchers: FetcherSet) -> Self {
        Self {
            registry,
            fetchers,
            budgets: BudgetTable::default(),
            dedup: Arc::new(DedupEngine::default()),
            ledger: None,
        }
    }

    pub fn with_budgets(mut self, budgets: BudgetTable) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn with_dedup(mut self, dedup: DedupEngine) -> Self {
        self.dedup = Arc::new(dedup);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerStore>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Wire fetchers from `sources.yaml` and the ledger from the environment config.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let registry_path = config.workspace_root.join("sources.yaml");
        let sources = SourceRegistry::load(&registry_path)
            .with_context(|| format!("loading source registry {}", registry_path.display()))?;
        let http = Arc::new(HttpClient::new(config.http_client_config())?);
        let fetchers = build_fetcher_set(&sources, &config.workspace_root, http);

        let mut orchestrator = Self::new(Arc::new(JobRegistry::new()), fetchers)
            .with_budgets(sources.budgets(config.fetch_budget()))
            .with_dedup(DedupEngine::new(config.dedup_config()));
        if config.ledger_enabled {
            orchestrator = orchestrator.with_ledger(Arc::new(FileLedgerStore::new(config.ledger_dir.clone())));
        }
        info!(
            workspace_root = %config.workspace_root.display(),
            ledger_enabled = config.ledger_enabled,
            "orchestrator configured"
        );
        Ok(orchestrator)
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub async fn submit(&self, descriptor: BusinessDescriptor) -> Result<SubmitReceipt, EngineError> {
        let descriptor = descriptor.validated()?;
        let job_id = Uuid::new_v4();
        let business_name = descriptor.name.clone();
        let job = Job::new(job_id, descriptor, Utc::now());
        let dispatched = job.dispatched_sources();
        let handle = Arc::new(JobHandle::new(job));
        self.registry.register(handle.clone()).await;

        if dispatched.is_empty() {
            let state = handle
                .update(|job| {
                    let now = Utc::now();
                    job.transition(JobState::Running, now)?;
                    job.finalize(now)
                })
                .await?;
            info!(%job_id, business = %business_name, %state, "no sources qualified; job finalized");
        } else {
            info!(%job_id, business = %business_name, sources = dispatched.len(), "job submitted");
            let span = info_span!("job", %job_id);
            tokio::spawn(self.clone().supervise(handle).instrument(span));
        }

        Ok(SubmitReceipt {
            job_id,
            status: "started",
            message: format!("Scraping started for {business_name}"),
            business_name,
        })
    }

    async fn supervise(self, handle: Arc<JobHandle>) {
        let started = handle
            .update(|job| {
                job.transition(JobState::Running, Utc::now())
                    .map(|()| (job.business_id(), job.descriptor().name.clone(), job.targets()))
            })
            .await;
        let (business_id, business_name, targets) = match started {
            Ok(started) => started,
            Err(err) => {
                error!(error = %err, "job could not start");
                return;
            }
        };

        if let Some(ledger) = &self.ledger {
            match ledger.load_keys(business_id).await {
                Ok(keys) => {
                    debug!(seeded = keys.len(), "identity index seeded from ledger");
                    handle.update(|job| job.seed_identities(keys)).await;
                }
                Err(err) => warn!(error = %err, "ledger unavailable; continuing without seed"),
            }
        }

        let job_id = handle.job_id();
        let mut tasks = JoinSet::new();
        for target in targets {
            let source = target.source;
            let ctx = FetchContext {
                job_id,
                started_at: Utc::now(),
                budget: self.budgets.for_source(source),
            };
            let span = info_span!("source_fetch", %job_id, %source);
            tasks.spawn(
                run_source(handle.clone(), self.dedup.clone(), self.fetchers.get(source), ctx, target)
                    .instrument(span),
            );
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "source task aborted");
            }
        }

        let keys = handle
            .update(|job| {
                let orphaned = job.fail_unfinished_sources(Utc::now());
                if orphaned > 0 {
                    warn!(orphaned, "sources closed out after their task ended early");
                }
                job.identity_index().admitted_keys().cloned().collect::<Vec<_>>()
            })
            .await;

        if let Some(ledger) = &self.ledger {
            match ledger.record_keys(business_id, &business_name, &keys).await {
                Ok(write) => debug!(added = write.added, total = write.total, "ledger updated"),
                Err(err) => warn!(error = %err, "could not record identities in ledger"),
            }
        }

        let finished = handle
            .update(|job| job.finalize(Utc::now()).map(|state| (state, job.total_items())))
            .await;
        match finished {
            Ok((state, total_unique)) => info!(%state, total_unique, "job finished"),
            Err(err) => error!(error = %err, "job could not be finalized"),
        }
    }

    async fn handle(&self, job_id: Uuid) -> Result<Arc<JobHandle>, EngineError> {
        self.registry
            .get(job_id)
            .await
            .ok_or(EngineError::NotFound { job_id })
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<JobStatusView, EngineError> {
        Ok(self.handle(job_id).await?.read(JobStatusView::from_job).await)
    }

    /// Results are available in every state; a running job returns what has been admitted so far.
    pub async fn get_results(&self, job_id: Uuid) -> Result<JobResultsView, EngineError> {
        Ok(self.handle(job_id).await?.read(JobResultsView::from_job).await)
    }

    pub async fn snapshot(&self, job_id: Uuid) -> Result<Job, EngineError> {
        Ok(self.handle(job_id).await?.snapshot().await)
    }

    pub async fn list_jobs(&self) -> JobList {
        let mut jobs = Vec::new();
        for handle in self.registry.handles().await {
            jobs.push(handle.read(JobSummary::from_job).await);
        }
        jobs.sort_by_key(|summary| summary.start_time);
        JobList {
            total_jobs: jobs.len(),
            jobs,
        }
    }

    pub async fn cleanup(&self, max_age: Duration) -> CleanupReport {
        let removed_jobs = self.registry.sweep(max_age, Utc::now()).await;
        let remaining_jobs = self.registry.len().await;
        if !removed_jobs.is_empty() {
            info!(removed = removed_jobs.len(), remaining_jobs, "old jobs removed");
        }
        CleanupReport {
            removed: removed_jobs.len(),
            removed_jobs,
            remaining_jobs,
        }
    }

    pub async fn health(&self) -> HealthReport {
        let active_jobs = self
            .registry
            .handles()
            .await
            .iter()
            .filter(|handle| !handle.state().is_terminal())
            .count();
        HealthReport {
            status: "healthy",
            timestamp: Utc::now(),
            active_jobs,
        }
    }

    /// Resolve once the job is completed or failed.
    pub async fn wait_for_terminal(&self, job_id: Uuid) -> Result<JobState, EngineError> {
        let handle = self.handle(job_id).await?;
        let mut rx = handle.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => handle.state(),
        };
        Ok(state)
    }
}

async fn run_source(
    handle: Arc<JobHandle>,
    dedup: Arc<DedupEngine>,
    fetcher: Arc<dyn SourceFetcher>,
    ctx: FetchContext,
    target: SourceTarget,
) {
    let source = target.source;
    handle.update(|job| job.mark_source_started(source, Utc::now())).await;

    let ceiling = ctx.budget.timeout;
    let error = match tokio::time::timeout(ceiling, fetcher.fetch(&ctx, &target)).await {
        Ok(Ok(items)) => {
            let fetched = items.len();
            let (admitted, rejected) = handle
                .update(|job| {
                    let now = Utc::now();
                    let mut admitted = 0usize;
                    let mut rejected = 0usize;
                    let own = items.into_iter().filter(|item| {
                        let matches = item.source == source;
                        if !matches {
                            warn!(item_source = %item.source, "dropping item reported under another source");
                        }
                        matches
                    });
                    for item in own.take(ctx.budget.max_items) {
                        if job.admit(&dedup, item, now).is_admitted() {
                            admitted += 1;
                        } else {
                            rejected += 1;
                        }
                    }
                    job.finish_source(source, None, now);
                    (admitted, rejected)
                })
                .await;
            info!(fetched, admitted, rejected, "source finished");
            return;
        }
        Ok(Err(err)) => {
            warn!(error = %err, "source fetch failed");
            err.to_string()
        }
        Err(_) => {
            warn!(ceiling_ms = ceiling.as_millis() as u64, "source fetch timed out");
            format!("timed out after {ceiling:?}")
        }
    };
    handle
        .update(|job| job.finish_source(source, Some(error), Utc::now()))
        .await;
}

/// Periodic `cleanup` driven by `BMH_CLEANUP_CRON` when enabled.
pub async fn maybe_build_cleanup_scheduler(
    config: &EngineConfig,
    orchestrator: Arc<Orchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.cleanup_enabled {
        return Ok(None);
    }

    let max_age = max_age_from_hours(config.cleanup_max_age_hours)?;
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.cleanup_cron.as_str();
    let job = CronJob::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            let report = orchestrator.cleanup(max_age).await;
            info!(
                removed = report.removed,
                remaining_jobs = report.remaining_jobs,
                "scheduled cleanup ran"
            );
        })
    })
    .with_context(|| format!("creating cleanup job for cron {cron}"))?;
    sched.add(job).await.context("adding cleanup job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bmh_core::{IdentityBasis, ItemPayload};
    use chrono::TimeZone;

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).single().unwrap()
    }

    fn descriptor() -> BusinessDescriptor {
        BusinessDescriptor::new("Acme Plumbing")
            .with_business_url("https://acme.example")
            .with_google_maps_url("https://maps.google.com/?cid=1")
            .validated()
            .unwrap()
    }

    fn running_job() -> Job {
        let mut job = Job::new(Uuid::new_v4(), descriptor(), ts(10, 0, 0));
        job.transition(JobState::Running, ts(10, 0, 1)).unwrap();
        job
    }

    fn reddit(native_id: Option<&str>, url: Option<&str>) -> RawItem {
        let mut item = RawItem::new(Source::Reddit, ts(10, 5, 0)).with_payload(ItemPayload::text("great plumber"));
        item.native_id = native_id.map(str::to_string);
        item.url = url.map(str::to_string);
        item
    }

    fn assert_index_matches_results(job: &Job) {
        let total: usize = job.results().values().map(Vec::len).sum();
        assert_eq!(job.identity_index().admitted_len(), total);
    }

    #[test]
    fn tracking_params_and_cosmetic_differences_normalize_away() {
        assert_eq!(
            normalize_url("https://www.Example.com/review/123/?utm_source=x"),
            normalize_url("example.com/review/123")
        );
        assert_eq!(normalize_url("example.com/review/123"), "example.com/review/123");
        assert_eq!(
            normalize_url("http://shop.example:8080/p?id=7&fbclid=abc&page=2#reviews"),
            "shop.example:8080/p?id=7&page=2"
        );
        assert_eq!(normalize_url("https://example.com:443/"), "example.com");
    }

    #[test]
    fn embedded_redirect_targets_do_not_merge_distinct_pages() {
        let acme = normalize_url("acme.example/go?next=https://target.example/x");
        let other = normalize_url("other.org/review/9?next=https://target.example/x");
        assert!(acme.starts_with("acme.example/go?next="));
        assert!(other.starts_with("other.org/review/9?next="));
        assert_ne!(acme, other);

        let tracked = normalize_url("acme.example/p?utm_source=x&next=http://t.example");
        assert!(tracked.starts_with("acme.example/p?next="));
        assert!(!tracked.contains("utm_source"));

        let engine = DedupEngine::default();
        let mut job = running_job();
        let first = RawItem::new(Source::Internet, ts(10, 0, 0)).with_url("acme.example/go?next=https://target.example/x");
        let second =
            RawItem::new(Source::Internet, ts(10, 0, 0)).with_url("other.org/review/9?next=https://target.example/x");
        assert!(job.admit(&engine, first, ts(10, 1, 0)).is_admitted());
        assert!(job.admit(&engine, second, ts(10, 1, 0)).is_admitted());
        assert_index_matches_results(&job);
    }

    #[test]
    fn web_ports_drop_regardless_of_scheme() {
        assert_eq!(normalize_url("https://example.com:80/x"), "example.com/x");
        assert_eq!(normalize_url("http://example.com:443/x"), "example.com/x");
        assert_eq!(normalize_url("http://example.com/x"), "example.com/x");
        assert_eq!(normalize_url("https://example.com:8443/x"), "example.com:8443/x");
    }

    #[test]
    fn http_rate_limit_is_off_until_a_burst_is_set() {
        let config = EngineConfig::default();
        assert!(config.http_client_config().rate_limit.is_none());

        let limited = EngineConfig {
            http_rate_burst: Some(4),
            http_rate_refill_ms: 250,
            ..EngineConfig::default()
        };
        assert_eq!(
            limited.http_client_config().rate_limit,
            Some(RateLimitConfig {
                burst: 4,
                refill_every: Duration::from_millis(250),
            })
        );

        let zero = EngineConfig {
            http_rate_burst: Some(0),
            ..EngineConfig::default()
        };
        assert!(zero.http_client_config().rate_limit.is_none());
    }

    #[test]
    fn unparseable_urls_fall_back_to_lowercased_text() {
        assert_eq!(normalize_url("HTTP://WWW.exa mple.com/Path/"), "exa mple.com/path");
    }

    #[test]
    fn fingerprint_ignores_case_and_spacing_but_not_day() {
        let base = RawItem::new(Source::Tiktok, ts(10, 0, 0))
            .with_payload(ItemPayload::text("Acme   saved my kitchen").with_author("@homebody"));
        let mut respaced = base.clone();
        respaced.payload.text = Some("acme saved my KITCHEN ".into());
        respaced.retrieved_at = ts(11, 30, 0);
        assert_eq!(content_fingerprint(&base), content_fingerprint(&respaced));

        let mut dated = base.clone();
        dated.payload.published_at = Some(ts(9, 0, 0));
        let mut next_day = dated.clone();
        next_day.payload.published_at = Some(ts(9, 0, 0) + TimeDelta::days(1));
        assert_ne!(content_fingerprint(&dated), content_fingerprint(&next_day));
        assert_eq!(content_fingerprint(&base).len(), 32);
    }

    #[test]
    fn blank_items_fingerprint_by_retrieval_minute() {
        let a = RawItem::new(Source::Internet, ts(10, 0, 5));
        let b = RawItem::new(Source::Internet, ts(10, 0, 55));
        let c = RawItem::new(Source::Internet, ts(10, 1, 0));
        assert_eq!(content_fingerprint(&a), content_fingerprint(&b));
        assert_ne!(content_fingerprint(&a), content_fingerprint(&c));
    }

    #[test]
    fn identity_key_prefers_native_id_then_url_then_fingerprint() {
        let engine = DedupEngine::default();
        let with_id = reddit(Some("t3_abc"), Some("https://reddit.com/x"));
        assert_eq!(engine.identity_key(&with_id).as_str(), "reddit:id:t3_abc");

        let blank_id = reddit(Some("  "), Some("https://www.reddit.com/r/x/?utm_medium=web"));
        assert_eq!(engine.identity_key(&blank_id).as_str(), "url:reddit.com/r/x");

        let neither = reddit(None, None);
        assert_eq!(engine.identity_key(&neither).basis(), Some(IdentityBasis::Fingerprint));

        let scoped = DedupEngine::new(DedupConfig { url_keys_per_source: true });
        assert_eq!(scoped.identity_key(&blank_id).as_str(), "reddit:url:reddit.com/r/x");
    }

    #[test]
    fn second_admit_of_same_native_id_is_rejected() {
        let engine = DedupEngine::default();
        let mut job = running_job();
        assert!(job.admit(&engine, reddit(Some("t3_abc"), None), ts(10, 6, 0)).is_admitted());
        let second = job.admit(&engine, reddit(Some("t3_abc"), None), ts(10, 6, 1));
        assert_eq!(
            second,
            Admission::Rejected {
                identity_key: IdentityKey::native(Source::Reddit, "t3_abc")
            }
        );
        assert_eq!(job.source_progress(Source::Reddit).unwrap().count, 1);
        assert_index_matches_results(&job);
    }

    #[test]
    fn shared_url_is_admitted_once_across_sources() {
        let engine = DedupEngine::default();
        let mut job = running_job();
        let youtube = RawItem::new(Source::Youtube, ts(10, 0, 0)).with_url("https://acme.example/blog/winter?fbclid=1");
        let internet = RawItem::new(Source::Internet, ts(10, 0, 0)).with_url("http://www.acme.example/blog/winter/");
        assert!(job.admit(&engine, youtube, ts(10, 1, 0)).is_admitted());
        assert!(!job.admit(&engine, internet, ts(10, 1, 0)).is_admitted());
        assert_eq!(statistics(&job).total_unique, 1);
        assert_index_matches_results(&job);
    }

    #[test]
    fn seeded_keys_reject_without_counting() {
        let engine = DedupEngine::default();
        let mut job = running_job();
        job.seed_identities([IdentityKey::native(Source::Reddit, "t3_old")]);
        assert!(!job.admit(&engine, reddit(Some("t3_old"), None), ts(10, 2, 0)).is_admitted());
        assert!(job.admit(&engine, reddit(Some("t3_new"), None), ts(10, 2, 0)).is_admitted());
        assert_eq!(job.identity_index().seeded_len(), 1);
        assert_eq!(job.total_items(), 1);
        assert_index_matches_results(&job);
    }

    #[test]
    fn progress_ignores_skipped_sources() {
        let mut job = running_job();
        // business_url + google_maps_url: trustpilot skipped, five dispatched.
        assert_eq!(job.dispatched_sources().len(), 5);
        assert_eq!(progress_percent(&job), 0);
        job.finish_source(Source::Google, None, ts(10, 1, 0));
        assert_eq!(progress_percent(&job), 20);
        job.finish_source(Source::Reddit, Some("boom".into()), ts(10, 1, 0));
        job.finish_source(Source::Youtube, None, ts(10, 1, 0));
        assert_eq!(progress_percent(&job), 60);
        job.finish_source(Source::Tiktok, None, ts(10, 1, 0));
        job.finish_source(Source::Internet, None, ts(10, 1, 0));
        assert_eq!(progress_percent(&job), 100);
    }

    #[test]
    fn progress_rounds_to_nearest_percent() {
        let descriptor = BusinessDescriptor::new("Acme")
            .with_google_maps_url("https://maps.google.com/?cid=1")
            .with_trustpilot_url("https://trustpilot.com/review/acme")
            .with_business_url("https://acme.example");
        let mut job = Job::new(Uuid::new_v4(), descriptor, ts(10, 0, 0));
        job.finish_source(Source::Google, None, ts(10, 0, 1));
        assert_eq!(progress_percent(&job), 17);
        job.finish_source(Source::Trustpilot, None, ts(10, 0, 1));
        assert_eq!(progress_percent(&job), 33);
    }

    #[test]
    fn finalize_fails_only_when_nothing_was_admitted_and_a_source_errored() {
        let engine = DedupEngine::default();
        let mut partial = running_job();
        partial.admit(&engine, reddit(Some("t3_a"), None), ts(10, 1, 0));
        partial.finish_source(Source::Google, Some("quota".into()), ts(10, 1, 0));
        partial.fail_unfinished_sources(ts(10, 2, 0));
        assert_eq!(partial.finalize(ts(10, 2, 0)).unwrap(), JobState::Completed);
        assert!(partial.error().is_none());

        let mut empty = running_job();
        empty.fail_unfinished_sources(ts(10, 2, 0));
        assert_eq!(empty.finalize(ts(10, 2, 0)).unwrap(), JobState::Failed);
        assert!(empty.error().unwrap().starts_with("all sources failed"));
        assert_eq!(empty.completed_at(), Some(ts(10, 2, 0)));
        assert!(matches!(
            empty.transition(JobState::Running, ts(10, 3, 0)),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn statistics_serialize_flat_with_total() {
        let engine = DedupEngine::default();
        let mut job = running_job();
        job.admit(&engine, reddit(Some("t3_a"), None), ts(10, 1, 0));
        let value = serde_json::to_value(statistics(&job)).unwrap();
        assert_eq!(value["reddit"], 1);
        assert_eq!(value["trustpilot"], 0);
        assert_eq!(value["total_unique"], 1);
        assert_eq!(value.as_object().unwrap().len(), 7);
    }

    #[tokio::test]
    async fn sweep_keeps_running_jobs_and_recent_terminal_jobs() {
        let registry = JobRegistry::new();
        let running = Arc::new(JobHandle::new(running_job()));
        let mut done = running_job();
        done.fail_unfinished_sources(ts(10, 0, 2));
        done.finalize(ts(10, 0, 2)).unwrap();
        let done = Arc::new(JobHandle::new(done));
        registry.register(running.clone()).await;
        registry.register(done.clone()).await;

        let removed = registry.sweep(Duration::from_secs(3600), ts(10, 30, 0)).await;
        assert!(removed.is_empty());

        let removed = registry.sweep(Duration::from_secs(3600), ts(11, 0, 2)).await;
        assert_eq!(removed, vec![done.job_id()]);
        assert!(registry.get(done.job_id()).await.is_none());
        assert!(registry.get(running.job_id()).await.is_some());
    }

    #[tokio::test]
    async fn handle_update_publishes_state_changes() {
        let handle = JobHandle::new(Job::new(Uuid::new_v4(), descriptor(), ts(10, 0, 0)));
        let mut rx = handle.subscribe();
        handle
            .update(|job| job.transition(JobState::Running, ts(10, 0, 1)))
            .await
            .unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), JobState::Running);
        handle.update(|job| job.mark_source_started(Source::Reddit, ts(10, 0, 2))).await;
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn max_age_rejects_negative_and_non_finite_hours() {
        assert_eq!(max_age_from_hours(0.5).unwrap(), Duration::from_secs(1800));
        assert!(max_age_from_hours(-1.0).is_err());
        assert!(max_age_from_hours(f64::NAN).is_err());
        assert!(max_age_from_hours(f64::INFINITY).is_err());
    }
}
