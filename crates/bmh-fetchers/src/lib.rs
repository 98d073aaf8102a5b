//! Source fetcher contracts + fixture-first and remote fetcher implementations.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bmh_core::{ItemPayload, RawItem, Source, SourceTarget};
use bmh_storage::{HttpClient, HttpError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "bmh-fetchers";

/// Count and time limits handed to a fetcher for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchBudget {
    pub max_items: usize,
    pub timeout: Duration,
}

impl Default for FetchBudget {
    fn default() -> Self {
        Self {
            max_items: 100,
            timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchContext {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub budget: FetchBudget,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{0}")]
    Message(String),
    #[error("{origin} is unavailable: {reason}")]
    Unavailable { origin: Source, reason: String },
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn source(&self) -> Source;

    async fn fetch(&self, ctx: &FetchContext, target: &SourceTarget) -> Result<Vec<RawItem>, FetchError>;
}

/// One fetcher per source. Lookups go through an exhaustive `match` on [`Source`].
#[derive(Clone)]
pub struct FetcherSet {
    google: Arc<dyn SourceFetcher>,
    trustpilot: Arc<dyn SourceFetcher>,
    reddit: Arc<dyn SourceFetcher>,
    youtube: Arc<dyn SourceFetcher>,
    tiktok: Arc<dyn SourceFetcher>,
    internet: Arc<dyn SourceFetcher>,
}

impl FetcherSet {
    pub fn from_fn(mut build: impl FnMut(Source) -> Arc<dyn SourceFetcher>) -> Self {
        Self {
            google: build(Source::Google),
            trustpilot: build(Source::Trustpilot),
            reddit: build(Source::Reddit),
            youtube: build(Source::Youtube),
            tiktok: build(Source::Tiktok),
            internet: build(Source::Internet),
        }
    }

    pub fn unconfigured() -> Self {
        Self::from_fn(|source| -> Arc<dyn SourceFetcher> {
            Arc::new(UnavailableFetcher::new(source, "no fetcher configured"))
        })
    }

    pub fn get(&self, source: Source) -> Arc<dyn SourceFetcher> {
        self.slot(source).clone()
    }

    /// Replace the slot matching `fetcher.source()`.
    pub fn with(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        let source = fetcher.source();
        *self.slot_mut(source) = fetcher;
        self
    }

    fn slot(&self, source: Source) -> &Arc<dyn SourceFetcher> {
        match source {
            Source::Google => &self.google,
            Source::Trustpilot => &self.trustpilot,
            Source::Reddit => &self.reddit,
            Source::Youtube => &self.youtube,
            Source::Tiktok => &self.tiktok,
            Source::Internet => &self.internet,
        }
    }

    fn slot_mut(&mut self, source: Source) -> &mut Arc<dyn SourceFetcher> {
        match source {
            Source::Google => &mut self.google,
            Source::Trustpilot => &mut self.trustpilot,
            Source::Reddit => &mut self.reddit,
            Source::Youtube => &mut self.youtube,
            Source::Tiktok => &mut self.tiktok,
            Source::Internet => &mut self.internet,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source: Source,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub items: Vec<FixtureItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureItem {
    #[serde(default)]
    pub native_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub retrieved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: ItemPayload,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_fixture_bundle(&data, path)
}

fn parse_fixture_bundle(data: &str, path: &Path) -> Result<FixtureBundle> {
    serde_json::from_str(data).with_context(|| format!("parsing {}", path.display()))
}

pub fn fixture_bundle_path(workspace_root: impl AsRef<Path>, source: Source) -> PathBuf {
    workspace_root
        .as_ref()
        .join("fixtures")
        .join(source.as_str())
        .join("sample")
        .join("bundle.json")
}

pub fn bundle_to_items(bundle: &FixtureBundle) -> Vec<RawItem> {
    bundle
        .items
        .iter()
        .map(|item| RawItem {
            source: bundle.source,
            native_id: item.native_id.clone(),
            url: item.url.clone(),
            retrieved_at: item.retrieved_at.unwrap_or(bundle.fetched_at),
            payload: item.payload.clone(),
        })
        .collect()
}

/// Replays captured items from `fixtures/<source>/sample/bundle.json`.
#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    source: Source,
    bundle_path: PathBuf,
}

impl FixtureFetcher {
    pub fn new(source: Source, bundle_path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            bundle_path: bundle_path.into(),
        }
    }

    pub fn for_workspace(source: Source, workspace_root: impl AsRef<Path>) -> Self {
        Self::new(source, fixture_bundle_path(workspace_root, source))
    }
}

#[async_trait]
impl SourceFetcher for FixtureFetcher {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch(&self, ctx: &FetchContext, _target: &SourceTarget) -> Result<Vec<RawItem>, FetchError> {
        let data = tokio::fs::read_to_string(&self.bundle_path)
            .await
            .with_context(|| format!("reading {}", self.bundle_path.display()))?;
        let bundle = parse_fixture_bundle(&data, &self.bundle_path)?;
        if bundle.source != self.source {
            return Err(FetchError::Message(format!(
                "bundle source={} does not match fetcher source={}",
                bundle.source, self.source
            )));
        }
        let mut items = bundle_to_items(&bundle);
        items.truncate(ctx.budget.max_items);
        debug!(source = %self.source, fixture = %bundle.fixture_id, items = items.len(), "replayed fixture");
        Ok(items)
    }
}

#[derive(Debug, Serialize)]
struct RemoteFetchRequest<'a> {
    job_id: Uuid,
    target: &'a SourceTarget,
    max_items: usize,
    timeout_secs: u64,
}

/// Delegates collection to an external scraper service speaking JSON.
#[derive(Debug, Clone)]
pub struct RemoteFetcher {
    source: Source,
    endpoint: String,
    http: Arc<HttpClient>,
}

impl RemoteFetcher {
    pub fn new(source: Source, endpoint: impl Into<String>, http: Arc<HttpClient>) -> Self {
        Self {
            source,
            endpoint: endpoint.into(),
            http,
        }
    }
}

#[async_trait]
impl SourceFetcher for RemoteFetcher {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch(&self, ctx: &FetchContext, target: &SourceTarget) -> Result<Vec<RawItem>, FetchError> {
        let request = RemoteFetchRequest {
            job_id: ctx.job_id,
            target,
            max_items: ctx.budget.max_items,
            timeout_secs: ctx.budget.timeout.as_secs(),
        };
        let mut items: Vec<RawItem> = self
            .http
            .post_json(ctx.job_id, self.source, &self.endpoint, &request)
            .await?;
        items.truncate(ctx.budget.max_items);
        Ok(items)
    }
}

/// Placeholder for a source that is disabled or missing from configuration.
#[derive(Debug, Clone)]
pub struct UnavailableFetcher {
    source: Source,
    reason: String,
}

impl UnavailableFetcher {
    pub fn new(source: Source, reason: impl Into<String>) -> Self {
        Self {
            source,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl SourceFetcher for UnavailableFetcher {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch(&self, _ctx: &FetchContext, _target: &SourceTarget) -> Result<Vec<RawItem>, FetchError> {
        Err(FetchError::Unavailable {
            origin: self.source,
            reason: self.reason.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    Fixture,
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source: Source,
    pub enabled: bool,
    pub mode: FetchMode,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub max_items: Option<usize>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn config_for(&self, source: Source) -> Option<&SourceConfig> {
        self.sources.iter().find(|c| c.source == source)
    }

    pub fn budgets(&self, default: FetchBudget) -> BudgetTable {
        let overrides = self
            .sources
            .iter()
            .map(|c| {
                let budget = FetchBudget {
                    max_items: c.max_items.unwrap_or(default.max_items),
                    timeout: c
                        .timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or(default.timeout),
                };
                (c.source, budget)
            })
            .collect();
        BudgetTable { default, overrides }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BudgetTable {
    default: FetchBudget,
    overrides: HashMap<Source, FetchBudget>,
}

impl BudgetTable {
    pub fn uniform(default: FetchBudget) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn for_source(&self, source: Source) -> FetchBudget {
        self.overrides.get(&source).copied().unwrap_or(self.default)
    }
}

pub fn build_fetcher_set(
    registry: &SourceRegistry,
    workspace_root: impl AsRef<Path>,
    http: Arc<HttpClient>,
) -> FetcherSet {
    let workspace_root = workspace_root.as_ref();
    FetcherSet::from_fn(|source| -> Arc<dyn SourceFetcher> {
        let Some(config) = registry.config_for(source) else {
            return Arc::new(UnavailableFetcher::new(source, "no entry in sources.yaml"));
        };
        if !config.enabled {
            return Arc::new(UnavailableFetcher::new(source, "disabled in sources.yaml"));
        }
        match (config.mode, config.endpoint.as_deref()) {
            (FetchMode::Fixture, _) => Arc::new(FixtureFetcher::for_workspace(source, workspace_root)),
            (FetchMode::Remote, Some(endpoint)) => {
                Arc::new(RemoteFetcher::new(source, endpoint, http.clone()))
            }
            (FetchMode::Remote, None) => {
                Arc::new(UnavailableFetcher::new(source, "remote mode requires an endpoint"))
            }
        }
    })
}
