//! Core domain model for BMH: sources, business descriptors, raw and canonical items.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "bmh-core";

/// The six content origins a job can collect from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Google,
    Trustpilot,
    Reddit,
    Youtube,
    Tiktok,
    Internet,
}

impl Source {
    pub const ALL: [Source; 6] = [
        Source::Google,
        Source::Trustpilot,
        Source::Reddit,
        Source::Youtube,
        Source::Tiktok,
        Source::Internet,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Google => "google",
            Source::Trustpilot => "trustpilot",
            Source::Reddit => "reddit",
            Source::Youtube => "youtube",
            Source::Tiktok => "tiktok",
            Source::Internet => "internet",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Source::Google => "Google",
            Source::Trustpilot => "Trustpilot",
            Source::Reddit => "Reddit",
            Source::Youtube => "YouTube",
            Source::Tiktok => "TikTok",
            Source::Internet => "Internet",
        }
    }

    /// Descriptor field that must be present before this source is dispatched.
    pub fn qualifying_field(self) -> DescriptorField {
        match self {
            Source::Google => DescriptorField::GoogleMapsUrl,
            Source::Trustpilot => DescriptorField::TrustpilotUrl,
            Source::Reddit | Source::Youtube | Source::Tiktok | Source::Internet => {
                DescriptorField::BusinessUrl
            }
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source `{0}`")]
pub struct UnknownSource(pub String);

impl FromStr for Source {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" | "google_maps" => Ok(Source::Google),
            "trustpilot" => Ok(Source::Trustpilot),
            "reddit" => Ok(Source::Reddit),
            "youtube" => Ok(Source::Youtube),
            "tiktok" => Ok(Source::Tiktok),
            "internet" | "internet_search" | "internetsearch" => Ok(Source::Internet),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorField {
    BusinessUrl,
    GoogleMapsUrl,
    TrustpilotUrl,
}

impl DescriptorField {
    pub fn as_str(self) -> &'static str {
        match self {
            DescriptorField::BusinessUrl => "business_url",
            DescriptorField::GoogleMapsUrl => "google_maps_url",
            DescriptorField::TrustpilotUrl => "trustpilot_url",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("Missing required field: name")]
    MissingName,
}

/// Submission input. Immutable once a job has been created from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_maps_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trustpilot_url: Option<String>,
}

impl BusinessDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            business_url: None,
            google_maps_url: None,
            trustpilot_url: None,
        }
    }

    pub fn with_business_url(mut self, url: impl Into<String>) -> Self {
        self.business_url = Some(url.into());
        self
    }

    pub fn with_google_maps_url(mut self, url: impl Into<String>) -> Self {
        self.google_maps_url = Some(url.into());
        self
    }

    pub fn with_trustpilot_url(mut self, url: impl Into<String>) -> Self {
        self.trustpilot_url = Some(url.into());
        self
    }

    /// Trim every field, drop blank optionals and reject a blank name.
    pub fn validated(self) -> Result<Self, DescriptorError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(DescriptorError::MissingName);
        }
        Ok(Self {
            name,
            business_url: non_blank(self.business_url),
            google_maps_url: non_blank(self.google_maps_url),
            trustpilot_url: non_blank(self.trustpilot_url),
        })
    }

    /// Deterministic id so repeated runs for the same business share a ledger.
    pub fn business_id(&self) -> Uuid {
        let folded = self
            .name
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("bmh:business:{folded}").as_bytes())
    }

    pub fn field(&self, field: DescriptorField) -> Option<&str> {
        let value = match field {
            DescriptorField::BusinessUrl => self.business_url.as_deref(),
            DescriptorField::GoogleMapsUrl => self.google_maps_url.as_deref(),
            DescriptorField::TrustpilotUrl => self.trustpilot_url.as_deref(),
        };
        value.map(str::trim).filter(|v| !v.is_empty())
    }

    /// The subset of the descriptor a fetcher needs, or `None` when the source must be skipped.
    pub fn target_for(&self, source: Source) -> Option<SourceTarget> {
        let url = self.field(source.qualifying_field())?;
        Some(SourceTarget {
            source,
            business_id: self.business_id(),
            business_name: self.name.clone(),
            url: url.to_string(),
            business_url: self.field(DescriptorField::BusinessUrl).map(ToString::to_string),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Handoff contract from the orchestrator into a single source fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTarget {
    pub source: Source,
    pub business_id: Uuid,
    pub business_name: String,
    pub url: String,
    pub business_url: Option<String>,
}

/// Source-specific content carried by a raw item.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ItemPayload {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub relative_date: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, JsonValue>,
}

impl ItemPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_rating(mut self, rating: f64) -> Self {
        self.rating = Some(rating);
        self
    }

    pub fn has_text(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

/// One unit of content emitted by a fetcher. Never mutated after production.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub source: Source,
    #[serde(default)]
    pub native_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub retrieved_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: ItemPayload,
}

impl RawItem {
    pub fn new(source: Source, retrieved_at: DateTime<Utc>) -> Self {
        Self {
            source,
            native_id: None,
            url: None,
            retrieved_at,
            payload: ItemPayload::default(),
        }
    }

    pub fn with_native_id(mut self, id: impl Into<String>) -> Self {
        self.native_id = Some(id.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_payload(mut self, payload: ItemPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn native_id(&self) -> Option<&str> {
        self.native_id.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityBasis {
    NativeId,
    Url,
    Fingerprint,
}

/// Derived value used to detect duplicates within a job and across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn native(source: Source, native_id: &str) -> Self {
        Self(format!("{}:id:{}", source, native_id.trim()))
    }

    /// URL identities are shared across sources unless a scope is given.
    pub fn url(scope: Option<Source>, normalized_url: &str) -> Self {
        match scope {
            Some(source) => Self(format!("{}:url:{}", source, normalized_url)),
            None => Self(format!("url:{}", normalized_url)),
        }
    }

    pub fn fingerprint(source: Source, digest_hex: &str) -> Self {
        Self(format!("{}:fp:{}", source, digest_hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn source(&self) -> Option<Source> {
        self.0.split(':').next().and_then(|s| s.parse().ok())
    }

    pub fn basis(&self) -> Option<IdentityBasis> {
        let mut segments = self.0.split(':');
        let first = segments.next()?;
        if first == "url" {
            return Some(IdentityBasis::Url);
        }
        match segments.next()? {
            "id" => Some(IdentityBasis::NativeId),
            "url" => Some(IdentityBasis::Url),
            "fp" => Some(IdentityBasis::Fingerprint),
            _ => None,
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A raw item admitted past deduplication, enriched with job-level context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalItem {
    pub identity_key: IdentityKey,
    pub source: Source,
    pub native_id: Option<String>,
    pub url: Option<String>,
    pub retrieved_at: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
    pub business_id: Uuid,
    pub business_name: String,
    pub payload: ItemPayload,
}

impl CanonicalItem {
    pub fn from_raw(
        raw: RawItem,
        identity_key: IdentityKey,
        business_id: Uuid,
        business_name: impl Into<String>,
        scraped_at: DateTime<Utc>,
    ) -> Self {
        Self {
            identity_key,
            source: raw.source,
            native_id: raw.native_id,
            url: raw.url,
            retrieved_at: raw.retrieved_at,
            scraped_at,
            business_id,
            business_name: business_name.into(),
            payload: raw.payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Forward-only lifecycle: pending -> running -> completed | failed.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Skipped,
    Queued,
    Running,
    Done,
    Failed,
}

/// Per-source bookkeeping inside a job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceProgress {
    pub count: usize,
    pub done: bool,
    pub skipped: bool,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SourceProgress {
    pub fn skipped() -> Self {
        Self {
            done: true,
            skipped: true,
            ..Default::default()
        }
    }

    pub fn queued() -> Self {
        Self::default()
    }

    pub fn is_dispatched(&self) -> bool {
        !self.skipped
    }

    pub fn status(&self) -> SourceStatus {
        if self.skipped {
            SourceStatus::Skipped
        } else if self.done && self.error.is_some() {
            SourceStatus::Failed
        } else if self.done {
            SourceStatus::Done
        } else if self.started_at.is_some() {
            SourceStatus::Running
        } else {
            SourceStatus::Queued
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_name_is_rejected() {
        let err = BusinessDescriptor::new("   ").validated().unwrap_err();
        assert_eq!(err, DescriptorError::MissingName);
    }

    #[test]
    fn blank_optionals_become_absent() {
        let descriptor = BusinessDescriptor::new(" Acme Plumbing ")
            .with_business_url("  ")
            .with_trustpilot_url("https://trustpilot.com/review/acme.com")
            .validated()
            .unwrap();
        assert_eq!(descriptor.name, "Acme Plumbing");
        assert_eq!(descriptor.business_url, None);
        assert!(descriptor.target_for(Source::Reddit).is_none());
        let target = descriptor.target_for(Source::Trustpilot).unwrap();
        assert_eq!(target.url, "https://trustpilot.com/review/acme.com");
        assert_eq!(target.business_name, "Acme Plumbing");
    }

    #[test]
    fn business_id_ignores_case_and_spacing() {
        let a = BusinessDescriptor::new("Acme  Plumbing");
        let b = BusinessDescriptor::new("acme plumbing");
        let c = BusinessDescriptor::new("Acme Electric");
        assert_eq!(a.business_id(), b.business_id());
        assert_ne!(a.business_id(), c.business_id());
    }

    #[test]
    fn business_url_qualifies_four_sources() {
        let descriptor = BusinessDescriptor::new("Acme").with_business_url("https://acme.example");
        let dispatched = Source::ALL
            .iter()
            .filter(|s| descriptor.target_for(**s).is_some())
            .copied()
            .collect::<Vec<_>>();
        assert_eq!(
            dispatched,
            vec![Source::Reddit, Source::Youtube, Source::Tiktok, Source::Internet]
        );
    }

    #[test]
    fn source_parses_aliases_and_round_trips_display() {
        assert_eq!("Internet_Search".parse::<Source>().unwrap(), Source::Internet);
        for source in Source::ALL {
            assert_eq!(source.to_string().parse::<Source>().unwrap(), source);
        }
        assert!("myspace".parse::<Source>().is_err());
    }

    #[test]
    fn identity_key_exposes_source_and_basis() {
        let key = IdentityKey::url(Some(Source::Reddit), "reddit.com/r/plumbing/comments/abc");
        assert_eq!(key.source(), Some(Source::Reddit));
        assert_eq!(key.basis(), Some(IdentityBasis::Url));
        let shared = IdentityKey::url(None, "example.com:8080/review/1");
        assert_eq!(shared.source(), None);
        assert_eq!(shared.basis(), Some(IdentityBasis::Url));
        let key = IdentityKey::native(Source::Google, " ChZDSUhN ");
        assert_eq!(key.as_str(), "google:id:ChZDSUhN");
        assert_eq!(key.basis(), Some(IdentityBasis::NativeId));
    }

    #[test]
    fn job_state_only_moves_forward() {
        assert!(JobState::Pending.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Failed));
        assert!(!JobState::Completed.can_transition_to(JobState::Running));
        assert!(!JobState::Failed.can_transition_to(JobState::Completed));
        assert!(!JobState::Running.can_transition_to(JobState::Pending));
    }

    #[test]
    fn source_progress_status_labels() {
        assert_eq!(SourceProgress::skipped().status(), SourceStatus::Skipped);
        assert_eq!(SourceProgress::queued().status(), SourceStatus::Queued);
        let failed = SourceProgress {
            done: true,
            error: Some("boom".into()),
            ..Default::default()
        };
        assert_eq!(failed.status(), SourceStatus::Failed);
    }
}
