//! Canonical globe-node model shared by adapters, the aggregator and consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod freshness;

pub use freshness::{is_recent, parse_published, FreshnessPolicy, LONG_WINDOW_DAYS, SHORT_WINDOW_DAYS};

pub const CRATE_NAME: &str = "wt-core";

pub const UNTITLED: &str = "Untitled";
pub const UNKNOWN_AUTHORS: &str = "Unknown authors";
pub const NO_ABSTRACT: &str = "No abstract available";
pub const UNKNOWN_DATE: &str = "Unknown";
pub const UNKNOWN_TOPIC: &str = "Unknown";

/// Upstream origin of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    PaperIndex,
    CitationGraph,
    AffiliationIndex,
    Fallback,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::PaperIndex => "paper-index",
            SourceType::CitationGraph => "citation-graph",
            SourceType::AffiliationIndex => "affiliation-index",
            SourceType::Fallback => "fallback",
        }
    }

    /// Map the free-form `type` tag the paper index puts on its nodes.
    pub fn from_raw_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "semantic-scholar" | "citation-graph" => SourceType::CitationGraph,
            "crossref" | "affiliation-index" => SourceType::AffiliationIndex,
            "fallback" | "placeholder" => SourceType::Fallback,
            _ => SourceType::PaperIndex,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinates")]
pub struct Coordinates {
    lat: f64,
    lng: f64,
}

#[derive(Deserialize)]
struct RawCoordinates {
    lat: f64,
    lng: f64,
}

impl TryFrom<RawCoordinates> for Coordinates {
    type Error = String;

    fn try_from(raw: RawCoordinates) -> Result<Self, Self::Error> {
        Coordinates::new(raw.lat, raw.lng)
            .ok_or_else(|| format!("coordinates out of range: ({}, {})", raw.lat, raw.lng))
    }
}

impl Coordinates {
    /// Returns `None` for non-finite or out-of-range values.
    pub fn new(lat: f64, lng: f64) -> Option<Self> {
        let valid = lat.is_finite()
            && lng.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lng);
        valid.then_some(Self { lat, lng })
    }

    pub fn lat(&self) -> f64 {
        self.lat
    }

    pub fn lng(&self) -> f64 {
        self.lng
    }

    fn micro_degrees(&self) -> (i64, i64) {
        ((self.lat * 1e6).round() as i64, (self.lng * 1e6).round() as i64)
    }
}

/// Identity used to suppress duplicate nodes within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    title: String,
    lat_micro: i64,
    lng_micro: i64,
}

pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonical, display-ready record. Immutable once built, and only built by
/// [`NodeDraft::finish`] or [`GlobeNode::placeholder`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobeNode {
    source_type: SourceType,
    coordinates: Coordinates,
    title: String,
    authors_display: String,
    summary: String,
    published_date: String,
    link: Option<String>,
    topic: String,
    is_recent: bool,
    is_fallback: bool,
}

impl GlobeNode {
    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn coordinates(&self) -> Coordinates {
        self.coordinates
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn authors_display(&self) -> &str {
        &self.authors_display
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn published_date(&self) -> &str {
        &self.published_date
    }

    /// Always `None` for fallback nodes.
    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_recent(&self) -> bool {
        self.is_recent
    }

    pub fn is_fallback(&self) -> bool {
        self.is_fallback
    }

    pub fn dedup_key(&self) -> DedupKey {
        let (lat_micro, lng_micro) = self.coordinates.micro_degrees();
        DedupKey {
            title: normalize_key_fragment(&self.title),
            lat_micro,
            lng_micro,
        }
    }

    /// Placeholder shown when a source yields nothing for `topic`.
    ///
    /// `slot` spreads successive placeholders across the globe.
    pub fn placeholder(topic: &str, source_label: &str, slot: usize) -> Self {
        let lat = -60.0 + ((slot * 15) % 120) as f64;
        let lng = -180.0 + ((slot * 25) % 360) as f64;
        let topic = text_or_none(topic).unwrap_or_else(|| UNKNOWN_TOPIC.to_string());
        Self {
            source_type: SourceType::Fallback,
            coordinates: Coordinates { lat, lng },
            title: format!("No live results for {topic}"),
            authors_display: UNKNOWN_AUTHORS.to_string(),
            summary: format!("{source_label} is unavailable right now; showing a placeholder."),
            published_date: UNKNOWN_DATE.to_string(),
            link: None,
            topic,
            is_recent: false,
            is_fallback: true,
        }
    }
}

/// Per-run inputs to normalization.
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    pub topic: String,
    pub freshness: FreshnessPolicy,
    pub now: DateTime<Utc>,
}

/// Pre-normalized handoff from adapters, every field optional.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeDraft {
    pub source_type: Option<SourceType>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub title: Option<String>,
    pub authors: Option<String>,
    pub summary: Option<String>,
    pub published: Option<String>,
    pub link: Option<String>,
    pub topic: Option<String>,
    pub is_fallback: bool,
}

impl NodeDraft {
    /// Fill display defaults and derive flags. `None` when coordinates are unusable.
    pub fn finish(self, ctx: &NormalizeContext) -> Option<GlobeNode> {
        let coordinates = Coordinates::new(self.lat?, self.lng?)?;
        let is_fallback = self.is_fallback || self.source_type == Some(SourceType::Fallback);
        let source_type = if is_fallback {
            SourceType::Fallback
        } else {
            self.source_type.unwrap_or(SourceType::PaperIndex)
        };
        let published_date = self
            .published
            .and_then(text_or_none)
            .unwrap_or_else(|| UNKNOWN_DATE.to_string());
        let link = if is_fallback {
            None
        } else {
            self.link.and_then(text_or_none).filter(|l| l != "#")
        };
        let topic = self
            .topic
            .and_then(text_or_none)
            .or_else(|| text_or_none(ctx.topic.clone()))
            .unwrap_or_else(|| UNKNOWN_TOPIC.to_string());
        let is_recent = ctx.freshness.is_recent_at(&published_date, ctx.now);

        Some(GlobeNode {
            source_type,
            coordinates,
            title: self.title.and_then(text_or_none).unwrap_or_else(|| UNTITLED.to_string()),
            authors_display: self
                .authors
                .and_then(text_or_none)
                .unwrap_or_else(|| UNKNOWN_AUTHORS.to_string()),
            summary: self
                .summary
                .and_then(text_or_none)
                .unwrap_or_else(|| NO_ABSTRACT.to_string()),
            published_date,
            link,
            topic,
            is_recent,
            is_fallback,
        })
    }
}

pub fn text_or_none(value: impl Into<String>) -> Option<String> {
    let value = value.into();
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// One or more configured sources failed while others still contributed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("partial source failure: {}", failed_sources.join(", "))]
pub struct PartialSourceFailure {
    pub failed_sources: Vec<String>,
}
