//! Source adapter contract plus one implementation per upstream.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use wt_core::{GlobeNode, NormalizeContext, SourceType};
use wt_storage::{FetchError, GeocodeCache, HttpFetcher};

mod affiliation_index;
mod citation_graph;
mod paper_index;

pub use affiliation_index::{AffiliationIndexAdapter, BibliographicWork};
pub use citation_graph::{CitationGraphAdapter, CitationPaper};
pub use paper_index::{HealthStatus, PaperIndexAdapter, RawNode};

pub const CRATE_NAME: &str = "wt-adapters";

/// One page of work for an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Topic as selected by the caller; empty means "all".
    pub topic: String,
    /// Free-text search expansion of the topic for search-style upstreams.
    pub query: String,
    pub offset: usize,
    pub batch_size: usize,
    pub recent_only: bool,
}

/// Upstream record before normalization, tagged by the adapter that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    PaperIndex(RawNode),
    CitationGraph(CitationPaper),
    AffiliationIndex(BibliographicWork),
}

/// Run-level hints some upstreams send alongside their records.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct UpstreamMeta {
    pub total: Option<usize>,
    pub failed_topics: Vec<String>,
    pub has_fallback: bool,
    pub freshness_window: Option<String>,
    pub cache_hit: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchedBatch {
    pub records: Vec<RawRecord>,
    pub upstream: UpstreamMeta,
}

impl FetchedBatch {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            upstream: UpstreamMeta::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// A success response whose body reports an upstream failure.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl AdapterError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AdapterError::Fetch(err) if err.is_timeout())
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn source_type(&self) -> SourceType;

    /// Adapters that geocode must be driven one record at a time.
    fn needs_geocoding(&self) -> bool {
        false
    }

    async fn fetch_batch(
        &self,
        http: &HttpFetcher,
        request: &BatchRequest,
    ) -> Result<FetchedBatch, AdapterError>;

    /// Decode a raw upstream response body.
    fn parse_response(&self, body: &[u8]) -> Result<FetchedBatch, AdapterError>;

    /// `None` drops the record; it is never turned into a placeholder.
    async fn normalize(&self, ctx: &NormalizeContext, record: RawRecord) -> Option<GlobeNode>;
}

/// Base URLs and credentials for the upstream services.
#[derive(Debug, Clone)]
pub struct AdapterEndpoints {
    pub paper_index_url: String,
    pub citation_graph_url: String,
    pub citation_graph_api_key: Option<String>,
    pub affiliation_index_url: String,
}

pub fn adapter_for_source(
    source_id: &str,
    endpoints: &AdapterEndpoints,
    geocoder: &Arc<GeocodeCache>,
) -> Option<Arc<dyn SourceAdapter>> {
    match source_id {
        "paper-index" => Some(Arc::new(PaperIndexAdapter::new(&endpoints.paper_index_url))),
        "citation-graph" => Some(Arc::new(CitationGraphAdapter::new(
            &endpoints.citation_graph_url,
            endpoints.citation_graph_api_key.clone(),
            geocoder.clone(),
        ))),
        "affiliation-index" => Some(Arc::new(AffiliationIndexAdapter::new(
            &endpoints.affiliation_index_url,
            geocoder.clone(),
        ))),
        _ => None,
    }
}

/// Parse a captured upstream response from disk with the given adapter.
pub fn load_fixture_batch(adapter: &dyn SourceAdapter, path: impl AsRef<Path>) -> Result<FetchedBatch> {
    let path = path.as_ref();
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    adapter
        .parse_response(&data)
        .with_context(|| format!("parsing {} as {}", path.display(), adapter.source_id()))
}

fn decode<T: serde::de::DeserializeOwned>(origin: &str, body: &[u8]) -> Result<T, AdapterError> {
    serde_json::from_slice(body).map_err(|source| {
        AdapterError::Fetch(FetchError::Decode {
            url: origin.to_string(),
            source,
        })
    })
}

/// Render a JSON scalar that may arrive as text or a bare number (e.g. a year).
fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn join_names<I, S>(names: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined = names
        .into_iter()
        .filter_map(|n| wt_core::text_or_none(n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ");
    wt_core::text_or_none(joined)
}
