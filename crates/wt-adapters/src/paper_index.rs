use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;
use wt_core::{GlobeNode, NodeDraft, NormalizeContext, SourceType};
use wt_storage::{HttpFetcher, RequestSpec};

use crate::{
    decode, join_names, scalar_text, AdapterError, BatchRequest, FetchedBatch, RawRecord,
    SourceAdapter, UpstreamMeta,
};

/// Node as served by the topic-paper API. Every field is optional on the wire.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct RawNode {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub title: Option<String>,
    pub r#abstract: Option<String>,
    pub summary: Option<String>,
    /// Either a display string or a list of names.
    pub authors: JsonValue,
    /// Usually a date string; sometimes a bare year.
    pub published: JsonValue,
    pub link: Option<String>,
    pub topic: Option<String>,
    pub is_recent: Option<bool>,
    pub is_fallback: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PapersResponse {
    Bare(Vec<RawNode>),
    Envelope(PapersEnvelope),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PapersEnvelope {
    nodes: Vec<RawNode>,
    total: Option<usize>,
    failed_topics: Vec<String>,
    has_fallback: bool,
    freshness_window: Option<String>,
    cache_hit: Option<bool>,
    error: Option<String>,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthStatus {
    pub status: Option<String>,
    pub api_key_configured: bool,
    pub freshness_window: Option<String>,
    pub cache_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PaperIndexAdapter {
    base_url: String,
}

impl PaperIndexAdapter {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn health(&self, http: &HttpFetcher) -> Result<HealthStatus, AdapterError> {
        let request = RequestSpec::get(format!("{}/health", self.base_url));
        Ok(http.fetch_json(self.source_id(), &request).await?)
    }

    fn parse_from(&self, origin: &str, body: &[u8]) -> Result<FetchedBatch, AdapterError> {
        let envelope = match decode::<PapersResponse>(origin, body)? {
            PapersResponse::Bare(nodes) => PapersEnvelope {
                nodes,
                ..Default::default()
            },
            PapersResponse::Envelope(envelope) => envelope,
        };
        if let Some(error) = envelope.error.filter(|_| envelope.nodes.is_empty()) {
            return Err(AdapterError::Upstream(error));
        }
        Ok(FetchedBatch {
            records: envelope.nodes.into_iter().map(RawRecord::PaperIndex).collect(),
            upstream: UpstreamMeta {
                total: envelope.total,
                failed_topics: envelope.failed_topics,
                has_fallback: envelope.has_fallback,
                freshness_window: envelope.freshness_window,
                cache_hit: envelope.cache_hit,
            },
        })
    }
}

fn authors_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Array(items) => join_names(items.iter().filter_map(scalar_text)),
        other => scalar_text(other),
    }
}

#[async_trait]
impl SourceAdapter for PaperIndexAdapter {
    fn source_id(&self) -> &'static str {
        "paper-index"
    }

    fn source_type(&self) -> SourceType {
        SourceType::PaperIndex
    }

    async fn fetch_batch(
        &self,
        http: &HttpFetcher,
        request: &BatchRequest,
    ) -> Result<FetchedBatch, AdapterError> {
        let spec = RequestSpec::get(format!("{}/papers", self.base_url))
            .query("topic", &request.topic)
            .query("offset", request.offset)
            .query("recent_only", request.recent_only)
            .query("batch_size", request.batch_size);
        let response = http.fetch_bytes(self.source_id(), &spec).await?;
        let batch = self.parse_from(&response.final_url, &response.body)?;
        debug!(
            topic = %request.topic,
            offset = request.offset,
            records = batch.len(),
            cache_hit = ?batch.upstream.cache_hit,
            "paper index batch"
        );
        Ok(batch)
    }

    fn parse_response(&self, body: &[u8]) -> Result<FetchedBatch, AdapterError> {
        self.parse_from(self.source_id(), body)
    }

    async fn normalize(&self, ctx: &NormalizeContext, record: RawRecord) -> Option<GlobeNode> {
        let RawRecord::PaperIndex(raw) = record else {
            return None;
        };
        let source_type = raw.kind.as_deref().map(SourceType::from_raw_tag);
        NodeDraft {
            source_type,
            lat: raw.lat,
            lng: raw.lng,
            title: raw.title,
            authors: authors_text(&raw.authors),
            summary: raw.r#abstract.or(raw.summary),
            published: scalar_text(&raw.published),
            link: raw.link,
            topic: raw.topic,
            is_fallback: raw.is_fallback.unwrap_or(false),
        }
        .finish(ctx)
    }
}
