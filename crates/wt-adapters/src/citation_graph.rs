use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use wt_core::{GlobeNode, NodeDraft, NormalizeContext, SourceType};
use wt_storage::{GeocodeCache, HttpFetcher, RequestSpec};

use crate::{
    decode, join_names, AdapterError, BatchRequest, FetchedBatch, RawRecord, SourceAdapter,
    UpstreamMeta,
};

const SEARCH_FIELDS: &str = "title,abstract,url,authors.name,authors.affiliations,year,publicationDate";

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CitationPaper {
    pub paper_id: Option<String>,
    pub title: Option<String>,
    pub r#abstract: Option<String>,
    pub url: Option<String>,
    pub year: Option<i32>,
    pub publication_date: Option<String>,
    pub authors: Option<Vec<CitationAuthor>>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct CitationAuthor {
    pub name: Option<String>,
    pub affiliations: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchResponse {
    total: Option<usize>,
    data: Option<Vec<CitationPaper>>,
}

impl CitationPaper {
    /// First affiliation longer than three characters, else the first non-blank one.
    pub fn primary_affiliation(&self) -> Option<&str> {
        let all = || {
            self.authors
                .iter()
                .flatten()
                .flat_map(|a| a.affiliations.iter().flatten())
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
        };
        all().find(|s| s.chars().count() > 3).or_else(|| all().next())
    }

    fn published(&self) -> Option<String> {
        self.publication_date
            .clone()
            .and_then(wt_core::text_or_none)
            .or_else(|| self.year.map(|y| y.to_string()))
    }
}

/// Semantic-Scholar-style paper search, geocoded by author affiliation.
pub struct CitationGraphAdapter {
    base_url: String,
    api_key: Option<String>,
    geocoder: Arc<GeocodeCache>,
}

impl CitationGraphAdapter {
    pub fn new(base_url: &str, api_key: Option<String>, geocoder: Arc<GeocodeCache>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.and_then(wt_core::text_or_none),
            geocoder,
        }
    }

    fn parse_from(&self, origin: &str, body: &[u8]) -> Result<FetchedBatch, AdapterError> {
        let response: SearchResponse = decode(origin, body)?;
        Ok(FetchedBatch {
            records: response
                .data
                .unwrap_or_default()
                .into_iter()
                .map(RawRecord::CitationGraph)
                .collect(),
            upstream: UpstreamMeta {
                total: response.total,
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl SourceAdapter for CitationGraphAdapter {
    fn source_id(&self) -> &'static str {
        "citation-graph"
    }

    fn source_type(&self) -> SourceType {
        SourceType::CitationGraph
    }

    fn needs_geocoding(&self) -> bool {
        true
    }

    async fn fetch_batch(
        &self,
        http: &HttpFetcher,
        request: &BatchRequest,
    ) -> Result<FetchedBatch, AdapterError> {
        let mut spec = RequestSpec::get(format!("{}/graph/v1/paper/search", self.base_url))
            .query("query", &request.query)
            .query("offset", request.offset)
            .query("limit", request.batch_size)
            .query("fields", SEARCH_FIELDS);
        if let Some(key) = &self.api_key {
            spec = spec.header("x-api-key", key.clone());
        }
        let response = http.fetch_bytes(self.source_id(), &spec).await?;
        self.parse_from(&response.final_url, &response.body)
    }

    fn parse_response(&self, body: &[u8]) -> Result<FetchedBatch, AdapterError> {
        self.parse_from(self.source_id(), body)
    }

    async fn normalize(&self, ctx: &NormalizeContext, record: RawRecord) -> Option<GlobeNode> {
        let RawRecord::CitationGraph(paper) = record else {
            return None;
        };
        let Some(affiliation) = paper.primary_affiliation() else {
            debug!(paper_id = ?paper.paper_id, "no affiliation; dropping paper");
            return None;
        };
        let coords = self.geocoder.resolve(affiliation).await?;
        let authors = join_names(
            paper
                .authors
                .iter()
                .flatten()
                .filter_map(|a| a.name.as_deref()),
        );
        let published = paper.published();

        NodeDraft {
            source_type: Some(SourceType::CitationGraph),
            lat: Some(coords.lat()),
            lng: Some(coords.lng()),
            title: paper.title,
            authors,
            summary: paper.r#abstract,
            published,
            link: paper.url,
            topic: None,
            is_fallback: false,
        }
        .finish(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{geocode_cache, normalize_fixture, request};
    use std::time::Duration;
    use wiremock::matchers::{header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use wt_core::NO_ABSTRACT;
    use wt_storage::{BackoffPolicy, HttpClientConfig};

    fn http() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: BackoffPolicy::none(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn fixture_keeps_only_geocodable_papers() {
        let cache = geocode_cache();
        let adapter = CitationGraphAdapter::new("http://unused", None, cache.clone());
        let nodes = normalize_fixture(&adapter, "Climate").await;

        assert_eq!(nodes.len(), 2);
        let first = &nodes[0];
        assert_eq!(first.title(), "Graph Neural Networks for Climate Downscaling");
        assert_eq!(first.coordinates().lat(), 47.3763);
        assert_eq!(first.authors_display(), "Ines Duarte, Tomas Berg");
        assert_eq!(first.topic(), "Climate");
        assert!(first.is_recent());

        let second = &nodes[1];
        assert_eq!(second.summary(), NO_ABSTRACT);
        assert_eq!(second.published_date(), "2024");
        assert_eq!(second.authors_display(), "Priya Nair");
        assert!(!second.is_recent());

        // "UK" never reaches the geocoder; the unknown institute is a cached miss.
        assert_eq!(cache.lookups(), 3);
    }

    #[test]
    fn affiliation_prefers_longer_names() {
        let paper = CitationPaper {
            authors: Some(vec![
                CitationAuthor {
                    name: Some("A".to_string()),
                    affiliations: Some(vec!["MIT".to_string()]),
                },
                CitationAuthor {
                    name: Some("B".to_string()),
                    affiliations: Some(vec![" Stanford University ".to_string()]),
                },
            ]),
            ..Default::default()
        };
        assert_eq!(paper.primary_affiliation(), Some("Stanford University"));
        assert_eq!(CitationPaper::default().primary_affiliation(), None);
    }

    #[tokio::test]
    async fn search_sends_fields_and_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/graph/v1/paper/search"))
            .and(query_param("query", "climate change OR global warming"))
            .and(query_param("offset", "20"))
            .and(query_param("limit", "10"))
            .and(query_param("fields", SEARCH_FIELDS))
            .and(header("x-api-key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total": 0, "offset": 20
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = CitationGraphAdapter::new(&server.uri(), Some("secret".to_string()), geocode_cache());
        let batch = adapter
            .fetch_batch(&http(), &request("Climate", "climate change OR global warming"))
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.upstream.total, Some(0));
    }

    #[tokio::test]
    async fn blank_api_key_is_not_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header_exists("x-api-key"))
            .respond_with(ResponseTemplate::new(401))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .mount(&server)
            .await;

        let adapter = CitationGraphAdapter::new(&server.uri(), Some("  ".to_string()), geocode_cache());
        assert!(adapter.fetch_batch(&http(), &request("AI", "ai")).await.is_ok());
    }
}
