use std::sync::Arc;

use async_trait::async_trait;
use scraper::Html;
use serde::Deserialize;
use tracing::debug;
use wt_core::{GlobeNode, NodeDraft, NormalizeContext, SourceType};
use wt_storage::{GeocodeCache, HttpFetcher, RequestSpec};

use crate::{
    decode, join_names, AdapterError, BatchRequest, FetchedBatch, RawRecord, SourceAdapter,
    UpstreamMeta,
};

/// One item of a Crossref-style `message.items` list.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct BibliographicWork {
    pub title: Vec<String>,
    pub r#abstract: Option<String>,
    #[serde(rename = "URL")]
    pub url: Option<String>,
    pub author: Vec<WorkAuthor>,
    pub published: Option<DateParts>,
    pub issued: Option<DateParts>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct WorkAuthor {
    pub given: Option<String>,
    pub family: Option<String>,
    pub affiliation: Vec<WorkAffiliation>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct WorkAffiliation {
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct DateParts {
    #[serde(rename = "date-parts")]
    pub date_parts: Vec<Vec<Option<i64>>>,
}

impl DateParts {
    /// `[[2025, 7]]` renders as `2025-07`; missing parts are left off.
    pub fn render(&self) -> Option<String> {
        let parts = self.date_parts.first()?;
        let mut fields = parts.iter().map_while(|p| *p);
        let year = fields.next()?;
        let mut out = format!("{year:04}");
        for part in fields.take(2) {
            out.push_str(&format!("-{part:02}"));
        }
        Some(out)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WorksResponse {
    message: WorksMessage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WorksMessage {
    #[serde(rename = "total-results")]
    total_results: Option<usize>,
    items: Vec<BibliographicWork>,
}

impl BibliographicWork {
    /// The first author's first affiliation name.
    pub fn primary_affiliation(&self) -> Option<&str> {
        self.author
            .first()?
            .affiliation
            .first()?
            .name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn authors_display(&self) -> Option<String> {
        join_names(self.author.iter().map(|a| {
            [a.given.as_deref(), a.family.as_deref()]
                .into_iter()
                .flatten()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        }))
    }

    fn published_date(&self) -> Option<String> {
        self.published
            .as_ref()
            .and_then(DateParts::render)
            .or_else(|| self.issued.as_ref().and_then(DateParts::render))
    }
}

/// Text content of a JATS/HTML abstract with entities decoded and whitespace collapsed.
pub(crate) fn strip_markup(text: &str) -> String {
    let fragment = Html::parse_fragment(text);
    let joined = fragment
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ");
    // Element boundaries next to punctuation leave a stray space.
    joined
        .replace(" .", ".")
        .replace(" ,", ",")
        .replace(" )", ")")
        .replace("( ", "(")
}

/// Crossref-style bibliographic search, geocoded by the first author's affiliation.
pub struct AffiliationIndexAdapter {
    base_url: String,
    geocoder: Arc<GeocodeCache>,
}

impl AffiliationIndexAdapter {
    pub fn new(base_url: &str, geocoder: Arc<GeocodeCache>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            geocoder,
        }
    }

    fn parse_from(&self, origin: &str, body: &[u8]) -> Result<FetchedBatch, AdapterError> {
        let response: WorksResponse = decode(origin, body)?;
        Ok(FetchedBatch {
            records: response
                .message
                .items
                .into_iter()
                .map(RawRecord::AffiliationIndex)
                .collect(),
            upstream: UpstreamMeta {
                total: response.message.total_results,
                ..Default::default()
            },
        })
    }
}

#[async_trait]
impl SourceAdapter for AffiliationIndexAdapter {
    fn source_id(&self) -> &'static str {
        "affiliation-index"
    }

    fn source_type(&self) -> SourceType {
        SourceType::AffiliationIndex
    }

    fn needs_geocoding(&self) -> bool {
        true
    }

    async fn fetch_batch(
        &self,
        http: &HttpFetcher,
        request: &BatchRequest,
    ) -> Result<FetchedBatch, AdapterError> {
        let spec = RequestSpec::get(format!("{}/works", self.base_url))
            .query("query", &request.query)
            .query("rows", request.batch_size)
            .query("offset", request.offset);
        let response = http.fetch_bytes(self.source_id(), &spec).await?;
        self.parse_from(&response.final_url, &response.body)
    }

    fn parse_response(&self, body: &[u8]) -> Result<FetchedBatch, AdapterError> {
        self.parse_from(self.source_id(), body)
    }

    async fn normalize(&self, ctx: &NormalizeContext, record: RawRecord) -> Option<GlobeNode> {
        let RawRecord::AffiliationIndex(work) = record else {
            return None;
        };
        let Some(affiliation) = work.primary_affiliation() else {
            debug!(title = ?work.title.first(), "first author has no affiliation; dropping work");
            return None;
        };
        let coords = self.geocoder.resolve(affiliation).await?;
        let authors = work.authors_display();
        let published = work.published_date();
        let summary = work.r#abstract.as_deref().map(strip_markup);

        NodeDraft {
            source_type: Some(SourceType::AffiliationIndex),
            lat: Some(coords.lat()),
            lng: Some(coords.lng()),
            title: work.title.into_iter().next(),
            authors,
            summary,
            published,
            link: work.url,
            topic: None,
            is_fallback: false,
        }
        .finish(ctx)
    }
}
