//! Topic loads: batched fetches across routed sources, filtered, deduplicated and
//! delivered as a finite stream that a newer load supersedes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_stream::stream;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;
use wt_adapters::{BatchRequest, SourceAdapter, UpstreamMeta};
use wt_core::{DedupKey, FreshnessPolicy, GlobeNode, NormalizeContext, PartialSourceFailure};
use wt_storage::HttpFetcher;

use crate::topics::{is_all_topics, Route, TopicRegistry};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_TOTAL_NODES: usize = 50;
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(300);
/// Upper bound on pages requested from one source in a single run.
pub const MAX_PAGES_PER_SOURCE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Delivery {
    /// One `NodeBatch` per fetched page.
    Progressive,
    /// A single combined `NodeBatch` at the end of the run.
    Bulk,
}

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub freshness: FreshnessPolicy,
    pub recent_only: bool,
    pub total: usize,
    pub batch_size: usize,
    pub delivery: Delivery,
    pub batch_delay: Duration,
    /// Substitute placeholders when a run would otherwise deliver nothing.
    pub fallback_on_empty: bool,
    /// Evaluation instant for recency; the run start when unset.
    pub now: Option<DateTime<Utc>>,
}

impl AggregateOptions {
    pub fn new(freshness: FreshnessPolicy) -> Self {
        Self {
            freshness,
            recent_only: false,
            total: DEFAULT_TOTAL_NODES,
            batch_size: DEFAULT_BATCH_SIZE,
            delivery: Delivery::Progressive,
            batch_delay: DEFAULT_BATCH_DELAY,
            fallback_on_empty: true,
            now: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEnd {
    TotalReached,
    Exhausted,
    AllSourcesFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchMeta {
    pub run_id: Uuid,
    pub generation: u64,
    pub topic: String,
    pub batch_index: usize,
    pub offset: usize,
    pub failed_sources: Vec<String>,
    pub has_fallback: bool,
    pub freshness_window: String,
    pub delivered_total: usize,
    /// Present on the last batch of a run.
    pub end: Option<RunEnd>,
}

impl BatchMeta {
    /// Some sources failed while the run kept going with the rest.
    pub fn partial_failure(&self) -> Option<PartialSourceFailure> {
        if self.failed_sources.is_empty() || self.end == Some(RunEnd::AllSourcesFailed) {
            return None;
        }
        Some(PartialSourceFailure {
            failed_sources: self.failed_sources.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeBatch {
    pub nodes: Vec<GlobeNode>,
    pub meta: BatchMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub nodes: Vec<GlobeNode>,
    /// Meta of the last batch received.
    pub meta: BatchMeta,
    pub batches: usize,
}

/// Drain a run. `None` when the run was superseded before delivering anything.
pub async fn collect_run<S>(batches: S) -> Option<RunSummary>
where
    S: Stream<Item = NodeBatch>,
{
    let mut batches = std::pin::pin!(batches);
    let mut summary: Option<RunSummary> = None;
    while let Some(batch) = batches.next().await {
        match summary.as_mut() {
            Some(summary) => {
                summary.nodes.extend(batch.nodes);
                summary.meta = batch.meta;
                summary.batches += 1;
            }
            None => {
                summary = Some(RunSummary {
                    nodes: batch.nodes,
                    meta: batch.meta,
                    batches: 1,
                })
            }
        }
    }
    summary
}

struct Inner {
    http: Arc<HttpFetcher>,
    registry: TopicRegistry,
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
    generation: AtomicU64,
}

impl Inner {
    fn plan(&self, topic: &str) -> Vec<Slot> {
        let slot = |source_id: &str, label: String, topic: &str, query: &str| {
            self.adapters.get(source_id).map(|adapter| Slot {
                adapter: adapter.clone(),
                label,
                topic: topic.to_string(),
                query: query.to_string(),
                state: SlotState::Active,
                contributed: 0,
                pages: 0,
            })
        };
        match self.registry.route(topic) {
            Route::Fast {
                source_id,
                topic,
                query,
            } => slot(source_id.as_str(), source_id.clone(), topic.as_str(), query.as_str())
                .into_iter()
                .collect(),
            Route::Slow {
                source_ids,
                topic,
                query,
            } => source_ids
                .iter()
                .filter_map(|id| slot(id.as_str(), id.clone(), topic.as_str(), query.as_str()))
                .collect(),
            Route::FanOut { source_id, topics } => topics
                .iter()
                .filter_map(|(topic, query)| {
                    let label = format!("{source_id}:{topic}");
                    slot(source_id.as_str(), label, topic.as_str(), query.as_str())
                })
                .collect(),
        }
    }
}

/// Drives source adapters for one caller. Each `load_topic` supersedes the previous one.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<Inner>,
}

impl Aggregator {
    /// Fails if the registry routes to a source with no adapter.
    pub fn new(
        http: Arc<HttpFetcher>,
        registry: TopicRegistry,
        adapters: impl IntoIterator<Item = Arc<dyn SourceAdapter>>,
    ) -> Result<Self> {
        let adapters: HashMap<_, _> = adapters
            .into_iter()
            .map(|adapter| (adapter.source_id().to_string(), adapter))
            .collect();
        for source_id in registry.source_ids() {
            if !adapters.contains_key(&source_id) {
                bail!("no adapter registered for {source_id}");
            }
        }
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                registry,
                adapters,
                generation: AtomicU64::new(0),
            }),
        })
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.inner.registry
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Invalidate any in-flight run without starting another.
    pub fn cancel(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Start a run for `topic`. The previous run is invalidated now, not on first poll.
    pub fn load_topic(
        &self,
        topic: &str,
        options: AggregateOptions,
    ) -> impl Stream<Item = NodeBatch> + Send + 'static {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut run = RunState::new(self.inner.clone(), generation, topic, options);

        stream! {
            info!(parent: &run.span, slots = run.slots.len(), "topic load started");
            let mut pending: Vec<GlobeNode> = Vec::new();
            loop {
                if run.steps > 0 && !run.options.batch_delay.is_zero() {
                    tokio::time::sleep(run.options.batch_delay).await;
                }
                if !run.is_current() {
                    debug!(parent: &run.span, "superseded; ending run");
                    return;
                }

                let mut nodes = if run.end_state().is_some() {
                    Vec::new()
                } else {
                    match run.step().await {
                        Some(nodes) => nodes,
                        None => {
                            debug!(parent: &run.span, "superseded mid-batch; discarding");
                            return;
                        }
                    }
                };

                let end = run.end_state();
                if end.is_some() {
                    run.substitute_fallbacks(&mut nodes);
                }
                let offset = run.offset;
                let batch_index = run.steps;
                run.offset += run.options.batch_size;
                run.steps += 1;

                match run.options.delivery {
                    Delivery::Progressive => {
                        if !run.is_current() {
                            return;
                        }
                        yield run.batch(nodes, batch_index, offset, end);
                    }
                    Delivery::Bulk => {
                        pending.append(&mut nodes);
                        if end.is_some() {
                            if !run.is_current() {
                                return;
                            }
                            yield run.batch(std::mem::take(&mut pending), 0, offset, end);
                        }
                    }
                }

                if let Some(end) = end {
                    info!(
                        parent: &run.span,
                        ?end,
                        delivered = run.delivered.len(),
                        failed_sources = ?run.failed_sources,
                        "topic load finished"
                    );
                    break;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Active,
    Exhausted,
    Failed,
}

/// One (source, topic) pair queried page by page during a run.
struct Slot {
    adapter: Arc<dyn SourceAdapter>,
    label: String,
    topic: String,
    query: String,
    state: SlotState,
    contributed: usize,
    pages: usize,
}

struct RunState {
    inner: Arc<Inner>,
    generation: u64,
    run_id: Uuid,
    topic: String,
    options: AggregateOptions,
    now: DateTime<Utc>,
    slots: Vec<Slot>,
    delivered: HashSet<DedupKey>,
    /// Every key normalized so far, delivered or filtered out.
    seen: HashSet<DedupKey>,
    failed_sources: Vec<String>,
    upstream_fallback: bool,
    fallback_delivered: bool,
    offset: usize,
    steps: usize,
    span: Span,
}

impl RunState {
    fn new(inner: Arc<Inner>, generation: u64, topic: &str, mut options: AggregateOptions) -> Self {
        options.batch_size = options.batch_size.max(1);
        let slots = inner.plan(topic);
        let topic = if is_all_topics(topic) {
            "all".to_string()
        } else {
            topic.trim().to_string()
        };
        let run_id = Uuid::new_v4();
        let span = info_span!("aggregate", %run_id, topic = %topic, generation);
        Self {
            inner,
            generation,
            run_id,
            topic,
            now: options.now.unwrap_or_else(Utc::now),
            options,
            slots,
            delivered: HashSet::new(),
            seen: HashSet::new(),
            failed_sources: Vec::new(),
            upstream_fallback: false,
            fallback_delivered: false,
            offset: 0,
            steps: 0,
            span,
        }
    }

    fn is_current(&self) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == self.generation
    }

    fn remaining(&self) -> usize {
        self.options.total.saturating_sub(self.delivered.len())
    }

    fn end_state(&self) -> Option<RunEnd> {
        if self.remaining() == 0 {
            return Some(RunEnd::TotalReached);
        }
        if self.slots.iter().any(|s| s.state == SlotState::Active) {
            return None;
        }
        if !self.slots.is_empty() && self.slots.iter().all(|s| s.state == SlotState::Failed) {
            Some(RunEnd::AllSourcesFailed)
        } else {
            Some(RunEnd::Exhausted)
        }
    }

    fn record_failure(&mut self, label: &str) {
        if !self.failed_sources.iter().any(|f| f == label) {
            self.failed_sources.push(label.to_string());
        }
    }

    fn absorb_upstream(&mut self, upstream: &UpstreamMeta) {
        for topic in &upstream.failed_topics {
            self.record_failure(topic);
        }
        self.upstream_fallback |= upstream.has_fallback;
        if let Some(window) = &upstream.freshness_window {
            if *window != self.options.freshness.label() {
                debug!(parent: &self.span, upstream_window = %window, "upstream used a different freshness window");
            }
        }
    }

    /// Fetch the current page from every active slot. `None` once superseded.
    async fn step(&mut self) -> Option<Vec<GlobeNode>> {
        let mut out = Vec::new();
        for index in 0..self.slots.len() {
            if self.slots[index].state != SlotState::Active || self.remaining() == 0 {
                continue;
            }
            let adapter = self.slots[index].adapter.clone();
            let label = self.slots[index].label.clone();
            let request = BatchRequest {
                topic: self.slots[index].topic.clone(),
                query: self.slots[index].query.clone(),
                offset: self.offset,
                batch_size: self.options.batch_size,
                recent_only: self.options.recent_only,
            };

            let fetched = adapter
                .fetch_batch(&self.inner.http, &request)
                .instrument(self.span.clone())
                .await;
            if !self.is_current() {
                return None;
            }
            let batch = match fetched {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(
                        parent: &self.span,
                        source = %label,
                        offset = self.offset,
                        timeout = err.is_timeout(),
                        error = %err,
                        "source failed; continuing without it"
                    );
                    self.slots[index].state = SlotState::Failed;
                    self.record_failure(&label);
                    continue;
                }
            };
            self.slots[index].pages += 1;
            self.absorb_upstream(&batch.upstream);
            let short_page = batch.len() < self.options.batch_size;
            let past_total = batch
                .upstream
                .total
                .is_some_and(|total| self.offset + batch.len() >= total);

            let ctx = NormalizeContext {
                topic: request.topic,
                freshness: self.options.freshness,
                now: self.now,
            };
            let received = batch.len();
            let normalized = if adapter.needs_geocoding() {
                let mut nodes = Vec::with_capacity(received);
                for record in batch.records {
                    let node = adapter.normalize(&ctx, record).instrument(self.span.clone()).await;
                    if !self.is_current() {
                        return None;
                    }
                    nodes.push(node);
                }
                nodes
            } else {
                join_all(batch.records.into_iter().map(|record| adapter.normalize(&ctx, record))).await
            };
            if !self.is_current() {
                return None;
            }

            let before = out.len();
            let mut normalized_any = false;
            let mut unseen_any = false;
            for node in normalized.into_iter().flatten() {
                normalized_any = true;
                unseen_any |= self.seen.insert(node.dedup_key());
                if self.remaining() == 0 {
                    break;
                }
                if self.options.recent_only && !node.is_fallback() && !node.is_recent() {
                    continue;
                }
                if !self.delivered.insert(node.dedup_key()) {
                    continue;
                }
                self.fallback_delivered |= node.is_fallback();
                out.push(node);
            }
            self.slots[index].contributed += out.len() - before;

            // Upstreams that ignore `offset` keep serving the same full page.
            let repeated_page = normalized_any && !unseen_any;
            let page_cap = self.slots[index].pages >= MAX_PAGES_PER_SOURCE;
            if short_page || past_total || repeated_page || page_cap {
                self.slots[index].state = SlotState::Exhausted;
                debug!(
                    parent: &self.span,
                    source = %label,
                    short_page,
                    past_total,
                    repeated_page,
                    page_cap,
                    "source exhausted"
                );
            }
            debug!(
                parent: &self.span,
                source = %label,
                offset = self.offset,
                received,
                accepted = out.len() - before,
                "page processed"
            );
        }
        Some(out)
    }

    /// One placeholder per failed or empty slot, only when nothing was delivered.
    fn substitute_fallbacks(&mut self, nodes: &mut Vec<GlobeNode>) {
        if !self.options.fallback_on_empty || !self.delivered.is_empty() || self.options.total == 0 {
            return;
        }
        let sources: Vec<(String, String)> = self
            .slots
            .iter()
            .filter(|s| s.state == SlotState::Failed || s.contributed == 0)
            .map(|s| (s.topic.clone(), s.label.clone()))
            .collect();
        for (slot, (topic, label)) in sources.into_iter().enumerate() {
            if self.remaining() == 0 {
                break;
            }
            let placeholder = GlobeNode::placeholder(&topic, &label, slot);
            if self.delivered.insert(placeholder.dedup_key()) {
                self.fallback_delivered = true;
                nodes.push(placeholder);
            }
        }
        if !nodes.is_empty() {
            info!(parent: &self.span, placeholders = nodes.len(), "no live results; substituted placeholders");
        }
    }

    fn batch(&self, nodes: Vec<GlobeNode>, batch_index: usize, offset: usize, end: Option<RunEnd>) -> NodeBatch {
        NodeBatch {
            nodes,
            meta: BatchMeta {
                run_id: self.run_id,
                generation: self.generation,
                topic: self.topic.clone(),
                batch_index,
                offset,
                failed_sources: self.failed_sources.clone(),
                has_fallback: !self.failed_sources.is_empty()
                    || self.upstream_fallback
                    || self.fallback_delivered,
                freshness_window: self.options.freshness.label(),
                delivered_total: self.delivered.len(),
                end,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tokio::sync::Notify;
    use wt_adapters::{AdapterError, FetchedBatch, PaperIndexAdapter, RawNode, RawRecord};
    use wt_core::{LONG_WINDOW_DAYS, SourceType};
    use wt_storage::HttpClientConfig;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn raw(title: &str, lat: f64, days_ago: i64) -> RawNode {
        RawNode {
            kind: Some("arxiv".to_string()),
            lat: Some(lat),
            lng: Some(10.0),
            title: Some(title.to_string()),
            published: serde_json::json!((now() - ChronoDuration::days(days_ago)).format("%Y-%m-%d").to_string()),
            link: Some(format!("https://example.org/{title}")),
            ..Default::default()
        }
    }

    fn page(nodes: Vec<RawNode>) -> Result<FetchedBatch, ()> {
        Ok(FetchedBatch::new(nodes.into_iter().map(RawRecord::PaperIndex).collect()))
    }

    /// Serves scripted pages in call order; `Err(())` pages fail.
    struct ScriptedAdapter {
        id: &'static str,
        pages: StdMutex<VecDeque<Result<FetchedBatch, ()>>>,
        requests: StdMutex<Vec<BatchRequest>>,
        calls: AtomicUsize,
        first_call_gate: Option<Arc<Notify>>,
        geocodes: bool,
    }

    impl ScriptedAdapter {
        fn new(id: &'static str, pages: Vec<Result<FetchedBatch, ()>>) -> Arc<Self> {
            Arc::new(Self {
                id,
                pages: StdMutex::new(pages.into()),
                requests: StdMutex::default(),
                calls: AtomicUsize::new(0),
                first_call_gate: None,
                geocodes: id != "paper-index",
            })
        }

        fn gated(id: &'static str, pages: Vec<Result<FetchedBatch, ()>>, gate: Arc<Notify>) -> Arc<Self> {
            let adapter = Self::new(id, pages);
            let mut adapter = Arc::into_inner(adapter).unwrap();
            adapter.first_call_gate = Some(gate);
            Arc::new(adapter)
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn requests(&self) -> Vec<BatchRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedAdapter {
        fn source_id(&self) -> &'static str {
            self.id
        }

        fn source_type(&self) -> SourceType {
            SourceType::PaperIndex
        }

        fn needs_geocoding(&self) -> bool {
            self.geocodes
        }

        async fn fetch_batch(
            &self,
            _http: &HttpFetcher,
            request: &BatchRequest,
        ) -> Result<FetchedBatch, AdapterError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            if call == 0 {
                if let Some(gate) = &self.first_call_gate {
                    gate.notified().await;
                }
            }
            let next = self.pages.lock().unwrap().pop_front();
            match next {
                Some(Ok(batch)) => Ok(batch),
                Some(Err(())) => Err(AdapterError::Upstream(format!("{} unavailable", self.id))),
                None => Ok(FetchedBatch::default()),
            }
        }

        fn parse_response(&self, _body: &[u8]) -> Result<FetchedBatch, AdapterError> {
            Err(AdapterError::Upstream("scripted adapters have no wire format".to_string()))
        }

        async fn normalize(&self, ctx: &NormalizeContext, record: RawRecord) -> Option<GlobeNode> {
            PaperIndexAdapter::new("http://unused").normalize(ctx, record).await
        }
    }

    fn aggregator(scripted: &[Arc<ScriptedAdapter>]) -> Aggregator {
        let mut adapters: Vec<Arc<dyn SourceAdapter>> =
            scripted.iter().map(|a| a.clone() as Arc<dyn SourceAdapter>).collect();
        for id in ["paper-index", "affiliation-index", "citation-graph"] {
            if !scripted.iter().any(|a| a.id == id) {
                adapters.push(ScriptedAdapter::new(id, Vec::new()));
            }
        }
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        Aggregator::new(http, TopicRegistry::default(), adapters).unwrap()
    }

    fn options() -> AggregateOptions {
        AggregateOptions {
            batch_delay: Duration::ZERO,
            now: Some(now()),
            ..AggregateOptions::new(FreshnessPolicy::new(LONG_WINDOW_DAYS))
        }
    }

    fn titles(nodes: &[GlobeNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.title()).collect()
    }

    #[tokio::test]
    async fn recent_only_keeps_records_inside_the_window() {
        let papers = ScriptedAdapter::new(
            "paper-index",
            vec![page(vec![raw("five", 1.0, 5), raw("forty", 2.0, 40), raw("ninety", 3.0, 90)])],
        );
        let agg = aggregator(&[papers.clone()]);

        let run = collect_run(agg.load_topic("AI", AggregateOptions { recent_only: true, ..options() }))
            .await
            .unwrap();
        assert_eq!(titles(&run.nodes), vec!["five", "forty"]);
        assert_eq!(run.meta.freshness_window, "60 days");
        assert_eq!(run.meta.end, Some(RunEnd::Exhausted));
        assert!(!run.meta.has_fallback);
        assert!(papers.requests()[0].recent_only);
    }

    #[tokio::test]
    async fn fallback_nodes_are_exempt_from_recency() {
        let mut stale_placeholder = raw("placeholder", 4.0, 400);
        stale_placeholder.is_fallback = Some(true);
        let papers = ScriptedAdapter::new("paper-index", vec![page(vec![raw("old", 1.0, 90), stale_placeholder])]);
        let agg = aggregator(&[papers]);

        let run = collect_run(agg.load_topic("AI", AggregateOptions { recent_only: true, ..options() }))
            .await
            .unwrap();
        assert_eq!(titles(&run.nodes), vec!["placeholder"]);
        assert!(run.nodes[0].is_fallback());
        assert_eq!(run.nodes[0].link(), None);
        assert!(run.meta.has_fallback);
    }

    #[tokio::test]
    async fn duplicates_keep_the_first_delivery() {
        let mut first = raw("Same Title", 1.0, 5);
        first.r#abstract = Some("first summary".to_string());
        let mut second = raw("same title!", 1.0, 5);
        second.r#abstract = Some("second summary".to_string());
        let papers = ScriptedAdapter::new("paper-index", vec![page(vec![first, second, raw("Other", 1.0, 5)])]);
        let agg = aggregator(&[papers]);

        let run = collect_run(agg.load_topic("AI", options())).await.unwrap();
        assert_eq!(run.nodes.len(), 2);
        assert_eq!(run.nodes[0].summary(), "first summary");
        let keys: HashSet<_> = run.nodes.iter().map(GlobeNode::dedup_key).collect();
        assert_eq!(keys.len(), run.nodes.len());
    }

    #[tokio::test]
    async fn failed_source_is_reported_and_not_retried() {
        let crossref = ScriptedAdapter::new("affiliation-index", vec![Err(())]);
        let scholar = ScriptedAdapter::new(
            "citation-graph",
            vec![page(vec![raw("a", 1.0, 5), raw("b", 2.0, 5)]), page(vec![raw("c", 3.0, 5)])],
        );
        let agg = aggregator(&[crossref.clone(), scholar.clone()]);

        let run = collect_run(agg.load_topic("Medicine", AggregateOptions { batch_size: 2, ..options() }))
            .await
            .unwrap();
        assert_eq!(titles(&run.nodes), vec!["a", "b", "c"]);
        assert_eq!(run.meta.failed_sources, vec!["affiliation-index".to_string()]);
        assert!(run.meta.has_fallback);
        assert_eq!(
            run.meta.partial_failure().unwrap().failed_sources,
            vec!["affiliation-index".to_string()]
        );
        assert_eq!(crossref.calls(), 1);
        let offsets: Vec<_> = scholar.requests().iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 2]);
        assert_eq!(scholar.requests()[0].query, "medical research OR healthcare");
        assert!(run.nodes.iter().all(|n| n.topic() == "Medicine"));
    }

    #[tokio::test]
    async fn progressive_batches_are_ordered_and_truncated_to_total() {
        let papers = ScriptedAdapter::new(
            "paper-index",
            vec![
                page(vec![raw("a", 1.0, 5), raw("b", 2.0, 5)]),
                page(vec![raw("c", 3.0, 5), raw("d", 4.0, 5)]),
                page(vec![raw("e", 5.0, 5), raw("f", 6.0, 5)]),
            ],
        );
        let agg = aggregator(&[papers.clone()]);
        let opts = AggregateOptions {
            batch_size: 2,
            total: 3,
            ..options()
        };

        let batches: Vec<NodeBatch> = agg.load_topic("Space", opts).collect().await;
        assert_eq!(batches.len(), 2);
        assert_eq!(titles(&batches[0].nodes), vec!["a", "b"]);
        assert_eq!(titles(&batches[1].nodes), vec!["c"]);
        assert_eq!((batches[0].meta.batch_index, batches[0].meta.offset), (0, 0));
        assert_eq!((batches[1].meta.batch_index, batches[1].meta.offset), (1, 2));
        assert_eq!(batches[0].meta.end, None);
        assert_eq!(batches[1].meta.end, Some(RunEnd::TotalReached));
        assert_eq!(batches[1].meta.delivered_total, 3);
        assert_eq!(papers.calls(), 2);
    }

    #[tokio::test]
    async fn bulk_mode_yields_one_combined_batch() {
        let papers = ScriptedAdapter::new(
            "paper-index",
            vec![
                page(vec![raw("a", 1.0, 5), raw("b", 2.0, 5)]),
                page(vec![raw("c", 3.0, 5)]),
            ],
        );
        let agg = aggregator(&[papers]);
        let opts = AggregateOptions {
            batch_size: 2,
            delivery: Delivery::Bulk,
            ..options()
        };

        let batches: Vec<NodeBatch> = agg.load_topic("AI", opts).collect().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(titles(&batches[0].nodes), vec!["a", "b", "c"]);
        assert_eq!(batches[0].meta.end, Some(RunEnd::Exhausted));
    }

    #[tokio::test]
    async fn starting_a_new_load_invalidates_the_previous_stream() {
        let papers = ScriptedAdapter::new(
            "paper-index",
            vec![page(vec![raw("space", 1.0, 5)])],
        );
        let agg = aggregator(&[papers.clone()]);

        let stale = agg.load_topic("AI", options());
        let fresh = agg.load_topic("Space", options());
        assert!(collect_run(stale).await.is_none());
        let run = collect_run(fresh).await.unwrap();
        assert_eq!(titles(&run.nodes), vec!["space"]);
        assert_eq!(run.meta.generation, agg.generation());
        assert_eq!(papers.calls(), 1);
    }

    #[tokio::test]
    async fn in_flight_batch_from_a_superseded_run_is_discarded() {
        let gate = Arc::new(Notify::new());
        let papers = ScriptedAdapter::gated(
            "paper-index",
            vec![page(vec![raw("stale", 1.0, 5)]), page(vec![raw("fresh", 2.0, 5)])],
            gate.clone(),
        );
        let agg = aggregator(&[papers.clone()]);

        let first = tokio::spawn(collect_run(agg.load_topic("AI", options())));
        while papers.calls() == 0 {
            tokio::task::yield_now().await;
        }
        let second = agg.load_topic("Space", options());
        gate.notify_one();

        assert!(first.await.unwrap().is_none());
        let run = collect_run(second).await.unwrap();
        assert_eq!(titles(&run.nodes), vec!["fresh"]);
    }

    #[tokio::test]
    async fn all_topics_fans_out_with_labelled_failures() {
        let mut upstream = page(vec![raw("orbit", 1.0, 5)]).unwrap();
        upstream.upstream.failed_topics = vec!["Quantum".to_string(), "Quantum".to_string()];
        let papers = ScriptedAdapter::new("paper-index", vec![Err(()), Ok(upstream), page(Vec::new())]);
        let agg = aggregator(&[papers.clone()]);

        let run = collect_run(agg.load_topic("all", options())).await.unwrap();
        let topics: Vec<_> = papers.requests().into_iter().map(|r| r.topic).collect();
        assert_eq!(topics, vec!["AI", "Space", "Environment"]);
        assert_eq!(titles(&run.nodes), vec!["orbit"]);
        assert_eq!(run.nodes[0].topic(), "Space");
        assert_eq!(run.meta.topic, "all");
        assert_eq!(
            run.meta.failed_sources,
            vec!["paper-index:AI".to_string(), "Quantum".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_runs_fall_back_to_placeholders() {
        let crossref = ScriptedAdapter::new("affiliation-index", vec![Err(())]);
        let scholar = ScriptedAdapter::new("citation-graph", vec![Err(())]);
        let agg = aggregator(&[crossref, scholar]);

        let run = collect_run(agg.load_topic("Quantum", options())).await.unwrap();
        assert_eq!(run.meta.end, Some(RunEnd::AllSourcesFailed));
        assert_eq!(run.nodes.len(), 2);
        assert!(run.nodes.iter().all(|n| n.is_fallback() && n.link().is_none()));
        assert_eq!(run.nodes[0].title(), "No live results for Quantum");
        assert_ne!(run.nodes[0].coordinates(), run.nodes[1].coordinates());
        assert!(run.meta.has_fallback);
        assert!(run.meta.partial_failure().is_none());
    }

    #[tokio::test]
    async fn placeholders_can_be_disabled() {
        let agg = aggregator(&[ScriptedAdapter::new("paper-index", vec![page(Vec::new())])]);

        let run = collect_run(agg.load_topic("AI", AggregateOptions { fallback_on_empty: false, ..options() }))
            .await
            .unwrap();
        assert!(run.nodes.is_empty());
        assert_eq!(run.meta.end, Some(RunEnd::Exhausted));
        assert!(!run.meta.has_fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_are_spaced_by_the_configured_delay() {
        let papers = ScriptedAdapter::new(
            "paper-index",
            vec![
                page(vec![raw("a", 1.0, 5)]),
                page(vec![raw("b", 2.0, 5)]),
                page(Vec::new()),
            ],
        );
        let agg = aggregator(&[papers]);
        let opts = AggregateOptions {
            batch_size: 1,
            batch_delay: Duration::from_millis(300),
            ..options()
        };

        let start = tokio::time::Instant::now();
        let batches: Vec<NodeBatch> = agg.load_topic("AI", opts).collect().await;
        assert_eq!(batches.len(), 3);
        assert!(start.elapsed() >= Duration::from_millis(600));
    }

    /// Serves the same full page no matter which offset is asked for.
    struct EchoAdapter {
        records: Vec<RawNode>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SourceAdapter for EchoAdapter {
        fn source_id(&self) -> &'static str {
            "paper-index"
        }

        fn source_type(&self) -> SourceType {
            SourceType::PaperIndex
        }

        async fn fetch_batch(
            &self,
            _http: &HttpFetcher,
            _request: &BatchRequest,
        ) -> Result<FetchedBatch, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(FetchedBatch::new(
                self.records.iter().cloned().map(RawRecord::PaperIndex).collect(),
            ))
        }

        fn parse_response(&self, _body: &[u8]) -> Result<FetchedBatch, AdapterError> {
            Err(AdapterError::Upstream("echo adapters have no wire format".to_string()))
        }

        async fn normalize(&self, ctx: &NormalizeContext, record: RawRecord) -> Option<GlobeNode> {
            PaperIndexAdapter::new("http://unused").normalize(ctx, record).await
        }
    }

    #[tokio::test]
    async fn upstream_ignoring_offset_ends_the_run() {
        let echo = Arc::new(EchoAdapter {
            records: (0..5).map(|i| raw(&format!("paper {i}"), i as f64, 5)).collect(),
            calls: AtomicUsize::new(0),
        });
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            echo.clone(),
            ScriptedAdapter::new("affiliation-index", Vec::new()),
            ScriptedAdapter::new("citation-graph", Vec::new()),
        ];
        let agg = Aggregator::new(http, TopicRegistry::default(), adapters).unwrap();
        let opts = AggregateOptions {
            batch_size: 5,
            total: 50,
            ..options()
        };

        let batches: Vec<NodeBatch> = agg.load_topic("AI", opts).take(500).collect().await;
        assert_eq!(batches.len(), 2);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 2);
        let last = batches.last().unwrap();
        assert_eq!(last.meta.end, Some(RunEnd::Exhausted));
        assert_eq!(last.meta.delivered_total, 5);
        assert!(last.nodes.is_empty());
    }

    #[tokio::test]
    async fn reported_total_stops_paging() {
        let mut first = page(vec![raw("a", 1.0, 5), raw("b", 2.0, 5)]).unwrap();
        first.upstream.total = Some(2);
        let papers = ScriptedAdapter::new(
            "paper-index",
            vec![Ok(first), page(vec![raw("never", 3.0, 5), raw("asked", 4.0, 5)])],
        );
        let agg = aggregator(&[papers.clone()]);

        let run = collect_run(agg.load_topic("AI", AggregateOptions { batch_size: 2, ..options() }))
            .await
            .unwrap();
        assert_eq!(titles(&run.nodes), vec!["a", "b"]);
        assert_eq!(run.meta.end, Some(RunEnd::Exhausted));
        assert_eq!(papers.calls(), 1);
    }

    #[tokio::test]
    async fn filtered_pages_are_not_mistaken_for_repeats() {
        let papers = ScriptedAdapter::new(
            "paper-index",
            vec![
                page(vec![raw("old a", 1.0, 200), raw("old b", 2.0, 200)]),
                page(vec![raw("new c", 3.0, 5)]),
            ],
        );
        let agg = aggregator(&[papers.clone()]);
        let opts = AggregateOptions {
            batch_size: 2,
            recent_only: true,
            ..options()
        };

        let run = collect_run(agg.load_topic("AI", opts)).await.unwrap();
        assert_eq!(titles(&run.nodes), vec!["new c"]);
        assert_eq!(papers.calls(), 2);
    }

    #[test]
    fn unknown_routed_sources_are_rejected() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![ScriptedAdapter::new("paper-index", Vec::new())];
        let err = Aggregator::new(http, TopicRegistry::default(), adapters).err().unwrap();
        assert!(err.to_string().contains("affiliation-index"));
    }
}
