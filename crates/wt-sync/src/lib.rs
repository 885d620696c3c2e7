//! Pipeline wiring: configuration, topic routing, aggregation and the hourly refresh job.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use wt_adapters::{adapter_for_source, AdapterEndpoints, AdapterError, HealthStatus, PaperIndexAdapter};
use wt_core::FreshnessPolicy;
use wt_storage::{
    BackoffPolicy, FileRefreshStore, GeocodeCache, HttpClientConfig, HttpFetcher, NominatimGeocoder,
    RefreshScheduler,
};

pub mod aggregate;
pub mod topics;

pub use aggregate::{
    collect_run, AggregateOptions, Aggregator, BatchMeta, Delivery, NodeBatch, RunEnd, RunSummary,
};
pub use topics::{is_all_topics, Route, TopicEntry, TopicRegistry};

pub const CRATE_NAME: &str = "wt-sync";

pub const DEFAULT_REFRESH_CRON: &str = "0 0 * * * *";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub papers_api_url: String,
    pub crossref_api_url: String,
    pub semantic_scholar_api_url: String,
    pub semantic_scholar_api_key: Option<String>,
    pub geocoder_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub geocode_interval_ms: u64,
    pub batch_size: usize,
    pub total_nodes: usize,
    pub freshness_days: u32,
    pub recent_only: bool,
    pub batch_delay_ms: u64,
    pub refresh_state_path: PathBuf,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
    /// Offset used to decide when a calendar day rolls over, e.g. `+02:00`.
    pub refresh_utc_offset: FixedOffset,
    pub workspace_root: PathBuf,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let flag = |key: &str| {
            lookup(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false)
        };
        Self {
            papers_api_url: text("PAPERS_API_URL", "http://localhost:8000"),
            crossref_api_url: text("CROSSREF_API_URL", "https://api.crossref.org"),
            semantic_scholar_api_url: text("SEMANTIC_SCHOLAR_API_URL", "https://api.semanticscholar.org"),
            semantic_scholar_api_key: lookup("SEMANTIC_SCHOLAR_API_KEY").and_then(wt_core::text_or_none),
            geocoder_url: text("GEOCODER_URL", "https://nominatim.openstreetmap.org"),
            user_agent: text("WT_USER_AGENT", "Worldthread/1.0 (research globe)"),
            http_timeout_secs: lookup("WT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            geocode_interval_ms: lookup("WT_GEOCODE_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1100),
            batch_size: lookup("WT_BATCH_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(aggregate::DEFAULT_BATCH_SIZE),
            total_nodes: lookup("WT_TOTAL_NODES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(aggregate::DEFAULT_TOTAL_NODES),
            freshness_days: lookup("WT_FRESHNESS_DAYS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(wt_core::LONG_WINDOW_DAYS),
            recent_only: flag("WT_RECENT_ONLY"),
            batch_delay_ms: lookup("WT_BATCH_DELAY_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            refresh_state_path: lookup("WT_REFRESH_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./.worldthread/refresh.json")),
            scheduler_enabled: flag("WT_SCHEDULER_ENABLED"),
            refresh_cron: text("WT_REFRESH_CRON", DEFAULT_REFRESH_CRON),
            refresh_utc_offset: lookup("WT_REFRESH_UTC_OFFSET")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or_else(|| Utc.fix()),
            workspace_root: PathBuf::from("."),
        }
    }

    pub fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions {
            recent_only: self.recent_only,
            total: self.total_nodes,
            batch_size: self.batch_size,
            batch_delay: Duration::from_millis(self.batch_delay_ms),
            ..AggregateOptions::new(FreshnessPolicy::new(self.freshness_days))
        }
    }

    fn endpoints(&self) -> AdapterEndpoints {
        AdapterEndpoints {
            paper_index_url: self.papers_api_url.clone(),
            citation_graph_url: self.semantic_scholar_api_url.clone(),
            citation_graph_api_key: self.semantic_scholar_api_key.clone(),
            affiliation_index_url: self.crossref_api_url.clone(),
        }
    }
}

/// Sent to the host when the daily refresh falls due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSignal {
    pub at: DateTime<Utc>,
}

/// Long-lived services shared by every run in the process.
pub struct Pipeline {
    pub config: PipelineConfig,
    pub http: Arc<HttpFetcher>,
    pub geocoder: Arc<GeocodeCache>,
    pub aggregator: Aggregator,
    pub refresh: Arc<RefreshScheduler>,
    paper_index: PaperIndexAdapter,
}

pub async fn build_pipeline_from_config(config: PipelineConfig) -> Result<Pipeline> {
    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?);
    // Geocoder requests are never retried.
    let geocoder_http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        backoff: BackoffPolicy::none(),
    })?);
    let geocoder = Arc::new(GeocodeCache::new(
        Arc::new(NominatimGeocoder::new(geocoder_http, config.geocoder_url.clone())),
        Duration::from_millis(config.geocode_interval_ms),
    ));

    let registry = TopicRegistry::load(&config.workspace_root).await?;
    let endpoints = config.endpoints();
    let mut adapters = Vec::new();
    for source_id in registry.source_ids() {
        let adapter = adapter_for_source(&source_id, &endpoints, &geocoder)
            .with_context(|| format!("no adapter registered for {source_id}"))?;
        adapters.push(adapter);
    }
    let aggregator = Aggregator::new(http.clone(), registry, adapters)?;

    let refresh = Arc::new(
        RefreshScheduler::new(Arc::new(FileRefreshStore::new(config.refresh_state_path.clone())))
            .with_utc_offset(config.refresh_utc_offset),
    );
    let paper_index = PaperIndexAdapter::new(&config.papers_api_url);

    info!(
        sources = ?aggregator.registry().source_ids(),
        refresh_state = %config.refresh_state_path.display(),
        refresh_utc_offset = %config.refresh_utc_offset,
        "pipeline ready"
    );
    Ok(Pipeline {
        config,
        http,
        geocoder,
        aggregator,
        refresh,
        paper_index,
    })
}

pub async fn build_pipeline_from_env() -> Result<Pipeline> {
    build_pipeline_from_config(PipelineConfig::from_env()).await
}

impl Pipeline {
    pub async fn health(&self) -> Result<HealthStatus, AdapterError> {
        self.paper_index.health(&self.http).await
    }

    /// Hourly refresh job; `None` unless the scheduler is enabled.
    pub async fn maybe_build_refresh_scheduler(
        &self,
        tx: mpsc::Sender<RefreshSignal>,
    ) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let refresh = self.refresh.clone();
        let cron = self.config.refresh_cron.as_str();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let refresh = refresh.clone();
            let tx = tx.clone();
            Box::pin(async move {
                if let Err(err) = signal_if_due(&refresh, &tx).await {
                    warn!(error = %err, "refresh check failed");
                }
            })
        })
        .with_context(|| format!("creating refresh job for cron {cron}"))?;
        sched.add(job).await.context("adding refresh job")?;
        Ok(Some(sched))
    }
}

/// Claim today's refresh and notify the host. Returns whether a signal was sent.
///
/// The day is only recorded once the host calls `mark_refreshed` after reloading.
pub async fn signal_if_due(refresh: &RefreshScheduler, tx: &mpsc::Sender<RefreshSignal>) -> Result<bool> {
    if !refresh.claim_due().await {
        debug!("refresh not due");
        return Ok(false);
    }
    if tx.send(RefreshSignal { at: Utc::now() }).await.is_err() {
        refresh.release_claim().await;
        bail!("refresh receiver dropped");
    }
    Ok(true)
}
