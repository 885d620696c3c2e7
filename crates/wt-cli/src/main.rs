use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wt_core::FreshnessPolicy;
use wt_sync::{build_pipeline_from_config, collect_run, Delivery, Pipeline, PipelineConfig, RunEnd};

#[derive(Debug, Parser)]
#[command(name = "wt-cli")]
#[command(about = "Worldthread research-node pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load a topic and print each batch as a JSON line.
    Load(LoadArgs),
    /// Probe the paper index and report local cache state.
    Health,
    /// Report whether today's refresh is still due.
    RefreshCheck {
        /// Record the refresh when it is due.
        #[arg(long)]
        mark: bool,
    },
    /// Reload on startup and whenever the hourly job finds a refresh due.
    /// The day is recorded only after a reload succeeds.
    Watch {
        #[arg(long, default_value = "all")]
        topic: String,
    },
}

#[derive(Debug, Default, Args)]
struct LoadArgs {
    /// Topic name; "all" or empty fans out across the fast topics.
    #[arg(long, default_value = "all")]
    topic: String,
    #[arg(long)]
    recent_only: bool,
    #[arg(long)]
    window_days: Option<u32>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    total: Option<usize>,
    /// Deliver one combined batch instead of one per page.
    #[arg(long)]
    bulk: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wt=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();

    match cli.command.unwrap_or_else(|| Commands::Load(LoadArgs::default())) {
        Commands::Load(args) => {
            let pipeline = build_pipeline_from_config(config).await?;
            load(&pipeline, args).await?;
        }
        Commands::Health => {
            let pipeline = build_pipeline_from_config(config).await?;
            let cache_size = pipeline.geocoder.len().await;
            match pipeline.health().await {
                Ok(status) => {
                    println!("{}", json!({ "upstream": status, "geocode_cache_size": cache_size }));
                }
                Err(err) => {
                    println!("{}", json!({ "upstream_error": err.to_string(), "geocode_cache_size": cache_size }));
                    return Err(err).context("paper index health probe failed");
                }
            }
        }
        Commands::RefreshCheck { mark } => {
            let pipeline = build_pipeline_from_config(config).await?;
            let due = if mark {
                pipeline.refresh.check_and_mark().await?
            } else {
                pipeline.refresh.should_refresh().await
            };
            let last_refresh = pipeline.refresh.last_refresh().await.ok().flatten();
            println!(
                "{}",
                json!({ "refresh_due": due, "marked": mark && due, "last_refresh": last_refresh })
            );
        }
        Commands::Watch { topic } => {
            config.scheduler_enabled = true;
            let pipeline = build_pipeline_from_config(config).await?;
            watch(&pipeline, &topic).await?;
        }
    }

    Ok(())
}

async fn load(pipeline: &Pipeline, args: LoadArgs) -> Result<()> {
    let mut options = pipeline.config.aggregate_options();
    options.recent_only |= args.recent_only;
    if let Some(days) = args.window_days {
        options.freshness = FreshnessPolicy::new(days);
    }
    if let Some(batch_size) = args.batch_size {
        options.batch_size = batch_size;
    }
    if let Some(total) = args.total {
        options.total = total;
    }
    if args.bulk {
        options.delivery = Delivery::Bulk;
    }

    let mut batches = std::pin::pin!(pipeline.aggregator.load_topic(&args.topic, options));
    while let Some(batch) = batches.next().await {
        if let Some(failure) = batch.meta.partial_failure() {
            warn!(batch_index = batch.meta.batch_index, %failure, "degraded batch");
        }
        println!("{}", serde_json::to_string(&batch).context("serializing batch")?);
    }
    Ok(())
}

async fn watch(pipeline: &Pipeline, topic: &str) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(4);
    let mut sched = pipeline
        .maybe_build_refresh_scheduler(tx)
        .await?
        .context("refresh scheduler is disabled")?;

    let due = pipeline.refresh.should_refresh().await;
    info!(due, topic, "startup refresh check");
    refresh_once(pipeline, topic).await?;

    sched.start().await.context("starting refresh scheduler")?;
    loop {
        tokio::select! {
            signal = rx.recv() => {
                let Some(signal) = signal else { break };
                info!(at = %signal.at, topic, "daily refresh due");
                refresh_once(pipeline, topic).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }
    sched.shutdown().await.context("stopping refresh scheduler")?;
    Ok(())
}

/// Reload and record the day on success; on failure the next tick tries again.
async fn refresh_once(pipeline: &Pipeline, topic: &str) -> Result<()> {
    match reload(pipeline, topic).await {
        Ok(()) => pipeline.refresh.mark_refreshed().await,
        Err(err) => {
            warn!(error = %err, topic, "refresh reload failed; will retry next tick");
            pipeline.refresh.release_claim().await;
            Ok(())
        }
    }
}

async fn reload(pipeline: &Pipeline, topic: &str) -> Result<()> {
    let mut options = pipeline.config.aggregate_options();
    options.delivery = Delivery::Bulk;
    let Some(summary) = collect_run(pipeline.aggregator.load_topic(topic, options)).await else {
        bail!("reload of {topic} superseded before completion");
    };
    info!(
        nodes = summary.nodes.len(),
        failed_sources = ?summary.meta.failed_sources,
        has_fallback = summary.meta.has_fallback,
        end = ?summary.meta.end,
        "reload complete"
    );
    println!("{}", serde_json::to_string(&summary).context("serializing run summary")?);
    if summary.meta.end == Some(RunEnd::AllSourcesFailed) {
        bail!("every source failed for {topic}");
    }
    Ok(())
}
