mod config;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use gather_client::{AdapterSet, OpenAiEventSearch, ReqwestFetcher};
use gather_core::job_store::JobStore;
use gather_core::rate_limiter::RateLimitedFetcher;
use gather_core::{
    CollectionRequest, CollectionResult, CollectionService, CollectionStage, DeduplicationEngine,
    EnhancedEventInfo, ResilienceLayer, Scheduler, TracingSchedulerReporter,
};
use gather_store::{FsRunLogSink, FsSnapshotSink, Store, StoreConfig};

use crate::config::GatherConfig;

type Adapter = AdapterSet<RateLimitedFetcher<ReqwestFetcher>>;
type Service = CollectionService<Adapter, FsSnapshotSink, FsRunLogSink, OpenAiEventSearch>;

#[derive(Parser)]
#[command(name = "gather", version, about = "Regional event collector")]
struct Cli {
    /// Path to the TOML configuration (defaults to ./gather.toml when present)
    #[arg(short, long, global = true, env = "GATHER_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for snapshots, run logs and the job file
    #[arg(long, global = true, env = "GATHER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(flatten)]
    ai: AiArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct AiArgs {
    /// API key for the fallback event search; fallback is off without one
    #[arg(long, global = true, env = "GATHER_AI_API_KEY", hide_env_values = true)]
    ai_api_key: Option<String>,

    /// Model for the fallback search (e.g., "gpt-4o-mini", "gemini-2.5-flash")
    #[arg(long, global = true, env = "GATHER_AI_MODEL")]
    ai_model: Option<String>,

    /// OpenAI-compatible API base URL
    #[arg(long, global = true, env = "GATHER_AI_BASE_URL")]
    ai_base_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one collection and print the events
    Collect {
        /// Only sources in this region (repeatable)
        #[arg(short, long)]
        region: Vec<String>,

        /// Only sources of this category (repeatable)
        #[arg(long)]
        category: Vec<String>,

        /// Only sources at this stage: primary, secondary, supplemental (repeatable)
        #[arg(long)]
        stage: Vec<CollectionStage>,

        /// Stop once this many events are collected
        #[arg(short, long)]
        target: Option<usize>,

        /// Whole-collection deadline in seconds
        #[arg(long)]
        time_limit: Option<u64>,

        /// Ignore update-frequency caching and unchanged payloads
        #[arg(long, default_value_t = false)]
        force: bool,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Probe every configured source
    Validate,

    /// Show the configured sources and registry statistics
    Sources,

    /// Run the scheduler until interrupted
    Run,

    /// List scheduled jobs, or show one job's run history
    Jobs {
        /// Job id to show history for
        #[arg(long)]
        id: Option<Uuid>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Full collection result as JSON
    Json,
    /// One row per event
    Csv,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gather=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = GatherConfig::load_or_default(cli.config.as_deref())?;

    let mut store_config = StoreConfig::from_env().context("Invalid store configuration")?;
    if let Some(dir) = cli.data_dir {
        store_config.data_dir = dir;
    }

    match cli.command {
        Commands::Collect {
            region,
            category,
            stage,
            target,
            time_limit,
            force,
            format,
            output,
        } => {
            let request = CollectionRequest {
                stages: stage,
                regions: region,
                categories: category,
                target_event_count: target,
                time_limit_secs: time_limit,
                force_refresh: force,
            };
            let store = Store::open(store_config).await;
            let service = build_service(&config, &store, &cli.ai)?;
            cmd_collect(&service, &request, format, output.as_deref()).await?;
        }
        Commands::Validate => {
            cmd_validate(&config).await?;
        }
        Commands::Sources => {
            cmd_sources(&config)?;
        }
        Commands::Run => {
            let store = Store::open(store_config).await;
            let service = build_service(&config, &store, &cli.ai)?;
            cmd_run(&config, &store, service).await?;
        }
        Commands::Jobs { id } => {
            let store = Store::open(store_config).await;
            cmd_jobs(&store, id).await?;
        }
    }

    Ok(())
}

fn build_adapter(config: &GatherConfig) -> Result<Adapter> {
    let mut fetcher = ReqwestFetcher::with_timeout(config.collection.fetch_timeout())
        .context("Failed to create HTTP client")?;
    if config.fetch.allow_private_urls {
        fetcher = fetcher.allow_private_urls();
    }
    Ok(AdapterSet::new(RateLimitedFetcher::new(
        fetcher,
        config.fetch.per_domain,
    )))
}

fn build_fallback(config: &GatherConfig, ai: &AiArgs) -> Result<OpenAiEventSearch> {
    let api_key = ai.ai_api_key.as_deref().unwrap_or_default();
    let model = ai.ai_model.as_deref().unwrap_or(&config.ai.model);
    let search = match ai.ai_base_url.as_deref().or(config.ai.base_url.as_deref()) {
        Some(base_url) => OpenAiEventSearch::with_base_url(api_key, model, base_url),
        None => OpenAiEventSearch::new(api_key, model),
    }
    .and_then(|s| s.with_timeout(Duration::from_secs(config.ai.timeout_secs.max(1))))
    .context("Failed to create fallback search client")?;

    if api_key.is_empty() {
        tracing::info!("GATHER_AI_API_KEY not set, fallback search disabled");
    }
    Ok(search)
}

fn build_service(config: &GatherConfig, store: &Store, ai: &AiArgs) -> Result<Service> {
    let service = CollectionService::new(
        config.registry()?,
        build_adapter(config)?,
        store.snapshot_sink(),
        store.run_log_sink(),
        build_fallback(config, ai)?,
    )
    .with_config(config.collection.clone())
    .with_validator(config.validator())
    .with_dedup(DeduplicationEngine::new(config.dedup.clone()))
    .with_resilience(ResilienceLayer::new(config.resilience.clone()));
    Ok(service)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_collect(
    service: &Service,
    request: &CollectionRequest,
    format: OutputFormat,
    output: Option<&Path>,
) -> Result<()> {
    let result = service
        .collect(request)
        .await
        .context("Collection request rejected")?;

    let stats = &result.statistics;
    tracing::info!(
        run_id = %result.run_id,
        events = result.events.len(),
        attempted = stats.sources_attempted,
        failed = stats.failed,
        fallback = stats.fallback_used,
        elapsed_ms = result.execution_time_ms,
        "Collection complete"
    );
    for error in &result.errors {
        tracing::warn!("{error}");
    }

    match output {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            write_result(&result, format, file)?;
            tracing::info!(path = %path.display(), "Output written");
        }
        None => write_result(&result, format, std::io::stdout().lock())?,
    }
    Ok(())
}

fn write_result<W: Write>(result: &CollectionResult, format: OutputFormat, mut out: W) -> Result<()> {
    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut out, result)?;
            writeln!(out)?;
        }
        OutputFormat::Csv => write_csv(&result.events, out)?,
    }
    Ok(())
}

const CSV_HEADER: [&str; 14] = [
    "id",
    "title",
    "starts_at",
    "ends_at",
    "venue",
    "city",
    "lat",
    "lon",
    "category",
    "price",
    "url",
    "source_id",
    "stage",
    "confidence",
];

fn write_csv<W: Write>(events: &[EnhancedEventInfo], out: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(CSV_HEADER)?;
    for info in events {
        let e = &info.event;
        let opt = |v: Option<String>| v.unwrap_or_default();
        writer.write_record([
            e.id.clone(),
            e.title.clone(),
            e.starts_at.to_rfc3339(),
            opt(e.ends_at.map(|t| t.to_rfc3339())),
            e.venue.clone(),
            e.city.clone(),
            opt(e.lat.map(|v| v.to_string())),
            opt(e.lon.map(|v| v.to_string())),
            e.category.clone(),
            opt(e.price.map(|v| v.to_string())),
            e.event_url.clone().unwrap_or_else(|| e.source_url.clone()),
            e.source_id.clone(),
            info.stage.to_string(),
            format!("{:.2}", e.confidence),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

async fn cmd_validate(config: &GatherConfig) -> Result<()> {
    let registry = config.registry()?;
    if registry.is_empty() {
        println!("No sources configured");
        return Ok(());
    }

    let adapter = build_adapter(config)?;
    let validations = registry.validate_all(&adapter).await;

    let mut failed = 0;
    for v in &validations {
        let mark = if v.result.is_valid { "ok  " } else { "FAIL" };
        println!(
            "  [{mark}] {} (confidence {:.2})",
            v.source_id, v.result.confidence
        );
        for error in &v.result.errors {
            println!("         error: {error}");
        }
        for warning in &v.result.warnings {
            println!("         warning: {warning}");
        }
        if !v.result.is_valid {
            failed += 1;
        }
    }
    println!("\n{} of {} sources valid", validations.len() - failed, validations.len());

    if failed > 0 {
        bail!("{failed} source(s) failed validation");
    }
    Ok(())
}

fn cmd_sources(config: &GatherConfig) -> Result<()> {
    let registry = config.registry()?;
    for source in registry.sources() {
        println!(
            "  {:<24} {:<16} {:<12} {:<12} {:.2}{}",
            source.id,
            source.source_type.as_str(),
            source.region,
            source.stage.as_str(),
            source.reliability,
            if source.enabled { "" } else { "  (disabled)" },
        );
    }

    let stats = registry.statistics();
    println!(
        "\nTotal: {} sources, {} active, mean reliability {:.2}",
        stats.total, stats.active, stats.mean_reliability
    );
    for (source_type, count) in &stats.by_type {
        println!("  {source_type}: {count}");
    }
    Ok(())
}

async fn cmd_run(config: &GatherConfig, store: &Store, service: Service) -> Result<()> {
    let scheduler = Arc::new(Scheduler::new(
        store.job_store(),
        service,
        config.scheduler.clone(),
    ));

    let loaded = scheduler.load().await.context("Failed to load scheduled jobs")?;
    let registered = scheduler
        .register_static_jobs(&config.scheduled_collection)
        .await
        .context("Failed to register built-in jobs")?;
    tracing::info!(loaded, registered = registered.len(), "Scheduler ready");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    });

    scheduler
        .run(cancel, Arc::new(TracingSchedulerReporter))
        .await
        .context("Scheduler stopped with an error")?;
    Ok(())
}

async fn cmd_jobs(store: &Store, id: Option<Uuid>) -> Result<()> {
    let jobs = store
        .job_store()
        .load()
        .await
        .context("Failed to read job file")?;

    let Some(id) = id else {
        if jobs.is_empty() {
            println!("No scheduled jobs. Start `gather run` to register the built-in jobs.");
            return Ok(());
        }
        for job in &jobs {
            let next = job
                .next_run
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {} {:<22} {:<10} p{} next {}{}",
                job.id,
                job.name,
                job.status.as_str(),
                job.priority,
                next,
                if job.enabled { "" } else { "  (disabled)" },
            );
        }
        println!("\nTotal: {} jobs", jobs.len());
        return Ok(());
    };

    let job = jobs
        .iter()
        .find(|j| j.id == id)
        .with_context(|| format!("No job with id {id}"))?;

    println!("History for {} ({}):\n", job.name, job.schedule);
    if job.history.is_empty() {
        println!("  No runs yet");
    }
    for run in &job.history {
        let elapsed = (run.completed_at - run.started_at).num_seconds();
        println!(
            "  [{}] {} ({elapsed}s){}",
            run.status,
            run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            run.error
                .as_deref()
                .map(|e| format!(" error: {e}"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}
