use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use newscard::resolve::{CacheSweeper, SweepPolicy};
use newscard::{
    connect_with_retry, FileJobStore, Job, JobStore, Pipeline, ProxyConfig, RetryPolicy, SpoolQueue,
    Viewport, Worker, WorkerConfig,
};

#[derive(Parser)]
#[command(name = "newscard", version, about = "Render worker for headline cards")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "NEWSCARD_LOG_JSON")]
    log_json: bool,

    /// JSON file holding job records
    #[arg(long, global = true, env = "NEWSCARD_STORE", default_value = "data/jobs.json")]
    store: PathBuf,

    /// Spool directory used as the job queue
    #[arg(long, global = true, env = "NEWSCARD_SPOOL", default_value = "data/queue")]
    spool: PathBuf,

    /// Shared directory for rendered cards and cached inputs
    #[arg(long, global = true, env = "NEWSCARD_OUTPUT_DIR", default_value = "output")]
    output_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume jobs from the spool until interrupted
    Run(RunArgs),
    /// Create a job and enqueue it
    Submit(SubmitArgs),
    /// Show recent jobs
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Evict cached inputs once and exit
    Sweep(SweepArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, env = "NEWSCARD_WIDTH", default_value_t = 1080)]
    width: u32,
    #[arg(long, env = "NEWSCARD_HEIGHT", default_value_t = 1350)]
    height: u32,
    /// Base URL under which the output directory is served
    #[arg(long, env = "NEWSCARD_PUBLIC_BASE_URL")]
    public_base_url: Option<String>,
    /// Base URL the renderer should use for cached inputs (defaults to file://)
    #[arg(long, env = "NEWSCARD_ASSET_BASE_URL")]
    asset_base_url: Option<String>,
    /// Branding mark to inline instead of the bundled one
    #[arg(long, env = "NEWSCARD_BRANDING")]
    branding: Option<PathBuf>,
    /// Proxy endpoint for hosts that serve preview pages
    #[arg(long, env = "NEWSCARD_PROXY_URL")]
    proxy_url: Option<String>,
    #[arg(long, env = "NEWSCARD_PROXY_TOKEN", hide_env_values = true)]
    proxy_token: Option<String>,
    /// Chrome/Chromium binary (auto-detected when omitted)
    #[arg(long, env = "NEWSCARD_CHROME")]
    chrome: Option<PathBuf>,
    /// Disable Chrome's sandbox (needed in most containers)
    #[arg(long, env = "NEWSCARD_NO_SANDBOX")]
    no_sandbox: bool,
    #[arg(long, env = "NEWSCARD_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 20000)]
    fetch_timeout_ms: u64,
    #[arg(long, default_value_t = 30000)]
    load_timeout_ms: u64,
    #[arg(long, default_value_t = 12000)]
    asset_timeout_ms: u64,
    #[arg(long, default_value_t = 300)]
    settle_delay_ms: u64,
    /// Fail jobs that run longer than this (no deadline when omitted)
    #[arg(long, env = "NEWSCARD_JOB_TIMEOUT_MS")]
    job_timeout_ms: Option<u64>,
    #[arg(long, default_value_t = 10)]
    connect_attempts: u32,
    #[arg(long, default_value_t = 3000)]
    connect_delay_ms: u64,
    #[arg(long, default_value_t = 500)]
    poll_interval_ms: u64,
    /// Claims held longer than this are redelivered to the next worker that starts
    #[arg(long, env = "NEWSCARD_CLAIM_LEASE_SECS", default_value_t = 900)]
    claim_lease_secs: u64,
    /// Evict cached inputs older than this many seconds
    #[arg(long, env = "NEWSCARD_CACHE_MAX_AGE_SECS")]
    cache_max_age_secs: Option<u64>,
    /// Keep cached inputs under this many bytes
    #[arg(long, env = "NEWSCARD_CACHE_MAX_BYTES")]
    cache_max_bytes: Option<u64>,
    #[arg(long, default_value_t = 600)]
    sweep_interval_secs: u64,
}

#[derive(Args)]
struct SubmitArgs {
    headline: String,
    #[arg(long)]
    background_url: Option<String>,
    #[arg(long)]
    news_image_url: Option<String>,
}

#[derive(Args)]
struct SweepArgs {
    #[arg(long)]
    max_age_secs: Option<u64>,
    #[arg(long)]
    max_bytes: Option<u64>,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,newscard=debug"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

impl RunArgs {
    fn worker_config(&self, output_dir: PathBuf) -> WorkerConfig {
        let defaults = WorkerConfig::default();
        WorkerConfig {
            viewport: Viewport {
                width: self.width,
                height: self.height,
            },
            output_dir,
            public_base_url: self.public_base_url.clone(),
            asset_base_url: self.asset_base_url.clone(),
            branding_path: self.branding.clone(),
            proxy: self.proxy_url.clone().map(|url| ProxyConfig {
                url,
                token: self.proxy_token.clone(),
            }),
            fetch_timeout_ms: self.fetch_timeout_ms,
            load_timeout_ms: self.load_timeout_ms,
            asset_timeout_ms: self.asset_timeout_ms,
            settle_delay_ms: self.settle_delay_ms,
            job_timeout_ms: self.job_timeout_ms,
            scratch_dir: self.scratch_dir.clone().unwrap_or(defaults.scratch_dir),
            ..defaults
        }
    }

    fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy {
            max_age: self.cache_max_age_secs.map(Duration::from_secs),
            max_bytes: self.cache_max_bytes,
        }
    }
}

#[cfg(feature = "cdp")]
fn launcher(args: &RunArgs) -> anyhow::Result<Arc<dyn newscard::SurfaceLauncher>> {
    Ok(Arc::new(newscard::cdp::CdpLauncher {
        chrome_path: args.chrome.clone(),
        sandbox: !args.no_sandbox,
        ..Default::default()
    }))
}

#[cfg(not(feature = "cdp"))]
fn launcher(_args: &RunArgs) -> anyhow::Result<Arc<dyn newscard::SurfaceLauncher>> {
    bail!("newscard was built without a rendering backend; enable the `cdp` feature")
}

async fn run_worker(cli: &Cli, args: &RunArgs) -> anyhow::Result<()> {
    let config = args.worker_config(cli.output_dir.clone());
    let pipeline = Pipeline::from_config(&config, launcher(args)?)
        .context("failed to set up the render pipeline")?;
    let store: Arc<dyn JobStore> = Arc::new(
        FileJobStore::open(&cli.store)
            .await
            .with_context(|| format!("failed to open job store {}", cli.store.display()))?,
    );

    let policy = RetryPolicy {
        attempts: args.connect_attempts,
        delay: Duration::from_millis(args.connect_delay_ms),
    };
    let poll = Duration::from_millis(args.poll_interval_ms);
    let lease = Duration::from_secs(args.claim_lease_secs);
    if let Some(limit) = config.job_timeout() {
        if limit >= lease {
            warn!("Job timeout {:?} is not shorter than the claim lease {:?}", limit, lease);
        }
    }
    let spool = cli.spool.clone();
    let queue = connect_with_retry(policy, |_| {
        SpoolQueue::connect_with_lease(spool.clone(), poll, lease)
    })
    .await?;
    info!("Connected to spool {}", cli.spool.display());

    let sweep_policy = args.sweep_policy();
    let sweeper = if sweep_policy.is_enabled() {
        let sweeper = CacheSweeper::new(pipeline.resolver().cache().dir().to_path_buf(), sweep_policy);
        Some(sweeper.spawn(Duration::from_secs(args.sweep_interval_secs.max(1))))
    } else {
        None
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let stats = Worker::new(queue, store, pipeline)
        .with_job_timeout(config.job_timeout())
        .run(shutdown)
        .await;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    info!("Exiting after {} done, {} failed", stats.done, stats.failed);
    Ok(())
}

async fn submit(cli: &Cli, args: &SubmitArgs) -> anyhow::Result<()> {
    let store = FileJobStore::open(&cli.store).await?;
    let job = Job::new(
        args.headline.clone(),
        args.background_url.clone(),
        args.news_image_url.clone(),
    )?;
    let job = store.create(job).await?;
    SpoolQueue::enqueue(&cli.spool, &job.payload())
        .await
        .context("job stored but could not be enqueued")?;
    println!("{}", job.id);
    Ok(())
}

async fn list(cli: &Cli, limit: usize) -> anyhow::Result<()> {
    let store = FileJobStore::open(&cli.store).await?;
    for job in store.list_recent(limit).await? {
        let detail = job
            .output_url
            .as_deref()
            .or(job.output_file_name.as_deref())
            .or(job.error.as_deref())
            .unwrap_or("");
        println!(
            "{}  {:<10}  {}  {}  {}",
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            job.status,
            job.id,
            job.headline,
            detail
        );
    }
    Ok(())
}

async fn sweep(cli: &Cli, args: &SweepArgs) -> anyhow::Result<()> {
    let policy = SweepPolicy {
        max_age: args.max_age_secs.map(Duration::from_secs),
        max_bytes: args.max_bytes,
    };
    if !policy.is_enabled() {
        bail!("nothing to do: pass --max-age-secs and/or --max-bytes");
    }
    let report = CacheSweeper::new(cli.output_dir.clone(), policy).sweep_once().await?;
    println!(
        "scanned {} removed {} freed {} bytes",
        report.scanned, report.removed, report.bytes_freed
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let result = match &cli.command {
        Command::Run(args) => run_worker(&cli, args).await,
        Command::Submit(args) => submit(&cli, args).await,
        Command::List { limit } => list(&cli, *limit).await,
        Command::Sweep(args) => sweep(&cli, args).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("newscard: {:#}", e);
        std::process::exit(1);
    }
}
