use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crawlq::config::{Config, LogFormat, LoggingConfig};
use crawlq::crawl::{
    open_store, CrawlCoordinator, CrawlerOptions, SitemapFetcher, SitemapPolicy, StoredCrawl,
};
use crawlq::metrics;
use crawlq::queue::{
    open_queue, JobPayload, JobQueue, KickoffJob, PostgresJobQueue, QueueBackend,
    QueueMaintenance,
};
use crawlq::scraper::{PageOptions, ScrapePipeline};
use crawlq::server::{self, AppState};
use crawlq::worker::Worker;

#[derive(Parser)]
#[command(
    name = "crawlq",
    version,
    about = "Distributed crawl coordination: job queue, crawl state, workers and scrape fallback",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file (environment variables are used when absent)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the PostgreSQL job schema
    Migrate,

    /// Run worker loops, queue maintenance and the health server until Ctrl-C
    Worker {
        /// Override the number of claim loops
        #[arg(short = 'n', long)]
        concurrency: Option<usize>,
    },

    /// Start a crawl from an origin URL
    Crawl {
        url: String,

        /// Team the crawl is billed to
        #[arg(long, default_value = "default")]
        team: String,

        /// Maximum number of pages
        #[arg(long)]
        limit: Option<u64>,

        /// Maximum path depth below the origin
        #[arg(long)]
        max_depth: Option<u32>,

        /// Maximum link hops from the seed page
        #[arg(long)]
        max_discovery_depth: Option<u32>,

        /// Path regex a link must match (repeatable)
        #[arg(long)]
        include: Vec<String>,

        /// Path regex that excludes a link (repeatable)
        #[arg(long)]
        exclude: Vec<String>,

        /// Sitemap policy (include, skip, only)
        #[arg(long, default_value = "include")]
        sitemap: SitemapPolicy,

        #[arg(long)]
        allow_backward: bool,

        #[arg(long)]
        allow_external: bool,

        #[arg(long)]
        allow_subdomains: bool,

        #[arg(long)]
        ignore_query_params: bool,

        /// Keep only the main content of every page
        #[arg(long)]
        only_main_content: bool,

        /// Block until the kickoff job finishes
        #[arg(long)]
        wait: bool,

        /// Seconds to wait with --wait
        #[arg(long, default_value = "600")]
        timeout: u64,
    },

    /// Print crawl progress
    Status { crawl_id: Uuid },

    /// Cancel a crawl
    Cancel { crawl_id: Uuid },

    /// Wait for a job to reach a terminal status
    Wait {
        job_id: String,

        /// Seconds to wait
        #[arg(long, default_value = "600")]
        timeout: u64,
    },

    /// Scrape one URL through the fallback pipeline and print the document
    Scrape {
        url: String,

        #[arg(long)]
        only_main_content: bool,

        /// Overall budget in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env().context("Failed to load configuration from environment")?,
    };
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    setup_tracing(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Migrate => migrate(&config).await?,

        Commands::Worker { concurrency } => {
            if let Some(n) = concurrency {
                config.worker.concurrency = n;
            }
            config.validate()?;
            run_worker(config).await?;
        }

        Commands::Crawl {
            url,
            team,
            limit,
            max_depth,
            max_discovery_depth,
            include,
            exclude,
            sitemap,
            allow_backward,
            allow_external,
            allow_subdomains,
            ignore_query_params,
            only_main_content,
            wait,
            timeout,
        } => {
            let defaults = CrawlerOptions::default();
            let options = CrawlerOptions {
                limit: limit.unwrap_or(defaults.limit),
                max_depth: max_depth.unwrap_or(defaults.max_depth),
                max_discovery_depth,
                include_paths: include,
                exclude_paths: exclude,
                sitemap,
                allow_backward_links: allow_backward,
                allow_external_links: allow_external,
                allow_subdomains,
                ignore_query_parameters: ignore_query_params,
                ..defaults
            };
            let page_options = PageOptions {
                only_main_content,
                ..Default::default()
            };
            let crawl = StoredCrawl::new(url, team, options, page_options);
            let wait = wait.then(|| Duration::from_secs(timeout));
            start_crawl(&config, crawl, wait).await?;
        }

        Commands::Status { crawl_id } => {
            let coordinator = connect_coordinator(&config).await?;
            let progress = coordinator
                .crawl_progress(crawl_id)
                .await
                .with_context(|| format!("Failed to read progress of crawl {crawl_id}"))?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }

        Commands::Cancel { crawl_id } => {
            let coordinator = connect_coordinator(&config).await?;
            if coordinator.cancel_crawl(crawl_id).await? {
                println!("Cancelled crawl {crawl_id}");
            } else {
                anyhow::bail!("crawl {crawl_id} not found");
            }
        }

        Commands::Wait { job_id, timeout } => {
            let queue = open_queue(&config.queue)
                .await
                .context("Failed to open job queue")?;
            let status = queue
                .wait_for_job(&job_id, Duration::from_secs(timeout))
                .await?;
            println!("{status}");
        }

        Commands::Scrape {
            url,
            only_main_content,
            timeout_ms,
        } => {
            let pipeline = ScrapePipeline::from_config(&config.scraper)
                .context("Failed to build scrape pipeline")?;
            let options = PageOptions {
                only_main_content,
                timeout_ms,
                ..Default::default()
            };

            let report = pipeline.scrape(&url, &options).await;
            println!("{}", serde_json::to_string_pretty(&report.document)?);
            if !report.verdict.is_success() {
                let reason = report
                    .failure_reason()
                    .unwrap_or_else(|| format!("{:?}", report.verdict));
                anyhow::bail!("scrape of {url} failed: {reason}");
            }
        }
    }

    Ok(())
}

fn setup_tracing(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("crawlq=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_new(format!("crawlq={},warn", logging.level))
            .context("Invalid log level")?
    };

    match logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

async fn migrate(config: &Config) -> Result<()> {
    if config.queue.backend != QueueBackend::Postgres {
        tracing::info!("SQLite queue creates its schema on open, nothing to migrate");
        return Ok(());
    }

    let queue = PostgresJobQueue::connect(&config.queue)
        .await
        .context("Failed to connect to PostgreSQL")?;
    queue
        .init_schema()
        .await
        .context("Failed to create job schema")?;
    tracing::info!("Job schema is up to date");
    Ok(())
}

async fn connect_coordinator(config: &Config) -> Result<CrawlCoordinator> {
    let store = open_store(&config.store)
        .await
        .context("Failed to connect to coordination store")?;
    Ok(CrawlCoordinator::new(store, config.coordinator.clone()))
}

async fn start_crawl(config: &Config, crawl: StoredCrawl, wait: Option<Duration>) -> Result<()> {
    url::Url::parse(&crawl.origin_url)
        .with_context(|| format!("Invalid crawl URL: {}", crawl.origin_url))?;

    let queue = open_queue(&config.queue)
        .await
        .context("Failed to open job queue")?;
    let coordinator = connect_coordinator(config).await?;

    let crawl_id = Uuid::new_v4();
    let kickoff_id = Uuid::new_v4();
    coordinator
        .save_crawl(crawl_id, &crawl)
        .await
        .context("Failed to save crawl")?;

    let kickoff = KickoffJob {
        crawl_id,
        team_id: crawl.team_id.clone(),
        url: crawl.origin_url.clone(),
    };
    queue
        .add_job(kickoff_id, JobPayload::Kickoff(kickoff))
        .await
        .context("Failed to enqueue kickoff job")?;
    metrics::record_crawl_started();

    tracing::info!(
        crawl_id = %crawl_id,
        kickoff_job_id = %kickoff_id,
        origin = %crawl.origin_url,
        "Crawl started"
    );
    println!(
        "{}",
        serde_json::json!({ "crawl_id": crawl_id, "kickoff_job_id": kickoff_id })
    );

    if let Some(timeout) = wait {
        let status = queue
            .wait_for_job(&kickoff_id.to_string(), timeout)
            .await
            .context("Failed waiting for kickoff job")?;
        println!("kickoff {status}");
    }

    Ok(())
}

async fn run_worker(config: Config) -> Result<()> {
    metrics::init_metrics().map_err(|e| anyhow::anyhow!("Failed to register metrics: {e}"))?;

    let queue = open_queue(&config.queue)
        .await
        .context("Failed to open job queue")?;
    let store = open_store(&config.store)
        .await
        .context("Failed to connect to coordination store")?;
    let coordinator = CrawlCoordinator::new(store.clone(), config.coordinator.clone());
    let pipeline = ScrapePipeline::from_config(&config.scraper)
        .context("Failed to build scrape pipeline")?
        .into_shared();
    let sitemaps = SitemapFetcher::new(&config.scraper.user_agent, config.scraper.attempt_timeout())
        .context("Failed to build sitemap client")?;

    let worker = Worker::new(
        queue.clone(),
        coordinator,
        pipeline,
        sitemaps,
        config.worker.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (failed_tx, failed_rx) = mpsc::unbounded_channel();

    let maintenance = QueueMaintenance::new(queue.clone(), &config.queue)
        .on_failed(failed_tx)
        .start(shutdown_rx.clone());
    let settle = tokio::spawn(worker.clone().settle_reaped(failed_rx));

    let server = config.server.enabled.then(|| {
        let state = AppState::new(queue.clone(), store.clone());
        let server_config = config.server.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(state, &server_config, shutdown).await {
                tracing::error!(error = %e, "Health server failed");
            }
        })
    });

    let loops = tokio::spawn(worker.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested, finishing in-flight jobs");
    let _ = shutdown_tx.send(true);

    loops.await.context("Worker loops panicked")?;
    maintenance.await.context("Queue maintenance panicked")?;
    settle.await.context("Reaped-job settlement panicked")?;
    if let Some(server) = server {
        server.await.context("Health server panicked")?;
    }

    tracing::info!("Worker stopped");
    Ok(())
}
