//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use url::Url;

use docsink_core::{
    CrawlJobArgs, RunRequest, Runner, queue_crawl, run_crawl, session_from_env,
};
use docsink_crawler::CrawlMode;
use docsink_images::{HttpBucketStore, StoreLogin};
use docsink_shared::{
    AppConfig, CancelFlag, CrawlSummary, config_file_path, init_config, load_config,
    validate_object_store,
};
use docsink_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// docsink: scrape documentation sites into durable, queryable storage.
#[derive(Parser)]
#[command(
    name = "docsink",
    version,
    about = "Scrape a documentation site's pages and images into a local database and object storage.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Database file (overrides the config default).
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Crawl a site right now, inline, and print the summary.
    Crawl {
        /// Root URL to crawl from.
        url: String,

        /// Explicit page URLs (repeatable). Bounded mode, no discovery.
        #[arg(long = "page")]
        pages: Vec<String>,

        /// Disable the browser-rendered login fallback.
        #[arg(long)]
        no_browser: bool,
    },

    /// Enqueue a crawl job for a worker to pick up.
    Queue {
        /// Root URL to crawl from.
        url: String,

        /// Explicit page URLs (repeatable). Bounded mode, no discovery.
        #[arg(long = "page")]
        pages: Vec<String>,
    },

    /// Claim and execute queued jobs.
    Worker {
        /// Seconds to sleep when the queue is empty.
        #[arg(long, default_value = "5")]
        poll_secs: u64,

        /// Run at most one job, then exit.
        #[arg(long)]
        once: bool,
    },

    /// Inspect and manage jobs.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Job subcommands.
#[derive(Subcommand)]
pub(crate) enum JobsAction {
    /// List recent jobs.
    List {
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Show one job, its logs, and its result.
    Show {
        id: String,

        /// Requested result TTL in seconds (clamped to the server window).
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Request cancellation of a job.
    Cancel { id: String },
    /// Delete all finished (terminal) jobs.
    Clear,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "docsink=info",
        1 => "docsink=debug",
        _ => "docsink=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = load_config()?;

    match &cli.command {
        Command::Crawl {
            url,
            pages,
            no_browser,
        } => cmd_crawl(&cli, &config, url, pages, *no_browser).await,
        Command::Queue { url, pages } => cmd_queue(&cli, &config, url, pages).await,
        Command::Worker { poll_secs, once } => cmd_worker(&cli, &config, *poll_secs, *once).await,
        Command::Jobs { action } => cmd_jobs(&cli, &config, action).await,
        Command::Config { action } => cmd_config(&config, action),
    }
}

async fn open_storage(cli: &Cli, config: &AppConfig) -> Result<Storage> {
    let path = match &cli.db {
        Some(db) => db.clone(),
        None => expand_home(&config.defaults.db_path),
    };
    Ok(Storage::open(&path).await?)
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Build the object store client. Fails fast on missing configuration;
/// no partial run is attempted.
fn object_store(config: &AppConfig) -> Result<HttpBucketStore> {
    validate_object_store(config)?;

    let read = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
    let service_key = read(&config.object_store.service_key_env)
        .ok_or_else(|| eyre!("storage service key env var is empty"))?;

    let mut store = HttpBucketStore::new(config.object_store.endpoint.clone(), service_key)?;
    if let (Some(anon_key), Some(email), Some(password)) = (
        read(&config.object_store.anon_key_env),
        read(&config.object_store.login_email_env),
        read(&config.object_store.login_password_env),
    ) {
        store = store.with_fallback(StoreLogin {
            anon_key,
            email,
            password,
        });
    }
    Ok(store)
}

fn build_args(url: &str, pages: &[String]) -> Result<CrawlJobArgs> {
    Url::parse(url).map_err(|e| eyre!("invalid URL {url}: {e}"))?;
    Ok(CrawlJobArgs {
        root_url: url.to_string(),
        page_urls: if pages.is_empty() {
            None
        } else {
            Some(pages.to_vec())
        },
    })
}

fn build_mode(url: &str, pages: &[String]) -> Result<CrawlMode> {
    if pages.is_empty() {
        Ok(CrawlMode::Seeded {
            root: Url::parse(url).map_err(|e| eyre!("invalid URL {url}: {e}"))?,
        })
    } else {
        let urls: std::result::Result<Vec<Url>, _> = pages.iter().map(|p| Url::parse(p)).collect();
        Ok(CrawlMode::Bounded {
            urls: urls.map_err(|e| eyre!("invalid page URL: {e}"))?,
        })
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_crawl(
    cli: &Cli,
    config: &AppConfig,
    url: &str,
    pages: &[String],
    no_browser: bool,
) -> Result<()> {
    let storage = open_storage(cli, config).await?;
    let store = object_store(config)?;

    let request = RunRequest {
        mode: build_mode(url, pages)?,
        session: session_from_env(&config.site),
        use_browser: !no_browser,
    };

    let bar = ProgressBar::new(0).with_style(
        ProgressStyle::with_template("{spinner:.green} [{pos}/{len}] {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    let observer = BarObserver { bar: bar.clone() };

    let summary = run_crawl(
        &storage,
        &store,
        config,
        request,
        &observer,
        &CancelFlag::new(),
    )
    .await?;

    bar.finish_and_clear();
    print_summary(&summary);
    Ok(())
}

async fn cmd_queue(cli: &Cli, config: &AppConfig, url: &str, pages: &[String]) -> Result<()> {
    let storage = open_storage(cli, config).await?;
    let args = build_args(url, pages)?;
    let id = queue_crawl(&storage, &args).await?;
    println!("queued job {id}");
    Ok(())
}

async fn cmd_worker(cli: &Cli, config: &AppConfig, poll_secs: u64, once: bool) -> Result<()> {
    let storage = Arc::new(open_storage(cli, config).await?);
    let store = Arc::new(object_store(config)?);
    let runner = Runner::new(storage, store, config.clone());

    if once {
        match runner.run_next().await? {
            Some(job) => println!("job {} finished: {}", job.id, job.status),
            None => println!("queue is empty"),
        }
        return Ok(());
    }

    runner.run_worker(Duration::from_secs(poll_secs.max(1))).await?;
    Ok(())
}

async fn cmd_jobs(cli: &Cli, config: &AppConfig, action: &JobsAction) -> Result<()> {
    let storage = open_storage(cli, config).await?;

    match action {
        JobsAction::List { limit } => {
            for job in storage.list_jobs(*limit).await? {
                println!(
                    "{}  {:<10} {:<9} {}",
                    job.id,
                    job.name,
                    job.status,
                    job.created_at.to_rfc3339()
                );
            }
        }
        JobsAction::Show { id, ttl } => {
            let job = storage
                .get_job(id)
                .await?
                .ok_or_else(|| eyre!("job {id} not found"))?;
            let effective_ttl = config.jobs.effective_ttl(*ttl);

            println!("id:       {}", job.id);
            println!("name:     {}", job.name);
            println!("status:   {}", job.status);
            println!("created:  {}", job.created_at.to_rfc3339());
            if let Some(started) = job.started_at {
                println!("started:  {}", started.to_rfc3339());
            }
            if let Some(finished) = job.finished_at {
                println!("finished: {}", finished.to_rfc3339());
            }
            if let Some(error) = &job.error {
                println!("error:    {error}");
            }
            println!("ttl:      {effective_ttl}s");
            if let Some(result) = &job.result {
                println!("result:   {}", serde_json::to_string_pretty(result)?);
            }
            if !job.logs.is_empty() {
                println!("logs:\n{}", job.logs);
            }
        }
        JobsAction::Cancel { id } => {
            let outcome = storage.cancel_job(id).await?;
            println!(
                "cancel: {:?} (was {})",
                outcome.action, outcome.previous_status
            );
        }
        JobsAction::Clear => {
            let removed = storage.clear_finished_jobs().await?;
            println!("removed {removed} finished jobs");
        }
    }
    Ok(())
}

fn cmd_config(config: &AppConfig, action: &ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init => {
            let path = init_config()?;
            println!("wrote {}", path.display());
        }
        ConfigAction::Show => {
            println!("config file: {}", config_file_path()?.display());
            println!("{}", toml::to_string_pretty(config)?);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Progress rendering
// ---------------------------------------------------------------------------

struct BarObserver {
    bar: ProgressBar,
}

impl docsink_crawler::CrawlObserver for BarObserver {
    fn page_started(&self, url: &str, current: usize, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(current as u64);
        self.bar.set_message(url.to_string());
    }

    fn page_failed(&self, url: &str, error: &str) {
        self.bar.println(format!("failed {url}: {error}"));
    }
}

fn print_summary(summary: &CrawlSummary) {
    println!("Crawl complete:");
    println!(
        "  pages:        {} inserted, {} updated, {} failed",
        summary.pages_inserted, summary.pages_updated, summary.pages_failed
    );
    println!(
        "  images:       {} uploaded, {} skipped, {} failed ({} unique of {} refs)",
        summary.images_uploaded,
        summary.images_skipped,
        summary.images_failed,
        summary.images_unique,
        summary.images_total
    );
    println!(
        "  associations: {} new, {} existing",
        summary.associations_new, summary.associations_existing
    );
    if summary.links_discovered > 0 {
        println!(
            "  links seen but not followed: {}",
            summary.links_discovered
        );
    }
}
