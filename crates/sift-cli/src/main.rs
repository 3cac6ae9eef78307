use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sift_client::OpenAiGenerator;
use sift_core::batch::{BatchOptions, BatchRunner, BatchSummary, TracingReporter};
use sift_core::engine::{ExtractionRetryEngine, RetryPolicy};
use sift_core::lock::StageLockManager;
use sift_core::recrawl::RecrawlConfig;
use sift_core::selector::CandidateOrder;
use sift_core::stage::Stage;
use sift_core::traits::TokioSleeper;
use sift_db::{Database, DatabaseConfig};

#[derive(Parser)]
#[command(name = "sift", version, about = "Crawl-and-enrich pipeline runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Re-extract page content from stored screenshots, stalest first
    Extract {
        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        generator: GeneratorArgs,

        /// Hours of staleness forgiven per inbound link
        #[arg(long, env = "SIFT_HOURS_PER_LINK", default_value_t = 1.0)]
        hours_per_link: f64,

        /// Effective age (hours) beyond which a page is recrawled
        #[arg(long, env = "SIFT_MAX_INTERVAL_HOURS", default_value_t = 24.0)]
        max_interval_hours: f64,

        /// Never recrawl a page processed fewer than this many minutes ago
        #[arg(long, env = "SIFT_MIN_INTERVAL_MINUTES", default_value_t = 5.0)]
        min_interval_minutes: f64,
    },

    /// Summarize extracted page content
    Recap {
        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        generator: GeneratorArgs,
    },

    /// Detect whether pages describe products, and their product type
    Categorize {
        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        generator: GeneratorArgs,
    },

    /// Extract product attributes from categorized product pages
    Attributes {
        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        generator: GeneratorArgs,
    },

    /// Remove expired stage locks
    Sweep,
}

#[derive(Args)]
struct RunArgs {
    /// Max candidates to process in this run
    #[arg(short, long, default_value_t = 10)]
    limit: usize,

    /// Only consider pages of this domain
    #[arg(short, long)]
    domain: Option<String>,

    /// Process exactly this page, bypassing candidate selection
    #[arg(long)]
    page_id: Option<i64>,

    /// Reprocess pages whose stage output already exists
    #[arg(long, default_value_t = false)]
    force: bool,

    /// Generator attempts per candidate before giving up
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Backoff between attempts, in milliseconds
    #[arg(long, default_value_t = 500)]
    sleep_ms: u64,

    /// Stage lock TTL in seconds (stale-lock recovery window)
    #[arg(long, env = "SIFT_LOCK_TTL_SECS", default_value_t = 600)]
    lock_ttl_secs: u64,
}

#[derive(Args)]
struct GeneratorArgs {
    /// Generator model (e.g. "gpt-4o-mini", "gemini-2.5-flash")
    #[arg(short, long, env = "SIFT_MODEL")]
    model: String,

    /// OpenAI-compatible API base URL
    #[arg(
        short,
        long,
        env = "SIFT_BASE_URL",
        default_value = "https://api.openai.com/v1"
    )]
    base_url: String,

    /// API key (reads from SIFT_API_KEY env var if not provided)
    #[arg(short, long, env = "SIFT_API_KEY")]
    api_key: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Setup tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sift=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let summary = match cli.command {
        Commands::Extract {
            run,
            generator,
            hours_per_link,
            max_interval_hours,
            min_interval_minutes,
        } => {
            let order = CandidateOrder::RecrawlPriority(RecrawlConfig {
                hours_per_link,
                max_interval_hours,
                min_interval_minutes,
            });
            Some(run_stage(Stage::Extract, order, &run, &generator).await?)
        }
        Commands::Recap { run, generator } => {
            Some(run_stage(Stage::Recap, CandidateOrder::IdAscending, &run, &generator).await?)
        }
        Commands::Categorize { run, generator } => {
            Some(run_stage(Stage::Categorize, CandidateOrder::IdAscending, &run, &generator).await?)
        }
        Commands::Attributes { run, generator } => {
            Some(run_stage(Stage::Attributes, CandidateOrder::IdAscending, &run, &generator).await?)
        }
        Commands::Sweep => {
            cmd_sweep().await?;
            None
        }
    };

    if let Some(summary) = summary {
        report_summary(&summary);
        if !summary.is_success() {
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config).await?;
    db.migrate().await?;
    Ok(db)
}

async fn run_stage(
    stage: Stage,
    order: CandidateOrder,
    run: &RunArgs,
    generator: &GeneratorArgs,
) -> Result<BatchSummary> {
    let db = connect_db().await?;
    let generator =
        OpenAiGenerator::with_base_url(&generator.api_key, &generator.model, &generator.base_url)?;

    let store = db.page_store();
    let locks = StageLockManager::new(db.lock_store(), Duration::from_secs(run.lock_ttl_secs));
    let engine = ExtractionRetryEngine::new(
        generator,
        store.clone(),
        TokioSleeper,
        RetryPolicy {
            max_attempts: run.max_attempts,
            backoff: Duration::from_millis(run.sleep_ms),
        },
    );
    let runner = BatchRunner::new(engine, store, locks);

    let options = BatchOptions {
        stage,
        limit: run.limit,
        domain: run.domain.clone(),
        page_id: run.page_id,
        force: run.force,
        order,
    };

    Ok(runner.run(&options, &TracingReporter).await)
}

async fn cmd_sweep() -> Result<()> {
    let db = connect_db().await?;
    let removed = db.lock_store().sweep_stale().await?;
    println!("Removed {removed} expired stage locks");
    Ok(())
}

fn report_summary(summary: &BatchSummary) {
    println!(
        "{}: {} succeeded, {} failed, {} skipped (locked)",
        summary.stage, summary.succeeded, summary.failed, summary.skipped_locked
    );
    if let Some(error) = &summary.fatal {
        eprintln!("Batch aborted: {error}");
    }
}
