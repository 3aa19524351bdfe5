//! Command-line front end over the SQLite work store.
//!
//! Logs go to stderr; command results are printed to stdout as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use apify_client::{actors, ApifyClient};
use clap::{Parser, Subcommand};
use harvest::extractors::ContactExtractor;
use harvest::{
    rank, run_remote_job, ApifyJobService, ExtractionEngine, HarvestConfig, JobSpec,
    SqliteStore, TracingObserver, WorkInput, WorkStatus, WorkStore,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "harvest")]
#[command(about = "Drive scraping jobs and bulk contact extraction")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add URLs from a file (one per line, `#` comments allowed)
    Enqueue { file: PathBuf },

    /// Extract contacts for every pending URL
    Drain {
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Show item counts by status
    Stats,

    /// List failed items with their last error
    Failed,

    /// Send failed items back to pending
    RequeueFailed,

    /// Run one actor and print its rows
    Actor {
        /// Actor id, or a job board (indeed, linkedin) to use its first available actor
        actor_id: String,
        /// Actor input as JSON
        #[arg(long, default_value = "{}")]
        input: String,
        /// Keep only rows relevant to this query, best first
        #[arg(long)]
        query: Option<String>,
        /// Wall-clock budget in seconds (defaults to MAX_WAIT_SECONDS)
        #[arg(long)]
        max_wait: Option<u64>,
    },
}

#[derive(Serialize)]
struct FailedItem {
    id: String,
    key: String,
    attempts: u32,
    error: Option<String>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn job_spec(actor_id: &str, input: serde_json::Value) -> JobSpec {
    match actors::for_platform(actor_id) {
        Some([primary, fallbacks @ ..]) => {
            JobSpec::new(*primary, input).with_fallbacks(fallbacks.iter().copied())
        }
        _ => JobSpec::new(actor_id, input),
    }
}

fn read_urls(contents: &str) -> Vec<WorkInput> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(WorkInput::url)
        .collect()
}

async fn open_store(config: &HarvestConfig) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::connect(&config.providers.database_url)
        .await
        .with_context(|| format!("Failed to open {}", config.providers.database_url))?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,harvest=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = HarvestConfig::from_env().context("Failed to load configuration")?;

    match cli.command {
        Commands::Enqueue { file } => {
            let contents = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let inputs = read_urls(&contents);

            let store = open_store(&config).await?;
            let inserted = store.enqueue(&inputs).await?;
            print_json(&serde_json::json!({ "submitted": inputs.len(), "inserted": inserted }))?;
        }

        Commands::Drain {
            concurrency,
            max_attempts,
        } => {
            let mut engine_config = config.engine.clone();
            if let Some(concurrency) = concurrency {
                engine_config = engine_config.with_concurrency(concurrency);
            }
            if let Some(max_attempts) = max_attempts {
                engine_config = engine_config.with_max_attempts(max_attempts);
            }

            let extractor = ContactExtractor::from_config(&config.providers)
                .context("Failed to set up contact extraction")?;
            let store = open_store(&config).await?;

            let summary = ExtractionEngine::new(store, engine_config)
                .drain(Arc::new(extractor), &TracingObserver)
                .await
                .context("Drain aborted")?;
            print_json(&summary)?;
        }

        Commands::Stats => {
            let store = open_store(&config).await?;
            print_json(&store.stats().await?)?;
        }

        Commands::Failed => {
            let store = open_store(&config).await?;
            let failed: Vec<FailedItem> = store
                .list(Some(WorkStatus::Failed))
                .await?
                .into_iter()
                .map(|item| FailedItem {
                    id: item.id.to_string(),
                    key: item.input.key,
                    attempts: item.attempt_count,
                    error: item.error,
                })
                .collect();
            print_json(&failed)?;
        }

        Commands::RequeueFailed => {
            let store = open_store(&config).await?;
            let requeued = store.requeue_failed().await?;
            print_json(&serde_json::json!({ "requeued": requeued }))?;
        }

        Commands::Actor {
            actor_id,
            input,
            query,
            max_wait,
        } => {
            let Some(token) = config.providers.apify_token.clone() else {
                bail!("APIFY_KEY must be set");
            };
            let input: serde_json::Value =
                serde_json::from_str(&input).context("--input must be valid JSON")?;
            let max_wait = max_wait
                .map(Duration::from_secs)
                .unwrap_or(config.poll.max_wait);

            let service = Arc::new(ApifyJobService::new(ApifyClient::new(token)));
            let rows = run_remote_job(service, &job_spec(&actor_id, input), max_wait, &config.poll)
                .await
                .context("Actor run failed")?;

            match query {
                Some(query) => {
                    let ranked: Vec<_> = rank(rows, &query)
                        .into_iter()
                        .map(|scored| scored.into_annotated())
                        .collect();
                    print_json(&ranked)?;
                }
                None => print_json(&rows)?,
            }
        }
    }

    Ok(())
}
