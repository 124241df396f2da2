//! Maintenance CLI: run the pipelines by hand and manage users and API keys.

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

use signalboard::config::{AiConfig, AppConfig};
use signalboard::db::{api_keys, users};
use signalboard::{build_state, telemetry};

#[derive(Parser)]
#[command(name = "signalboard-admin")]
#[command(about = "signalboard maintenance commands")]
#[command(version)]
struct Cli {
    /// Overrides `database_url` from the config file.
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scrape every active source once.
    Scrape {
        /// Only this source id.
        #[arg(long)]
        source_id: Option<i64>,
    },
    /// Enrich pending signals until drained.
    Process {
        #[arg(long)]
        batch: Option<usize>,
        #[arg(long, default_value_t = 10)]
        max_iterations: usize,
    },
    /// Move Hacker News "Comments: N" summaries into metadata.
    MigrateHn,
    /// Requeue signals that ran out of enrichment attempts.
    ResetFailed,
    CreateUser {
        #[arg(long)]
        email: String,
    },
    /// Create an agent API key; the secret is printed once.
    CreateKey {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        name: String,
        /// Comma-separated, e.g. `signals:read,sources:read` or `*`.
        #[arg(long, value_delimiter = ',', default_value = "signals:read")]
        permissions: Vec<String>,
        #[arg(long)]
        expires_days: Option<i64>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    telemetry::init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::load_default()?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    let batch_default = config.enrich.batch_size;
    let ai = AiConfig::load_default()?;
    let state = build_state(config, &ai).await?;

    match cli.command {
        Command::Scrape { source_id: Some(id) } => {
            print_json(&state.runner.run_source(id).await?)?;
        }
        Command::Scrape { source_id: None } => {
            print_json(&state.runner.run_all().await?)?;
        }
        Command::Process {
            batch,
            max_iterations,
        } => {
            let batch = batch.unwrap_or(batch_default);
            if batch == 0 {
                bail!("--batch must be >= 1");
            }
            let report = state
                .processor
                .process_until_drained(batch, max_iterations)
                .await?;
            print_json(&report)?;
            let failed = state.processor.failed_count().await?;
            if failed > 0 {
                eprintln!("{failed} signal(s) exhausted their attempts; see `reset-failed`");
            }
        }
        Command::MigrateHn => {
            let n = state.processor.migrate_hn_comment_summaries().await?;
            println!("migrated {n} signal(s)");
        }
        Command::ResetFailed => {
            let n = state.processor.reset_failed().await?;
            println!("requeued {n} signal(s)");
        }
        Command::CreateUser { email } => {
            let user = users::register(&state.pool, &email).await?;
            print_json(&user)?;
        }
        Command::CreateKey {
            user_id,
            name,
            permissions,
            expires_days,
        } => {
            users::get(&state.pool, user_id)
                .await?
                .with_context(|| format!("user {user_id} not found"))?;
            let permissions: Vec<String> = permissions
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if permissions.is_empty() {
                bail!("at least one permission is required");
            }
            let expires_at = match expires_days {
                Some(d) if d <= 0 => bail!("--expires-days must be positive"),
                Some(d) => Some(Utc::now() + Duration::days(d)),
                None => None,
            };
            let (key, secret) =
                api_keys::create(&state.pool, user_id, &name, &permissions, expires_at).await?;
            print_json(&key)?;
            println!("secret (shown once): {secret}");
        }
    }
    Ok(())
}
