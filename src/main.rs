//! # ProCharity — task feed reconciliation and Telegram outreach
//!
//! Usage:
//!   procharity ingest tasks.json               # Reconcile a batch and notify subscribers
//!   procharity ingest tasks.json --no-notify   # Reconcile only
//!   procharity broadcast --message "..." --mailing all
//!   procharity subscribe --recipient 42 --category 7
//!   procharity mailing --recipient 42 --enabled false
//!   procharity init-db

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use procharity_channels::TelegramSink;
use procharity_core::ProCharityConfig;
use procharity_core::types::MailingType;
use procharity_scheduler::{TaskDb, TaskEngine};

#[derive(Parser)]
#[command(
    name = "procharity",
    version,
    about = "🤝 ProCharity — task feed reconciliation and paced Telegram notifications"
)]
struct Cli {
    /// Config file (default: ~/.procharity/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile a JSON array of tasks and notify subscribers of new ones
    Ingest {
        file: PathBuf,
        /// Reconcile only, send nothing
        #[arg(long)]
        no_notify: bool,
    },
    /// Send an operator message to users
    Broadcast {
        #[arg(short, long)]
        message: String,
        /// subscribed | unsubscribed | all
        #[arg(long, default_value = "subscribed")]
        mailing: MailingType,
        #[arg(long, default_value = "admin")]
        sent_by: String,
    },
    /// Subscribe a recipient to a category (enables their mailing)
    Subscribe {
        #[arg(long)]
        recipient: i64,
        #[arg(long)]
        category: i64,
        #[arg(long)]
        username: Option<String>,
    },
    /// Turn a recipient's notifications on or off
    Mailing {
        #[arg(long)]
        recipient: i64,
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Create or migrate the database schema
    InitDb,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(path: Option<&str>) -> Result<ProCharityConfig> {
    let config = match path {
        Some(p) => ProCharityConfig::load_from(&expand_path(p))?,
        None => ProCharityConfig::load()?,
    };
    Ok(config)
}

/// Build the engine on the SQLite store. Sending requires a bot token.
async fn build_engine(config: &ProCharityConfig, db: Arc<TaskDb>, sends: bool) -> Result<TaskEngine> {
    let sink = TelegramSink::new(config.telegram.clone(), config.dispatch.send_timeout())?;
    if sends {
        if !sink.has_token() {
            anyhow::bail!(
                "telegram.bot_token is not set (config file or {})",
                procharity_core::config::TOKEN_ENV
            );
        }
        match sink.get_me().await {
            Ok(me) => tracing::info!("🤖 Telegram bot: @{}", me.username.as_deref().unwrap_or(&me.first_name)),
            Err(e) => tracing::warn!("⚠️ Telegram getMe failed, sends may fail: {e}"),
        }
    }
    let engine = TaskEngine::from_store(db, Arc::new(sink), config);
    engine.start();
    Ok(engine)
}

/// Wait for every scheduled job. Ctrl-C cancels jobs that are not yet due
/// and lets in-flight sends finish.
async fn finish(engine: &TaskEngine) {
    let drain = engine.drain();
    tokio::pin!(drain);
    tokio::select! {
        biased;
        _ = &mut drain => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("🛑 Interrupted, cancelling pending notifications");
            engine.shutdown().await;
            drain.await;
        }
    }
    let stats = engine.stats().await;
    tracing::info!("📊 Dispatch finished: {} jobs sent, {} cancelled", stats.completed, stats.cancelled);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so reports on stdout stay machine-readable.
    let filter = if cli.verbose {
        "procharity=debug,procharity_scheduler=debug,procharity_channels=debug"
    } else {
        "procharity=info,procharity_scheduler=info,procharity_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;
    let db_path = config.database.resolved_path();
    let db = Arc::new(
        TaskDb::open(Path::new(&db_path)).with_context(|| format!("opening {}", db_path.display()))?,
    );

    match cli.command {
        Command::InitDb => {
            println!("✅ Database ready: {}", db_path.display());
        }
        Command::Ingest { file, no_notify } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let engine = build_engine(&config, db, !no_notify).await?;
            let report = engine.ingest_json(&raw, !no_notify).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            finish(&engine).await;
        }
        Command::Broadcast {
            message,
            mailing,
            sent_by,
        } => {
            let engine = build_engine(&config, db, true).await?;
            let report = engine.broadcast(&message, mailing, &sent_by).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            finish(&engine).await;
        }
        Command::Subscribe {
            recipient,
            category,
            username,
        } => {
            db.upsert_recipient(recipient, username.as_deref(), true)?;
            db.subscribe(recipient, category)?;
            println!("✅ {recipient} subscribed to category {category}");
        }
        Command::Mailing { recipient, enabled } => {
            if !db.set_mailing(recipient, enabled)? {
                anyhow::bail!("unknown recipient {recipient}");
            }
            let state = if enabled { "on" } else { "off" };
            println!("✅ Mailing {state} for {recipient}");
        }
    }

    Ok(())
}
