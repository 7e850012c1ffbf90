use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use call_ledger::calls::{CallLedger, RawCallEvent, spawn_freeze_task};
use call_ledger::config::{BackfillConfig, FreezeConfig, LedgerConfig};
use call_ledger::error::Error;
use call_ledger::store::{Database, LibSqlBackend};

#[derive(Debug, Parser)]
#[command(name = "call-ledger")]
#[command(about = "Reconcile provider call events into canonical call records")]
struct Cli {
    /// Database file; overrides CALL_LEDGER_DB_PATH.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Tenant to operate on; overrides CALL_LEDGER_TENANT.
    #[arg(long, global = true)]
    tenant: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ingest raw call events, one JSON object per line.
    Ingest { file: PathBuf },
    /// Run one freeze tick.
    Freeze {
        #[arg(long)]
        cooldown_hours: Option<u32>,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Re-normalize every stored record against the current roster.
    Backfill {
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Fold duplicate conversations per contact into the earliest one.
    Merge,
    /// Print the conversation timeline of a contact.
    Conversation { contact_id: Uuid },
    /// Run the periodic freeze task until interrupted.
    Run,
}

#[derive(Debug, Default, Serialize)]
struct IngestReport {
    total: usize,
    ingested: usize,
    rejected: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            let code = e.downcast_ref::<Error>().map_or(1, Error::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = LedgerConfig::from_env().map_err(Error::from)?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(tenant) = cli.tenant {
        config.tenant_id = tenant;
    }

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .map_err(Error::from)?,
    );
    let ledger = CallLedger::new(db, config.tenant_id.clone(), config.business_lines.clone());

    match cli.command {
        Command::Ingest { file } => {
            let report = ingest_file(&ledger, &file).await?;
            print_json(&report)
        }
        Command::Freeze {
            cooldown_hours,
            batch_size,
        } => {
            let freeze = FreezeConfig::new(
                cooldown_hours.unwrap_or(config.freeze.cooldown_hours),
                batch_size.unwrap_or(config.freeze.batch_size),
            )
            .map_err(Error::from)?;
            print_json(&ledger.freeze_tick(&freeze).await?)
        }
        Command::Backfill { batch_size } => {
            let backfill = match batch_size {
                Some(size) => BackfillConfig::new(size).map_err(Error::from)?,
                None => config.backfill,
            };
            print_json(&ledger.backfill(&backfill).await?)
        }
        Command::Merge => print_json(&ledger.merge_duplicates().await?),
        Command::Conversation { contact_id } => {
            let conversation = ledger.resolve_conversation(contact_id).await?;
            let (conversation, messages) = ledger.conversation_timeline(conversation.id).await?;
            print_json(&serde_json::json!({
                "conversation": conversation,
                "messages": messages,
            }))
        }
        Command::Run => {
            eprintln!("📞 call-ledger v{}", env!("CARGO_PKG_VERSION"));
            eprintln!("   Database: {}", config.db_path.display());
            eprintln!("   Tenant: {}", config.tenant_id);
            eprintln!("   Business lines: {}", config.business_lines.len());
            eprintln!(
                "   Freeze: every {}s, cooldown {}h, batch {}",
                config.freeze_interval.as_secs(),
                config.freeze.cooldown_hours,
                config.freeze.batch_size
            );

            let handle = spawn_freeze_task(ledger.freezer(), config.freeze, config.freeze_interval);
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            handle.abort();
            tracing::info!("Shutting down");
            Ok(())
        }
    }
}

/// Ingest a JSONL file. Malformed lines are counted and skipped; a store
/// outage stops the run.
async fn ingest_file(ledger: &CallLedger, path: &Path) -> anyhow::Result<IngestReport> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut report = IngestReport::default();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        report.total += 1;

        let event: RawCallEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(line = index + 1, error = %e, "Unparseable event skipped");
                report.rejected += 1;
                continue;
            }
        };
        match ledger.ingest(&event).await {
            Ok(_) => report.ingested += 1,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(line = index + 1, error = %e, "Event rejected");
                report.rejected += 1;
            }
        }
    }
    Ok(report)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
