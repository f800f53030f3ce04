//! Command-line control surface for the replication engine: one-shot syncs,
//! multi-company queues, gateway probes, audit queries, and a scheduler
//! watch mode. The HTTP layer consumes the same engine operations; this
//! binary exposes them from a terminal.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use syncline_core::config::{load_config, AppConfig};
use syncline_core::retry::RetryCircuit;
use syncline_core::spec::load_table_specs;
use syncline_engine::outcome::{Outcome, STATUS_FAILED};
use syncline_engine::queue::SyncQueue;
use syncline_engine::recover::Recoverer;
use syncline_engine::schedule::Scheduler;
use syncline_engine::session::SyncKind;
use syncline_engine::sync::Synchronizer;
use syncline_gateway::client::{Gateway, GatewayClient};
use syncline_store::audit::{AuditFilter, AuditRecorder};
use syncline_store::schema::load_schema;
use syncline_store::store::Store;

#[derive(Debug, Parser)]
#[command(
    name = "syncline",
    about = "Mirrors accounting data from an ERP gateway into a local SQLite store",
    version
)]
struct Cli {
    /// Configuration file (YAML).
    #[arg(long, global = true, default_value = "./syncline.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one sync for a company.
    Sync {
        /// Target company; defaults to the configured one.
        #[arg(long)]
        company: Option<String>,
        /// Full refresh instead of incremental.
        #[arg(long)]
        full: bool,
        /// Fan out gateway extraction concurrently (full sync only).
        #[arg(long)]
        parallel: bool,
    },
    /// Sync several companies back to back through the queue.
    Queue {
        #[arg(required = true)]
        companies: Vec<String>,
        #[arg(long)]
        full: bool,
    },
    /// List the companies open on the gateway.
    Companies,
    /// Check gateway reachability.
    TestConnection,
    /// Apply the configured schedule and keep running until interrupted.
    Watch,
    /// Synced companies, per-table row counts, store size, breaker states.
    Status,
    /// Recent sync sessions.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show or dismiss an interrupted run from a previous process.
    Recover {
        #[arg(long)]
        dismiss: bool,
    },
    /// Audit trail queries.
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    /// Audit history with optional filters.
    History {
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        guid: Option<String>,
        #[arg(long)]
        action: Option<String>,
        #[arg(long)]
        company: Option<String>,
        /// Start date (inclusive, ISO).
        #[arg(long)]
        from: Option<String>,
        /// End date (inclusive, ISO).
        #[arg(long)]
        to: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Complete history of one record.
    Record { table: String, guid: String },
    /// Everything one sync session changed.
    Session { session_id: String },
    /// Deleted records available for restoration.
    Deleted {
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        include_restored: bool,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Aggregate audit counts.
    Stats {
        #[arg(long)]
        company: Option<String>,
    },
    /// Restore a deleted record by id.
    Restore { id: i64 },
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

/// Everything a sync-shaped command needs, wired once.
struct Engine {
    config: AppConfig,
    store: Arc<Store>,
    audit: Arc<AuditRecorder>,
    synchronizer: Arc<Synchronizer>,
    table_names: Vec<String>,
}

fn build_client(config: &AppConfig) -> Result<Arc<GatewayClient>> {
    let circuit = Arc::new(RetryCircuit::new(
        config.retry.clone(),
        config.breaker.clone(),
    ));
    let client =
        GatewayClient::new(&config.gateway, circuit).context("failed to build gateway client")?;
    Ok(Arc::new(client))
}

fn build_engine(config: AppConfig) -> Result<Engine> {
    let specs = load_table_specs(Path::new(&config.sync.spec_path))
        .context("failed to load table specs")?;
    let table_names: Vec<String> = specs.all().map(|spec| spec.name.clone()).collect();
    let client = build_client(&config)?;
    let store = Arc::new(Store::open(&config.store).context("failed to open store")?);
    let audit = Arc::new(AuditRecorder::new(Arc::clone(&store)));
    let schema_sql = load_schema(Path::new(&config.store.schema_path));
    let recoverer = Recoverer::new(&config.sync.state_path);
    let synchronizer = Arc::new(Synchronizer::new(
        client as Arc<dyn Gateway>,
        Arc::clone(&store),
        Arc::clone(&audit),
        Arc::new(specs),
        recoverer,
        schema_sql,
        config.sync.batch_size,
    ));
    Ok(Engine {
        config,
        store,
        audit,
        synchronizer,
        table_names,
    })
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prints the outcome and converts a failed one into a nonzero exit.
fn finish(outcome: Outcome) -> Result<()> {
    let failed = outcome.is(STATUS_FAILED);
    print_json(&outcome)?;
    if failed {
        anyhow::bail!("operation failed: {}", outcome.message);
    }
    Ok(())
}

fn target_company(config: &AppConfig, company: Option<String>) -> Result<String> {
    let company = company.unwrap_or_else(|| config.gateway.company.clone());
    if company.trim().is_empty() {
        anyhow::bail!("no company given and none configured");
    }
    Ok(company)
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config).context("failed to load configuration")?;

    match cli.command {
        Command::Sync {
            company,
            full,
            parallel,
        } => {
            let company = target_company(&config, company)?;
            let engine = build_engine(config)?;
            let outcome = if full {
                engine.synchronizer.full_sync(&company, parallel).await
            } else {
                engine.synchronizer.incremental_sync(&company).await
            };
            finish(outcome)
        }
        Command::Queue { companies, full } => {
            let engine = build_engine(config)?;
            let queue = Arc::new(SyncQueue::new(Arc::clone(&engine.synchronizer)));
            let kind = if full {
                SyncKind::Full
            } else {
                SyncKind::Incremental
            };
            let added = queue.add(&companies, kind);
            if added.is(STATUS_FAILED) {
                return finish(added);
            }
            let started = queue.start();
            if started.is(STATUS_FAILED) {
                return finish(started);
            }
            while queue.is_processing() {
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
            print_json(&queue.status())
        }
        Command::Companies => {
            let client = build_client(&config)?;
            let companies = client
                .list_companies()
                .await
                .context("failed to list companies")?;
            print_json(&companies)
        }
        Command::TestConnection => {
            let client = build_client(&config)?;
            print_json(&client.test_connection().await)
        }
        Command::Watch => {
            let company = target_company(&config, None)?;
            let schedule = config.schedule.clone();
            let engine = build_engine(config)?;
            let scheduler = Arc::new(Scheduler::new(
                Arc::clone(&engine.synchronizer),
                &company,
                schedule.clone(),
            ));
            let applied = scheduler.update(schedule);
            if applied.is(STATUS_FAILED) {
                return finish(applied);
            }
            print_json(&scheduler.status())?;
            tracing::info!("watching; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("signal handler")?;
            scheduler.stop();
            Ok(())
        }
        Command::Status => {
            let engine = build_engine(config)?;
            engine
                .store
                .bootstrap(
                    &load_schema(Path::new(&engine.config.store.schema_path)),
                    &engine.table_names,
                )
                .context("failed to bootstrap store")?;
            let status = json!({
                "session": engine.synchronizer.status(),
                "companies": engine.store.synced_companies()?,
                "table_counts": engine.store.table_counts(&engine.table_names, None)?,
                "store_bytes": engine.store.size_bytes(),
            });
            print_json(&status)
        }
        Command::History { limit } => {
            let engine = build_engine(config)?;
            print_json(&engine.store.list_history(limit)?)
        }
        Command::Recover { dismiss } => {
            let recoverer = Recoverer::new(&config.sync.state_path);
            if dismiss {
                let dismissed = recoverer.dismiss();
                print_json(&json!({ "dismissed": dismissed }))
            } else {
                print_json(&json!({ "incomplete": recoverer.incomplete() }))
            }
        }
        Command::Audit { command } => {
            let engine = build_engine(config)?;
            match command {
                AuditCommand::History {
                    table,
                    guid,
                    action,
                    company,
                    from,
                    to,
                    limit,
                    offset,
                } => {
                    let records = engine.audit.history(&AuditFilter {
                        table,
                        row_guid: guid,
                        action,
                        company,
                        start_date: from,
                        end_date: to,
                        limit,
                        offset,
                    })?;
                    print_json(&records)
                }
                AuditCommand::Record { table, guid } => {
                    print_json(&engine.audit.record_history(&table, &guid)?)
                }
                AuditCommand::Session { session_id } => {
                    print_json(&engine.audit.session_changes(&session_id)?)
                }
                AuditCommand::Deleted {
                    table,
                    company,
                    include_restored,
                    limit,
                } => {
                    let records = engine.audit.deleted_records(
                        table.as_deref(),
                        company.as_deref(),
                        include_restored,
                        limit,
                        0,
                    )?;
                    print_json(&records)
                }
                AuditCommand::Stats { company } => {
                    print_json(&engine.audit.stats(company.as_deref())?)
                }
                AuditCommand::Restore { id } => {
                    let restored = engine
                        .audit
                        .restore(id, engine.config.sync.batch_size)
                        .context("restore failed")?;
                    print_json(&restored)
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    run(Cli::parse()).await
}
