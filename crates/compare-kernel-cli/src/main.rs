use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use compare_kernel_api::{
    open_sqlite_slots, CompareEngine, EngineConfig, HttpRecordSource, MutationOutcome,
    RecordSource, SlotStorage, StartupReport, DEFAULT_BASE_ADDRESS, DEFAULT_SLOT_KEY,
};
use compare_kernel_core::{
    FetchError, Identifier, SelectionError, VehicleRecord, DEFAULT_SELECTION_PARAM,
};
use compare_kernel_store_sqlite::SqliteStore;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ck")]
#[command(about = "Compare Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./compare_kernel.sqlite3")]
    db: PathBuf,

    /// Base URL of the vehicle record store, required by `compare`.
    #[arg(long)]
    records_url: Option<String>,

    #[arg(long, default_value = DEFAULT_SLOT_KEY)]
    slot_key: String,

    #[arg(long, default_value = DEFAULT_SELECTION_PARAM)]
    param: String,

    /// Path and query the selection parameter is merged into.
    #[arg(long)]
    base_address: Option<String>,

    #[arg(long, default_value_t = 10)]
    fetch_timeout_secs: u64,

    /// Address the session was opened with; a differing non-empty selection in it wins.
    #[arg(long)]
    address: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Add(IdArgs),
    Remove(IdArgs),
    Clear,
    Show,
    Contains(IdArgs),
    Open(OpenArgs),
    Compare,
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
struct IdArgs {
    id: String,
}

#[derive(Debug, Args)]
struct OpenArgs {
    address: String,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Slot,
    DropSlot,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

/// Record source for commands that never resolve records.
struct NoRecordStore;

#[async_trait]
impl RecordSource for NoRecordStore {
    async fn fetch(&self, _id: &Identifier) -> Result<VehicleRecord, FetchError> {
        Err(FetchError::Transport("no record store configured; pass --records-url".to_string()))
    }
}

type OfflineEngine = CompareEngine<SqliteStore, NoRecordStore>;

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = engine_config(&cli);

    match &cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store, &cli.slot_key)
        }
        Command::Compare => run_compare(&cli, &config).await,
        Command::Add(args) => {
            let (mut engine, _) = open_engine(&cli, &config)?;
            run_add(&mut engine, &args.id)
        }
        Command::Remove(args) => {
            let (mut engine, _) = open_engine(&cli, &config)?;
            run_remove(&mut engine, &args.id)
        }
        Command::Clear => {
            let (mut engine, _) = open_engine(&cli, &config)?;
            emit_json(accepted(&engine.clear())?)
        }
        Command::Show => {
            let (engine, startup) = open_engine(&cli, &config)?;
            run_show(&engine, &startup)
        }
        Command::Contains(args) => {
            let (engine, _) = open_engine(&cli, &config)?;
            run_contains(&engine, &args.id)
        }
        Command::Open(args) => {
            let (mut engine, _) = open_engine(&cli, &config)?;
            emit_json(accepted(&engine.navigate(&args.address))?)
        }
    }
}

fn engine_config(cli: &Cli) -> EngineConfig {
    EngineConfig {
        slot_key: cli.slot_key.clone(),
        address_param: cli.param.clone(),
        base_address: cli
            .base_address
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_ADDRESS.to_string()),
        fetch_timeout_ms: cli.fetch_timeout_secs.saturating_mul(1_000),
    }
}

fn open_engine(cli: &Cli, config: &EngineConfig) -> Result<(OfflineEngine, StartupReport)> {
    debug!(db = %cli.db.display(), slot_key = %config.slot_key, "opening selection engine");
    let store = open_sqlite_slots(&cli.db)?;
    CompareEngine::start(store, NoRecordStore, config, cli.address.as_deref())
}

fn run_add(engine: &mut OfflineEngine, raw: &str) -> Result<()> {
    match engine.add_raw(raw) {
        Ok(outcome) => emit_json(accepted(&outcome)?),
        Err(err) => emit_json(rejected(&err, engine)),
    }
}

fn run_remove(engine: &mut OfflineEngine, raw: &str) -> Result<()> {
    match Identifier::parse(raw) {
        Ok(id) => emit_json(accepted(&engine.remove(&id))?),
        Err(err) => emit_json(rejected(&err, engine)),
    }
}

fn run_show(engine: &OfflineEngine, startup: &StartupReport) -> Result<()> {
    emit_json(serde_json::json!({
        "selection": engine.selection(),
        "count": engine.count(),
        "address": engine.address().to_string(),
        "source": startup.reconciliation.source,
        "startup": startup,
    }))
}

fn run_contains(engine: &OfflineEngine, raw: &str) -> Result<()> {
    match Identifier::parse(raw) {
        Ok(id) => emit_json(serde_json::json!({
            "id": id,
            "contains": engine.contains(&id),
        })),
        Err(err) => emit_json(serde_json::json!({
            "id": raw,
            "contains": false,
            "advisory": advisory(&err),
        })),
    }
}

async fn run_compare(cli: &Cli, config: &EngineConfig) -> Result<()> {
    let records_url = cli.records_url.as_deref().context("compare requires --records-url")?;
    debug!(records_url, timeout_ms = config.fetch_timeout_ms, "comparing against record store");
    let source = HttpRecordSource::new(records_url, config.fetch_timeout())?;
    let store = open_sqlite_slots(&cli.db)?;
    let (engine, _) = CompareEngine::start(store, source, config, cli.address.as_deref())?;

    match engine.compare().await {
        Ok(comparison) => {
            let mut value =
                serde_json::to_value(&comparison).context("failed to serialize comparison")?;
            if let Value::Object(object) = &mut value {
                object.insert("accepted".to_string(), Value::Bool(true));
                object.insert(
                    "selection".to_string(),
                    serde_json::to_value(engine.selection())
                        .context("failed to serialize selection")?,
                );
                object.insert("address".to_string(), Value::String(engine.address().to_string()));
            }
            emit_json(value)
        }
        Err(err) => emit_json(rejected(&err, &engine)),
    }
}

fn run_db(command: &DbCommand, store: &mut SqliteStore, slot_key: &str) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
        DbCommand::Slot => {
            let entry = store.slot_entry(slot_key)?;
            emit_json(serde_json::json!({
                "slot_key": slot_key,
                "entry": serde_json::to_value(entry).context("failed to serialize slot entry")?,
            }))
        }
        DbCommand::DropSlot => {
            let deleted = store.delete_slot(slot_key)?;
            emit_json(serde_json::json!({ "slot_key": slot_key, "deleted": deleted }))
        }
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "inferred_from_legacy": status.inferred_from_legacy,
        "up_to_date": status.pending_versions.is_empty(),
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy,
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "current_version": before.current_version,
        "target_version": before.target_version,
        "after_version": after.current_version,
        "up_to_date": after.pending_versions.is_empty(),
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn accepted(outcome: &MutationOutcome) -> Result<Value> {
    let mut value = serde_json::to_value(outcome).context("failed to serialize mutation outcome")?;
    if let Value::Object(object) = &mut value {
        object.insert("accepted".to_string(), Value::Bool(true));
    }
    Ok(value)
}

fn rejected<S, R>(err: &SelectionError, engine: &CompareEngine<S, R>) -> Value
where
    S: SlotStorage,
    R: RecordSource + 'static,
{
    serde_json::json!({
        "accepted": false,
        "advisory": advisory(err),
        "selection": engine.selection(),
        "count": engine.count(),
        "address": engine.address().to_string(),
    })
}

fn advisory(err: &SelectionError) -> Value {
    serde_json::json!({
        "code": err.code(),
        "message": err.to_string(),
    })
}
