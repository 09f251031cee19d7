use std::fs;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vtmd_kernel::config::VtmdConfig;
use vtmd_kernel::engine::memory::MemoryEngine;
use vtmd_kernel::invariants::InvariantEngine;
use vtmd_kernel::record::{ObjectName, TrxId};
use vtmd_kernel::replay::{replay_script, ReplayReport, Statement};
use vtmd_kernel::trx::TrxRegistry;

/// VTMD catalog CLI
#[derive(Parser, Debug)]
#[command(name = "vtmd")]
#[command(about = "Replay DDL against in-memory VTMD catalogs (dry-run)", long_about = None)]
struct Cli {
    /// Path to DDL script JSON
    #[arg(long)]
    script: String,

    /// Path to VTMD config JSON
    #[arg(long)]
    config: Option<String>,

    /// Log filter, e.g. `info` or `vtmd_kernel=debug`
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Mark the epochs current as of this RFC 3339 time
    #[arg(long)]
    as_of: Option<DateTime<Utc>>,
}

/// One catalog row with its epoch resolved to commit times.
#[derive(Debug, Serialize)]
struct EpochRow {
    name: String,
    archive_name: Option<String>,
    start: TrxId,
    end: TrxId,
    valid_from: Option<DateTime<Utc>>,
    valid_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_as_of: Option<bool>,
}

#[derive(Debug, Serialize)]
struct CatalogDump {
    table: String,
    rows: Vec<EpochRow>,
}

/// Wrapper for JSON output
#[derive(Debug, Serialize)]
struct CliOutput {
    report: ReplayReport,
    catalogs: Vec<CatalogDump>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::from_default_env()),
        )
        .with_writer(std::io::stderr)
        .init();

    // ----------------------------
    // Load config
    // ----------------------------
    let config = if let Some(path) = &cli.config {
        let data = fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
        VtmdConfig::from_json(&data)?
    } else {
        VtmdConfig::default_config()
    };
    VtmdConfig::init_global(config)?;
    let config = VtmdConfig::global();

    // ----------------------------
    // Load script
    // ----------------------------
    let script = fs::read_to_string(&cli.script)
        .with_context(|| format!("read script {}", cli.script))?;
    let statements: Vec<Statement> = serde_json::from_str(&script)?;
    info!(statements = statements.len(), "loaded DDL script");

    // ----------------------------
    // Replay
    // ----------------------------
    let engine = MemoryEngine::new(config);
    let invariants = InvariantEngine::with_defaults();
    let report = replay_script(&engine, config, &statements, &invariants)?;

    // ----------------------------
    // Output
    // ----------------------------
    // Snapshot of the last transaction committed by `--as-of`.
    let as_of = cli.as_of.map(|ts| engine.registry().trx_id_at(ts, true));
    if as_of == Some(None) {
        info!("nothing committed by --as-of, no epoch is current");
    }
    let catalogs = engine
        .vtmd_tables()
        .into_iter()
        .map(|table| dump_catalog(&engine, table, as_of))
        .collect::<Result<Vec<_>>>()?;
    let output = CliOutput { report, catalogs };

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

/// `as_of` is `Some(reader)` when `--as-of` was given; a `None` reader
/// means nothing had committed yet.
fn dump_catalog(
    engine: &MemoryEngine,
    table: ObjectName,
    as_of: Option<Option<TrxId>>,
) -> Result<CatalogDump> {
    let registry = engine.registry();
    let rows = engine
        .rows(&table)
        .unwrap_or_default()
        .into_iter()
        .map(|record| -> Result<EpochRow> {
            let current_as_of = match as_of {
                None => None,
                Some(None) => Some(false),
                Some(Some(reader)) => {
                    Some(registry.epoch_visible(reader, record.start, record.end)?)
                }
            };
            Ok(EpochRow {
                valid_from: commit_time(registry, record.start),
                valid_until: commit_time(registry, record.end),
                name: record.name,
                archive_name: record.archive_name,
                start: record.start,
                end: record.end,
                current_as_of,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CatalogDump {
        table: table.to_string(),
        rows,
    })
}

fn commit_time(registry: &TrxRegistry, trx_id: TrxId) -> Option<DateTime<Utc>> {
    if trx_id.is_max() {
        None
    } else {
        registry.commit_ts(trx_id)
    }
}
