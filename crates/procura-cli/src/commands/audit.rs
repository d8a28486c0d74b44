//! Audit ledger queries and exports.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use procura_core::audit::AuditExporter;
use procura_core::ledger::EventKind;
use procura_core::store::{EventFilter, SqliteStore};
use procura_core::CoreConfig;
use uuid::Uuid;

use super::format_ts;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ExportFormat {
    Json,
    Csv,
}

#[derive(Subcommand, Debug)]
pub enum AuditCommand {
    /// List ledger events, newest first
    List {
        /// Filter by principal id
        #[arg(long)]
        principal: Option<Uuid>,

        /// Filter by event type (issue, delegate, revoke, decision_allow,
        /// decision_deny, metering)
        #[arg(long)]
        event_type: Option<String>,

        /// Filter by correlation id
        #[arg(long)]
        correlation: Option<String>,

        /// Maximum rows
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },

    /// Export matching events to a file
    Export {
        /// Output path
        #[arg(short, long)]
        output: PathBuf,

        /// Export format
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,

        /// Filter by principal id
        #[arg(long)]
        principal: Option<Uuid>,

        /// Inclusive lower bound, milliseconds since epoch
        #[arg(long)]
        from_ms: Option<i64>,

        /// Exclusive upper bound, milliseconds since epoch
        #[arg(long)]
        to_ms: Option<i64>,

        /// Maximum rows
        #[arg(long, default_value_t = 10_000)]
        limit: u32,
    },
}

pub fn run(config: &CoreConfig, command: AuditCommand) -> Result<()> {
    let store = Arc::new(
        SqliteStore::open(&config.store_path)
            .with_context(|| format!("opening store {}", config.store_path.display()))?,
    );
    let exporter = AuditExporter::new(store);

    match command {
        AuditCommand::List {
            principal,
            event_type,
            correlation,
            limit,
        } => {
            let kind = event_type
                .as_deref()
                .map(|text| {
                    EventKind::parse(text)
                        .ok_or_else(|| anyhow::anyhow!("unknown event type '{text}'"))
                })
                .transpose()?;
            let filter = EventFilter {
                principal_id: principal,
                kind,
                correlation_id: correlation,
                limit: Some(limit),
                ..EventFilter::default()
            };
            for event in exporter.query(&filter)? {
                println!(
                    "{}  #{:<8} {:<14} {}  {}",
                    format_ts(event.ts_ms),
                    event.event_id,
                    event.body.kind,
                    event.body.principal_id,
                    event
                        .body
                        .resource
                        .as_deref()
                        .unwrap_or("-"),
                );
            }
            Ok(())
        },
        AuditCommand::Export {
            output,
            format,
            principal,
            from_ms,
            to_ms,
            limit,
        } => {
            let filter = EventFilter {
                principal_id: principal,
                from_ms,
                to_ms,
                limit: Some(limit),
                ..EventFilter::default()
            };
            let text = match format {
                ExportFormat::Json => exporter.export_json(&filter)?,
                ExportFormat::Csv => exporter.export_csv(&filter)?,
            };
            std::fs::write(&output, &text)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("wrote {} bytes to {}", text.len(), output.display());
            Ok(())
        },
    }
}
