//! Replay and snapshot commands.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use procura_core::CoreConfig;
use procura_core::clock::now_ms;
use procura_core::replay::{ReplayManager, ReplayStart};
use procura_core::spending::SpendingCache;
use procura_core::store::SqliteStore;

use super::format_ts;

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Partition to replay
    #[arg(long, default_value_t = 0)]
    pub partition: i32,

    /// Replay from this ledger offset (mutually exclusive with
    /// --from-snapshot)
    #[arg(long, conflicts_with = "from_snapshot")]
    pub from_offset: Option<i64>,

    /// Replay from the latest snapshot
    #[arg(long)]
    pub from_snapshot: bool,
}

fn open_store(config: &CoreConfig) -> Result<Arc<SqliteStore>> {
    Ok(Arc::new(
        SqliteStore::open(&config.store_path)
            .with_context(|| format!("opening store {}", config.store_path.display()))?,
    ))
}

fn open_manager(store: &Arc<SqliteStore>, config: &CoreConfig) -> ReplayManager {
    let cache = Arc::new(SpendingCache::new(config.spending_cache.clone()));
    ReplayManager::new(Arc::clone(store), cache)
}

pub fn run(config: &CoreConfig, args: &ReplayArgs) -> Result<()> {
    let start = if args.from_snapshot {
        ReplayStart::FromLatestSnapshot
    } else {
        ReplayStart::FromOffset(args.from_offset.unwrap_or(1))
    };

    // Consumers must be stopped while derived state rebuilds; a failed
    // verification below means they stay stopped.
    let store = open_store(config)?;
    let report = open_manager(&store, config)
        .replay(args.partition, start, now_ms())
        .context("replay failed; do not resume consumers")?;

    println!("partition:        {}", report.partition);
    println!(
        "range:            {} ..= {}",
        report.start_event_id, report.end_event_id
    );
    println!("events replayed:  {}", report.events_replayed);
    println!("batches verified: {}", report.batches_verified);
    if let Some(snapshot_id) = report.snapshot_id {
        println!("from snapshot:    {snapshot_id}");
    }
    for (principal, total) in &report.derived_totals {
        println!("  {principal}  {total} minor units");
    }
    println!("verification passed; consumers may resume");
    Ok(())
}

pub fn snapshot(config: &CoreConfig, partition: i32) -> Result<()> {
    let store = open_store(config)?;
    let snapshot = open_manager(&store, config)
        .take_snapshot(partition, now_ms())
        .context("snapshot failed")?;
    let pruned = store.prune_snapshots(partition, config.retention.snapshots_keep)?;

    println!("snapshot:       {}", snapshot.snapshot_id);
    println!("partition:      {}", snapshot.partition);
    println!("as_of_event_id: {}", snapshot.as_of_event_id);
    println!("created:        {}", format_ts(snapshot.created_ms));
    if pruned > 0 {
        println!("pruned:         {pruned} old snapshots");
    }
    Ok(())
}
