//! Inspect command implementation.

use super::{format_size, open_existing};
use habitsync_store::{meta, StoreStats};
use serde::Serialize;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Table, queue and log statistics.
    pub stats: StoreStats,
    /// Last completed push.
    pub last_push_at: Option<String>,
    /// Last completed pull.
    pub last_pull_at: Option<String>,
    /// Last fully successful pass.
    pub last_sync_at: Option<String>,
    /// Whether the first-run import ran.
    pub initial_import_complete: bool,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(path)?;
    let result = InspectResult {
        path: path.display().to_string(),
        stats: store.stats()?,
        last_push_at: store.get_meta(meta::LAST_PUSH_AT),
        last_pull_at: store.get_meta(meta::LAST_PULL_AT),
        last_sync_at: store.get_meta(meta::LAST_SYNC_AT),
        initial_import_complete: store.get_meta(meta::INITIAL_IMPORT_COMPLETE).is_some(),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    let stats = &result.stats;
    println!("habitsync Store Inspection");
    println!("==========================");
    println!();
    println!("Path:           {}", result.path);
    println!("Schema version: {}", stats.schema_version);
    println!("Log size:       {}", format_size(stats.log_size));
    println!("Meta entries:   {}", stats.meta_entries);
    println!();
    println!("Tables:");
    println!(
        "  {:<14} {:>7} {:>7} {:>7} {:>7} {:>10}",
        "table", "total", "synced", "pending", "error", "tombstones"
    );
    for table in &stats.tables {
        println!(
            "  {:<14} {:>7} {:>7} {:>7} {:>7} {:>10}",
            table.entity_type.to_string(),
            table.total,
            table.synced,
            table.pending,
            table.error,
            table.tombstones
        );
    }
    println!();
    println!("Sync queue:");
    println!("  Items:         {}", stats.queue.total);
    println!("  Due now:       {}", stats.queue.due);
    println!("  Dead-lettered: {}", stats.queue.dead_lettered);
    println!();
    println!("Sync:");
    println!(
        "  Initial import: {}",
        if result.initial_import_complete { "done" } else { "not run" }
    );
    println!("  Last push:      {}", result.last_push_at.as_deref().unwrap_or("never"));
    println!("  Last pull:      {}", result.last_pull_at.as_deref().unwrap_or("never"));
    println!("  Last full sync: {}", result.last_sync_at.as_deref().unwrap_or("never"));
}
