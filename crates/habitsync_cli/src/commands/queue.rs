//! Queue commands.

use super::open_existing;
use chrono::{DateTime, Utc};
use habitsync_store::{LocalStore, QueueItem, StoreConfig};
use std::path::Path;
use tracing::info;

/// Lists queue items, oldest first.
pub fn list(path: &Path, failed_only: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(path)?;
    let queue = store.queue();
    let mut items = if failed_only {
        queue.get_failed_items()
    } else {
        queue.items()
    };
    items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    println!(
        "Sync Queue ({})",
        if failed_only { "dead letters" } else { "all items" }
    );
    println!("==========");
    if items.is_empty() {
        println!("  Queue is empty.");
        return Ok(());
    }

    let now = Utc::now();
    for item in &items {
        println!(
            "  #{:<5} {} {} {} [{}]",
            item.id,
            item.operation,
            item.entity_type,
            item.entity_id.as_deref().unwrap_or("-"),
            status(item, now)
        );
        if let Some(error) = &item.error_message {
            println!("         last error: {}", error);
        }
    }
    Ok(())
}

/// Resets every dead-lettered item so the next sync replays it.
pub fn retry_failed(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = StoreConfig::default().create_if_missing(false);
    let store = LocalStore::open_with_config(path, config)?;
    let revived = store.queue().retry_failed()?;
    info!(revived, "dead letters reset");
    println!("{} item(s) put back into the queue", revived);
    Ok(())
}

fn status(item: &QueueItem, now: DateTime<Utc>) -> String {
    if item.is_dead_lettered() {
        format!("dead after {} attempts", item.retry_count)
    } else if item.is_due(now) {
        format!("due, {}/{} retries", item.retry_count, item.max_retries)
    } else {
        let wait = (item.next_retry_at - now).num_seconds();
        format!("retry in {}s, {}/{} retries", wait, item.retry_count, item.max_retries)
    }
}
