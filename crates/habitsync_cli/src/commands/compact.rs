//! Compact command implementation.

use super::{format_size, open_existing};
use habitsync_store::LogRecord;
use std::path::Path;

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compacting store at {}", path.display());
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let store = open_existing(path)?;
    let before = store.log_size()?;
    let snapshot = LogRecord::snapshot(store.state().snapshot()).encode()?;
    let after = snapshot.len() as u64;

    println!("Compaction Analysis:");
    println!("  Size before: {}", format_size(before));
    println!("  Size after:  {}", format_size(after));
    println!(
        "  Space saved: {} ({:.1}%)",
        format_size(before.saturating_sub(after)),
        if before > 0 {
            (before.saturating_sub(after) as f64 / before as f64) * 100.0
        } else {
            0.0
        }
    );

    if dry_run {
        return Ok(());
    }

    println!();
    if after < before {
        let stats = store.compact()?;
        println!("✓ Compaction complete ({} -> {})", format_size(stats.before), format_size(stats.after));
    } else {
        println!("No compaction needed - log is already a single snapshot");
    }
    Ok(())
}
