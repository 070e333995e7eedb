//! Migration commands.

use super::open_existing;
use habitsync_store::{meta, LocalStore, MigrationManager, StoreConfig};
use std::path::Path;
use tracing::info;

/// Shows applied and pending migrations.
pub fn status(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_existing(path)?;
    let manager = MigrationManager::with_builtin();
    let pending = manager.pending(&store);

    println!("Migration Status");
    println!("================");
    println!("  Current version: {}", store.schema_version());
    println!("  Pending: {}", pending.len());
    println!();

    for (version, name) in manager.list() {
        let applied = store.get_meta(&format!("{}{version}", meta::MIGRATION_PREFIX));
        match applied {
            Some(record) => println!("  v{}: {} [✓ applied: {}]", version, name, record),
            None if pending.contains(&version) => println!("  v{}: {} [○ pending]", version, name),
            None => println!("  v{}: {} [- skipped]", version, name),
        }
    }
    Ok(())
}

/// Applies pending migrations.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = StoreConfig::default()
        .create_if_missing(false)
        .run_migrations(false);
    let store = LocalStore::open_with_config(path, config)?;
    let applied = MigrationManager::with_builtin().run_pending(&store)?;
    info!(count = applied.len(), "migrations applied");

    if applied.is_empty() {
        println!("Schema is up to date (v{})", store.schema_version());
    } else {
        for version in &applied {
            println!("  ✓ applied v{}", version);
        }
        println!("Schema is now v{}", store.schema_version());
    }
    Ok(())
}
