//! Well-known keys of the metadata table.

/// Current schema version (decimal).
pub const SCHEMA_VERSION: &str = "schema_version";

/// RFC 3339 instant the store was first initialized.
pub const CREATED_AT: &str = "created_at";

/// Set once the first-run remote import has committed.
pub const INITIAL_IMPORT_COMPLETE: &str = "initial_import_complete";

/// RFC 3339 instant of the last push phase that finished without error.
pub const LAST_PUSH_AT: &str = "last_push_at";

/// RFC 3339 instant of the last pull phase that finished without error.
pub const LAST_PULL_AT: &str = "last_pull_at";

/// RFC 3339 instant of the last fully successful sync pass.
pub const LAST_SYNC_AT: &str = "last_sync_at";

/// Prefix for per-migration bookkeeping (`migration.<version>`).
pub const MIGRATION_PREFIX: &str = "migration.";
