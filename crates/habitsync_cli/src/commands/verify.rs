//! Verify command implementation.

use super::read_log;
use habitsync_store::{LogReader, RecordKind};
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Complete records that passed every check.
    pub valid_records: usize,
    /// Mutations carried by the valid records.
    pub mutations: usize,
    /// Snapshot records among the valid ones.
    pub snapshots: usize,
    /// Offset of an incomplete tail record, dropped on the next open.
    pub torn_at: Option<u64>,
    /// First hard error, if any.
    pub error: Option<String>,
    /// Bytes covered by valid records.
    pub valid_len: u64,
    /// Total log size.
    pub log_size: u64,
}

impl VerifyResult {
    /// A torn tail is recoverable; any other error is not.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Checks every record of a log image.
pub fn verify_log(data: &[u8]) -> VerifyResult {
    let mut result = VerifyResult {
        log_size: data.len() as u64,
        ..VerifyResult::default()
    };

    let mut reader = LogReader::new(data);
    for item in reader.by_ref() {
        match item {
            Ok((_, record)) => {
                result.valid_records += 1;
                result.mutations += record.mutations.len();
                if record.kind == RecordKind::Snapshot {
                    result.snapshots += 1;
                }
            }
            Err(e) => {
                result.error = Some(e.to_string());
                break;
            }
        }
    }
    result.torn_at = reader.torn_at();
    result.valid_len = reader.valid_len();
    result
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {}", path.display());
    println!();

    let data = read_log(path)?;
    let result = verify_log(&data);

    println!(
        "  Records: {} valid ({} snapshots), {} mutations",
        result.valid_records, result.snapshots, result.mutations
    );
    println!("  Valid bytes: {} of {}", result.valid_len, result.log_size);
    if let Some(offset) = result.torn_at {
        println!(
            "  WARNING: incomplete record at offset {} ({} bytes) will be dropped on next open",
            offset,
            result.log_size - offset
        );
    }
    if let Some(error) = &result.error {
        println!("  ERROR: {}", error);
    }

    println!();
    if result.is_ok() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}
