//! Dump-log command implementation.

use super::read_log;
use habitsync_store::{LogReader, Mutation};
use serde::Serialize;
use std::path::Path;

/// One record as printed by `dump-log --format json`.
#[derive(Debug, Serialize)]
struct DumpedRecord<'a> {
    offset: u64,
    kind: &'static str,
    mutations: &'a [Mutation],
}

/// Runs the dump-log command.
pub fn run(path: &Path, limit: Option<usize>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let data = read_log(path)?;
    let limit = limit.unwrap_or(usize::MAX);
    let json = format == "json";

    if !json {
        println!("Log dump for {} ({} bytes)", path.display(), data.len());
        println!();
    }

    let mut reader = LogReader::new(&data);
    let mut printed = 0;
    for item in reader.by_ref().take(limit) {
        let (offset, record) = item?;
        if json {
            let dumped = DumpedRecord {
                offset,
                kind: record.kind.as_str(),
                mutations: &record.mutations,
            };
            println!("{}", serde_json::to_string(&dumped)?);
        } else {
            println!(
                "[{:>8}] {} ({} mutations)",
                offset,
                record.kind.as_str(),
                record.mutations.len()
            );
            for mutation in &record.mutations {
                println!("    {}", describe(mutation));
            }
        }
        printed += 1;
    }

    if !json {
        println!();
        println!("{} records shown", printed);
        if let Some(offset) = reader.torn_at() {
            println!("Incomplete record at offset {}", offset);
        }
    }
    Ok(())
}

fn describe(mutation: &Mutation) -> String {
    fn row<T>(name: &str, key: impl std::fmt::Display, row: &habitsync_store::Row<T>) -> String {
        let mut line = format!("put {} {} [{}]", name, key, row.sync_status);
        if row.deleted {
            line.push_str(" tombstone");
        }
        line
    }

    match mutation {
        Mutation::PutHabit(r) => row("habit", &r.data.id, r),
        Mutation::RemoveHabit(id) => format!("remove habit {}", id),
        Mutation::PutCompletion(r) => row("completion", r.data.key(), r),
        Mutation::RemoveCompletion(key) => format!("remove completion {}", key),
        Mutation::PutStepRecord(r) => row("step_record", r.data.key(), r),
        Mutation::RemoveStepRecord(key) => format!("remove step_record {}", key),
        Mutation::PutBadge(r) => row("badge", &r.data.id, r),
        Mutation::RemoveBadge(id) => format!("remove badge {}", id),
        Mutation::PutUserBadge(r) => row("user_badge", &r.data.id, r),
        Mutation::RemoveUserBadge(id) => format!("remove user_badge {}", id),
        Mutation::PutQueueItem(item) => format!(
            "put queue #{} {} {} retries={}",
            item.id, item.entity_type, item.operation, item.retry_count
        ),
        Mutation::RemoveQueueItem(id) => format!("remove queue #{}", id),
        Mutation::SetMeta { key, value } => format!("meta {} = {}", key, value),
        Mutation::RemoveMeta(key) => format!("remove meta {}", key),
        Mutation::SetQueueSeq(next) => format!("queue seq -> {}", next),
    }
}
