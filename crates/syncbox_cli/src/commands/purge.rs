//! Purge command implementation.

use std::path::Path;
use syncbox_store::{now_millis, Database, StoreResult, TableName};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Runs the purge command.
pub fn run(path: &Path, older_than_days: u64, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No database found at {:?}", path).into());
    }
    let db = Database::open(path)?;
    let days = i64::try_from(older_than_days)?;
    let cutoff = now_millis() - days.saturating_mul(DAY_MS);

    println!("Purging tombstones older than {} days at {:?}", older_than_days, path);
    if dry_run {
        println!("(dry run - no changes will be made)");
        let counts = expired_tombstones(&db, cutoff)?;
        let total: usize = counts.iter().map(|(_, n)| n).sum();
        for (table, count) in counts.iter().filter(|(_, n)| *n > 0) {
            println!("  {:<14} {}", table.as_str(), count);
        }
        println!("Would purge {} tombstones", total);
        return Ok(());
    }

    let purged = db.purge_tombstones(cutoff)?;
    println!("✓ Purged {} tombstones; deletions queued for upload", purged);
    Ok(())
}

fn expired_tombstones(db: &Database, cutoff_ms: i64) -> StoreResult<Vec<(TableName, usize)>> {
    TableName::ALL
        .into_iter()
        .map(|table| {
            let count = db
                .list_records(table)?
                .iter()
                .filter(|e| e.removed() && e.modified() < cutoff_ms)
                .count();
            Ok((table, count))
        })
        .collect()
}
