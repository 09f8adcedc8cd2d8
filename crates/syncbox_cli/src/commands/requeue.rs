//! Requeue command implementation.

use std::path::Path;
use syncbox_store::Database;

/// What to do with the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Drop every entry and queue every stored row again. Also the way to
    /// recover entries parked at the failure cap.
    Rebuild,
    /// Put entries left in flight back to pending.
    InFlight,
    /// Drop entries superseded by a newer one for the same record.
    Prune,
}

/// Runs the requeue command.
pub fn run(path: &Path, mode: Mode, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No database found at {:?}", path).into());
    }
    let db = Database::open(path)?;
    let before = db.outbox_stats()?;

    println!("Outbox at {:?}", path);
    println!(
        "  {} entries ({} pending, {} uploading, {} poisoned, {} superseded)",
        before.total, before.pending, before.uploading, before.poisoned, before.superseded
    );
    if dry_run {
        println!("(dry run - no changes will be made)");
        let affected = match mode {
            Mode::Rebuild => {
                let rows: u64 = syncbox_store::TableName::ALL
                    .into_iter()
                    .map(|t| db.record_count(t))
                    .sum::<Result<u64, _>>()?;
                println!("Would replace {} entries with {} inserts", before.total, rows);
                return Ok(());
            }
            Mode::InFlight => before.uploading,
            Mode::Prune => before.superseded,
        };
        println!("Would update {} entries", affected);
        return Ok(());
    }

    let changed = apply(&db, mode)?;
    let after = db.outbox_stats()?;
    println!("✓ {} entries affected, {} remain", changed, after.total);
    Ok(())
}

fn apply(db: &Database, mode: Mode) -> Result<usize, Box<dyn std::error::Error>> {
    let changed = match mode {
        Mode::Rebuild => db.reinitialize_outbox()?,
        Mode::InFlight => db.reset_uploading()?,
        Mode::Prune => db.prune_superseded()?,
    };
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncbox_store::{Conversation, TableName, UploadState};

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        for title in ["a", "b"] {
            db.save_local(Conversation {
                object_id: "c-1".into(),
                title: title.into(),
                ..Default::default()
            })
            .unwrap();
        }
        db
    }

    #[test]
    fn rebuild_leaves_one_insert_per_row() {
        let db = seeded();
        assert_eq!(apply(&db, Mode::Rebuild).unwrap(), 1);
        let entries = db.outbox_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].table, TableName::Conversation);
    }

    #[test]
    fn prune_drops_superseded_entries() {
        let db = seeded();
        assert_eq!(apply(&db, Mode::Prune).unwrap(), 1);
        assert_eq!(db.outbox_stats().unwrap().total, 1);
    }

    #[test]
    fn in_flight_entries_return_to_pending() {
        let db = seeded();
        let ids: Vec<i64> = db.outbox_entries().unwrap().iter().map(|e| e.id).collect();
        db.change_state(&ids, UploadState::Uploading).unwrap();
        assert_eq!(apply(&db, Mode::InFlight).unwrap(), 2);
        assert_eq!(db.outbox_stats().unwrap().pending, 2);
    }
}
