//! Inspect command implementation.

use serde::Serialize;
use std::path::Path;
use syncbox_store::{
    Database, OutboxStats, SyncMetadataEntry, TableName, UploadQueueEntry, UploadState,
};

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// Global sync switch.
    pub sync_enabled: bool,
    /// Last sync without failures (ms).
    pub last_sync_at: Option<i64>,
    /// Whether a change feed token is stored.
    pub has_session_token: bool,
    /// Tables excluded from sync.
    pub disabled_tables: Vec<TableName>,
    /// Row counts per table.
    pub tables: Vec<TableStats>,
    /// Outbox counters.
    pub outbox: OutboxStats,
    /// Number of metadata rows.
    pub metadata_count: usize,
    /// Outbox entries (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<UploadQueueEntry>>,
    /// Metadata rows (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Vec<SyncMetadataEntry>>,
}

/// Row count for one table.
#[derive(Debug, Serialize)]
pub struct TableStats {
    /// Table.
    pub table: TableName,
    /// Stored rows, tombstones included.
    pub rows: u64,
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    show_entries: bool,
    show_metadata: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No database found at {:?}", path).into());
    }
    let db = Database::open(path)?;
    let result = collect(&db, path, show_entries, show_metadata)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn collect(
    db: &Database,
    path: &Path,
    show_entries: bool,
    show_metadata: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let prefs = db.load_preferences()?;
    let tables = TableName::ALL
        .into_iter()
        .map(|table| {
            Ok(TableStats {
                table,
                rows: db.record_count(table)?,
            })
        })
        .collect::<Result<Vec<_>, syncbox_store::StoreError>>()?;
    let metadata = db.metadata_list()?;

    Ok(InspectResult {
        path: path.display().to_string(),
        sync_enabled: prefs.sync_enabled,
        last_sync_at: prefs.last_sync_at,
        has_session_token: prefs.session_token.is_some(),
        disabled_tables: prefs.disabled_tables.into_iter().collect(),
        tables,
        outbox: db.outbox_stats()?,
        metadata_count: metadata.len(),
        entries: if show_entries {
            Some(db.outbox_entries()?)
        } else {
            None
        },
        metadata: show_metadata.then_some(metadata),
    })
}

fn print_text_output(result: &InspectResult) {
    println!("syncbox Database Inspection");
    println!("===========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Sync:");
    println!("  Enabled:        {}", result.sync_enabled);
    println!(
        "  Last sync:      {}",
        result
            .last_sync_at
            .map_or_else(|| "never".to_string(), |ms| ms.to_string())
    );
    println!("  Session token:  {}", result.has_session_token);
    if !result.disabled_tables.is_empty() {
        let names: Vec<&str> = result.disabled_tables.iter().map(|t| t.as_str()).collect();
        println!("  Disabled:       {}", names.join(", "));
    }
    println!();
    println!("Tables:");
    for stats in &result.tables {
        println!("  {:<14} {} rows", stats.table.as_str(), stats.rows);
    }
    println!();
    println!("Outbox:");
    println!("  Pending:    {}", result.outbox.pending);
    println!("  Uploading:  {}", result.outbox.uploading);
    println!("  Poisoned:   {}", result.outbox.poisoned);
    println!("  Superseded: {}", result.outbox.superseded);
    println!("  Total:      {}", result.outbox.total);
    println!();
    println!("Metadata rows: {}", result.metadata_count);

    if let Some(entries) = &result.entries {
        println!();
        println!("Entries:");
        for entry in entries {
            println!(
                "  #{:<6} {:<8} {:<9} fails={:<3} {}",
                entry.id,
                format!("{:?}", entry.change_kind),
                state_label(entry),
                entry.fail_count,
                entry.key()
            );
        }
    }

    if let Some(metadata) = &result.metadata {
        println!();
        println!("Metadata:");
        for meta in metadata {
            println!(
                "  {} tag={} modified={}",
                meta.record_name,
                meta.change_tag.as_deref().unwrap_or("-"),
                meta.last_modified_ms
            );
        }
    }
}

fn state_label(entry: &UploadQueueEntry) -> &'static str {
    if entry.is_poisoned() {
        return "poisoned";
    }
    match entry.state {
        UploadState::Pending => "pending",
        UploadState::Uploading => "uploading",
        UploadState::Failed => "failed",
        UploadState::Finish => "finished",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncbox_store::Conversation;

    #[test]
    fn collects_outbox_and_tables() {
        let db = Database::open_in_memory().unwrap();
        db.save_local(Conversation {
            object_id: "c-1".into(),
            ..Default::default()
        })
        .unwrap();
        db.set_table_enabled(TableName::Memory, false).unwrap();

        let result = collect(&db, Path::new("mem"), true, false).unwrap();
        assert_eq!(result.outbox.pending, 1);
        assert_eq!(result.entries.as_ref().map(Vec::len), Some(1));
        assert!(result.metadata.is_none());
        assert_eq!(result.disabled_tables, vec![TableName::Memory]);
        let conversations = result
            .tables
            .iter()
            .find(|t| t.table == TableName::Conversation)
            .unwrap();
        assert_eq!(conversations.rows, 1);

        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("metadata").is_none());
    }
}
