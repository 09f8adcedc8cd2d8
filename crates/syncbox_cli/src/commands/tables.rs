//! Tables command implementation.

use serde::Serialize;
use std::path::Path;
use syncbox_store::{Database, TableName};

/// Sync scope of one table.
#[derive(Debug, Serialize)]
pub struct TableScope {
    /// Table.
    pub table: TableName,
    /// Included in sync.
    pub enabled: bool,
}

/// Runs the tables command.
pub fn run(
    path: &Path,
    enable: &[String],
    disable: &[String],
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No database found at {:?}", path).into());
    }
    let db = Database::open(path)?;
    let scopes = apply(&db, enable, disable)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&scopes)?),
        _ => {
            for scope in &scopes {
                let mark = if scope.enabled { "✓" } else { "✗" };
                println!("  {} {}", mark, scope.table.as_str());
            }
        }
    }
    Ok(())
}

fn apply(
    db: &Database,
    enable: &[String],
    disable: &[String],
) -> Result<Vec<TableScope>, Box<dyn std::error::Error>> {
    for name in enable {
        db.set_table_enabled(name.parse()?, true)?;
    }
    for name in disable {
        db.set_table_enabled(name.parse()?, false)?;
    }

    let enabled = db.enabled_tables()?;
    Ok(TableName::ALL
        .into_iter()
        .map(|table| TableScope {
            table,
            enabled: enabled.contains(&table),
        })
        .collect())
}
