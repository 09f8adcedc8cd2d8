//! Decode command implementation.

use std::path::Path;
use syncbox_codec::{inspect_header, open, EnvelopeHeader};
use syncbox_store::{SyncEntity, TableName};

/// Runs the decode command.
pub fn run(file: &Path, table: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = std::fs::read(file)?;
    let header = inspect_header(&bytes)?;
    let body = open(&bytes)?;

    println!("Envelope: {:?}", file);
    print_header(&header, bytes.len(), body.len());

    if let Some(name) = table {
        let table: TableName = name.parse()?;
        let entity = SyncEntity::decode(table, &bytes)?;
        println!();
        println!("{}", serde_json::to_string_pretty(&entity)?);
    }
    Ok(())
}

fn print_header(header: &EnvelopeHeader, stored: usize, body: usize) {
    println!("  Version:    {}", header.version);
    println!("  Algorithm:  {:?}", header.algorithm);
    println!("  Stored:     {} bytes", stored);
    println!("  Body:       {} bytes", body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncbox_codec::EnvelopeOptions;
    use syncbox_store::Conversation;

    #[test]
    fn decodes_a_stored_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("conversation.bin");
        let entity = SyncEntity::from(Conversation {
            object_id: "c-1".into(),
            title: "x".repeat(4096),
            ..Default::default()
        });
        std::fs::write(&file, entity.encode(&EnvelopeOptions::new()).unwrap()).unwrap();

        run(&file, Some("Conversation")).unwrap();
        assert!(run(&file, Some("Bogus")).is_err());
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("junk.bin");
        std::fs::write(&file, b"not an envelope").unwrap();
        assert!(run(&file, None).is_err());
    }
}
