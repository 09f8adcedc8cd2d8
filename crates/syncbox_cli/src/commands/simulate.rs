//! Simulate command implementation.
//!
//! Runs two devices against an in-memory server: device A seeds records and
//! sends them, device B fetches them.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use syncbox_engine::{MemoryServer, SyncConfig, SyncEngine, SyncHandle, SyncStats};
use syncbox_store::{now_millis, Conversation, Database, Message, OutboxStats, TableName};

const ZONE: &str = "simulation";

/// Simulation report.
#[derive(Debug, Serialize)]
pub struct SimulateResult {
    /// Conversations seeded on device A.
    pub records: usize,
    /// Outbox batch size.
    pub batch_size: usize,
    /// Wall time of the whole exchange (ms).
    pub elapsed_ms: u128,
    /// Batches the server received.
    pub batches: usize,
    /// Records on the server afterwards.
    pub server_records: usize,
    /// Rows on device B afterwards.
    pub received_rows: u64,
    /// Engine counters for device A.
    pub sender: SyncStats,
    /// Engine counters for device B.
    pub receiver: SyncStats,
    /// Outbox of device A afterwards.
    pub sender_outbox: OutboxStats,
}

/// Runs the simulate command.
pub fn run(records: usize, batch_size: usize, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if batch_size == 0 {
        return Err("Batch size must be positive".into());
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(simulate(records, batch_size))?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

async fn simulate(
    records: usize,
    batch_size: usize,
) -> Result<SimulateResult, Box<dyn std::error::Error>> {
    let server = MemoryServer::new();
    let (sender_db, sender) = device(&server, batch_size)?;
    let (receiver_db, receiver) = device(&server, batch_size)?;

    let started = Instant::now();
    let now = now_millis();
    for i in 0..records {
        let conversation_id = format!("conversation-{i}");
        sender
            .save(Conversation {
                object_id: conversation_id.clone(),
                creation: now,
                modified: now,
                title: format!("Conversation {i}"),
                ..Default::default()
            })
            .await?;
        sender
            .save(Message {
                object_id: format!("message-{i}"),
                creation: now,
                modified: now,
                conversation_id,
                role: "user".into(),
                content: format!("hello from device A ({i})"),
                ..Default::default()
            })
            .await?;
    }
    sender.send_changes().await?;
    receiver.fetch_changes().await?;
    let elapsed_ms = started.elapsed().as_millis();

    let received_rows = TableName::ALL
        .into_iter()
        .map(|t| receiver_db.record_count(t))
        .sum::<Result<u64, _>>()?;
    let result = SimulateResult {
        records,
        batch_size,
        elapsed_ms,
        batches: server.sent_batches().len(),
        server_records: server.record_count(ZONE),
        received_rows,
        sender: sender.stats().await?,
        receiver: receiver.stats().await?,
        sender_outbox: sender_db.outbox_stats()?,
    };

    sender.shutdown().await;
    receiver.shutdown().await;
    Ok(result)
}

fn device(
    server: &MemoryServer,
    batch_size: usize,
) -> Result<(Arc<Database>, SyncHandle), Box<dyn std::error::Error>> {
    let db = Arc::new(Database::open_in_memory()?);
    let config = SyncConfig::new(uuid::Uuid::new_v4().to_string(), ZONE)
        .with_batch_size(batch_size)
        .with_debounce(Duration::from_secs(3600));
    let handle = SyncEngine::spawn(config, Arc::clone(&db), Arc::new(server.backend()))?;
    Ok((db, handle))
}

fn print_text_output(result: &SimulateResult) {
    println!("syncbox Simulation");
    println!("==================");
    println!();
    println!("Seeded:          {} conversations", result.records);
    println!("Batch size:      {}", result.batch_size);
    println!("Elapsed:         {} ms", result.elapsed_ms);
    println!("Batches sent:    {}", result.batches);
    println!("Server records:  {}", result.server_records);
    println!("Rows received:   {}", result.received_rows);
    println!();
    println!("Device A:");
    println!("  Records saved:  {}", result.sender.records_saved);
    println!("  Sends:          {}", result.sender.sends_completed);
    println!("  Failures:       {}", result.sender.failures);
    println!("  Outbox left:    {}", result.sender_outbox.total);
    println!();
    println!("Device B:");
    println!("  Fetches:        {}", result.receiver.fetches_completed);
    println!("  Applied:        {}", result.receiver.remote_applied);
    println!("  Conflicts:      {}", result.receiver.conflicts);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_device_receives_everything() {
        let result = simulate(12, 5).await.unwrap();
        assert_eq!(result.server_records, 24);
        assert_eq!(result.received_rows, 24);
        assert_eq!(result.batches, 5);
        assert_eq!(result.sender_outbox.pending, 0);
        assert_eq!(result.sender.failures, 0);
    }
}
