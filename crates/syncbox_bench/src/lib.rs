//! Benchmark fixtures shared by the syncbox benches.

#![deny(unsafe_code)]

use rand::Rng;
use syncbox_store::{Conversation, Database, Message};

/// Generates random, incompressible bytes.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generates chat-like text that compresses well.
pub fn chat_text(size: usize) -> String {
    const LINE: &str = "The quick brown fox asked the assistant about the weather. ";
    LINE.chars().cycle().take(size).collect()
}

/// A message whose content is `size` bytes of chat text.
pub fn message(i: usize, size: usize) -> Message {
    Message {
        object_id: format!("message-{i}"),
        creation: 1_700_000_000_000,
        modified: 1_700_000_000_000 + i as i64,
        conversation_id: format!("conversation-{}", i / 10),
        role: "assistant".into(),
        content: chat_text(size),
        ..Default::default()
    }
}

/// An in-memory database holding `count` conversations, each with one
/// pending outbox entry.
pub fn seeded_database(count: usize) -> Database {
    let db = Database::open_in_memory().expect("open in-memory database");
    for i in 0..count {
        db.save_local(Conversation {
            object_id: format!("conversation-{i}"),
            creation: 1_700_000_000_000,
            modified: 1_700_000_000_000,
            title: format!("Conversation {i}"),
            ..Default::default()
        })
        .expect("seed conversation");
    }
    db
}
