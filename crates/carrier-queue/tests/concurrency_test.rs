//! Claim exclusivity under concurrent writers and readers.

use std::{collections::HashSet, sync::Arc, time::Duration};

use carrier_core::{Clock, ProcessingState, QueueEntry, RecordId, TestClock};
use carrier_queue::{accessor::QueueAccessor, QueueConfig, QueueStorage};
use test_harness::{fixtures::EntryBuilder, TestEnv};

const WRITERS: usize = 2;
const ENTRIES_PER_WRITER: usize = 250;
const READERS: usize = 3;

async fn drain(accessor: Arc<QueueAccessor>) -> Vec<RecordId> {
    let mut claimed = Vec::new();
    let mut misses = 0;
    while misses < 20 {
        let entries: Vec<QueueEntry> = match accessor.get_ready_entries().await {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        if entries.is_empty() {
            // Writers may still be inserting; back off briefly before
            // concluding the queue is empty.
            misses += 1;
            tokio::time::sleep(Duration::from_millis(1)).await;
            continue;
        }
        misses = 0;
        for entry in entries {
            accessor
                .move_entry_to_history(entry.record_id, ProcessingState::Processed)
                .await
                .unwrap();
            claimed.push(entry.record_id);
        }
    }
    claimed
}

#[tokio::test]
async fn concurrent_readers_never_process_an_entry_twice() {
    let env = TestEnv::with_config(QueueConfig {
        max_entries_claimed: 7,
        ..QueueConfig::default()
    });
    let now = env.clock.now_utc();

    let mut writers = Vec::new();
    for w in 0..WRITERS {
        let storage = env.storage.clone();
        writers.push(tokio::spawn(async move {
            for i in 0..ENTRIES_PER_WRITER {
                let entry = EntryBuilder::new(now)
                    .owner(&format!("writer-{w}"))
                    .event("InvoiceCreated", &format!(r#"{{"invoice_id":{i}}}"#))
                    .build();
                storage.insert(entry).await.unwrap();
            }
        }));
    }

    let mut readers = Vec::new();
    for r in 0..READERS {
        let accessor = Arc::new(QueueAccessor::new(
            env.storage.clone(),
            env.queue_name(),
            env.config.clone(),
            Arc::new(env.clock.clone()),
            format!("reader-{r}"),
        ));
        readers.push(tokio::spawn(drain(accessor)));
    }

    for writer in writers {
        writer.await.unwrap();
    }

    let mut all_claimed: Vec<RecordId> = Vec::new();
    for reader in readers {
        all_claimed.extend(reader.await.unwrap());
    }

    let total = WRITERS * ENTRIES_PER_WRITER;
    assert_eq!(all_claimed.len(), total, "every entry processed exactly once");

    let unique: HashSet<RecordId> = all_claimed.iter().copied().collect();
    assert_eq!(unique.len(), total, "no entry claimed by two readers");

    assert!(env.storage.live_entries().await.is_empty());
    assert_eq!(env.storage.history_entries().await.len(), total);
}

#[tokio::test]
async fn losing_a_claim_race_is_silent() {
    let env = TestEnv::new();
    let now = env.clock.now_utc();
    let clock = TestClock::starting_at(now);

    env.storage.insert(EntryBuilder::new(now).build()).await.unwrap();

    let first = env
        .storage
        .claim_ready(env.queue_name(), "host-a".into(), clock.now_utc(), 10)
        .await
        .unwrap();
    let second = env
        .storage
        .claim_ready(env.queue_name(), "host-b".into(), clock.now_utc(), 10)
        .await
        .unwrap();

    assert_eq!(first.len(), 1);
    assert!(second.is_empty(), "losing claimant gets an empty batch, not an error");
}
