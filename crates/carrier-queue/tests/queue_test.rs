//! End-to-end queue behavior over the in-memory store.

use std::{sync::Arc, time::Duration};

use carrier_core::{time::fixed_epoch, Clock, ProcessingState, QueueName, SystemClock, TestClock};
use carrier_queue::{
    storage::mem::MemoryQueueStorage, NotificationQueue, PersistentQueueMode, QueueConfig,
    QueueStorage,
};
use test_harness::{
    fixtures::InvoiceCreated,
    handlers::CountingHandler,
    TestEnv,
};

#[tokio::test]
async fn entries_process_once_in_fifo_order() {
    let env = TestEnv::with_config(QueueConfig { max_entries_claimed: 3, ..QueueConfig::default() });
    let handler = Arc::new(CountingHandler::new());
    let queue = env.queue(handler.clone(), "host-a").unwrap();

    for invoice_id in 1..=10 {
        queue.post(&InvoiceCreated { invoice_id }).await.unwrap();
    }

    // Drain in claim-batch sized steps.
    let mut processed = 0;
    loop {
        let n = queue.process_ready_once().await.unwrap();
        if n == 0 {
            break;
        }
        processed += n;
    }
    assert_eq!(processed, 10);

    let order: Vec<u64> = handler
        .seen()
        .iter()
        .map(|n| n.event::<InvoiceCreated>().unwrap().invoice_id)
        .collect();
    assert_eq!(order, (1..=10).collect::<Vec<u64>>());

    assert!(env.storage.live_entries().await.is_empty());
    let history = env.storage.history_entries().await;
    assert_eq!(history.len(), 10);
    assert!(history.iter().all(|e| e.processing_state == ProcessingState::Processed));

    let stats = queue.stats();
    assert_eq!(stats.inserted, 10);
    assert_eq!(stats.claimed, 10);
    assert_eq!(stats.processed, 10);
    assert_eq!(stats.in_processing, 0);
}

#[tokio::test]
async fn single_claim_drain_delivers_in_order_with_keys() {
    // One entry per claim over a large backlog: the drain stays ordered
    // and every entry carries its own search keys through to the
    // handler and the archive.
    let env = TestEnv::with_config(QueueConfig { max_entries_claimed: 1, ..QueueConfig::default() });
    let handler = Arc::new(CountingHandler::new());
    let queue = env.queue(handler.clone(), "host-a").unwrap();

    let total = 100;
    for invoice_id in 1..=total {
        queue
            .record_future_notification(
                env.clock.now_utc(),
                &InvoiceCreated { invoice_id },
                None,
                invoice_id as i64,
                0,
            )
            .await
            .unwrap();
    }

    for _ in 0..total {
        assert_eq!(queue.process_ready_once().await.unwrap(), 1);
    }
    assert_eq!(queue.process_ready_once().await.unwrap(), 0);

    let seen = handler.seen();
    assert_eq!(seen.len(), total as usize);
    for (i, notification) in seen.iter().enumerate() {
        assert_eq!(notification.search_key1, i as i64 + 1);
        if i > 0 {
            assert!(notification.record_id > seen[i - 1].record_id);
        }
    }

    assert!(env.storage.live_entries().await.is_empty());
    let history = env.storage.history_entries().await;
    assert_eq!(history.len(), total as usize);
    assert!(history.iter().all(|e| e.processing_state == ProcessingState::Processed));
}

#[tokio::test]
async fn queues_sharing_a_store_keep_their_entries_apart() {
    // Two logical queues over one physical store: neither may claim,
    // count, or list the other's entries.
    let storage = Arc::new(MemoryQueueStorage::new());
    let clock = TestClock::starting_at(fixed_epoch());

    let billing_handler = Arc::new(CountingHandler::new());
    let billing = NotificationQueue::new(
        QueueName::new("billing", "invoices"),
        storage.clone(),
        QueueConfig::default(),
        Arc::new(clock.clone()),
        billing_handler.clone(),
        "host-a".to_string(),
    )
    .unwrap();

    let payment_handler = Arc::new(CountingHandler::new());
    let payment = NotificationQueue::new(
        QueueName::new("payment", "settlements"),
        storage.clone(),
        QueueConfig::default(),
        Arc::new(clock.clone()),
        payment_handler.clone(),
        "host-a".to_string(),
    )
    .unwrap();

    let id = payment.post(&InvoiceCreated { invoice_id: 1 }).await.unwrap();

    // The billing queue sees nothing of the payment entry.
    assert_eq!(billing.process_ready_once().await.unwrap(), 0);
    assert_eq!(billing_handler.count(), 0);
    assert!(billing.available_entries().await.unwrap().is_empty());
    assert!(storage.verify_live_state(id, ProcessingState::Available).await);

    // Its own queue delivers it to its own handler.
    assert_eq!(payment.process_ready_once().await.unwrap(), 1);
    assert_eq!(payment_handler.count(), 1);
    let archived = storage.find_history(id).await.unwrap().expect("archived");
    assert_eq!(archived.queue_name, QueueName::new("payment", "settlements"));

    // Archives stay partitioned too.
    assert!(billing.history_entries_since(fixed_epoch()).await.unwrap().is_empty());
    assert_eq!(payment.history_entries_since(fixed_epoch()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn poll_loop_drains_posted_events() {
    // Full lifecycle on the system clock with a fast poll.
    let storage = Arc::new(MemoryQueueStorage::new());
    let handler = Arc::new(CountingHandler::new());
    let queue = NotificationQueue::new(
        QueueName::new("billing", "invoice-events"),
        storage.clone(),
        QueueConfig { poll_sleep: Duration::from_millis(10), ..QueueConfig::default() },
        Arc::new(SystemClock::new()),
        handler.clone(),
        "host-a".to_string(),
    )
    .unwrap();

    queue.start();
    for invoice_id in 1..=20 {
        queue.post(&InvoiceCreated { invoice_id }).await.unwrap();
    }

    for _ in 0..500 {
        if handler.count() == 20 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    queue.stop().await.unwrap();

    assert_eq!(handler.count(), 20);
    assert!(storage.live_entries().await.is_empty());
    assert_eq!(storage.history_entries().await.len(), 20);
}

#[tokio::test]
async fn sticky_events_mode_wakes_the_poll_loop() {
    let storage = Arc::new(MemoryQueueStorage::new());
    let handler = Arc::new(CountingHandler::new());
    let queue = NotificationQueue::new(
        QueueName::new("billing", "invoice-events"),
        storage.clone(),
        QueueConfig {
            mode: PersistentQueueMode::StickyEvents,
            // Long sleep: delivery within the test window proves the
            // wakeup, not the timer.
            poll_sleep: Duration::from_secs(60),
            ..QueueConfig::default()
        },
        Arc::new(SystemClock::new()),
        handler.clone(),
        "host-a".to_string(),
    )
    .unwrap();

    queue.start();
    // Let the loop reach its idle wait before posting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.post(&InvoiceCreated { invoice_id: 1 }).await.unwrap();

    for _ in 0..200 {
        if handler.count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    queue.stop().await.unwrap();

    assert_eq!(handler.count(), 1);
}

#[tokio::test]
async fn discovery_mode_does_not_change_outcomes() {
    // The same workload must end in the same terminal states whether
    // entries are discovered by polling or through the sticky buffer.
    let mut outcomes = Vec::new();

    for mode in [
        PersistentQueueMode::Polling,
        PersistentQueueMode::StickyPolling,
        PersistentQueueMode::StickyEvents,
    ] {
        let env = TestEnv::with_config(QueueConfig {
            mode,
            max_entries_claimed: 4,
            ..QueueConfig::default()
        });
        let handler = Arc::new(CountingHandler::new());
        let queue = env.queue(handler.clone(), "host-a").unwrap();

        for invoice_id in 1..=9 {
            queue.post(&InvoiceCreated { invoice_id }).await.unwrap();
        }
        while queue.process_ready_once().await.unwrap() > 0 {}

        let mut history: Vec<(i64, ProcessingState)> = env
            .storage
            .history_entries()
            .await
            .iter()
            .map(|e| (e.record_id.0, e.processing_state))
            .collect();
        history.sort_unstable_by_key(|(id, _)| *id);
        outcomes.push((handler.count(), history));
    }

    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[1], outcomes[2]);
}
