//! Retry chains driven through the durable queue.

use std::{sync::Arc, time::Duration};

use carrier_core::{Clock, ProcessingState};
use carrier_queue::{QueueStorage, RetrySchedule};
use test_harness::{
    fixtures::InvoiceCreated,
    handlers::{FailingHandler, FlakyHandler, RetryingHandler},
    TestEnv,
};
use uuid::Uuid;

#[tokio::test]
async fn schedule_with_n_intervals_yields_exactly_n_retry_entries() {
    let env = TestEnv::new();
    let schedule = RetrySchedule::new(vec![
        Duration::from_secs(1),
        Duration::from_secs(1),
        Duration::from_secs(1),
        Duration::from_secs(24 * 60 * 60),
    ]);
    let handler = Arc::new(RetryingHandler::new(schedule));
    let queue = env.queue(handler.clone(), "host-a").unwrap();

    let user_token = Uuid::new_v4();
    let original = queue
        .record_future_notification(
            env.clock.now_utc(),
            &InvoiceCreated { invoice_id: 1 },
            Some(user_token),
            1,
            2,
        )
        .await
        .unwrap();

    // Attempts 1 through 4 run a second apart.
    for _ in 0..4 {
        assert_eq!(queue.process_ready_once().await.unwrap(), 1);
        env.advance_time(Duration::from_secs(1));
    }
    assert_eq!(handler.calls(), 4);

    // The fifth attempt waits a day out.
    assert_eq!(queue.process_ready_once().await.unwrap(), 0);
    let live = env.storage.live_entries().await;
    assert_eq!(live.len(), 1);
    let pending = &live[0];
    assert_eq!(pending.error_count, 4);
    assert_eq!(pending.user_token, Some(user_token));
    assert!(pending.future_user_token.is_some());
    assert_eq!(pending.search_key1, 1);
    assert_eq!(pending.search_key2, 2);
    assert!(pending.effective_date > env.clock.now_utc() + chrono::Duration::hours(23));

    // Each completed attempt was archived Processed: it finished with a
    // decision, the chain continues in a fresh entry.
    let history = env.storage.history_entries().await;
    assert_eq!(history.len(), 4);
    assert!(history.iter().all(|e| e.processing_state == ProcessingState::Processed));
    assert!(history.iter().any(|e| e.record_id == original));

    // A day later the schedule is exhausted and the chain fails
    // terminally.
    env.advance_time(Duration::from_secs(24 * 60 * 60));
    assert_eq!(queue.process_ready_once().await.unwrap(), 1);
    assert_eq!(handler.calls(), 5);

    assert!(env.storage.live_entries().await.is_empty());
    let history = env.storage.history_entries().await;
    assert_eq!(history.len(), 5);
    let failed: Vec<_> = history
        .iter()
        .filter(|e| e.processing_state == ProcessingState::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error_count, 4);
    assert_eq!(failed[0].user_token, Some(user_token));
}

#[tokio::test]
async fn terminal_failure_archives_without_retry() {
    let env = TestEnv::new();
    let handler = Arc::new(FailingHandler::new("validation rejected"));
    let queue = env.queue(handler.clone(), "host-a").unwrap();

    let id = queue.post(&InvoiceCreated { invoice_id: 1 }).await.unwrap();
    assert_eq!(queue.process_ready_once().await.unwrap(), 1);

    assert_eq!(handler.calls(), 1);
    assert!(env.storage.live_entries().await.is_empty());
    let archived = env.storage.find_history(id).await.unwrap().expect("archived");
    assert_eq!(archived.processing_state, ProcessingState::Failed);
    assert_eq!(queue.stats().failed, 1);
}

#[tokio::test]
async fn transient_failures_recover_mid_schedule() {
    let env = TestEnv::new();
    let schedule = RetrySchedule::new(vec![Duration::from_secs(60); 5]);
    let handler = Arc::new(FlakyHandler::new(2, schedule));
    let queue = env.queue(handler.clone(), "host-a").unwrap();

    queue.post(&InvoiceCreated { invoice_id: 1 }).await.unwrap();

    for _ in 0..3 {
        queue.process_ready_once().await.unwrap();
        env.advance_time(Duration::from_secs(60));
    }
    assert_eq!(handler.calls(), 3);

    // Two failed attempts, then success; nothing left pending.
    assert!(env.storage.live_entries().await.is_empty());
    let history = env.storage.history_entries().await;
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|e| e.processing_state == ProcessingState::Processed));
    assert_eq!(history.iter().map(|e| e.error_count).max(), Some(2));
}

#[tokio::test]
async fn retry_entries_are_invisible_until_their_delay_elapses() {
    let env = TestEnv::new();
    let schedule = RetrySchedule::new(vec![Duration::from_secs(300)]);
    let handler = Arc::new(RetryingHandler::new(schedule));
    let queue = env.queue(handler.clone(), "host-a").unwrap();

    queue.post(&InvoiceCreated { invoice_id: 1 }).await.unwrap();
    assert_eq!(queue.process_ready_once().await.unwrap(), 1);

    // Too early: the retry is future-dated.
    env.advance_time(Duration::from_secs(299));
    assert_eq!(queue.process_ready_once().await.unwrap(), 0);

    env.advance_time(Duration::from_secs(1));
    assert_eq!(queue.process_ready_once().await.unwrap(), 1);
}

#[tokio::test]
async fn empty_schedule_fails_on_first_retry_request() {
    let env = TestEnv::new();
    let handler = Arc::new(RetryingHandler::new(RetrySchedule::none()));
    let queue = env.queue(handler.clone(), "host-a").unwrap();

    let id = queue.post(&InvoiceCreated { invoice_id: 1 }).await.unwrap();
    assert_eq!(queue.process_ready_once().await.unwrap(), 1);

    let archived = env.storage.find_history(id).await.unwrap().expect("archived");
    assert_eq!(archived.processing_state, ProcessingState::Failed);
}
