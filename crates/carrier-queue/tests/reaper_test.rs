//! Recovery of claims abandoned by a crashed instance.

use std::{sync::Arc, time::Duration};

use carrier_core::{Clock, ProcessingState};
use carrier_queue::{QueueConfig, QueueStorage, Reaper};
use test_harness::{fixtures::EntryBuilder, handlers::CountingHandler, TestEnv};

fn config() -> QueueConfig {
    QueueConfig {
        claim_time: Duration::from_secs(5 * 60),
        reap_threshold: Duration::from_secs(10 * 60),
        ..QueueConfig::default()
    }
}

#[tokio::test]
async fn abandoned_claim_is_recovered_and_processed_elsewhere() {
    let env = TestEnv::with_config(config());
    let reaper = Reaper::new(
        env.storage.clone(),
        env.queue_name(),
        env.config.clone(),
        Arc::new(env.clock.clone()),
    );

    // Instance host-a claims the entry, then crashes.
    let id = env.storage.insert(EntryBuilder::new(env.clock.now_utc()).build()).await.unwrap();
    env.storage
        .claim_ready(env.queue_name(), "host-a".into(), env.clock.now_utc(), 10)
        .await
        .unwrap();
    assert!(env.storage.verify_live_state(id, ProcessingState::InProcessing).await);

    // Within the reap period nothing happens.
    env.advance_time(Duration::from_secs(5 * 60));
    assert_eq!(reaper.tick().await.unwrap(), 0);
    assert!(env.storage.verify_live_state(id, ProcessingState::InProcessing).await);

    // Past it, the claim is reset without touching the error count.
    env.advance_time(Duration::from_secs(6 * 60));
    assert_eq!(reaper.tick().await.unwrap(), 1);
    let entry = env.storage.find_live(id).await.unwrap().expect("live");
    assert_eq!(entry.processing_state, ProcessingState::Available);
    assert!(entry.processing_owner.is_none());
    assert!(entry.processing_claimed_date.is_none());
    assert_eq!(entry.error_count, 0);

    // A surviving instance picks it up and completes it.
    let handler = Arc::new(CountingHandler::new());
    let queue = env.queue(handler.clone(), "host-b").unwrap();
    assert_eq!(queue.process_ready_once().await.unwrap(), 1);
    assert_eq!(handler.count(), 1);

    let archived = env.storage.find_history(id).await.unwrap().expect("archived");
    assert_eq!(archived.processing_state, ProcessingState::Processed);
}

#[tokio::test]
async fn active_claims_survive_a_sweep() {
    let env = TestEnv::with_config(config());
    let reaper = Reaper::new(
        env.storage.clone(),
        env.queue_name(),
        env.config.clone(),
        Arc::new(env.clock.clone()),
    );

    env.storage.insert(EntryBuilder::new(env.clock.now_utc()).build()).await.unwrap();
    env.storage
        .claim_ready(env.queue_name(), "host-a".into(), env.clock.now_utc(), 10)
        .await
        .unwrap();

    // Sweep immediately: the claim is fresh and must not be touched,
    // even with a sweep running right after the claim.
    assert_eq!(reaper.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn reap_period_ignores_a_threshold_below_the_claim_window() {
    // A misconfigured short threshold must not let the reaper steal
    // claims that are still within claim_time plus grace.
    let env = TestEnv::with_config(QueueConfig {
        claim_time: Duration::from_secs(10 * 60),
        reap_threshold: Duration::from_secs(60),
        ..QueueConfig::default()
    });
    let reaper = Reaper::new(
        env.storage.clone(),
        env.queue_name(),
        env.config.clone(),
        Arc::new(env.clock.clone()),
    );

    env.storage.insert(EntryBuilder::new(env.clock.now_utc()).build()).await.unwrap();
    env.storage
        .claim_ready(env.queue_name(), "host-a".into(), env.clock.now_utc(), 10)
        .await
        .unwrap();

    // Past the configured threshold but within claim_time + grace.
    env.advance_time(Duration::from_secs(5 * 60));
    assert_eq!(reaper.tick().await.unwrap(), 0);

    // Past claim_time + grace the claim is fair game.
    env.advance_time(Duration::from_secs(11 * 60));
    assert_eq!(reaper.tick().await.unwrap(), 1);
}
