use std::sync::Arc;
use std::time::Duration;

use leaderd_election::{
    leadership_channel, ElectionConfig, ElectionCoordinator, ElectionState, HolderIdentity,
    InMemoryLeaseLock, LeadershipReceiver,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const RETRY: Duration = Duration::from_secs(1);

fn config() -> ElectionConfig {
    ElectionConfig::new()
        .with_lease_duration(Duration::from_secs(10))
        .with_renew_deadline(Duration::from_secs(5))
        .with_retry_period(RETRY)
        .with_release_on_cancel(true)
}

struct Contender {
    lock: InMemoryLeaseLock,
    state: watch::Receiver<ElectionState>,
    leaders: LeadershipReceiver,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

fn start(lock: InMemoryLeaseLock, id: &str) -> Contender {
    let (events, leaders) = leadership_channel();
    let coordinator = ElectionCoordinator::new(
        Arc::new(lock.clone()),
        HolderIdentity::new(id).unwrap(),
        config(),
        events,
    )
    .unwrap();
    let state = coordinator.subscribe_state();
    let cancel = CancellationToken::new();
    let handle = coordinator.spawn(cancel.clone());
    Contender {
        lock,
        state,
        leaders,
        cancel,
        handle,
    }
}

async fn wait_for_leader(leaders: &mut LeadershipReceiver, expected: &str) {
    loop {
        let event = leaders.recv().await.unwrap();
        if event.leader_or_empty() == expected {
            return;
        }
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_contention_and_takeover_after_release() {
    let store = InMemoryLeaseLock::new("my-lease", "default");

    let mut a = start(store.handle(), "a");
    a.state
        .wait_for(|s| *s == ElectionState::Leading)
        .await
        .unwrap();
    wait_for_leader(&mut a.leaders, "a").await;

    let mut b = start(store.handle(), "b");
    b.state
        .wait_for(|s| *s == ElectionState::Observing)
        .await
        .unwrap();

    let observed_at = Instant::now();
    wait_for_leader(&mut b.leaders, "a").await;
    assert!(observed_at.elapsed() <= RETRY);

    // Well past a's lease duration: renewals keep b observing
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(*b.state.borrow(), ElectionState::Observing);
    assert_eq!(*a.state.borrow(), ElectionState::Leading);

    a.cancel.cancel();
    a.handle.await.unwrap();
    assert!(!store.snapshot().await.unwrap().has_holder());

    let released_at = Instant::now();
    b.state
        .wait_for(|s| *s == ElectionState::Leading)
        .await
        .unwrap();
    wait_for_leader(&mut b.leaders, "b").await;
    assert!(released_at.elapsed() <= RETRY.mul_f64(1.0 + leaderd_election::JITTER_FACTOR));

    let record = store.snapshot().await.unwrap();
    assert_eq!(record.holder_identity, "b");
    assert_eq!(record.transitions, 1);

    b.cancel.cancel();
    b.handle.await.unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_takeover_after_leader_partition() {
    let store = InMemoryLeaseLock::new("my-lease", "default");

    let mut a = start(store.handle(), "a");
    a.state
        .wait_for(|s| *s == ElectionState::Leading)
        .await
        .unwrap();
    let mut b = start(store.handle(), "b");
    b.state
        .wait_for(|s| *s == ElectionState::Observing)
        .await
        .unwrap();

    a.lock.set_available(false).await;
    let partitioned_at = Instant::now();

    b.state
        .wait_for(|s| *s == ElectionState::Leading)
        .await
        .unwrap();
    // a must have stepped down before b could claim
    assert_ne!(*a.state.borrow(), ElectionState::Leading);
    assert!(partitioned_at.elapsed() >= Duration::from_secs(5));
    wait_for_leader(&mut b.leaders, "b").await;

    // a comes back and observes b instead of stealing the lease
    a.lock.set_available(true).await;
    wait_for_leader(&mut a.leaders, "b").await;
    assert_eq!(store.snapshot().await.unwrap().holder_identity, "b");

    for c in [a, b] {
        c.cancel.cancel();
        c.handle.await.unwrap();
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_mutual_exclusion_under_random_faults() {
    let store = InMemoryLeaseLock::new("my-lease", "default");
    let mut contenders = Vec::new();
    for (i, id) in ["a", "b", "c", "d"].iter().enumerate() {
        let lock = store.handle();
        lock.with_random_faults(i as u64 + 1, 0.3, 0.1).await;
        contenders.push(start(lock, id));
    }

    let mut samples_with_leader = 0;
    let deadline = Instant::now() + Duration::from_secs(600);
    while Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let leading = contenders
            .iter()
            .filter(|c| *c.state.borrow() == ElectionState::Leading)
            .count();
        assert!(leading <= 1, "{leading} contenders leading at once");
        if leading == 1 {
            samples_with_leader += 1;
        }
    }
    assert!(samples_with_leader > 0, "no contender ever led");

    for c in contenders {
        c.cancel.cancel();
        c.handle.await.unwrap();
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_store_outage_at_startup_is_retried() {
    let store = InMemoryLeaseLock::new("my-lease", "default");
    let lock = store.handle();
    lock.set_available(false).await;

    let mut a = start(lock.clone(), "a");
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(*a.state.borrow(), ElectionState::Acquiring);
    assert!(store.snapshot().await.is_none());

    lock.set_available(true).await;
    a.state
        .wait_for(|s| *s == ElectionState::Leading)
        .await
        .unwrap();

    a.cancel.cancel();
    a.handle.await.unwrap();
}
