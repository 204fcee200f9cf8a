//! Runs in its own process: the test raises SIGTERM on itself.
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use leaderd::{run, AppConfig, ShutdownOrchestrator};
use leaderd_election::{ElectionConfig, HolderIdentity, InMemoryLeaseLock};
use nix::sys::signal::{raise, Signal};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[test_log::test(tokio::test)]
async fn test_repeated_signals_shut_down_once() {
    let store = InMemoryLeaseLock::new("my-lease", "default");
    let config = AppConfig::new(HolderIdentity::new("pod-a").unwrap(), "my-lease")
        .with_addr("127.0.0.1:0")
        .with_election(
            ElectionConfig::new()
                .with_lease_duration(Duration::from_secs(2))
                .with_renew_deadline(Duration::from_secs(1))
                .with_retry_period(Duration::from_millis(200)),
        );

    let orchestrator = ShutdownOrchestrator::new(CancellationToken::new(), Duration::from_secs(2));
    let _listener = orchestrator.spawn_signal_listener().unwrap();
    let token = orchestrator.token();
    let app = tokio::spawn(run(config, Arc::new(store.handle()), orchestrator));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !store.snapshot().await.is_some_and(|r| r.is_held_by("pod-a")) {
        assert!(tokio::time::Instant::now() < deadline, "never acquired");
        sleep(Duration::from_millis(20)).await;
    }

    raise(Signal::SIGTERM).unwrap();
    raise(Signal::SIGTERM).unwrap();
    raise(Signal::SIGINT).unwrap();

    app.await.unwrap().unwrap();
    assert!(token.is_cancelled());
    assert!(!store.snapshot().await.unwrap().has_holder());

    // One more signal after shutdown is still absorbed by the listener
    raise(Signal::SIGTERM).unwrap();
    sleep(Duration::from_millis(50)).await;
}
