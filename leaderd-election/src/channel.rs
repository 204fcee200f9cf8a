//! Keep-latest notification of leadership changes.
//!
//! The coordinator publishes every observed change of leader; a single
//! consumer receives the most recent one. Publishing never waits for the
//! consumer: an unread event is replaced by a newer one, so a slow or absent
//! consumer can never stall the election loop.

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// A change of the observed lease holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipEvent {
    pub observed_at: DateTime<Utc>,
    /// `None` when the leader is unknown (lease free or leadership lost)
    pub leader: Option<String>,
}

impl LeadershipEvent {
    pub fn new(leader: Option<String>) -> Self {
        Self {
            observed_at: Utc::now(),
            leader,
        }
    }

    /// Leader identity, empty when unknown.
    pub fn leader_or_empty(&self) -> &str {
        self.leader.as_deref().unwrap_or("")
    }
}

/// Create a connected sender/receiver pair.
pub fn leadership_channel() -> (LeadershipSender, LeadershipReceiver) {
    let (tx, rx) = watch::channel(None);
    (LeadershipSender { tx }, LeadershipReceiver { rx })
}

/// Producing half, owned by the coordinator.
#[derive(Debug)]
pub struct LeadershipSender {
    tx: watch::Sender<Option<LeadershipEvent>>,
}

impl LeadershipSender {
    /// Publish an event, overwriting any event the consumer has not read yet.
    pub fn publish(&self, event: LeadershipEvent) {
        self.tx.send_replace(Some(event));
    }
}

/// Consuming half, owned by exactly one updater.
#[derive(Debug)]
pub struct LeadershipReceiver {
    rx: watch::Receiver<Option<LeadershipEvent>>,
}

impl LeadershipReceiver {
    /// Wait for the next unread event.
    ///
    /// Returns `None` once the sender is dropped and no unread event remains.
    pub async fn recv(&mut self) -> Option<LeadershipEvent> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            if let Some(event) = self.rx.borrow_and_update().clone() {
                return Some(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_recv_delivers_published_event() {
        let (tx, mut rx) = leadership_channel();
        tx.publish(LeadershipEvent::new(Some("a".to_string())));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.leader.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_publish_keeps_latest_without_consumer() {
        let (tx, mut rx) = leadership_channel();
        for i in 0..100 {
            tx.publish(LeadershipEvent::new(Some(format!("leader-{i}"))));
        }
        let event = rx.recv().await.unwrap();
        assert_eq!(event.leader_or_empty(), "leader-99");
    }

    #[tokio::test]
    async fn test_publish_after_receiver_dropped_does_not_block() {
        let (tx, rx) = leadership_channel();
        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), async {
            tx.publish(LeadershipEvent::new(None));
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_recv_returns_none_when_sender_dropped() {
        let (tx, mut rx) = leadership_channel();
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_leader_is_empty_string() {
        let (tx, mut rx) = leadership_channel();
        tx.publish(LeadershipEvent::new(None));
        assert_eq!(rx.recv().await.unwrap().leader_or_empty(), "");
    }
}
