//! Connection registry with single-topic pub/sub.
//!
//! Every client owns a bounded mailbox. The hub holds the only sender, so
//! dropping the registry entry closes the mailbox and ends the client's
//! outbound loop. Publication never waits: a mailbox that cannot take a
//! message gets its client evicted once the fan-out is done.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::api::health::MetricsSink;
use crate::config::HubConfig;
use crate::types::Topic;
use crate::ws::messages::ServerMessage;

pub type ClientId = u64;

/// One serialized frame, shared across every mailbox it is fanned out to.
pub type Frame = Arc<str>;

struct ClientEntry {
    tx: mpsc::Sender<Frame>,
    topic: Option<Topic>,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<ClientId, ClientEntry>,
    subscriptions: HashMap<Topic, HashSet<ClientId>>,
}

impl Registry {
    fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscriptions.get(&topic).map_or(0, HashSet::len)
    }

    /// Drop `id` from `topic`'s member set, pruning empty sets.
    fn leave(&mut self, id: ClientId, topic: Topic) {
        if let Some(members) = self.subscriptions.get_mut(&topic) {
            members.remove(&id);
            if members.is_empty() {
                self.subscriptions.remove(&topic);
            }
        }
    }
}

/// Result of `Hub::register`. A rejected registration still carries a
/// mailbox: it holds the capacity error and is already closed.
pub struct Registration {
    pub id: ClientId,
    pub rx: mpsc::Receiver<Frame>,
    pub accepted: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub max_connections: usize,
    pub subscribers: HashMap<Topic, usize>,
}

pub struct Hub {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    config: HubConfig,
    metrics: Arc<dyn MetricsSink>,
}

impl Hub {
    pub fn new(config: HubConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
            config,
            metrics,
        }
    }

    /// Add a connection unless the registry is full.
    pub fn register(&self) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity.max(1));

        let mut reg = self.write();
        if reg.clients.len() >= self.config.max_connections {
            drop(reg);
            let frame: Frame = ServerMessage::error("server at capacity").to_json().into();
            let _ = tx.try_send(frame);
            warn!(client_id = id, max = self.config.max_connections, "connection rejected: hub at capacity");
            return Registration { id, rx, accepted: false };
        }

        reg.clients.insert(id, ClientEntry { tx, topic: None });
        let total = reg.clients.len();
        drop(reg);

        self.metrics.connection_opened();
        info!(client_id = id, total, "client registered");
        Registration { id, rx, accepted: true }
    }

    /// Remove a connection and close its mailbox. Safe to call repeatedly.
    pub fn unregister(&self, id: ClientId) -> bool {
        let mut reg = self.write();
        let Some(entry) = reg.clients.remove(&id) else {
            return false;
        };
        let mut remaining = None;
        if let Some(topic) = entry.topic {
            reg.leave(id, topic);
            remaining = Some((topic, reg.subscriber_count(topic)));
        }
        let total = reg.clients.len();
        drop(reg);
        // `entry.tx` drops here, closing the mailbox.
        drop(entry);

        if let Some((topic, count)) = remaining {
            self.metrics.subscribers_changed(topic, count);
        }
        self.metrics.connection_closed();
        info!(client_id = id, total, "client unregistered");
        true
    }

    /// Move the client onto `topic`, leaving any previous one.
    pub fn subscribe(&self, id: ClientId, topic: Topic) -> bool {
        let mut reg = self.write();
        let previous = match reg.clients.get_mut(&id) {
            Some(entry) => entry.topic.replace(topic),
            None => return false,
        };
        if let Some(prev) = previous {
            reg.leave(id, prev);
        }
        reg.subscriptions.entry(topic).or_default().insert(id);

        let prev_count = previous.map(|p| (p, reg.subscriber_count(p)));
        let count = reg.subscriber_count(topic);
        drop(reg);

        if let Some((prev, n)) = prev_count {
            if prev != topic {
                self.metrics.subscribers_changed(prev, n);
            }
        }
        self.metrics.subscribers_changed(topic, count);
        debug!(client_id = id, %topic, subscribers = count, "client subscribed");
        true
    }

    /// Drop the client's topic. With `Some(topic)`, only if it matches.
    /// Returns the topic actually left.
    pub fn unsubscribe(&self, id: ClientId, topic: Option<Topic>) -> Option<Topic> {
        let mut reg = self.write();
        let entry = reg.clients.get_mut(&id)?;
        let current = entry.topic?;
        if topic.is_some_and(|t| t != current) {
            return None;
        }
        entry.topic = None;
        reg.leave(id, current);
        let count = reg.subscriber_count(current);
        drop(reg);

        self.metrics.subscribers_changed(current, count);
        debug!(client_id = id, topic = %current, "client unsubscribed");
        Some(current)
    }

    /// Fan out to `topic` subscribers. Returns the number of mailboxes
    /// that accepted the frame; the rest are evicted.
    pub fn publish(&self, topic: Topic, msg: &ServerMessage) -> usize {
        let frame: Frame = msg.to_json().into();
        let mut delivered = 0usize;
        let mut evict: Vec<ClientId> = Vec::new();

        {
            let reg = self.read();
            let Some(members) = reg.subscriptions.get(&topic) else {
                return 0;
            };
            for id in members {
                let Some(entry) = reg.clients.get(id) else { continue };
                match entry.tx.try_send(Arc::clone(&frame)) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => evict.push(*id),
                }
            }
        }

        for id in &evict {
            self.metrics.message_failed();
            warn!(client_id = *id, %topic, "mailbox full, evicting slow client");
            self.unregister(*id);
        }

        self.metrics.broadcast(delivered);
        debug!(%topic, delivered, evicted = evict.len(), bytes = frame.len(), "published");
        delivered
    }

    /// Best-effort send to every client regardless of topic.
    /// Full mailboxes are skipped, never evicted.
    pub fn broadcast_all(&self, msg: &ServerMessage) -> usize {
        let frame: Frame = msg.to_json().into();
        let reg = self.read();
        let delivered = reg
            .clients
            .values()
            .filter(|entry| entry.tx.try_send(Arc::clone(&frame)).is_ok())
            .count();
        let skipped = reg.clients.len() - delivered;
        drop(reg);

        if skipped > 0 {
            debug!(skipped, "broadcast skipped busy clients");
        }
        self.metrics.broadcast(delivered);
        delivered
    }

    /// Direct reply to one client. Dropped when its mailbox is full.
    pub fn send_to(&self, id: ClientId, msg: &ServerMessage) -> bool {
        let reg = self.read();
        let Some(entry) = reg.clients.get(&id) else {
            return false;
        };
        entry.tx.try_send(msg.to_json().into()).is_ok()
    }

    pub fn can_accept(&self) -> bool {
        self.read().clients.len() < self.config.max_connections
    }

    pub fn client_count(&self) -> usize {
        self.read().clients.len()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.read().subscriber_count(topic)
    }

    pub fn topic_of(&self, id: ClientId) -> Option<Topic> {
        self.read().clients.get(&id).and_then(|e| e.topic)
    }

    pub fn stats(&self) -> HubStats {
        let reg = self.read();
        HubStats {
            connections: reg.clients.len(),
            max_connections: self.config.max_connections,
            subscribers: Topic::ALL
                .iter()
                .map(|t| (*t, reg.subscriber_count(*t)))
                .collect(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::health::NoopMetrics;

    fn hub(max_connections: usize, mailbox_capacity: usize) -> Hub {
        Hub::new(
            HubConfig { max_connections, mailbox_capacity },
            Arc::new(NoopMetrics),
        )
    }

    fn frame_type(frame: &str) -> String {
        let v: serde_json::Value = serde_json::from_str(frame).unwrap();
        v["type"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn third_client_is_rejected_at_capacity_two() {
        let hub = hub(2, 8);
        let a = hub.register();
        let b = hub.register();
        assert!(a.accepted && b.accepted);
        assert!(!hub.can_accept());

        let mut c = hub.register();
        assert!(!c.accepted);
        assert_eq!(hub.client_count(), 2);

        let frame = c.rx.recv().await.unwrap();
        assert_eq!(frame_type(&frame), "error");
        assert!(frame.contains("capacity"));
        assert!(c.rx.recv().await.is_none(), "rejected mailbox must be closed");
    }

    #[tokio::test]
    async fn overflowing_a_stalled_mailbox_evicts_only_that_client() {
        let capacity = 4;
        let hub = hub(10, capacity);
        let mut stalled = hub.register();
        let mut healthy = hub.register();
        hub.subscribe(stalled.id, Topic::Nba);
        hub.subscribe(healthy.id, Topic::Nba);

        for i in 0..=capacity {
            hub.publish(Topic::Nba, &ServerMessage::status(format!("m{i}")));
            // healthy keeps up
            assert!(healthy.rx.recv().await.is_some());
        }

        assert_eq!(hub.client_count(), 1);
        assert_eq!(hub.subscriber_count(Topic::Nba), 1);
        assert_eq!(hub.topic_of(healthy.id), Some(Topic::Nba));

        let mut drained = 0;
        while stalled.rx.recv().await.is_some() {
            drained += 1;
        }
        assert_eq!(drained, capacity);
    }

    #[tokio::test]
    async fn resubscribing_replaces_the_previous_topic() {
        let hub = hub(10, 8);
        let mut c = hub.register();
        assert!(hub.subscribe(c.id, Topic::Nba));
        assert!(hub.subscribe(c.id, Topic::Nfl));

        assert_eq!(hub.subscriber_count(Topic::Nba), 0);
        assert_eq!(hub.subscriber_count(Topic::Nfl), 1);
        assert_eq!(hub.publish(Topic::Nba, &ServerMessage::status("nba")), 0);
        assert_eq!(hub.publish(Topic::Nfl, &ServerMessage::status("nfl")), 1);

        let frame = c.rx.recv().await.unwrap();
        assert!(frame.contains("nfl"));
    }

    #[test]
    fn unregister_is_idempotent_and_clears_membership() {
        let hub = hub(10, 8);
        let c = hub.register();
        hub.subscribe(c.id, Topic::Nfl);

        assert!(hub.unregister(c.id));
        assert!(!hub.unregister(c.id));
        assert_eq!(hub.client_count(), 0);
        assert_eq!(hub.subscriber_count(Topic::Nfl), 0);
        assert!(!hub.subscribe(c.id, Topic::Nba));
    }

    #[test]
    fn unsubscribe_with_mismatched_topic_is_a_no_op() {
        let hub = hub(10, 8);
        let c = hub.register();
        hub.subscribe(c.id, Topic::Nba);

        assert_eq!(hub.unsubscribe(c.id, Some(Topic::Nfl)), None);
        assert_eq!(hub.topic_of(c.id), Some(Topic::Nba));
        assert_eq!(hub.unsubscribe(c.id, None), Some(Topic::Nba));
        assert_eq!(hub.subscriber_count(Topic::Nba), 0);
    }

    #[tokio::test]
    async fn broadcast_all_skips_full_mailboxes_without_evicting() {
        let hub = hub(10, 1);
        let mut a = hub.register();
        let _b = hub.register();
        hub.subscribe(a.id, Topic::Nba);

        assert_eq!(hub.broadcast_all(&ServerMessage::status("polling_degraded")), 2);
        // both mailboxes now full
        assert_eq!(hub.broadcast_all(&ServerMessage::status("polling_healthy")), 0);
        assert_eq!(hub.client_count(), 2);

        let frame = a.rx.recv().await.unwrap();
        assert!(frame.contains("polling_degraded"));
    }
}
