//! Network seam between the relay pool and the relays.
//!
//! The pool never touches sockets directly. It asks a [`Transport`] to open one logical
//! subscription over a set of relays and reads back a single merged stream: events
//! de-duplicated by id, followed by exactly one [`SubscriptionMessage::Eose`].
//! [`WebSocketTransport`] is the production implementation; tests substitute their own.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};

use arcade_nostr::{Event, verify_event};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter, RelayMessage};
use crate::relay::{RelayConnection, RelayEvent};
use crate::subscription::{SubscriptionTracker, generate_subscription_id};

/// Item on a merged subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionMessage {
    Event(Event),
    /// Stored events are exhausted; everything after this is live.
    Eose,
}

/// A subscription opened over one or more relays.
#[derive(Debug)]
pub struct NetworkSubscription {
    pub id: String,
    pub messages: mpsc::UnboundedReceiver<SubscriptionMessage>,
}

/// Per-relay outcome of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishStatus {
    Ok { relay: String },
    Failed { relay: String, reason: String },
}

/// Stream of per-relay acknowledgements for one published event.
///
/// The stream ends once every targeted relay has answered or dropped.
#[derive(Debug)]
pub struct PublishHandle {
    statuses: mpsc::UnboundedReceiver<PublishStatus>,
}

impl PublishHandle {
    /// A handle together with the sender a transport reports into.
    pub fn channel() -> (mpsc::UnboundedSender<PublishStatus>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { statuses: rx })
    }

    /// Next relay answer, or `None` when no more are coming.
    pub async fn next(&mut self) -> Option<PublishStatus> {
        self.statuses.recv().await
    }
}

/// Relay network operations used by the pool.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open (or reuse) a connection to `url`.
    async fn connect(&self, url: &str) -> Result<()>;

    /// Close the connection to `url` and suppress reconnection.
    async fn close(&self, url: &str);

    /// Send one REQ to each of `relays` and merge the answers.
    async fn subscribe(&self, relays: &[String], filters: Vec<Filter>)
    -> Result<NetworkSubscription>;

    /// CLOSE a subscription on every relay carrying it.
    async fn unsubscribe(&self, subscription_id: &str);

    /// Broadcast a signed event.
    async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishHandle>;

    /// Relays an event has been received from.
    fn seen_on(&self, event_id: &str) -> Vec<String>;
}

struct ActiveSubscription {
    tracker: SubscriptionTracker,
    /// Relays the subscription was requested on; reconnecting relays get the REQ again
    targets: Vec<String>,
    sender: mpsc::UnboundedSender<SubscriptionMessage>,
    eose_timer: Option<JoinHandle<()>>,
}

impl ActiveSubscription {
    fn report_eose(&mut self, force: bool) {
        if self.tracker.take_eose(force) {
            if let Some(timer) = self.eose_timer.take() {
                timer.abort();
            }
            let _ = self.sender.send(SubscriptionMessage::Eose);
        }
    }
}

/// Relays each recent event arrived from, bounded to the newest `capacity` ids.
#[derive(Debug)]
struct SeenOnIndex {
    capacity: usize,
    relays: HashMap<String, Vec<String>>,
    /// Event ids in first-arrival order, oldest first
    order: VecDeque<String>,
}

impl SeenOnIndex {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            relays: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn record(&mut self, event_id: &str, relay: &str) {
        if self.capacity == 0 {
            return;
        }
        if let Some(relays) = self.relays.get_mut(event_id) {
            if !relays.iter().any(|r| r == relay) {
                relays.push(relay.to_string());
            }
            return;
        }

        self.relays.insert(event_id.to_string(), vec![relay.to_string()]);
        self.order.push_back(event_id.to_string());
        while self.relays.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.relays.remove(&oldest);
        }
    }

    fn get(&self, event_id: &str) -> Vec<String> {
        self.relays.get(event_id).cloned().unwrap_or_default()
    }
}

struct PendingPublish {
    sender: mpsc::UnboundedSender<PublishStatus>,
    outstanding: HashSet<String>,
}

struct Inner {
    config: PoolConfig,
    relays: RwLock<HashMap<String, Arc<RelayConnection>>>,
    subscriptions: Mutex<HashMap<String, ActiveSubscription>>,
    publishes: Mutex<HashMap<String, PendingPublish>>,
    seen_on: RwLock<SeenOnIndex>,
    intentionally_closed: Mutex<HashSet<String>>,
    reconnect_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    events_tx: mpsc::UnboundedSender<RelayEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// [`Transport`] over real WebSocket connections.
pub struct WebSocketTransport {
    inner: Arc<Inner>,
}

impl WebSocketTransport {
    pub fn new(config: PoolConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let seen_on = SeenOnIndex::new(config.seen_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                relays: RwLock::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                publishes: Mutex::new(HashMap::new()),
                seen_on: RwLock::new(seen_on),
                intentionally_closed: Mutex::new(HashSet::new()),
                reconnect_timers: Mutex::new(HashMap::new()),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Relays with an open socket.
    pub fn connected_relays(&self) -> Vec<String> {
        self.inner
            .relays
            .read()
            .iter()
            .filter(|(_, conn)| conn.is_connected())
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Whether a reconnect is scheduled for `url`.
    pub fn reconnect_pending(&self, url: &str) -> bool {
        self.inner.reconnect_timers.lock().contains_key(url)
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl Inner {
    /// Start the task that routes relay notifications. Runs until the transport is dropped.
    fn ensure_dispatcher(self: &Arc<Self>) {
        let Some(mut rx) = self.events_rx.lock().take() else {
            return;
        };
        let weak: Weak<Inner> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.handle(event);
            }
        });
        *self.dispatcher.lock() = Some(handle);
    }

    fn handle(self: &Arc<Self>, event: RelayEvent) {
        match event {
            RelayEvent::Message { relay, message } => self.handle_message(&relay, message),
            RelayEvent::Disconnected { relay } => {
                warn!("Relay {} disconnected", relay);
                self.detach_relay(&relay, "connection lost");
                self.schedule_reconnect(&relay);
            }
        }
    }

    fn handle_message(&self, relay: &str, message: RelayMessage) {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                if !verify_event(&event) {
                    debug!("Dropping event {} from {}: invalid signature", event.id, relay);
                    return;
                }
                self.seen_on.write().record(&event.id, relay);
                let mut subscriptions = self.subscriptions.lock();
                if let Some(sub) = subscriptions.get_mut(&subscription_id)
                    && sub.tracker.has_relay(relay)
                    && sub.tracker.first_sighting(&event.id)
                {
                    let _ = sub.sender.send(SubscriptionMessage::Event(event));
                }
            }
            RelayMessage::Eose { subscription_id } => {
                debug!("EOSE from {} for {}", relay, subscription_id);
                if let Some(sub) = self.subscriptions.lock().get_mut(&subscription_id) {
                    sub.tracker.mark_eose(relay);
                    sub.report_eose(false);
                }
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                warn!(
                    "Relay {} closed subscription {}: {}",
                    relay, subscription_id, message
                );
                if let Some(sub) = self.subscriptions.lock().get_mut(&subscription_id) {
                    sub.tracker.remove_relay(relay);
                    sub.report_eose(false);
                }
            }
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                let mut publishes = self.publishes.lock();
                let Some(pending) = publishes.get_mut(&event_id) else {
                    return;
                };
                if !pending.outstanding.remove(relay) {
                    return;
                }
                let status = if success {
                    PublishStatus::Ok {
                        relay: relay.to_string(),
                    }
                } else {
                    PublishStatus::Failed {
                        relay: relay.to_string(),
                        reason: message,
                    }
                };
                let _ = pending.sender.send(status);
                if pending.outstanding.is_empty() {
                    publishes.remove(&event_id);
                }
            }
            RelayMessage::Notice { message } => info!("Notice from {}: {}", relay, message),
            RelayMessage::Auth { .. } => debug!("Ignoring AUTH challenge from {}", relay),
        }
    }

    /// Stop waiting on `relay` for EOSE and acknowledgements.
    fn detach_relay(&self, relay: &str, reason: &str) {
        for sub in self.subscriptions.lock().values_mut() {
            if sub.tracker.has_relay(relay) {
                sub.tracker.remove_relay(relay);
                sub.report_eose(false);
            }
        }

        self.publishes.lock().retain(|_, pending| {
            if pending.outstanding.remove(relay) {
                let _ = pending.sender.send(PublishStatus::Failed {
                    relay: relay.to_string(),
                    reason: reason.to_string(),
                });
            }
            !pending.outstanding.is_empty()
        });
    }

    /// Arm a single reconnect timer for `relay`, unless one is pending or the relay was
    /// closed on purpose.
    fn schedule_reconnect(self: &Arc<Self>, relay: &str) {
        if self.intentionally_closed.lock().contains(relay) {
            debug!("Not reconnecting to {}: closed by owner", relay);
            return;
        }

        let mut timers = self.reconnect_timers.lock();
        if timers.contains_key(relay) {
            return;
        }

        let delay = self.config.relay.reconnect_delay;
        info!("Reconnecting to {} in {:?}", relay, delay);

        let weak = Arc::downgrade(self);
        let url = relay.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.reconnect_timers.lock().remove(&url);
                inner.reconnect(&url).await;
            }
        });
        timers.insert(relay.to_string(), handle);
    }

    async fn reconnect(self: &Arc<Self>, relay: &str) {
        if self.intentionally_closed.lock().contains(relay) {
            return;
        }
        let Some(conn) = self.relays.read().get(relay).cloned() else {
            return;
        };

        match conn.connect().await {
            Ok(()) => {
                if self.intentionally_closed.lock().contains(relay) {
                    conn.close();
                    return;
                }
                self.resubscribe(relay, &conn);
            }
            Err(ClientError::AlreadyConnected) => {}
            Err(e) => {
                warn!("Reconnect to {} failed: {}", relay, e);
                self.schedule_reconnect(relay);
            }
        }
    }

    /// Re-issue every live subscription that targeted `relay`.
    fn resubscribe(&self, relay: &str, conn: &RelayConnection) {
        let mut subscriptions = self.subscriptions.lock();
        for sub in subscriptions.values_mut() {
            if !sub.targets.iter().any(|t| t == relay) {
                continue;
            }
            let req = ClientMessage::Req {
                subscription_id: sub.tracker.id.clone(),
                filters: sub.tracker.filters.clone(),
            };
            match conn.send(&req) {
                Ok(()) => {
                    info!("Resubscribed {} on {}", sub.tracker.id, relay);
                    sub.tracker.add_relay(relay);
                }
                Err(e) => warn!("Failed to resubscribe {} on {}: {}", sub.tracker.id, relay, e),
            }
        }
    }

    fn force_eose(&self, subscription_id: &str) {
        if let Some(sub) = self.subscriptions.lock().get_mut(subscription_id) {
            if !sub.tracker.eose_reported() {
                debug!(
                    "EOSE timeout for {}, still waiting on {:?}",
                    subscription_id,
                    sub.tracker.pending_relays()
                );
            }
            sub.eose_timer = None;
            sub.report_eose(true);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, timer) in self.reconnect_timers.lock().drain() {
            timer.abort();
        }
        for sub in self.subscriptions.lock().values_mut() {
            if let Some(timer) = sub.eose_timer.take() {
                timer.abort();
            }
        }
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<()> {
        self.inner.ensure_dispatcher();
        self.inner.intentionally_closed.lock().remove(url);

        let conn = {
            let mut relays = self.inner.relays.write();
            match relays.get(url) {
                Some(conn) => Arc::clone(conn),
                None => {
                    let conn = Arc::new(RelayConnection::with_config(
                        url,
                        self.inner.config.relay.clone(),
                        self.inner.events_tx.clone(),
                    )?);
                    relays.insert(url.to_string(), Arc::clone(&conn));
                    conn
                }
            }
        };

        match conn.connect().await {
            Ok(()) | Err(ClientError::AlreadyConnected) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn close(&self, url: &str) {
        self.inner.intentionally_closed.lock().insert(url.to_string());
        if let Some(timer) = self.inner.reconnect_timers.lock().remove(url) {
            timer.abort();
        }
        let conn = self.inner.relays.write().remove(url);
        if let Some(conn) = conn {
            conn.close();
        }
        self.inner.detach_relay(url, "relay closed");
    }

    async fn subscribe(
        &self,
        relays: &[String],
        filters: Vec<Filter>,
    ) -> Result<NetworkSubscription> {
        let id = generate_subscription_id();
        let (tx, rx) = mpsc::unbounded_channel();

        let connections: Vec<(String, Arc<RelayConnection>)> = {
            let map = self.inner.relays.read();
            relays
                .iter()
                .filter_map(|url| map.get(url).map(|conn| (url.clone(), Arc::clone(conn))))
                .collect()
        };

        let req = ClientMessage::Req {
            subscription_id: id.clone(),
            filters: filters.clone(),
        };

        let mut subscriptions = self.inner.subscriptions.lock();
        let mut sub = ActiveSubscription {
            tracker: SubscriptionTracker::new(id.clone(), filters)
                .with_seen_limit(self.inner.config.seen_capacity),
            targets: relays.to_vec(),
            sender: tx,
            eose_timer: None,
        };
        for (url, conn) in connections {
            match conn.send(&req) {
                Ok(()) => sub.tracker.add_relay(url),
                Err(e) => debug!("Skipping {} for {}: {}", url, id, e),
            }
        }

        if sub.tracker.relays.is_empty() {
            debug!("Subscription {} has no reachable relays", id);
            sub.report_eose(false);
        } else {
            let weak = Arc::downgrade(&self.inner);
            let timer_id = id.clone();
            let wait = self.inner.config.eose_timeout;
            sub.eose_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                if let Some(inner) = weak.upgrade() {
                    inner.force_eose(&timer_id);
                }
            }));
        }
        subscriptions.insert(id.clone(), sub);

        debug!("Opened subscription {} on {:?}", id, relays);
        Ok(NetworkSubscription { id, messages: rx })
    }

    async fn unsubscribe(&self, subscription_id: &str) {
        let Some(mut sub) = self.inner.subscriptions.lock().remove(subscription_id) else {
            return;
        };
        if let Some(timer) = sub.eose_timer.take() {
            timer.abort();
        }

        let close = ClientMessage::Close {
            subscription_id: subscription_id.to_string(),
        };
        let relays = self.inner.relays.read();
        for url in &sub.tracker.relays {
            if let Some(conn) = relays.get(url)
                && let Err(e) = conn.send(&close)
            {
                debug!("CLOSE {} on {} failed: {}", subscription_id, url, e);
            }
        }
        debug!("Closed subscription {}", subscription_id);
    }

    async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishHandle> {
        let (tx, handle) = PublishHandle::channel();
        let message = ClientMessage::Event(event.clone());

        let connections = self.inner.relays.read();
        let mut publishes = self.inner.publishes.lock();
        publishes.retain(|_, pending| !pending.sender.is_closed());

        let mut outstanding = HashSet::new();
        for url in relays {
            let sent = match connections.get(url) {
                Some(conn) => conn.send(&message),
                None => Err(ClientError::NotConnected),
            };
            match sent {
                Ok(()) => {
                    outstanding.insert(url.clone());
                }
                Err(e) => {
                    let _ = tx.send(PublishStatus::Failed {
                        relay: url.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if !outstanding.is_empty() {
            publishes.insert(
                event.id.clone(),
                PendingPublish {
                    sender: tx,
                    outstanding,
                },
            );
        }
        Ok(handle)
    }

    fn seen_on(&self, event_id: &str) -> Vec<String> {
        self.inner.seen_on.read().get(event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seen_on_index_forgets_oldest() {
        let mut index = SeenOnIndex::new(2);
        index.record("e1", "wss://a.example");
        index.record("e1", "wss://b.example");
        index.record("e1", "wss://a.example");
        index.record("e2", "wss://a.example");
        assert_eq!(index.get("e1"), vec!["wss://a.example", "wss://b.example"]);

        index.record("e3", "wss://c.example");
        assert!(index.get("e1").is_empty());
        assert_eq!(index.get("e2"), vec!["wss://a.example"]);
        assert_eq!(index.get("e3"), vec!["wss://c.example"]);
        assert_eq!(index.relays.len(), 2);
    }

    #[test]
    fn test_seen_on_index_disabled() {
        let mut index = SeenOnIndex::new(0);
        index.record("e1", "wss://a.example");
        assert!(index.get("e1").is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_without_relays_ends_immediately() {
        let transport = WebSocketTransport::default();
        let mut sub = transport
            .subscribe(&[], vec![Filter::new().kinds(vec![1])])
            .await
            .unwrap();
        assert_eq!(sub.messages.recv().await, Some(SubscriptionMessage::Eose));

        transport.unsubscribe(&sub.id).await;
        assert_eq!(sub.messages.recv().await, None);
    }

    #[tokio::test]
    async fn test_publish_to_unknown_relay_fails() {
        let transport = WebSocketTransport::default();
        let event = Event {
            id: "a".repeat(64),
            pubkey: "b".repeat(64),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "c".repeat(128),
        };
        let mut handle = transport
            .publish(&["wss://nowhere.example".to_string()], &event)
            .await
            .unwrap();
        assert!(matches!(
            handle.next().await,
            Some(PublishStatus::Failed { relay, .. }) if relay == "wss://nowhere.example"
        ));
        assert_eq!(handle.next().await, None);
    }

    #[tokio::test]
    async fn test_close_marks_relay_intentionally_closed() {
        let transport = WebSocketTransport::default();
        transport.close("wss://relay.example.com").await;
        assert!(
            transport
                .inner
                .intentionally_closed
                .lock()
                .contains("wss://relay.example.com")
        );

        transport
            .inner
            .schedule_reconnect("wss://relay.example.com");
        assert!(!transport.reconnect_pending("wss://relay.example.com"));
    }

    #[test]
    fn test_seen_on_unknown_event() {
        let transport = WebSocketTransport::default();
        assert!(transport.seen_on("missing").is_empty());
    }
}
