//! Relay pool: one identity, a set of relays, and shared subscriptions.
//!
//! Subscriptions are multiplexed by canonical filter: asking twice for the same filter
//! opens one network subscription, and the second caller is attached to the first
//! caller's record. When an [`EventStore`] is configured, everything received or
//! published is mirrored into it and [`RelayPool::list`] only asks relays for events newer
//! than what the store already holds.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arcade_nostr::{Event, Identity, UnsignedEvent, sort_events};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{ClientError, Result};
use crate::message::Filter;
use crate::multiplexer::{
    CallbackId, EoseCallback, EoseLatch, EventCallback, SubscriptionMap, SubscriptionRecord,
    SubscriptionState,
};
use crate::relay_info::{HttpInfoFetcher, RelayInfoFetcher, partition_relays};
use crate::store::EventStore;
use crate::transport::{
    NetworkSubscription, PublishHandle, PublishStatus, SubscriptionMessage, Transport,
};

/// Options for [`RelayPool::sub`].
#[derive(Default)]
pub struct SubOptions {
    /// Called once every requested filter has seen EOSE
    pub on_eose: Option<EoseCallback>,
    /// Only request events at or after this timestamp from relays
    pub since: Option<u64>,
    /// Tear the network subscription down after its first EOSE
    pub close_on_eose: bool,
    /// Attach under this id instead of a fresh one
    pub callback_id: Option<CallbackId>,
}

/// Options for [`RelayPool::list`].
#[derive(Default)]
pub struct ListOptions {
    /// Return stored events without waiting for relays
    pub db_only: bool,
    /// Stays attached for live events after the list returns
    pub callback: Option<EventCallback>,
    pub callback_id: Option<CallbackId>,
}

/// Which existing records a caller may join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sharing {
    Any,
    /// Only records still waiting for EOSE
    UntilEose,
}

fn eose_lost() -> ClientError {
    ClientError::Subscription("subscription ended before EOSE".to_string())
}

/// State shared with background pump tasks.
#[derive(Clone)]
struct Shared {
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn EventStore>>,
    subscriptions: Arc<Mutex<SubscriptionMap>>,
    pumps: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl Shared {
    async fn unsub(&self, id: CallbackId) {
        let idle = self.subscriptions.lock().detach(id);
        for network_id in idle {
            self.close_network(&network_id).await;
        }
    }

    async fn close_network(&self, network_id: &str) {
        debug!("Closing network subscription {}", network_id);
        self.transport.unsubscribe(network_id).await;
        self.pumps.lock().remove(network_id);
    }

    /// Deliver one network subscription's stream to the records it serves.
    async fn pump(self, mut sub: NetworkSubscription, close_on_eose: bool) {
        while let Some(message) = sub.messages.recv().await {
            match message {
                SubscriptionMessage::Event(event) => {
                    if let Some(store) = &self.store
                        && let Err(e) = store.save(&event).await
                    {
                        warn!("Failed to store event {}: {}", event.id, e);
                    }
                    let callbacks = self.subscriptions.lock().route(&sub.id, &event);
                    for callback in callbacks {
                        callback(&event);
                    }
                }
                SubscriptionMessage::Eose => {
                    debug!("Subscription {} reached EOSE", sub.id);
                    let ready = {
                        let mut map = self.subscriptions.lock();
                        let ready = map.mark_stored(&sub.id);
                        if close_on_eose {
                            map.close_network(&sub.id);
                        }
                        ready
                    };
                    for on_eose in ready {
                        on_eose();
                    }
                    if close_on_eose {
                        self.transport.unsubscribe(&sub.id).await;
                        self.pumps.lock().remove(&sub.id);
                        break;
                    }
                }
            }
        }
    }
}

/// Pool of relays shared by every subscription and publish of one identity.
pub struct RelayPool {
    identity: Arc<Identity>,
    shared: Shared,
    info_fetcher: Arc<dyn RelayInfoFetcher>,
    config: PoolConfig,
    relays: RwLock<Vec<String>>,
    unsupported: RwLock<Vec<String>>,
    event_callbacks: Arc<RwLock<Vec<EventCallback>>>,
    watch: Mutex<Option<CallbackId>>,
}

impl RelayPool {
    pub fn new(identity: Arc<Identity>, transport: Arc<dyn Transport>) -> Self {
        Self {
            identity,
            shared: Shared {
                transport,
                store: None,
                subscriptions: Arc::new(Mutex::new(SubscriptionMap::new())),
                pumps: Arc::new(Mutex::new(HashMap::new())),
            },
            info_fetcher: Arc::new(HttpInfoFetcher::default()),
            config: PoolConfig::default(),
            relays: RwLock::new(Vec::new()),
            unsupported: RwLock::new(Vec::new()),
            event_callbacks: Arc::new(RwLock::new(Vec::new())),
            watch: Mutex::new(None),
        }
    }

    /// Mirror events into `store` and serve [`list`](Self::list) from it.
    pub fn with_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.shared.store = Some(store);
        self
    }

    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `fetcher` for relay information documents.
    pub fn with_info_fetcher(mut self, fetcher: Arc<dyn RelayInfoFetcher>) -> Self {
        self.info_fetcher = fetcher;
        self
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// Relays used for subscriptions and publishing.
    pub fn relays(&self) -> Vec<String> {
        self.relays.read().clone()
    }

    /// Relays rejected by the last configuration.
    pub fn unsupported_relays(&self) -> Vec<String> {
        self.unsupported.read().clone()
    }

    /// Connect to `urls` and make the reachable ones the active set.
    ///
    /// Relays dropped from the previous set are closed. Returns the active set.
    pub async fn configure_relays(&self, urls: &[String]) -> Vec<String> {
        let mut wanted: Vec<String> = Vec::new();
        for url in urls {
            if !wanted.contains(url) {
                wanted.push(url.clone());
            }
        }

        let previous = self.relays();
        for url in previous.iter().filter(|url| !wanted.contains(url)) {
            info!("Removing relay from pool: {}", url);
            self.shared.transport.close(url).await;
        }

        let results = join_all(wanted.iter().map(|url| self.shared.transport.connect(url))).await;

        let mut active = Vec::new();
        let mut failed = Vec::new();
        for (url, result) in wanted.into_iter().zip(results) {
            match result {
                Ok(()) => active.push(url),
                Err(e) => {
                    warn!("Failed to connect to {}: {}", url, e);
                    failed.push(url);
                }
            }
        }

        info!("Pool relays: {:?}", active);
        *self.relays.write() = active.clone();
        *self.unsupported.write() = failed;
        active
    }

    /// Like [`configure_relays`](Self::configure_relays), keeping only relays that
    /// advertise every NIP in `required_nips`.
    pub async fn configure_and_validate_relays(
        &self,
        urls: &[String],
        required_nips: &[u16],
    ) -> Vec<String> {
        let (supported, mut unsupported) =
            partition_relays(urls, required_nips, self.info_fetcher.as_ref()).await;
        let active = self.configure_relays(&supported).await;

        for url in self.unsupported_relays() {
            if !unsupported.contains(&url) {
                unsupported.push(url);
            }
        }
        *self.unsupported.write() = unsupported;
        active
    }

    /// Call `on_event` for every event matching any of `filters`.
    ///
    /// Filters already subscribed by someone else are shared rather than re-requested.
    pub async fn sub<F>(
        &self,
        filters: Vec<Filter>,
        on_event: F,
        options: SubOptions,
    ) -> Result<CallbackId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe_with(filters, Arc::new(on_event), options).await
    }

    async fn subscribe_with(
        &self,
        filters: Vec<Filter>,
        on_event: EventCallback,
        options: SubOptions,
    ) -> Result<CallbackId> {
        let id = options.callback_id.unwrap_or_else(CallbackId::next);
        self.attach(id, filters, on_event, options, Sharing::Any).await?;
        Ok(id)
    }

    /// Attach `on_event` under `id` to the records for `filters`, opening one network
    /// subscription for the filters nobody is serving yet.
    ///
    /// Returns false, with nothing attached, when `sharing` rules out an existing record.
    async fn attach(
        &self,
        id: CallbackId,
        filters: Vec<Filter>,
        on_event: EventCallback,
        options: SubOptions,
        sharing: Sharing,
    ) -> Result<bool> {
        let mut keys = HashSet::new();
        let filters: Vec<Filter> = filters
            .into_iter()
            .filter(|filter| keys.insert(filter.canonical_key()))
            .collect();

        let mut fresh: Vec<Filter> = Vec::new();
        let mut fresh_keys: Vec<String> = Vec::new();
        let mut replay: Vec<EoseCallback> = Vec::new();
        {
            let mut map = self.shared.subscriptions.lock();

            if sharing == Sharing::UntilEose
                && filters.iter().any(|filter| {
                    map.get(&filter.canonical_key())
                        .is_some_and(|record| record.state != SubscriptionState::Live)
                })
            {
                return Ok(false);
            }

            let waiting = filters
                .iter()
                .filter(|filter| {
                    map.get(&filter.canonical_key())
                        .is_none_or(|record| record.state != SubscriptionState::Stored)
                })
                .count();
            let latch = options.on_eose.map(|on_eose| EoseLatch::new(waiting, on_eose));
            if waiting == 0
                && let Some(latch) = &latch
            {
                replay.push(latch.arrival());
            }

            for filter in filters {
                let key = filter.canonical_key();
                match map.get_mut(&key) {
                    Some(record) if record.state != SubscriptionState::Closed => {
                        debug!("Attaching to existing subscription {}", key);
                        record.attach(id, Arc::clone(&on_event));
                        if let Some(latch) = &latch
                            && record.state == SubscriptionState::Live
                        {
                            let _ = record.on_eose(latch.arrival());
                        }
                    }
                    Some(record) => {
                        debug!("Reopening closed subscription {}", key);
                        record.state = SubscriptionState::Live;
                        record.attach(id, Arc::clone(&on_event));
                        if let Some(latch) = &latch {
                            let _ = record.on_eose(latch.arrival());
                        }
                        fresh.push(filter);
                        fresh_keys.push(key);
                    }
                    None => {
                        let mut record = SubscriptionRecord::new(filter.clone());
                        record.attach(id, Arc::clone(&on_event));
                        if let Some(latch) = &latch {
                            let _ = record.on_eose(latch.arrival());
                        }
                        map.insert(record);
                        fresh.push(filter);
                        fresh_keys.push(key);
                    }
                }
            }
        }

        for on_eose in replay {
            on_eose();
        }

        if fresh.is_empty() {
            return Ok(true);
        }

        let narrowed: Vec<Filter> = fresh
            .into_iter()
            .map(|filter| match options.since {
                Some(since) if filter.since.is_none_or(|s| s < since) => filter.since(since),
                _ => filter,
            })
            .collect();

        let relays = self.relays();
        let sub = match self.shared.transport.subscribe(&relays, narrowed).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!("Failed to open subscription: {}", e);
                self.shared.subscriptions.lock().discard(&fresh_keys);
                return Err(e);
            }
        };

        let bound = self
            .shared
            .subscriptions
            .lock()
            .attach_network(&sub.id, &fresh_keys);
        if bound == 0 {
            debug!("Subscription {} abandoned before it opened", sub.id);
            self.shared.transport.unsubscribe(&sub.id).await;
            return Ok(true);
        }

        debug!("Subscription {} serves {} filters", sub.id, bound);
        let network_id = sub.id.clone();
        let pump = tokio::spawn(self.shared.clone().pump(sub, options.close_on_eose));
        self.shared.pumps.lock().insert(network_id, pump);
        Ok(true)
    }

    /// Detach a callback everywhere; network subscriptions nobody uses are closed.
    pub async fn unsub(&self, id: CallbackId) {
        self.shared.unsub(id).await;
    }

    /// Events matching `filters`, newest first.
    ///
    /// With a store, relays are only asked for events newer than the newest stored match,
    /// and the answer comes from the store once relays report EOSE (or immediately with
    /// `db_only`). Without a store this is a one-shot network query.
    pub async fn list(&self, filters: Vec<Filter>, options: ListOptions) -> Result<Vec<Event>> {
        match self.shared.store.clone() {
            Some(store) => self.list_cached(store, filters, options).await,
            None => self.list_network(filters, options).await,
        }
    }

    async fn list_cached(
        &self,
        store: Arc<dyn EventStore>,
        filters: Vec<Filter>,
        options: ListOptions,
    ) -> Result<Vec<Event>> {
        let latest = store.latest(&filters).await?;
        let since = (latest > 0).then_some(latest);
        debug!("Listing {} filters from cursor {:?}", filters.len(), since);

        let keep = options.callback.is_some();
        let id = options.callback_id.unwrap_or_else(CallbackId::next);
        let callback = options.callback.unwrap_or_else(|| Arc::new(|_: &Event| {}));

        let (tx, rx) = oneshot::channel();
        let detach_in_background = options.db_only && !keep;
        let shared = self.shared.clone();
        let on_eose: EoseCallback = Box::new(move || {
            let _ = tx.send(());
            if detach_in_background {
                tokio::spawn(async move { shared.unsub(id).await });
            }
        });

        self.subscribe_with(
            filters.clone(),
            callback,
            SubOptions {
                on_eose: Some(on_eose),
                since,
                close_on_eose: false,
                callback_id: Some(id),
            },
        )
        .await?;

        if !options.db_only {
            let eose = rx.await;
            if !keep {
                self.unsub(id).await;
            }
            eose.map_err(|_| eose_lost())?;
        }

        let mut events = store.list(&filters).await?;
        sort_events(&mut events);
        Ok(events)
    }

    async fn list_network(&self, filters: Vec<Filter>, options: ListOptions) -> Result<Vec<Event>> {
        if let Some(callback) = options.callback {
            self.subscribe_with(
                filters.clone(),
                callback,
                SubOptions {
                    callback_id: options.callback_id,
                    ..Default::default()
                },
            )
            .await?;
        }

        // Callers asking before EOSE share one query; once a filter's backlog has been
        // delivered, joining it would return nothing, so ask the relays again.
        let collected: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let (tx, rx) = oneshot::channel();
        let id = CallbackId::next();
        let joined = self
            .attach(
                id,
                filters.clone(),
                Arc::new(move |event: &Event| sink.lock().push(event.clone())),
                SubOptions {
                    on_eose: Some(Box::new(move || {
                        let _ = tx.send(());
                    })),
                    close_on_eose: true,
                    ..Default::default()
                },
                Sharing::UntilEose,
            )
            .await?;

        let events = if joined {
            let eose = rx.await;
            self.unsub(id).await;
            eose.map_err(|_| eose_lost())?;
            std::mem::take(&mut *collected.lock())
        } else {
            self.query_network(filters).await?
        };

        let mut seen = HashSet::new();
        let mut events: Vec<Event> = events
            .into_iter()
            .filter(|event| seen.insert(event.id.clone()))
            .collect();
        sort_events(&mut events);
        Ok(events)
    }

    /// One-shot query on its own network subscription, bypassing the multiplexer.
    async fn query_network(&self, filters: Vec<Filter>) -> Result<Vec<Event>> {
        let relays = self.relays();
        let mut sub = self.shared.transport.subscribe(&relays, filters).await?;
        debug!("Running dedicated query {}", sub.id);

        let mut events = Vec::new();
        let mut finished = false;
        while let Some(message) = sub.messages.recv().await {
            match message {
                SubscriptionMessage::Event(event) => events.push(event),
                SubscriptionMessage::Eose => {
                    finished = true;
                    break;
                }
            }
        }
        self.shared.transport.unsubscribe(&sub.id).await;

        if !finished {
            return Err(eose_lost());
        }
        Ok(events)
    }

    /// The newest event matching `filters`.
    pub async fn get(&self, filters: Vec<Filter>, db_only: bool) -> Result<Option<Event>> {
        let events = self
            .list(
                filters,
                ListOptions {
                    db_only,
                    ..Default::default()
                },
            )
            .await?;
        // list is newest first
        Ok(events.into_iter().next())
    }

    /// Sign `draft` and broadcast it to every relay.
    pub async fn publish(&self, draft: &UnsignedEvent) -> Result<(Event, PublishHandle)> {
        let event = self.identity.sign(draft)?;
        self.publish_raw(event).await
    }

    /// Broadcast an already signed event to every relay.
    pub async fn publish_raw(&self, event: Event) -> Result<(Event, PublishHandle)> {
        let relays = self.relays();
        if relays.is_empty() {
            return Err(ClientError::NoRelays);
        }

        if let Some(store) = &self.shared.store {
            store.save(&event).await?;
        }

        info!("Publishing event {} to {} relays", event.id, relays.len());
        let handle = self.shared.transport.publish(&relays, &event).await?;
        Ok((event, handle))
    }

    /// Sign and publish `draft`, resolving once any relay accepts it.
    pub async fn send(&self, draft: &UnsignedEvent) -> Result<Event> {
        let event = self.identity.sign(draft)?;
        self.send_raw(event).await
    }

    /// Publish `event`, resolving once any relay accepts it.
    ///
    /// Fails with [`ClientError::PublishTimeout`] when no relay accepts within the
    /// configured window. Rejections from individual relays are only logged.
    pub async fn send_raw(&self, event: Event) -> Result<Event> {
        let (event, mut handle) = self.publish_raw(event).await?;

        let accepted = timeout(self.config.publish_timeout, async {
            while let Some(status) = handle.next().await {
                match status {
                    PublishStatus::Ok { relay } => {
                        debug!("Event {} accepted by {}", event.id, relay);
                        return true;
                    }
                    PublishStatus::Failed { relay, reason } => {
                        warn!("Event {} rejected by {}: {}", event.id, relay, reason);
                    }
                }
            }
            false
        })
        .await;

        match accepted {
            Ok(true) => Ok(event),
            Ok(false) | Err(_) => Err(ClientError::PublishTimeout(self.config.publish_timeout)),
        }
    }

    /// Register a callback for events delivered by the live watch.
    pub fn add_event_callback<F>(&self, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.event_callbacks.write().push(Arc::new(callback));
    }

    /// Watch `filters` and feed every match to the registered event callbacks.
    ///
    /// Starting again replaces the previous watch.
    pub async fn start(&self, filters: Vec<Filter>) -> Result<()> {
        self.stop().await;

        let callbacks = Arc::clone(&self.event_callbacks);
        let id = self
            .sub(
                filters,
                move |event: &Event| {
                    let callbacks = callbacks.read().clone();
                    for callback in callbacks {
                        callback(event);
                    }
                },
                SubOptions::default(),
            )
            .await?;
        *self.watch.lock() = Some(id);
        Ok(())
    }

    /// Stop the live watch.
    pub async fn stop(&self) {
        let watch = self.watch.lock().take();
        if let Some(id) = watch {
            self.unsub(id).await;
        }
    }

    /// Relays `event_id` has been received from.
    pub fn seen_on(&self, event_id: &str) -> Vec<String> {
        self.shared.transport.seen_on(event_id)
    }

    /// Close every subscription and relay.
    pub async fn close(&self) {
        self.stop().await;

        let open = self.shared.subscriptions.lock().clear();
        for network_id in open {
            self.shared.close_network(&network_id).await;
        }

        let relays = std::mem::take(&mut *self.relays.write());
        for url in relays {
            self.shared.transport.close(&url).await;
        }
        info!("Relay pool closed");
    }
}

impl Drop for RelayPool {
    fn drop(&mut self) {
        for (_, pump) in self.shared.pumps.lock().drain() {
            pump.abort();
        }
    }
}
