//! Subscription multiplexer.
//!
//! Callers that ask for the same filter share one network subscription. Each distinct
//! filter, identified by [`Filter::canonical_key`], owns a [`SubscriptionRecord`] holding
//! every attached callback. One network subscription may serve several records when
//! they were requested together.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use arcade_nostr::Event;
use parking_lot::Mutex;

use crate::message::Filter;

/// Callback invoked for every event delivered to a subscription.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Callback invoked once stored events are exhausted.
pub type EoseCallback = Box<dyn FnOnce() + Send>;

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an attached callback.
///
/// Attaching twice under the same id replaces rather than duplicates, and detaching by id
/// removes the callback from every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl CallbackId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        Self(NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Open, stored events still arriving
    Live,
    /// Open, EOSE observed
    Stored,
    /// Network subscription torn down; callbacks stay until detached
    Closed,
}

/// One distinct filter and everyone listening to it.
pub struct SubscriptionRecord {
    pub key: String,
    pub filter: Filter,
    pub network_id: Option<String>,
    pub state: SubscriptionState,
    callbacks: HashMap<CallbackId, EventCallback>,
    pending_eose: Vec<EoseCallback>,
    /// `created_at` of the newest event delivered
    pub last_hit: Option<u64>,
}

impl SubscriptionRecord {
    pub fn new(filter: Filter) -> Self {
        Self {
            key: filter.canonical_key(),
            filter,
            network_id: None,
            state: SubscriptionState::Live,
            callbacks: HashMap::new(),
            pending_eose: Vec::new(),
            last_hit: None,
        }
    }

    pub fn attach(&mut self, id: CallbackId, callback: EventCallback) {
        self.callbacks.insert(id, callback);
    }

    /// Remove a callback. Returns true if it was attached.
    pub fn detach(&mut self, id: CallbackId) -> bool {
        self.callbacks.remove(&id).is_some()
    }

    pub fn has_callback(&self, id: CallbackId) -> bool {
        self.callbacks.contains_key(&id)
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Run `on_eose` when this record sees EOSE, or hand it back if it already has.
    pub fn on_eose(&mut self, on_eose: EoseCallback) -> Option<EoseCallback> {
        match self.state {
            SubscriptionState::Live => {
                self.pending_eose.push(on_eose);
                None
            }
            SubscriptionState::Stored | SubscriptionState::Closed => Some(on_eose),
        }
    }
}

impl std::fmt::Debug for SubscriptionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRecord")
            .field("key", &self.key)
            .field("network_id", &self.network_id)
            .field("state", &self.state)
            .field("callbacks", &self.callbacks.len())
            .field("pending_eose", &self.pending_eose.len())
            .field("last_hit", &self.last_hit)
            .finish()
    }
}

/// Canonical filter key → record, plus the reverse index from network subscription id.
#[derive(Debug, Default)]
pub struct SubscriptionMap {
    records: HashMap<String, SubscriptionRecord>,
    by_network: HashMap<String, Vec<String>>,
}

impl SubscriptionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&SubscriptionRecord> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut SubscriptionRecord> {
        self.records.get_mut(key)
    }

    pub fn insert(&mut self, record: SubscriptionRecord) {
        if let Some(network_id) = &record.network_id {
            self.by_network
                .entry(network_id.clone())
                .or_default()
                .push(record.key.clone());
        }
        self.records.insert(record.key.clone(), record);
    }

    /// Bind records to the network subscription serving them.
    ///
    /// Returns how many of `keys` still existed; zero means everyone detached while the
    /// subscription was being opened.
    pub fn attach_network(&mut self, network_id: &str, keys: &[String]) -> usize {
        let mut bound = Vec::new();
        for key in keys {
            if let Some(record) = self.records.get_mut(key)
                && record.network_id.is_none()
            {
                record.network_id = Some(network_id.to_string());
                bound.push(key.clone());
            }
        }
        let count = bound.len();
        if count > 0 {
            self.by_network.insert(network_id.to_string(), bound);
        }
        count
    }

    /// Drop records that never got a network subscription.
    pub fn discard(&mut self, keys: &[String]) {
        for key in keys {
            if self
                .records
                .get(key)
                .is_some_and(|record| record.network_id.is_none())
            {
                self.records.remove(key);
            }
        }
    }

    pub fn network_ids(&self) -> Vec<String> {
        self.by_network.keys().cloned().collect()
    }

    /// Callbacks interested in `event` on network subscription `network_id`.
    ///
    /// A callback attached to several matching records is returned once.
    pub fn route(&mut self, network_id: &str, event: &Event) -> Vec<EventCallback> {
        let Some(keys) = self.by_network.get(network_id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut callbacks = Vec::new();
        for key in keys {
            let Some(record) = self.records.get_mut(key) else {
                continue;
            };
            if !record.filter.matches(event) {
                continue;
            }
            record.last_hit = record.last_hit.max(Some(event.created_at));
            for (id, callback) in &record.callbacks {
                if seen.insert(*id) {
                    callbacks.push(Arc::clone(callback));
                }
            }
        }
        callbacks
    }

    /// Move every record on `network_id` from live to stored, returning the waiting EOSE
    /// callbacks.
    pub fn mark_stored(&mut self, network_id: &str) -> Vec<EoseCallback> {
        let mut ready = Vec::new();
        for key in self.by_network.get(network_id).into_iter().flatten() {
            if let Some(record) = self.records.get_mut(key) {
                if record.state == SubscriptionState::Live {
                    record.state = SubscriptionState::Stored;
                }
                ready.append(&mut record.pending_eose);
            }
        }
        ready
    }

    /// Mark every record on `network_id` closed and forget the network subscription.
    pub fn close_network(&mut self, network_id: &str) {
        for key in self.by_network.remove(network_id).into_iter().flatten() {
            if let Some(record) = self.records.get_mut(&key) {
                record.state = SubscriptionState::Closed;
                record.network_id = None;
            }
        }
    }

    /// Remove `id` from every record. Records left without callbacks are discarded.
    ///
    /// Returns the network subscriptions that no longer serve any record.
    pub fn detach(&mut self, id: CallbackId) -> Vec<String> {
        let mut emptied = Vec::new();
        self.records.retain(|key, record| {
            record.detach(id);
            if record.callbacks.is_empty() {
                emptied.push((key.clone(), record.network_id.clone()));
                false
            } else {
                true
            }
        });

        let mut idle = Vec::new();
        for (key, network_id) in emptied {
            let Some(network_id) = network_id else {
                continue;
            };
            if let Some(keys) = self.by_network.get_mut(&network_id) {
                keys.retain(|k| k != &key);
                if keys.is_empty() {
                    self.by_network.remove(&network_id);
                    idle.push(network_id);
                }
            }
        }
        idle
    }

    /// Remove everything, returning the network subscriptions that were open.
    pub fn clear(&mut self) -> Vec<String> {
        self.records.clear();
        self.by_network.drain().map(|(id, _)| id).collect()
    }
}

/// Fires a wrapped callback after `count` arrivals.
///
/// Used when one `sub` call spans several records and the caller wants a single EOSE.
pub struct EoseLatch {
    remaining: AtomicUsize,
    callback: Mutex<Option<EoseCallback>>,
}

impl EoseLatch {
    pub fn new(count: usize, callback: EoseCallback) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(count),
            callback: Mutex::new(Some(callback)),
        })
    }

    /// Count one arrival; the last one runs the callback.
    pub fn arrive(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let callback = self.callback.lock().take();
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    /// An [`EoseCallback`] that arrives at this latch.
    pub fn arrival(self: &Arc<Self>) -> EoseCallback {
        let latch = Arc::clone(self);
        Box::new(move || latch.arrive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn test_event(id: &str, kind: u16, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "pubkey1".to_string(),
            created_at,
            kind,
            tags: vec![],
            content: "test".to_string(),
            sig: "sig".to_string(),
        }
    }

    fn counter() -> (Arc<AtomicUsize>, EventCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (
            count,
            Arc::new(move |_: &Event| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    fn live_record(filter: Filter, id: CallbackId, callback: EventCallback) -> SubscriptionRecord {
        let mut record = SubscriptionRecord::new(filter);
        record.attach(id, callback);
        record
    }

    #[test]
    fn test_callback_ids_are_unique() {
        assert_ne!(CallbackId::next(), CallbackId::next());
    }

    #[test]
    fn test_route_dedups_callbacks_across_records() {
        let mut map = SubscriptionMap::new();
        let (count, callback) = counter();
        let id = CallbackId::next();

        let notes = live_record(Filter::new().kinds(vec![1]), id, Arc::clone(&callback));
        let by_author = live_record(Filter::new().authors(vec!["pubkey1".into()]), id, callback);
        let keys = vec![notes.key.clone(), by_author.key.clone()];
        map.insert(notes);
        map.insert(by_author);
        assert_eq!(map.attach_network("net1", &keys), 2);

        for cb in map.route("net1", &test_event("e1", 1, 42)) {
            cb(&test_event("e1", 1, 42));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(map.get(&keys[0]).unwrap().last_hit, Some(42));

        // Only the author filter matches a kind 7
        assert_eq!(map.route("net1", &test_event("e2", 7, 50)).len(), 1);
        assert_eq!(map.get(&keys[0]).unwrap().last_hit, Some(42));
        assert!(map.route("other", &test_event("e3", 1, 1)).is_empty());
    }

    #[test]
    fn test_eose_state_transitions() {
        let mut map = SubscriptionMap::new();
        let (_, callback) = counter();
        let mut record = live_record(Filter::new().kinds(vec![1]), CallbackId::next(), callback);
        let key = record.key.clone();

        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        assert!(record.on_eose(Box::new(move || f.store(true, Ordering::SeqCst))).is_none());
        map.insert(record);
        map.attach_network("net1", std::slice::from_ref(&key));

        for cb in map.mark_stored("net1") {
            cb();
        }
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(map.get(&key).unwrap().state, SubscriptionState::Stored);

        // Late arrivals get their callback back for immediate replay
        let late = map.get_mut(&key).unwrap().on_eose(Box::new(|| {}));
        assert!(late.is_some());

        map.close_network("net1");
        let record = map.get(&key).unwrap();
        assert_eq!(record.state, SubscriptionState::Closed);
        assert_eq!(record.network_id, None);
        assert!(map.network_ids().is_empty());
    }

    #[test]
    fn test_detach_closes_network_only_when_last_record_goes() {
        let mut map = SubscriptionMap::new();
        let first = CallbackId::next();
        let second = CallbackId::next();
        let (_, callback) = counter();

        let mut shared = live_record(Filter::new().kinds(vec![1]), first, Arc::clone(&callback));
        shared.attach(second, Arc::clone(&callback));
        let other = live_record(Filter::new().kinds(vec![4]), second, callback);
        let keys = vec![shared.key.clone(), other.key.clone()];
        map.insert(shared);
        map.insert(other);
        map.attach_network("net1", &keys);

        assert!(map.detach(first).is_empty());
        assert_eq!(map.len(), 2);

        assert_eq!(map.detach(second), vec!["net1".to_string()]);
        assert!(map.is_empty());
        assert!(map.network_ids().is_empty());
    }

    #[test]
    fn test_attach_network_after_everyone_left() {
        let mut map = SubscriptionMap::new();
        let id = CallbackId::next();
        let (_, callback) = counter();
        let record = live_record(Filter::new().kinds(vec![1]), id, callback);
        let key = record.key.clone();
        map.insert(record);

        assert!(map.detach(id).is_empty());
        assert_eq!(map.attach_network("net1", &[key]), 0);
        assert!(map.network_ids().is_empty());
    }

    #[test]
    fn test_discard_keeps_bound_records() {
        let mut map = SubscriptionMap::new();
        let (_, callback) = counter();
        let bound = live_record(Filter::new().kinds(vec![1]), CallbackId::next(), Arc::clone(&callback));
        let unbound = live_record(Filter::new().kinds(vec![2]), CallbackId::next(), callback);
        let bound_key = bound.key.clone();
        let unbound_key = unbound.key.clone();
        map.insert(bound);
        map.insert(unbound);
        map.attach_network("net1", std::slice::from_ref(&bound_key));

        map.discard(&[bound_key.clone(), unbound_key.clone()]);
        assert!(map.get(&bound_key).is_some());
        assert!(map.get(&unbound_key).is_none());
    }

    #[test]
    fn test_eose_latch() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let latch = EoseLatch::new(
            2,
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (latch.arrival())();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        (latch.arrival())();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
