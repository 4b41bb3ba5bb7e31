//! Per-subscription bookkeeping for a network subscription spread over several relays.

use std::collections::{HashSet, VecDeque};

use uuid::Uuid;

use crate::message::Filter;

/// Event ids a tracker remembers unless told otherwise.
pub const DEFAULT_SEEN_LIMIT: usize = 10_000;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// Tracks which relays carry a subscription and which have finished their backlog.
#[derive(Debug, Clone)]
pub struct SubscriptionTracker {
    /// Subscription ID
    pub id: String,
    /// Filters sent in the REQ
    pub filters: Vec<Filter>,
    /// Relays that have this subscription
    pub relays: HashSet<String>,
    /// Relays that have sent EOSE
    pub eose_relays: HashSet<String>,
    /// Whether the merged EOSE has been reported to the subscriber
    eose_reported: bool,
    /// Event ids already delivered
    seen: HashSet<String>,
    /// Delivery order of `seen`, oldest first
    seen_order: VecDeque<String>,
    seen_limit: usize,
}

impl SubscriptionTracker {
    /// Create a new subscription tracker.
    pub fn new(id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            id: id.into(),
            filters,
            relays: HashSet::new(),
            eose_relays: HashSet::new(),
            eose_reported: false,
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
            seen_limit: DEFAULT_SEEN_LIMIT,
        }
    }

    /// Remember at most `limit` delivered ids; older ones are forgotten first.
    pub fn with_seen_limit(mut self, limit: usize) -> Self {
        self.seen_limit = limit.max(1);
        self
    }

    /// Add a relay to this subscription.
    pub fn add_relay(&mut self, relay_url: impl Into<String>) {
        self.relays.insert(relay_url.into());
    }

    /// Remove a relay from this subscription. A relay that is gone no longer holds up EOSE.
    pub fn remove_relay(&mut self, relay_url: &str) {
        self.relays.remove(relay_url);
        self.eose_relays.remove(relay_url);
    }

    /// Mark EOSE received from a relay.
    pub fn mark_eose(&mut self, relay_url: impl Into<String>) {
        let relay_url = relay_url.into();
        if self.relays.contains(&relay_url) {
            self.eose_relays.insert(relay_url);
        }
    }

    /// Whether every remaining relay has sent EOSE.
    pub fn all_eose(&self) -> bool {
        self.relays.iter().all(|r| self.eose_relays.contains(r))
    }

    /// Returns true exactly once: the first time EOSE should be reported.
    ///
    /// With `force`, the report happens even if some relays are still silent.
    pub fn take_eose(&mut self, force: bool) -> bool {
        if self.eose_reported || !(force || self.all_eose()) {
            return false;
        }
        self.eose_reported = true;
        true
    }

    pub fn eose_reported(&self) -> bool {
        self.eose_reported
    }

    /// Returns true the first time an event id is seen on this subscription.
    ///
    /// Only the most recent ids are remembered, so a relay replaying a long-forgotten
    /// event gets it delivered again.
    pub fn first_sighting(&mut self, event_id: &str) -> bool {
        if !self.seen.insert(event_id.to_string()) {
            return false;
        }
        self.seen_order.push_back(event_id.to_string());
        while self.seen_order.len() > self.seen_limit {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    /// Check if a relay has this subscription.
    pub fn has_relay(&self, relay_url: &str) -> bool {
        self.relays.contains(relay_url)
    }

    /// Relays that have not sent EOSE yet.
    pub fn pending_relays(&self) -> Vec<String> {
        self.relays
            .difference(&self.eose_relays)
            .cloned()
            .collect()
    }
}
