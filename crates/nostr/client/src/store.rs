//! Event-store collaborator contract.
//!
//! The pool mirrors everything it receives or publishes into an [`EventStore`] and
//! answers `list` from it. Persistence engines live outside this crate; [`MemoryStore`]
//! is the in-process implementation.

use std::collections::HashMap;

use arcade_nostr::{Event, sort_events};
use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::message::{Filter, matches_any};

/// Errors reported by an event store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store is closed")]
    Closed,
}

/// Persistence used by the relay pool.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// All stored events matching any of `filters`.
    async fn list(&self, filters: &[Filter]) -> Result<Vec<Event>, StoreError>;

    /// Greatest `created_at` among stored matches, or 0 when there are none.
    async fn latest(&self, filters: &[Filter]) -> Result<u64, StoreError>;

    /// Insert or replace by event id.
    async fn save(&self, event: &Event) -> Result<(), StoreError>;
}

/// Id-keyed in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    events: RwLock<HashMap<String, Event>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn list(&self, filters: &[Filter]) -> Result<Vec<Event>, StoreError> {
        let mut events: Vec<Event> = self
            .events
            .read()
            .values()
            .filter(|event| matches_any(filters, event))
            .cloned()
            .collect();
        sort_events(&mut events);
        Ok(events)
    }

    async fn latest(&self, filters: &[Filter]) -> Result<u64, StoreError> {
        Ok(self
            .events
            .read()
            .values()
            .filter(|event| matches_any(filters, event))
            .map(|event| event.created_at)
            .max()
            .unwrap_or(0))
    }

    async fn save(&self, event: &Event) -> Result<(), StoreError> {
        self.events.write().insert(event.id.clone(), event.clone());
        Ok(())
    }
}
