//! Bounded cache of decryption results, keyed by event id.

use std::collections::{HashMap, VecDeque};

use serde::Deserialize;

use crate::nip01::Event;

/// Configuration for the decrypt cache
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DecryptCacheConfig {
    /// Maximum number of results to keep (0 disables caching)
    pub capacity: usize,
}

impl Default for DecryptCacheConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

/// A cached decryption result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decrypted {
    /// Plaintext of a direct message
    Text(String),
    /// Verified inner event of an envelope
    Inner(Event),
}

/// LRU map from event id to [`Decrypted`].
///
/// Results are derived data: a miss only costs a second decryption.
#[derive(Debug)]
pub struct DecryptCache {
    config: DecryptCacheConfig,
    entries: HashMap<String, Decrypted>,
    /// Event ids in access order, oldest first
    lru_queue: VecDeque<String>,
}

impl DecryptCache {
    pub fn new() -> Self {
        Self::with_config(DecryptCacheConfig::default())
    }

    pub fn with_config(config: DecryptCacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            lru_queue: VecDeque::new(),
        }
    }

    /// Look up a result, marking it most recently used.
    pub fn get(&mut self, event_id: &str) -> Option<Decrypted> {
        let value = self.entries.get(event_id)?.clone();
        self.touch(event_id);
        Some(value)
    }

    /// Store a result, evicting the least recently used entry when full.
    pub fn insert(&mut self, event_id: impl Into<String>, value: Decrypted) {
        if self.config.capacity == 0 {
            return;
        }

        let event_id = event_id.into();
        if self.entries.insert(event_id.clone(), value).is_some() {
            self.touch(&event_id);
            return;
        }

        self.lru_queue.push_back(event_id);
        while self.entries.len() > self.config.capacity {
            let Some(oldest) = self.lru_queue.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn touch(&mut self, event_id: &str) {
        if let Some(pos) = self.lru_queue.iter().position(|id| id == event_id) {
            if let Some(id) = self.lru_queue.remove(pos) {
                self.lru_queue.push_back(id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.lru_queue.clear();
    }
}

impl Default for DecryptCache {
    fn default() -> Self {
        Self::new()
    }
}
