//! Relay pool and subscription multiplexer for Nostr clients.
//!
//! This crate provides:
//! - WebSocket connections to Nostr relays (NIP-01 relay protocol)
//! - A pool that shares one network subscription among every caller asking for the
//!   same filter
//! - Store-backed listing that only fetches events newer than what is cached
//! - Publishing with per-relay acknowledgements and a bounded wait for the first one
//! - Relay capability checks via NIP-11 information documents
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use arcade_nostr::{Identity, UnsignedEvent};
//! use arcade_nostr_client::{
//!     DEFAULT_RELAYS, Filter, ListOptions, MemoryStore, PoolConfig, RelayPool,
//!     WebSocketTransport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), arcade_nostr_client::ClientError> {
//!     let transport = Arc::new(WebSocketTransport::new(PoolConfig::default()));
//!     let pool = RelayPool::new(Arc::new(Identity::generate()), transport)
//!         .with_store(Arc::new(MemoryStore::new()));
//!
//!     let relays: Vec<String> = DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect();
//!     pool.configure_and_validate_relays(&relays, &[1, 11]).await;
//!
//!     let notes = pool
//!         .list(vec![Filter::new().kinds(vec![1]).limit(10)], ListOptions::default())
//!         .await?;
//!     println!("{} notes", notes.len());
//!
//!     pool.send(&UnsignedEvent::new(1, "hello")).await?;
//!     pool.close().await;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod message;
mod multiplexer;
mod pool;
mod relay;
mod relay_info;
mod store;
mod subscription;
mod transport;

pub use config::{PoolConfig, RelayConfig};
pub use error::{ClientError, Result};
pub use message::{ClientMessage, Filter, MessageError, RelayMessage, matches_any};
pub use multiplexer::{
    CallbackId, EoseCallback, EoseLatch, EventCallback, SubscriptionMap, SubscriptionRecord,
    SubscriptionState,
};
pub use pool::{ListOptions, RelayPool, SubOptions};
pub use relay::{ConnectionState, RelayConnection, RelayEvent};
pub use relay_info::{
    HttpInfoFetcher, Limitation, RelayInfoFetcher, RelayInformation, fetch_relay_information,
    information_url, partition_relays,
};
pub use store::{EventStore, MemoryStore, StoreError};
pub use subscription::{DEFAULT_SEEN_LIMIT, SubscriptionTracker, generate_subscription_id};
pub use transport::{
    NetworkSubscription, PublishHandle, PublishStatus, SubscriptionMessage, Transport,
    WebSocketTransport,
};

/// Default relays.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://nostr.wine",
];
