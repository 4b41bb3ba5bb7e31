//! Client error types

use std::time::Duration;

use arcade_nostr::Nip01Error;
use thiserror::Error;

use crate::message::MessageError;
use crate::store::StoreError;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Malformed relay message
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// No relay acknowledged a publish in time
    #[error("No relay acknowledged the event within {0:?}")]
    PublishTimeout(Duration),

    /// Not connected
    #[error("Not connected to relay")]
    NotConnected,

    /// Already connected
    #[error("Already connected to relay")]
    AlreadyConnected,

    /// No usable relays are configured
    #[error("No relays configured")]
    NoRelays,

    /// Relay information document could not be fetched or parsed
    #[error("Relay information error: {0}")]
    RelayInfo(String),

    /// Signing the outgoing event failed
    #[error("Signing error: {0}")]
    Signing(#[from] Nip01Error),

    /// Event store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Subscription error
    #[error("Subscription error: {0}")]
    Subscription(String),
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
