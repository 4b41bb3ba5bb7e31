//! NIP-11: Relay Information Document
//!
//! Relays describe themselves over plain HTTP at their WebSocket URL when asked with
//! `Accept: application/nostr+json`. The pool only uses `supported_nips`, to keep relays
//! that lack a required capability out of the active set.

use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::error::{ClientError, Result};

/// NIP-11 Relay Information Document
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RelayInformation {
    /// Relay name
    #[serde(default)]
    pub name: Option<String>,

    /// Detailed description
    #[serde(default)]
    pub description: Option<String>,

    /// Administrative contact pubkey (hex)
    #[serde(default)]
    pub pubkey: Option<String>,

    /// Administrative contact (URI: mailto:, https:, etc.)
    #[serde(default)]
    pub contact: Option<String>,

    /// List of supported NIP numbers
    #[serde(default)]
    pub supported_nips: Vec<u16>,

    /// Relay software URL
    #[serde(default)]
    pub software: Option<String>,

    /// Software version
    #[serde(default)]
    pub version: Option<String>,

    /// Server limitations
    #[serde(default)]
    pub limitation: Option<Limitation>,
}

/// Server limitations
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Limitation {
    /// Maximum active subscriptions per connection
    #[serde(default)]
    pub max_subscriptions: Option<usize>,

    /// Maximum limit value in filters
    #[serde(default)]
    pub max_limit: Option<usize>,

    /// Authentication required (NIP-42)
    #[serde(default)]
    pub auth_required: Option<bool>,

    /// Payment required
    #[serde(default)]
    pub payment_required: Option<bool>,
}

impl RelayInformation {
    /// Whether every NIP in `required` is advertised.
    pub fn supports_all(&self, required: &[u16]) -> bool {
        required.iter().all(|nip| self.supported_nips.contains(nip))
    }
}

/// HTTP URL of a relay's information document: `ws:` becomes `http:`, `wss:` `https:`.
pub fn information_url(relay_url: &str) -> Result<Url> {
    let mut url = Url::parse(relay_url)?;
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        other => {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                other
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::InvalidUrl(relay_url.to_string()))?;
    Ok(url)
}

/// Fetch the information document for one relay.
pub async fn fetch_relay_information(
    client: &reqwest::Client,
    relay_url: &str,
) -> Result<RelayInformation> {
    let url = information_url(relay_url)?;
    debug!("Fetching relay information from {}", url);

    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, "application/nostr+json")
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| ClientError::RelayInfo(e.to_string()))?;

    response
        .json::<RelayInformation>()
        .await
        .map_err(|e| ClientError::RelayInfo(e.to_string()))
}

/// Source of relay information documents.
#[async_trait]
pub trait RelayInfoFetcher: Send + Sync {
    async fn fetch(&self, relay_url: &str) -> Result<RelayInformation>;
}

/// Fetches documents over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpInfoFetcher {
    client: reqwest::Client,
}

impl HttpInfoFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RelayInfoFetcher for HttpInfoFetcher {
    async fn fetch(&self, relay_url: &str) -> Result<RelayInformation> {
        fetch_relay_information(&self.client, relay_url).await
    }
}

/// Split relays into `(supported, unsupported)` by required NIPs.
///
/// All documents are fetched concurrently. A relay whose document cannot be fetched or
/// parsed counts as unsupported. Input order is preserved within each half.
pub async fn partition_relays(
    urls: &[String],
    required_nips: &[u16],
    fetcher: &dyn RelayInfoFetcher,
) -> (Vec<String>, Vec<String>) {
    let results = join_all(urls.iter().map(|url| fetcher.fetch(url))).await;

    let mut supported = Vec::new();
    let mut unsupported = Vec::new();
    for (url, result) in urls.iter().zip(results) {
        match result {
            Ok(info) if info.supports_all(required_nips) => supported.push(url.clone()),
            Ok(info) => {
                warn!(
                    "Relay {} lacks required NIPs {:?} (supports {:?})",
                    url, required_nips, info.supported_nips
                );
                unsupported.push(url.clone());
            }
            Err(e) => {
                warn!("Relay {} information unavailable: {}", url, e);
                unsupported.push(url.clone());
            }
        }
    }
    (supported, unsupported)
}
