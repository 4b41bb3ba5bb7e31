//! Single relay WebSocket connection.
//!
//! A connected relay runs two background tasks: a writer draining an outgoing queue into
//! the socket, and a reader that parses every frame into a [`RelayMessage`] and forwards
//! it, tagged with the relay URL, to the owner's channel. When the socket ends without
//! [`RelayConnection::close`] having been called, the reader reports
//! [`RelayEvent::Disconnected`].

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RelayConfig;
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Disconnected
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and ready
    Connected,
}

/// Notifications a relay connection sends to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// A parsed protocol message
    Message { relay: String, message: RelayMessage },
    /// The socket ended without the owner closing it
    Disconnected { relay: String },
}

/// Relay connection
pub struct RelayConnection {
    /// Relay URL exactly as the owner named it; used to tag notifications
    address: String,
    /// Parsed relay URL
    url: Url,
    /// Configuration
    config: RelayConfig,
    /// Connection state
    state: Arc<RwLock<ConnectionState>>,
    /// Outgoing frame queue, present while connected
    outgoing: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    /// Reader and writer task handles
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Owner channel
    events: mpsc::UnboundedSender<RelayEvent>,
}

impl RelayConnection {
    /// Create a new relay connection (does not connect yet)
    pub fn new(url: &str, events: mpsc::UnboundedSender<RelayEvent>) -> Result<Self> {
        Self::with_config(url, RelayConfig::default(), events)
    }

    /// Create a new relay connection with custom config
    pub fn with_config(
        url: &str,
        config: RelayConfig,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Result<Self> {
        let address = url.to_string();
        let url = Url::parse(url)?;

        // Validate WebSocket URL
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        Ok(Self {
            address,
            url,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The URL string this connection was created with.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect to the relay
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != ConnectionState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }

        info!("Connecting to relay: {}", self.url);

        let ws_stream = match timeout(self.config.connect_timeout, connect_async(self.url.as_str()))
            .await
        {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                *self.state.write() = ConnectionState::Disconnected;
                return Err(ClientError::WebSocket(e.to_string()));
            }
            Err(_) => {
                *self.state.write() = ConnectionState::Disconnected;
                return Err(ClientError::Timeout(format!(
                    "Connection timeout after {:?}",
                    self.config.connect_timeout
                )));
            }
        };

        let (mut sink, mut stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        let writer_url = self.address.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let closing = matches!(frame, Message::Close(_));
                if let Err(e) = sink.send(frame).await {
                    debug!("Write to {} failed: {}", writer_url, e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // Published before the reader can tear it down.
        *self.outgoing.lock() = Some(out_tx.clone());
        *self.state.write() = ConnectionState::Connected;

        let reader_url = self.address.clone();
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let outgoing = Arc::clone(&self.outgoing);
        let pong_tx = out_tx;
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match RelayMessage::from_json(text.as_str()) {
                        Ok(message) => {
                            let event = RelayEvent::Message {
                                relay: reader_url.clone(),
                                message,
                            };
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("Ignoring malformed message from {}: {}", reader_url, e),
                    },
                    Ok(Message::Ping(data)) => {
                        let _ = pong_tx.send(Message::Pong(data));
                    }
                    Ok(Message::Close(_)) => {
                        info!("Relay {} closed connection", reader_url);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error from {}: {}", reader_url, e);
                        break;
                    }
                }
            }

            // Dropping the queue stops the writer and fails later sends.
            outgoing.lock().take();
            *state.write() = ConnectionState::Disconnected;
            let _ = events.send(RelayEvent::Disconnected { relay: reader_url });
        });

        {
            let mut tasks = self.tasks.lock();
            for task in tasks.drain(..) {
                task.abort();
            }
            tasks.push(reader);
            tasks.push(writer);
        }

        info!("Connected to relay: {}", self.url);
        Ok(())
    }

    /// Queue a protocol message for the relay.
    pub fn send(&self, message: &ClientMessage) -> Result<()> {
        let text = message.to_json()?;
        debug!("Sending to {}: {}", self.url, text);

        let outgoing = self.outgoing.lock();
        let tx = outgoing.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(Message::text(text))
            .map_err(|_| ClientError::NotConnected)
    }

    /// Close the connection without reporting a disconnect.
    pub fn close(&self) {
        let mut tasks = self.tasks.lock();
        // The reader goes first so the owner never hears about this close.
        if let Some(reader) = tasks.first() {
            reader.abort();
        }

        if let Some(tx) = self.outgoing.lock().take() {
            let _ = tx.send(Message::Close(None));
        }
        // The writer exits on its own after flushing the close frame.
        tasks.clear();

        let mut state = self.state.write();
        if *state != ConnectionState::Disconnected {
            info!("Disconnected from relay: {}", self.url);
        }
        *state = ConnectionState::Disconnected;
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
