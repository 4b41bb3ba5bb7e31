//! Shared fixtures: an in-process relay and a scriptable transport.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use arcade_nostr::{Event, Identity, UnsignedEvent};
use arcade_nostr_client::{
    ClientError, Filter, NetworkSubscription, PublishHandle, PublishStatus, Result,
    SubscriptionMessage, Transport, matches_any,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub fn note(identity: &Identity, content: &str, created_at: u64) -> Event {
    identity
        .sign(&UnsignedEvent::new(1, content).created_at(created_at))
        .unwrap()
}

struct MockState {
    events: Mutex<Vec<Event>>,
    reqs: AtomicUsize,
    ack: AtomicBool,
    supported_nips: Vec<u16>,
    connections: Mutex<Vec<JoinHandle<()>>>,
}

/// Minimal relay: stores published events, answers REQ from storage followed by EOSE,
/// and serves a NIP-11 document to plain HTTP requests on the same port.
pub struct MockRelay {
    pub url: String,
    state: Arc<MockState>,
    accept: JoinHandle<()>,
}

impl MockRelay {
    pub async fn start(supported_nips: Vec<u16>) -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let state = Arc::new(MockState {
            events: Mutex::new(Vec::new()),
            reqs: AtomicUsize::new(0),
            ack: AtomicBool::new(true),
            supported_nips,
            connections: Mutex::new(Vec::new()),
        });

        let accept_state = Arc::clone(&state);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                let handle = tokio::spawn(async move {
                    if is_websocket(&stream).await {
                        serve_websocket(stream, state).await;
                    } else {
                        serve_information(stream, state).await;
                    }
                });
                accept_state.connections.lock().push(handle);
            }
        });

        Self { url, state, accept }
    }

    pub fn preload(&self, events: impl IntoIterator<Item = Event>) {
        self.state.events.lock().extend(events);
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.events.lock().clone()
    }

    pub fn req_count(&self) -> usize {
        self.state.reqs.load(Ordering::SeqCst)
    }

    /// Stop answering EVENT with OK.
    pub fn mute_acks(&self) {
        self.state.ack.store(false, Ordering::SeqCst);
    }

    /// Drop every open connection; the listener keeps accepting.
    pub fn kick(&self) {
        for handle in self.state.connections.lock().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for MockRelay {
    fn drop(&mut self) {
        self.accept.abort();
        self.kick();
    }
}

async fn is_websocket(stream: &TcpStream) -> bool {
    let mut buf = [0u8; 2048];
    for _ in 0..100 {
        let Ok(n) = stream.peek(&mut buf).await else {
            return false;
        };
        let head = String::from_utf8_lossy(&buf[..n]).to_ascii_lowercase();
        if head.contains("\r\n\r\n") || n == buf.len() {
            return head.contains("upgrade: websocket");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

async fn serve_information(mut stream: TcpStream, state: Arc<MockState>) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !String::from_utf8_lossy(&request).contains("\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }

    let body = json!({
        "name": "mock relay",
        "supported_nips": state.supported_nips,
        "software": "mock",
    })
    .to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/nostr+json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn serve_websocket(stream: TcpStream, state: Arc<MockState>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();

    while let Some(Ok(frame)) = source.next().await {
        let Message::Text(text) = frame else {
            continue;
        };
        let Ok(Value::Array(message)) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };

        let mut replies = Vec::new();
        match message.first().and_then(Value::as_str) {
            Some("EVENT") => {
                let Some(Ok(event)) = message.get(1).cloned().map(serde_json::from_value::<Event>)
                else {
                    continue;
                };
                state.events.lock().push(event.clone());
                if state.ack.load(Ordering::SeqCst) {
                    replies.push(json!(["OK", event.id, true, ""]));
                }
            }
            Some("REQ") => {
                state.reqs.fetch_add(1, Ordering::SeqCst);
                let sub_id = message.get(1).and_then(Value::as_str).unwrap_or_default();
                let filters: Vec<Filter> = message
                    .iter()
                    .skip(2)
                    .filter_map(|f| serde_json::from_value(f.clone()).ok())
                    .collect();
                for event in state.events.lock().iter() {
                    if matches_any(&filters, event) {
                        replies.push(json!(["EVENT", sub_id, event]));
                    }
                }
                replies.push(json!(["EOSE", sub_id]));
            }
            _ => {}
        }

        for reply in replies {
            if sink.send(Message::text(reply.to_string())).await.is_err() {
                return;
            }
        }
    }
}

/// Transport whose subscriptions the test drives by hand.
#[derive(Default)]
pub struct FakeTransport {
    pub subscribed: Mutex<Vec<(String, Vec<Filter>)>>,
    pub unsubscribed: Mutex<Vec<String>>,
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<SubscriptionMessage>>>,
    publishes: Mutex<Vec<mpsc::UnboundedSender<PublishStatus>>>,
    next_id: AtomicUsize,
    /// Acknowledge publishes from the first relay
    pub ack: AtomicBool,
    /// Reject subscribe calls, after `subscribe_delay` if set
    pub refuse_subscribe: AtomicBool,
    pub subscribe_delay: Mutex<Option<Duration>>,
}

impl FakeTransport {
    pub fn subscribe_count(&self) -> usize {
        self.subscribed.lock().len()
    }

    pub fn last_subscription(&self) -> Option<(String, Vec<Filter>)> {
        self.subscribed.lock().last().cloned()
    }

    pub fn feed(&self, network_id: &str, message: SubscriptionMessage) {
        if let Some(tx) = self.senders.lock().get(network_id) {
            let _ = tx.send(message);
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, url: &str) -> Result<()> {
        if url.contains("down") {
            return Err(ClientError::Connection(format!("{} refused", url)));
        }
        Ok(())
    }

    async fn close(&self, _url: &str) {}

    async fn subscribe(
        &self,
        _relays: &[String],
        filters: Vec<Filter>,
    ) -> Result<NetworkSubscription> {
        let delay = *self.subscribe_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.refuse_subscribe.load(Ordering::SeqCst) {
            return Err(ClientError::Connection("subscribe refused".to_string()));
        }

        let id = format!("net{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().insert(id.clone(), tx);
        self.subscribed.lock().push((id.clone(), filters));
        Ok(NetworkSubscription { id, messages: rx })
    }

    async fn unsubscribe(&self, id: &str) {
        self.senders.lock().remove(id);
        self.unsubscribed.lock().push(id.to_string());
    }

    async fn publish(&self, relays: &[String], _event: &Event) -> Result<PublishHandle> {
        let (tx, handle) = PublishHandle::channel();
        if self.ack.load(Ordering::SeqCst)
            && let Some(relay) = relays.first()
        {
            let _ = tx.send(PublishStatus::Ok {
                relay: relay.clone(),
            });
        }
        self.publishes.lock().push(tx);
        Ok(handle)
    }

    fn seen_on(&self, _event_id: &str) -> Vec<String> {
        Vec::new()
    }
}
