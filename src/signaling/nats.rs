use async_nats::{Client, ConnectErrorKind};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::messages::{InboundFrame, OutboundFrame, RelayReply};
use super::relay::{LinkEvent, RelayConnector, RelayLink, RelaySender, LINK_CHANNEL_CAPACITY};
use crate::config::SignalingConfig;
use crate::error::TransportError;

/// Relay reached through a NATS server
///
/// Subjects: `<prefix>.room.<room>.join` and `.signal` are request/response
/// capable, `.leave` is published, `.events` carries the fan-out for the room.
/// `<room>` is the room id escaped by `subject_token`.
pub struct NatsRelay {
    url: String,
    prefix: String,
    connect_timeout: Duration,
}

impl NatsRelay {
    pub fn new(config: &SignalingConfig) -> Self {
        Self {
            url: config.nats_url.clone(),
            prefix: config.subject_prefix.clone(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

fn room_subject(prefix: &str, room_id: &str, leaf: &str) -> String {
    format!("{}.room.{}.{}", prefix, subject_token(room_id), leaf)
}

/// Escape an opaque room id into a single subject token
///
/// ASCII letters, digits, `-` and `_` pass through; every other byte becomes
/// `~XX` (uppercase hex), so dots, wildcards and whitespace never reach the
/// subject. An empty id maps to `~`.
fn subject_token(room_id: &str) -> String {
    if room_id.is_empty() {
        return "~".to_string();
    }
    let mut token = String::with_capacity(room_id.len());
    for byte in room_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            token.push(char::from(byte));
        } else {
            let _ = write!(token, "~{:02X}", byte);
        }
    }
    token
}

#[async_trait]
impl RelayConnector for NatsRelay {
    async fn connect(&self, identity: &str) -> Result<RelayLink, TransportError> {
        info!("Connecting to NATS relay at {}", self.url);

        let (tx, inbound) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        let lost_tx = tx.clone();

        let client = async_nats::ConnectOptions::with_token(identity.to_string())
            .connection_timeout(self.connect_timeout)
            .event_callback(move |event| {
                let lost_tx = lost_tx.clone();
                async move {
                    match event {
                        async_nats::Event::Disconnected => {
                            let _ = lost_tx
                                .send(LinkEvent::Closed("NATS connection lost".to_string()))
                                .await;
                        }
                        other => debug!("NATS event: {}", other),
                    }
                }
            })
            .connect(self.url.as_str())
            .await
            .map_err(|e| match e.kind() {
                ConnectErrorKind::Authentication | ConnectErrorKind::AuthorizationViolation => {
                    TransportError::Auth(e.to_string())
                }
                ConnectErrorKind::TimedOut => TransportError::Timeout(self.connect_timeout),
                _ => TransportError::Socket(e.to_string()),
            })?;

        info!("Connected to NATS relay successfully");

        Ok(RelayLink {
            sender: Arc::new(NatsSender {
                client,
                prefix: self.prefix.clone(),
                tx,
                watches: Mutex::new(HashMap::new()),
            }),
            inbound,
        })
    }

    fn name(&self) -> &str {
        "nats"
    }
}

struct NatsSender {
    client: Client,
    prefix: String,
    tx: mpsc::Sender<LinkEvent>,
    /// Forwarding task per watched room
    watches: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl NatsSender {
    fn subject_for(&self, frame: &OutboundFrame) -> String {
        room_subject(&self.prefix, frame.room_id(), frame.subject_leaf())
    }
}

#[async_trait]
impl RelaySender for NatsSender {
    async fn publish(&self, frame: &OutboundFrame) -> Result<(), TransportError> {
        let subject = self.subject_for(frame);
        let payload = serde_json::to_vec(frame)?;

        self.client
            .publish(subject, payload.into())
            .await
            .map_err(|e| TransportError::Socket(e.to_string()))
    }

    async fn request(
        &self,
        frame: &OutboundFrame,
        timeout: Duration,
    ) -> Result<RelayReply, TransportError> {
        let subject = self.subject_for(frame);
        let payload = serde_json::to_vec(frame)?;

        let message = tokio::time::timeout(timeout, self.client.request(subject, payload.into()))
            .await
            .map_err(|_| TransportError::AckTimeout(timeout))?
            .map_err(|e| TransportError::Socket(e.to_string()))?;

        Ok(serde_json::from_slice(&message.payload)?)
    }

    async fn watch_room(&self, room_id: &str) -> Result<(), TransportError> {
        let subject = room_subject(&self.prefix, room_id, "events");

        let mut subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| TransportError::Socket(e.to_string()))?;

        info!("Subscribed to {}", subject);

        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                match serde_json::from_slice::<InboundFrame>(&message.payload) {
                    Ok(frame) => {
                        if tx.send(LinkEvent::Frame(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping malformed frame on {}: {}", subject, e),
                }
            }
        });

        if let Some(previous) = self.watches.lock().insert(room_id.to_string(), handle) {
            previous.abort();
        }

        Ok(())
    }

    async fn unwatch_room(&self, room_id: &str) {
        if let Some(handle) = self.watches.lock().remove(room_id) {
            handle.abort();
        }
    }

    async fn close(&self) {
        info!("Closing NATS relay link");

        for (_, handle) in self.watches.lock().drain() {
            handle.abort();
        }
        if let Err(e) = self.client.flush().await {
            debug!("Flush on close failed: {}", e);
        }
    }
}
