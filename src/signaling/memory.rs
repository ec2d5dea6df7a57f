//! In-process relay
//!
//! Implements the relay side of the signaling contract inside one process:
//! room membership, role assignment, fan-out and acknowledgments. Used by
//! the `serve --relay memory` mode and by the integration tests, which also
//! use its fault-injection hooks (refused connects, revoked identities,
//! dropped links).

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::messages::{
    DeliveryAck, InboundFrame, JoinRequest, JoinResponse, LeaveNotice, OutboundFrame,
    PresenceUpdate, RelayReply, Role,
};
use super::relay::{LinkEvent, RelayConnector, RelayLink, RelaySender, LINK_CHANNEL_CAPACITY};
use crate::error::TransportError;

/// Peers allowed in one interview room
const ROOM_CAPACITY: usize = 2;

#[derive(Default)]
struct Hub {
    next_client: u64,
    clients: HashMap<u64, Client>,
    /// Member identities per room, in join order
    rooms: HashMap<String, Vec<String>>,
    refuse_connects: u32,
    connect_attempts: u32,
    revoked: HashSet<String>,
}

struct Client {
    identity: String,
    tx: mpsc::Sender<LinkEvent>,
    watching: HashSet<String>,
}

impl Hub {
    fn fan_out(&self, room_id: &str, except: u64, frame: &InboundFrame) {
        for (id, client) in &self.clients {
            if *id == except || !client.watching.contains(room_id) {
                continue;
            }
            if let Err(e) = client.tx.try_send(LinkEvent::Frame(frame.clone())) {
                warn!("Memory relay dropped frame for {}: {}", client.identity, e);
            }
        }
    }

    fn join(&mut self, client_id: u64, req: &JoinRequest) -> RelayReply {
        let members = self.rooms.entry(req.room_id.clone()).or_default();

        let newly_joined = if members.contains(&req.identity) {
            false
        } else if members.len() >= ROOM_CAPACITY {
            return RelayReply::Rejected {
                reason: format!("room {} is full", req.room_id),
            };
        } else {
            members.push(req.identity.clone());
            true
        };

        // Role follows join order, so a rejoining peer keeps its role
        let position = members.iter().position(|m| m == &req.identity).unwrap_or(0);
        let role = if position == 0 {
            Role::Offerer
        } else {
            Role::Answerer
        };
        let roster = members
            .iter()
            .filter(|m| *m != &req.identity)
            .cloned()
            .collect();

        if newly_joined {
            info!(
                "Memory relay: {} joined room {} as {:?}",
                req.identity, req.room_id, role
            );
            self.fan_out(
                &req.room_id,
                client_id,
                &InboundFrame::Presence(PresenceUpdate {
                    room_id: req.room_id.clone(),
                    peer: req.identity.clone(),
                    joined: true,
                }),
            );
        }

        RelayReply::Joined(JoinResponse {
            room_id: req.room_id.clone(),
            role,
            roster,
        })
    }

    fn leave(&mut self, client_id: u64, notice: &LeaveNotice) {
        let Some(members) = self.rooms.get_mut(&notice.room_id) else {
            return;
        };
        let before = members.len();
        members.retain(|m| m != &notice.identity);
        if members.len() == before {
            return;
        }
        if members.is_empty() {
            self.rooms.remove(&notice.room_id);
        }

        if let Some(client) = self.clients.get_mut(&client_id) {
            client.watching.remove(&notice.room_id);
        }

        info!(
            "Memory relay: {} left room {}",
            notice.identity, notice.room_id
        );
        self.fan_out(
            &notice.room_id,
            client_id,
            &InboundFrame::Presence(PresenceUpdate {
                room_id: notice.room_id.clone(),
                peer: notice.identity.clone(),
                joined: false,
            }),
        );
    }
}

/// Shared in-process relay; clones refer to the same hub
#[derive(Clone, Default)]
pub struct MemoryRelay {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` connect attempts with a socket error
    pub fn refuse_next_connects(&self, count: u32) {
        self.hub.lock().refuse_connects = count;
    }

    /// Reject connects for `identity` with an auth error
    pub fn revoke(&self, identity: &str) {
        self.hub.lock().revoked.insert(identity.to_string());
    }

    /// Total connect attempts seen, successful or not
    pub fn connect_attempts(&self) -> u32 {
        self.hub.lock().connect_attempts
    }

    /// Sever every live link, as a relay restart would
    ///
    /// Room membership survives so reconnecting peers keep their roles.
    pub fn drop_links(&self) {
        let dropped = std::mem::take(&mut self.hub.lock().clients);
        info!("Memory relay: dropped {} links", dropped.len());
    }

    /// Sever only the links opened for `identity`; returns how many were open
    pub fn drop_links_of(&self, identity: &str) -> usize {
        let mut hub = self.hub.lock();
        let before = hub.clients.len();
        hub.clients.retain(|_, client| client.identity != identity);
        let dropped = before - hub.clients.len();
        info!("Memory relay: dropped {} links of {}", dropped, identity);
        dropped
    }

    /// Close `room_id` and notify everyone watching it
    pub fn end_room(&self, room_id: &str) {
        let mut hub = self.hub.lock();
        hub.rooms.remove(room_id);
        hub.fan_out(
            room_id,
            0,
            &InboundFrame::RoomEnded {
                room_id: room_id.to_string(),
            },
        );
    }

    pub fn members(&self, room_id: &str) -> Vec<String> {
        self.hub
            .lock()
            .rooms
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn live_links(&self) -> usize {
        self.hub.lock().clients.len()
    }
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    async fn connect(&self, identity: &str) -> Result<RelayLink, TransportError> {
        let mut hub = self.hub.lock();
        hub.connect_attempts += 1;

        if hub.refuse_connects > 0 {
            hub.refuse_connects -= 1;
            return Err(TransportError::Socket("connection refused".to_string()));
        }
        if hub.revoked.contains(identity) {
            return Err(TransportError::Auth(format!("identity {} revoked", identity)));
        }

        // Ids start at 1; 0 is the "nobody" sender for relay-originated frames
        hub.next_client += 1;
        let client_id = hub.next_client;
        let (tx, inbound) = mpsc::channel(LINK_CHANNEL_CAPACITY);
        hub.clients.insert(
            client_id,
            Client {
                identity: identity.to_string(),
                tx,
                watching: HashSet::new(),
            },
        );

        debug!("Memory relay: link {} opened for {}", client_id, identity);

        Ok(RelayLink {
            sender: Arc::new(MemorySender {
                hub: self.hub.clone(),
                client_id,
            }),
            inbound,
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemorySender {
    hub: Arc<Mutex<Hub>>,
    client_id: u64,
}

impl MemorySender {
    fn deliver(&self, frame: &OutboundFrame) -> Result<RelayReply, TransportError> {
        let mut hub = self.hub.lock();
        if !hub.clients.contains_key(&self.client_id) {
            return Err(TransportError::Socket("link closed".to_string()));
        }

        let reply = match frame {
            OutboundFrame::Join(req) => hub.join(self.client_id, req),
            OutboundFrame::Leave(notice) => {
                hub.leave(self.client_id, notice);
                RelayReply::Delivered(ack(""))
            }
            OutboundFrame::Signal(envelope) => {
                hub.fan_out(
                    &envelope.room_id,
                    self.client_id,
                    &InboundFrame::Signal(envelope.clone()),
                );
                RelayReply::Delivered(ack(&envelope.message_id))
            }
        };

        Ok(reply)
    }
}

fn ack(message_id: &str) -> DeliveryAck {
    DeliveryAck {
        message_id: message_id.to_string(),
        delivered_at: Utc::now().to_rfc3339(),
    }
}

#[async_trait]
impl RelaySender for MemorySender {
    async fn publish(&self, frame: &OutboundFrame) -> Result<(), TransportError> {
        self.deliver(frame).map(|_| ())
    }

    async fn request(
        &self,
        frame: &OutboundFrame,
        _timeout: Duration,
    ) -> Result<RelayReply, TransportError> {
        self.deliver(frame)
    }

    async fn watch_room(&self, room_id: &str) -> Result<(), TransportError> {
        let mut hub = self.hub.lock();
        let client = hub
            .clients
            .get_mut(&self.client_id)
            .ok_or_else(|| TransportError::Socket("link closed".to_string()))?;
        client.watching.insert(room_id.to_string());
        Ok(())
    }

    async fn unwatch_room(&self, room_id: &str) {
        if let Some(client) = self.hub.lock().clients.get_mut(&self.client_id) {
            client.watching.remove(room_id);
        }
    }

    async fn close(&self) {
        if self.hub.lock().clients.remove(&self.client_id).is_some() {
            debug!("Memory relay: link {} closed", self.client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::messages::{SignalEnvelope, SignalPayload};

    fn join(identity: &str) -> OutboundFrame {
        OutboundFrame::Join(JoinRequest {
            room_id: "room-1".to_string(),
            interview_id: "iv-1".to_string(),
            identity: identity.to_string(),
        })
    }

    #[tokio::test]
    async fn test_roles_follow_join_order() {
        let relay = MemoryRelay::new();
        let a = relay.connect("recruiter").await.unwrap();
        let b = relay.connect("candidate").await.unwrap();
        let timeout = Duration::from_secs(1);

        let RelayReply::Joined(first) = a.sender.request(&join("recruiter"), timeout).await.unwrap()
        else {
            panic!("expected join response");
        };
        assert_eq!(first.role, Role::Offerer);
        assert!(first.roster.is_empty());

        let RelayReply::Joined(second) = b.sender.request(&join("candidate"), timeout).await.unwrap()
        else {
            panic!("expected join response");
        };
        assert_eq!(second.role, Role::Answerer);
        assert_eq!(second.roster, vec!["recruiter".to_string()]);

        // Rejoin keeps the role
        let RelayReply::Joined(again) = a.sender.request(&join("recruiter"), timeout).await.unwrap()
        else {
            panic!("expected join response");
        };
        assert_eq!(again.role, Role::Offerer);

        let third = relay.connect("observer").await.unwrap();
        let reply = third.sender.request(&join("observer"), timeout).await.unwrap();
        assert!(matches!(reply, RelayReply::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_drop_links_of_one_identity() {
        let relay = MemoryRelay::new();
        let _a = relay.connect("a").await.unwrap();
        let mut b = relay.connect("b").await.unwrap();

        assert_eq!(relay.drop_links_of("b"), 1);
        assert_eq!(relay.live_links(), 1);
        assert_eq!(relay.drop_links_of("b"), 0);

        // b's inbound side sees the link go away
        assert!(b.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_fan_out_skips_sender() {
        let relay = MemoryRelay::new();
        let mut a = relay.connect("a").await.unwrap();
        let mut b = relay.connect("b").await.unwrap();
        a.sender.watch_room("room-1").await.unwrap();
        b.sender.watch_room("room-1").await.unwrap();

        let envelope = SignalEnvelope {
            room_id: "room-1".to_string(),
            interview_id: "iv-1".to_string(),
            role: Role::Offerer,
            sender: "a".to_string(),
            message_id: "m1".to_string(),
            payload: SignalPayload::Offer { sdp: "v=0".into() },
        };
        a.sender
            .publish(&OutboundFrame::Signal(envelope.clone()))
            .await
            .unwrap();

        match b.inbound.recv().await {
            Some(LinkEvent::Frame(InboundFrame::Signal(got))) => assert_eq!(got, envelope),
            other => panic!("unexpected {:?}", other),
        }
        assert!(a.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let relay = MemoryRelay::new();
        relay.refuse_next_connects(2);
        assert!(matches!(
            relay.connect("x").await,
            Err(TransportError::Socket(_))
        ));
        assert!(relay.connect("x").await.is_err());

        let mut link = relay.connect("x").await.unwrap();
        assert_eq!(relay.connect_attempts(), 3);
        assert_eq!(relay.live_links(), 1);

        relay.drop_links();
        assert!(link.inbound.recv().await.is_none());
        assert!(link.sender.publish(&join("x")).await.is_err());

        relay.revoke("y");
        assert!(matches!(relay.connect("y").await, Err(TransportError::Auth(_))));
    }
}
