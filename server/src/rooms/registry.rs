//! Process-wide room registry.
//!
//! Owns the room table and the peer index, enforces capacity and the
//! one-room-per-peer invariant, and evicts peers whose transports cannot
//! keep up. Empty rooms are garbage-collected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use concord_signal::{Envelope, EventSink, PeerMeta, RoomKey, VoiceEvent};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::RegistryError;
use super::peer::{CloseReason, PeerSender, SendFailure};
use super::room::{Eviction, Room};
use crate::config::Config;
use crate::permissions::VoiceGate;
use crate::presence::PresenceSink;

/// Why a peer left its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// Explicit `leave` envelope.
    Client,
    /// Transport dropped without a `leave`.
    TransportLost,
    /// The peer's outbound queue rejected a send.
    SendFailed,
    /// A newer connection for the same user took over the peer ID.
    Superseded,
}

impl LeaveReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::TransportLost => "transport_lost",
            Self::SendFailed => "send_failed",
            Self::Superseded => "superseded",
        }
    }

    /// Unclean departures leave a grace reservation so a reconnect can
    /// reclaim the same peer ID.
    const fn reserves_peer_id(self) -> bool {
        matches!(self, Self::TransportLost | Self::SendFailed)
    }
}

/// Successful registration, held by the owning transport.
#[derive(Debug, Clone)]
pub struct Registration {
    pub peer_id: String,
    pub user_id: String,
    pub room: RoomKey,
}

/// Index entry: which room a live peer ID belongs to.
#[derive(Debug, Clone)]
struct PeerEntry {
    room: RoomKey,
    user_id: String,
}

/// Grace reservation after an unclean departure.
#[derive(Debug, Clone)]
struct Reservation {
    user_id: String,
    expires_at: Instant,
}

/// Process-wide registry of voice rooms.
pub struct RoomRegistry {
    config: Arc<Config>,
    rooms: RwLock<HashMap<RoomKey, Arc<Room>>>,
    peers: RwLock<HashMap<String, PeerEntry>>,
    reservations: Mutex<HashMap<String, Reservation>>,
    gate: Arc<dyn VoiceGate>,
    presence: Arc<dyn PresenceSink>,
    events: Arc<dyn EventSink>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        gate: Arc<dyn VoiceGate>,
        presence: Arc<dyn PresenceSink>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            rooms: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            reservations: Mutex::new(HashMap::new()),
            gate,
            presence,
            events,
        }
    }

    /// Register a peer in the room named by the `join` envelope.
    ///
    /// Consults the permission gate, enforces capacity and peer-ID
    /// uniqueness, sends `peer_list` to the joiner and broadcasts
    /// `peer_joined` to everyone else.
    pub async fn join(
        &self,
        envelope: &Envelope,
        sender: PeerSender,
    ) -> Result<Registration, RegistryError> {
        let mut meta: PeerMeta = envelope
            .decode_payload()
            .ok_or(RegistryError::Malformed("join"))?;
        let room_key = envelope.room_key();

        if !self.gate.may_join_voice(&meta.user_id, &room_key) {
            return Err(RegistryError::Denied);
        }

        if meta.peer_id.is_empty() {
            meta.peer_id = Uuid::new_v4().to_string();
        }

        // A reconnect inside the grace window reclaims its reserved ID;
        // anyone else proposing a reserved ID is turned away.
        {
            let mut reservations = self.reservations.lock().await;
            reservations.retain(|_, r| r.expires_at > Instant::now());
            if let Some(reservation) = reservations.get(&meta.peer_id) {
                if reservation.user_id != meta.user_id {
                    return Err(RegistryError::Denied);
                }
                reservations.remove(&meta.peer_id);
                debug!(peer_id = %meta.peer_id, "Reconnect reclaimed peer ID within grace");
            }
        }

        // Collision with a live registration: same user supersedes the
        // stale connection, a different user is rejected.
        let live = self.peers.read().await.get(&meta.peer_id).cloned();
        if let Some(entry) = live {
            if entry.user_id != meta.user_id {
                return Err(RegistryError::Denied);
            }
            info!(peer_id = %meta.peer_id, "Stale registration superseded by reconnect");
            let stale = self.remove_peer(&meta.peer_id, LeaveReason::Superseded).await;
            self.process_evictions(stale).await;
        }

        let room = self.get_or_create_room(&room_key).await;

        // The peer index is updated under its write lock around the room
        // critical section so a concurrent duplicate join cannot slip in.
        let mut peers = self.peers.write().await;
        if peers.contains_key(&meta.peer_id) {
            return Err(RegistryError::Denied);
        }
        let registration = Registration {
            peer_id: meta.peer_id.clone(),
            user_id: meta.user_id.clone(),
            room: room_key.clone(),
        };
        let evictions = match room
            .join(meta, sender, self.config.max_channel_users)
            .await
        {
            Ok((_started_at, evictions)) => {
                peers.insert(
                    registration.peer_id.clone(),
                    PeerEntry {
                        room: room_key.clone(),
                        user_id: registration.user_id.clone(),
                    },
                );
                evictions
            }
            Err(err) => {
                drop(peers);
                self.gc_room_if_empty(&room_key).await;
                return Err(err);
            }
        };
        drop(peers);

        self.presence.touch(&registration.user_id);
        self.events.emit(VoiceEvent::SessionJoined {
            user_id: registration.user_id.clone(),
            peer_id: registration.peer_id.clone(),
            server_id: room_key.server_id.clone(),
            channel_id: room_key.channel_id.clone(),
        });

        self.process_evictions(evictions).await;
        Ok(registration)
    }

    /// Remove a peer from its room and broadcast `peer_left`.
    pub async fn leave(&self, peer_id: &str, reason: LeaveReason) {
        let evictions = self.remove_peer(peer_id, reason).await;
        self.process_evictions(evictions).await;
    }

    /// Forward a routed envelope (`sdp_offer`, `sdp_answer`,
    /// `ice_candidate`, `peer_state`) within the sender's room.
    ///
    /// `from` is stamped with the registered peer ID before forwarding so
    /// a peer cannot speak for anyone else.
    pub async fn route(
        &self,
        registration: &Registration,
        mut envelope: Envelope,
    ) -> Result<(), RegistryError> {
        if !envelope.kind.is_routable() {
            return Ok(());
        }
        envelope.from = registration.peer_id.clone();

        let room = self.rooms.read().await.get(&registration.room).cloned();
        let Some(room) = room else {
            // The room vanished under us (peer just evicted); drop.
            return Ok(());
        };

        let evictions = room.route(envelope).await?;
        self.process_evictions(evictions).await;
        Ok(())
    }

    /// Read-only membership snapshot for the non-core HTTP surface.
    pub async fn snapshot_room(&self, key: &RoomKey) -> Vec<PeerMeta> {
        let room = self.rooms.read().await.get(key).cloned();
        match room {
            Some(room) => room.snapshot().await,
            None => Vec::new(),
        }
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn get_or_create_room(&self, key: &RoomKey) -> Arc<Room> {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(key) {
            return room.clone();
        }
        let room = Arc::new(Room::new(key.clone()));
        rooms.insert(key.clone(), room.clone());
        debug!(room = %key, "Created voice room");
        room
    }

    async fn gc_room_if_empty(&self, key: &RoomKey) {
        let mut rooms = self.rooms.write().await;
        let empty = match rooms.get(key) {
            Some(room) => room.is_empty().await,
            None => false,
        };
        if empty {
            rooms.remove(key);
            debug!(room = %key, "Removed empty voice room");
        }
    }

    /// Core removal: deregister, broadcast, reserve the ID on unclean
    /// departures, and garbage-collect the room. Returns follow-up
    /// evictions discovered during the broadcast.
    async fn remove_peer(&self, peer_id: &str, reason: LeaveReason) -> Vec<Eviction> {
        let entry = self.peers.write().await.remove(peer_id);
        let Some(entry) = entry else {
            return Vec::new();
        };

        let room = self.rooms.read().await.get(&entry.room).cloned();
        let Some(room) = room else {
            return Vec::new();
        };

        let Some((removed, now_empty, evictions)) = room.leave(peer_id).await else {
            return Vec::new();
        };

        if reason == LeaveReason::Superseded {
            removed.sender.close(CloseReason::Superseded);
        }

        if reason.reserves_peer_id() {
            self.reservations.lock().await.insert(
                peer_id.to_string(),
                Reservation {
                    user_id: entry.user_id.clone(),
                    expires_at: Instant::now() + self.config.reconnect_grace,
                },
            );
        }

        if now_empty {
            self.gc_room_if_empty(&entry.room).await;
        }

        self.presence.touch(&entry.user_id);
        self.events.emit(VoiceEvent::SessionLeft {
            user_id: entry.user_id,
            peer_id: removed.meta.peer_id,
            server_id: entry.room.server_id,
            channel_id: entry.room.channel_id,
            reason: reason.as_str().to_string(),
        });

        evictions
    }

    /// Evict peers whose queues rejected a send. A failed send to one peer
    /// must never block delivery to the others, so eviction happens after
    /// the fan-out, as its own leave cycle.
    async fn process_evictions(&self, evictions: Vec<Eviction>) {
        let mut worklist = evictions;
        while let Some((peer_id, failure)) = worklist.pop() {
            warn!(peer_id = %peer_id, ?failure, "Evicting peer after failed send");
            if failure == SendFailure::Backpressure {
                if let Some(sender) = self.find_sender(&peer_id).await {
                    sender.close(CloseReason::SlowConsumer);
                }
            }
            let more = self.remove_peer(&peer_id, LeaveReason::SendFailed).await;
            worklist.extend(more);
        }
    }

    async fn find_sender(&self, peer_id: &str) -> Option<PeerSender> {
        let entry = self.peers.read().await.get(peer_id).cloned()?;
        let room = self.rooms.read().await.get(&entry.room).cloned()?;
        room.find_sender(peer_id).await
    }
}
