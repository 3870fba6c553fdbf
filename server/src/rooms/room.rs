//! A single voice room: the per-channel critical section.
//!
//! Membership mutations and envelope fan-out are serialized under one lock.
//! Every send inside the critical section is a non-blocking queue push (the
//! socket writer drains it later), so the lock is never held across
//! transport I/O. Holding the lock across the `peer_list`/`peer_joined`
//! enqueues is what guarantees that every existing member observes
//! `peer_joined(P)` before any envelope routed from P.

use chrono::{DateTime, Utc};
use concord_signal::{Envelope, EnvelopeKind, PeerMeta, PeerStatePayload, RoomKey};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::error::RegistryError;
use super::peer::{PeerSender, RoomPeer, SendFailure};

/// A peer whose queue rejected a send; the registry evicts it.
pub(super) type Eviction = (String, SendFailure);

/// Voice room with all registered peers.
pub struct Room {
    /// Routing scope of this room.
    pub key: RoomKey,
    inner: Mutex<RoomInner>,
}

struct RoomInner {
    /// Members ordered by join time.
    members: Vec<RoomPeer>,
    /// First join since the room was last empty.
    started_at: Option<DateTime<Utc>>,
}

impl Room {
    #[must_use]
    pub fn new(key: RoomKey) -> Self {
        Self {
            key,
            inner: Mutex::new(RoomInner {
                members: Vec::new(),
                started_at: None,
            }),
        }
    }

    /// Register a peer and fan out the join events.
    ///
    /// The joining peer receives `peer_list` with everyone else, every
    /// existing member receives `peer_joined`, both enqueued while the
    /// membership lock is held.
    pub(super) async fn join(
        &self,
        meta: PeerMeta,
        sender: PeerSender,
        max_members: usize,
    ) -> Result<(i64, Vec<Eviction>), RegistryError> {
        let mut inner = self.inner.lock().await;

        if inner.members.len() >= max_members {
            return Err(RegistryError::RoomFull { max: max_members });
        }

        let started_at = *inner.started_at.get_or_insert_with(Utc::now);
        let started_unix = started_at.timestamp();

        let others: Vec<PeerMeta> = inner.members.iter().map(|m| m.meta.clone()).collect();
        let mut evictions = Vec::new();

        if let Err(failure) = sender.send(Envelope::peer_list(&self.key, others, started_unix)) {
            evictions.push((meta.peer_id.clone(), failure));
        }

        let joined = Envelope::peer_joined(&self.key, &meta);
        for member in &inner.members {
            if let Err(failure) = member.sender.send(joined.clone()) {
                evictions.push((member.peer_id.clone(), failure));
            }
        }

        debug!(room = %self.key, peer_id = %meta.peer_id, "Peer joined voice room");
        inner.members.push(RoomPeer::new(meta, sender));

        Ok((started_unix, evictions))
    }

    /// Remove a peer and broadcast `peer_left` to the remaining members.
    ///
    /// Returns the removed row (the caller may still need its transport),
    /// whether the room is now empty, and any members whose queues
    /// overflowed during the broadcast.
    pub(super) async fn leave(&self, peer_id: &str) -> Option<(RoomPeer, bool, Vec<Eviction>)> {
        let mut inner = self.inner.lock().await;

        let position = inner.members.iter().position(|m| m.peer_id == peer_id)?;
        let removed = inner.members.remove(position);

        if inner.members.is_empty() {
            inner.started_at = None;
        }

        let left = Envelope::peer_left(&self.key, &removed.meta);
        let mut evictions = Vec::new();
        for member in &inner.members {
            if let Err(failure) = member.sender.send(left.clone()) {
                evictions.push((member.peer_id.clone(), failure));
            }
        }

        let now_empty = inner.members.is_empty();
        debug!(room = %self.key, peer_id = %peer_id, "Peer left voice room");
        Some((removed, now_empty, evictions))
    }

    /// Transport handle of a current member.
    pub(super) async fn find_sender(&self, peer_id: &str) -> Option<PeerSender> {
        let inner = self.inner.lock().await;
        inner
            .members
            .iter()
            .find(|m| m.peer_id == peer_id)
            .map(|m| m.sender.clone())
    }

    /// Forward a routed envelope.
    ///
    /// `envelope.from` must already be stamped with the sender's registered
    /// peer ID. Unicast goes to `to` iff it is a member; broadcast is only
    /// meaningful for `peer_state`. A peer never receives its own traffic.
    pub(super) async fn route(&self, envelope: Envelope) -> Result<Vec<Eviction>, RegistryError> {
        let mut inner = self.inner.lock().await;

        let from = envelope.from.clone();
        let Some(sender_idx) = inner.members.iter().position(|m| m.peer_id == from) else {
            return Err(RegistryError::NotAMember);
        };

        if envelope.kind == EnvelopeKind::PeerState {
            if let Some(state) = envelope.decode_payload::<PeerStatePayload>() {
                inner.members[sender_idx].apply_state(&state);
            }
        }

        let mut evictions = Vec::new();
        match envelope.to.as_deref() {
            Some(to) if to != from => {
                // Target may have just left; drop silently then.
                if let Some(target) = inner.members.iter().find(|m| m.peer_id == to) {
                    if let Err(failure) = target.sender.send(envelope.clone()) {
                        evictions.push((target.peer_id.clone(), failure));
                    }
                }
            }
            Some(_) => {
                warn!(room = %self.key, peer_id = %from, "Dropped self-addressed envelope");
            }
            None if envelope.kind == EnvelopeKind::PeerState => {
                for member in &inner.members {
                    if member.peer_id == from {
                        continue;
                    }
                    if let Err(failure) = member.sender.send(envelope.clone()) {
                        evictions.push((member.peer_id.clone(), failure));
                    }
                }
            }
            None => {
                debug!(room = %self.key, kind = ?envelope.kind, "Dropped broadcast of unicast-only envelope");
            }
        }

        Ok(evictions)
    }

    /// Read-only membership snapshot for the HTTP surface.
    pub async fn snapshot(&self) -> Vec<PeerMeta> {
        let inner = self.inner.lock().await;
        inner.members.iter().map(|m| m.meta.clone()).collect()
    }

    pub(super) async fn is_empty(&self) -> bool {
        self.inner.lock().await.members.is_empty()
    }

    /// Current participant count.
    pub async fn member_count(&self) -> usize {
        self.inner.lock().await.members.len()
    }
}
