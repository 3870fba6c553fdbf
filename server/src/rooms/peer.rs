//! Registered peer rows and the transport-facing envelope queue.
//!
//! The transport owns the socket; the room owns the peer. The registry
//! talks to a peer only through its [`PeerSender`]: a bounded, non-blocking
//! queue the socket writer drains. Overflow evicts the peer instead of
//! stalling the room.

use std::time::Instant;

use concord_signal::{Envelope, PeerMeta, PeerStatePayload};
use tokio::sync::{mpsc, watch};

/// Why a transport is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unauthorized,
    SlowConsumer,
    HeartbeatTimeout,
    ProtocolAbuse,
    /// A newer connection for the same user reclaimed this peer ID.
    Superseded,
}

impl CloseReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::SlowConsumer => "slow_consumer",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ProtocolAbuse => "protocol_abuse",
            Self::Superseded => "superseded",
        }
    }
}

/// Non-blocking send failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The bounded queue is full; the peer is a slow consumer.
    Backpressure,
    /// The transport side is gone.
    Disconnected,
}

/// Registry-side handle to one peer's transport.
#[derive(Debug, Clone)]
pub struct PeerSender {
    tx: mpsc::Sender<Envelope>,
    close_tx: watch::Sender<Option<CloseReason>>,
}

/// Transport-side ends: the envelope queue to drain and the close signal.
#[derive(Debug)]
pub struct PeerReceiver {
    pub envelopes: mpsc::Receiver<Envelope>,
    pub closed: watch::Receiver<Option<CloseReason>>,
}

impl PeerSender {
    /// Create a bounded sender/receiver pair for one transport.
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, PeerReceiver) {
        let (tx, rx) = mpsc::channel(buffer);
        let (close_tx, close_rx) = watch::channel(None);
        (
            Self { tx, close_tx },
            PeerReceiver {
                envelopes: rx,
                closed: close_rx,
            },
        )
    }

    /// Enqueue an envelope without blocking.
    pub fn send(&self, envelope: Envelope) -> Result<(), SendFailure> {
        self.tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Backpressure,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Disconnected,
        })
    }

    /// Ask the owning transport to close. Idempotent; the first reason wins.
    pub fn close(&self, reason: CloseReason) {
        self.close_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

/// Authoritative row for one registered peer. Lives inside the owning
/// room's critical section; every mutation happens under the room lock.
#[derive(Debug)]
pub struct RoomPeer {
    pub peer_id: String,
    pub user_id: String,
    pub meta: PeerMeta,
    pub sender: PeerSender,
    pub joined_at: Instant,
}

impl RoomPeer {
    #[must_use]
    pub fn new(meta: PeerMeta, sender: PeerSender) -> Self {
        Self {
            peer_id: meta.peer_id.clone(),
            user_id: meta.user_id.clone(),
            meta,
            sender,
            joined_at: Instant::now(),
        }
    }

    /// Fold an advisory `peer_state` update into the stored metadata so
    /// late joiners see current flags in `peer_list`.
    pub fn apply_state(&mut self, state: &PeerStatePayload) {
        self.meta.muted = state.muted;
        self.meta.deafened = state.deafened;
        self.meta.screen_sharing = state.screen_sharing;
    }
}
