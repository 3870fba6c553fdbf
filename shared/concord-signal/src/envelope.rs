//! Signaling envelopes.
//!
//! Every signaling message is a single UTF-8 JSON object with a `type` tag,
//! routing fields, and an optional type-specific payload. Unknown envelope
//! types deserialize to [`EnvelopeKind::Unknown`] so older peers can ignore
//! traffic from newer ones.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Identifies a voice room: one voice channel on one server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomKey {
    /// Server (guild) ID.
    pub server_id: String,
    /// Voice channel ID.
    pub channel_id: String,
}

impl RoomKey {
    #[must_use]
    pub fn new(server_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl std::fmt::Display for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.server_id, self.channel_id)
    }
}

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Join,
    Leave,
    PeerList,
    PeerJoined,
    PeerLeft,
    PeerState,
    SdpOffer,
    SdpAnswer,
    IceCandidate,
    Ping,
    Error,
    /// Forward-compatibility catch-all. Never sent; silently ignored.
    #[serde(other)]
    Unknown,
}

impl EnvelopeKind {
    /// Whether the server forwards this envelope between peers.
    #[must_use]
    pub const fn is_routable(self) -> bool {
        matches!(
            self,
            Self::SdpOffer | Self::SdpAnswer | Self::IceCandidate | Self::PeerState
        )
    }
}

/// A single signaling message.
///
/// `from` is stamped by the server on all routed traffic; an empty `to`
/// means room broadcast, a present `to` means targeted unicast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub server_id: String,
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Metadata describing one voice participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMeta {
    pub peer_id: String,
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub deafened: bool,
    #[serde(default)]
    pub screen_sharing: bool,
}

/// Payload of `peer_list`, sent to a joining peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerListPayload {
    pub peers: Vec<PeerMeta>,
    /// Unix seconds of the first join since the room was last empty.
    pub channel_started_at: i64,
}

/// Payload of `peer_state`: advisory mute/deafen/screen flags.
///
/// Extra fields a newer client may attach are preserved by the server
/// (envelopes are forwarded verbatim) and ignored here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatePayload {
    pub peer_id: String,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub deafened: bool,
    #[serde(default)]
    pub screen_sharing: bool,
}

/// Payload of `sdp_offer` / `sdp_answer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
}

/// Payload of `ice_candidate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: String,
    #[serde(default)]
    pub sdp_mline_index: u16,
}

/// Payload of `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Envelope {
    fn new(kind: EnvelopeKind, room: &RoomKey) -> Self {
        Self {
            kind,
            from: String::new(),
            to: None,
            server_id: room.server_id.clone(),
            channel_id: room.channel_id.clone(),
            payload: None,
        }
    }

    fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        // Serialization of our own payload structs cannot fail.
        self.payload = serde_json::to_value(payload).ok();
        self
    }

    #[must_use]
    pub fn room_key(&self) -> RoomKey {
        RoomKey::new(self.server_id.clone(), self.channel_id.clone())
    }

    /// Decode the payload into a typed struct. Returns `None` when the
    /// payload is absent or malformed; callers drop such envelopes.
    #[must_use]
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Option<T> {
        let value = self.payload.clone()?;
        serde_json::from_value(value).ok()
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encode as a single-line JSON string.
    #[must_use]
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    #[must_use]
    pub fn join(room: &RoomKey, meta: &PeerMeta) -> Self {
        Self::new(EnvelopeKind::Join, room).with_payload(meta)
    }

    #[must_use]
    pub fn leave(room: &RoomKey) -> Self {
        Self::new(EnvelopeKind::Leave, room)
    }

    #[must_use]
    pub fn peer_list(room: &RoomKey, peers: Vec<PeerMeta>, channel_started_at: i64) -> Self {
        Self::new(EnvelopeKind::PeerList, room).with_payload(&PeerListPayload {
            peers,
            channel_started_at,
        })
    }

    #[must_use]
    pub fn peer_joined(room: &RoomKey, meta: &PeerMeta) -> Self {
        Self::new(EnvelopeKind::PeerJoined, room).with_payload(meta)
    }

    #[must_use]
    pub fn peer_left(room: &RoomKey, meta: &PeerMeta) -> Self {
        Self::new(EnvelopeKind::PeerLeft, room).with_payload(meta)
    }

    #[must_use]
    pub fn peer_state(room: &RoomKey, state: &PeerStatePayload) -> Self {
        Self::new(EnvelopeKind::PeerState, room).with_payload(state)
    }

    #[must_use]
    pub fn sdp_offer(room: &RoomKey, to: impl Into<String>, sdp: impl Into<String>) -> Self {
        let mut env = Self::new(EnvelopeKind::SdpOffer, room).with_payload(&SdpPayload {
            sdp: sdp.into(),
        });
        env.to = Some(to.into());
        env
    }

    #[must_use]
    pub fn sdp_answer(room: &RoomKey, to: impl Into<String>, sdp: impl Into<String>) -> Self {
        let mut env = Self::new(EnvelopeKind::SdpAnswer, room).with_payload(&SdpPayload {
            sdp: sdp.into(),
        });
        env.to = Some(to.into());
        env
    }

    #[must_use]
    pub fn ice_candidate(
        room: &RoomKey,
        to: impl Into<String>,
        candidate: &IceCandidatePayload,
    ) -> Self {
        let mut env = Self::new(EnvelopeKind::IceCandidate, room).with_payload(candidate);
        env.to = Some(to.into());
        env
    }

    #[must_use]
    pub fn ping(room: &RoomKey) -> Self {
        Self::new(EnvelopeKind::Ping, room)
    }

    #[must_use]
    pub fn error(room: &RoomKey, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EnvelopeKind::Error, room).with_payload(&ErrorPayload {
            message: message.into(),
            code: Some(code.into()),
        })
    }
}
