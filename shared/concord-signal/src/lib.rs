//! Concord Signaling Protocol
//!
//! Wire types shared by the coordination server and the desktop client:
//! signaling envelopes, ICE configuration, and telemetry events.

pub mod envelope;
pub mod ice;
pub mod telemetry;

pub use envelope::{
    Envelope, EnvelopeKind, ErrorPayload, IceCandidatePayload, PeerListPayload, PeerMeta,
    PeerStatePayload, RoomKey, SdpPayload,
};
pub use ice::{IceConfigResponse, IceServer};
pub use telemetry::{EventSink, NullSink, TracingSink, VoiceEvent};
