//! Structured telemetry events.
//!
//! The voice fabric reports lifecycle and quality events to a pluggable
//! sink. The default sink logs through `tracing`; embedders may forward
//! events to their own pipeline instead.

use serde::Serialize;

/// Events emitted by the voice fabric.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum VoiceEvent {
    SessionJoined {
        user_id: String,
        peer_id: String,
        server_id: String,
        channel_id: String,
    },
    SessionLeft {
        user_id: String,
        peer_id: String,
        server_id: String,
        channel_id: String,
        reason: String,
    },
    PeerQuality {
        peer_id: String,
        score: u8,
        rtt_ms: f64,
        jitter_ms: f64,
        loss_ratio: f64,
    },
    IceRestart {
        peer_id: String,
        attempt: u32,
    },
    ScreenShareStarted {
        peer_id: String,
    },
    ScreenShareStopped {
        peer_id: String,
    },
    ScreenShareProfile {
        peer_id: String,
        profile: String,
    },
}

impl VoiceEvent {
    /// Stable dotted event name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SessionJoined { .. } => "voice.session.joined",
            Self::SessionLeft { .. } => "voice.session.left",
            Self::PeerQuality { .. } => "voice.peer.quality",
            Self::IceRestart { .. } => "voice.ice.restart",
            Self::ScreenShareStarted { .. } => "voice.screenshare.started",
            Self::ScreenShareStopped { .. } => "voice.screenshare.stopped",
            Self::ScreenShareProfile { .. } => "voice.screenshare.profile",
        }
    }
}

/// Destination for [`VoiceEvent`]s.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: VoiceEvent);
}

/// Default sink: structured `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: VoiceEvent) {
        let detail = serde_json::to_string(&event).unwrap_or_default();
        tracing::info!(event = event.name(), %detail, "voice event");
    }
}

/// Discards everything. Used in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: VoiceEvent) {}
}
