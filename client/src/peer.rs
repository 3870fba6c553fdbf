//! Per-peer WebRTC negotiation state.
//!
//! Each remote participant gets one `RTCPeerConnection` with a fixed
//! negotiation role: the side that learned about the pair from `peer_list`
//! initiates, the side that learned from `peer_joined` responds. Only
//! initiators ever create offers, which makes glare structurally
//! impossible. All state transitions run on the owning session task;
//! media-stack callbacks are marshaled onto it through [`PeerEvent`]s.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use concord_signal::{IceCandidatePayload, PeerMeta};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::media::{opus_capability, vp9_capability, LocalMedia, ScreenTracks};
use crate::qos::QualitySnapshot;

/// Grace before a `disconnected` peer triggers an ICE restart.
pub const DISCONNECT_RESTART_GRACE: Duration = Duration::from_millis(1200);
/// Grace before a degraded peer is dropped from the mesh.
pub const DEGRADE_GRACE: Duration = Duration::from_secs(8);

/// Negotiation errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("WebRTC API error: {0}")]
    Api(String),
    #[error("Peer connection error: {0}")]
    PeerConnection(String),
    #[error("SDP error: {0}")]
    Sdp(String),
    #[error("Track error: {0}")]
    Track(String),
}

impl From<webrtc::Error> for PeerError {
    fn from(err: webrtc::Error) -> Self {
        Self::PeerConnection(err.to_string())
    }
}

/// Fixed negotiation role for one pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Learned about the peer from `peer_list`; sole creator of offers.
    Initiator,
    /// Learned about the peer from `peer_joined`; never offers.
    Responder,
}

/// Offer/answer state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    Fresh,
    OfferingLocal,
    AwaitingAnswer,
    AwaitingRemoteOffer,
    Answering,
    Established,
    Closed,
}

/// Media-stack callback marshaled onto the session task.
pub enum PeerEvent {
    LocalCandidate {
        peer_id: String,
        candidate: IceCandidatePayload,
    },
    IceState {
        peer_id: String,
        state: RTCIceConnectionState,
    },
    NegotiationNeeded {
        peer_id: String,
    },
    RemoteTrack {
        peer_id: String,
        track: Arc<TrackRemote>,
    },
}

/// Outcome of asking the restart policy for another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Go ahead; this is attempt N.
    Restart(u32),
    /// Still cooling down; retry at the given instant.
    Cooldown(Instant),
    /// Attempt cap reached; tear the peer down.
    Exhausted,
}

/// ICE restart budget for one peer: bounded attempts with a cooldown.
#[derive(Debug, Default)]
pub struct RestartPolicy {
    attempts: u32,
    last_attempt: Option<Instant>,
}

impl RestartPolicy {
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const COOLDOWN: Duration = Duration::from_secs(6);

    pub fn decide(&mut self, now: Instant) -> RestartDecision {
        if self.attempts >= Self::MAX_ATTEMPTS {
            return RestartDecision::Exhausted;
        }
        if let Some(last) = self.last_attempt {
            let ready_at = last + Self::COOLDOWN;
            if now < ready_at {
                return RestartDecision::Cooldown(ready_at);
            }
        }
        self.attempts += 1;
        self.last_attempt = Some(now);
        RestartDecision::Restart(self.attempts)
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// One remote participant in the mesh.
pub struct RemotePeer {
    pub meta: PeerMeta,
    pub role: Role,
    pub phase: NegotiationPhase,
    pub pc: Arc<RTCPeerConnection>,
    /// Suppresses re-entrant offer creation across suspension points.
    making_offer: bool,
    /// A track change arrived while an offer was in flight.
    pub needs_renegotiation: bool,
    pending_remote_candidates: VecDeque<RTCIceCandidateInit>,
    audio_sender: Arc<RTCRtpSender>,
    screen_video_sender: Option<Arc<RTCRtpSender>>,
    screen_audio_sender: Option<Arc<RTCRtpSender>>,
    pub restart: RestartPolicy,
    /// Deadline for the disconnected-state restart trigger.
    pub restart_due: Option<Instant>,
    /// Start of the current degradation stretch.
    pub degraded_since: Option<Instant>,
    pub quality: QualitySnapshot,
}

/// Build the process-wide WebRTC API: Opus plus VP9, default interceptors.
pub fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: opus_capability(),
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .map_err(|e| PeerError::Api(e.to_string()))?;

    let mut vp9 = vp9_capability();
    vp9.rtcp_feedback = vec![
        RTCPFeedback {
            typ: "goog-remb".to_string(),
            parameter: String::new(),
        },
        RTCPFeedback {
            typ: "ccm".to_string(),
            parameter: "fir".to_string(),
        },
        RTCPFeedback {
            typ: "nack".to_string(),
            parameter: String::new(),
        },
        RTCPFeedback {
            typ: "nack".to_string(),
            parameter: "pli".to_string(),
        },
    ];
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: vp9,
                payload_type: 98,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .map_err(|e| PeerError::Api(e.to_string()))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| PeerError::Api(e.to_string()))?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

impl RemotePeer {
    /// Create the peer connection, wire its callbacks onto the session
    /// task, and attach the local tracks (screen tracks included when a
    /// share is active, so late joiners receive it automatically).
    pub async fn connect(
        api: &API,
        ice_servers: Vec<RTCIceServer>,
        meta: PeerMeta,
        role: Role,
        media: &LocalMedia,
        events: &mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self, PeerError> {
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        let peer_id = meta.peer_id.clone();

        let tx = events.clone();
        let id = peer_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            let id = id.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(json) => {
                            let _ = tx.send(PeerEvent::LocalCandidate {
                                peer_id: id,
                                candidate: IceCandidatePayload {
                                    candidate: json.candidate,
                                    sdp_mid: json.sdp_mid.unwrap_or_default(),
                                    sdp_mline_index: json.sdp_mline_index.unwrap_or_default(),
                                },
                            });
                        }
                        Err(e) => {
                            warn!(peer_id = %id, error = %e, "Failed to serialize ICE candidate");
                        }
                    }
                }
            })
        }));

        let tx = events.clone();
        let id = peer_id.clone();
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let tx = tx.clone();
            let id = id.clone();
            Box::pin(async move {
                let _ = tx.send(PeerEvent::IceState { peer_id: id, state });
            })
        }));

        let tx = events.clone();
        let id = peer_id.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let tx = tx.clone();
            let id = id.clone();
            Box::pin(async move {
                let _ = tx.send(PeerEvent::NegotiationNeeded { peer_id: id });
            })
        }));

        let tx = events.clone();
        let id = peer_id.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = tx.clone();
            let id = id.clone();
            Box::pin(async move {
                debug!(peer_id = %id, kind = %track.kind(), "Remote track received");
                let _ = tx.send(PeerEvent::RemoteTrack {
                    peer_id: id,
                    track,
                });
            })
        }));

        let audio_sender = pc
            .add_track(media.audio_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| PeerError::Track(e.to_string()))?;

        let mut peer = Self {
            meta,
            role,
            phase: match role {
                Role::Initiator => NegotiationPhase::Fresh,
                Role::Responder => NegotiationPhase::AwaitingRemoteOffer,
            },
            pc,
            making_offer: false,
            needs_renegotiation: false,
            pending_remote_candidates: VecDeque::new(),
            audio_sender,
            screen_video_sender: None,
            screen_audio_sender: None,
            restart: RestartPolicy::default(),
            restart_due: None,
            degraded_since: None,
            quality: QualitySnapshot::unknown(),
        };

        if let Some(screen) = media.screen() {
            peer.attach_screen(screen).await?;
        }

        Ok(peer)
    }

    /// Create and install an offer, returning its SDP for the wire.
    ///
    /// Only initiators offer; a responder's negotiation-needed signal is
    /// ignored. Returns `None` when suppressed (`making_offer` guard, or
    /// an offer already in flight) — the pending change is replayed after
    /// the current cycle settles.
    pub async fn start_offer(&mut self, ice_restart: bool) -> Result<Option<String>, PeerError> {
        if self.role != Role::Initiator || self.phase == NegotiationPhase::Closed {
            return Ok(None);
        }
        if self.making_offer || (self.phase == NegotiationPhase::AwaitingAnswer && !ice_restart) {
            self.needs_renegotiation = true;
            return Ok(None);
        }

        self.making_offer = true;
        self.phase = NegotiationPhase::OfferingLocal;
        let result = self.offer_cycle(ice_restart).await;
        self.making_offer = false;

        match result {
            Ok(sdp) => {
                self.phase = NegotiationPhase::AwaitingAnswer;
                Ok(Some(sdp))
            }
            Err(e) => {
                self.phase = NegotiationPhase::Fresh;
                Err(e)
            }
        }
    }

    async fn offer_cycle(&self, ice_restart: bool) -> Result<String, PeerError> {
        let options = ice_restart.then_some(RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer.sdp)
    }

    /// Install a remote answer. Returns `false` when the answer arrived in
    /// the wrong state and was dropped.
    pub async fn apply_answer(&mut self, sdp: String) -> Result<bool, PeerError> {
        if self.phase != NegotiationPhase::AwaitingAnswer
            || self.pc.signaling_state() != RTCSignalingState::HaveLocalOffer
        {
            return Ok(false);
        }
        let answer =
            RTCSessionDescription::answer(sdp).map_err(|e| PeerError::Sdp(e.to_string()))?;
        self.pc.set_remote_description(answer).await?;
        self.flush_pending_candidates().await;
        self.phase = NegotiationPhase::Established;
        Ok(true)
    }

    /// Install a remote offer and produce the answer SDP (responder side).
    /// Returns `None` when the offer arrived in an impossible state and
    /// was dropped.
    pub async fn apply_offer(&mut self, sdp: String) -> Result<Option<String>, PeerError> {
        if self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer {
            // Cannot happen under fixed roles; the platform offers no
            // rollback, so the offending SDP is dropped.
            return Ok(None);
        }
        let offer =
            RTCSessionDescription::offer(sdp).map_err(|e| PeerError::Sdp(e.to_string()))?;
        self.pc.set_remote_description(offer).await?;
        self.flush_pending_candidates().await;

        self.phase = NegotiationPhase::Answering;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        self.phase = NegotiationPhase::Established;
        Ok(Some(answer.sdp))
    }

    /// Install a remote ICE candidate, buffering it when the remote
    /// description is not set yet. Returns `true` when buffered.
    pub async fn add_remote_candidate(&mut self, payload: IceCandidatePayload) -> bool {
        let init = RTCIceCandidateInit {
            candidate: payload.candidate,
            sdp_mid: Some(payload.sdp_mid),
            sdp_mline_index: Some(payload.sdp_mline_index),
            username_fragment: None,
        };
        if self.pc.remote_description().await.is_none() {
            self.pending_remote_candidates.push_back(init);
            return true;
        }
        if let Err(e) = self.pc.add_ice_candidate(init).await {
            // Malformed candidates are dropped, never propagated.
            warn!(peer_id = %self.meta.peer_id, error = %e, "Dropped bad ICE candidate");
        }
        false
    }

    /// Install buffered candidates in arrival order, each exactly once.
    async fn flush_pending_candidates(&mut self) {
        while let Some(init) = self.pending_remote_candidates.pop_front() {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                warn!(peer_id = %self.meta.peer_id, error = %e, "Dropped buffered ICE candidate");
            }
        }
    }

    #[must_use]
    pub fn pending_candidates(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    /// Add the screen-share senders. New peers get them at creation time;
    /// existing peers renegotiate through the initiator's next offer.
    pub async fn attach_screen(&mut self, tracks: &ScreenTracks) -> Result<(), PeerError> {
        if self.screen_video_sender.is_none() {
            let sender = self
                .pc
                .add_track(tracks.video.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| PeerError::Track(e.to_string()))?;
            self.screen_video_sender = Some(sender);
        }
        if let (Some(audio), None) = (&tracks.audio, &self.screen_audio_sender) {
            let sender = self
                .pc
                .add_track(audio.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| PeerError::Track(e.to_string()))?;
            self.screen_audio_sender = Some(sender);
        }
        Ok(())
    }

    /// Remove the screen-share senders.
    pub async fn detach_screen(&mut self) -> Result<(), PeerError> {
        if let Some(sender) = self.screen_video_sender.take() {
            self.pc
                .remove_track(&sender)
                .await
                .map_err(|e| PeerError::Track(e.to_string()))?;
        }
        if let Some(sender) = self.screen_audio_sender.take() {
            self.pc
                .remove_track(&sender)
                .await
                .map_err(|e| PeerError::Track(e.to_string()))?;
        }
        Ok(())
    }

    /// Point the audio sender at a replacement track (microphone switch);
    /// no renegotiation.
    pub async fn replace_audio(
        &self,
        track: Arc<webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP>,
    ) -> Result<(), PeerError> {
        self.audio_sender
            .replace_track(Some(track as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| PeerError::Track(e.to_string()))
    }

    pub async fn close(&mut self) {
        self.phase = NegotiationPhase::Closed;
        if let Err(e) = self.pc.close().await {
            warn!(peer_id = %self.meta.peer_id, error = %e, "Error closing peer connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_policy_caps_attempts() {
        let mut policy = RestartPolicy::default();
        let mut now = Instant::now();

        assert_eq!(policy.decide(now), RestartDecision::Restart(1));
        now += RestartPolicy::COOLDOWN;
        assert_eq!(policy.decide(now), RestartDecision::Restart(2));
        now += RestartPolicy::COOLDOWN;
        assert_eq!(policy.decide(now), RestartDecision::Restart(3));
        now += RestartPolicy::COOLDOWN;
        assert_eq!(policy.decide(now), RestartDecision::Exhausted);
    }

    #[test]
    fn restart_policy_enforces_cooldown() {
        let mut policy = RestartPolicy::default();
        let start = Instant::now();

        assert_eq!(policy.decide(start), RestartDecision::Restart(1));
        let early = start + Duration::from_secs(2);
        assert_eq!(
            policy.decide(early),
            RestartDecision::Cooldown(start + RestartPolicy::COOLDOWN)
        );
        // Attempts are not burned while cooling down.
        assert_eq!(policy.attempts(), 1);
    }

    #[tokio::test]
    async fn api_builds_with_codecs() {
        assert!(build_api().is_ok());
    }

    #[tokio::test]
    async fn candidates_buffer_until_remote_description() {
        let api = build_api().expect("api");
        let media = LocalMedia::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let meta = PeerMeta {
            peer_id: "p1".into(),
            user_id: "u1".into(),
            username: "u1".into(),
            avatar_url: None,
            muted: false,
            deafened: false,
            screen_sharing: false,
        };
        let mut peer = RemotePeer::connect(&api, vec![], meta, Role::Responder, &media, &tx)
            .await
            .expect("peer");

        let payload = IceCandidatePayload {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host".into(),
            sdp_mid: "0".into(),
            sdp_mline_index: 0,
        };
        // No remote description yet: both go to the FIFO, in order.
        assert!(peer.add_remote_candidate(payload.clone()).await);
        assert!(peer.add_remote_candidate(payload).await);
        assert_eq!(peer.pending_candidates(), 2);

        peer.close().await;
    }
}
