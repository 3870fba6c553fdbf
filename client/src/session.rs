//! Voice session engine.
//!
//! One task owns the whole session: the peer map, local media, QoS,
//! diagnostics and voice activity. Signaling envelopes are applied
//! strictly in arrival order; media-stack callbacks re-enter through the
//! peer-event channel; mesh roles are fixed by how a pair first met
//! (`peer_list` ⇒ we initiate, `peer_joined` ⇒ we respond).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use concord_signal::{
    Envelope, EnvelopeKind, ErrorPayload, EventSink, IceCandidatePayload, PeerListPayload,
    PeerMeta, PeerStatePayload, RoomKey, SdpPayload, TracingSink, VoiceEvent,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::API;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::track::track_remote::TrackRemote;

use crate::activity::{SpeakerState, VoiceActivityMeter, SAMPLE_INTERVAL};
use crate::diagnostics::{DiagEvent, DiagLevel, DiagnosticsRing};
use crate::ice::{fetch_ice_config, to_rtc_ice_servers, IceConfigError};
use crate::media::{AudioWriter, LocalMedia, MediaError, ScreenTracks};
use crate::peer::{
    build_api, NegotiationPhase, PeerError, PeerEvent, RemotePeer, RestartDecision, Role,
    DEGRADE_GRACE, DISCONNECT_RESTART_GRACE,
};
use crate::qos::{QualitySnapshot, ScreenQosController, ScreenQosProfile};
use crate::signaling::{SignalingClient, SignalingError, SignalingEvent};
use crate::stats;

/// Stats sweep cadence.
const STATS_INTERVAL: Duration = Duration::from_secs(5);
/// Timer resolution for grace/cooldown deadlines.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(200);

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    IceConfig(#[from] IceConfigError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("Voice session task is gone")]
    SessionGone,
}

/// What the session needs to join a voice channel.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Coordination server base URL (http/https).
    pub server_url: String,
    /// Bearer credential.
    pub token: String,
    pub server_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub username: String,
    pub avatar_url: Option<String>,
    /// Advisory flag for the embedder's capture pipeline.
    pub noise_suppression: bool,
}

impl SessionConfig {
    #[must_use]
    pub fn room_key(&self) -> RoomKey {
        RoomKey::new(self.server_id.clone(), self.channel_id.clone())
    }
}

/// Advisory state surfaced to the embedding application.
pub enum SessionEvent {
    /// The room accepted us; the mesh to these peers is being built.
    Joined {
        peers: Vec<PeerMeta>,
        channel_started_at: i64,
    },
    PeerJoined(PeerMeta),
    PeerLeft {
        peer_id: String,
    },
    PeerStateChanged(PeerStatePayload),
    /// Inbound media; hand the track to the playback pipeline.
    RemoteTrack {
        peer_id: String,
        track: Arc<TrackRemote>,
    },
    SpeakingChanged(SpeakerState),
    QualityUpdated {
        peer_id: String,
        quality: QualitySnapshot,
    },
    ScreenProfileChanged(ScreenQosProfile),
    /// Fatal join failure (`room_full`, `denied`).
    JoinFailed {
        code: String,
        message: String,
    },
    /// Signaling reconnect budget exhausted.
    ConnectionLost,
}

enum SessionCommand {
    ToggleMute(oneshot::Sender<bool>),
    SetDeafened(bool),
    StartScreenShare {
        system_audio: bool,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    StopScreenShare(oneshot::Sender<Result<(), SessionError>>),
    ReplaceMicrophone(oneshot::Sender<AudioWriter>),
    ReportAudioLevel {
        peer_id: String,
        rms: f32,
    },
    Diagnostics(oneshot::Sender<Vec<DiagEvent>>),
    Leave(oneshot::Sender<()>),
}

/// Handle to a live voice session.
pub struct VoiceSession {
    cmd_tx: mpsc::Sender<SessionCommand>,
    self_peer_id: String,
    audio: AudioWriter,
    deafened_rx: watch::Receiver<bool>,
    qos_rx: watch::Receiver<ScreenQosProfile>,
}

impl VoiceSession {
    /// Resolve ICE, open signaling, and join the voice channel.
    ///
    /// Returns the session handle and the event stream. The `peer_list`
    /// answer arrives asynchronously as [`SessionEvent::Joined`].
    pub async fn connect(
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        let ice = fetch_ice_config(&config.server_url, &config.token).await?;
        let ice_servers = to_rtc_ice_servers(&ice);
        let (signaling, signal_rx) =
            SignalingClient::connect(&config.server_url, &config.token, config.room_key()).await?;
        Self::spawn(
            config,
            ice_servers,
            signaling,
            signal_rx,
            Arc::new(TracingSink),
        )
    }

    /// Assemble the engine and spawn its task. Split from [`connect`] so
    /// tests can drive the session over in-memory channels.
    pub(crate) fn spawn(
        config: SessionConfig,
        ice_servers: Vec<RTCIceServer>,
        signaling: SignalingClient,
        signal_rx: mpsc::Receiver<SignalingEvent>,
        sink: Arc<dyn EventSink>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SessionError> {
        let api = build_api()?;
        let media = LocalMedia::new();
        let self_peer_id = Uuid::new_v4().to_string();

        let audio = media.audio_writer();
        let deafened_rx = media.deafened_watch();
        let qos_rx = media.screen_qos_watch();

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();

        let engine = Engine {
            room: config.room_key(),
            config,
            self_peer_id: self_peer_id.clone(),
            api,
            ice_servers,
            media,
            peers: HashMap::new(),
            ring: DiagnosticsRing::new(),
            qos: ScreenQosController::default(),
            activity: VoiceActivityMeter::new(),
            muted: false,
            deafened: false,
            signaling,
            peer_tx,
            ui: ui_tx,
            sink,
            finished: false,
            intentional: false,
        };
        tokio::spawn(engine.run(signal_rx, cmd_rx, peer_rx));

        Ok((
            Self {
                cmd_tx,
                self_peer_id,
                audio,
                deafened_rx,
                qos_rx,
            },
            ui_rx,
        ))
    }

    /// Our peer ID for this connection.
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.self_peer_id
    }

    /// Writer the capture pipeline feeds packetized microphone audio into.
    #[must_use]
    pub fn audio_writer(&self) -> AudioWriter {
        self.audio.clone()
    }

    /// `true` while deafened; the playback pipeline silences all inbound
    /// audio elements when set.
    #[must_use]
    pub fn deafened_watch(&self) -> watch::Receiver<bool> {
        self.deafened_rx.clone()
    }

    /// Frame-rate/resolution caps for the screen capture pipeline.
    #[must_use]
    pub fn screen_qos_watch(&self) -> watch::Receiver<ScreenQosProfile> {
        self.qos_rx.clone()
    }

    /// Flip the microphone mute flag. Returns the new state.
    pub async fn toggle_mute(&self) -> Result<bool, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::ToggleMute(tx))
            .await
            .map_err(|_| SessionError::SessionGone)?;
        rx.await.map_err(|_| SessionError::SessionGone)
    }

    /// Deafen or undeafen. Deafening also forces mute.
    pub async fn set_deafened(&self, deafened: bool) -> Result<(), SessionError> {
        self.cmd_tx
            .send(SessionCommand::SetDeafened(deafened))
            .await
            .map_err(|_| SessionError::SessionGone)
    }

    /// Publish the screen-share tracks to every peer in the mesh.
    pub async fn start_screen_share(&self, system_audio: bool) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::StartScreenShare {
                system_audio,
                reply: tx,
            })
            .await
            .map_err(|_| SessionError::SessionGone)?;
        rx.await.map_err(|_| SessionError::SessionGone)?
    }

    /// Withdraw the screen-share tracks.
    pub async fn stop_screen_share(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::StopScreenShare(tx))
            .await
            .map_err(|_| SessionError::SessionGone)?;
        rx.await.map_err(|_| SessionError::SessionGone)?
    }

    /// Swap the microphone track (device change); returns the new writer.
    pub async fn replace_microphone(&self) -> Result<AudioWriter, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::ReplaceMicrophone(tx))
            .await
            .map_err(|_| SessionError::SessionGone)?;
        rx.await.map_err(|_| SessionError::SessionGone)
    }

    /// Feed one RMS sample from the playback pipeline (~120 ms cadence).
    pub fn report_audio_level(&self, peer_id: &str, rms: f32) {
        let _ = self.cmd_tx.try_send(SessionCommand::ReportAudioLevel {
            peer_id: peer_id.to_string(),
            rms,
        });
    }

    /// Snapshot of the diagnostics ring for post-mortems.
    pub async fn diagnostics(&self) -> Result<Vec<DiagEvent>, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Diagnostics(tx))
            .await
            .map_err(|_| SessionError::SessionGone)?;
        rx.await.map_err(|_| SessionError::SessionGone)
    }

    /// Leave the channel and tear the session down.
    pub async fn leave(self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Leave(tx))
            .await
            .map_err(|_| SessionError::SessionGone)?;
        rx.await.map_err(|_| SessionError::SessionGone)
    }
}

struct Engine {
    config: SessionConfig,
    room: RoomKey,
    self_peer_id: String,
    api: API,
    ice_servers: Vec<RTCIceServer>,
    media: LocalMedia,
    peers: HashMap<String, RemotePeer>,
    ring: DiagnosticsRing,
    qos: ScreenQosController,
    activity: VoiceActivityMeter,
    muted: bool,
    deafened: bool,
    signaling: SignalingClient,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    ui: mpsc::UnboundedSender<SessionEvent>,
    sink: Arc<dyn EventSink>,
    finished: bool,
    intentional: bool,
}

impl Engine {
    async fn run(
        mut self,
        mut signal_rx: mpsc::Receiver<SignalingEvent>,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        let mut activity_tick = tokio::time::interval(SAMPLE_INTERVAL);
        stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        activity_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.finished {
            tokio::select! {
                event = signal_rx.recv() => match event {
                    Some(event) => self.on_signaling(event).await,
                    None => self.finished = true,
                },
                command = cmd_rx.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.intentional = true;
                        self.finished = true;
                    }
                },
                event = peer_rx.recv() => {
                    if let Some(event) = event {
                        self.on_peer_event(event).await;
                    }
                },
                _ = stats_tick.tick() => self.sweep_stats().await,
                _ = housekeeping.tick() => self.housekeep().await,
                _ = activity_tick.tick() => self.sample_activity(),
            }
        }

        self.teardown().await;
    }

    async fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected { attempt } => {
                if attempt > 0 {
                    self.ring
                        .push(DiagLevel::Info, "ws:reconnect", format!("attempt {attempt}"));
                }
                // (Re)announce ourselves; within the grace window the
                // server lets us keep the same peer ID.
                self.send_join().await;
            }
            SignalingEvent::Reconnecting { attempt } => {
                self.ring
                    .push(DiagLevel::Warn, "ws:reconnect", format!("reconnecting {attempt}"));
            }
            SignalingEvent::Lost => {
                self.ring
                    .push(DiagLevel::Error, "ws:lost", "reconnect attempts exhausted");
                self.emit(SessionEvent::ConnectionLost);
                self.finished = true;
            }
            SignalingEvent::Envelope(envelope) => self.on_envelope(envelope).await,
        }
    }

    async fn on_envelope(&mut self, envelope: Envelope) {
        match envelope.kind {
            EnvelopeKind::PeerList => {
                let Some(payload) = envelope.decode_payload::<PeerListPayload>() else {
                    self.ring
                        .push(DiagLevel::Warn, "peer_list:drop", "malformed payload");
                    return;
                };
                self.emit(SessionEvent::Joined {
                    peers: payload.peers.clone(),
                    channel_started_at: payload.channel_started_at,
                });
                // We learned of them first: we initiate toward everyone.
                for meta in payload.peers {
                    self.create_peer(meta, Role::Initiator).await;
                }
            }
            EnvelopeKind::PeerJoined => {
                let Some(meta) = envelope.decode_payload::<PeerMeta>() else {
                    return;
                };
                if meta.peer_id == self.self_peer_id {
                    return;
                }
                self.emit(SessionEvent::PeerJoined(meta.clone()));
                // They learned of us from their peer_list: they initiate.
                self.create_peer(meta, Role::Responder).await;
            }
            EnvelopeKind::PeerLeft => {
                let Some(meta) = envelope.decode_payload::<PeerMeta>() else {
                    return;
                };
                if let Some(mut peer) = self.peers.remove(&meta.peer_id) {
                    peer.close().await;
                    self.activity.remove(&meta.peer_id);
                }
                self.emit(SessionEvent::PeerLeft {
                    peer_id: meta.peer_id,
                });
            }
            EnvelopeKind::PeerState => {
                let Some(state) = envelope.decode_payload::<PeerStatePayload>() else {
                    return;
                };
                if let Some(peer) = self.peers.get_mut(&state.peer_id) {
                    peer.meta.muted = state.muted;
                    peer.meta.deafened = state.deafened;
                    peer.meta.screen_sharing = state.screen_sharing;
                }
                self.emit(SessionEvent::PeerStateChanged(state));
            }
            EnvelopeKind::SdpOffer => self.on_sdp_offer(&envelope).await,
            EnvelopeKind::SdpAnswer => self.on_sdp_answer(&envelope).await,
            EnvelopeKind::IceCandidate => {
                let Some(payload) = envelope.decode_payload::<IceCandidatePayload>() else {
                    self.ring
                        .push(DiagLevel::Warn, "ice:candidate:drop", "malformed payload");
                    return;
                };
                if let Some(peer) = self.peers.get_mut(&envelope.from) {
                    peer.add_remote_candidate(payload).await;
                }
            }
            EnvelopeKind::Error => {
                let payload = envelope
                    .decode_payload::<ErrorPayload>()
                    .unwrap_or(ErrorPayload {
                        message: "unknown error".into(),
                        code: None,
                    });
                let code = payload.code.unwrap_or_default();
                if matches!(code.as_str(), "room_full" | "denied") {
                    self.emit(SessionEvent::JoinFailed {
                        code,
                        message: payload.message,
                    });
                    self.intentional = true;
                    self.finished = true;
                } else {
                    self.ring
                        .push(DiagLevel::Warn, "server:error", payload.message);
                }
            }
            // Keepalives, server-bound kinds, and anything newer than us.
            _ => {}
        }
    }

    async fn on_sdp_offer(&mut self, envelope: &Envelope) {
        let Some(payload) = envelope.decode_payload::<SdpPayload>() else {
            self.ring
                .push(DiagLevel::Warn, "sdp:offer:drop", "malformed payload");
            return;
        };
        let from = envelope.from.clone();
        let Some(peer) = self.peers.get_mut(&from) else {
            debug!(peer_id = %from, "Offer from unknown peer dropped");
            return;
        };
        if peer.role == Role::Initiator {
            // Glare residue: both sides can only offer if roles broke.
            self.ring
                .push(DiagLevel::Warn, "sdp:offer:drop", format!("offer from responder {from}"));
            return;
        }
        match peer.apply_offer(payload.sdp).await {
            Ok(Some(answer)) => {
                self.send(Envelope::sdp_answer(&self.room, &from, answer)).await;
            }
            Ok(None) => {
                self.ring
                    .push(DiagLevel::Warn, "sdp:offer:glare", format!("dropped offer from {from}"));
            }
            Err(e) => {
                self.ring
                    .push(DiagLevel::Warn, "sdp:offer:fail", e.to_string());
            }
        }
    }

    async fn on_sdp_answer(&mut self, envelope: &Envelope) {
        let Some(payload) = envelope.decode_payload::<SdpPayload>() else {
            self.ring
                .push(DiagLevel::Warn, "sdp:answer:drop", "malformed payload");
            return;
        };
        let from = envelope.from.clone();
        let (result, renegotiate) = {
            let Some(peer) = self.peers.get_mut(&from) else {
                return;
            };
            match peer.apply_answer(payload.sdp).await {
                Ok(true) => {
                    let pending = peer.needs_renegotiation;
                    peer.needs_renegotiation = false;
                    (Ok(true), pending)
                }
                other => (other, false),
            }
        };
        match result {
            Ok(true) => {
                if renegotiate {
                    self.kick_offer(&from, false).await;
                }
            }
            Ok(false) => {
                self.ring
                    .push(DiagLevel::Warn, "sdp:answer:drop", format!("unexpected answer from {from}"));
            }
            Err(e) => {
                self.ring
                    .push(DiagLevel::Warn, "sdp:answer:fail", e.to_string());
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::NegotiationNeeded { peer_id } => {
                self.kick_offer(&peer_id, false).await;
            }
            PeerEvent::LocalCandidate { peer_id, candidate } => {
                if self.peers.contains_key(&peer_id) {
                    self.send(Envelope::ice_candidate(&self.room, &peer_id, &candidate))
                        .await;
                }
            }
            PeerEvent::IceState { peer_id, state } => self.on_ice_state(&peer_id, state).await,
            PeerEvent::RemoteTrack { peer_id, track } => {
                self.emit(SessionEvent::RemoteTrack { peer_id, track });
            }
        }
    }

    async fn on_ice_state(&mut self, peer_id: &str, state: RTCIceConnectionState) {
        let now = Instant::now();
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        match state {
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                peer.restart_due = None;
                peer.degraded_since = None;
            }
            RTCIceConnectionState::Disconnected => {
                peer.degraded_since.get_or_insert(now);
                if peer.restart_due.is_none() {
                    peer.restart_due = Some(now + DISCONNECT_RESTART_GRACE);
                }
            }
            RTCIceConnectionState::Failed => {
                peer.degraded_since.get_or_insert(now);
                self.maybe_restart(peer_id).await;
            }
            _ => {}
        }
    }

    /// Issue an ICE restart if this side may and the budget allows it.
    async fn maybe_restart(&mut self, peer_id: &str) {
        let decision = {
            let Some(peer) = self.peers.get_mut(peer_id) else {
                return;
            };
            // Responders wait: the remote initiator restarts for the pair.
            if peer.role != Role::Initiator {
                return;
            }
            peer.restart_due = None;
            peer.restart.decide(Instant::now())
        };
        match decision {
            RestartDecision::Restart(attempt) => {
                self.ring
                    .push(DiagLevel::Warn, "ice:restart", format!("{peer_id} attempt {attempt}"));
                self.sink.emit(VoiceEvent::IceRestart {
                    peer_id: peer_id.to_string(),
                    attempt,
                });
                self.kick_offer(peer_id, true).await;
            }
            RestartDecision::Cooldown(ready_at) => {
                if let Some(peer) = self.peers.get_mut(peer_id) {
                    peer.restart_due = Some(ready_at);
                }
            }
            RestartDecision::Exhausted => {
                self.ring
                    .push(DiagLevel::Error, "ice:restart:exhausted", peer_id.to_string());
                self.drop_peer(peer_id, "restart_exhausted").await;
            }
        }
    }

    /// Create an offer toward a peer and put it on the wire.
    async fn kick_offer(&mut self, peer_id: &str, ice_restart: bool) {
        let offer = {
            let Some(peer) = self.peers.get_mut(peer_id) else {
                return;
            };
            match peer.start_offer(ice_restart).await {
                Ok(offer) => offer,
                Err(e) => {
                    self.ring
                        .push(DiagLevel::Warn, "sdp:offer:fail", e.to_string());
                    return;
                }
            }
        };
        if let Some(sdp) = offer {
            self.send(Envelope::sdp_offer(&self.room, peer_id, sdp)).await;
        }
    }

    async fn create_peer(&mut self, meta: PeerMeta, role: Role) {
        if meta.peer_id == self.self_peer_id || self.peers.contains_key(&meta.peer_id) {
            return;
        }
        let peer_id = meta.peer_id.clone();
        match RemotePeer::connect(
            &self.api,
            self.ice_servers.clone(),
            meta,
            role,
            &self.media,
            &self.peer_tx,
        )
        .await
        {
            Ok(peer) => {
                debug!(peer_id = %peer_id, ?role, "Peer connection created");
                self.peers.insert(peer_id, peer);
            }
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "Failed to create peer connection");
                self.ring
                    .push(DiagLevel::Error, "peer:create:fail", e.to_string());
            }
        }
    }

    /// Close and forget one peer. The session itself continues.
    async fn drop_peer(&mut self, peer_id: &str, reason: &str) {
        if let Some(mut peer) = self.peers.remove(peer_id) {
            peer.close().await;
            self.activity.remove(peer_id);
            self.ring
                .push(DiagLevel::Info, "peer:drop", format!("{peer_id}: {reason}"));
            self.emit(SessionEvent::PeerLeft {
                peer_id: peer_id.to_string(),
            });
        }
    }

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::ToggleMute(reply) => {
                self.muted = !self.muted;
                self.media.set_muted(self.muted);
                self.broadcast_state().await;
                let _ = reply.send(self.muted);
            }
            SessionCommand::SetDeafened(deafened) => {
                self.deafened = deafened;
                self.media.set_deafened(deafened);
                if deafened {
                    self.muted = true;
                }
                self.broadcast_state().await;
            }
            SessionCommand::StartScreenShare { system_audio, reply } => {
                let result = self.start_screen_share(system_audio).await;
                let _ = reply.send(result);
            }
            SessionCommand::StopScreenShare(reply) => {
                let result = self.stop_screen_share().await;
                let _ = reply.send(result);
            }
            SessionCommand::ReplaceMicrophone(reply) => {
                let track = self.media.replace_audio_track();
                for peer in self.peers.values() {
                    if let Err(e) = peer.replace_audio(track.clone()).await {
                        warn!(peer_id = %peer.meta.peer_id, error = %e, "Track replacement failed");
                    }
                }
                let _ = reply.send(self.media.audio_writer());
            }
            SessionCommand::ReportAudioLevel { peer_id, rms } => {
                let silenced = self
                    .peers
                    .get(&peer_id)
                    .is_some_and(|p| p.meta.muted || p.meta.deafened);
                self.activity.report(&peer_id, rms, silenced, Instant::now());
            }
            SessionCommand::Diagnostics(reply) => {
                let _ = reply.send(self.ring.snapshot());
            }
            SessionCommand::Leave(reply) => {
                self.intentional = true;
                self.finished = true;
                let _ = reply.send(());
            }
        }
    }

    async fn start_screen_share(&mut self, system_audio: bool) -> Result<(), SessionError> {
        self.media.start_screen(system_audio)?;
        let tracks: ScreenTracks = self
            .media
            .screen()
            .map(ScreenTracks::clone)
            .ok_or(MediaError::ScreenShareInactive)?;
        for peer in self.peers.values_mut() {
            peer.attach_screen(&tracks).await?;
        }
        self.qos.begin(Instant::now());
        self.media.apply_screen_profile(ScreenQosProfile::High);
        self.sink.emit(VoiceEvent::ScreenShareStarted {
            peer_id: self.self_peer_id.clone(),
        });
        self.broadcast_state().await;
        Ok(())
    }

    async fn stop_screen_share(&mut self) -> Result<(), SessionError> {
        self.media.stop_screen()?;
        for peer in self.peers.values_mut() {
            if let Err(e) = peer.detach_screen().await {
                warn!(peer_id = %peer.meta.peer_id, error = %e, "Screen sender removal failed");
            }
        }
        self.sink.emit(VoiceEvent::ScreenShareStopped {
            peer_id: self.self_peer_id.clone(),
        });
        self.broadcast_state().await;
        Ok(())
    }

    async fn sweep_stats(&mut self) {
        let mut snapshots = Vec::with_capacity(self.peers.len());
        let mut updates = Vec::with_capacity(self.peers.len());
        for (peer_id, peer) in &mut self.peers {
            if peer.phase != NegotiationPhase::Established {
                continue;
            }
            let quality = stats::collect_quality(&peer.pc).await;
            peer.quality = quality;
            snapshots.push(quality);
            updates.push((peer_id.clone(), quality));
        }

        for (peer_id, quality) in updates {
            self.sink.emit(VoiceEvent::PeerQuality {
                peer_id: peer_id.clone(),
                score: quality.score,
                rtt_ms: quality.rtt_ms,
                jitter_ms: quality.jitter_ms,
                loss_ratio: quality.loss_ratio,
            });
            self.emit(SessionEvent::QualityUpdated { peer_id, quality });
        }

        if self.media.is_screen_sharing() {
            if let Some(profile) = self.qos.evaluate(&snapshots, Instant::now()) {
                self.media.apply_screen_profile(profile);
                self.ring
                    .push(DiagLevel::Info, "qos:profile", profile.as_str());
                self.sink.emit(VoiceEvent::ScreenShareProfile {
                    peer_id: self.self_peer_id.clone(),
                    profile: profile.as_str().to_string(),
                });
                self.emit(SessionEvent::ScreenProfileChanged(profile));
            }
        }
    }

    /// Expire disconnect-grace and restart-cooldown deadlines.
    async fn housekeep(&mut self) {
        let now = Instant::now();
        let mut to_restart = Vec::new();
        let mut to_drop = Vec::new();
        for (peer_id, peer) in &self.peers {
            if let Some(since) = peer.degraded_since {
                if now >= since + DEGRADE_GRACE {
                    to_drop.push(peer_id.clone());
                    continue;
                }
            }
            if let (Some(due), Some(_)) = (peer.restart_due, peer.degraded_since) {
                if now >= due {
                    to_restart.push(peer_id.clone());
                }
            }
        }
        for peer_id in to_drop {
            self.ring
                .push(DiagLevel::Warn, "peer:degraded", peer_id.clone());
            self.drop_peer(&peer_id, "degraded").await;
        }
        for peer_id in to_restart {
            self.maybe_restart(&peer_id).await;
        }
    }

    fn sample_activity(&mut self) {
        let state = self.activity.tick(Instant::now());
        self.emit(SessionEvent::SpeakingChanged(state));
    }

    async fn send_join(&mut self) {
        let meta = self.local_meta();
        self.send(Envelope::join(&self.room, &meta)).await;
    }

    fn local_meta(&self) -> PeerMeta {
        PeerMeta {
            peer_id: self.self_peer_id.clone(),
            user_id: self.config.user_id.clone(),
            username: self.config.username.clone(),
            avatar_url: self.config.avatar_url.clone(),
            muted: self.muted,
            deafened: self.deafened,
            screen_sharing: self.media.is_screen_sharing(),
        }
    }

    async fn broadcast_state(&mut self) {
        let state = PeerStatePayload {
            peer_id: self.self_peer_id.clone(),
            muted: self.muted,
            deafened: self.deafened,
            screen_sharing: self.media.is_screen_sharing(),
        };
        self.send(Envelope::peer_state(&self.room, &state)).await;
    }

    async fn send(&mut self, envelope: Envelope) {
        if let Err(e) = self.signaling.send(envelope).await {
            self.ring.push(DiagLevel::Warn, "ws:send", e.to_string());
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.ui.send(event);
    }

    async fn teardown(&mut self) {
        if self.intentional {
            self.send(Envelope::leave(&self.room)).await;
            self.signaling.close().await;
        }
        let peer_ids: Vec<String> = self.peers.keys().cloned().collect();
        for peer_id in peer_ids {
            if let Some(mut peer) = self.peers.remove(&peer_id) {
                peer.close().await;
            }
        }
        info!(room = %self.room, "Voice session ended");
    }
}
