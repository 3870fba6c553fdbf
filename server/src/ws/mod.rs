//! Signaling Transport
//!
//! One WebSocket per voice peer. Each envelope is a single JSON text frame;
//! envelopes are handled strictly in arrival order. The socket task is the
//! only place transport I/O happens — the room registry merely enqueues
//! into the peer's bounded queue, which this task drains.

use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::header;
use axum::http::HeaderMap;
use axum::response::Response;
use concord_signal::{Envelope, EnvelopeKind, RoomKey};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::select;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::rooms::{CloseReason, PeerSender, Registration};
use crate::rooms::{LeaveReason, RegistryError};

/// WebSocket connection query params.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Access token, for platforms that cannot set custom headers.
    pub token: Option<String>,
}

/// WebSocket upgrade handler.
///
/// Authentication happens before the upgrade: bearer header if present,
/// `?token=` query parameter otherwise. Invalid credentials reject the
/// upgrade with 401 (`unauthorized`).
pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let token = bearer_token(&headers).or(query.token);
    let user_id = token.and_then(|t| state.auth.validate(&t));

    let Some(user_id) = user_id else {
        return Response::builder()
            .status(401)
            .body(CloseReason::Unauthorized.as_str().into())
            .unwrap_or_default();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

/// Extract a bearer credential from the `Authorization` header.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

/// Counts malformed envelopes in a sliding one-minute window.
struct MalformedMeter {
    window_start: Instant,
    count: u32,
    limit: u32,
}

impl MalformedMeter {
    fn new(limit: u32) -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
            limit,
        }
    }

    /// Record one malformed envelope; true once the rate is abusive.
    fn record(&mut self) -> bool {
        if self.window_start.elapsed().as_secs() >= 60 {
            self.window_start = Instant::now();
            self.count = 0;
        }
        self.count += 1;
        self.count > self.limit
    }
}

/// Handle one peer's WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState, user_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (peer_tx, mut peer_rx) = PeerSender::channel(state.config.outbound_buffer);
    let mut registration: Option<Registration> = None;
    let mut malformed = MalformedMeter::new(state.config.malformed_per_minute);

    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    info!(user_id = %user_id, "Signaling transport connected");

    let close_reason = loop {
        select! {
            // Inbound frames, strictly in arrival order.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        match handle_text(&state, &user_id, &peer_tx, &mut registration, &mut malformed, text.as_str()).await {
                            ControlFlow::Continue => {}
                            ControlFlow::Close(reason) => break Some(reason),
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(user_id = %user_id, "Peer closed signaling transport");
                        break None;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        // Envelopes are JSON text frames only.
                        last_seen = Instant::now();
                        if malformed.record() {
                            break Some(CloseReason::ProtocolAbuse);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(user_id = %user_id, error = %e, "Signaling transport error");
                        break None;
                    }
                    None => break None,
                }
            }

            // Outbound envelopes enqueued by the room registry.
            env = peer_rx.envelopes.recv() => {
                match env {
                    Some(env) => {
                        if ws_tx.send(Message::Text(env.encode().into())).await.is_err() {
                            break None;
                        }
                    }
                    None => break None,
                }
            }

            // Protocol-level heartbeat and idle cutoff.
            _ = heartbeat.tick() => {
                if last_seen.elapsed() >= state.config.heartbeat_timeout {
                    break Some(CloseReason::HeartbeatTimeout);
                }
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break None;
                }
            }

            // Registry-initiated close (slow consumer, superseded, ...).
            changed = peer_rx.closed.changed() => {
                if changed.is_err() {
                    break None;
                }
                let reason = *peer_rx.closed.borrow();
                if let Some(reason) = reason {
                    break Some(reason);
                }
            }
        }
    };

    if let Some(reason) = close_reason {
        info!(user_id = %user_id, reason = reason.as_str(), "Closing signaling transport");
        let frame = CloseFrame {
            code: close_code(reason),
            reason: reason.as_str().into(),
        };
        let _ = ws_tx.send(Message::Close(Some(frame))).await;
    }

    // Transport teardown removes the peer from its room before this task
    // ends; nothing can be dispatched to it afterwards.
    if let Some(reg) = registration.take() {
        state
            .registry
            .leave(&reg.peer_id, LeaveReason::TransportLost)
            .await;
    }

    info!(user_id = %user_id, "Signaling transport disconnected");
}

enum ControlFlow {
    Continue,
    Close(CloseReason),
}

/// Decode and dispatch one inbound text frame.
async fn handle_text(
    state: &AppState,
    user_id: &str,
    peer_tx: &PeerSender,
    registration: &mut Option<Registration>,
    malformed: &mut MalformedMeter,
    text: &str,
) -> ControlFlow {
    let envelope = match Envelope::parse(text) {
        Ok(env) => env,
        Err(e) => {
            debug!(user_id = %user_id, error = %e, "Undecodable envelope");
            let scope = RoomKey::new("", "");
            let _ = peer_tx.send(Envelope::error(&scope, "malformed", "undecodable envelope"));
            if malformed.record() {
                return ControlFlow::Close(CloseReason::ProtocolAbuse);
            }
            return ControlFlow::Continue;
        }
    };

    // `from` on inbound traffic is never trusted; the registry stamps the
    // registered peer ID on everything it forwards.
    match envelope.kind {
        EnvelopeKind::Ping => {
            // Keepalive. Never forwarded.
        }
        EnvelopeKind::Join => {
            // Joining while registered moves the peer: implicit leave first.
            if let Some(reg) = registration.take() {
                state.registry.leave(&reg.peer_id, LeaveReason::Client).await;
            }
            match enforce_identity(&envelope, user_id) {
                Ok(env) => match state.registry.join(&env, peer_tx.clone()).await {
                    Ok(reg) => *registration = Some(reg),
                    Err(err) => {
                        let _ = peer_tx.send(Envelope::error(
                            &env.room_key(),
                            err.code(),
                            err.to_string(),
                        ));
                    }
                },
                Err(err) => {
                    let _ = peer_tx.send(Envelope::error(
                        &envelope.room_key(),
                        err.code(),
                        err.to_string(),
                    ));
                }
            }
        }
        EnvelopeKind::Leave => {
            if let Some(reg) = registration.take() {
                state.registry.leave(&reg.peer_id, LeaveReason::Client).await;
            }
        }
        kind if kind.is_routable() => match registration.as_ref() {
            Some(reg) => {
                if let Err(err) = state.registry.route(reg, envelope.clone()).await {
                    let _ = peer_tx.send(Envelope::error(
                        &envelope.room_key(),
                        err.code(),
                        err.to_string(),
                    ));
                }
            }
            None => {
                let err = RegistryError::NotAMember;
                let _ = peer_tx.send(Envelope::error(
                    &envelope.room_key(),
                    err.code(),
                    err.to_string(),
                ));
            }
        },
        // Server-originated kinds arriving from a client, and unknown
        // types from newer peers: silently ignored.
        _ => {}
    }

    ControlFlow::Continue
}

/// The join payload's user identity must match the authenticated one.
fn enforce_identity(envelope: &Envelope, user_id: &str) -> Result<Envelope, RegistryError> {
    let meta: concord_signal::PeerMeta = envelope
        .decode_payload()
        .ok_or(RegistryError::Malformed("join"))?;
    if meta.user_id != user_id {
        return Err(RegistryError::Denied);
    }
    Ok(envelope.clone())
}

/// Application close codes (4000 range is private use).
const fn close_code(reason: CloseReason) -> u16 {
    match reason {
        CloseReason::Unauthorized => 4001,
        CloseReason::SlowConsumer => 4002,
        CloseReason::HeartbeatTimeout => 4003,
        CloseReason::ProtocolAbuse => 4004,
        CloseReason::Superseded => 4005,
    }
}
