//! Signaling connection manager.
//!
//! One WebSocket to the coordination server, with a `ping` envelope every
//! 10 s (belt and suspenders against idle proxies; the server also pings
//! at the protocol level) and automatic reconnection with exponential
//! backoff. An intentional close never reconnects.

use std::time::Duration;

use concord_signal::{Envelope, RoomKey};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Client keepalive cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);
/// Reconnect backoff base, cap and budget.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_CAP: Duration = Duration::from_secs(10);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("WebSocket connect failed: {0}")]
    Connect(String),
    #[error("Signaling connection is closed")]
    Closed,
}

/// Connection lifecycle and traffic, delivered in arrival order.
#[derive(Debug)]
pub enum SignalingEvent {
    /// Transport is up. `attempt > 0` marks a successful reconnect.
    Connected { attempt: u32 },
    Envelope(Envelope),
    Reconnecting { attempt: u32 },
    /// Reconnect budget exhausted; the session is lost.
    Lost,
}

/// Handle to the signaling connection task.
pub struct SignalingClient {
    out_tx: mpsc::Sender<Envelope>,
    shutdown_tx: mpsc::Sender<()>,
}

impl SignalingClient {
    /// Open the signaling connection and spawn its task.
    ///
    /// The initial connect is awaited so a bad address or rejected token
    /// fails the join immediately; later drops reconnect in background.
    pub async fn connect(
        server_url: &str,
        token: &str,
        room: RoomKey,
    ) -> Result<(Self, mpsc::Receiver<SignalingEvent>), SignalingError> {
        let url = build_ws_url(server_url, token);
        let (stream, _) = connect_async(&url)
            .await
            .map_err(|e| SignalingError::Connect(e.to_string()))?;

        let (out_tx, out_rx) = mpsc::channel::<Envelope>(64);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let (events_tx, events_rx) = mpsc::channel::<SignalingEvent>(256);

        tokio::spawn(connection_loop(
            stream,
            url,
            room,
            out_rx,
            shutdown_rx,
            events_tx,
        ));

        Ok((
            Self {
                out_tx,
                shutdown_tx,
            },
            events_rx,
        ))
    }

    /// In-memory stand-in for session tests: outbound envelopes land on
    /// the returned receiver instead of a socket.
    #[cfg(test)]
    pub(crate) fn test_pair() -> (Self, mpsc::Receiver<Envelope>) {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (shutdown_tx, _shutdown_rx) = mpsc::channel(1);
        (
            Self {
                out_tx,
                shutdown_tx,
            },
            out_rx,
        )
    }

    /// Send an envelope to the server.
    pub async fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        self.out_tx
            .send(envelope)
            .await
            .map_err(|_| SignalingError::Closed)
    }

    /// Intentional close: suppresses reconnection.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

enum ConnectionEnd {
    Shutdown,
    Dropped,
}

/// Main connection loop with reconnection logic.
async fn connection_loop(
    mut stream: WsStream,
    url: String,
    room: RoomKey,
    mut out_rx: mpsc::Receiver<Envelope>,
    mut shutdown_rx: mpsc::Receiver<()>,
    events: mpsc::Sender<SignalingEvent>,
) {
    let mut attempt = 0u32;

    loop {
        if events
            .send(SignalingEvent::Connected { attempt })
            .await
            .is_err()
        {
            return;
        }
        attempt = 0;

        match run_connection(stream, &room, &mut out_rx, &mut shutdown_rx, &events).await {
            ConnectionEnd::Shutdown => {
                info!("Signaling shutdown requested");
                return;
            }
            ConnectionEnd::Dropped => {}
        }

        // Connection lost - attempt reconnection.
        loop {
            attempt += 1;
            if attempt > MAX_RECONNECT_ATTEMPTS {
                let _ = events.send(SignalingEvent::Lost).await;
                return;
            }
            let _ = events.send(SignalingEvent::Reconnecting { attempt }).await;

            let backoff = reconnect_backoff(attempt);
            info!(attempt, ?backoff, "Reconnecting signaling transport");
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                _ = shutdown_rx.recv() => return,
            }

            match connect_async(&url).await {
                Ok((s, _)) => {
                    stream = s;
                    break;
                }
                Err(e) => warn!(attempt, error = %e, "Reconnect failed"),
            }
        }
    }
}

/// Pump one live connection until it drops or shutdown is requested.
async fn run_connection(
    stream: WsStream,
    room: &RoomKey,
    out_rx: &mut mpsc::Receiver<Envelope>,
    shutdown_rx: &mut mpsc::Receiver<()>,
    events: &mpsc::Sender<SignalingEvent>,
) -> ConnectionEnd {
    let (mut write, mut read) = stream.split();

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match Envelope::parse(text.as_str()) {
                            Ok(envelope) => {
                                if events.send(SignalingEvent::Envelope(envelope)).await.is_err() {
                                    return ConnectionEnd::Shutdown;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "Undecodable envelope from server");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            return ConnectionEnd::Dropped;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("Server closed signaling connection");
                        return ConnectionEnd::Dropped;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Signaling transport error");
                        return ConnectionEnd::Dropped;
                    }
                    None => return ConnectionEnd::Dropped,
                    _ => {}
                }
            }

            envelope = out_rx.recv() => {
                match envelope {
                    Some(envelope) => {
                        if write.send(Message::Text(envelope.encode().into())).await.is_err() {
                            return ConnectionEnd::Dropped;
                        }
                    }
                    None => return ConnectionEnd::Shutdown,
                }
            }

            _ = ping.tick() => {
                let keepalive = Envelope::ping(room);
                if write.send(Message::Text(keepalive.encode().into())).await.is_err() {
                    return ConnectionEnd::Dropped;
                }
            }

            _ = shutdown_rx.recv() => {
                let _ = write.send(Message::Close(None)).await;
                return ConnectionEnd::Shutdown;
            }
        }
    }
}

/// Exponential backoff: base 1 s doubling to a 10 s cap, with jitter.
fn reconnect_backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << (attempt - 1).min(4));
    let capped = exp.min(BACKOFF_CAP);
    capped + Duration::from_millis(rand::thread_rng().gen_range(0..250))
}

/// Build the WebSocket URL with authentication token.
fn build_ws_url(server_url: &str, token: &str) -> String {
    let base = server_url
        .replace("http://", "ws://")
        .replace("https://", "wss://");
    format!("{}/ws?token={}", base.trim_end_matches('/'), token)
}
