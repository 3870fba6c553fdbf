//! End-to-end signaling tests over a real WebSocket.
//!
//! Spins the router up on an ephemeral port and drives it with
//! tokio-tungstenite clients, the way the desktop client does.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use concord_server::api::{create_router, AppState};
use concord_server::auth::StaticTokenValidator;
use concord_server::config::Config;
use concord_server::permissions::AllowAll;
use concord_server::presence::NoopPresence;
use concord_signal::{
    Envelope, EnvelopeKind, ErrorPayload, NullSink, PeerListPayload, PeerMeta, RoomKey,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server(config: Config) -> (SocketAddr, AppState) {
    let auth = StaticTokenValidator::new([
        ("tok-a".to_string(), "user-a".to_string()),
        ("tok-b".to_string(), "user-b".to_string()),
        ("tok-c".to_string(), "user-c".to_string()),
        ("tok-d".to_string(), "user-d".to_string()),
    ]);
    let state = AppState::new(
        config,
        Arc::new(auth),
        Arc::new(AllowAll),
        Arc::new(NoopPresence),
        Arc::new(NullSink),
    );
    let app = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, state)
}

async fn connect(addr: SocketAddr, token: &str) -> WsClient {
    let (stream, _) = connect_async(format!("ws://{addr}/ws?token={token}"))
        .await
        .expect("websocket connect");
    stream
}

fn room() -> RoomKey {
    RoomKey::new("srv-1", "general")
}

fn meta(peer_id: &str, user_id: &str) -> PeerMeta {
    PeerMeta {
        peer_id: peer_id.into(),
        user_id: user_id.into(),
        username: format!("name-{user_id}"),
        avatar_url: None,
        muted: false,
        deafened: false,
        screen_sharing: false,
    }
}

async fn send(ws: &mut WsClient, envelope: &Envelope) {
    ws.send(Message::Text(envelope.encode().into()))
        .await
        .expect("ws send");
}

/// Next envelope, skipping transport-level frames.
async fn recv(ws: &mut WsClient) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await.expect("stream open").expect("frame") {
                Message::Text(text) => return Envelope::parse(text.as_str()).expect("envelope"),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for envelope")
}

async fn join(ws: &mut WsClient, peer_id: &str, user_id: &str) -> PeerListPayload {
    send(ws, &Envelope::join(&room(), &meta(peer_id, user_id))).await;
    let list = recv(ws).await;
    assert_eq!(list.kind, EnvelopeKind::PeerList);
    list.decode_payload().expect("peer_list payload")
}

#[tokio::test]
async fn invalid_token_rejects_the_upgrade() {
    let (addr, _state) = spawn_server(Config::default_for_test()).await;
    let result = connect_async(format!("ws://{addr}/ws?token=wrong")).await;
    assert!(result.is_err(), "upgrade must be rejected");
}

#[tokio::test]
async fn three_peer_mesh_signaling() {
    let (addr, _state) = spawn_server(Config::default_for_test()).await;

    let mut a = connect(addr, "tok-a").await;
    let list = join(&mut a, "pa", "user-a").await;
    assert!(list.peers.is_empty());

    let mut b = connect(addr, "tok-b").await;
    let list = join(&mut b, "pb", "user-b").await;
    assert_eq!(list.peers.len(), 1);
    assert_eq!(list.peers[0].peer_id, "pa");

    let joined = recv(&mut a).await;
    assert_eq!(joined.kind, EnvelopeKind::PeerJoined);
    let joined_meta: PeerMeta = joined.decode_payload().unwrap();
    assert_eq!(joined_meta.peer_id, "pb");

    let mut c = connect(addr, "tok-c").await;
    let list = join(&mut c, "pc", "user-c").await;
    let ids: Vec<&str> = list.peers.iter().map(|p| p.peer_id.as_str()).collect();
    assert_eq!(ids, vec!["pa", "pb"]);

    assert_eq!(recv(&mut a).await.kind, EnvelopeKind::PeerJoined);
    assert_eq!(recv(&mut b).await.kind, EnvelopeKind::PeerJoined);

    // pb initiates toward pa (pa was in pb's peer_list); the offer is
    // forwarded verbatim with the server-stamped sender.
    send(&mut b, &Envelope::sdp_offer(&room(), "pa", "v=0 offer")).await;
    let offer = recv(&mut a).await;
    assert_eq!(offer.kind, EnvelopeKind::SdpOffer);
    assert_eq!(offer.from, "pb");

    send(&mut a, &Envelope::sdp_answer(&room(), "pb", "v=0 answer")).await;
    let answer = recv(&mut b).await;
    assert_eq!(answer.kind, EnvelopeKind::SdpAnswer);
    assert_eq!(answer.from, "pa");
}

#[tokio::test]
async fn room_full_rejects_the_last_joiner() {
    let mut config = Config::default_for_test();
    config.max_channel_users = 3;
    let (addr, state) = spawn_server(config).await;

    let mut a = connect(addr, "tok-a").await;
    join(&mut a, "pa", "user-a").await;
    let mut b = connect(addr, "tok-b").await;
    join(&mut b, "pb", "user-b").await;
    let mut c = connect(addr, "tok-c").await;
    join(&mut c, "pc", "user-c").await;

    let mut d = connect(addr, "tok-d").await;
    send(&mut d, &Envelope::join(&room(), &meta("pd", "user-d"))).await;
    let rejection = recv(&mut d).await;
    assert_eq!(rejection.kind, EnvelopeKind::Error);
    let payload: ErrorPayload = rejection.decode_payload().unwrap();
    assert_eq!(payload.code.as_deref(), Some("room_full"));

    assert_eq!(state.registry.snapshot_room(&room()).await.len(), 3);
}

#[tokio::test]
async fn transport_drop_broadcasts_peer_left() {
    let (addr, state) = spawn_server(Config::default_for_test()).await;

    let mut a = connect(addr, "tok-a").await;
    join(&mut a, "pa", "user-a").await;
    let mut b = connect(addr, "tok-b").await;
    join(&mut b, "pb", "user-b").await;
    recv(&mut a).await; // peer_joined(pb)

    // Kill pb's transport without a leave envelope.
    drop(b);

    let left = recv(&mut a).await;
    assert_eq!(left.kind, EnvelopeKind::PeerLeft);
    let left_meta: PeerMeta = left.decode_payload().unwrap();
    assert_eq!(left_meta.peer_id, "pb");

    assert_eq!(state.registry.snapshot_room(&room()).await.len(), 1);
}

#[tokio::test]
async fn ping_envelopes_are_consumed_not_forwarded() {
    let (addr, _state) = spawn_server(Config::default_for_test()).await;

    let mut a = connect(addr, "tok-a").await;
    join(&mut a, "pa", "user-a").await;
    let mut b = connect(addr, "tok-b").await;
    join(&mut b, "pb", "user-b").await;
    recv(&mut a).await; // peer_joined(pb)

    send(&mut b, &Envelope::ping(&room())).await;
    // A state change right after: the first thing pa sees is the state
    // broadcast, never the keepalive.
    send(
        &mut b,
        &Envelope::peer_state(
            &room(),
            &concord_signal::PeerStatePayload {
                peer_id: "pb".into(),
                muted: true,
                deafened: false,
                screen_sharing: false,
            },
        ),
    )
    .await;

    let next = recv(&mut a).await;
    assert_eq!(next.kind, EnvelopeKind::PeerState);
}

#[tokio::test]
async fn undecodable_frames_answer_with_error_envelope() {
    let (addr, _state) = spawn_server(Config::default_for_test()).await;

    let mut a = connect(addr, "tok-a").await;
    a.send(Message::Text("this is not json".into()))
        .await
        .unwrap();

    let reply = recv(&mut a).await;
    assert_eq!(reply.kind, EnvelopeKind::Error);
    let payload: ErrorPayload = reply.decode_payload().unwrap();
    assert_eq!(payload.code.as_deref(), Some("malformed"));
}

#[tokio::test]
async fn routed_envelope_before_join_is_not_a_member() {
    let (addr, _state) = spawn_server(Config::default_for_test()).await;

    let mut a = connect(addr, "tok-a").await;
    send(&mut a, &Envelope::sdp_offer(&room(), "pb", "v=0")).await;

    let reply = recv(&mut a).await;
    assert_eq!(reply.kind, EnvelopeKind::Error);
    let payload: ErrorPayload = reply.decode_payload().unwrap();
    assert_eq!(payload.code.as_deref(), Some("not_a_member"));
}

#[tokio::test]
async fn join_with_foreign_identity_is_denied() {
    let (addr, _state) = spawn_server(Config::default_for_test()).await;

    let mut a = connect(addr, "tok-a").await;
    // Token resolves to user-a; claiming user-b must fail.
    send(&mut a, &Envelope::join(&room(), &meta("pa", "user-b"))).await;

    let reply = recv(&mut a).await;
    assert_eq!(reply.kind, EnvelopeKind::Error);
    let payload: ErrorPayload = reply.decode_payload().unwrap();
    assert_eq!(payload.code.as_deref(), Some("denied"));
}

#[tokio::test]
async fn unknown_envelope_types_are_ignored() {
    let (addr, _state) = spawn_server(Config::default_for_test()).await;

    let mut a = connect(addr, "tok-a").await;
    a.send(Message::Text(
        r#"{"type":"hologram","server_id":"srv-1","channel_id":"general"}"#.into(),
    ))
    .await
    .unwrap();

    // Still healthy: a normal join works afterwards.
    let list = join(&mut a, "pa", "user-a").await;
    assert!(list.peers.is_empty());
}

#[tokio::test]
async fn ice_servers_endpoint_requires_auth_and_returns_servers() {
    let (addr, _state) = spawn_server(Config::default_for_test()).await;
    let client = reqwest::Client::new();

    let unauthorized = client
        .get(format!("http://{addr}/api/voice/ice-servers"))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), 401);

    let response = client
        .get(format!("http://{addr}/api/voice/ice-servers"))
        .bearer_auth("tok-a")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let config: concord_signal::IceConfigResponse = response.json().await.unwrap();
    assert!(!config.servers.is_empty());
    assert!(config.servers[0].urls[0].starts_with("stun:"));
}

#[tokio::test]
async fn room_snapshot_endpoint_reflects_membership() {
    let (addr, _state) = spawn_server(Config::default_for_test()).await;

    let mut a = connect(addr, "tok-a").await;
    join(&mut a, "pa", "user-a").await;

    let snapshot: Vec<PeerMeta> = reqwest::Client::new()
        .get(format!("http://{addr}/api/voice/rooms/srv-1/general"))
        .bearer_auth("tok-b")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].peer_id, "pa");
}
