//! Room registry integration tests.
//!
//! Drives the registry through in-memory transports: every peer is a
//! bounded envelope queue, exactly as the WebSocket layer wires it.

use std::sync::Arc;
use std::time::Duration;

use concord_server::config::Config;
use concord_server::permissions::{AllowAll, DenyAll};
use concord_server::presence::NoopPresence;
use concord_server::rooms::{
    CloseReason, LeaveReason, PeerReceiver, PeerSender, Registration, RegistryError, RoomRegistry,
};
use concord_signal::{Envelope, EnvelopeKind, NullSink, PeerListPayload, PeerMeta, RoomKey};

fn registry_with(config: Config) -> RoomRegistry {
    RoomRegistry::new(
        Arc::new(config),
        Arc::new(AllowAll),
        Arc::new(NoopPresence),
        Arc::new(NullSink),
    )
}

fn registry() -> RoomRegistry {
    registry_with(Config::default_for_test())
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

async fn join(
    registry: &RoomRegistry,
    room: &RoomKey,
    peer_id: &str,
    user_id: &str,
) -> Result<(Registration, PeerReceiver), RegistryError> {
    join_buffered(registry, room, peer_id, user_id, 64).await
}

async fn join_buffered(
    registry: &RoomRegistry,
    room: &RoomKey,
    peer_id: &str,
    user_id: &str,
    buffer: usize,
) -> Result<(Registration, PeerReceiver), RegistryError> {
    let (sender, receiver) = PeerSender::channel(buffer);
    let envelope = Envelope::join(room, &meta(peer_id, user_id));
    let registration = registry.join(&envelope, sender).await?;
    Ok((registration, receiver))
}

fn try_recv(receiver: &mut PeerReceiver) -> Option<Envelope> {
    receiver.envelopes.try_recv().ok()
}

fn expect_kind(receiver: &mut PeerReceiver, kind: EnvelopeKind) -> Envelope {
    let envelope = try_recv(receiver).expect("expected a queued envelope");
    assert_eq!(envelope.kind, kind);
    envelope
}

#[tokio::test]
async fn join_fans_out_peer_list_then_peer_joined() {
    let registry = registry();
    let key = room();

    let (_a, mut rx_a) = join(&registry, &key, "pa", "ua").await.unwrap();
    let list = expect_kind(&mut rx_a, EnvelopeKind::PeerList);
    let payload: PeerListPayload = list.decode_payload().unwrap();
    assert!(payload.peers.is_empty());
    assert!(payload.channel_started_at > 0);

    let (_b, mut rx_b) = join(&registry, &key, "pb", "ub").await.unwrap();
    let list = expect_kind(&mut rx_b, EnvelopeKind::PeerList);
    let payload: PeerListPayload = list.decode_payload().unwrap();
    assert_eq!(payload.peers.len(), 1);
    assert_eq!(payload.peers[0].peer_id, "pa");

    // Existing member saw the join before anything else from pb.
    let joined = expect_kind(&mut rx_a, EnvelopeKind::PeerJoined);
    let joined_meta: PeerMeta = joined.decode_payload().unwrap();
    assert_eq!(joined_meta.peer_id, "pb");

    let (_c, mut rx_c) = join(&registry, &key, "pc", "uc").await.unwrap();
    let list = expect_kind(&mut rx_c, EnvelopeKind::PeerList);
    let payload: PeerListPayload = list.decode_payload().unwrap();
    // Ordered by join time.
    let ids: Vec<&str> = payload.peers.iter().map(|p| p.peer_id.as_str()).collect();
    assert_eq!(ids, vec!["pa", "pb"]);

    expect_kind(&mut rx_a, EnvelopeKind::PeerJoined);
    expect_kind(&mut rx_b, EnvelopeKind::PeerJoined);
}

#[tokio::test]
async fn capacity_is_enforced_at_the_boundary() {
    let mut config = Config::default_for_test();
    config.max_channel_users = 3;
    let registry = registry_with(config);
    let key = room();

    let (_a, mut rx_a) = join(&registry, &key, "pa", "ua").await.unwrap();
    let (_b, _rx_b) = join(&registry, &key, "pb", "ub").await.unwrap();
    // One slot left: this join succeeds.
    let (_c, _rx_c) = join(&registry, &key, "pc", "uc").await.unwrap();

    // At capacity: the next join is rejected and nothing is broadcast.
    let err = join(&registry, &key, "pd", "ud").await.unwrap_err();
    assert_eq!(err, RegistryError::RoomFull { max: 3 });
    assert_eq!(err.code(), "room_full");

    // Drain pa's queue: two peer_joined events, no more.
    expect_kind(&mut rx_a, EnvelopeKind::PeerList);
    expect_kind(&mut rx_a, EnvelopeKind::PeerJoined);
    expect_kind(&mut rx_a, EnvelopeKind::PeerJoined);
    assert!(try_recv(&mut rx_a).is_none());

    assert_eq!(registry.snapshot_room(&key).await.len(), 3);
}

#[tokio::test]
async fn join_then_leave_restores_prior_state() {
    let registry = registry();
    let key = room();

    let (_a, mut rx_a) = join(&registry, &key, "pa", "ua").await.unwrap();
    let list = expect_kind(&mut rx_a, EnvelopeKind::PeerList);
    let started_at = list
        .decode_payload::<PeerListPayload>()
        .unwrap()
        .channel_started_at;

    let (b, _rx_b) = join(&registry, &key, "pb", "ub").await.unwrap();
    registry.leave(&b.peer_id, LeaveReason::Client).await;

    expect_kind(&mut rx_a, EnvelopeKind::PeerJoined);
    let left = expect_kind(&mut rx_a, EnvelopeKind::PeerLeft);
    let left_meta: PeerMeta = left.decode_payload().unwrap();
    assert_eq!(left_meta.peer_id, "pb");

    // Membership identical, started_at unchanged for the next joiner.
    let snapshot = registry.snapshot_room(&key).await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].peer_id, "pa");

    let (_c, mut rx_c) = join(&registry, &key, "pc", "uc").await.unwrap();
    let list: PeerListPayload = expect_kind(&mut rx_c, EnvelopeKind::PeerList)
        .decode_payload()
        .unwrap();
    assert_eq!(list.channel_started_at, started_at);
}

#[tokio::test]
async fn sole_member_leave_empties_and_collects_the_room() {
    let registry = registry();
    let key = room();

    let (a, _rx_a) = join(&registry, &key, "pa", "ua").await.unwrap();
    assert_eq!(registry.room_count().await, 1);

    registry.leave(&a.peer_id, LeaveReason::Client).await;
    assert_eq!(registry.room_count().await, 0);
    assert!(registry.snapshot_room(&key).await.is_empty());
}

#[tokio::test]
async fn peer_is_in_at_most_one_room() {
    let registry = registry();
    let key_one = RoomKey::new("srv-1", "one");
    let key_two = RoomKey::new("srv-1", "two");

    let (_first, mut rx_first) = join(&registry, &key_one, "pa", "ua").await.unwrap();

    // Same user, same peer ID, different room: the stale registration is
    // superseded rather than duplicated.
    let (_second, _rx_second) = join(&registry, &key_two, "pa", "ua").await.unwrap();

    assert!(registry.snapshot_room(&key_one).await.is_empty());
    assert_eq!(registry.snapshot_room(&key_two).await.len(), 1);

    // The old transport was told to close.
    assert_eq!(*rx_first.closed.borrow(), Some(CloseReason::Superseded));
}

#[tokio::test]
async fn routed_envelopes_are_stamped_and_never_self_addressed() {
    let registry = registry();
    let key = room();

    let (a, mut rx_a) = join(&registry, &key, "pa", "ua").await.unwrap();
    let (_b, mut rx_b) = join(&registry, &key, "pb", "ub").await.unwrap();
    expect_kind(&mut rx_a, EnvelopeKind::PeerList);
    expect_kind(&mut rx_a, EnvelopeKind::PeerJoined);
    expect_kind(&mut rx_b, EnvelopeKind::PeerList);

    // Forged `from` is overwritten with the registered peer ID.
    let mut offer = Envelope::sdp_offer(&key, "pb", "v=0");
    offer.from = "pb".into();
    registry.route(&a, offer).await.unwrap();

    let delivered = expect_kind(&mut rx_b, EnvelopeKind::SdpOffer);
    assert_eq!(delivered.from, "pa");

    // A self-addressed envelope is dropped.
    let self_offer = Envelope::sdp_offer(&key, "pa", "v=0");
    registry.route(&a, self_offer).await.unwrap();
    assert!(try_recv(&mut rx_a).is_none());
    assert!(try_recv(&mut rx_b).is_none());
}

#[tokio::test]
async fn unicast_to_departed_peer_is_dropped_silently() {
    let registry = registry();
    let key = room();

    let (a, _rx_a) = join(&registry, &key, "pa", "ua").await.unwrap();
    let (b, _rx_b) = join(&registry, &key, "pb", "ub").await.unwrap();
    let (_c, _rx_c) = join(&registry, &key, "pc", "uc").await.unwrap();
    registry.leave(&b.peer_id, LeaveReason::Client).await;

    let offer = Envelope::sdp_offer(&key, "pb", "v=0");
    assert!(registry.route(&a, offer).await.is_ok());
}

#[tokio::test]
async fn route_from_non_member_errors() {
    let registry = registry();
    let key = room();

    let (a, _rx_a) = join(&registry, &key, "pa", "ua").await.unwrap();
    let (_b, _rx_b) = join(&registry, &key, "pb", "ub").await.unwrap();
    registry.leave(&a.peer_id, LeaveReason::Client).await;

    let offer = Envelope::sdp_offer(&key, "pb", "v=0");
    let err = registry.route(&a, offer).await.unwrap_err();
    assert_eq!(err, RegistryError::NotAMember);
}

#[tokio::test]
async fn peer_state_broadcast_updates_authoritative_meta() {
    let registry = registry();
    let key = room();

    let (a, _rx_a) = join(&registry, &key, "pa", "ua").await.unwrap();
    let (_b, mut rx_b) = join(&registry, &key, "pb", "ub").await.unwrap();
    expect_kind(&mut rx_b, EnvelopeKind::PeerList);

    let state = Envelope::peer_state(
        &key,
        &concord_signal::PeerStatePayload {
            peer_id: "pa".into(),
            muted: true,
            deafened: false,
            screen_sharing: true,
        },
    );
    registry.route(&a, state).await.unwrap();

    let delivered = expect_kind(&mut rx_b, EnvelopeKind::PeerState);
    assert_eq!(delivered.from, "pa");

    // Late joiners see the folded state in their peer_list.
    let (_c, mut rx_c) = join(&registry, &key, "pc", "uc").await.unwrap();
    let list: PeerListPayload = expect_kind(&mut rx_c, EnvelopeKind::PeerList)
        .decode_payload()
        .unwrap();
    let pa = list.peers.iter().find(|p| p.peer_id == "pa").unwrap();
    assert!(pa.muted);
    assert!(pa.screen_sharing);
}

#[tokio::test]
async fn denied_join_never_registers() {
    let registry = RoomRegistry::new(
        Arc::new(Config::default_for_test()),
        Arc::new(DenyAll),
        Arc::new(NoopPresence),
        Arc::new(NullSink),
    );
    let key = room();

    let err = join(&registry, &key, "pa", "ua").await.unwrap_err();
    assert_eq!(err, RegistryError::Denied);
    assert_eq!(registry.room_count().await, 0);
}

#[tokio::test]
async fn slow_consumer_is_evicted_not_waited_on() {
    let registry = registry();
    let key = room();

    let (a, mut rx_a) = join(&registry, &key, "pa", "ua").await.unwrap();
    // pb's queue holds a single envelope; peer_list fills it.
    let (_b, rx_b) = join_buffered(&registry, &key, "pb", "ub", 1).await.unwrap();
    expect_kind(&mut rx_a, EnvelopeKind::PeerList);
    expect_kind(&mut rx_a, EnvelopeKind::PeerJoined);

    // The broadcast cannot be enqueued for pb: pb is evicted, pa still
    // gets the original state envelope plus pb's departure.
    let state = Envelope::peer_state(
        &key,
        &concord_signal::PeerStatePayload {
            peer_id: "pa".into(),
            muted: true,
            deafened: false,
            screen_sharing: false,
        },
    );
    registry.route(&a, state).await.unwrap();

    assert_eq!(*rx_b.closed.borrow(), Some(CloseReason::SlowConsumer));
    let left = expect_kind(&mut rx_a, EnvelopeKind::PeerLeft);
    let left_meta: PeerMeta = left.decode_payload().unwrap();
    assert_eq!(left_meta.peer_id, "pb");
    assert_eq!(registry.snapshot_room(&key).await.len(), 1);
}

#[tokio::test]
async fn reconnect_within_grace_reclaims_peer_id() {
    let registry = registry();
    let key = room();

    let (_a, _rx_a) = join(&registry, &key, "pa", "ua").await.unwrap();
    let (b, _rx_b) = join(&registry, &key, "pb", "ub").await.unwrap();

    // Unclean departure reserves the ID.
    registry.leave(&b.peer_id, LeaveReason::TransportLost).await;

    // Someone else cannot squat on it inside the window.
    let err = join(&registry, &key, "pb", "intruder").await.unwrap_err();
    assert_eq!(err, RegistryError::Denied);

    // The same user reclaims it.
    let (again, _rx) = join(&registry, &key, "pb", "ub").await.unwrap();
    assert_eq!(again.peer_id, "pb");
}

#[tokio::test]
async fn grace_reservation_expires() {
    let mut config = Config::default_for_test();
    config.reconnect_grace = Duration::from_millis(50);
    let registry = registry_with(config);
    let key = room();

    let (b, _rx_b) = join(&registry, &key, "pb", "ub").await.unwrap();
    registry.leave(&b.peer_id, LeaveReason::TransportLost).await;

    tokio::time::sleep(Duration::from_millis(80)).await;

    // Window passed: the ID is unreserved and free for anyone.
    let (taken, _rx) = join(&registry, &key, "pb", "someone-else").await.unwrap();
    assert_eq!(taken.peer_id, "pb");
}

#[tokio::test]
async fn empty_join_peer_id_gets_generated() {
    let registry = registry();
    let key = room();

    let (sender, mut receiver) = PeerSender::channel(8);
    let mut anonymous = meta("", "ua");
    anonymous.peer_id = String::new();
    let envelope = Envelope::join(&key, &anonymous);
    let registration = registry.join(&envelope, sender).await.unwrap();
    assert!(!registration.peer_id.is_empty());
    expect_kind(&mut receiver, EnvelopeKind::PeerList);
}
