//! Session engine tests: registration, keep-alive, purge, events.
//!
//! Run with: cargo test --test session_test

use std::path::Path;
use vesper::config::SnConfig;
use vesper::crypto::SnKeypair;
use vesper::mgmt::events::{EventBus, Topic};
use vesper::net::autoip::{AutoIpPool, edge_ip};
use vesper::net::community::{Acl, Registry};
use vesper::net::session::{self, SnState};
use vesper::net::types::{FLAG_FROM_SUPERNODE, NakReason, PACKET_TTL};
use vesper::net::wire::{Body, Header, Register, UnregisterSuper, decode};
use vesper::types::PeerSocket;

fn build_state(acl: Option<&str>) -> SnState {
    let cfg = SnConfig::default().validate().unwrap();
    let pool =
        AutoIpPool::new(cfg.auto_ip_pool_min, cfg.auto_ip_pool_max, cfg.auto_ip_prefix).unwrap();
    let mut registry = Registry::new(
        pool,
        &cfg.federation_name,
        cfg.header_encryption_default,
        SnKeypair::generate(),
    )
    .unwrap();
    if let Some(text) = acl {
        registry.apply_acl(&Acl::parse(text, Path::new(".")).unwrap()).unwrap();
    }
    let sock = PeerSocket::udp("198.51.100.7:7654".parse().unwrap());
    SnState::new(cfg, registry, EventBus::new(), sock)
}

fn header(community: &str) -> Header {
    Header { ttl: PACKET_TTL, flags: 0, community: community.into() }
}

fn register_body(mac: &str, cookie: u32) -> Register {
    Register { cookie, mac: mac.parse().unwrap(), version: "edge-3.1".into() }
}

fn edge_sock(last: u8, port: u16) -> PeerSocket {
    PeerSocket::udp(format!("192.0.2.{last}:{port}").parse().unwrap())
}

// =============================================================================
// JOIN
// =============================================================================

#[tokio::test]
async fn test_01_join_acks_with_deterministic_auto_ip() {
    let mut state = build_state(None);
    let mut peer_events = state.events.subscribe(Topic::Peer);

    let src = edge_sock(10, 30000);
    let out = session::register_edge(
        &mut state,
        &header("alpha"),
        &register_body("02:00:00:00:00:01", 77),
        src,
        None,
        1000,
    );

    assert_eq!(out.len(), 1);
    assert_eq!(out[0].to, src);
    let (reply, _) = decode(&out[0].bytes, &state.registry).unwrap();
    assert_eq!(reply.header.community, "alpha");
    assert_ne!(reply.header.flags & FLAG_FROM_SUPERNODE, 0);
    let Body::RegisterAck(ack) = reply.body else {
        panic!("expected RegisterAck");
    };
    assert_eq!(ack.cookie, 77);
    assert_eq!(ack.observed, src.sock_addr());

    // The auto-IP is the pure function of (community, pool, MAC).
    let net = state.registry.find("alpha").unwrap().auto_net;
    assert_eq!(ack.auto_ip, edge_ip(net, "02:00:00:00:00:01".parse().unwrap()));
    assert_eq!(ack.auto_prefix, net.prefix);

    // Exactly one peer record, and a join event.
    assert_eq!(state.registry.find("alpha").unwrap().edges.len(), 1);
    let event = peer_events.try_recv().unwrap();
    assert!(event.contains("\"action\":\"join\""));
    assert_eq!(state.stats.sn_reg, 1);
}

#[tokio::test]
async fn test_02_reregister_is_idempotent() {
    let mut state = build_state(None);
    let src = edge_sock(10, 30000);
    let body = register_body("02:00:00:00:00:01", 1);

    session::register_edge(&mut state, &header("alpha"), &body, src, None, 1000);
    let mut peer_events = state.events.subscribe(Topic::Peer);
    session::register_edge(&mut state, &header("alpha"), &body, src, None, 1010);

    let community = state.registry.find("alpha").unwrap();
    assert_eq!(community.edges.len(), 1);
    assert_eq!(community.edges.get(body.mac).unwrap().last_seen, 1010);
    // No second join event.
    assert!(peer_events.try_recv().is_err());
}

#[tokio::test]
async fn test_03_socket_change_emits_move() {
    let mut state = build_state(None);
    let body = register_body("02:00:00:00:00:01", 1);
    session::register_edge(&mut state, &header("alpha"), &body, edge_sock(10, 30000), None, 1000);

    let mut peer_events = state.events.subscribe(Topic::Peer);
    session::register_edge(&mut state, &header("alpha"), &body, edge_sock(11, 40000), None, 1010);

    let event = peer_events.try_recv().unwrap();
    assert!(event.contains("\"action\":\"move\""));
    let peer = state.registry.find("alpha").unwrap().edges.get(body.mac).unwrap();
    assert_eq!(peer.sock, edge_sock(11, 40000));
}

// =============================================================================
// POLICY
// =============================================================================

#[tokio::test]
async fn test_04_acl_denies_unlisted_community() {
    let mut state = build_state(Some("alpha\n"));

    let out = session::register_edge(
        &mut state,
        &header("gamma"),
        &register_body("02:00:00:00:00:01", 5),
        edge_sock(10, 30000),
        None,
        1000,
    );
    let (reply, _) = decode(&out[0].bytes, &state.registry).unwrap();
    let Body::RegisterNak(nak) = reply.body else {
        panic!("expected RegisterNak");
    };
    assert_eq!(nak.reason, NakReason::Community);
    assert_eq!(nak.cookie, 5);
    assert_eq!(state.stats.sn_reg_nak, 1);

    let out = session::register_edge(
        &mut state,
        &header("alpha"),
        &register_body("02:00:00:00:00:01", 6),
        edge_sock(10, 30000),
        None,
        1000,
    );
    assert!(matches!(
        decode(&out[0].bytes, &state.registry).unwrap().0.body,
        Body::RegisterAck(_)
    ));
}

#[tokio::test]
async fn test_05_federation_name_rejected_for_edges() {
    let mut state = build_state(None);
    let out = session::register_edge(
        &mut state,
        &header("*Federation"),
        &register_body("02:00:00:00:00:01", 5),
        edge_sock(10, 30000),
        None,
        1000,
    );
    let (reply, _) = decode(&out[0].bytes, &state.registry).unwrap();
    assert!(matches!(reply.body, Body::RegisterNak(ref n) if n.reason == NakReason::Community));
}

#[tokio::test]
async fn test_06_mac_in_use_across_communities() {
    let mut state = build_state(Some("alpha\nbeta\n"));
    let body = register_body("02:00:00:00:00:01", 1);
    session::register_edge(&mut state, &header("alpha"), &body, edge_sock(10, 30000), None, 1000);

    // The same MAC shows up in another community from another socket.
    let out =
        session::register_edge(&mut state, &header("beta"), &body, edge_sock(11, 40000), None, 1001);
    let (reply, _) = decode(&out[0].bytes, &state.registry).unwrap();
    assert!(matches!(reply.body, Body::RegisterNak(ref n) if n.reason == NakReason::MacInUse));
    assert!(state.registry.find("beta").unwrap().edges.is_empty());
}

#[tokio::test]
async fn test_07_spoofing_protection_off_still_enforces_acl() {
    let mut state = build_state(Some("alpha\nbeta\n"));
    state.cfg.spoofing_protection = false;

    let body = register_body("02:00:00:00:00:01", 1);
    session::register_edge(&mut state, &header("alpha"), &body, edge_sock(10, 30000), None, 1000);

    // MAC uniqueness is no longer enforced...
    let out =
        session::register_edge(&mut state, &header("beta"), &body, edge_sock(11, 40000), None, 1001);
    assert!(matches!(
        decode(&out[0].bytes, &state.registry).unwrap().0.body,
        Body::RegisterAck(_)
    ));

    // ...but the ACL still is.
    let out = session::register_edge(
        &mut state,
        &header("gamma"),
        &register_body("02:00:00:00:00:02", 2),
        edge_sock(12, 50000),
        None,
        1002,
    );
    assert!(matches!(
        decode(&out[0].bytes, &state.registry).unwrap().0.body,
        Body::RegisterNak(ref n) if n.reason == NakReason::Community
    ));
}

#[tokio::test]
async fn test_08_acl_removed_community_serves_existing_only() {
    let mut state = build_state(Some("alpha\nbeta\n"));
    let old = register_body("02:00:00:00:00:01", 1);
    session::register_edge(&mut state, &header("alpha"), &old, edge_sock(10, 30000), None, 1000);

    // alpha disappears from the ACL.
    state
        .registry
        .apply_acl(&Acl::parse("beta\n", Path::new(".")).unwrap())
        .unwrap();

    // The resident edge keeps re-registering fine.
    let out =
        session::register_edge(&mut state, &header("alpha"), &old, edge_sock(10, 30000), None, 1100);
    assert!(matches!(
        decode(&out[0].bytes, &state.registry).unwrap().0.body,
        Body::RegisterAck(_)
    ));

    // A newcomer is refused.
    let out = session::register_edge(
        &mut state,
        &header("alpha"),
        &register_body("02:00:00:00:00:02", 2),
        edge_sock(11, 40000),
        None,
        1100,
    );
    assert!(matches!(
        decode(&out[0].bytes, &state.registry).unwrap().0.body,
        Body::RegisterNak(ref n) if n.reason == NakReason::Community
    ));
}

// =============================================================================
// LIFECYCLE
// =============================================================================

#[tokio::test]
async fn test_09_purge_removes_silent_edges_and_emits_leave() {
    let mut state = build_state(None);
    let ttl = state.cfg.registration_ttl;
    let body = register_body("02:00:00:00:00:01", 1);
    session::register_edge(&mut state, &header("alpha"), &body, edge_sock(10, 30000), None, 1000);

    let mut peer_events = state.events.subscribe(Topic::Peer);

    // Within TTL: survives the sweep.
    assert_eq!(session::purge_sweep(&mut state, 1000 + ttl), 0);

    // Past TTL: removed, leave event, gone from the table.
    assert_eq!(session::purge_sweep(&mut state, 1001 + ttl), 1);
    assert!(peer_events.try_recv().unwrap().contains("\"action\":\"leave\""));
    assert!(state.registry.find("alpha").unwrap().edges.is_empty());
    // The community itself stays resident.
    assert!(state.registry.find("alpha").is_some());
}

#[tokio::test]
async fn test_10_unregister_is_immediate() {
    let mut state = build_state(None);
    let body = register_body("02:00:00:00:00:01", 1);
    let src = edge_sock(10, 30000);
    session::register_edge(&mut state, &header("alpha"), &body, src, None, 1000);

    let mut peer_events = state.events.subscribe(Topic::Peer);
    session::unregister(
        &mut state,
        &header("alpha"),
        &UnregisterSuper { mac: body.mac },
        src,
    );
    assert!(state.registry.find("alpha").unwrap().edges.is_empty());
    assert!(peer_events.try_recv().unwrap().contains("\"action\":\"leave\""));
}

#[tokio::test]
async fn test_11_auth_naks_are_rate_limited_per_source() {
    let mut state = build_state(None);
    let src = edge_sock(10, 30000);

    let mut sent = 0;
    for _ in 0..10 {
        sent += session::nak_auth_failure(&mut state, src, 1000).len();
    }
    assert!(sent < 10);
    assert_eq!(state.stats.sn_reg_nak as usize, sent);
    assert!(state.stats.sn_drop > 0);

    // A different source has its own bucket.
    assert_eq!(session::nak_auth_failure(&mut state, edge_sock(11, 30000), 1000).len(), 1);
}
