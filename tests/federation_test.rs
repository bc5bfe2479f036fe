//! Federation tests: supernode peering, community propagation, anchors.
//!
//! Run with: cargo test --test federation_test

use std::path::Path;
use vesper::config::SnConfig;
use vesper::crypto::{SnKeypair, derive_static_key};
use vesper::mgmt::events::EventBus;
use vesper::net::autoip::AutoIpPool;
use vesper::net::community::{Acl, Registry};
use vesper::net::dispatch::handle_datagram;
use vesper::net::session::{self, SnState};
use vesper::net::types::NakReason;
use vesper::net::wire::{
    Body, DataPacket, Datagram, HeaderProtection, Register, RegisterSuper, RegisterSuperAck,
    decode, encode,
};
use vesper::types::{Mac, PeerSocket};

const FED: &str = "*Federation";

fn build_state(acl: Option<&str>) -> SnState {
    let cfg = SnConfig::default().validate().unwrap();
    let pool =
        AutoIpPool::new(cfg.auto_ip_pool_min, cfg.auto_ip_pool_max, cfg.auto_ip_prefix).unwrap();
    let mut registry =
        Registry::new(pool, FED, cfg.header_encryption_default, SnKeypair::generate()).unwrap();
    if let Some(text) = acl {
        registry.apply_acl(&Acl::parse(text, Path::new(".")).unwrap()).unwrap();
    }
    let sock = PeerSocket::udp("198.51.100.7:7654".parse().unwrap());
    SnState::new(cfg, registry, EventBus::new(), sock)
}

fn mac(last: u8) -> Mac {
    Mac([0x02, 0xaa, 0, 0, 0, last])
}

fn sn_sock(last: u8) -> PeerSocket {
    PeerSocket::udp(format!("203.0.113.{last}:7654").parse().unwrap())
}

fn fed_sealed(dgram: &Datagram) -> Vec<u8> {
    encode(dgram, &HeaderProtection::Static(derive_static_key(FED))).unwrap()
}

fn super_body(mac: Mac, communities: &[&str]) -> RegisterSuper {
    RegisterSuper {
        cookie: 31,
        mac,
        version: "vesper-0.9.0".into(),
        uptime: 7200,
        selection: 5,
        communities: communities.iter().map(|s| s.to_string()).collect(),
    }
}

// =============================================================================
// PEERING
// =============================================================================

#[tokio::test]
async fn test_01_register_super_acks_and_merges_communities() {
    let mut state = build_state(None);
    // One local edge community.
    session::register_edge(
        &mut state,
        &vesper::net::wire::Header { ttl: 2, flags: 0, community: "alpha".into() },
        &Register { cookie: 1, mac: Mac([2, 0, 0, 0, 0, 9]), version: "edge".into() },
        PeerSocket::udp("192.0.2.9:30000".parse().unwrap()),
        None,
        1000,
    );

    let dgram = Datagram::new(FED, Body::RegisterSuper(super_body(mac(1), &["beta", "gamma"])));
    let out = handle_datagram(&mut state, sn_sock(1), &fed_sealed(&dgram), 1000);

    assert_eq!(out.len(), 1);
    let (reply, ident) = decode(&out[0].bytes, &state.registry).unwrap();
    assert_eq!(ident.unwrap().community, FED);
    let Body::RegisterSuperAck(ack) = reply.body else {
        panic!("expected RegisterSuperAck");
    };
    assert_eq!(ack.cookie, 31);
    assert!(ack.communities.contains(&"alpha".to_string()));

    // The remote supernode is now a federation peer with its roster.
    let peer = state.registry.federation().edges.get(mac(1)).unwrap();
    assert_eq!(peer.selection, 5);
    assert_eq!(peer.uptime, 7200);
    assert_eq!(peer.fed_communities, vec!["beta".to_string(), "gamma".to_string()]);

    // Unknown communities were merged and flagged as federation-learned.
    for name in ["beta", "gamma"] {
        let c = state.registry.find(name).unwrap();
        assert!(c.is_federation);
    }
    assert_eq!(state.stats.sn_reg_super, 1);
}

#[tokio::test]
async fn test_02_register_super_refused_for_foreign_federation() {
    let mut state = build_state(None);
    let dgram = Datagram::new(
        "*OtherFed",
        Body::RegisterSuper(super_body(mac(1), &[])),
    );
    // Seal with our key so the header itself decodes.
    let bytes = encode(
        &dgram,
        &HeaderProtection::Clear,
    )
    .unwrap();
    let out = handle_datagram(&mut state, sn_sock(1), &bytes, 1000);
    assert_eq!(out.len(), 1);
    let (reply, _) = decode(&out[0].bytes, &state.registry).unwrap();
    assert!(matches!(
        reply.body,
        Body::RegisterSuperNak(ref n) if n.reason == NakReason::Community
    ));
    assert!(state.registry.federation().edges.is_empty());
}

#[tokio::test]
async fn test_03_super_ack_refreshes_anchor_and_parses_selection() {
    let mut state = build_state(None);
    session::seed_anchors(
        &mut state,
        &[("s1.example:7654".to_string(), Some(sn_sock(1)))],
        1000,
    );

    let ack = Datagram::new(
        FED,
        Body::RegisterSuperAck(RegisterSuperAck {
            cookie: 8,
            mac: mac(1),
            selection: 42,
            communities: vec!["delta".into()],
        }),
    );
    handle_datagram(&mut state, sn_sock(1), &fed_sealed(&ack), 2000);

    // The anchor record adopted the MAC, refreshed, and kept its pin.
    let peer = state.registry.federation().edges.get(mac(1)).unwrap();
    assert_eq!(peer.last_seen, 2000);
    assert_eq!(peer.selection, 42);
    assert!(!peer.purgeable);
    assert_eq!(peer.hostname.as_deref(), Some("s1.example:7654"));
    assert!(state.registry.find("delta").is_some());
    assert_eq!(state.registry.federation().edges.len(), 1);
}

// =============================================================================
// ANCHORS & TICKS
// =============================================================================

#[tokio::test]
async fn test_04_federation_tick_targets_resolved_anchors() {
    let mut state = build_state(Some("alpha\n"));
    session::seed_anchors(
        &mut state,
        &[
            ("s1.example:7654".to_string(), Some(sn_sock(1))),
            ("s2.example:7654".to_string(), None),
        ],
        1000,
    );

    let out = session::federation_tick(&mut state, 1000);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].to, sn_sock(1));

    let (dgram, ident) = decode(&out[0].bytes, &state.registry).unwrap();
    assert_eq!(ident.unwrap().community, FED);
    let Body::RegisterSuper(body) = dgram.body else {
        panic!("expected RegisterSuper");
    };
    assert_eq!(body.mac, state.mac);
    assert_eq!(body.communities, vec!["alpha".to_string()]);

    // Late resolution brings the second anchor into the next round.
    assert_eq!(session::unresolved_anchors(&state), vec!["s2.example:7654".to_string()]);
    session::bind_anchor(&mut state, "s2.example:7654", sn_sock(2));
    let out = session::federation_tick(&mut state, 1030);
    assert_eq!(out.len(), 2);
    assert!(session::unresolved_anchors(&state).is_empty());
}

#[tokio::test]
async fn test_05_purge_expires_supernodes_late_and_anchors_never() {
    let mut state = build_state(None);
    let ttl = state.cfg.registration_ttl;
    let fed_ttl = state.cfg.federation_ttl();
    assert!(fed_ttl > ttl);

    session::seed_anchors(&mut state, &[("s1.example:7654".to_string(), Some(sn_sock(1)))], 1000);
    state.registry.federation_mut().edges.upsert(mac(2), sn_sock(2), 1000);

    // Past the edge TTL the purgeable supernode is still kept...
    session::purge_sweep(&mut state, 1000 + ttl + 1);
    assert_eq!(state.registry.federation().edges.len(), 2);

    // ...until the federation TTL runs out; the anchor survives forever.
    session::purge_sweep(&mut state, 1000 + fed_ttl + 1);
    let fed = &state.registry.federation().edges;
    assert_eq!(fed.len(), 1);
    assert!(fed.iter().all(|p| !p.purgeable));
}

// =============================================================================
// PROPAGATION (S2 learns beta from S1, then relays broadcasts for it)
// =============================================================================

#[tokio::test]
async fn test_06_learned_community_gets_broadcast_relay() {
    let mut state = build_state(None);

    // Remote supernode announces it serves 'beta'.
    let dgram = Datagram::new(FED, Body::RegisterSuper(super_body(mac(1), &["beta"])));
    handle_datagram(&mut state, sn_sock(1), &fed_sealed(&dgram), 1000);

    // A local edge joins beta here.
    let reg = Datagram::new(
        "beta",
        Body::Register(Register { cookie: 2, mac: Mac([2, 0, 0, 0, 0, 7]), version: "edge".into() }),
    );
    let edge = PeerSocket::udp("192.0.2.7:30000".parse().unwrap());
    let out = handle_datagram(&mut state, edge, &encode(&reg, &HeaderProtection::Clear).unwrap(), 1001);
    assert!(matches!(
        decode(&out[0].bytes, &state.registry).unwrap().0.body,
        Body::RegisterAck(_)
    ));

    // Its broadcast is relayed to the supernode that serves beta.
    let bcast = Datagram::new(
        "beta",
        Body::Packet(DataPacket {
            src_mac: Mac([2, 0, 0, 0, 0, 7]),
            dst_mac: Mac::BROADCAST,
            transform: 0,
            frame: vec![1, 2, 3],
        }),
    );
    let out =
        handle_datagram(&mut state, edge, &encode(&bcast, &HeaderProtection::Clear).unwrap(), 1002);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].to, sn_sock(1));
}

#[tokio::test]
async fn test_07_relayed_broadcast_is_delivered_by_the_receiving_supernode() {
    // Two supernodes, one edge in 'beta' on each side.
    let mut s1 = build_state(None);
    let mut s2 = build_state(None);

    // Peer them: each learns the other's socket and that it serves beta.
    let hello_s2 = Datagram::new(FED, Body::RegisterSuper(super_body(mac(2), &["beta"])));
    handle_datagram(&mut s1, sn_sock(2), &fed_sealed(&hello_s2), 1000);
    let hello_s1 = Datagram::new(FED, Body::RegisterSuper(super_body(mac(1), &["beta"])));
    handle_datagram(&mut s2, sn_sock(1), &fed_sealed(&hello_s1), 1000);

    let e1 = Mac([2, 0, 0, 0, 0, 0x11]);
    let e2 = Mac([2, 0, 0, 0, 0, 0x22]);
    let e1_sock = PeerSocket::udp("192.0.2.11:30000".parse().unwrap());
    let e2_sock = PeerSocket::udp("192.0.2.22:30000".parse().unwrap());
    for (state, mac, sock) in [(&mut s1, e1, e1_sock), (&mut s2, e2, e2_sock)] {
        let reg = Datagram::new(
            "beta",
            Body::Register(Register { cookie: 3, mac, version: "edge".into() }),
        );
        let out =
            handle_datagram(state, sock, &encode(&reg, &HeaderProtection::Clear).unwrap(), 1001);
        assert!(matches!(
            decode(&out[0].bytes, &state.registry).unwrap().0.body,
            Body::RegisterAck(_)
        ));
    }

    // e1 broadcasts at S1; one copy heads for S2.
    let bcast = Datagram::new(
        "beta",
        Body::Packet(DataPacket {
            src_mac: e1,
            dst_mac: Mac::BROADCAST,
            transform: 0,
            frame: vec![9, 9, 9],
        }),
    );
    let out =
        handle_datagram(&mut s1, e1_sock, &encode(&bcast, &HeaderProtection::Clear).unwrap(), 1002);
    let to_s2: Vec<_> = out.iter().filter(|o| o.to == sn_sock(2)).collect();
    assert_eq!(to_s2.len(), 1);

    // S2 decodes the copy under beta and fans it out to its local edge:
    // no NAK for the foreign source MAC, no second federation hop.
    let out = handle_datagram(&mut s2, sn_sock(1), &to_s2[0].bytes, 1003);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].to, e2_sock);
    let (delivered, _) = decode(&out[0].bytes, &s2.registry).unwrap();
    let Body::Packet(p) = delivered.body else {
        panic!("expected Packet");
    };
    assert_eq!(p.src_mac, e1);
    assert!(p.dst_mac.is_broadcast());
    assert_eq!(s2.stats.sn_reg_nak, 0);
    assert_eq!(s2.stats.sn_broadcast, 1);
}
