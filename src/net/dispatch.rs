//! Dispatch engine: classify each inbound datagram and handle it.
//!
//! One entry point per transport read: [`handle_datagram`] decodes,
//! classifies, mutates state through the session engine, and returns the
//! replies and forwards to emit. Transport-agnostic by design: the caller
//! tags the source socket UDP or TCP and routes each `Outgoing` by the
//! destination's tag.

use crate::types::{Mac, PeerSocket};
use tracing::{debug, trace, warn};

use super::session::{self, Outgoing, SnState};
use super::types::{FLAG_FROM_SUPERNODE, FLAG_RELAYED, NakReason};
use super::wire::{
    self, AuthenticatedIdentity, Body, Datagram, DataPacket, FederationInfo, Header, PeerInfo,
    QueryPeer, WireError,
};

pub fn handle_datagram(
    state: &mut SnState,
    src: PeerSocket,
    bytes: &[u8],
    now: u64,
) -> Vec<Outgoing> {
    let (dgram, ident) = match wire::decode(bytes, &state.registry) {
        Ok(decoded) => decoded,
        Err(WireError::AuthFailure) => {
            debug!("undecryptable header from {}", src);
            state.stats.rx_error += 1;
            return session::nak_auth_failure(state, src, now);
        }
        Err(e) => {
            trace!("dropping malformed datagram from {}: {}", src, e);
            state.stats.rx_error += 1;
            return Vec::new();
        }
    };

    let Datagram { header, body } = dgram;
    let ident = ident.as_ref();
    match body {
        Body::Register(ref b) => session::register_edge(state, &header, b, src, ident, now),
        Body::RegisterSuper(ref b) => session::register_super(state, &header, b, src, ident, now),
        Body::RegisterSuperAck(ref b) => {
            session::handle_super_ack(state, &header, b, src, ident, now);
            Vec::new()
        }
        Body::RegisterSuperNak(ref b) => {
            warn!("federation registration refused by {}: {}", src, b.reason);
            Vec::new()
        }
        Body::UnregisterSuper(ref b) => {
            session::unregister(state, &header, b, src);
            Vec::new()
        }
        Body::Packet(b) => handle_packet(state, header, b, src, ident, now),
        Body::QueryPeer(ref b) => handle_query(state, &header, b, src, ident, now),
        Body::PeerInfo(ref b) => handle_peer_info(state, &header, b, now),
        // The remaining kinds are replies we originate; inbound they are
        // stray.
        _ => {
            state.stats.sn_errors += 1;
            Vec::new()
        }
    }
}

/// Community checks shared by the traffic paths: the community must exist
/// and the presented identity must satisfy its header mode. Returns the
/// sender's username when all holds.
fn admit_sender<'a>(
    state: &mut SnState,
    header: &Header,
    ident: Option<&'a AuthenticatedIdentity>,
) -> Result<Option<&'a str>, ()> {
    let Some(community) = state.registry.find(&header.community) else {
        state.stats.rx_error += 1;
        return Err(());
    };
    let mode = community.mode;
    match mode {
        crate::crypto::HeaderMode::None => Ok(None),
        crate::crypto::HeaderMode::Static => {
            if ident.is_some() {
                Ok(None)
            } else {
                state.stats.rx_error += 1;
                Err(())
            }
        }
        crate::crypto::HeaderMode::User => match ident.and_then(|i| i.username.as_deref()) {
            Some(user) => Ok(Some(user)),
            None => {
                state.stats.rx_error += 1;
                Err(())
            }
        },
    }
}

// =============================================================================
// PACKET FORWARDING
// =============================================================================

fn handle_packet(
    state: &mut SnState,
    header: Header,
    body: DataPacket,
    src: PeerSocket,
    ident: Option<&AuthenticatedIdentity>,
    now: u64,
) -> Vec<Outgoing> {
    state.stats.rx_packet += 1;
    let mut out = Vec::new();

    let Ok(_sender_user) = admit_sender(state, &header, ident) else {
        return out;
    };
    let name = header.community.clone();

    // Traffic relayed by a federated supernode carries source MACs of
    // edges registered over there, not here; the unregistered-source gate
    // applies to local senders only.
    let from_peer_sn = header.flags & FLAG_FROM_SUPERNODE != 0
        && state.registry.federation().edges.get_by_sock(src).is_some();

    if from_peer_sn {
        // Keep the relaying supernode fresh; the null MAC resolves through
        // the socket index.
        state.registry.federation_mut().edges.upsert(Mac::NULL, src, now);
    } else {
        // A valid header from a MAC we never registered: the edge must
        // re-register before we relay for it.
        let known = state
            .registry
            .find(&name)
            .is_some_and(|c| c.edges.get(body.src_mac).is_some());
        if !known {
            debug!("packet from unregistered {} in '{}'", body.src_mac, name);
            let mut naks = Vec::new();
            nak_unregistered(state, &mut naks, src, &name, body.src_mac);
            state.stats.sn_drop += 1;
            return naks;
        }

        // Any authenticated packet refreshes the sender.
        if let Some(community) = state.registry.find_mut(&name) {
            community.edges.upsert(body.src_mac, src, now);
        }
    }

    if body.dst_mac.is_multicast() {
        broadcast(state, &header, &body, src, now, &mut out);
    } else {
        unicast(state, &header, &body, src, now, &mut out);
    }
    out
}

fn nak_unregistered(
    state: &mut SnState,
    out: &mut Vec<Outgoing>,
    to: PeerSocket,
    community: &str,
    mac: Mac,
) {
    let dgram = Datagram::with_flags(
        community,
        FLAG_FROM_SUPERNODE,
        Body::RegisterNak(wire::RegisterNak {
            cookie: 0,
            mac,
            reason: NakReason::Unregistered,
        }),
    );
    if let Some(bytes) = state.encode_for(community, None, &dgram) {
        state.stats.sn_reg_nak += 1;
        out.push(Outgoing { to, bytes });
    }
}

/// Re-encode a packet for one recipient, applying that recipient's key in
/// user mode and stamping our flags.
fn encode_packet_for(
    state: &SnState,
    community: &str,
    recipient_user: Option<&str>,
    ttl: u8,
    flags: u16,
    body: &DataPacket,
) -> Option<Vec<u8>> {
    let dgram = Datagram {
        header: Header { ttl, flags, community: community.to_string() },
        body: Body::Packet(body.clone()),
    };
    state.encode_for(community, recipient_user, &dgram)
}

/// Broadcast: every community member except the sender, plus one hop to
/// the federated supernodes that serve this community.
fn broadcast(
    state: &mut SnState,
    header: &Header,
    body: &DataPacket,
    src: PeerSocket,
    now: u64,
    out: &mut Vec<Outgoing>,
) {
    let name = &header.community;
    let flags = (header.flags & FLAG_RELAYED) | FLAG_FROM_SUPERNODE;

    let recipients: Vec<(PeerSocket, Option<String>)> = state
        .registry
        .find(name)
        .map(|c| {
            c.edges
                .iter()
                .filter(|p| p.sock != src && !p.sock.is_unresolved())
                .map(|p| (p.sock, p.key_id.clone()))
                .collect()
        })
        .unwrap_or_default();

    for (sock, username) in recipients {
        if let Some(bytes) =
            encode_packet_for(state, name, username.as_deref(), header.ttl, flags, body)
        {
            out.push(Outgoing { to: sock, bytes });
        }
    }

    // Fan out once across the federation; the relayed flag stops a second
    // hop. The copy keeps the member community's protection so the next
    // supernode decodes it under that community, not the federation.
    if header.flags & FLAG_RELAYED == 0 {
        let fed_targets = federation_targets_for(state, name);
        if !fed_targets.is_empty() {
            if let Some(bytes) =
                encode_packet_for(state, name, None, header.ttl, flags | FLAG_RELAYED, body)
            {
                for sock in fed_targets {
                    out.push(Outgoing { to: sock, bytes: bytes.clone() });
                }
            }
        }
    }

    state.stats.sn_broadcast += 1;
    state.times.last_fwd = now;
}

/// Supernodes in the federation that advertise `community`.
fn federation_targets_for(state: &SnState, community: &str) -> Vec<PeerSocket> {
    state
        .registry
        .federation()
        .edges
        .iter()
        .filter(|p| !p.sock.is_unresolved())
        .filter(|p| p.fed_communities.iter().any(|c| c == community))
        .map(|p| p.sock)
        .collect()
}

fn unicast(
    state: &mut SnState,
    header: &Header,
    body: &DataPacket,
    src: PeerSocket,
    now: u64,
    out: &mut Vec<Outgoing>,
) {
    let name = &header.community;
    let flags = (header.flags & FLAG_RELAYED) | FLAG_FROM_SUPERNODE;

    let target = state
        .registry
        .find(name)
        .and_then(|c| c.edges.get(body.dst_mac))
        .map(|p| (p.sock, p.key_id.clone()));

    if let Some((sock, username)) = target {
        if sock.is_unresolved() {
            state.stats.sn_drop += 1;
            return;
        }
        if let Some(bytes) =
            encode_packet_for(state, name, username.as_deref(), header.ttl, flags, body)
        {
            state.stats.sn_fwd += 1;
            state.times.last_fwd = now;
            out.push(Outgoing { to: sock, bytes });
        }
        return;
    }

    // Unknown destination: flood the federation while TTL lasts.
    if header.ttl == 0 {
        state.stats.sn_drop += 1;
        return;
    }
    let fed_targets: Vec<PeerSocket> = state
        .registry
        .federation()
        .edges
        .iter()
        .filter(|p| !p.sock.is_unresolved() && p.sock != src)
        .map(|p| p.sock)
        .collect();
    if fed_targets.is_empty() {
        state.stats.sn_drop += 1;
        return;
    }
    // Flood copies stay under the member community's protection, exactly
    // like the broadcast relay, so the next supernode can decode them.
    if let Some(bytes) = encode_packet_for(state, name, None, header.ttl - 1, flags, body) {
        for sock in fed_targets {
            out.push(Outgoing { to: sock, bytes: bytes.clone() });
        }
        state.stats.sn_fwd += 1;
        state.times.last_fwd = now;
    }
}

// =============================================================================
// PEER QUERIES
// =============================================================================

fn handle_query(
    state: &mut SnState,
    header: &Header,
    body: &QueryPeer,
    src: PeerSocket,
    ident: Option<&AuthenticatedIdentity>,
    now: u64,
) -> Vec<Outgoing> {
    state.stats.rx_query_peer += 1;
    let mut out = Vec::new();

    let Ok(sender_user) = admit_sender(state, header, ident) else {
        return out;
    };
    let sender_user = sender_user.map(str::to_owned);
    let name = header.community.clone();

    // Refresh the requester if we know it.
    if let Some(community) = state.registry.find_mut(&name) {
        if community.edges.get(body.src_mac).is_some() {
            community.edges.upsert(body.src_mac, src, now);
        }
    }

    // A null target asks for the federation roster.
    if body.target.is_null() {
        let members: Vec<(std::net::SocketAddr, u32)> = state
            .registry
            .federation()
            .edges
            .iter()
            .filter(|p| !p.sock.is_unresolved())
            .map(|p| (p.sock.sock_addr(), p.selection))
            .take(super::types::MAX_FED_MEMBERS)
            .collect();
        let reply = Datagram::with_flags(
            name.as_str(),
            FLAG_FROM_SUPERNODE,
            Body::FederationInfo(FederationInfo { members }),
        );
        if let Some(bytes) = state.encode_for(&name, sender_user.as_deref(), &reply) {
            out.push(Outgoing { to: src, bytes });
        }
        return out;
    }

    // PEER_INFO only for peers of the same community; anything else drops.
    let target = state
        .registry
        .find(&name)
        .and_then(|c| c.edges.get(body.target))
        .map(|p| p.sock);
    let Some(target_sock) = target else {
        state.stats.sn_drop += 1;
        return out;
    };

    // Handing out PEER_INFO is the moment a direct path gets brokered;
    // stamp both ends for the p2p classification.
    if let Some(community) = state.registry.find_mut(&name) {
        if let Some(peer) = community.edges.get_mut(body.target) {
            peer.last_sent_query = now;
            peer.last_p2p = now;
        }
        if let Some(peer) = community.edges.get_mut(body.src_mac) {
            peer.last_p2p = now;
        }
    }

    let reply = Datagram::with_flags(
        name.as_str(),
        FLAG_FROM_SUPERNODE,
        Body::PeerInfo(PeerInfo {
            requester: body.src_mac,
            target: body.target,
            sock: target_sock.sock_addr(),
        }),
    );
    if let Some(bytes) = state.encode_for(&name, sender_user.as_deref(), &reply) {
        out.push(Outgoing { to: src, bytes });
    }
    out
}

/// PEER_INFO passing through us on its way back to the requester.
fn handle_peer_info(
    state: &mut SnState,
    header: &Header,
    body: &PeerInfo,
    now: u64,
) -> Vec<Outgoing> {
    let mut out = Vec::new();
    let requester = state
        .registry
        .find_mut(&header.community)
        .and_then(|c| c.edges.get_mut(body.requester))
        .map(|p| {
            p.last_p2p = now;
            (p.sock, p.key_id.clone())
        });
    let Some((sock, username)) = requester else {
        state.stats.sn_drop += 1;
        return out;
    };
    let reply = Datagram::with_flags(
        header.community.as_str(),
        header.flags | FLAG_FROM_SUPERNODE,
        Body::PeerInfo(body.clone()),
    );
    if let Some(bytes) = state.encode_for(&header.community, username.as_deref(), &reply) {
        out.push(Outgoing { to: sock, bytes });
    }
    out
}
