//! Session engine: registration, keep-alive, purge, federation peering.
//!
//! Engine functions are pure state manipulation: they mutate `SnState` and
//! return the datagrams to send. The transport layer performs the sends,
//! which keeps every registration scenario testable without sockets.

use crate::config::SnConfig;
use crate::crypto::HeaderMode;
use crate::types::{Mac, PeerSocket, now as wall_now};
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::autoip::edge_ip;
use super::community::Registry;
use super::peer::{Peer, Upsert};
use super::stats::{PacketStats, Timestamps};
use super::types::{
    FLAG_FROM_SUPERNODE, MAX_FED_COMMUNITIES, NAK_BUCKET_CAPACITY, NAK_REFILL_PER_SEC, NakReason,
};
use super::wire::{
    self, AuthenticatedIdentity, Body, Datagram, Header, HeaderProtection, Register, RegisterAck,
    RegisterNak, RegisterSuper, RegisterSuperAck, RegisterSuperNak, UnregisterSuper,
};
use crate::mgmt::events::{EventBus, Topic};

/// One datagram queued for the transport layer.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub to: PeerSocket,
    pub bytes: Vec<u8>,
}

// =============================================================================
// NAK RATE LIMITING
// =============================================================================

/// Token bucket over coarse unix-seconds time.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last: u64,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64, now: u64) -> Self {
        Self { tokens: capacity, capacity, refill_per_sec, last: now }
    }

    pub fn try_consume(&mut self, now: u64) -> bool {
        let elapsed = now.saturating_sub(self.last) as f64;
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-source throttle on auth NAKs: they are a reflection primitive.
#[derive(Debug, Default)]
pub struct NakLimiter {
    buckets: HashMap<PeerSocket, TokenBucket>,
}

impl NakLimiter {
    /// Buckets kept before pruning refilled ones.
    const MAX_TRACKED: usize = 256;

    pub fn allow(&mut self, src: PeerSocket, now: u64) -> bool {
        if self.buckets.len() > Self::MAX_TRACKED {
            self.buckets.retain(|_, b| {
                !(now.saturating_sub(b.last) as f64 * b.refill_per_sec >= b.capacity)
            });
        }
        self.buckets
            .entry(src)
            .or_insert_with(|| TokenBucket::new(NAK_BUCKET_CAPACITY, NAK_REFILL_PER_SEC, now))
            .try_consume(now)
    }
}

// =============================================================================
// RUNTIME STATE
// =============================================================================

/// Everything the engines mutate, owned by the event loop and handed to
/// the management plane behind one lock.
pub struct SnState {
    pub cfg: SnConfig,
    pub registry: Registry,
    pub stats: PacketStats,
    pub times: Timestamps,
    pub events: EventBus,
    /// Our own overlay MAC, random locally-administered, fresh per start.
    pub mac: Mac,
    /// The socket we advertise to federation members.
    pub sock: PeerSocket,
    pub start_time: u64,
    pub verbose: u8,
    pub naks: NakLimiter,
}

impl SnState {
    pub fn new(cfg: SnConfig, registry: Registry, events: EventBus, sock: PeerSocket) -> Self {
        let start = wall_now();
        let mut times = Timestamps::default();
        times.start_time = start;
        Self {
            cfg,
            registry,
            stats: PacketStats::default(),
            times,
            events,
            mac: Mac::random_local(),
            sock,
            start_time: start,
            verbose: 2,
            naks: NakLimiter::default(),
        }
    }

    /// Encode toward a member of `community`, using the recipient's
    /// username where user-mode keys apply.
    pub fn encode_for(
        &self,
        community: &str,
        username: Option<&str>,
        dgram: &Datagram,
    ) -> Option<Vec<u8>> {
        let c = self.registry.find(community)?;
        let protection = c.protection_for(&self.registry.sn_key, username)?;
        wire::encode(dgram, &protection).ok()
    }

    /// Non-federation community names we can advertise to the federation.
    pub fn local_communities(&self) -> Vec<String> {
        self.registry
            .iter()
            .filter(|c| !c.name.starts_with('*'))
            .map(|c| c.name.clone())
            .take(MAX_FED_COMMUNITIES)
            .collect()
    }
}

/// Queue a NAK. NAKs travel in the clear: an edge that failed header auth
/// has no key to open a sealed reply with.
fn push_nak(
    state: &mut SnState,
    out: &mut Vec<Outgoing>,
    to: PeerSocket,
    community: &str,
    cookie: u32,
    mac: Mac,
    reason: NakReason,
) {
    let community = if community.is_empty() { "-" } else { community };
    let dgram = Datagram::with_flags(
        community,
        FLAG_FROM_SUPERNODE,
        Body::RegisterNak(RegisterNak { cookie, mac, reason }),
    );
    if let Ok(bytes) = wire::encode(&dgram, &HeaderProtection::Clear) {
        state.stats.sn_reg_nak += 1;
        out.push(Outgoing { to, bytes });
    }
}

/// Auth failures NAK through the per-source limiter; everything above the
/// budget is silently dropped.
pub fn nak_auth_failure(state: &mut SnState, src: PeerSocket, now: u64) -> Vec<Outgoing> {
    let mut out = Vec::new();
    if state.naks.allow(src, now) {
        push_nak(state, &mut out, src, "", 0, Mac::NULL, NakReason::Auth);
    } else {
        state.stats.sn_drop += 1;
    }
    out
}

/// Does the presented identity satisfy the community's header mode?
fn auth_satisfies(mode: HeaderMode, ident: Option<&AuthenticatedIdentity>) -> bool {
    match mode {
        HeaderMode::None => true,
        HeaderMode::Static => ident.is_some(),
        HeaderMode::User => ident.is_some_and(|i| i.username.is_some()),
    }
}

// =============================================================================
// EDGE REGISTRATION
// =============================================================================

pub fn register_edge(
    state: &mut SnState,
    header: &Header,
    body: &Register,
    src: PeerSocket,
    ident: Option<&AuthenticatedIdentity>,
    now: u64,
) -> Vec<Outgoing> {
    state.stats.rx_register += 1;
    let mut out = Vec::new();

    if body.mac.is_null() {
        state.stats.rx_error += 1;
        return out;
    }

    let name = header.community.clone();
    let username = ident.and_then(|i| i.username.clone());

    // Resolve the community, creating it where policy allows.
    let (joinable, mode, auto_net, spoofing_exempt, already_member) =
        match state.registry.find_or_create(&name) {
            Ok(c) => (
                c.joinable,
                c.mode,
                c.auto_net,
                c.spoofing_exempt,
                c.edges.get(body.mac).is_some(),
            ),
            Err(denied) => {
                debug!("register {} for '{}' denied: {:?}", body.mac, name, denied);
                push_nak(state, &mut out, src, &name, body.cookie, body.mac, NakReason::Community);
                return out;
            }
        };

    if !joinable && !already_member {
        push_nak(state, &mut out, src, &name, body.cookie, body.mac, NakReason::Community);
        return out;
    }

    if !auth_satisfies(mode, ident) {
        let naks = nak_auth_failure(state, src, now);
        out.extend(naks);
        return out;
    }

    // Spoofing check: the MAC must not already belong to someone else.
    if state.cfg.spoofing_protection
        && !spoofing_exempt
        && state.registry.mac_conflict(&name, body.mac, src, username.as_deref())
    {
        warn!("register {} for '{}': MAC already in use", body.mac, name);
        push_nak(state, &mut out, src, &name, body.cookie, body.mac, NakReason::MacInUse);
        return out;
    }

    let community = state.registry.find_mut(&name).expect("resolved above");
    let prev_sock = community.edges.get(body.mac).map(|p| p.sock);
    let (peer, outcome) = community.edges.upsert(body.mac, src, now);
    peer.version = body.version.clone();
    peer.cookie = body.cookie;
    peer.key_id = username.clone();

    match outcome {
        Upsert::Created => {
            info!("edge {} joined '{}' from {}", body.mac, name, src);
            state.events.emit(
                Topic::Peer,
                json!({
                    "action": "join",
                    "community": name,
                    "mac": body.mac.to_string(),
                    "sock": src.to_string(),
                }),
            );
        }
        Upsert::Refreshed => {
            if prev_sock.is_some_and(|p| p != src) {
                debug!("edge {} in '{}' moved to {}", body.mac, name, src);
                state.events.emit(
                    Topic::Peer,
                    json!({
                        "action": "move",
                        "community": name,
                        "mac": body.mac.to_string(),
                        "sock": src.to_string(),
                    }),
                );
            }
        }
    }

    let ack = Datagram::with_flags(
        name.as_str(),
        FLAG_FROM_SUPERNODE,
        Body::RegisterAck(RegisterAck {
            cookie: body.cookie,
            mac: body.mac,
            auto_ip: edge_ip(auto_net, body.mac),
            auto_prefix: auto_net.prefix,
            observed: src.sock_addr(),
        }),
    );
    if let Some(bytes) = state.encode_for(&name, username.as_deref(), &ack) {
        state.stats.sn_reg += 1;
        state.times.last_reg = now;
        out.push(Outgoing { to: src, bytes });
    }
    out
}

// =============================================================================
// FEDERATION PEERING
// =============================================================================

pub fn register_super(
    state: &mut SnState,
    header: &Header,
    body: &RegisterSuper,
    src: PeerSocket,
    ident: Option<&AuthenticatedIdentity>,
    now: u64,
) -> Vec<Outgoing> {
    state.stats.rx_register_super += 1;
    let mut out = Vec::new();

    if header.community != state.registry.federation_name {
        let dgram = Datagram::with_flags(
            header.community.as_str(),
            FLAG_FROM_SUPERNODE,
            Body::RegisterSuperNak(RegisterSuperNak {
                cookie: body.cookie,
                reason: NakReason::Community,
            }),
        );
        if let Ok(bytes) = wire::encode(&dgram, &HeaderProtection::Clear) {
            state.stats.sn_reg_nak += 1;
            out.push(Outgoing { to: src, bytes });
        }
        return out;
    }
    if ident.is_none() {
        // The federation community is always key-protected.
        return nak_auth_failure(state, src, now);
    }

    let fed_name = state.registry.federation_name.clone();
    let outcome = {
        let fed = state.registry.federation_mut();
        let (peer, outcome) = fed.edges.upsert(body.mac, src, now);
        peer.version = body.version.clone();
        peer.uptime = body.uptime;
        peer.selection = body.selection;
        peer.cookie = body.cookie;
        peer.fed_communities = body.communities.clone();
        outcome
    };
    if outcome == Upsert::Created {
        info!("supernode {} peered from {}", body.mac, src);
        state.events.emit(
            Topic::Peer,
            json!({
                "action": "join",
                "community": fed_name.clone(),
                "mac": body.mac.to_string(),
                "sock": src.to_string(),
            }),
        );
    }

    // Merge communities the remote serves and we do not know yet.
    for name in &body.communities {
        state.registry.merge_remote(name);
    }

    let ack = Datagram::with_flags(
        fed_name.as_str(),
        FLAG_FROM_SUPERNODE,
        Body::RegisterSuperAck(RegisterSuperAck {
            cookie: body.cookie,
            mac: state.mac,
            selection: state.registry.edge_count() as u32,
            communities: state.local_communities(),
        }),
    );
    if let Some(bytes) = state.encode_for(&fed_name, None, &ack) {
        state.stats.sn_reg_super += 1;
        state.times.last_super = now;
        out.push(Outgoing { to: src, bytes });
    }
    out
}

/// An anchor answered our periodic REGISTER_SUPER.
pub fn handle_super_ack(
    state: &mut SnState,
    header: &Header,
    body: &RegisterSuperAck,
    src: PeerSocket,
    ident: Option<&AuthenticatedIdentity>,
    now: u64,
) {
    if header.community != state.registry.federation_name || ident.is_none() {
        state.stats.sn_errors += 1;
        return;
    }
    {
        let fed = state.registry.federation_mut();
        let (peer, _) = fed.edges.upsert(body.mac, src, now);
        peer.selection = body.selection;
        peer.fed_communities = body.communities.clone();
    }
    for name in &body.communities {
        state.registry.merge_remote(name);
    }
    state.times.last_super = now;
}

/// Explicit goodbye: any state → unregistered.
pub fn unregister(state: &mut SnState, header: &Header, body: &UnregisterSuper, src: PeerSocket) {
    let Some(community) = state.registry.find_mut(&header.community) else {
        state.stats.sn_drop += 1;
        return;
    };
    if let Some(peer) = community.edges.remove(body.mac) {
        info!("edge {} left '{}'", peer.mac, header.community);
        state.events.emit(
            Topic::Peer,
            json!({
                "action": "leave",
                "community": header.community.clone(),
                "mac": peer.mac.to_string(),
                "sock": src.to_string(),
            }),
        );
    }
}

// =============================================================================
// TIMERS
// =============================================================================

/// Drop every stale purgeable peer. Anchors survive; empty communities
/// stay resident so their auto-IP assignments remain deterministic.
pub fn purge_sweep(state: &mut SnState, now: u64) -> usize {
    let ttl = state.cfg.registration_ttl;
    let fed_ttl = state.cfg.federation_ttl();
    let fed_name = state.registry.federation_name.clone();
    let events = state.events.clone();

    let mut removed = 0;
    for community in state.registry.iter_mut() {
        let effective = if community.name == fed_name { fed_ttl } else { ttl };
        for peer in community.edges.purge(now, effective) {
            debug!("purged {} from '{}'", peer.mac, community.name);
            events.emit(
                Topic::Peer,
                json!({
                    "action": "leave",
                    "community": community.name.clone(),
                    "mac": peer.mac.to_string(),
                    "sock": peer.sock.to_string(),
                }),
            );
            removed += 1;
        }
    }
    removed
}

/// Periodic REGISTER_SUPER to every resolved anchor.
pub fn federation_tick(state: &mut SnState, now: u64) -> Vec<Outgoing> {
    let anchors: Vec<PeerSocket> = state
        .registry
        .federation()
        .edges
        .iter()
        .filter(|p| !p.purgeable && !p.sock.is_unresolved())
        .map(|p| p.sock)
        .collect();
    if anchors.is_empty() {
        return Vec::new();
    }

    let fed_name = state.registry.federation_name.clone();
    let dgram = Datagram::with_flags(
        fed_name.as_str(),
        FLAG_FROM_SUPERNODE,
        Body::RegisterSuper(RegisterSuper {
            cookie: rand::random(),
            mac: state.mac,
            version: state.cfg.version_string.clone(),
            uptime: now.saturating_sub(state.start_time) as u32,
            selection: state.registry.edge_count() as u32,
            communities: state.local_communities(),
        }),
    );
    let Some(bytes) = state.encode_for(&fed_name, None, &dgram) else {
        return Vec::new();
    };
    anchors
        .into_iter()
        .map(|to| Outgoing { to, bytes: bytes.clone() })
        .collect()
}

/// Anchor hostnames still waiting for resolution; the runtime resolves
/// them off the state lock and calls [`bind_anchor`].
pub fn unresolved_anchors(state: &SnState) -> Vec<String> {
    state
        .registry
        .federation()
        .edges
        .iter()
        .filter(|p| !p.purgeable && p.sock.is_unresolved())
        .filter_map(|p| p.hostname.clone())
        .collect()
}

pub fn bind_anchor(state: &mut SnState, hostname: &str, sock: PeerSocket) {
    if state.registry.federation_mut().edges.bind_anchor(hostname, sock) {
        info!("anchor {} resolved to {}", hostname, sock);
    }
}

/// Seed the federation community with the configured `-l` anchors.
/// Unresolvable ones are kept with a placeholder socket and re-resolved
/// later.
pub fn seed_anchors(state: &mut SnState, resolved: &[(String, Option<PeerSocket>)], now: u64) {
    for (hostname, sock) in resolved {
        let peer = Peer::anchor(
            hostname.clone(),
            sock.unwrap_or_else(PeerSocket::unresolved),
            now,
        );
        match sock {
            Some(sock) => info!("federation anchor {} at {}", hostname, sock),
            None => warn!("federation anchor {} not resolvable yet, will retry", hostname),
        }
        state.registry.federation_mut().edges.insert(peer);
    }
}

/// A TCP session closed: purgeable peers bound to it disappear, pinned
/// ones just lose their transport binding.
pub fn transport_closed(state: &mut SnState, sock: PeerSocket) {
    let events = state.events.clone();
    for community in state.registry.iter_mut() {
        let Some(peer) = community.edges.get_by_sock(sock) else {
            continue;
        };
        if !peer.purgeable {
            continue;
        }
        if let Some(peer) = community.edges.remove_by_sock(sock) {
            info!("edge {} in '{}' lost its TCP session", peer.mac, community.name);
            events.emit(
                Topic::Peer,
                json!({
                    "action": "leave",
                    "community": community.name.clone(),
                    "mac": peer.mac.to_string(),
                    "sock": sock.to_string(),
                }),
            );
        }
    }
}
