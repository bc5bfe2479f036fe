//! Peer records and the dual-indexed peer table.
//!
//! Records live in a slot arena owned by each community; the MAC and socket
//! indices hold slot numbers, never owning handles, so a record can be
//! found either way without reference cycles.

use crate::types::{Mac, PeerSocket};
use std::collections::HashMap;

use super::types::EdgeState;

/// One registered peer: an edge inside a community, or a supernode inside
/// the federation community.
#[derive(Debug, Clone)]
pub struct Peer {
    pub mac: Mac,
    pub sock: PeerSocket,
    /// Anchor dial-back target, kept for re-resolution when `sock` is still
    /// the unresolved placeholder.
    pub hostname: Option<String>,
    /// Username established by user-mode header authentication.
    pub key_id: Option<String>,
    pub version: String,
    pub last_seen: u64,
    /// Last time a direct path was brokered for this peer, i.e. a
    /// PEER_INFO naming it was handed out or relayed.
    pub last_p2p: u64,
    pub last_sent_query: u64,
    /// Peer-advertised uptime at registration (supernodes only).
    pub uptime: u32,
    /// Selection criterion advertised by a federated supernode.
    pub selection: u32,
    pub cookie: u32,
    /// Anchors are pinned: the purge sweep never removes them.
    pub purgeable: bool,
    /// Communities a federated supernode serves, from its last
    /// REGISTER_SUPER. Empty for edges.
    pub fed_communities: Vec<String>,
}

impl Peer {
    pub fn new(mac: Mac, sock: PeerSocket, now: u64) -> Self {
        Self {
            mac,
            sock,
            hostname: None,
            key_id: None,
            version: String::new(),
            last_seen: now,
            last_p2p: 0,
            last_sent_query: 0,
            uptime: 0,
            selection: 0,
            cookie: 0,
            purgeable: true,
            fed_communities: Vec::new(),
        }
    }

    /// Non-purgeable anchor placeholder created at startup from `-l`.
    pub fn anchor(hostname: String, sock: PeerSocket, now: u64) -> Self {
        let mut peer = Peer::new(Mac::NULL, sock, now);
        peer.hostname = Some(hostname);
        peer.purgeable = false;
        peer
    }

    pub fn state(&self, now: u64, ttl: u64) -> EdgeState {
        if now.saturating_sub(self.last_seen) > ttl {
            EdgeState::Stale
        } else {
            EdgeState::Registered
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Refreshed,
}

/// Dual-indexed peer set: primary index by MAC, secondary by socket.
///
/// Invariant: a MAC appears at most once; the socket index always points at
/// a live slot.
#[derive(Debug, Default)]
pub struct PeerTable {
    slots: Vec<Option<Peer>>,
    free: Vec<usize>,
    by_mac: HashMap<Mac, usize>,
    by_sock: HashMap<PeerSocket, usize>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, mac: Mac) -> Option<&Peer> {
        self.by_mac.get(&mac).and_then(|&i| self.slots[i].as_ref())
    }

    pub fn get_mut(&mut self, mac: Mac) -> Option<&mut Peer> {
        let idx = *self.by_mac.get(&mac)?;
        self.slots[idx].as_mut()
    }

    pub fn get_by_sock(&self, sock: PeerSocket) -> Option<&Peer> {
        self.by_sock.get(&sock).and_then(|&i| self.slots[i].as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.slots.iter_mut().filter_map(|s| s.as_mut())
    }

    /// Find-or-insert. A non-null MAC resolves through the MAC index, then
    /// falls back to adopting a null-MAC record at the same socket (anchor
    /// placeholders learn their MAC this way). A null MAC resolves through
    /// the socket index only. A refresh updates `last_seen` and moves the
    /// socket index when the peer shows up from a new socket.
    pub fn upsert(&mut self, mac: Mac, sock: PeerSocket, now: u64) -> (&mut Peer, Upsert) {
        let found = if !mac.is_null() {
            self.by_mac.get(&mac).copied().or_else(|| {
                self.by_sock
                    .get(&sock)
                    .copied()
                    .filter(|&i| self.slots[i].as_ref().is_some_and(|p| p.mac.is_null()))
            })
        } else {
            self.by_sock.get(&sock).copied()
        };

        let idx = match found {
            Some(idx) => {
                let (old_sock, was_null) = {
                    let peer = self.slots[idx].as_ref().expect("indexed slot is live");
                    (peer.sock, peer.mac.is_null())
                };
                if old_sock != sock {
                    if self.by_sock.get(&old_sock) == Some(&idx) {
                        self.by_sock.remove(&old_sock);
                    }
                    self.by_sock.insert(sock, idx);
                }
                if was_null && !mac.is_null() {
                    self.by_mac.insert(mac, idx);
                }
                let peer = self.slots[idx].as_mut().expect("indexed slot is live");
                peer.sock = sock;
                peer.last_seen = now;
                if was_null && !mac.is_null() {
                    peer.mac = mac;
                }
                return (peer, Upsert::Refreshed);
            }
            None => {
                let peer = Peer::new(mac, sock, now);
                let idx = match self.free.pop() {
                    Some(idx) => {
                        self.slots[idx] = Some(peer);
                        idx
                    }
                    None => {
                        self.slots.push(Some(peer));
                        self.slots.len() - 1
                    }
                };
                if !mac.is_null() {
                    self.by_mac.insert(mac, idx);
                }
                self.by_sock.insert(sock, idx);
                idx
            }
        };

        (self.slots[idx].as_mut().expect("fresh slot is live"), Upsert::Created)
    }

    /// Insert a fully-formed record (anchors at startup).
    pub fn insert(&mut self, peer: Peer) -> usize {
        let mac = peer.mac;
        let sock = peer.sock;
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(peer);
                idx
            }
            None => {
                self.slots.push(Some(peer));
                self.slots.len() - 1
            }
        };
        if !mac.is_null() {
            self.by_mac.insert(mac, idx);
        }
        if !sock.is_unresolved() {
            self.by_sock.insert(sock, idx);
        }
        idx
    }

    /// Bind a resolved anchor to its socket and index it there.
    pub fn bind_anchor(&mut self, hostname: &str, sock: PeerSocket) -> bool {
        let idx = self.slots.iter().position(|s| {
            s.as_ref().is_some_and(|p| p.hostname.as_deref() == Some(hostname))
        });
        let Some(idx) = idx else {
            return false;
        };
        let old = self.slots[idx].as_ref().expect("indexed slot is live").sock;
        if self.by_sock.get(&old) == Some(&idx) {
            self.by_sock.remove(&old);
        }
        self.by_sock.insert(sock, idx);
        self.slots[idx].as_mut().expect("indexed slot is live").sock = sock;
        true
    }

    pub fn remove(&mut self, mac: Mac) -> Option<Peer> {
        let idx = self.by_mac.remove(&mac)?;
        self.remove_slot(idx)
    }

    pub fn remove_by_sock(&mut self, sock: PeerSocket) -> Option<Peer> {
        let idx = self.by_sock.remove(&sock)?;
        if let Some(peer) = self.slots[idx].as_ref() {
            self.by_mac.remove(&peer.mac);
        }
        let peer = self.slots[idx].take();
        self.free.push(idx);
        peer
    }

    fn remove_slot(&mut self, idx: usize) -> Option<Peer> {
        let peer = self.slots[idx].take()?;
        if self.by_sock.get(&peer.sock) == Some(&idx) {
            self.by_sock.remove(&peer.sock);
        }
        self.free.push(idx);
        Some(peer)
    }

    /// Remove every purgeable peer not seen within `ttl`, returning the
    /// removed records so the caller can emit events and count them.
    pub fn purge(&mut self, now: u64, ttl: u64) -> Vec<Peer> {
        let expired: Vec<(Mac, PeerSocket)> = self
            .iter()
            .filter(|p| p.purgeable && now.saturating_sub(p.last_seen) > ttl)
            .map(|p| (p.mac, p.sock))
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for (mac, sock) in expired {
            // Null-MAC records are indexed by socket only.
            let peer = if mac.is_null() { self.remove_by_sock(sock) } else { self.remove(mac) };
            if let Some(peer) = peer {
                removed.push(peer);
            }
        }
        removed
    }
}
