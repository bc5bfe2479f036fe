//! Wire codec for overlay datagrams.
//!
//! Layout is fixed big-endian. Every datagram is a 22-byte common header
//! followed by a message-type-specific body:
//!
//! ```text
//! 0       magic
//! 1       version
//! 2       message type
//! 3       TTL
//! 4..6    flags
//! 6..22   community name (NUL-padded)
//! ```
//!
//! With header protection enabled the header travels sealed:
//!
//! ```text
//! 0       envelope tag (0xfd static, 0xfe user)
//! 1..13   nonce
//! 13..51  sealed header (22 bytes + AEAD tag)
//! 51..    body (opaque to the codec's crypto, end-to-end protected by edges)
//! ```
//!
//! The decoder tries candidate keys in the `KeyStore`'s order and accepts
//! the first that opens to a valid magic/version with a community name
//! matching the key's owner. The codec is pure given a key store.

use crate::crypto::{self, HeaderKey, HeaderMode, KeyStore, NONCE_SIZE, SEAL_OVERHEAD};
use crate::types::Mac;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

use super::types::{
    COMMUNITY_LEN, ENC_TAG_STATIC, ENC_TAG_USER, HEADER_LEN, MAX_DATAGRAM, MAX_FED_COMMUNITIES,
    MAX_FED_MEMBERS, NakReason, PACKET_TTL, PROTOCOL_MAGIC, PROTOCOL_VERSION, VERSION_LEN,
};

/// Sealed-header envelope prefix: tag + nonce + sealed header.
pub const ENVELOPE_LEN: usize = 1 + NONCE_SIZE + HEADER_LEN + SEAL_OVERHEAD;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram truncated")]
    Truncated,
    #[error("unknown magic byte 0x{0:02x}")]
    UnknownMagic(u8),
    #[error("unknown protocol version {0}")]
    UnknownVersion(u8),
    #[error("unknown message type {0}")]
    UnknownMsgType(u8),
    #[error("invalid community name field")]
    BadCommunity,
    #[error("no key opens this header")]
    AuthFailure,
    #[error("datagram exceeds {0} bytes")]
    Oversize(usize),
    #[error("malformed {0} field")]
    BadField(&'static str),
}

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgKind {
    Register = 1,
    RegisterAck = 2,
    RegisterNak = 3,
    Packet = 4,
    QueryPeer = 5,
    PeerInfo = 6,
    RegisterSuper = 7,
    RegisterSuperAck = 8,
    RegisterSuperNak = 9,
    UnregisterSuper = 10,
    FederationInfo = 11,
}

impl MsgKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(MsgKind::Register),
            2 => Some(MsgKind::RegisterAck),
            3 => Some(MsgKind::RegisterNak),
            4 => Some(MsgKind::Packet),
            5 => Some(MsgKind::QueryPeer),
            6 => Some(MsgKind::PeerInfo),
            7 => Some(MsgKind::RegisterSuper),
            8 => Some(MsgKind::RegisterSuperAck),
            9 => Some(MsgKind::RegisterSuperNak),
            10 => Some(MsgKind::UnregisterSuper),
            11 => Some(MsgKind::FederationInfo),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MsgKind::Register => "register",
            MsgKind::RegisterAck => "register_ack",
            MsgKind::RegisterNak => "register_nak",
            MsgKind::Packet => "packet",
            MsgKind::QueryPeer => "query_peer",
            MsgKind::PeerInfo => "peer_info",
            MsgKind::RegisterSuper => "register_super",
            MsgKind::RegisterSuperAck => "register_super_ack",
            MsgKind::RegisterSuperNak => "register_super_nak",
            MsgKind::UnregisterSuper => "unregister_super",
            MsgKind::FederationInfo => "federation_info",
        }
    }
}

/// Decoded common header. Magic and version are implicit once validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub ttl: u8,
    pub flags: u16,
    pub community: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub cookie: u32,
    pub mac: Mac,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterAck {
    pub cookie: u32,
    pub mac: Mac,
    pub auto_ip: Ipv4Addr,
    pub auto_prefix: u8,
    pub observed: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterNak {
    pub cookie: u32,
    pub mac: Mac,
    pub reason: NakReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSuper {
    pub cookie: u32,
    pub mac: Mac,
    pub version: String,
    pub uptime: u32,
    pub selection: u32,
    pub communities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSuperAck {
    pub cookie: u32,
    pub mac: Mac,
    pub selection: u32,
    pub communities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSuperNak {
    pub cookie: u32,
    pub reason: NakReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnregisterSuper {
    pub mac: Mac,
}

/// Relayed edge traffic. `frame` is the opaque payload past the Ethernet
/// addressing; the supernode reads the MACs and touches nothing else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub src_mac: Mac,
    pub dst_mac: Mac,
    pub transform: u16,
    pub frame: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPeer {
    pub src_mac: Mac,
    /// All-zero target asks for the federation roster.
    pub target: Mac,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub requester: Mac,
    pub target: Mac,
    pub sock: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederationInfo {
    pub members: Vec<(SocketAddr, u32)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Register(Register),
    RegisterAck(RegisterAck),
    RegisterNak(RegisterNak),
    Packet(DataPacket),
    QueryPeer(QueryPeer),
    PeerInfo(PeerInfo),
    RegisterSuper(RegisterSuper),
    RegisterSuperAck(RegisterSuperAck),
    RegisterSuperNak(RegisterSuperNak),
    UnregisterSuper(UnregisterSuper),
    FederationInfo(FederationInfo),
}

impl Body {
    pub fn kind(&self) -> MsgKind {
        match self {
            Body::Register(_) => MsgKind::Register,
            Body::RegisterAck(_) => MsgKind::RegisterAck,
            Body::RegisterNak(_) => MsgKind::RegisterNak,
            Body::Packet(_) => MsgKind::Packet,
            Body::QueryPeer(_) => MsgKind::QueryPeer,
            Body::PeerInfo(_) => MsgKind::PeerInfo,
            Body::RegisterSuper(_) => MsgKind::RegisterSuper,
            Body::RegisterSuperAck(_) => MsgKind::RegisterSuperAck,
            Body::RegisterSuperNak(_) => MsgKind::RegisterSuperNak,
            Body::UnregisterSuper(_) => MsgKind::UnregisterSuper,
            Body::FederationInfo(_) => MsgKind::FederationInfo,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub header: Header,
    pub body: Body,
}

impl Datagram {
    pub fn new(community: impl Into<String>, body: Body) -> Self {
        Self {
            header: Header { ttl: PACKET_TTL, flags: 0, community: community.into() },
            body,
        }
    }

    pub fn with_flags(community: impl Into<String>, flags: u16, body: Body) -> Self {
        Self { header: Header { ttl: PACKET_TTL, flags, community: community.into() }, body }
    }
}

/// Sender identity established by header decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity {
    pub community: String,
    pub username: Option<String>,
    pub mode: HeaderMode,
}

/// Concrete key applied on the encode side.
#[derive(Clone)]
pub enum HeaderProtection {
    Clear,
    Static(HeaderKey),
    User(HeaderKey),
}

// =============================================================================
// FIELD CODECS
// =============================================================================

struct Writer(Vec<u8>);

impl Writer {
    fn new() -> Self {
        Writer(Vec::with_capacity(64))
    }

    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.0.extend_from_slice(v);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.buf.len() {
            return Err(WireError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn mac(&mut self) -> Result<Mac, WireError> {
        let b = self.take(6)?;
        let mut out = [0u8; 6];
        out.copy_from_slice(b);
        Ok(Mac(out))
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

fn pack_fixed(s: &str, len: usize, what: &'static str) -> Result<Vec<u8>, WireError> {
    if s.len() > len || s.as_bytes().contains(&0) {
        return Err(WireError::BadField(what));
    }
    let mut out = vec![0u8; len];
    out[..s.len()].copy_from_slice(s.as_bytes());
    Ok(out)
}

fn unpack_fixed(bytes: &[u8], what: &'static str) -> Result<String, WireError> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    if bytes[end..].iter().any(|&b| b != 0) {
        return Err(WireError::BadField(what));
    }
    std::str::from_utf8(&bytes[..end])
        .map(str::to_owned)
        .map_err(|_| WireError::BadField(what))
}

fn pack_community(name: &str) -> Result<Vec<u8>, WireError> {
    if name.is_empty() {
        return Err(WireError::BadCommunity);
    }
    pack_fixed(name, COMMUNITY_LEN, "community").map_err(|_| WireError::BadCommunity)
}

fn unpack_community(bytes: &[u8]) -> Result<String, WireError> {
    let name = unpack_fixed(bytes, "community").map_err(|_| WireError::BadCommunity)?;
    if name.is_empty() {
        return Err(WireError::BadCommunity);
    }
    Ok(name)
}

fn pack_version(version: &str) -> Result<Vec<u8>, WireError> {
    if version.len() >= VERSION_LEN {
        return Err(WireError::BadField("version"));
    }
    pack_fixed(version, VERSION_LEN, "version")
}

fn write_sock(w: &mut Writer, sock: &SocketAddr) {
    match sock.ip() {
        IpAddr::V4(ip) => {
            w.u8(4);
            w.u16(sock.port());
            w.bytes(&ip.octets());
        }
        IpAddr::V6(ip) => {
            w.u8(6);
            w.u16(sock.port());
            w.bytes(&ip.octets());
        }
    }
}

fn read_sock(r: &mut Reader) -> Result<SocketAddr, WireError> {
    let family = r.u8()?;
    let port = r.u16()?;
    let ip = match family {
        4 => {
            let b = r.take(4)?;
            IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
        }
        6 => {
            let b = r.take(16)?;
            let mut oct = [0u8; 16];
            oct.copy_from_slice(b);
            IpAddr::V6(Ipv6Addr::from(oct))
        }
        _ => return Err(WireError::BadField("socket")),
    };
    Ok(SocketAddr::new(ip, port))
}

fn write_community_list(w: &mut Writer, names: &[String]) -> Result<(), WireError> {
    if names.len() > MAX_FED_COMMUNITIES {
        return Err(WireError::Oversize(names.len()));
    }
    w.u16(names.len() as u16);
    for name in names {
        w.bytes(&pack_community(name)?);
    }
    Ok(())
}

fn read_community_list(r: &mut Reader) -> Result<Vec<String>, WireError> {
    let count = r.u16()? as usize;
    if count > MAX_FED_COMMUNITIES {
        return Err(WireError::Oversize(count));
    }
    let mut names = Vec::with_capacity(count);
    for _ in 0..count {
        names.push(unpack_community(r.take(COMMUNITY_LEN)?)?);
    }
    Ok(names)
}

// =============================================================================
// BODY ENCODE / DECODE
// =============================================================================

fn encode_body(body: &Body, w: &mut Writer) -> Result<(), WireError> {
    match body {
        Body::Register(b) => {
            w.u32(b.cookie);
            w.bytes(b.mac.as_bytes());
            w.bytes(&pack_version(&b.version)?);
        }
        Body::RegisterAck(b) => {
            w.u32(b.cookie);
            w.bytes(b.mac.as_bytes());
            w.bytes(&b.auto_ip.octets());
            w.u8(b.auto_prefix);
            write_sock(w, &b.observed);
        }
        Body::RegisterNak(b) => {
            w.u32(b.cookie);
            w.bytes(b.mac.as_bytes());
            w.u8(b.reason.as_u8());
        }
        Body::RegisterSuper(b) => {
            w.u32(b.cookie);
            w.bytes(b.mac.as_bytes());
            w.bytes(&pack_version(&b.version)?);
            w.u32(b.uptime);
            w.u32(b.selection);
            write_community_list(w, &b.communities)?;
        }
        Body::RegisterSuperAck(b) => {
            w.u32(b.cookie);
            w.bytes(b.mac.as_bytes());
            w.u32(b.selection);
            write_community_list(w, &b.communities)?;
        }
        Body::RegisterSuperNak(b) => {
            w.u32(b.cookie);
            w.u8(b.reason.as_u8());
        }
        Body::UnregisterSuper(b) => {
            w.bytes(b.mac.as_bytes());
        }
        Body::Packet(b) => {
            w.bytes(b.src_mac.as_bytes());
            w.bytes(b.dst_mac.as_bytes());
            w.u16(b.transform);
            w.bytes(&b.frame);
        }
        Body::QueryPeer(b) => {
            w.bytes(b.src_mac.as_bytes());
            w.bytes(b.target.as_bytes());
        }
        Body::PeerInfo(b) => {
            w.bytes(b.requester.as_bytes());
            w.bytes(b.target.as_bytes());
            write_sock(w, &b.sock);
        }
        Body::FederationInfo(b) => {
            if b.members.len() > MAX_FED_MEMBERS {
                return Err(WireError::Oversize(b.members.len()));
            }
            w.u16(b.members.len() as u16);
            for (sock, selection) in &b.members {
                write_sock(w, sock);
                w.u32(*selection);
            }
        }
    }
    Ok(())
}

fn decode_body(kind: MsgKind, r: &mut Reader) -> Result<Body, WireError> {
    let body = match kind {
        MsgKind::Register => Body::Register(Register {
            cookie: r.u32()?,
            mac: r.mac()?,
            version: unpack_fixed(r.take(VERSION_LEN)?, "version")?,
        }),
        MsgKind::RegisterAck => {
            let cookie = r.u32()?;
            let mac = r.mac()?;
            let ip = r.take(4)?;
            let auto_ip = Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]);
            let auto_prefix = r.u8()?;
            Body::RegisterAck(RegisterAck { cookie, mac, auto_ip, auto_prefix, observed: read_sock(r)? })
        }
        MsgKind::RegisterNak => Body::RegisterNak(RegisterNak {
            cookie: r.u32()?,
            mac: r.mac()?,
            reason: NakReason::from_u8(r.u8()?).ok_or(WireError::BadField("nak reason"))?,
        }),
        MsgKind::RegisterSuper => Body::RegisterSuper(RegisterSuper {
            cookie: r.u32()?,
            mac: r.mac()?,
            version: unpack_fixed(r.take(VERSION_LEN)?, "version")?,
            uptime: r.u32()?,
            selection: r.u32()?,
            communities: read_community_list(r)?,
        }),
        MsgKind::RegisterSuperAck => Body::RegisterSuperAck(RegisterSuperAck {
            cookie: r.u32()?,
            mac: r.mac()?,
            selection: r.u32()?,
            communities: read_community_list(r)?,
        }),
        MsgKind::RegisterSuperNak => Body::RegisterSuperNak(RegisterSuperNak {
            cookie: r.u32()?,
            reason: NakReason::from_u8(r.u8()?).ok_or(WireError::BadField("nak reason"))?,
        }),
        MsgKind::UnregisterSuper => Body::UnregisterSuper(UnregisterSuper { mac: r.mac()? }),
        MsgKind::Packet => Body::Packet(DataPacket {
            src_mac: r.mac()?,
            dst_mac: r.mac()?,
            transform: r.u16()?,
            frame: r.rest().to_vec(),
        }),
        MsgKind::QueryPeer => Body::QueryPeer(QueryPeer { src_mac: r.mac()?, target: r.mac()? }),
        MsgKind::PeerInfo => Body::PeerInfo(PeerInfo {
            requester: r.mac()?,
            target: r.mac()?,
            sock: read_sock(r)?,
        }),
        MsgKind::FederationInfo => {
            let count = r.u16()? as usize;
            if count > MAX_FED_MEMBERS {
                return Err(WireError::Oversize(count));
            }
            let mut members = Vec::with_capacity(count);
            for _ in 0..count {
                let sock = read_sock(r)?;
                let selection = r.u32()?;
                members.push((sock, selection));
            }
            Body::FederationInfo(FederationInfo { members })
        }
    };
    Ok(body)
}

// =============================================================================
// DATAGRAM ENCODE / DECODE
// =============================================================================

fn encode_header(d: &Datagram) -> Result<[u8; HEADER_LEN], WireError> {
    let mut out = [0u8; HEADER_LEN];
    out[0] = PROTOCOL_MAGIC;
    out[1] = PROTOCOL_VERSION;
    out[2] = d.body.kind() as u8;
    out[3] = d.header.ttl;
    out[4..6].copy_from_slice(&d.header.flags.to_be_bytes());
    out[6..].copy_from_slice(&pack_community(&d.header.community)?);
    Ok(out)
}

fn parse_header(bytes: &[u8]) -> Result<(MsgKind, Header), WireError> {
    if bytes.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    if bytes[0] != PROTOCOL_MAGIC {
        return Err(WireError::UnknownMagic(bytes[0]));
    }
    if bytes[1] != PROTOCOL_VERSION {
        return Err(WireError::UnknownVersion(bytes[1]));
    }
    let kind = MsgKind::from_u8(bytes[2]).ok_or(WireError::UnknownMsgType(bytes[2]))?;
    let header = Header {
        ttl: bytes[3],
        flags: u16::from_be_bytes([bytes[4], bytes[5]]),
        community: unpack_community(&bytes[6..HEADER_LEN])?,
    };
    Ok((kind, header))
}

pub fn encode(d: &Datagram, protection: &HeaderProtection) -> Result<Vec<u8>, WireError> {
    let header = encode_header(d)?;
    let mut body = Writer::new();
    encode_body(&d.body, &mut body)?;

    let mut out = match protection {
        HeaderProtection::Clear => {
            let mut out = Vec::with_capacity(HEADER_LEN + body.0.len());
            out.extend_from_slice(&header);
            out
        }
        HeaderProtection::Static(key) | HeaderProtection::User(key) => {
            let tag = match protection {
                HeaderProtection::User(_) => ENC_TAG_USER,
                _ => ENC_TAG_STATIC,
            };
            let nonce: [u8; NONCE_SIZE] = rand::random();
            let sealed = crypto::seal_header(key, &nonce, &header);
            let mut out = Vec::with_capacity(ENVELOPE_LEN + body.0.len());
            out.push(tag);
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&sealed);
            out
        }
    };
    out.extend_from_slice(&body.0);
    if out.len() > MAX_DATAGRAM {
        return Err(WireError::Oversize(out.len()));
    }
    Ok(out)
}

pub fn decode(
    bytes: &[u8],
    keys: &dyn KeyStore,
) -> Result<(Datagram, Option<AuthenticatedIdentity>), WireError> {
    if bytes.len() > MAX_DATAGRAM {
        return Err(WireError::Oversize(bytes.len()));
    }
    let first = *bytes.first().ok_or(WireError::Truncated)?;
    match first {
        PROTOCOL_MAGIC => {
            let (kind, header) = parse_header(bytes)?;
            let mut r = Reader::new(&bytes[HEADER_LEN..]);
            let body = decode_body(kind, &mut r)?;
            Ok((Datagram { header, body }, None))
        }
        ENC_TAG_STATIC => decode_sealed(bytes, HeaderMode::Static, keys),
        ENC_TAG_USER => decode_sealed(bytes, HeaderMode::User, keys),
        other => Err(WireError::UnknownMagic(other)),
    }
}

fn decode_sealed(
    bytes: &[u8],
    mode: HeaderMode,
    keys: &dyn KeyStore,
) -> Result<(Datagram, Option<AuthenticatedIdentity>), WireError> {
    if bytes.len() < ENVELOPE_LEN {
        return Err(WireError::Truncated);
    }
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&bytes[1..1 + NONCE_SIZE]);
    let sealed = &bytes[1 + NONCE_SIZE..ENVELOPE_LEN];
    let body_bytes = &bytes[ENVELOPE_LEN..];

    let candidates: Vec<(String, Option<String>, HeaderKey)> = match mode {
        HeaderMode::Static => keys
            .static_keys()
            .into_iter()
            .map(|(community, key)| (community, None, key))
            .collect(),
        HeaderMode::User => keys
            .user_keys()
            .into_iter()
            .map(|(community, user, key)| (community, Some(user), key))
            .collect(),
        HeaderMode::None => Vec::new(),
    };

    for (community, username, key) in candidates {
        let Ok(plain) = crypto::open_header(&key, &nonce, sealed) else {
            continue;
        };
        let (kind, header) = parse_header(&plain)?;
        // A key only authenticates headers naming its own community.
        if header.community != community {
            continue;
        }
        let mut r = Reader::new(body_bytes);
        let body = decode_body(kind, &mut r)?;
        let identity = AuthenticatedIdentity { community, username, mode };
        return Ok((Datagram { header, body }, Some(identity)));
    }
    Err(WireError::AuthFailure)
}
