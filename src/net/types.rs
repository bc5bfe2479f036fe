//! Protocol constants and small shared protocol types.

use serde::Serialize;
use std::fmt;

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// First byte of every cleartext datagram. Unknown values are rejected.
pub const PROTOCOL_MAGIC: u8 = 0x56;

/// Wire format version. Increment on breaking layout changes.
pub const PROTOCOL_VERSION: u8 = 1;

/// Envelope discriminators for encrypted headers; they occupy the magic
/// byte position so the decoder can pick a key-trial path before any key
/// is known.
pub const ENC_TAG_STATIC: u8 = 0xfd;
pub const ENC_TAG_USER: u8 = 0xfe;

/// Default data port, UDP and aux TCP alike.
pub const DEFAULT_PORT: u16 = 7654;

/// Default management HTTP port, loopback only unless overridden.
pub const DEFAULT_MGMT_PORT: u16 = 5644;

// =============================================================================
// FIELD SIZES
// =============================================================================

/// Community name field: fixed, NUL-padded, no terminator slack. A 16-byte
/// name is legal; a longer one cannot be encoded at all.
pub const COMMUNITY_LEN: usize = 16;

/// Version string field: NUL-padded, at most 19 usable bytes.
pub const VERSION_LEN: usize = 20;

/// Common header: magic, version, type, TTL, flags, community name.
pub const HEADER_LEN: usize = 6 + COMMUNITY_LEN;

/// Upper bound for one overlay datagram on either transport.
pub const MAX_DATAGRAM: usize = 2048;

/// Community names carried in one federation registration.
pub const MAX_FED_COMMUNITIES: usize = 64;

/// Members listed in one FederationInfo answer.
pub const MAX_FED_MEMBERS: usize = 64;

// =============================================================================
// HEADER FLAGS
// =============================================================================

/// Set on a supernode-to-supernode rebroadcast; blocks a second hop.
pub const FLAG_RELAYED: u16 = 0x0001;

/// Set on every packet a supernode originates.
pub const FLAG_FROM_SUPERNODE: u16 = 0x0002;

// =============================================================================
// TIMERS
// =============================================================================

/// Default edge registration lifetime in seconds.
pub const DEFAULT_REGISTRATION_TTL: u64 = 60;

/// Purge sweep floor: the sweep runs every `ttl / 4`, but never more often
/// than this.
pub const MIN_PURGE_INTERVAL: u64 = 10;

/// Federated supernodes expire at `FED_TTL_FACTOR × registration_ttl`.
/// Anchors never expire.
pub const FED_TTL_FACTOR: u64 = 3;

/// Interval between REGISTER_SUPER rounds to the configured anchors.
pub const FED_REREGISTER_INTERVAL: u64 = 30;

/// Initial TTL stamped on packets the supernode originates or floods.
pub const PACKET_TTL: u8 = 2;

// =============================================================================
// MANAGEMENT
// =============================================================================

/// Concurrent management connections served at once.
pub const MGMT_SLOTS: usize = 5;

/// Idle management requests are torn down after this many seconds.
pub const MGMT_IDLE_TIMEOUT: u64 = 30;

// =============================================================================
// NAK RATE LIMITING
// =============================================================================
// Auth NAKs are a reflection primitive; one bucket per source socket.

pub const NAK_BUCKET_CAPACITY: f64 = 4.0;
pub const NAK_REFILL_PER_SEC: f64 = 0.5;

// =============================================================================
// SHARED PROTOCOL TYPES
// =============================================================================

/// Reason byte carried by REGISTER_NAK / REGISTER_SUPER_NAK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NakReason {
    Auth,
    Community,
    MacInUse,
    Unregistered,
}

impl NakReason {
    pub fn as_u8(self) -> u8 {
        match self {
            NakReason::Auth => 1,
            NakReason::Community => 2,
            NakReason::MacInUse => 3,
            NakReason::Unregistered => 4,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(NakReason::Auth),
            2 => Some(NakReason::Community),
            3 => Some(NakReason::MacInUse),
            4 => Some(NakReason::Unregistered),
            _ => None,
        }
    }
}

impl fmt::Display for NakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NakReason::Auth => write!(f, "AUTH"),
            NakReason::Community => write!(f, "COMMUNITY"),
            NakReason::MacInUse => write!(f, "MAC_IN_USE"),
            NakReason::Unregistered => write!(f, "UNREGISTERED"),
        }
    }
}

/// Observable lifecycle of a registered edge. `Removed`/`Unregistered` are
/// not represented: a removed peer simply has no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeState {
    Registered,
    Stale,
}
