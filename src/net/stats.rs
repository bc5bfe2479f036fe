//! Packet counters and event timestamps for the management surface.

use serde::Serialize;

/// Per-bucket tx/rx counters. Mutated only under the state lock, read out
/// verbatim by `get_packetstats`.
#[derive(Debug, Default, Clone, Serialize)]
pub struct PacketStats {
    pub rx_register: u64,
    pub rx_register_super: u64,
    pub rx_packet: u64,
    pub rx_query_peer: u64,
    /// Malformed, truncated or unauthenticated inbound datagrams.
    pub rx_error: u64,
    /// Unicast forwards to a known edge.
    pub sn_fwd: u64,
    /// Broadcast fan-outs (counted once per inbound broadcast).
    pub sn_broadcast: u64,
    /// REGISTER_ACKs sent.
    pub sn_reg: u64,
    /// NAKs of any flavor actually emitted.
    pub sn_reg_nak: u64,
    /// REGISTER_SUPER_ACKs sent.
    pub sn_reg_super: u64,
    /// Datagrams dropped by policy (TTL exhausted, suppressed NAK, ...).
    pub sn_drop: u64,
    /// Inbound messages this node never handles (stray ACKs and the like).
    pub sn_errors: u64,
    /// Datapath writes dropped because a send path would block.
    pub tx_drop: u64,
    pub mgmt_requests: u64,
}

/// Monotonic last-event timestamps (unix seconds).
#[derive(Debug, Default, Clone, Serialize)]
pub struct Timestamps {
    pub start_time: u64,
    pub last_reg: u64,
    pub last_super: u64,
    pub last_fwd: u64,
    pub last_mgmt: u64,
}
