//! Overlay networking: wire codec, peer/community state, dispatch, runtime.

pub mod autoip;
pub mod community;
pub mod dispatch;
pub mod peer;
pub mod session;
pub mod stats;
pub mod supernode;
pub mod types;
pub mod wire;

// Re-exports
pub use autoip::{AutoIpPool, Ipv4Net, edge_ip};
pub use community::{Acl, AclError, Community, Denied, Registry};
pub use dispatch::handle_datagram;
pub use peer::{Peer, PeerTable, Upsert};
pub use session::{NakLimiter, Outgoing, SnState, TokenBucket};
pub use stats::{PacketStats, Timestamps};
pub use supernode::{SnError, Supernode};
pub use types::{EdgeState, NakReason};
pub use wire::{Body, Datagram, Header, HeaderProtection, MsgKind, WireError};
