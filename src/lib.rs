pub mod config;
pub mod crypto;
pub mod mgmt;
pub mod net;
pub mod types;

pub use config::SnConfig;
pub use crypto::{HeaderMode, KeyStore, SnKeypair, pearson_64};
pub use mgmt::events::{EventBus, Topic};
pub use net::{Outgoing, Registry, SnState, Supernode};
pub use types::{Mac, PeerSocket, Proto, now};
