//! Resolved daemon configuration.
//!
//! The CLI front-end (and any future config-file loader) resolves its
//! sources into this struct; the core consumes nothing else.

use crate::crypto::HeaderMode;
use crate::net::types::{
    DEFAULT_MGMT_PORT, DEFAULT_PORT, DEFAULT_REGISTRATION_TTL, FED_TTL_FACTOR,
    MIN_PURGE_INTERVAL, VERSION_LEN,
};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("version string '{0}' exceeds {max} bytes", max = VERSION_LEN - 1)]
    VersionTooLong(String),
    #[error("federation name must fit the community field: '{0}'")]
    FederationNameTooLong(String),
    #[error("registration TTL must be positive")]
    ZeroTtl,
}

#[derive(Debug, Clone)]
pub struct SnConfig {
    /// Datapath bind address (UDP, and aux TCP when enabled).
    pub bind_address: IpAddr,
    pub port: u16,
    pub tcp_enabled: bool,

    /// Management plane; loopback unless overridden.
    pub mgmt_bind: IpAddr,
    pub mgmt_port: u16,
    pub mgmt_password: Option<String>,

    /// Federation community name; a missing `*` prefix is added at
    /// normalization.
    pub federation_name: String,
    /// Statically-configured anchors, `host:port`.
    pub federation_peers: Vec<String>,

    /// Community ACL file; absent means open mode.
    pub community_file: Option<PathBuf>,

    pub auto_ip_pool_min: Ipv4Addr,
    pub auto_ip_pool_max: Ipv4Addr,
    pub auto_ip_prefix: u8,

    pub registration_ttl: u64,
    pub spoofing_protection: bool,
    pub header_encryption_default: HeaderMode,

    /// Version string advertised on the wire, at most 19 bytes.
    pub version_string: String,

    /// Supernode X25519 key file for user-auth communities; generated on
    /// first start when the path does not exist.
    pub key_file: Option<PathBuf>,
}

impl Default for SnConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            tcp_enabled: false,
            mgmt_bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            mgmt_port: DEFAULT_MGMT_PORT,
            mgmt_password: None,
            federation_name: "*Federation".into(),
            federation_peers: Vec::new(),
            community_file: None,
            auto_ip_pool_min: Ipv4Addr::new(10, 128, 0, 0),
            auto_ip_pool_max: Ipv4Addr::new(10, 255, 255, 0),
            auto_ip_prefix: 24,
            registration_ttl: DEFAULT_REGISTRATION_TTL,
            spoofing_protection: true,
            header_encryption_default: HeaderMode::None,
            version_string: concat!("vesper-", env!("CARGO_PKG_VERSION")).into(),
            key_file: None,
        }
    }
}

impl SnConfig {
    /// Normalize and sanity-check what the loaders handed us.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.registration_ttl == 0 {
            return Err(ConfigError::ZeroTtl);
        }
        if self.version_string.len() >= VERSION_LEN {
            return Err(ConfigError::VersionTooLong(self.version_string));
        }
        if !self.federation_name.starts_with('*') {
            self.federation_name.insert(0, '*');
        }
        if self.federation_name.len() > crate::net::types::COMMUNITY_LEN {
            return Err(ConfigError::FederationNameTooLong(self.federation_name));
        }
        Ok(self)
    }

    /// Purge sweep period: a quarter TTL, floored.
    pub fn purge_interval(&self) -> u64 {
        (self.registration_ttl / 4).max(MIN_PURGE_INTERVAL)
    }

    /// Lifetime of purgeable federated supernodes.
    pub fn federation_ttl(&self) -> u64 {
        self.registration_ttl * FED_TTL_FACTOR
    }
}
