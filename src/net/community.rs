//! Community registry: named overlays, their edge tables, ACL, auto-IP.

use crate::crypto::{HeaderKey, HeaderMode, KeyStore, SnKeypair, derive_static_key};
use crate::types::{Mac, PeerSocket};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::autoip::{AutoIpPool, Ipv4Net, PoolError};
use super::peer::PeerTable;
use super::types::COMMUNITY_LEN;
use super::wire::HeaderProtection;

#[derive(Error, Debug)]
pub enum AclError {
    #[error("cannot read ACL: {0}")]
    Io(#[from] std::io::Error),
    #[error("ACL line {line}: {reason}")]
    Syntax { line: usize, reason: String },
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Why a registration could not resolve its community.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denied {
    Reserved,
    NotPermitted,
    PoolExhausted,
}

// =============================================================================
// ACL FILE
// =============================================================================

/// One parsed ACL entry.
#[derive(Debug, Clone)]
pub struct AclCommunity {
    pub name: String,
    /// `<name> *` — open community, cleartext headers.
    pub open: bool,
    /// `<name> <file>` — user-password community with these public keys.
    pub user_keys: Option<BTreeMap<String, [u8; 32]>>,
}

#[derive(Debug, Clone, Default)]
pub struct Acl {
    pub communities: Vec<AclCommunity>,
}

impl Acl {
    /// Parse the ACL file. Any error leaves the caller's in-memory state
    /// untouched; reload is atomic by construction.
    pub fn load(path: &Path) -> Result<Acl, AclError> {
        let text = std::fs::read_to_string(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&text, base)
    }

    pub fn parse(text: &str, base: &Path) -> Result<Acl, AclError> {
        let mut communities = Vec::new();
        for (i, raw) in text.lines().enumerate() {
            let line = i + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut fields = trimmed.split_whitespace();
            let name = fields.next().expect("non-empty line has a first field");
            if name.len() > COMMUNITY_LEN {
                return Err(AclError::Syntax {
                    line,
                    reason: format!("community name '{name}' exceeds {COMMUNITY_LEN} bytes"),
                });
            }
            if name.starts_with('*') {
                return Err(AclError::Syntax {
                    line,
                    reason: "'*' names are reserved for federations".into(),
                });
            }
            let entry = match fields.next() {
                None => AclCommunity { name: name.into(), open: false, user_keys: None },
                Some("*") => AclCommunity { name: name.into(), open: true, user_keys: None },
                Some(keyfile) => {
                    let keys = load_user_keys(&base.join(keyfile))
                        .map_err(|reason| AclError::Syntax { line, reason })?;
                    AclCommunity { name: name.into(), open: false, user_keys: Some(keys) }
                }
            };
            if let Some(extra) = fields.next() {
                return Err(AclError::Syntax {
                    line,
                    reason: format!("unexpected trailing field '{extra}'"),
                });
            }
            if communities.iter().any(|c: &AclCommunity| c.name == entry.name) {
                return Err(AclError::Syntax {
                    line,
                    reason: format!("duplicate community '{}'", entry.name),
                });
            }
            communities.push(entry);
        }
        Ok(Acl { communities })
    }
}

/// Public-key file: `<username> <64-hex X25519 public key>` per line.
fn load_user_keys(path: &Path) -> Result<BTreeMap<String, [u8; 32]>, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read key file {}: {e}", path.display()))?;
    parse_user_keys(&text).map_err(|e| format!("{}: {e}", path.display()))
}

pub fn parse_user_keys(text: &str) -> Result<BTreeMap<String, [u8; 32]>, String> {
    let mut keys = BTreeMap::new();
    for (i, raw) in text.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut fields = trimmed.split_whitespace();
        let user = fields.next().expect("non-empty line has a first field");
        let hex_key = fields
            .next()
            .ok_or_else(|| format!("line {}: missing public key", i + 1))?;
        let bytes = hex::decode(hex_key).map_err(|e| format!("line {}: {e}", i + 1))?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| format!("line {}: key must be 32 bytes", i + 1))?;
        keys.insert(user.to_string(), key);
    }
    Ok(keys)
}

// =============================================================================
// COMMUNITY
// =============================================================================

/// One named overlay and its edge table.
#[derive(Debug)]
pub struct Community {
    pub name: String,
    pub mode: HeaderMode,
    /// Derived community-wide key (static mode).
    static_key: Option<HeaderKey>,
    /// username → X25519 public key (user mode).
    pub user_keys: BTreeMap<String, [u8; 32]>,
    /// Per-user header keys, derived on first use, dropped on ACL reload.
    user_key_cache: Mutex<BTreeMap<String, HeaderKey>>,
    pub auto_net: Ipv4Net,
    /// Set on the federation community itself and on communities learned
    /// through federation propagation.
    pub is_federation: bool,
    pub from_acl: bool,
    /// ACL-removed communities keep serving existing edges but refuse new
    /// registrations.
    pub joinable: bool,
    /// Community-level opt-out from MAC spoofing enforcement.
    pub spoofing_exempt: bool,
    pub edges: PeerTable,
}

impl Community {
    fn new(name: &str, mode: HeaderMode, auto_net: Ipv4Net) -> Self {
        let static_key = match mode {
            HeaderMode::Static => Some(derive_static_key(name)),
            _ => None,
        };
        Self {
            name: name.to_string(),
            mode,
            static_key,
            user_keys: BTreeMap::new(),
            user_key_cache: Mutex::new(BTreeMap::new()),
            auto_net,
            is_federation: false,
            from_acl: false,
            joinable: true,
            spoofing_exempt: false,
            edges: PeerTable::new(),
        }
    }

    pub fn static_key(&self) -> Option<HeaderKey> {
        self.static_key
    }

    /// Lazily-derived shared secret for one user, cached until ACL reload.
    pub fn user_header_key(&self, sn: &SnKeypair, username: &str) -> Option<HeaderKey> {
        if let Some(key) = self.user_key_cache.lock().expect("cache lock").get(username) {
            return Some(*key);
        }
        let public = self.user_keys.get(username)?;
        let key = sn.shared_key(public);
        self.user_key_cache
            .lock()
            .expect("cache lock")
            .insert(username.to_string(), key);
        Some(key)
    }

    fn clear_key_cache(&self) {
        self.user_key_cache.lock().expect("cache lock").clear();
    }

    /// Protection to apply when sending toward a member of this community.
    /// User mode needs the recipient's username; without it there is no key
    /// that the recipient could open.
    pub fn protection_for(&self, sn: &SnKeypair, username: Option<&str>) -> Option<HeaderProtection> {
        match self.mode {
            HeaderMode::None => Some(HeaderProtection::Clear),
            HeaderMode::Static => self.static_key.map(HeaderProtection::Static),
            HeaderMode::User => {
                let key = self.user_header_key(sn, username?)?;
                Some(HeaderProtection::User(key))
            }
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// All communities known to this supernode, keyed by name. A `BTreeMap`
/// keeps the key-trial order of the codec stable.
pub struct Registry {
    communities: BTreeMap<String, Community>,
    pool: AutoIpPool,
    pub federation_name: String,
    default_mode: HeaderMode,
    pub sn_key: SnKeypair,
    acl_configured: bool,
}

impl Registry {
    pub fn new(
        pool: AutoIpPool,
        federation_name: &str,
        default_mode: HeaderMode,
        sn_key: SnKeypair,
    ) -> Result<Self, PoolError> {
        let mut registry = Self {
            communities: BTreeMap::new(),
            pool,
            federation_name: federation_name.to_string(),
            default_mode,
            sn_key,
            acl_configured: false,
        };
        // The federation community always exists. Inter-supernode headers
        // are sealed with the key derived from the federation name.
        let net = registry.pool.assign(federation_name, |_| false)?;
        let mut fed = Community::new(federation_name, HeaderMode::Static, net);
        fed.is_federation = true;
        fed.joinable = false;
        registry.communities.insert(federation_name.to_string(), fed);
        Ok(registry)
    }

    pub fn federation(&self) -> &Community {
        self.communities
            .get(&self.federation_name)
            .expect("federation community always present")
    }

    pub fn federation_mut(&mut self) -> &mut Community {
        self.communities
            .get_mut(&self.federation_name)
            .expect("federation community always present")
    }

    pub fn find(&self, name: &str) -> Option<&Community> {
        self.communities.get(name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Community> {
        self.communities.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Community> {
        self.communities.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Community> {
        self.communities.values_mut()
    }

    pub fn len(&self) -> usize {
        self.communities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.communities.is_empty()
    }

    /// Total edges across every non-federation community; used as our
    /// advertised selection criterion.
    pub fn edge_count(&self) -> usize {
        self.communities
            .values()
            .filter(|c| !(c.name == self.federation_name))
            .map(|c| c.edges.len())
            .sum()
    }

    fn net_in_use(&self, net: Ipv4Net) -> bool {
        self.communities.values().any(|c| c.auto_net == net)
    }

    fn create(&mut self, name: &str, mode: HeaderMode) -> Result<&mut Community, PoolError> {
        let net = {
            let taken: Vec<Ipv4Net> = self.communities.values().map(|c| c.auto_net).collect();
            self.pool.assign(name, |n| taken.contains(&n))?
        };
        info!("community '{}' created, auto-IP {}", name, net);
        self.communities.insert(name.to_string(), Community::new(name, mode, net));
        Ok(self.communities.get_mut(name).expect("just inserted"))
    }

    /// Resolve the community for an edge registration, creating it when
    /// policy allows: no ACL configured (open mode), or the name came from
    /// the ACL (already resident), or user-password auth succeeded (also
    /// already resident, since its keys came from the ACL).
    pub fn find_or_create(&mut self, name: &str) -> Result<&mut Community, Denied> {
        if name.starts_with('*') {
            return Err(Denied::Reserved);
        }
        if self.communities.contains_key(name) {
            return Ok(self.communities.get_mut(name).expect("checked present"));
        }
        if self.acl_configured {
            return Err(Denied::NotPermitted);
        }
        self.create(name, self.default_mode).map_err(|_| Denied::PoolExhausted)
    }

    /// Adopt a community learned from a federated supernode. Local edges
    /// may only join it where the ACL (or open mode) says so; relaying
    /// works regardless.
    pub fn merge_remote(&mut self, name: &str) -> bool {
        if name.starts_with('*') || self.communities.contains_key(name) {
            return false;
        }
        let acl_configured = self.acl_configured;
        match self.create(name, self.default_mode) {
            Ok(community) => {
                community.is_federation = true;
                community.from_acl = false;
                community.joinable = !acl_configured;
                debug!("community '{}' merged from federation", name);
                true
            }
            Err(e) => {
                warn!("cannot merge federated community '{}': {}", name, e);
                false
            }
        }
    }

    /// First ACL load; a parse failure here is fatal to startup.
    pub fn load_acl(&mut self, path: &Path) -> Result<(), AclError> {
        let acl = Acl::load(path)?;
        self.apply_acl(&acl)
    }

    /// Atomic reload: parse first, reconcile only on success.
    pub fn reload_acl(&mut self, path: &Path) -> Result<(), AclError> {
        let acl = Acl::load(path)?;
        self.apply_acl(&acl)
    }

    pub fn apply_acl(&mut self, acl: &Acl) -> Result<(), AclError> {
        self.acl_configured = true;

        // Communities dropped from the ACL turn read-only.
        let listed: Vec<String> = acl.communities.iter().map(|c| c.name.clone()).collect();
        for community in self.communities.values_mut() {
            if community.from_acl && !listed.contains(&community.name) {
                if community.joinable {
                    info!("community '{}' removed from ACL, now read-only", community.name);
                }
                community.joinable = false;
            }
        }

        for entry in &acl.communities {
            let mode = if entry.open {
                HeaderMode::None
            } else if entry.user_keys.is_some() {
                HeaderMode::User
            } else {
                self.default_mode
            };

            if !self.communities.contains_key(&entry.name) {
                self.create(&entry.name, mode)?;
            }
            let community = self.communities.get_mut(&entry.name).expect("created above");
            community.mode = mode;
            community.from_acl = true;
            community.joinable = true;
            community.user_keys = entry.user_keys.clone().unwrap_or_default();
            community.clear_key_cache();
        }
        Ok(())
    }

    /// Spoofing check: is `mac` already bound to a different identity —
    /// another socket in a foreign community, or another username anywhere?
    pub fn mac_conflict(
        &self,
        community: &str,
        mac: Mac,
        sock: PeerSocket,
        username: Option<&str>,
    ) -> bool {
        for (name, c) in &self.communities {
            let Some(existing) = c.edges.get(mac) else {
                continue;
            };
            if existing.key_id.as_deref() != username {
                return true;
            }
            if name != community && existing.sock != sock {
                return true;
            }
        }
        false
    }
}

impl KeyStore for Registry {
    fn static_keys(&self) -> Vec<(String, HeaderKey)> {
        self.communities
            .values()
            .filter_map(|c| c.static_key().map(|k| (c.name.clone(), k)))
            .collect()
    }

    fn user_keys(&self) -> Vec<(String, String, HeaderKey)> {
        let mut out = Vec::new();
        for c in self.communities.values() {
            if c.mode != HeaderMode::User {
                continue;
            }
            for username in c.user_keys.keys() {
                if let Some(key) = c.user_header_key(&self.sn_key, username) {
                    out.push((c.name.clone(), username.clone(), key));
                }
            }
        }
        out
    }
}
