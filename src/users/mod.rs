//! Credential table replicated from the backend servers.
//!
//! Clients authenticate against this table, not against the backends:
//! entries are batch-loaded with a privileged query, keyed by
//! (user, IPv4, netmask, database), and swapped in wholesale so lookups
//! never block a reload.

mod fetch;

pub use fetch::{fetch_users, FetchError};

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use crate::protocol::SCRAMBLE_LEN;

/// One raw credential row as returned by the loading query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub user: String,
    pub host: String,
    /// `*`-prefixed hex double hash, or empty for password-less accounts
    pub password: String,
    /// Database-level grant, when the row came from a db-grant table
    pub db: Option<String>,
    /// Whether the account may use any database
    pub any_db: bool,
}

/// Database grant carried by one credential entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbGrant {
    /// Entry is valid for any database
    Any,
    /// Entry is valid for exactly this database
    Named(String),
    /// Entry grants no database; connecting with one is denied
    NoGrant,
}

/// One (user, host-pattern, db, password-hash) credential
#[derive(Debug, Clone)]
pub struct UserEntry {
    /// IPv4 pattern with wildcarded octets zeroed
    pub addr: u32,
    /// Significant prefix bits: 32, 24, 16, 8 or 0
    pub netmask: u8,
    /// Database this entry grants
    pub db: DbGrant,
    /// SHA1(SHA1(password)); empty for password-less accounts
    pub password_hash: Vec<u8>,
}

impl UserEntry {
    fn matches(&self, addr: Ipv4Addr, db: Option<&str>) -> bool {
        let mask = netmask_bits_to_mask(self.netmask);
        if (u32::from(addr) & mask) != (self.addr & mask) {
            return false;
        }
        match (&self.db, db) {
            (DbGrant::Any, _) => true,
            (DbGrant::Named(_), None) => true,
            (DbGrant::Named(granted), Some(requested)) => granted == requested,
            (DbGrant::NoGrant, None) => true,
            (DbGrant::NoGrant, Some(_)) => false,
        }
    }
}

fn netmask_bits_to_mask(bits: u8) -> u32 {
    match bits {
        0 => 0,
        32 => u32::MAX,
        n => u32::MAX << (32 - n as u32),
    }
}

/// Encode a host pattern into an (address, netmask-bits) pair.
///
/// Wildcards replace whole octets from the right: `a.b.c.%` keeps 24
/// significant bits, `a.b.%.%` 16, `a.%.%.%` 8, `%` and `%.%.%.%` none.
/// Literal addresses keep all 32. Anything else (hostnames, partial-octet
/// wildcards) is not representable here and must be resolved first.
pub fn parse_host_pattern(pattern: &str) -> Option<(u32, u8)> {
    if pattern == "%" {
        return Some((0, 0));
    }

    let octets: Vec<&str> = pattern.split('.').collect();
    if octets.len() != 4 {
        return None;
    }

    let mut addr: u32 = 0;
    let mut wildcards = 0u8;
    let mut seen_wildcard = false;
    for part in &octets {
        addr <<= 8;
        if *part == "%" {
            wildcards += 1;
            seen_wildcard = true;
        } else {
            // Wildcards may only trail the fixed octets
            if seen_wildcard {
                return None;
            }
            let octet: u8 = part.parse().ok()?;
            addr |= octet as u32;
        }
    }

    Some((addr, 32 - wildcards * 8))
}

/// Immutable snapshot of the credential table
#[derive(Debug, Default)]
pub struct UserTable {
    entries: std::collections::HashMap<String, Vec<UserEntry>>,
    version: u64,
}

/// Outcome of a credential lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    /// Matched; the stored double hash to verify the token against
    Granted(Vec<u8>),
    /// Nothing matched, or the matching entries grant no such database
    Denied,
}

impl UserTable {
    pub fn new(version: u64) -> Self {
        Self {
            entries: Default::default(),
            version,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn add(&mut self, user: &str, entry: UserEntry) {
        self.entries.entry(user.to_string()).or_default().push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up the credential matching (user, address, database).
    ///
    /// Non-IPv4 peers only match full-wildcard entries.
    pub fn lookup(&self, user: &str, addr: IpAddr, db: Option<&str>) -> Grant {
        let addr = match addr {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => v4,
                None => Ipv4Addr::UNSPECIFIED,
            },
        };

        let entries = match self.entries.get(user) {
            Some(entries) => entries,
            None => return Grant::Denied,
        };

        // Prefer the most specific netmask among matching entries
        entries
            .iter()
            .filter(|e| e.matches(addr, db))
            .max_by_key(|e| e.netmask)
            .map(|e| Grant::Granted(e.password_hash.clone()))
            .unwrap_or(Grant::Denied)
    }
}

/// Shared handle over the current credential snapshot.
///
/// Readers take a snapshot once per operation; a reload builds a whole new
/// table and swaps the pointer. The SHA-1 digest of the raw query result
/// makes repeated reloads of unchanged data a no-op.
pub struct UserStore {
    table: RwLock<Arc<UserTable>>,
    checksum: Mutex<Option<[u8; SCRAMBLE_LEN]>>,
}

impl Default for UserStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStore {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(UserTable::default())),
            checksum: Mutex::new(None),
        }
    }

    /// Current snapshot; valid for the caller's whole operation even if a
    /// reload lands meanwhile
    pub fn snapshot(&self) -> Arc<UserTable> {
        self.table.read().clone()
    }

    /// Install a freshly loaded table unless its checksum matches the one
    /// already installed. Returns whether a swap happened.
    pub fn replace(&self, mut table: UserTable, checksum: [u8; SCRAMBLE_LEN]) -> bool {
        let mut current = self.checksum.lock();
        if current.as_ref() == Some(&checksum) {
            debug!("credential tables not switched, checksum is the same");
            return false;
        }

        table.version = self.table.read().version().wrapping_add(1);
        let count = table.len();
        *self.table.write() = Arc::new(table);
        *current = Some(checksum);
        info!(entries = count, "credential table replaced, checksum differs");
        true
    }
}

/// Re-fetches the credential table on demand.
///
/// Reloads are throttled: a burst of authentication failures (one broken
/// client retrying in a loop) must not turn into a query storm against
/// the backends.
pub struct UserRefresher {
    store: Arc<UserStore>,
    /// Backend addresses to try, in order
    sources: Vec<String>,
    user: String,
    password: String,
    min_interval: std::time::Duration,
    last_attempt: Mutex<Option<std::time::Instant>>,
}

impl UserRefresher {
    pub fn new(store: Arc<UserStore>, sources: Vec<String>, user: &str, password: &str) -> Self {
        Self {
            store,
            sources,
            user: user.to_string(),
            password: password.to_string(),
            min_interval: std::time::Duration::from_secs(10),
            last_attempt: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_min_interval(mut self, interval: std::time::Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Fetch and install a fresh table. Returns whether anything changed.
    pub async fn refresh(&self) -> bool {
        {
            let mut last = self.last_attempt.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.min_interval {
                    debug!("credential reload throttled");
                    crate::metrics::metrics().record_user_reload("throttled");
                    return false;
                }
            }
            *last = Some(std::time::Instant::now());
        }

        for source in &self.sources {
            match fetch_users(source, &self.user, &self.password).await {
                Ok(rows) => {
                    let checksum = table_checksum(&rows);
                    let changed = self.store.replace(build_table(&rows), checksum);
                    crate::metrics::metrics()
                        .record_user_reload(if changed { "changed" } else { "unchanged" });
                    return changed;
                }
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "credential fetch failed");
                }
            }
        }
        crate::metrics::metrics().record_user_reload("failed");
        false
    }
}

/// Digest raw credential rows for reload deduplication
pub fn table_checksum(rows: &[UserRow]) -> [u8; SCRAMBLE_LEN] {
    let mut hasher = Sha1::new();
    for row in rows {
        hasher.update(row.user.as_bytes());
        hasher.update(row.host.as_bytes());
        hasher.update(row.password.as_bytes());
        if let Some(db) = &row.db {
            hasher.update(db.as_bytes());
        }
        hasher.update([row.any_db as u8]);
    }
    hasher.finalize().into()
}

/// Decode a `*`-prefixed hex password hash from mysql.user
pub fn decode_password_hash(raw: &str) -> Option<Vec<u8>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(Vec::new());
    }
    let hex = raw.strip_prefix('*')?;
    if hex.len() != SCRAMBLE_LEN * 2 {
        return None;
    }
    let mut out = Vec::with_capacity(SCRAMBLE_LEN);
    let bytes = hex.as_bytes();
    for i in (0..hex.len()).step_by(2) {
        let hi = (bytes[i] as char).to_digit(16)?;
        let lo = (bytes[i + 1] as char).to_digit(16)?;
        out.push(((hi << 4) | lo) as u8);
    }
    Some(out)
}

/// Build a table from raw credential rows.
///
/// Rows whose host pattern cannot be encoded (hostnames the caller did not
/// resolve) are skipped with a log line rather than failing the load.
pub fn build_table(rows: &[UserRow]) -> UserTable {
    let mut table = UserTable::new(0);
    for row in rows {
        let (addr, netmask) = match parse_host_pattern(&row.host) {
            Some(v) => v,
            None => {
                debug!(user = %row.user, host = %row.host,
                    "skipping credential with unsupported host pattern");
                continue;
            }
        };
        let password_hash = match decode_password_hash(&row.password) {
            Some(v) => v,
            None => {
                debug!(user = %row.user, "skipping credential with malformed password hash");
                continue;
            }
        };
        let db = match &row.db {
            Some(db) if !db.is_empty() => DbGrant::Named(db.clone()),
            _ if row.any_db => DbGrant::Any,
            _ => DbGrant::NoGrant,
        };
        table.add(
            &row.user,
            UserEntry {
                addr,
                netmask,
                db,
                password_hash,
            },
        );
    }
    table
}
