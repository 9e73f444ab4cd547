//! Account Store & Authenticator (C1).
//!
//! Generations are published via `ArcSwap` so readers always observe either
//! the old or new generation in full, never a mix.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::IpNet;
use serde::Deserialize;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read accounts file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse accounts YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("duplicate token for account {0:?}")]
    DuplicateToken(String),
    #[error("account {account:?} has invalid allowedIps entry {entry:?}: {reason}")]
    InvalidCidr {
        account: String,
        entry: String,
        reason: String,
    },
}

/// An immutable account record, loaded from one generation of the accounts file.
///
/// `leased` collapses the spec's separate "Lease Set" onto the account
/// itself: leases are keyed by identity of the specific `Arc<Account>` they
/// were granted against, and since that identity is exactly this struct, a
/// per-account atomic counter is sufficient and survives reload for free (a
/// held `Arc<Account>` keeps its generation's data alive even after the
/// store swaps to a newer generation).
#[derive(Debug)]
pub struct Account {
    pub name: String,
    pub token: String,
    pub reuse: bool,
    pub routes: HashSet<String>,
    pub allowed_ips: Vec<IpNet>,
    leased: AtomicU32,
}

impl Account {
    /// Returns `false` if already leased and `reuse == false`.
    pub fn lease(&self) -> bool {
        if self.reuse {
            self.leased.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        self.leased
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Removes one occurrence; returns whether a removal happened.
    pub fn release(&self) -> bool {
        loop {
            let current = self.leased.load(Ordering::Acquire);
            if current == 0 {
                return false;
            }
            if self
                .leased
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn allows_ip(&self, ip: IpAddr) -> bool {
        self.allowed_ips.iter().any(|net| net.contains(&ip))
    }
}

struct Generation {
    by_token: HashMap<String, Arc<Account>>,
    all_routes: HashSet<String>,
}

pub struct AccountStore {
    inner: ArcSwap<Generation>,
}

impl AccountStore {
    /// Load the initial generation. Failure here is fatal (§7 ConfigError
    /// at load) — the caller should propagate it and refuse to start.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let generation = parse_generation(path)?;
        Ok(Self {
            inner: ArcSwap::from_pointee(generation),
        })
    }

    /// `authenticate(token, route, clientIp) -> Account | null` (§4.1).
    ///
    /// No error is distinguished from "no match" — every rejection path
    /// returns `None` and the caller logs at debug.
    pub fn authenticate(&self, token: &str, route: &str, client_ip: IpAddr) -> Option<Arc<Account>> {
        let gen = self.inner.load();
        let account = gen.by_token.get(token)?;
        if !account.routes.contains(route) {
            debug!(account = %account.name, route, "authenticate: route not permitted");
            return None;
        }
        if !account.allows_ip(client_ip) {
            debug!(account = %account.name, %client_ip, "authenticate: IP not permitted");
            return None;
        }
        Some(Arc::clone(account))
    }

    /// True iff any account (in the current generation) has this route.
    pub fn contains_route(&self, route: &str) -> bool {
        self.inner.load().all_routes.contains(route)
    }

    /// Re-parse `path` and publish a new generation. On duplicate tokens or
    /// a parse error, the current generation is left intact and the error
    /// is logged (§4.1, §7 — reload failure is recoverable, load failure is
    /// not).
    pub fn reload(&self, path: &Path) {
        match parse_generation(path) {
            Ok(generation) => {
                let account_count = generation.by_token.len();
                self.inner.store(Arc::new(generation));
                info!(account_count, "accounts reloaded");
            }
            Err(e) => {
                error!(error = %e, "accounts reload failed, keeping current generation");
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct AccountsFile {
    accounts: Vec<AccountRecord>,
}

#[derive(Debug, Deserialize)]
struct AccountRecord {
    name: String,
    token: String,
    #[serde(default)]
    reuse: bool,
    #[serde(default)]
    routes: Vec<String>,
    #[serde(default, rename = "allowedIps")]
    allowed_ips: Vec<String>,
}

fn parse_generation(path: &Path) -> Result<Generation, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let file: AccountsFile = serde_yaml::from_str(&raw)?;

    let mut by_token = HashMap::with_capacity(file.accounts.len());
    let mut all_routes = HashSet::new();

    for record in file.accounts {
        if by_token.contains_key(&record.token) {
            return Err(ConfigError::DuplicateToken(record.token));
        }

        let mut allowed_ips = Vec::with_capacity(record.allowed_ips.len());
        for entry in &record.allowed_ips {
            allowed_ips.push(parse_cidr(entry).map_err(|reason| ConfigError::InvalidCidr {
                account: record.name.clone(),
                entry: entry.clone(),
                reason,
            })?);
        }

        all_routes.extend(record.routes.iter().cloned());

        let account = Arc::new(Account {
            name: record.name,
            token: record.token.clone(),
            reuse: record.reuse,
            routes: record.routes.into_iter().collect(),
            allowed_ips,
            leased: AtomicU32::new(0),
        });
        by_token.insert(record.token, account);
    }

    Ok(Generation {
        by_token,
        all_routes,
    })
}

/// Parses a CIDR string, or a bare IP as an implicit /32 (v4) or /128 (v6),
/// matching the §6.3 example (`'127.0.0.1'`, `'172.16.0.0/16'`).
fn parse_cidr(entry: &str) -> Result<IpNet, String> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net);
    }
    entry
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|e| e.to_string())
}

pub fn default_accounts_path(config_file: &str) -> PathBuf {
    PathBuf::from(config_file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_accounts(yaml: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f
    }

    const SAMPLE: &str = r#"
accounts:
  - name: user1
    token: '123456'
    reuse: false
    routes: ['127.0.0.1:8888', '192.168.1.2:5050']
    allowedIps: ['127.0.0.1', '172.16.0.0/16']
  - name: user2
    token: 'abcdef'
    reuse: true
    routes: ['127.0.0.1:9999']
    allowedIps: ['10.0.0.0/8']
"#;

    #[test]
    fn authenticate_totality() {
        let f = write_accounts(SAMPLE);
        let store = AccountStore::load(f.path()).unwrap();

        assert!(store
            .authenticate("123456", "127.0.0.1:8888", "127.0.0.1".parse().unwrap())
            .is_some());
        assert!(store
            .authenticate("123456", "127.0.0.1:8888", "10.0.0.1".parse().unwrap())
            .is_none());
        assert!(store
            .authenticate("123456", "no:route", "127.0.0.1".parse().unwrap())
            .is_none());
        assert!(store
            .authenticate("wrong-token", "127.0.0.1:8888", "127.0.0.1".parse().unwrap())
            .is_none());
        assert!(store
            .authenticate("123456", "127.0.0.1:8888", "172.16.5.9".parse().unwrap())
            .is_some());
    }

    #[test]
    fn lease_exclusion_for_non_reuse() {
        let f = write_accounts(SAMPLE);
        let store = AccountStore::load(f.path()).unwrap();
        let account = store
            .authenticate("123456", "127.0.0.1:8888", "127.0.0.1".parse().unwrap())
            .unwrap();

        assert!(account.lease());
        assert!(!account.lease());
        assert!(account.release());
        assert!(account.lease());
    }

    #[test]
    fn lease_reuse_allows_many() {
        let f = write_accounts(SAMPLE);
        let store = AccountStore::load(f.path()).unwrap();
        let account = store
            .authenticate("abcdef", "127.0.0.1:9999", "10.0.0.1".parse().unwrap())
            .unwrap();

        assert!(account.lease());
        assert!(account.lease());
        assert!(account.release());
        assert!(account.release());
        assert!(!account.release());
    }

    #[test]
    fn duplicate_token_rejected() {
        let f = write_accounts(
            r#"
accounts:
  - name: a
    token: 'dup'
    routes: ['h:1']
    allowedIps: ['0.0.0.0/0']
  - name: b
    token: 'dup'
    routes: ['h:2']
    allowedIps: ['0.0.0.0/0']
"#,
        );
        assert!(matches!(
            AccountStore::load(f.path()),
            Err(ConfigError::DuplicateToken(_))
        ));
    }

    #[test]
    fn reload_atomicity_adds_user_without_disturbing_lease() {
        let f = write_accounts(SAMPLE);
        let store = AccountStore::load(f.path()).unwrap();
        let user1 = store
            .authenticate("123456", "127.0.0.1:8888", "127.0.0.1".parse().unwrap())
            .unwrap();
        assert!(user1.lease());

        let mut f2 = std::fs::File::create(f.path()).unwrap();
        write!(
            f2,
            "{}",
            SAMPLE.to_string()
                + "\n"
                + r#"
  - name: user3
    token: 'ghijkl'
    routes: ['h:3']
    allowedIps: ['0.0.0.0/0']
"#
        )
        .unwrap();
        drop(f2);
        store.reload(f.path());

        assert!(store
            .authenticate("ghijkl", "h:3", "1.2.3.4".parse().unwrap())
            .is_some());
        // The held Arc from before reload is still a valid, leased account.
        assert!(!user1.lease());
    }

    #[test]
    fn contains_route() {
        let f = write_accounts(SAMPLE);
        let store = AccountStore::load(f.path()).unwrap();
        assert!(store.contains_route("127.0.0.1:8888"));
        assert!(!store.contains_route("nope:0"));
    }
}
