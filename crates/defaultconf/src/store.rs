//! Persistent registration store
//!
//! Handlers without a long-lived connection to the daemon (DHCP hook
//! scripts, PPP ip-up, static configuration) register through the CLI, which
//! edits a JSON file under an exclusive lock and signals the daemon with
//! SIGUSR1. The daemon then diffs the file into the engine through the
//! [`Registrar`].

use crate::channel::RouteChannel;
use crate::config::DaemonConfig;
use crate::error::{DefaultconfError, Result};
use crate::policy::{PriorityPolicy, Selector};
use crate::registration::{Registrar, RegistrationHandle};
use crate::types::{Candidate, CandidateKey};
use chrono::{DateTime, Utc};
use defaultconf_types::{AddressFamily, ProtocolTag};
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// One registered gateway as persisted on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredGateway {
    pub af: AddressFamily,
    pub link: String,
    pub protocol: ProtocolTag,
    pub addr: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<IpAddr>,
    pub version: u64,
    pub registered_at: DateTime<Utc>,
}

impl StoredGateway {
    pub fn key(&self) -> CandidateKey {
        CandidateKey::new(self.protocol.clone(), self.link.clone(), self.af)
    }

    pub fn to_candidate(&self) -> Candidate {
        Candidate {
            protocol: self.protocol.clone(),
            family: self.af,
            interface: self.link.clone(),
            gateway: self.addr,
            source: self.source,
            version: self.version,
        }
    }

    fn same_registration(&self, other: &StoredGateway) -> bool {
        self.addr == other.addr && self.source == other.source && self.version == other.version
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationStore {
    #[serde(default)]
    pub gateways: Vec<StoredGateway>,
    #[serde(default)]
    pub disabled: BTreeSet<Selector>,
}

impl RegistrationStore {
    /// Reads the store; a missing file is an empty store.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) if content.trim().is_empty() => Ok(Self::default()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                DefaultconfError::Store(format!("Failed to parse {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(DefaultconfError::Io(e)),
        }
    }

    /// Writes the store through a temporary file and a rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Runs `f` on the store under the lock file. The store is written only
    /// if `f` changed it, and the daemon is then signalled.
    pub fn update<T>(config: &DaemonConfig, f: impl FnOnce(&mut RegistrationStore) -> Result<T>) -> Result<T> {
        let lock_path = config.lock_path();
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        let _lock = Flock::lock(lock_file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            DefaultconfError::Store(format!("Failed to lock {}: {}", lock_path.display(), errno))
        })?;

        let mut store = Self::load(&config.state_path)?;
        let before = store.clone();
        let result = f(&mut store)?;
        if store != before {
            store.save(&config.state_path)?;
            debug!(path = %config.state_path.display(), "Registration store written");
            if let Err(e) = signal_daemon(&config.pid_path) {
                error!(error = %e, "Failed to signal daemon");
            }
        }
        Ok(result)
    }

    /// Replaces any gateway with the same (af, link, protocol); the new
    /// entry gets a version above every stored one.
    pub fn add(
        &mut self,
        af: AddressFamily,
        link: &str,
        protocol: ProtocolTag,
        addr: IpAddr,
        source: Option<IpAddr>,
    ) -> Result<&StoredGateway> {
        if !af.contains(&addr) || source.is_some_and(|s| !af.contains(&s)) {
            return Err(DefaultconfError::InvalidRegistration(format!(
                "{} address expected for {}",
                af, link
            )));
        }
        if link.is_empty() {
            return Err(DefaultconfError::InvalidRegistration("empty link name".to_string()));
        }

        let version = self.gateways.iter().map(|g| g.version).max().unwrap_or(0) + 1;
        self.remove(&Selector::new(Some(af), Some(link.to_string()), Some(protocol.clone())));
        self.gateways.push(StoredGateway {
            af,
            link: link.to_string(),
            protocol,
            addr,
            source,
            version,
            registered_at: Utc::now(),
        });
        self.gateways.sort_by_key(StoredGateway::key);
        let index = self
            .gateways
            .iter()
            .position(|g| g.version == version)
            .ok_or_else(|| DefaultconfError::Store("added gateway vanished".to_string()))?;
        Ok(&self.gateways[index])
    }

    /// Removes every gateway matching `selector`; returns how many.
    pub fn remove(&mut self, selector: &Selector) -> usize {
        let before = self.gateways.len();
        self.gateways.retain(|g| !selector.matches_fields(g.af, &g.link, &g.protocol));
        before - self.gateways.len()
    }

    pub fn disable(&mut self, selector: Selector) -> bool {
        self.disabled.insert(selector)
    }

    /// Removes every disabled selector that `selector` covers.
    pub fn enable(&mut self, selector: &Selector) -> usize {
        let before = self.disabled.len();
        self.disabled.retain(|d| !d.is_covered_by(selector));
        before - self.disabled.len()
    }

    pub fn is_disabled(&self, gateway: &StoredGateway) -> bool {
        self.disabled
            .iter()
            .any(|d| d.matches_fields(gateway.af, &gateway.link, &gateway.protocol))
    }

    /// Enabled gateways matching `selector`, best first under `policy`.
    pub fn get_defaults(&self, selector: &Selector, policy: &PriorityPolicy) -> Vec<&StoredGateway> {
        let mut matching: Vec<&StoredGateway> = self
            .gateways
            .iter()
            .filter(|g| selector.matches_fields(g.af, &g.link, &g.protocol))
            .filter(|g| !self.is_disabled(g))
            .collect();
        matching.sort_by(|a, b| policy.compare(&b.to_candidate(), &a.to_candidate()));
        matching
    }

    pub fn get_default(&self, selector: &Selector, policy: &PriorityPolicy) -> Option<&StoredGateway> {
        self.get_defaults(selector, policy).into_iter().next()
    }
}

/// Sends SIGUSR1 to the PID recorded in `pid_path`.
pub fn signal_daemon(pid_path: &Path) -> Result<()> {
    let content = fs::read_to_string(pid_path)?;
    let pid: i32 = content.trim().parse().map_err(|_| {
        DefaultconfError::Store(format!("Invalid pid in {}: {:?}", pid_path.display(), content.trim()))
    })?;
    kill(Pid::from_raw(pid), Signal::SIGUSR1).map_err(|e| {
        DefaultconfError::Store(format!("Failed to signal pid {}: {}", pid, e))
    })?;
    debug!(pid, "Signalled daemon");
    Ok(())
}

/// Counts from one store sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub registered: usize,
    pub updated: usize,
    pub withdrawn: usize,
    pub rejected: usize,
}

/// Mirrors the store's gateways into the engine through a [`Registrar`].
pub struct StoreSync<C> {
    registrar: Registrar<C>,
    applied: BTreeMap<CandidateKey, (RegistrationHandle, StoredGateway)>,
}

impl<C: RouteChannel> StoreSync<C> {
    pub fn new(registrar: Registrar<C>) -> Self {
        Self {
            registrar,
            applied: BTreeMap::new(),
        }
    }

    /// Registers new keys, updates changed ones and withdraws vanished ones.
    /// Changed entries are applied oldest first so their relative order
    /// survives into the engine's versions.
    pub fn apply(&mut self, store: &RegistrationStore) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();
        let wanted: BTreeMap<CandidateKey, &StoredGateway> =
            store.gateways.iter().map(|g| (g.key(), g)).collect();

        let vanished: Vec<CandidateKey> = self
            .applied
            .keys()
            .filter(|key| !wanted.contains_key(*key))
            .cloned()
            .collect();
        for key in vanished {
            if let Some((handle, _)) = self.applied.remove(&key) {
                match self.registrar.withdraw(handle) {
                    Ok(()) | Err(DefaultconfError::UnknownRegistration(_)) => summary.withdrawn += 1,
                    Err(e) => return Err(e),
                }
            }
        }

        let mut changed: Vec<&StoredGateway> = wanted
            .values()
            .filter(|g| {
                self.applied
                    .get(&g.key())
                    .is_none_or(|(_, prev)| !prev.same_registration(g))
            })
            .copied()
            .collect();
        changed.sort_by_key(|g| g.version);

        for gateway in changed {
            let key = gateway.key();
            let result = match self.applied.remove(&key) {
                Some((mut handle, _)) => self
                    .registrar
                    .update(&mut handle, gateway.addr, gateway.source)
                    .map(|()| (handle, true)),
                None => self
                    .registrar
                    .register(
                        gateway.protocol.clone(),
                        gateway.af,
                        &gateway.link,
                        gateway.addr,
                        gateway.source,
                    )
                    .map(|handle| (handle, false)),
            };
            match result {
                Ok((handle, updated)) => {
                    if updated {
                        summary.updated += 1;
                    } else {
                        summary.registered += 1;
                    }
                    self.applied.insert(key, (handle, gateway.clone()));
                }
                Err(DefaultconfError::InvalidRegistration(reason)) => {
                    warn!(key = %key, reason = %reason, "Skipping invalid stored gateway");
                    summary.rejected += 1;
                }
                Err(DefaultconfError::UnknownRegistration(_)) => {
                    // Withdrawn behind our back; register afresh next sync.
                    summary.rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }

        self.registrar
            .engine()
            .lock()
            .set_disabled(store.disabled.clone())?;

        info!(
            registered = summary.registered,
            updated = summary.updated,
            withdrawn = summary.withdrawn,
            rejected = summary.rejected,
            "Registration store applied"
        );
        Ok(summary)
    }
}
