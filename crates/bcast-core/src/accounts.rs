//! Account file loading and hot reload.
//!
//! Two formats are accepted. `.yaml`/`.yml` files:
//!
//! ```yaml
//! accounts:
//!   - name: alice
//!     token: "..."
//!     user_agent: "Mozilla/5.0 ..."   # optional
//! targets:
//!   general: 123456789
//! ```
//!
//! Anything else is read as one `name:token[:user_agent]` per line, with
//! `@target <name> <destination>` lines for targets and `#` comments.

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{Identity, Target},
    errors::Error,
    registry::{Registry, RegistrySnapshot},
    retry::RetryPolicy,
    sender::{Sender, Transport},
    Result,
};

#[derive(Debug, Deserialize)]
struct AccountFile {
    #[serde(default)]
    accounts: Vec<AccountEntry>,
    #[serde(default)]
    targets: BTreeMap<String, Scalar>,
}

#[derive(Debug, Deserialize)]
struct AccountEntry {
    name: String,
    token: String,
    #[serde(default)]
    user_agent: Option<String>,
}

// Channel ids are usually written as bare numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(u64),
    Str(String),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Int(n) => n.to_string(),
            Scalar::Str(s) => s,
        }
    }
}

/// Parsed, validated content of an account file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountSet {
    pub identities: Vec<Identity>,
    pub targets: Vec<Target>,
}

impl AccountSet {
    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for id in &self.identities {
            if id.name.trim().is_empty() {
                return Err(Error::Config("account with empty name".to_string()));
            }
            if id.credential.expose().trim().is_empty() {
                return Err(Error::Config(format!("account {} has no token", id.name)));
            }
            if !names.insert(id.name.as_str()) {
                return Err(Error::Config(format!("duplicate account name: {}", id.name)));
            }
        }
        let mut targets = HashSet::new();
        for t in &self.targets {
            if t.destination.trim().is_empty() {
                return Err(Error::Config(format!("target {} has no destination", t.name)));
            }
            if !targets.insert(t.name.as_str()) {
                return Err(Error::Config(format!("duplicate target name: {}", t.name)));
            }
        }
        Ok(())
    }

    /// One sender per identity, sharing `transport`.
    ///
    /// Identities the file gives no user agent keep the tag their sender in
    /// `previous` had, so reloads preserve hot swaps and generated agents.
    pub fn build_senders(
        &self,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        previous: &RegistrySnapshot,
    ) -> Vec<Arc<Sender>> {
        self.identities
            .iter()
            .cloned()
            .map(|id| {
                let inherited = match id.transport_tag {
                    None => previous.sender(&id.name).ok().map(|old| old.transport_tag()),
                    Some(_) => None,
                };
                let id = match inherited {
                    Some(tag) => id.with_transport_tag(tag),
                    None => id,
                };
                Arc::new(Sender::new(id, transport.clone(), retry))
            })
            .collect()
    }
}

pub fn parse_yaml(input: &str) -> Result<AccountSet> {
    if input.trim().is_empty() {
        return Ok(AccountSet::default());
    }
    let file: AccountFile = serde_yaml::from_str(input)?;

    let identities = file
        .accounts
        .into_iter()
        .map(|a| {
            let id = Identity::new(a.name.trim(), a.token.trim());
            match a.user_agent.filter(|ua| !ua.trim().is_empty()) {
                Some(ua) => id.with_transport_tag(ua.trim()),
                None => id,
            }
        })
        .collect();
    let targets = file
        .targets
        .into_iter()
        .map(|(name, dest)| Target::new(name.trim(), dest.into_string().trim()))
        .collect();

    let set = AccountSet {
        identities,
        targets,
    };
    set.validate()?;
    Ok(set)
}

pub fn parse_lines(input: &str) -> Result<AccountSet> {
    let mut set = AccountSet::default();

    for (idx, raw) in input.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix("@target") {
            let mut parts = rest.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(name), Some(dest)) => set.targets.push(Target::new(name, dest)),
                _ => {
                    return Err(Error::Config(format!(
                        "line {}: expected `@target <name> <destination>`",
                        idx + 1
                    )))
                }
            }
            continue;
        }

        let mut parts = line.splitn(3, ':');
        let name = parts.next().unwrap_or_default().trim();
        let token = parts.next().unwrap_or_default().trim();
        if name.is_empty() || token.is_empty() {
            return Err(Error::Config(format!(
                "line {}: expected `name:token[:user_agent]`",
                idx + 1
            )));
        }
        let mut id = Identity::new(name, token);
        if let Some(ua) = parts.next().map(str::trim).filter(|s| !s.is_empty()) {
            id = id.with_transport_tag(ua);
        }
        set.identities.push(id);
    }

    set.validate()?;
    Ok(set)
}

pub fn load_accounts(path: &Path) -> Result<AccountSet> {
    let content = fs::read_to_string(path)?;
    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);
    if is_yaml {
        parse_yaml(&content)
    } else {
        parse_lines(&content)
    }
}

/// Load `path` and swap the result into `registry`. Returns the identity count.
/// On error the registry is left untouched.
pub fn reload_registry(
    registry: &Registry,
    path: &Path,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
) -> Result<usize> {
    let set = load_accounts(path)?;
    let senders = set.build_senders(transport, retry, &registry.snapshot());
    let count = senders.len();
    registry.bulk_replace(senders, set.targets)?;
    Ok(count)
}

/// Polls the account file mtime and reloads the registry when it changes.
pub struct AccountWatcher {
    path: PathBuf,
    poll: Duration,
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    last_modified: Option<SystemTime>,
}

impl AccountWatcher {
    pub fn new(
        path: impl Into<PathBuf>,
        poll: Duration,
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
    ) -> Self {
        let path = path.into();
        let last_modified = modified(&path);
        Self {
            path,
            poll,
            registry,
            transport,
            retry,
            last_modified,
        }
    }

    /// One poll step. `true` when a reload was applied.
    pub fn check(&mut self) -> bool {
        let Some(now) = modified(&self.path) else {
            return false;
        };
        match self.last_modified {
            Some(prev) if now <= prev => return false,
            _ => self.last_modified = Some(now),
        }

        tracing::info!(path = %self.path.display(), "account file changed, reloading");
        match reload_registry(&self.registry, &self.path, self.transport.clone(), self.retry) {
            Ok(count) => {
                tracing::info!(identities = count, "accounts reloaded");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "account reload failed, keeping previous set");
                false
            }
        }
    }

    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.poll.max(Duration::from_millis(10)));
            tracing::info!(path = %self.path.display(), "account watcher started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        self.check();
                    }
                }
            }
            tracing::debug!("account watcher stopped");
        })
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
