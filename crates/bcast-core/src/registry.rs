//! Current identity/target set, swapped atomically on reload.
//!
//! Readers take an `Arc` snapshot and keep it for as long as they need; writers
//! build a new snapshot and swap it in. A running broadcast therefore never sees
//! a reload.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, RwLock},
};

use crate::{
    domain::Target,
    errors::Error,
    sender::{MessageSender, Sender},
    Result,
};

#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    senders: Vec<Arc<Sender>>,
    targets: BTreeMap<String, Target>,
}

impl RegistrySnapshot {
    pub fn new(senders: Vec<Arc<Sender>>, targets: Vec<Target>) -> Result<Self> {
        let mut seen = HashSet::new();
        for s in &senders {
            if !seen.insert(s.identity().name.clone()) {
                return Err(Error::Config(format!(
                    "duplicate identity name: {}",
                    s.identity().name
                )));
            }
        }

        let mut map = BTreeMap::new();
        for t in targets {
            if map.contains_key(&t.name) {
                return Err(Error::Config(format!("duplicate target name: {}", t.name)));
            }
            map.insert(t.name.clone(), t);
        }

        Ok(Self {
            senders,
            targets: map,
        })
    }

    pub fn senders(&self) -> &[Arc<Sender>] {
        &self.senders
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.targets.values()
    }

    pub fn sender(&self, name: &str) -> Result<Arc<Sender>> {
        self.senders
            .iter()
            .find(|s| s.identity().name == name)
            .cloned()
            .ok_or_else(|| Error::IdentityNotFound(name.to_string()))
    }

    /// Copy of the named target, fixed for the caller's lifetime.
    pub fn target(&self, name: &str) -> Result<Target> {
        self.targets
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TargetNotFound(name.to_string()))
    }

    /// Ordered sender list in the shape the broadcast engine consumes.
    pub fn dispatch_set(&self) -> Vec<Arc<dyn MessageSender>> {
        self.senders
            .iter()
            .map(|s| s.clone() as Arc<dyn MessageSender>)
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl Registry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current
            .read()
            .map(|g| g.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn list_identities(&self) -> Vec<Arc<Sender>> {
        self.snapshot().senders.clone()
    }

    pub fn list_targets(&self) -> Vec<Target> {
        self.snapshot().targets.values().cloned().collect()
    }

    /// Replace everything at once (file reload, import).
    pub fn bulk_replace(&self, senders: Vec<Arc<Sender>>, targets: Vec<Target>) -> Result<()> {
        let next = RegistrySnapshot::new(senders, targets)?;
        tracing::info!(
            identities = next.senders.len(),
            targets = next.targets.len(),
            "registry replaced"
        );
        self.swap(next);
        Ok(())
    }

    /// Insert or replace one identity, keeping its position if it already exists.
    pub fn upsert_identity(&self, sender: Arc<Sender>) {
        let _ = self.update(|snap| {
            let name = sender.identity().name.clone();
            match snap.senders.iter().position(|s| s.identity().name == name) {
                Some(idx) => snap.senders[idx] = sender,
                None => snap.senders.push(sender),
            }
            Ok(())
        });
    }

    pub fn remove_identity(&self, name: &str) -> Result<()> {
        self.update(|snap| {
            let before = snap.senders.len();
            snap.senders.retain(|s| s.identity().name != name);
            if snap.senders.len() == before {
                return Err(Error::IdentityNotFound(name.to_string()));
            }
            Ok(())
        })
    }

    pub fn upsert_target(&self, target: Target) {
        let _ = self.update(|snap| {
            snap.targets.insert(target.name.clone(), target);
            Ok(())
        });
    }

    pub fn remove_target(&self, name: &str) -> Result<()> {
        self.update(|snap| {
            snap.targets
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| Error::TargetNotFound(name.to_string()))
        })
    }

    /// Hot-swap one identity's client tag. Affects later requests of any
    /// snapshot that shares this sender.
    pub fn set_transport_tag(&self, name: &str, tag: &str) -> Result<()> {
        let sender = self.snapshot().sender(name)?;
        sender.set_transport_tag(tag);
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut RegistrySnapshot) -> Result<()>) -> Result<()> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut next = RegistrySnapshot {
            senders: guard.senders.clone(),
            targets: guard.targets.clone(),
        };
        f(&mut next)?;
        *guard = Arc::new(next);
        Ok(())
    }

    fn swap(&self, next: RegistrySnapshot) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(next);
    }
}
