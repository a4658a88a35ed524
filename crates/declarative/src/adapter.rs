//! Collaborator traits for the systems on either side of a reconciliation
//!
//! These traits let the engine run without depending on any particular
//! config source or external API client.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use crate::error::ErrorKind;
use crate::secret::ResolvedSecrets;
use crate::types::{ResourceDeclaration, ResourceKey, ResourceSpec};

/// Failure of a single adapter call
///
/// Adapter failures never abort a batch; the executor records them and
/// moves on to the next action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AdapterError {
    pub message: String,
    /// Whether repeating the call later may succeed
    pub retryable: bool,
}

impl AdapterError {
    /// A transient failure (network, rate limit, upstream outage)
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// The external system rejected the request itself
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        if self.retryable {
            ErrorKind::TransientExternal
        } else {
            ErrorKind::PermanentValidation
        }
    }
}

impl From<anyhow::Error> for AdapterError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// Supplier of declared configuration
///
/// Loading is a pure read. Failures propagate synchronously, before any
/// task is enqueued.
pub trait DesiredStateSource: Send + Sync {
    fn load(&self) -> anyhow::Result<Vec<ResourceDeclaration>>;
}

impl DesiredStateSource for Vec<ResourceDeclaration> {
    fn load(&self) -> anyhow::Result<Vec<ResourceDeclaration>> {
        Ok(self.clone())
    }
}

/// Client for one external system owning managed resources
///
/// Implement one adapter per system (chat usergroups, monitoring, alerting,
/// secret stores). Calls may block on the network.
pub trait ExternalResourceAdapter: Send + Sync {
    /// Read the live configuration of a resource, `None` if it does not exist
    fn get(&self, key: &ResourceKey) -> Result<Option<ResourceSpec>, AdapterError>;

    /// Keys of every live resource of a kind
    ///
    /// Only consulted when pruning undeclared resources. The default reports
    /// nothing, so adapters that cannot enumerate never prune.
    fn list(&self, _kind: &str) -> Result<Vec<ResourceKey>, AdapterError> {
        Ok(Vec::new())
    }

    /// Receive the credentials resolved for a resource before it is changed
    ///
    /// Called once per key, right before its actions are applied, and never
    /// during dry runs. A failure skips every action of that key. The
    /// default ignores the secrets.
    fn authenticate(
        &self,
        _key: &ResourceKey,
        _secrets: &ResolvedSecrets,
    ) -> Result<(), AdapterError> {
        Ok(())
    }

    fn create(&self, key: &ResourceKey, spec: &ResourceSpec) -> Result<(), AdapterError>;

    /// Replace membership; `add` and `remove` describe the same change as a delta
    fn update_members(
        &self,
        key: &ResourceKey,
        members: &BTreeSet<String>,
        add: &BTreeSet<String>,
        remove: &BTreeSet<String>,
    ) -> Result<(), AdapterError>;

    fn update_metadata(
        &self,
        key: &ResourceKey,
        channels: &BTreeSet<String>,
        description: Option<&str>,
    ) -> Result<(), AdapterError>;

    fn delete(&self, key: &ResourceKey) -> Result<(), AdapterError>;
}

/// Adapter holding live state in memory
///
/// Behaves like a well-mannered external system: every accepted call is
/// reflected by the next `get`.
#[derive(Debug, Default)]
pub struct InMemoryAdapter {
    resources: Mutex<BTreeMap<ResourceKey, ResourceSpec>>,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_resources(resources: BTreeMap<ResourceKey, ResourceSpec>) -> Self {
        Self {
            resources: Mutex::new(resources),
        }
    }

    /// Seed a live resource
    pub fn insert(&self, key: ResourceKey, spec: ResourceSpec) {
        self.lock().insert(key, spec);
    }

    /// Copy of every live resource
    /// Replace every live resource at once
    pub fn replace(&self, resources: BTreeMap<ResourceKey, ResourceSpec>) {
        *self.lock() = resources;
    }

    pub fn snapshot(&self) -> BTreeMap<ResourceKey, ResourceSpec> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ResourceKey, ResourceSpec>> {
        match self.resources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_existing<F>(&self, key: &ResourceKey, f: F) -> Result<(), AdapterError>
    where
        F: FnOnce(&mut ResourceSpec),
    {
        let mut resources = self.lock();
        let spec = resources
            .get_mut(key)
            .ok_or_else(|| AdapterError::permanent(format!("{key} does not exist")))?;
        f(spec);
        Ok(())
    }
}

impl ExternalResourceAdapter for InMemoryAdapter {
    fn get(&self, key: &ResourceKey) -> Result<Option<ResourceSpec>, AdapterError> {
        Ok(self.lock().get(key).cloned())
    }

    fn list(&self, kind: &str) -> Result<Vec<ResourceKey>, AdapterError> {
        Ok(self
            .lock()
            .keys()
            .filter(|key| key.kind == kind)
            .cloned()
            .collect())
    }

    fn create(&self, key: &ResourceKey, spec: &ResourceSpec) -> Result<(), AdapterError> {
        let mut resources = self.lock();
        if resources.contains_key(key) {
            return Err(AdapterError::permanent(format!("{key} already exists")));
        }
        resources.insert(key.clone(), spec.clone());
        Ok(())
    }

    fn update_members(
        &self,
        key: &ResourceKey,
        members: &BTreeSet<String>,
        _add: &BTreeSet<String>,
        _remove: &BTreeSet<String>,
    ) -> Result<(), AdapterError> {
        self.with_existing(key, |spec| spec.members = members.clone())
    }

    fn update_metadata(
        &self,
        key: &ResourceKey,
        channels: &BTreeSet<String>,
        description: Option<&str>,
    ) -> Result<(), AdapterError> {
        self.with_existing(key, |spec| {
            spec.channels = channels.clone();
            spec.description = description.map(str::to_string);
        })
    }

    fn delete(&self, key: &ResourceKey) -> Result<(), AdapterError> {
        self.lock()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| AdapterError::permanent(format!("{key} does not exist")))
    }
}
