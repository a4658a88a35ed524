//! Local live-state store
//!
//! Stands in for the external systems when converge runs without real API
//! clients: live resources are kept in memory and written back to
//! `live.toml` after every accepted change.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use declarative::{
    AdapterError, ExternalResourceAdapter, InMemoryAdapter, ResourceKey, ResourceSpec,
};

// ============================================================================
// File Format
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct LiveFile {
    #[serde(default)]
    resources: Vec<LiveResource>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LiveResource {
    kind: String,
    id: String,
    #[serde(default)]
    members: BTreeSet<String>,
    #[serde(default)]
    channels: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

impl LiveResource {
    fn new(key: &ResourceKey, spec: &ResourceSpec) -> Self {
        Self {
            kind: key.kind.clone(),
            id: key.id.clone(),
            members: spec.members.clone(),
            channels: spec.channels.clone(),
            description: spec.description.clone(),
        }
    }

    fn into_entry(self) -> (ResourceKey, ResourceSpec) {
        (
            ResourceKey::new(self.kind, self.id),
            ResourceSpec {
                members: self.members,
                channels: self.channels,
                description: self.description,
            },
        )
    }
}

// ============================================================================
// FileAdapter
// ============================================================================

/// Adapter persisting live resources to a TOML file
pub struct FileAdapter {
    path: PathBuf,
    live: InMemoryAdapter,
    write_lock: Mutex<()>,
}

impl FileAdapter {
    /// Open the store at `path`; a missing file means nothing is live yet
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let resources = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read live state: {}", path.display()))?;
            let file: LiveFile = toml::from_str(&content)
                .with_context(|| format!("Failed to parse live state: {}", path.display()))?;
            file.resources
                .into_iter()
                .map(LiveResource::into_entry)
                .collect()
        } else {
            log::debug!("Live state file does not exist, starting empty");
            BTreeMap::new()
        };

        log::debug!(
            "Loaded {} live resources from {}",
            resources.len(),
            path.display()
        );
        Ok(Self {
            path,
            live: InMemoryAdapter::from_resources(resources),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> BTreeMap<ResourceKey, ResourceSpec> {
        self.live.snapshot()
    }

    /// Apply a change to a copy, write it to disk, then make it live
    ///
    /// A change that cannot be saved is not visible to later reads.
    fn write<F>(&self, change: F) -> Result<(), AdapterError>
    where
        F: FnOnce(&InMemoryAdapter) -> Result<(), AdapterError>,
    {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let staged = InMemoryAdapter::from_resources(self.live.snapshot());
        change(&staged)?;

        let resources = staged.snapshot();
        self.save(&resources).map_err(AdapterError::from)?;
        self.live.replace(resources);
        Ok(())
    }

    fn save(&self, resources: &BTreeMap<ResourceKey, ResourceSpec>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        }

        let file = LiveFile {
            resources: resources
                .iter()
                .map(|(key, spec)| LiveResource::new(key, spec))
                .collect(),
        };
        let content = toml::to_string_pretty(&file).context("Failed to serialize live state")?;
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write live state: {}", self.path.display()))?;

        log::debug!("Saved live state to {}", self.path.display());
        Ok(())
    }
}

impl ExternalResourceAdapter for FileAdapter {
    fn get(&self, key: &ResourceKey) -> Result<Option<ResourceSpec>, AdapterError> {
        self.live.get(key)
    }

    fn list(&self, kind: &str) -> Result<Vec<ResourceKey>, AdapterError> {
        self.live.list(kind)
    }

    fn create(&self, key: &ResourceKey, spec: &ResourceSpec) -> Result<(), AdapterError> {
        self.write(|live| live.create(key, spec))
    }

    fn update_members(
        &self,
        key: &ResourceKey,
        members: &BTreeSet<String>,
        add: &BTreeSet<String>,
        remove: &BTreeSet<String>,
    ) -> Result<(), AdapterError> {
        self.write(|live| live.update_members(key, members, add, remove))
    }

    fn update_metadata(
        &self,
        key: &ResourceKey,
        channels: &BTreeSet<String>,
        description: Option<&str>,
    ) -> Result<(), AdapterError> {
        self.write(|live| live.update_metadata(key, channels, description))
    }

    fn delete(&self, key: &ResourceKey) -> Result<(), AdapterError> {
        self.write(|live| live.delete(key))
    }
}

// ============================================================================
// Tests
// ============================================================================
