//! converge.toml loading
//!
//! ```toml
//! [settings]
//! jobs = 4
//! fail_on_partial_error = true
//! empty_members_placeholder = "placeholder-bot"
//!
//! [policy]
//! kinds = ["usergroup", "snitch"]
//!
//! [secrets]
//! oncall-token = "xoxb-..."
//!
//! [[resources]]
//! kind = "usergroup"
//! id = "acme/oncall"
//! members = ["alice", "bob"]
//! auth = "config:oncall-token"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use declarative::{
    DesiredBatch, DesiredStateSource, ExecuteOptions, ResourceDeclaration, SecretRef,
    SecretResolver, ValidationPolicy,
};

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Worker threads for submitted tasks
    pub jobs: usize,
    pub fail_on_partial_error: bool,
    /// Sole member sent when a group would otherwise be emptied
    pub empty_members_placeholder: Option<String>,
    /// Delete live resources of declared kinds that are not declared
    pub prune: bool,
    /// How often `submit --wait` refreshes its status line
    pub poll_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            jobs: 4,
            fail_on_partial_error: true,
            empty_members_placeholder: None,
            prune: false,
            poll_interval_ms: 500,
        }
    }
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergeConfig {
    pub settings: Settings,
    pub policy: ValidationPolicy,
    /// Inline secret values, referenced as `config:NAME`
    pub secrets: BTreeMap<String, String>,
    pub resources: Vec<ResourceDeclaration>,
}

impl ConvergeConfig {
    /// Load and parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid config format in {}", path.display()))?;
        log::debug!(
            "Loaded {} resource declarations from {}",
            config.resources.len(),
            path.display()
        );
        Ok(config)
    }

    /// Execution options for one run
    pub fn execute_options(&self, dry_run: bool) -> ExecuteOptions {
        ExecuteOptions {
            dry_run,
            jobs: self.settings.jobs.max(1),
            fail_on_partial_error: self.settings.fail_on_partial_error,
            empty_members_placeholder: self.settings.empty_members_placeholder.clone(),
            prune: self.settings.prune,
        }
    }

    pub fn resolver(&self) -> EnvSecretResolver {
        EnvSecretResolver::new(self.secrets.clone())
    }

    /// Load the declarations into a batch, keeping only those matching `target`
    pub fn batch(&self, target: Option<&str>) -> Result<DesiredBatch> {
        let batch = DesiredBatch::load(&self.resources, &self.policy, &self.resolver())
            .context("Invalid resource declarations")?;
        Ok(batch.filter_by_target(target))
    }
}

/// Declarations read from a config file on every load
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DesiredStateSource for FileSource {
    fn load(&self) -> Result<Vec<ResourceDeclaration>> {
        Ok(ConvergeConfig::load(&self.path)?.resources)
    }
}

// ============================================================================
// Secrets
// ============================================================================

/// Resolves `env:NAME` from the environment and `config:NAME` from `[secrets]`
///
/// Any other scheme is unknown and resolves to nothing.
pub struct EnvSecretResolver {
    inline: BTreeMap<String, String>,
}

impl EnvSecretResolver {
    pub fn new(inline: BTreeMap<String, String>) -> Self {
        Self { inline }
    }
}

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, reference: &SecretRef) -> Option<String> {
        match reference.scheme() {
            Some(("env", name)) => std::env::var(name).ok(),
            Some(("config", name)) => self.inline.get(name).cloned(),
            _ => {
                log::debug!("No resolver for secret reference {reference}");
                None
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
