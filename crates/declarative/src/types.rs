//! Core types for declarative reconciliation

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::ErrorKind;
use crate::secret::SecretRef;

/// Identity of a managed resource within one reconciliation domain
///
/// `kind` names the domain (e.g. "usergroup", "snitch", "alert_rule") and
/// `id` is the composite path inside it (e.g. "workspace/handle").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: String,
    pub id: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Comparable configuration of a resource
///
/// Used for both the desired and the observed side. Sets are ordered so
/// that diffs and serialized output are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSpec {
    pub members: BTreeSet<String>,
    pub channels: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ResourceSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.members = members.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Target configuration for a key; `None` means absent or disabled
pub type DesiredState = Option<ResourceSpec>;

/// Observed configuration for a key; `None` means the resource does not exist
pub type CurrentState = Option<ResourceSpec>;

/// A resource as declared in the config source
///
/// Secret references are resolved while loading; `auth` is the credential
/// the owning system needs to reconcile this resource at all, `secrets`
/// are auxiliary values (webhook tokens and the like).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub members: BTreeSet<String>,
    #[serde(default)]
    pub channels: BTreeSet<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub auth: Option<SecretRef>,
    #[serde(default)]
    pub secrets: BTreeMap<String, SecretRef>,
}

fn default_enabled() -> bool {
    true
}

impl ResourceDeclaration {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            members: BTreeSet::new(),
            channels: BTreeSet::new(),
            description: None,
            enabled: true,
            auth: None,
            secrets: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.kind, &self.id)
    }

    /// The declared configuration, or `None` when the declaration is disabled
    pub fn spec(&self) -> DesiredState {
        if !self.enabled {
            return None;
        }
        Some(ResourceSpec {
            members: self.members.clone(),
            channels: self.channels.clone(),
            description: self.description.clone(),
        })
    }

    pub fn with_spec(mut self, spec: ResourceSpec) -> Self {
        self.members = spec.members;
        self.channels = spec.channels;
        self.description = spec.description;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_auth(mut self, reference: impl Into<SecretRef>) -> Self {
        self.auth = Some(reference.into());
        self
    }

    pub fn with_secret(mut self, name: impl Into<String>, reference: impl Into<SecretRef>) -> Self {
        self.secrets.insert(name.into(), reference.into());
        self
    }
}

/// Discriminant of an [`Action`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Create,
    UpdateMembers,
    UpdateMetadata,
    Delete,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionType::Create => "create",
            ActionType::UpdateMembers => "update_members",
            ActionType::UpdateMetadata => "update_metadata",
            ActionType::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A typed unit of change bound to exactly one resource
///
/// Serialized with an explicit `action_type` tag so decoded actions are
/// matched exhaustively instead of being sniffed by shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum Action {
    /// Resource is declared but does not exist
    Create { key: ResourceKey, spec: ResourceSpec },
    /// Membership differs; `members` is the full desired set
    UpdateMembers {
        key: ResourceKey,
        add: BTreeSet<String>,
        remove: BTreeSet<String>,
        members: BTreeSet<String>,
    },
    /// Channels or description differ
    UpdateMetadata {
        key: ResourceKey,
        channels: BTreeSet<String>,
        description: Option<String>,
    },
    /// Resource exists but is no longer declared
    Delete { key: ResourceKey },
}

impl Action {
    pub fn key(&self) -> &ResourceKey {
        match self {
            Action::Create { key, .. }
            | Action::UpdateMembers { key, .. }
            | Action::UpdateMetadata { key, .. }
            | Action::Delete { key } => key,
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            Action::Create { .. } => ActionType::Create,
            Action::UpdateMembers { .. } => ActionType::UpdateMembers,
            Action::UpdateMetadata { .. } => ActionType::UpdateMetadata,
            Action::Delete { .. } => ActionType::Delete,
        }
    }

    /// Human-readable one-line description
    pub fn description(&self) -> String {
        match self {
            Action::Create { key, spec } => format!(
                "create {key} ({} members, {} channels)",
                spec.members.len(),
                spec.channels.len()
            ),
            Action::UpdateMembers {
                key, add, remove, ..
            } => format!("update members of {key} (+{} -{})", add.len(), remove.len()),
            Action::UpdateMetadata { key, .. } => format!("update metadata of {key}"),
            Action::Delete { key } => format!("delete {key}"),
        }
    }
}

/// Structured error record collected during a run
///
/// `action_type` is `None` for per-key failures that happened before any
/// action was attempted (lookup, validation, secret resolution).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    pub key: ResourceKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<ActionType>,
    pub kind: ErrorKind,
    pub message: String,
}

impl ActionError {
    pub fn for_action(action: &Action, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            key: action.key().clone(),
            action_type: Some(action.action_type()),
            kind,
            message: message.into(),
        }
    }

    pub fn for_key(key: &ResourceKey, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            key: key.clone(),
            action_type: None,
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.action_type {
            Some(action_type) => write!(f, "{} [{}]: {}", self.key, action_type, self.message),
            None => write!(f, "{}: {}", self.key, self.message),
        }
    }
}

/// Lifecycle state of a task; only `Pending` is non-terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated outcome of applying a batch of actions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub applied_count: usize,
    pub errors: Vec<ActionError>,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Merge another result into this one
    pub fn merge(&mut self, other: BatchResult) {
        self.applied_count += other.applied_count;
        self.errors.extend(other.errors);
    }

    pub fn push_error(&mut self, error: ActionError) {
        self.errors.push(error);
    }

    /// Terminal status under the caller's partial-failure policy
    ///
    /// With `fail_on_partial_error` any collected error fails the run;
    /// otherwise the run succeeds and reports its errors alongside.
    pub fn status(&self, fail_on_partial_error: bool) -> TaskStatus {
        if fail_on_partial_error && !self.errors.is_empty() {
            TaskStatus::Failed
        } else {
            TaskStatus::Success
        }
    }
}

/// Options for reconciliation runs
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Compute and report actions without applying them
    pub dry_run: bool,
    /// Worker threads for queued tasks
    pub jobs: usize,
    /// Whether any collected error marks a run as failed
    pub fail_on_partial_error: bool,
    /// Sole member sent to systems that reject empty membership lists
    pub empty_members_placeholder: Option<String>,
    /// Delete live resources of a declared kind that are not declared at all
    pub prune: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: true,
            jobs: 4,
            fail_on_partial_error: true,
            empty_members_placeholder: None,
            prune: false,
        }
    }
}
