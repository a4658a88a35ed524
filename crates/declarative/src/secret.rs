//! Secret references and resolution
//!
//! Lookups return `Option` so absence is an ordinary value. Whether an
//! absent secret is fatal depends on its use: a missing primary credential
//! stops reconciliation of that one resource, a missing auxiliary value is
//! replaced by [`SecretValue::NotFound`] and the run continues.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ErrorKind;
use crate::types::{ActionError, ResourceKey};

/// Opaque reference to a secret, e.g. `env:SLACK_TOKEN` or `vault:team/token`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretRef(String);

impl SecretRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split `scheme:path`; references without a scheme have none
    pub fn scheme(&self) -> Option<(&str, &str)> {
        self.0.split_once(':')
    }
}

impl From<&str> for SecretRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SecretRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves secret references to plaintext
pub trait SecretResolver: Send + Sync {
    /// Look up a secret; `None` when it does not exist or cannot be read
    fn resolve(&self, reference: &SecretRef) -> Option<String>;
}

/// Resolver that knows no secrets
pub struct NoSecrets;

impl SecretResolver for NoSecrets {
    fn resolve(&self, _reference: &SecretRef) -> Option<String> {
        None
    }
}

/// Resolver backed by a fixed table keyed by the full reference string
#[derive(Default)]
pub struct StaticSecrets {
    values: BTreeMap<String, String>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reference: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(reference.into(), value.into());
        self
    }
}

impl SecretResolver for StaticSecrets {
    fn resolve(&self, reference: &SecretRef) -> Option<String> {
        self.values.get(reference.as_str()).cloned()
    }
}

/// An auxiliary secret after resolution
#[derive(Clone, PartialEq, Eq)]
pub enum SecretValue {
    Plain(String),
    /// Sentinel substituted when the secret could not be resolved
    NotFound,
}

impl SecretValue {
    pub fn as_plain(&self) -> Option<&str> {
        match self {
            SecretValue::Plain(value) => Some(value),
            SecretValue::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, SecretValue::Plain(_))
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretValue::Plain(_) => f.write_str("Plain(<redacted>)"),
            SecretValue::NotFound => f.write_str("NotFound"),
        }
    }
}

/// Secrets resolved for one resource
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ResolvedSecrets {
    pub auth: Option<String>,
    pub auxiliary: BTreeMap<String, SecretValue>,
}

impl fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field("auth", &self.auth.as_ref().map(|_| "<redacted>"))
            .field("auxiliary", &self.auxiliary)
            .finish()
    }
}

/// Resolve an auxiliary secret, substituting the sentinel on failure
pub fn resolve_auxiliary(resolver: &dyn SecretResolver, reference: &SecretRef) -> SecretValue {
    match resolver.resolve(reference) {
        Some(value) => SecretValue::Plain(value),
        None => {
            log::warn!("Secret {reference} not found, continuing without it");
            SecretValue::NotFound
        }
    }
}

/// Resolve the primary credential of a resource
///
/// Failure is fatal for `key` only and comes back as a per-key error.
pub fn resolve_primary(
    resolver: &dyn SecretResolver,
    key: &ResourceKey,
    reference: &SecretRef,
) -> Result<String, ActionError> {
    resolver.resolve(reference).ok_or_else(|| {
        ActionError::for_key(
            key,
            ErrorKind::SecretResolution,
            format!("primary credential {reference} could not be resolved"),
        )
    })
}
