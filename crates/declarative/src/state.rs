//! Loading desired and current state
//!
//! Both directions work key by key: a declaration that fails validation or
//! a lookup that fails against the external system becomes a per-key
//! [`ActionError`] and never stops the other keys from loading.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::adapter::ExternalResourceAdapter;
use crate::error::ErrorKind;
use crate::secret::{ResolvedSecrets, SecretResolver, resolve_auxiliary, resolve_primary};
use crate::types::{ActionError, DesiredState, ResourceDeclaration, ResourceKey, ResourceSpec};

/// Explicit allow-lists a declaration is checked against
///
/// A list that is not configured allows everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationPolicy {
    pub kinds: Option<BTreeSet<String>>,
    pub channels: Option<BTreeSet<String>>,
    pub members: Option<BTreeSet<String>>,
}

impl ValidationPolicy {
    /// Check one declaration
    ///
    /// Disabled declarations only need a valid key; their contents are
    /// never sent anywhere.
    pub fn validate(&self, decl: &ResourceDeclaration) -> Result<(), ActionError> {
        let key = decl.key();
        let invalid =
            |message: String| ActionError::for_key(&key, ErrorKind::PermanentValidation, message);

        if decl.kind.trim().is_empty() || decl.id.trim().is_empty() {
            return Err(invalid("kind and id must not be empty".to_string()));
        }

        if let Some(kinds) = &self.kinds
            && !kinds.contains(&decl.kind)
        {
            return Err(invalid(format!("kind '{}' is not allowed", decl.kind)));
        }

        if !decl.enabled {
            return Ok(());
        }

        if let Some(unknown) = first_outside(&decl.channels, self.channels.as_ref()) {
            return Err(invalid(format!("channel '{unknown}' is not in the allow-list")));
        }

        if let Some(unknown) = first_outside(&decl.members, self.members.as_ref()) {
            return Err(invalid(format!("member '{unknown}' is not in the allow-list")));
        }

        Ok(())
    }
}

fn first_outside<'a>(
    values: &'a BTreeSet<String>,
    allowed: Option<&BTreeSet<String>>,
) -> Option<&'a str> {
    let allowed = allowed?;
    values
        .iter()
        .find(|value| !allowed.contains(*value))
        .map(String::as_str)
}

/// A declaration after validation and secret resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredResource {
    pub key: ResourceKey,
    pub desired: DesiredState,
    pub secrets: ResolvedSecrets,
}

impl DesiredResource {
    /// Desired state without secrets, e.g. for undeclared resources being pruned
    pub fn new(key: ResourceKey, desired: DesiredState) -> Self {
        Self {
            key,
            desired,
            secrets: ResolvedSecrets::default(),
        }
    }
}

/// Load the desired state of one declaration
///
/// Fails for this key only: when the declaration is invalid or its primary
/// credential cannot be resolved. Missing auxiliary secrets are replaced by
/// a sentinel.
pub fn load_desired(
    decl: &ResourceDeclaration,
    policy: &ValidationPolicy,
    resolver: &dyn SecretResolver,
) -> Result<DesiredResource, ActionError> {
    policy.validate(decl)?;
    let key = decl.key();

    let auth = match &decl.auth {
        Some(reference) => Some(resolve_primary(resolver, &key, reference)?),
        None => None,
    };

    let auxiliary = decl
        .secrets
        .iter()
        .map(|(name, reference)| (name.clone(), resolve_auxiliary(resolver, reference)))
        .collect();

    Ok(DesiredResource {
        key,
        desired: decl.spec(),
        secrets: ResolvedSecrets { auth, auxiliary },
    })
}

/// Observed state of one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    pub key: ResourceKey,
    pub state: Option<ResourceSpec>,
    /// Set when the lookup failed; `state` is then `None`
    pub error: Option<ActionError>,
}

impl Observed {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Read the current state of one key from the external system
pub fn load_current(adapter: &dyn ExternalResourceAdapter, key: &ResourceKey) -> Observed {
    match adapter.get(key) {
        Ok(state) => Observed {
            key: key.clone(),
            state,
            error: None,
        },
        Err(e) => {
            log::warn!("Failed to read current state of {key}: {e}");
            Observed {
                key: key.clone(),
                state: None,
                error: Some(ActionError::for_key(
                    key,
                    ErrorKind::TransientExternal,
                    format!("lookup failed: {}", e.message),
                )),
            }
        }
    }
}

/// Read the current state of every key, continuing past failures
pub fn load_current_all<'a, I>(adapter: &dyn ExternalResourceAdapter, keys: I) -> Vec<Observed>
where
    I: IntoIterator<Item = &'a ResourceKey>,
{
    keys.into_iter()
        .map(|key| load_current(adapter, key))
        .collect()
}

/// Live resources of the declared kinds that no declaration mentions
///
/// `declared` must hold every declared key, including ones that were
/// rejected or disabled. Each orphan comes back with an absent desired
/// state so that diffing deletes it. A kind whose listing fails is reported
/// and skipped.
pub fn discover_orphans(
    adapter: &dyn ExternalResourceAdapter,
    declared: &BTreeSet<ResourceKey>,
) -> (Vec<DesiredResource>, Vec<ActionError>) {
    let kinds: BTreeSet<&str> = declared.iter().map(|key| key.kind.as_str()).collect();

    let mut orphans = Vec::new();
    let mut errors = Vec::new();

    for kind in kinds {
        match adapter.list(kind) {
            Ok(keys) => orphans.extend(
                keys.into_iter()
                    .filter(|key| !declared.contains(key))
                    .map(|key| DesiredResource::new(key, None)),
            ),
            Err(e) => {
                log::warn!("Failed to list live {kind} resources: {e}");
                errors.push(ActionError::for_key(
                    &ResourceKey::new(kind, "*"),
                    ErrorKind::TransientExternal,
                    format!("listing failed: {}", e.message),
                ));
            }
        }
    }

    (orphans, errors)
}
