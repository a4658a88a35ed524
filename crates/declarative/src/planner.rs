//! Reconciliation planning - turns declarations into a batch of desired state

use std::collections::BTreeSet;

use crate::adapter::DesiredStateSource;
use crate::error::{Error, Result};
use crate::secret::SecretResolver;
use crate::state::{DesiredResource, ValidationPolicy, load_desired};
use crate::types::{ActionError, ResourceDeclaration, ResourceKey};

/// Desired state for one reconciliation request
///
/// Keys that failed to load are kept as errors so they are reported with
/// the run instead of silently disappearing.
#[derive(Debug, Clone, Default)]
pub struct DesiredBatch {
    /// Loaded resources, ordered by key
    pub resources: Vec<DesiredResource>,
    /// Declarations rejected during loading
    pub errors: Vec<ActionError>,
    /// Every declared key, loaded or not, regardless of target
    pub declared: BTreeSet<ResourceKey>,
    /// Target the batch was narrowed to
    pub target: Option<String>,
}

impl DesiredBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a batch from declarations
    ///
    /// Declaring the same key twice makes the whole request malformed and
    /// is returned synchronously. Anything else that goes wrong for a key
    /// only affects that key.
    pub fn load(
        declarations: &[ResourceDeclaration],
        policy: &ValidationPolicy,
        resolver: &dyn SecretResolver,
    ) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for decl in declarations {
            let key = decl.key();
            if !seen.insert(key.clone()) {
                return Err(Error::DuplicateKey(key));
            }
        }

        let mut batch = Self {
            declared: seen,
            ..Self::new()
        };
        for decl in declarations {
            match load_desired(decl, policy, resolver) {
                Ok(resource) => batch.resources.push(resource),
                Err(e) => {
                    log::warn!("Skipping {}: {}", e.key, e.message);
                    batch.errors.push(e);
                }
            }
        }
        batch.resources.sort_by(|a, b| a.key.cmp(&b.key));

        log::debug!(
            "Loaded {} resources ({} rejected)",
            batch.resources.len(),
            batch.errors.len()
        );
        Ok(batch)
    }

    /// Load a batch from a desired-state source
    pub fn from_source(
        source: &dyn DesiredStateSource,
        policy: &ValidationPolicy,
        resolver: &dyn SecretResolver,
    ) -> Result<Self> {
        let declarations = source
            .load()
            .map_err(|e| Error::InvalidRequest(format!("failed to load desired state: {e:#}")))?;
        Self::load(&declarations, policy, resolver)
    }

    /// Add a resource, keeping key order
    pub fn push(&mut self, resource: DesiredResource) {
        self.declared.insert(resource.key.clone());
        let index = self
            .resources
            .partition_point(|existing| existing.key < resource.key);
        self.resources.insert(index, resource);
    }

    pub fn keys(&self) -> impl Iterator<Item = &ResourceKey> {
        self.resources.iter().map(|r| &r.key)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Keep only resources matching a target pattern
    ///
    /// Target format: "kind" or "kind.id-substring". Declared keys outside
    /// the target are still remembered so pruning never mistakes them for
    /// undeclared resources.
    pub fn filter_by_target(self, target: Option<&str>) -> Self {
        let Some(target) = target else {
            return self;
        };
        let (kind, name) = parse_target(target);
        let keep = |key: &ResourceKey| matches_filter(key, kind.as_deref(), name.as_deref());
        Self {
            resources: self.resources.into_iter().filter(|r| keep(&r.key)).collect(),
            errors: self.errors.into_iter().filter(|e| keep(&e.key)).collect(),
            declared: self.declared,
            target: Some(target.to_string()),
        }
    }

    /// Whether a key falls inside the target this batch was narrowed to
    pub fn in_scope(&self, key: &ResourceKey) -> bool {
        match &self.target {
            None => true,
            Some(target) => {
                let (kind, name) = parse_target(target);
                matches_filter(key, kind.as_deref(), name.as_deref())
            }
        }
    }
}

/// Parse a target string like "kind.name" into (kind, name)
///
/// Only the first dot separates; ids may contain dots themselves.
pub fn parse_target(target: &str) -> (Option<String>, Option<String>) {
    match target.split_once('.') {
        None => (Some(target.to_string()), None),
        Some((kind, name)) if !kind.is_empty() => (Some(kind.to_string()), Some(name.to_string())),
        Some(_) => (None, Some(target.trim_start_matches('.').to_string())),
    }
}

/// Check if a key matches the filter criteria
pub fn matches_filter(key: &ResourceKey, kind: Option<&str>, name: Option<&str>) -> bool {
    if let Some(k) = kind
        && key.kind != k
    {
        return false;
    }

    if let Some(n) = name
        && !key.id.contains(n)
    {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::secret::NoSecrets;

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("snitch"), (Some("snitch".to_string()), None));
        assert_eq!(
            parse_target("usergroup.acme"),
            (Some("usergroup".to_string()), Some("acme".to_string()))
        );
        assert_eq!(
            parse_target("alert_rule.cpu.high"),
            (Some("alert_rule".to_string()), Some("cpu.high".to_string()))
        );
        assert_eq!(parse_target(".acme"), (None, Some("acme".to_string())));
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let decls = vec![
            ResourceDeclaration::new("snitch", "a"),
            ResourceDeclaration::new("snitch", "a"),
        ];
        let err = DesiredBatch::load(&decls, &ValidationPolicy::default(), &NoSecrets).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));
    }

    #[test]
    fn test_invalid_key_does_not_block_others() {
        let decls = vec![
            ResourceDeclaration::new("snitch", "b"),
            ResourceDeclaration::new("snitch", "a").with_auth("env:MISSING"),
            ResourceDeclaration::new("snitch", "c"),
        ];
        let batch = DesiredBatch::load(&decls, &ValidationPolicy::default(), &NoSecrets).unwrap();

        let ids: Vec<_> = batch.keys().map(|k| k.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(batch.errors.len(), 1);
        assert_eq!(batch.errors[0].kind, ErrorKind::SecretResolution);
    }

    #[test]
    fn test_filter_by_target() {
        let decls = vec![
            ResourceDeclaration::new("snitch", "cluster-a"),
            ResourceDeclaration::new("usergroup", "acme/oncall"),
            ResourceDeclaration::new("usergroup", "acme/sre"),
        ];
        let batch = DesiredBatch::load(&decls, &ValidationPolicy::default(), &NoSecrets).unwrap();

        let filtered = batch.clone().filter_by_target(Some("usergroup.sre"));
        assert_eq!(filtered.len(), 1);

        let filtered = batch.filter_by_target(Some("usergroup"));
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn test_filter_remembers_every_declared_key() {
        let decls = vec![
            ResourceDeclaration::new("usergroup", "acme/oncall"),
            ResourceDeclaration::new("usergroup", "acme/sre"),
            ResourceDeclaration::new("usergroup", "acme/locked").with_auth("vault:missing"),
        ];
        let batch = DesiredBatch::load(&decls, &ValidationPolicy::default(), &NoSecrets)
            .unwrap()
            .filter_by_target(Some("usergroup.sre"));

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.declared.len(), 3);
        assert!(batch.in_scope(&ResourceKey::new("usergroup", "acme/sre")));
        assert!(!batch.in_scope(&ResourceKey::new("usergroup", "acme/oncall")));
        assert!(!batch.in_scope(&ResourceKey::new("snitch", "sre")));
    }

    #[test]
    fn test_source_failure_propagates() {
        struct Broken;
        impl DesiredStateSource for Broken {
            fn load(&self) -> anyhow::Result<Vec<ResourceDeclaration>> {
                anyhow::bail!("config service unavailable")
            }
        }

        let err =
            DesiredBatch::from_source(&Broken, &ValidationPolicy::default(), &NoSecrets).unwrap_err();
        assert!(err.to_string().contains("config service unavailable"));
    }

    #[test]
    fn test_push_keeps_order() {
        let mut batch = DesiredBatch::new();
        batch.push(DesiredResource::new(ResourceKey::new("snitch", "b"), None));
        batch.push(DesiredResource::new(ResourceKey::new("snitch", "a"), None));
        let ids: Vec<_> = batch.keys().map(|k| k.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
