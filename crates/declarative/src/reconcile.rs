//! Reconciliation of a batch: fetch current state, diff, apply
//!
//! Keys are processed one after another in key order. Every failure is
//! collected into the report; nothing here returns early because one key
//! went wrong.

use serde::{Deserialize, Serialize};

use crate::adapter::ExternalResourceAdapter;
use crate::context::{ApplyContext, ProgressCallback};
use crate::diff::{DiffSummary, compute_diff};
use crate::executor::apply;
use crate::locks::KeyLocks;
use crate::planner::DesiredBatch;
use crate::state::{DesiredResource, discover_orphans, load_current};
use crate::types::{Action, ActionError, BatchResult, ExecuteOptions, ResourceSpec, TaskStatus};

/// Outcome of reconciling one or more keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Every action computed, in the order it was applied
    pub actions: Vec<Action>,
    pub result: BatchResult,
}

impl ReconcileReport {
    pub fn merge(&mut self, other: ReconcileReport) {
        self.actions.extend(other.actions);
        self.result.merge(other.result);
    }

    pub fn summary(&self) -> DiffSummary {
        DiffSummary::from_actions(&self.actions)
    }

    pub fn errors(&self) -> &[ActionError] {
        &self.result.errors
    }

    pub fn status(&self, fail_on_partial_error: bool) -> TaskStatus {
        self.result.status(fail_on_partial_error)
    }

    fn failed(actions: Vec<Action>, error: ActionError) -> Self {
        Self {
            actions,
            result: BatchResult {
                applied_count: 0,
                errors: vec![error],
            },
        }
    }
}

/// Reconcile a single resource
///
/// A failed lookup is reported and the key is left alone: diffing against
/// a state that could not be read would turn a transient error into a
/// spurious create.
pub fn reconcile_key<P>(
    resource: &DesiredResource,
    adapter: &dyn ExternalResourceAdapter,
    opts: &ExecuteOptions,
    progress: &mut P,
) -> ReconcileReport
where
    P: ProgressCallback + ?Sized,
{
    let observed = load_current(adapter, &resource.key);
    if let Some(error) = observed.error {
        return ReconcileReport::failed(Vec::new(), error);
    }

    let placeholder = opts.empty_members_placeholder.as_deref();
    let mut stripped = false;
    let current = observed.state.map(|state| {
        let (state, was_stripped) = strip_placeholder(state, resource.desired.as_ref(), placeholder);
        stripped = was_stripped;
        state
    });

    let mut actions = compute_diff(&resource.key, current.as_ref(), resource.desired.as_ref());
    if actions.is_empty() {
        log::debug!("{} is up to date", resource.key);
        return ReconcileReport::default();
    }
    if stripped && let Some(placeholder) = placeholder {
        restore_placeholder(&mut actions, placeholder);
    }

    if !opts.dry_run
        && let Err(e) = adapter.authenticate(&resource.key, &resource.secrets)
    {
        log::warn!("Skipping {}: authentication failed: {e}", resource.key);
        let error = ActionError::for_key(
            &resource.key,
            e.kind(),
            format!("authentication failed: {}", e.message),
        );
        return ReconcileReport::failed(actions, error);
    }

    let ctx = ApplyContext::from_options(opts, adapter);
    let result = apply(&actions, &ctx, progress);
    ReconcileReport { actions, result }
}

/// Hide a placeholder member written by an earlier run
///
/// A live group whose only member is the placeholder is what an empty
/// desired group looks like after apply, so it is diffed as empty. Returns
/// the state to diff and whether the placeholder was hidden.
fn strip_placeholder(
    mut current: ResourceSpec,
    desired: Option<&ResourceSpec>,
    placeholder: Option<&str>,
) -> (ResourceSpec, bool) {
    let Some(placeholder) = placeholder else {
        return (current, false);
    };
    let declared = desired.is_some_and(|d| d.members.contains(placeholder));
    let only_placeholder = current.members.len() == 1 && current.members.contains(placeholder);
    if declared || !only_placeholder {
        return (current, false);
    }
    current.members.clear();
    (current, true)
}

/// Report the hidden placeholder as removed once real members replace it
fn restore_placeholder(actions: &mut [Action], placeholder: &str) {
    for action in actions {
        if let Action::UpdateMembers {
            members, remove, ..
        } = action
            && !members.is_empty()
        {
            remove.insert(placeholder.to_string());
        }
    }
}

/// Reconcile a whole batch on the calling thread
///
/// Every action is attempted regardless of earlier failures; callers
/// decide at the end what the collected errors mean.
pub fn reconcile_sync<P>(
    batch: &DesiredBatch,
    adapter: &dyn ExternalResourceAdapter,
    opts: &ExecuteOptions,
    progress: &mut P,
) -> ReconcileReport
where
    P: ProgressCallback + ?Sized,
{
    reconcile_batch(batch, adapter, opts, progress, None)
}

/// Reconcile a batch, holding the per-key lock of each key while it is worked on
pub(crate) fn reconcile_batch<P>(
    batch: &DesiredBatch,
    adapter: &dyn ExternalResourceAdapter,
    opts: &ExecuteOptions,
    progress: &mut P,
    locks: Option<&KeyLocks>,
) -> ReconcileReport
where
    P: ProgressCallback + ?Sized,
{
    let mut report = ReconcileReport::default();
    report.result.errors.extend(batch.errors.iter().cloned());

    let mut resources = batch.resources.clone();
    if opts.prune {
        let (orphans, errors) = discover_orphans(adapter, &batch.declared);
        let orphans: Vec<_> = orphans
            .into_iter()
            .filter(|orphan| batch.in_scope(&orphan.key))
            .collect();
        if !orphans.is_empty() {
            log::info!("Found {} undeclared resources to prune", orphans.len());
        }
        resources.extend(orphans);
        resources.sort_by(|a, b| a.key.cmp(&b.key));
        report.result.errors.extend(errors);
    }

    for resource in &resources {
        let key_report = match locks {
            Some(locks) => locks.with_key(&resource.key, || {
                reconcile_key(resource, adapter, opts, progress)
            }),
            None => reconcile_key(resource, adapter, opts, progress),
        };
        report.merge(key_report);
    }

    log::info!(
        "Reconciled {} resources: {} actions, {} applied, {} errors",
        resources.len(),
        report.actions.len(),
        report.result.applied_count,
        report.result.errors.len()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterError, InMemoryAdapter};
    use crate::context::NoProgress;
    use crate::error::ErrorKind;
    use crate::secret::{NoSecrets, ResolvedSecrets, StaticSecrets};
    use crate::state::ValidationPolicy;
    use crate::types::{ActionType, ResourceDeclaration, ResourceKey};
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn live() -> ExecuteOptions {
        ExecuteOptions {
            dry_run: false,
            ..ExecuteOptions::default()
        }
    }

    fn batch(decls: &[ResourceDeclaration]) -> DesiredBatch {
        DesiredBatch::load(decls, &ValidationPolicy::default(), &NoSecrets).unwrap()
    }

    #[test]
    fn test_creation_scenario() {
        let adapter = InMemoryAdapter::new();
        let spec = ResourceSpec::new()
            .with_members(["alice", "bob"])
            .with_channels(["#general"])
            .with_description("x");
        let decls = vec![ResourceDeclaration::new("usergroup", "acme/oncall").with_spec(spec.clone())];

        let report = reconcile_sync(&batch(&decls), &adapter, &live(), &mut NoProgress);
        assert_eq!(report.actions.len(), 1);
        assert_eq!(report.actions[0].action_type(), ActionType::Create);
        assert_eq!(report.result.applied_count, 1);

        let key = ResourceKey::new("usergroup", "acme/oncall");
        assert_eq!(adapter.snapshot().get(&key), Some(&spec));

        let again = reconcile_sync(&batch(&decls), &adapter, &live(), &mut NoProgress);
        assert!(again.actions.is_empty());
    }

    #[test]
    fn test_converges_mixed_batch() {
        let adapter = InMemoryAdapter::new();
        adapter.insert(
            ResourceKey::new("usergroup", "a"),
            ResourceSpec::new().with_members(["alice", "carol"]).with_description("x"),
        );
        adapter.insert(
            ResourceKey::new("usergroup", "gone"),
            ResourceSpec::new().with_members(["dave"]),
        );

        let decls = vec![
            ResourceDeclaration::new("usergroup", "a")
                .with_spec(ResourceSpec::new().with_members(["alice", "bob"]).with_description("y")),
            ResourceDeclaration::new("usergroup", "gone").disabled(),
            ResourceDeclaration::new("usergroup", "new")
                .with_spec(ResourceSpec::new().with_members(["erin"])),
        ];

        let report = reconcile_sync(&batch(&decls), &adapter, &live(), &mut NoProgress);
        assert!(report.result.is_success());
        assert_eq!(report.summary().total(), 4);

        let again = reconcile_sync(&batch(&decls), &adapter, &live(), &mut NoProgress);
        assert!(again.actions.is_empty(), "second run: {:?}", again.actions);
    }

    #[test]
    fn test_dry_run_leaves_system_untouched() {
        let adapter = InMemoryAdapter::new();
        let decls = vec![ResourceDeclaration::new("snitch", "cluster-a")];

        let report = reconcile_sync(&batch(&decls), &adapter, &ExecuteOptions::default(), &mut NoProgress);
        assert_eq!(report.actions.len(), 1);
        assert_eq!(report.result.applied_count, 0);
        assert!(adapter.snapshot().is_empty());
    }

    #[test]
    fn test_prune_deletes_undeclared() {
        let adapter = InMemoryAdapter::new();
        adapter.insert(ResourceKey::new("snitch", "kept"), ResourceSpec::new());
        adapter.insert(ResourceKey::new("snitch", "stray"), ResourceSpec::new());

        let decls = vec![ResourceDeclaration::new("snitch", "kept")];
        let opts = ExecuteOptions {
            prune: true,
            ..live()
        };

        let report = reconcile_sync(&batch(&decls), &adapter, &opts, &mut NoProgress);
        assert_eq!(
            report.actions,
            vec![Action::Delete {
                key: ResourceKey::new("snitch", "stray")
            }]
        );
        assert_eq!(adapter.snapshot().len(), 1);
    }

    struct UnreadableAdapter {
        writes: AtomicUsize,
    }

    impl ExternalResourceAdapter for UnreadableAdapter {
        fn get(&self, _key: &ResourceKey) -> Result<Option<ResourceSpec>, AdapterError> {
            Err(AdapterError::new("timeout"))
        }

        fn create(&self, _key: &ResourceKey, _spec: &ResourceSpec) -> Result<(), AdapterError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn update_members(
            &self,
            _key: &ResourceKey,
            _members: &BTreeSet<String>,
            _add: &BTreeSet<String>,
            _remove: &BTreeSet<String>,
        ) -> Result<(), AdapterError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn update_metadata(
            &self,
            _key: &ResourceKey,
            _channels: &BTreeSet<String>,
            _description: Option<&str>,
        ) -> Result<(), AdapterError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn delete(&self, _key: &ResourceKey) -> Result<(), AdapterError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_unreadable_key_is_not_recreated() {
        let adapter = UnreadableAdapter {
            writes: AtomicUsize::new(0),
        };
        let decls = vec![
            ResourceDeclaration::new("snitch", "a"),
            ResourceDeclaration::new("snitch", "b"),
        ];

        let report = reconcile_sync(&batch(&decls), &adapter, &live(), &mut NoProgress);

        assert_eq!(adapter.writes.load(Ordering::SeqCst), 0);
        assert!(report.actions.is_empty());
        assert_eq!(report.errors().len(), 2);
        assert!(
            report
                .errors()
                .iter()
                .all(|e| e.kind == ErrorKind::TransientExternal)
        );
        assert_eq!(report.status(true), TaskStatus::Failed);
    }

    #[test]
    fn test_rejected_declarations_are_reported() {
        let adapter = InMemoryAdapter::new();
        let decls = vec![
            ResourceDeclaration::new("snitch", "ok"),
            ResourceDeclaration::new("snitch", "locked").with_auth("vault:missing"),
        ];

        let report = reconcile_sync(&batch(&decls), &adapter, &live(), &mut NoProgress);

        assert_eq!(report.result.applied_count, 1);
        assert_eq!(report.errors().len(), 1);
        assert_eq!(report.errors()[0].key.id, "locked");
        assert_eq!(report.status(false), TaskStatus::Success);
    }

    fn members(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_prune_spares_rejected_declarations() {
        let adapter = InMemoryAdapter::new();
        adapter.insert(ResourceKey::new("usergroup", "locked"), ResourceSpec::new());
        adapter.insert(ResourceKey::new("usergroup", "stray"), ResourceSpec::new());

        let decls = vec![ResourceDeclaration::new("usergroup", "locked").with_auth("vault:missing")];
        let opts = ExecuteOptions {
            prune: true,
            ..live()
        };

        let report = reconcile_sync(&batch(&decls), &adapter, &opts, &mut NoProgress);

        assert_eq!(
            report.actions,
            vec![Action::Delete {
                key: ResourceKey::new("usergroup", "stray")
            }]
        );
        assert_eq!(report.errors().len(), 1);
        assert_eq!(report.errors()[0].kind, ErrorKind::SecretResolution);
        assert!(
            adapter
                .snapshot()
                .contains_key(&ResourceKey::new("usergroup", "locked"))
        );
    }

    #[test]
    fn test_prune_stays_inside_target() {
        let adapter = InMemoryAdapter::new();
        for id in ["acme/oncall", "acme/sre", "acme/old-sre", "stray"] {
            adapter.insert(ResourceKey::new("usergroup", id), ResourceSpec::new());
        }

        let decls = vec![
            ResourceDeclaration::new("usergroup", "acme/oncall"),
            ResourceDeclaration::new("usergroup", "acme/sre")
                .with_spec(ResourceSpec::new().with_members(["dave"])),
        ];
        let scoped = batch(&decls).filter_by_target(Some("usergroup.sre"));
        let opts = ExecuteOptions {
            prune: true,
            ..live()
        };

        let report = reconcile_sync(&scoped, &adapter, &opts, &mut NoProgress);

        let touched: Vec<_> = report
            .actions
            .iter()
            .map(|a| (a.action_type(), a.key().id.as_str()))
            .collect();
        assert_eq!(
            touched,
            vec![
                (ActionType::Delete, "acme/old-sre"),
                (ActionType::UpdateMembers, "acme/sre"),
            ]
        );

        let snapshot = adapter.snapshot();
        assert!(snapshot.contains_key(&ResourceKey::new("usergroup", "acme/oncall")));
        assert!(snapshot.contains_key(&ResourceKey::new("usergroup", "stray")));
    }

    #[test]
    fn test_placeholder_group_converges() {
        let adapter = InMemoryAdapter::new();
        let key = ResourceKey::new("usergroup", "acme/empty");
        let opts = ExecuteOptions {
            empty_members_placeholder: Some("bot".to_string()),
            ..live()
        };

        let empty = vec![ResourceDeclaration::new("usergroup", "acme/empty")];
        let first = reconcile_sync(&batch(&empty), &adapter, &opts, &mut NoProgress);
        assert_eq!(first.result.applied_count, 1);
        assert_eq!(adapter.snapshot()[&key].members, members(&["bot"]));

        let second = reconcile_sync(&batch(&empty), &adapter, &opts, &mut NoProgress);
        assert!(second.actions.is_empty(), "second run: {:?}", second.actions);

        let staffed = vec![
            ResourceDeclaration::new("usergroup", "acme/empty")
                .with_spec(ResourceSpec::new().with_members(["alice"])),
        ];
        let third = reconcile_sync(&batch(&staffed), &adapter, &opts, &mut NoProgress);
        assert_eq!(
            third.actions,
            vec![Action::UpdateMembers {
                key: key.clone(),
                add: members(&["alice"]),
                remove: members(&["bot"]),
                members: members(&["alice"]),
            }]
        );
        assert_eq!(adapter.snapshot()[&key].members, members(&["alice"]));
    }

    #[test]
    fn test_declared_placeholder_is_kept() {
        let adapter = InMemoryAdapter::new();
        let opts = ExecuteOptions {
            empty_members_placeholder: Some("bot".to_string()),
            ..live()
        };
        let decls = vec![
            ResourceDeclaration::new("usergroup", "bots")
                .with_spec(ResourceSpec::new().with_members(["bot"])),
        ];

        reconcile_sync(&batch(&decls), &adapter, &opts, &mut NoProgress);
        let again = reconcile_sync(&batch(&decls), &adapter, &opts, &mut NoProgress);
        assert!(again.actions.is_empty());
    }

    /// Keeps the credentials it is handed, refusing keys without any
    #[derive(Default)]
    struct GuardedAdapter {
        inner: InMemoryAdapter,
        seen: Mutex<Vec<(String, Option<String>)>>,
    }

    impl ExternalResourceAdapter for GuardedAdapter {
        fn get(&self, key: &ResourceKey) -> Result<Option<ResourceSpec>, AdapterError> {
            self.inner.get(key)
        }

        fn authenticate(
            &self,
            key: &ResourceKey,
            secrets: &ResolvedSecrets,
        ) -> Result<(), AdapterError> {
            self.seen
                .lock()
                .unwrap()
                .push((key.id.clone(), secrets.auth.clone()));
            match secrets.auth {
                Some(_) => Ok(()),
                None => Err(AdapterError::permanent("credentials required")),
            }
        }

        fn create(&self, key: &ResourceKey, spec: &ResourceSpec) -> Result<(), AdapterError> {
            self.inner.create(key, spec)
        }

        fn update_members(
            &self,
            key: &ResourceKey,
            members: &BTreeSet<String>,
            add: &BTreeSet<String>,
            remove: &BTreeSet<String>,
        ) -> Result<(), AdapterError> {
            self.inner.update_members(key, members, add, remove)
        }

        fn update_metadata(
            &self,
            key: &ResourceKey,
            channels: &BTreeSet<String>,
            description: Option<&str>,
        ) -> Result<(), AdapterError> {
            self.inner.update_metadata(key, channels, description)
        }

        fn delete(&self, key: &ResourceKey) -> Result<(), AdapterError> {
            self.inner.delete(key)
        }
    }

    #[test]
    fn test_credentials_reach_the_adapter() {
        let adapter = GuardedAdapter::default();
        let resolver = StaticSecrets::new().with("vault:token", "t0k3n");
        let decls = vec![
            ResourceDeclaration::new("secret_replica", "anonymous"),
            ResourceDeclaration::new("secret_replica", "prod/db").with_auth("vault:token"),
        ];
        let batch = DesiredBatch::load(&decls, &ValidationPolicy::default(), &resolver).unwrap();

        let planned = reconcile_sync(&batch, &adapter, &ExecuteOptions::default(), &mut NoProgress);
        assert_eq!(planned.actions.len(), 2);
        assert!(adapter.seen.lock().unwrap().is_empty());

        let report = reconcile_sync(&batch, &adapter, &live(), &mut NoProgress);
        assert_eq!(
            *adapter.seen.lock().unwrap(),
            vec![
                ("anonymous".to_string(), None),
                ("prod/db".to_string(), Some("t0k3n".to_string())),
            ]
        );
        assert_eq!(report.result.applied_count, 1);
        assert_eq!(report.errors().len(), 1);
        assert_eq!(report.errors()[0].key.id, "anonymous");
        assert_eq!(report.errors()[0].kind, ErrorKind::PermanentValidation);
        assert_eq!(adapter.inner.snapshot().len(), 1);
    }
}
