//! Diff computation between current and desired state
//!
//! Everything here is pure: the same inputs always produce the same
//! actions, in the same order.

use std::collections::BTreeMap;

use crate::types::{Action, ResourceKey, ResourceSpec};

/// Compute the actions that converge `current` to `desired` for one key
///
/// Emits one action per differing dimension so each can be applied and
/// reported on its own. An empty desired membership is reported as is;
/// systems that reject empty groups are handled at apply time.
pub fn compute_diff(
    key: &ResourceKey,
    current: Option<&ResourceSpec>,
    desired: Option<&ResourceSpec>,
) -> Vec<Action> {
    match (current, desired) {
        (None, None) => Vec::new(),
        (None, Some(desired)) => vec![Action::Create {
            key: key.clone(),
            spec: desired.clone(),
        }],
        (Some(_), None) => vec![Action::Delete { key: key.clone() }],
        (Some(current), Some(desired)) => diff_present(key, current, desired),
    }
}

fn diff_present(key: &ResourceKey, current: &ResourceSpec, desired: &ResourceSpec) -> Vec<Action> {
    let mut actions = Vec::new();

    if current.members != desired.members {
        actions.push(Action::UpdateMembers {
            key: key.clone(),
            add: desired.members.difference(&current.members).cloned().collect(),
            remove: current.members.difference(&desired.members).cloned().collect(),
            members: desired.members.clone(),
        });
    }

    if current.channels != desired.channels || current.description != desired.description {
        actions.push(Action::UpdateMetadata {
            key: key.clone(),
            channels: desired.channels.clone(),
            description: desired.description.clone(),
        });
    }

    actions
}

/// Compute diffs for many keys, ordered by key
pub fn diff_all<'a, I>(entries: I) -> Vec<Action>
where
    I: IntoIterator<
        Item = (
            &'a ResourceKey,
            Option<&'a ResourceSpec>,
            Option<&'a ResourceSpec>,
        ),
    >,
{
    let mut entries: Vec<_> = entries.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .into_iter()
        .flat_map(|(key, current, desired)| compute_diff(key, current, desired))
        .collect()
}

/// State a faithful external system ends up in after applying `actions`
///
/// Actions for other keys are ignored.
pub fn project(
    key: &ResourceKey,
    current: Option<ResourceSpec>,
    actions: &[Action],
) -> Option<ResourceSpec> {
    actions
        .iter()
        .filter(|action| action.key() == key)
        .fold(current, |state, action| match action {
            Action::Create { spec, .. } => Some(spec.clone()),
            Action::UpdateMembers { members, .. } => state.map(|mut spec| {
                spec.members = members.clone();
                spec
            }),
            Action::UpdateMetadata {
                channels,
                description,
                ..
            } => state.map(|mut spec| {
                spec.channels = channels.clone();
                spec.description = description.clone();
                spec
            }),
            Action::Delete { .. } => None,
        })
}

/// Diff summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub creates: usize,
    pub member_updates: usize,
    pub metadata_updates: usize,
    pub deletes: usize,
}

impl DiffSummary {
    pub fn from_actions(actions: &[Action]) -> Self {
        let mut summary = Self::default();
        for action in actions {
            match action {
                Action::Create { .. } => summary.creates += 1,
                Action::UpdateMembers { .. } => summary.member_updates += 1,
                Action::UpdateMetadata { .. } => summary.metadata_updates += 1,
                Action::Delete { .. } => summary.deletes += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.creates + self.member_updates + self.metadata_updates + self.deletes
    }

    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}

/// Group actions by resource kind
pub fn group_by_kind(actions: &[Action]) -> BTreeMap<&str, Vec<&Action>> {
    let mut groups: BTreeMap<&str, Vec<&Action>> = BTreeMap::new();
    for action in actions {
        groups
            .entry(action.key().kind.as_str())
            .or_default()
            .push(action);
    }
    groups
}
