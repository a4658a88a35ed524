//! Execution engine - applies actions against an external system
//!
//! Actions are applied one at a time in diff order. A failing action is
//! recorded and never stops the remaining actions of the batch.

use std::borrow::Cow;
use std::collections::BTreeSet;

use crate::adapter::AdapterError;
use crate::context::{ApplyContext, ApplyResult, ProgressCallback};
use crate::types::{Action, ActionError, BatchResult, ResourceSpec};

/// Apply a batch of actions
///
/// In dry-run mode every action is only logged and reported as skipped;
/// the adapter is never called and `applied_count` stays zero. Otherwise
/// each action is dispatched to the matching adapter call and failures are
/// collected into the returned [`BatchResult`].
pub fn apply<P>(actions: &[Action], ctx: &ApplyContext<'_>, progress: &mut P) -> BatchResult
where
    P: ProgressCallback + ?Sized,
{
    let mut result = BatchResult::default();
    if actions.is_empty() {
        return result;
    }

    progress.on_batch_start(actions.len(), ctx.dry_run);

    for action in actions {
        progress.on_action_start(action);

        let outcome = if ctx.dry_run {
            log::info!("[dry-run] would {}", action.description());
            ApplyResult::Skipped {
                reason: "Dry run".to_string(),
            }
        } else {
            match apply_action(action, ctx) {
                Ok(()) => {
                    log::info!("Applied: {}", action.description());
                    result.applied_count += 1;
                    ApplyResult::Applied
                }
                Err(e) => {
                    log::warn!("Failed to {}: {}", action.description(), e);
                    result.push_error(ActionError::for_action(
                        action,
                        e.kind(),
                        e.message.clone(),
                    ));
                    ApplyResult::Failed { error: e.message }
                }
            }
        };

        progress.on_action_complete(action, &outcome);
    }

    progress.on_batch_complete();
    result
}

/// Dispatch a single action to the adapter
fn apply_action(action: &Action, ctx: &ApplyContext<'_>) -> Result<(), AdapterError> {
    let adapter = ctx.adapter;
    match action {
        Action::Create { key, spec } => {
            let spec = with_placeholder_member(spec, ctx.empty_members_placeholder);
            adapter.create(key, &spec)
        }
        Action::UpdateMembers {
            key,
            add,
            remove,
            members,
        } => match ctx.empty_members_placeholder {
            Some(placeholder) if members.is_empty() => {
                log::debug!("{key}: substituting placeholder member {placeholder}");
                let placeholder_set = BTreeSet::from([placeholder.to_string()]);
                let mut add = add.clone();
                add.insert(placeholder.to_string());
                let mut remove = remove.clone();
                remove.remove(placeholder);
                adapter.update_members(key, &placeholder_set, &add, &remove)
            }
            _ => adapter.update_members(key, members, add, remove),
        },
        Action::UpdateMetadata {
            key,
            channels,
            description,
        } => adapter.update_metadata(key, channels, description.as_deref()),
        Action::Delete { key } => adapter.delete(key),
    }
}

fn with_placeholder_member<'s>(
    spec: &'s ResourceSpec,
    placeholder: Option<&str>,
) -> Cow<'s, ResourceSpec> {
    match placeholder {
        Some(placeholder) if spec.members.is_empty() => {
            let mut spec = spec.clone();
            spec.members.insert(placeholder.to_string());
            Cow::Owned(spec)
        }
        _ => Cow::Borrowed(spec),
    }
}
