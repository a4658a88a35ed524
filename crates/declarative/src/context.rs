//! Apply context and progress reporting
//!
//! These traits allow the engine to report progress without depending on
//! a specific terminal or UI implementation.

use serde::{Deserialize, Serialize};

use crate::adapter::ExternalResourceAdapter;
use crate::types::{Action, ExecuteOptions};

/// Outcome of applying a single action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyResult {
    /// The adapter accepted the change
    Applied,
    /// The action was not sent to the adapter
    Skipped { reason: String },
    /// The adapter call failed
    Failed { error: String },
}

impl ApplyResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    pub fn is_change(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Progress callback for apply operations
pub trait ProgressCallback: Send {
    /// Called before the first action of a batch
    fn on_batch_start(&mut self, count: usize, dry_run: bool);

    fn on_action_start(&mut self, action: &Action);

    fn on_action_complete(&mut self, action: &Action, result: &ApplyResult);

    fn on_batch_complete(&mut self);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_batch_start(&mut self, _count: usize, _dry_run: bool) {}
    fn on_action_start(&mut self, _action: &Action) {}
    fn on_action_complete(&mut self, _action: &Action, _result: &ApplyResult) {}
    fn on_batch_complete(&mut self) {}
}

/// Context passed to apply operations
pub struct ApplyContext<'a> {
    /// Whether this is a dry run (no adapter calls)
    pub dry_run: bool,
    /// Member substituted when a group would otherwise be sent empty
    pub empty_members_placeholder: Option<&'a str>,
    /// The external system actions are applied to
    pub adapter: &'a dyn ExternalResourceAdapter,
}

impl<'a> ApplyContext<'a> {
    pub fn new(dry_run: bool, adapter: &'a dyn ExternalResourceAdapter) -> Self {
        Self {
            dry_run,
            empty_members_placeholder: None,
            adapter,
        }
    }

    /// Context honoring the dry-run flag and placeholder of `opts`
    pub fn from_options(opts: &'a ExecuteOptions, adapter: &'a dyn ExternalResourceAdapter) -> Self {
        Self {
            dry_run: opts.dry_run,
            empty_members_placeholder: opts.empty_members_placeholder.as_deref(),
            adapter,
        }
    }

    pub fn with_placeholder(mut self, placeholder: &'a str) -> Self {
        self.empty_members_placeholder = Some(placeholder);
        self
    }
}
