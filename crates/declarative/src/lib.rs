//! # Declarative
//!
//! A reconciliation engine for externally owned resources.
//!
//! Desired state comes from declarations, current state from the systems
//! that own each resource. The engine diffs the two per key, applies the
//! resulting actions through an adapter, and can run whole batches as
//! background tasks that clients poll.
//!
//! ## Core Concepts
//!
//! - **ResourceKey**: `(kind, id)`, unique across everything managed
//! - **ResourceSpec**: membership, channels and description of a resource
//! - **Action**: a typed change (create, update members, update metadata, delete)
//! - **Task**: a queued reconciliation, `pending` until it becomes `success` or `failed`
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{
//!     DesiredBatch, ExecuteOptions, InMemoryAdapter, NoProgress, NoSecrets,
//!     ResourceDeclaration, ResourceSpec, ValidationPolicy, reconcile_sync,
//! };
//!
//! let decls = vec![
//!     ResourceDeclaration::new("usergroup", "acme/oncall")
//!         .with_spec(ResourceSpec::new().with_members(["alice", "bob"])),
//! ];
//! let batch = DesiredBatch::load(&decls, &ValidationPolicy::default(), &NoSecrets)?;
//!
//! let adapter = InMemoryAdapter::new();
//! let opts = ExecuteOptions { dry_run: false, ..ExecuteOptions::default() };
//! let report = reconcile_sync(&batch, &adapter, &opts, &mut NoProgress);
//! assert!(report.result.is_success());
//! ```
//!
//! ## Collaborator Traits
//!
//! - [`DesiredStateSource`]: supplies declarations
//! - [`ExternalResourceAdapter`]: reads and changes live resources
//! - [`SecretResolver`]: turns secret references into values
//! - [`ProgressCallback`]: receives progress updates
//!
//! This keeps the engine free of any particular config format, API
//! client or terminal UI.

pub mod adapter;
pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod locks;
pub mod planner;
pub mod protocol;
pub mod reconcile;
pub mod runner;
pub mod secret;
pub mod state;
pub mod task;
pub mod types;

// Re-export main types at crate root
pub use adapter::{AdapterError, DesiredStateSource, ExternalResourceAdapter, InMemoryAdapter};
pub use context::{ApplyContext, ApplyResult, NoProgress, ProgressCallback};
pub use diff::{DiffSummary, compute_diff, diff_all, group_by_kind, project};
pub use error::{Error, ErrorKind, PollError, Result};
pub use executor::apply;
pub use locks::KeyLocks;
pub use planner::DesiredBatch;
pub use protocol::{
    CreateTaskRequest, CreateTaskResponse, ProtocolError, ProtocolResponse, ReconcileService,
    TaskStatusResponse,
};
pub use reconcile::{ReconcileReport, reconcile_key, reconcile_sync};
pub use runner::TaskRunner;
pub use secret::{NoSecrets, SecretRef, SecretResolver, SecretValue, StaticSecrets};
pub use state::{DesiredResource, ValidationPolicy, load_current, load_desired};
pub use task::{TaskId, TaskRecord, TaskStore};
pub use types::{
    Action, ActionError, ActionType, BatchResult, ExecuteOptions, ResourceDeclaration, ResourceKey,
    ResourceSpec, TaskStatus,
};
