//! Background task runner
//!
//! Submitting a batch registers a pending task and returns its id right
//! away; a worker from a fixed-size pool reconciles the batch and writes
//! the terminal record. Tasks on disjoint keys run concurrently, tasks
//! sharing a key are serialized per key.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::ExternalResourceAdapter;
use crate::context::NoProgress;
use crate::error::{Error, ErrorKind, PollError, Result};
use crate::locks::KeyLocks;
use crate::planner::DesiredBatch;
use crate::reconcile::{ReconcileReport, reconcile_batch};
use crate::task::{TaskId, TaskRecord, TaskStore};
use crate::types::{ActionError, ExecuteOptions, ResourceKey};

/// Runs reconciliation tasks on a worker pool
pub struct TaskRunner {
    store: Arc<TaskStore>,
    locks: Arc<KeyLocks>,
    adapter: Arc<dyn ExternalResourceAdapter>,
    opts: ExecuteOptions,
    pool: rayon::ThreadPool,
}

impl TaskRunner {
    /// Create a runner with `opts.jobs` workers
    pub fn new(adapter: Arc<dyn ExternalResourceAdapter>, opts: ExecuteOptions) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(opts.jobs.max(1))
            .thread_name(|i| format!("reconcile-{i}"))
            .build()
            .map_err(|e| Error::Pool(format!("Failed to create thread pool: {e}")))?;

        Ok(Self {
            store: Arc::new(TaskStore::new()),
            locks: Arc::new(KeyLocks::new()),
            adapter,
            opts,
            pool,
        })
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn options(&self) -> &ExecuteOptions {
        &self.opts
    }

    /// Queue a batch for reconciliation and return its task id
    ///
    /// Never blocks on the work itself. `dry_run` overrides the runner's
    /// default for this task only.
    pub fn enqueue(&self, batch: DesiredBatch, dry_run: bool) -> TaskId {
        let task_id = self.store.insert_pending(dry_run);
        let opts = ExecuteOptions {
            dry_run,
            ..self.opts.clone()
        };
        let store = Arc::clone(&self.store);
        let locks = Arc::clone(&self.locks);
        let adapter = Arc::clone(&self.adapter);

        log::info!(
            "Task {task_id} queued: {} resources{}",
            batch.len(),
            if dry_run { " (dry run)" } else { "" }
        );

        self.pool.spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                reconcile_batch(&batch, adapter.as_ref(), &opts, &mut NoProgress, Some(&locks))
            }));

            let report = outcome.unwrap_or_else(|_| {
                log::error!("Task {task_id} panicked while reconciling");
                let mut report = ReconcileReport::default();
                report.result.push_error(ActionError::for_key(
                    &ResourceKey::new("task", task_id.to_string()),
                    ErrorKind::TransientExternal,
                    "worker panicked",
                ));
                report
            });

            let status = report.status(opts.fail_on_partial_error);
            if let Err(e) = store.complete(task_id, status, report) {
                log::error!("Failed to record outcome of task {task_id}: {e}");
            }
        });

        task_id
    }

    /// Current record of a task, optionally waiting for it to finish
    pub fn get_status(
        &self,
        task_id: TaskId,
        timeout: Option<Duration>,
    ) -> std::result::Result<TaskRecord, PollError> {
        self.store.get_status(task_id, timeout)
    }
}
