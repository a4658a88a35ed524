//! Task records and the store that tracks them
//!
//! A task is created `pending` and written exactly once more, with its
//! terminal status. Pollers can block on the store until that happens or
//! their timeout runs out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{Error, PollError, Result};
use crate::reconcile::ReconcileReport;
use crate::types::{Action, ActionError, TaskStatus};

/// Opaque, globally unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Everything known about one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Actions computed for the task; empty until it finishes
    pub actions: Vec<Action>,
    pub applied_count: usize,
    pub errors: Vec<ActionError>,
    pub dry_run: bool,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    fn pending(task_id: TaskId, dry_run: bool) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            actions: Vec::new(),
            applied_count: 0,
            errors: Vec::new(),
            dry_run,
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status.is_pending()
    }
}

/// Thread-safe map of task records
///
/// Terminal records stay until [`TaskStore::prune_finished`] drops them.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: Mutex<HashMap<TaskId, TaskRecord>>,
    finished: Condvar,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending task
    pub fn insert_pending(&self, dry_run: bool) -> TaskId {
        let task_id = TaskId::new();
        self.tasks()
            .insert(task_id, TaskRecord::pending(task_id, dry_run));
        log::debug!("Task {task_id} registered as pending");
        task_id
    }

    /// Write the terminal record of a task and wake every poller
    ///
    /// A terminal record is final: completing a task twice is an error and
    /// leaves the first outcome in place.
    pub fn complete(&self, task_id: TaskId, status: TaskStatus, report: ReconcileReport) -> Result<()> {
        if status.is_pending() {
            return Err(Error::InvalidRequest(format!(
                "task {task_id} cannot be completed as pending"
            )));
        }

        let mut tasks = self.tasks();
        let record = tasks
            .get_mut(&task_id)
            .ok_or(Error::Poll(PollError::NotFound(task_id)))?;
        if record.status.is_terminal() {
            return Err(Error::AlreadyFinished(task_id));
        }

        record.status = status;
        record.actions = report.actions;
        record.applied_count = report.result.applied_count;
        record.errors = report.result.errors;
        record.finished_at = Some(Utc::now());
        drop(tasks);

        log::info!("Task {task_id} finished: {status}");
        self.finished.notify_all();
        Ok(())
    }

    /// Look up a task, optionally waiting for it to finish
    ///
    /// Without a timeout the current record is returned immediately, pending
    /// or not. With one, the call blocks until the task is terminal and
    /// fails with [`PollError::StillPending`] if the timeout elapses first.
    /// Timing out never changes the task.
    pub fn get_status(
        &self,
        task_id: TaskId,
        timeout: Option<Duration>,
    ) -> std::result::Result<TaskRecord, PollError> {
        let tasks = self.tasks();
        let Some(timeout) = timeout else {
            return tasks
                .get(&task_id)
                .cloned()
                .ok_or(PollError::NotFound(task_id));
        };

        if !tasks.contains_key(&task_id) {
            return Err(PollError::NotFound(task_id));
        }

        let started = Instant::now();
        let (tasks, _) = self
            .finished
            .wait_timeout_while(tasks, timeout, |tasks| {
                tasks.get(&task_id).is_some_and(TaskRecord::is_pending)
            })
            .unwrap_or_else(PoisonError::into_inner);

        match tasks.get(&task_id) {
            None => Err(PollError::NotFound(task_id)),
            Some(record) if record.is_pending() => Err(PollError::StillPending {
                task_id,
                waited: started.elapsed(),
            }),
            Some(record) => Ok(record.clone()),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }

    /// Drop terminal records that finished before `cutoff`
    ///
    /// Pending tasks are never removed. Returns the number of records dropped.
    pub fn prune_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let mut tasks = self.tasks();
        let before = tasks.len();
        tasks.retain(|_, record| record.finished_at.is_none_or(|finished| finished >= cutoff));
        let pruned = before - tasks.len();
        if pruned > 0 {
            log::debug!("Pruned {pruned} finished tasks");
        }
        pruned
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, TaskRecord>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
