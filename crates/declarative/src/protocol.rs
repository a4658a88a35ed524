//! Transport-neutral job protocol
//!
//! Request and response bodies serialize with serde; status codes follow
//! HTTP conventions so any server can map them one-to-one.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::adapter::DesiredStateSource;
use crate::error::{Error as EngineError, PollError};
use crate::planner::DesiredBatch;
use crate::runner::TaskRunner;
use crate::secret::SecretResolver;
use crate::state::ValidationPolicy;
use crate::task::{TaskId, TaskRecord};
use crate::types::{Action, ActionError, ResourceDeclaration, TaskStatus};

pub const STATUS_OK: u16 = 200;
pub const STATUS_ACCEPTED: u16 = 202;

/// Body of a create-task request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(default, alias = "desired_state")]
    pub declarations: Vec<ResourceDeclaration>,
    /// Requests are dry runs unless they opt out
    #[serde(default = "default_dry_run")]
    pub dry_run: bool,
    /// Narrow the run to a kind or `kind.id-substring`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

fn default_dry_run() -> bool {
    true
}

impl CreateTaskRequest {
    pub fn new(declarations: Vec<ResourceDeclaration>) -> Self {
        Self {
            declarations,
            dry_run: true,
            target: None,
        }
    }

    pub fn applying(mut self) -> Self {
        self.dry_run = false;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub task_id: TaskId,
    pub status_url: String,
    pub status: TaskStatus,
}

/// Body of a task-status response
///
/// Pending tasks only carry their status; the outcome fields appear once
/// the task is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<Action>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ActionError>>,
}

impl From<TaskRecord> for TaskStatusResponse {
    fn from(record: TaskRecord) -> Self {
        if record.is_pending() {
            return Self {
                task_id: record.task_id,
                status: record.status,
                actions: None,
                applied_count: None,
                errors: None,
            };
        }
        Self {
            task_id: record.task_id,
            status: record.status,
            actions: Some(record.actions),
            applied_count: Some(record.applied_count),
            errors: Some(record.errors),
        }
    }
}

/// A successful response and its status code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolResponse<T> {
    pub status_code: u16,
    pub body: T,
}

impl<T: Serialize> ProtocolResponse<T> {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.body)
    }
}

/// A request that could not be served
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("task not found: {0}")]
    NotFound(String),

    /// The task is still running; the client may poll again
    #[error("task {task_id} still pending after {waited_ms}ms")]
    RequestTimeout { task_id: TaskId, waited_ms: u128 },
}

/// JSON body sent alongside an error status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl ProtocolError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::NotFound(_) => 404,
            Self::RequestTimeout { .. } => 408,
        }
    }

    pub fn body(&self) -> ErrorBody {
        let error = match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::RequestTimeout { .. } => "request_timeout",
        };
        ErrorBody {
            error: error.to_string(),
            message: self.to_string(),
        }
    }
}

impl From<PollError> for ProtocolError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::NotFound(task_id) => Self::NotFound(task_id.to_string()),
            PollError::StillPending { task_id, waited } => Self::RequestTimeout {
                task_id,
                waited_ms: waited.as_millis(),
            },
        }
    }
}

impl From<EngineError> for ProtocolError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Poll(poll) => poll.into(),
            other => Self::BadRequest(other.to_string()),
        }
    }
}

/// Path a client polls for the status of a task
pub fn status_url(task_id: TaskId) -> String {
    format!("/tasks/{task_id}")
}

/// Serves the create-task and task-status operations
pub struct ReconcileService {
    runner: TaskRunner,
    policy: ValidationPolicy,
    resolver: Arc<dyn SecretResolver>,
}

impl ReconcileService {
    pub fn new(
        runner: TaskRunner,
        policy: ValidationPolicy,
        resolver: Arc<dyn SecretResolver>,
    ) -> Self {
        Self {
            runner,
            policy,
            resolver,
        }
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    /// Validate a request and queue it
    ///
    /// Only malformed requests fail here. Problems with individual keys are
    /// reported by the task itself.
    pub fn create_task(
        &self,
        request: CreateTaskRequest,
    ) -> Result<ProtocolResponse<CreateTaskResponse>, ProtocolError> {
        let batch = DesiredBatch::load(&request.declarations, &self.policy, self.resolver.as_ref())?
            .filter_by_target(request.target.as_deref());
        Ok(self.accept(batch, request.dry_run))
    }

    /// Queue the declarations supplied by `source`
    ///
    /// A source that cannot be read fails the request before anything is
    /// queued.
    pub fn create_task_from_source(
        &self,
        source: &dyn DesiredStateSource,
        dry_run: bool,
        target: Option<&str>,
    ) -> Result<ProtocolResponse<CreateTaskResponse>, ProtocolError> {
        let batch = DesiredBatch::from_source(source, &self.policy, self.resolver.as_ref())?
            .filter_by_target(target);
        Ok(self.accept(batch, dry_run))
    }

    /// Parse a JSON request body and queue it
    pub fn create_task_json(
        &self,
        body: &str,
    ) -> Result<ProtocolResponse<CreateTaskResponse>, ProtocolError> {
        let request: CreateTaskRequest = serde_json::from_str(body)
            .map_err(|e| ProtocolError::BadRequest(format!("malformed request body: {e}")))?;
        self.create_task(request)
    }

    /// Status of a task, blocking up to `timeout` for a terminal state
    ///
    /// An id that does not parse cannot name a task and is reported as not
    /// found.
    pub fn get_task_status(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> Result<ProtocolResponse<TaskStatusResponse>, ProtocolError> {
        let id: TaskId = task_id
            .parse()
            .map_err(|_| ProtocolError::NotFound(task_id.to_string()))?;
        let record = self.runner.get_status(id, timeout)?;
        Ok(ProtocolResponse {
            status_code: STATUS_OK,
            body: record.into(),
        })
    }

    fn accept(&self, batch: DesiredBatch, dry_run: bool) -> ProtocolResponse<CreateTaskResponse> {
        let task_id = self.runner.enqueue(batch, dry_run);
        ProtocolResponse {
            status_code: STATUS_ACCEPTED,
            body: CreateTaskResponse {
                task_id,
                status_url: status_url(task_id),
                status: TaskStatus::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterError, ExternalResourceAdapter, InMemoryAdapter};
    use crate::secret::{NoSecrets, StaticSecrets};
    use crate::types::{ExecuteOptions, ResourceKey, ResourceSpec};
    use std::collections::BTreeSet;
    use std::thread;

    /// Adapter whose every call takes a fixed amount of time
    struct Sluggish {
        inner: InMemoryAdapter,
        delay: Duration,
    }

    impl ExternalResourceAdapter for Sluggish {
        fn get(&self, key: &ResourceKey) -> Result<Option<ResourceSpec>, AdapterError> {
            thread::sleep(self.delay);
            self.inner.get(key)
        }

        fn create(&self, key: &ResourceKey, spec: &ResourceSpec) -> Result<(), AdapterError> {
            thread::sleep(self.delay);
            self.inner.create(key, spec)
        }

        fn update_members(
            &self,
            key: &ResourceKey,
            members: &BTreeSet<String>,
            add: &BTreeSet<String>,
            remove: &BTreeSet<String>,
        ) -> Result<(), AdapterError> {
            thread::sleep(self.delay);
            self.inner.update_members(key, members, add, remove)
        }

        fn update_metadata(
            &self,
            key: &ResourceKey,
            channels: &BTreeSet<String>,
            description: Option<&str>,
        ) -> Result<(), AdapterError> {
            thread::sleep(self.delay);
            self.inner.update_metadata(key, channels, description)
        }

        fn delete(&self, key: &ResourceKey) -> Result<(), AdapterError> {
            thread::sleep(self.delay);
            self.inner.delete(key)
        }
    }

    fn service(adapter: Arc<dyn ExternalResourceAdapter>) -> ReconcileService {
        let opts = ExecuteOptions {
            jobs: 2,
            ..ExecuteOptions::default()
        };
        ReconcileService::new(
            TaskRunner::new(adapter, opts).unwrap(),
            ValidationPolicy::default(),
            Arc::new(NoSecrets),
        )
    }

    #[test]
    fn test_create_task_is_accepted() {
        let svc = service(Arc::new(InMemoryAdapter::new()));
        let response = svc
            .create_task(CreateTaskRequest::new(vec![ResourceDeclaration::new(
                "snitch",
                "cluster-a",
            )]))
            .unwrap();

        assert_eq!(response.status_code, 202);
        assert_eq!(response.body.status, TaskStatus::Pending);
        assert_eq!(
            response.body.status_url,
            format!("/tasks/{}", response.body.task_id)
        );

        let record = svc
            .runner()
            .get_status(response.body.task_id, None)
            .unwrap();
        assert!(record.dry_run);
    }

    #[test]
    fn test_request_defaults_to_dry_run() {
        let request: CreateTaskRequest =
            serde_json::from_str(r#"{"desired_state": [{"kind": "snitch", "id": "a"}]}"#).unwrap();
        assert!(request.dry_run);
        assert_eq!(request.declarations.len(), 1);
    }

    #[test]
    fn test_malformed_requests_are_rejected() {
        let svc = service(Arc::new(InMemoryAdapter::new()));

        let err = svc.create_task_json("{not json").unwrap_err();
        assert_eq!(err.status_code(), 400);

        let dup = CreateTaskRequest::new(vec![
            ResourceDeclaration::new("snitch", "a"),
            ResourceDeclaration::new("snitch", "a"),
        ]);
        let err = svc.create_task(dup).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(svc.runner().store().len(), 0);
    }

    #[test]
    fn test_unknown_task_is_404() {
        let svc = service(Arc::new(InMemoryAdapter::new()));

        let err = svc
            .get_task_status(&TaskId::new().to_string(), None)
            .unwrap_err();
        assert_eq!(err.status_code(), 404);

        let err = svc.get_task_status("garbage", None).unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.body().error, "not_found");
    }

    #[test]
    fn test_pending_response_has_no_outcome() {
        let json = serde_json::to_value(TaskStatusResponse {
            task_id: TaskId::new(),
            status: TaskStatus::Pending,
            actions: None,
            applied_count: None,
            errors: None,
        })
        .unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json.get("actions").is_none());
        assert!(json.get("errors").is_none());
    }

    #[test]
    fn test_timeout_scenario() {
        let adapter = Arc::new(Sluggish {
            inner: InMemoryAdapter::new(),
            delay: Duration::from_secs(1),
        });
        let svc = service(adapter.clone());

        let request = CreateTaskRequest::new(vec![ResourceDeclaration::new("snitch", "cluster-a")])
            .applying();
        let created = svc.create_task(request).unwrap();
        let id = created.body.task_id.to_string();

        // get + create take two seconds in total
        let err = svc
            .get_task_status(&id, Some(Duration::from_secs(1)))
            .unwrap_err();
        assert_eq!(err.status_code(), 408);

        let done = svc
            .get_task_status(&id, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(done.status_code, 200);
        assert_eq!(done.body.status, TaskStatus::Success);
        assert_eq!(done.body.applied_count, Some(1));
        assert_eq!(adapter.inner.snapshot().len(), 1);
    }

    #[test]
    fn test_missing_primary_secret_fails_only_that_key() {
        let opts = ExecuteOptions {
            dry_run: false,
            fail_on_partial_error: false,
            jobs: 1,
            ..ExecuteOptions::default()
        };
        let adapter = Arc::new(InMemoryAdapter::new());
        let svc = ReconcileService::new(
            TaskRunner::new(adapter.clone(), opts).unwrap(),
            ValidationPolicy::default(),
            Arc::new(StaticSecrets::new().with("vault:oncall-token", "s3cret")),
        );

        let request = CreateTaskRequest::new(vec![
            ResourceDeclaration::new("usergroup", "a").with_auth("vault:oncall-token"),
            ResourceDeclaration::new("usergroup", "b").with_auth("vault:missing"),
        ])
        .applying();
        let created = svc.create_task(request).unwrap();

        let done = svc
            .get_task_status(&created.body.task_id.to_string(), Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(done.body.status, TaskStatus::Success);
        assert_eq!(done.body.applied_count, Some(1));
        let errors = done.body.errors.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].key.id, "b");
    }

    #[test]
    fn test_source_request_honors_target() {
        let opts = ExecuteOptions {
            dry_run: false,
            jobs: 1,
            ..ExecuteOptions::default()
        };
        let adapter = Arc::new(InMemoryAdapter::new());
        let svc = ReconcileService::new(
            TaskRunner::new(adapter.clone(), opts).unwrap(),
            ValidationPolicy::default(),
            Arc::new(NoSecrets),
        );
        let source = vec![
            ResourceDeclaration::new("usergroup", "acme/oncall"),
            ResourceDeclaration::new("usergroup", "acme/sre"),
        ];

        let created = svc
            .create_task_from_source(&source, false, Some("usergroup.sre"))
            .unwrap();
        assert_eq!(created.status_code, 202);

        let done = svc
            .get_task_status(&created.body.task_id.to_string(), Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(done.body.applied_count, Some(1));
        let live: Vec<_> = adapter.snapshot().into_keys().map(|k| k.id).collect();
        assert_eq!(live, vec!["acme/sre".to_string()]);
    }

    #[test]
    fn test_unreadable_source_is_rejected_before_queueing() {
        struct Offline;
        impl DesiredStateSource for Offline {
            fn load(&self) -> anyhow::Result<Vec<ResourceDeclaration>> {
                anyhow::bail!("config repository unreachable")
            }
        }

        let svc = service(Arc::new(InMemoryAdapter::new()));
        let err = svc.create_task_from_source(&Offline, true, None).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(err.to_string().contains("config repository unreachable"));
        assert!(svc.runner().store().is_empty());
    }

    #[test]
    fn test_target_field_is_optional() {
        let request: CreateTaskRequest =
            serde_json::from_str(r#"{"desired_state": [], "target": "usergroup"}"#).unwrap();
        assert_eq!(request.target.as_deref(), Some("usergroup"));

        let body = serde_json::to_value(CreateTaskRequest::new(Vec::new())).unwrap();
        assert!(body.get("target").is_none());
    }
}
