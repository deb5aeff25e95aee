use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Causes that trigger an evaluation, recorded for diagnostics only.
pub mod trigger {
    pub const JOB_REGISTER: &str = "job-register";
    pub const JOB_CANCEL: &str = "job-cancel";
    pub const JOB_UPDATE: &str = "job-update";
    pub const JOB_TIMEOUT: &str = "job-timeout";
    pub const EXEC_FAILURE: &str = "exec-failure";
    pub const EXEC_UPDATE: &str = "exec-update";
    pub const NODE_JOIN: &str = "node-join";
    pub const NODE_LEAVE: &str = "node-leave";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvalStatus {
    Pending,
    Blocked,
    Complete,
    Failed,
    Canceled,
}

impl std::fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalStatus::Pending => write!(f, "pending"),
            EvalStatus::Blocked => write!(f, "blocked"),
            EvalStatus::Complete => write!(f, "complete"),
            EvalStatus::Failed => write!(f, "failed"),
            EvalStatus::Canceled => write!(f, "canceled"),
        }
    }
}

/// A request for the scheduler to reassess a job: whether additional
/// instances must be placed or existing ones stopped. Triggers stay
/// lightweight and submit an evaluation on every state change; the scheduler
/// may conclude that no action is needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: String,
    pub namespace: String,
    pub job_id: String,
    /// Root cause that triggered the evaluation, see [`trigger`].
    pub triggered_by: String,
    /// Higher priority evaluations are dequeued first.
    pub priority: i64,
    /// Names the scheduler class that may claim this evaluation.
    pub job_type: String,
    pub status: EvalStatus,
    pub comment: String,
    /// If set, the evaluation is held back until this instant, used for
    /// redelivery backoff and deferred admission.
    pub wait_until: Option<DateTime<Utc>>,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
}

impl Evaluation {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            namespace: String::new(),
            job_id: String::new(),
            triggered_by: String::new(),
            priority: 0,
            job_type: String::new(),
            status: EvalStatus::Pending,
            comment: String::new(),
            wait_until: None,
            create_time: now,
            modify_time: now,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = job_type.into();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_triggered_by(mut self, triggered_by: impl Into<String>) -> Self {
        self.triggered_by = triggered_by.into();
        self
    }

    pub fn with_wait_until(mut self, wait_until: DateTime<Utc>) -> Self {
        self.wait_until = Some(wait_until);
        self
    }

    /// The (job, namespace) pair within which evaluations serialize.
    pub fn namespaced_id(&self) -> NamespacedId {
        NamespacedId {
            job_id: self.job_id.clone(),
            namespace: self.namespace.clone(),
        }
    }

    /// Whether this evaluation belongs in the broker. Terminal and blocked
    /// evaluations stay out.
    pub fn should_enqueue(&self) -> bool {
        matches!(self.status, EvalStatus::Pending)
    }

    pub fn terminal_status(&self) -> bool {
        matches!(
            self.status,
            EvalStatus::Complete | EvalStatus::Failed | EvalStatus::Canceled
        )
    }
}

impl Default for Evaluation {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Evaluation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<Evaluation {:?} JobID: {:?} Namespace: {:?}>",
            self.id, self.job_id, self.namespace
        )
    }
}

impl crate::collections::ScheduledTask for Evaluation {
    fn task_id(&self) -> &str {
        &self.id
    }

    // Only evaluations with a wait time enter the delay heap; creation time
    // is a stable fallback.
    fn wait_until(&self) -> DateTime<Utc> {
        self.wait_until.unwrap_or(self.create_time)
    }
}

/// Scope key for per-job serialization: at most one evaluation per
/// `NamespacedId` may be ready or inflight at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespacedId {
    pub job_id: String,
    pub namespace: String,
}

impl std::fmt::Display for NamespacedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.job_id)
    }
}

/// An evaluation paired with the receipt handle of its current delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReceipt {
    pub evaluation: Evaluation,
    pub receipt_handle: String,
}
