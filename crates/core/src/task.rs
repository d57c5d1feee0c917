use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Queue band. Lower band rank is dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High = 0,
    #[default]
    Normal = 1,
    Low = 2,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// One queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub task_id: String,
    /// Opaque task body, handed to [`TaskProcessor::process_task`] untouched.
    pub payload: Value,
    pub priority: TaskPriority,
    pub added_at: DateTime<Utc>,
    /// Execution attempts so far; bumped at dispatch.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Remote node notified with `task_complete` on success.
    pub reply_to: Option<String>,
}

impl TaskEntry {
    pub fn new(payload: Value, priority: TaskPriority, max_attempts: u32) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            payload,
            priority,
            added_at: Utc::now(),
            attempts: 0,
            max_attempts,
            reply_to: None,
        }
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_reply_to(mut self, reply_to: Option<String>) -> Self {
        self.reply_to = reply_to;
        self
    }
}

/// Caller-supplied options for `add_task`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOptions {
    #[serde(default)]
    pub priority: TaskPriority,
    /// Generated when absent.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Node to notify with `task_complete`.
    #[serde(default)]
    pub callback: Option<String>,
    /// Overrides the node's default attempt budget.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl TaskOptions {
    pub fn priority(priority: TaskPriority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_callback(mut self, callback: impl Into<String>) -> Self {
        self.callback = Some(callback.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Why admission refused a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    QueueFull,
    ShuttingDown,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull => f.write_str("queue_full"),
            Self::ShuttingDown => f.write_str("shutting_down"),
        }
    }
}

/// Structured result of `add_task`; admission failure is never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AddTaskOutcome {
    Accepted { task_id: String },
    Rejected { reason: RejectReason },
}

impl AddTaskOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Accepted { task_id } => Some(task_id),
            Self::Rejected { .. } => None,
        }
    }
}

/// Execution context passed alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub task_id: String,
    pub reply_to: Option<String>,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
}

/// The task body executor a node dispatches to.
///
/// `process_task` may take arbitrarily long; the node imposes no timeout.
/// The remaining hooks run on the node's own control loop and must not block.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Execute one task. An `Err` counts as a failed attempt.
    async fn process_task(&self, payload: Value, ctx: TaskContext) -> Result<Value, String>;

    /// Aggregate a result a helper sent back for offloaded work.
    fn process_helper_result(&self, _task_id: &str, _result: &Value, _from: &str) {}

    /// Handle a message type the router does not know.
    ///
    /// Returning `None` reports the type as unknown.
    fn handle_custom_message(&self, _kind: &str, _payload: &Value, _from: &str) -> Option<Value> {
        None
    }

    /// Custom message types the node should subscribe to.
    fn custom_kinds(&self) -> Vec<String> {
        Vec::new()
    }
}
