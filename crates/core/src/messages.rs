//! Peer message types exchanged between nodes through the broker.
//!
//! On the wire every message is an [`Envelope`] carrying a `kind` string and
//! a JSON payload. Known kinds decode into [`PeerMessage`] variants; anything
//! else becomes [`PeerMessage::Custom`] and is handed to the task processor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::task::TaskPriority;

// ── Kinds ────────────────────────────────────────────────────────────

pub const HELP_AVAILABLE: &str = "help_available";
pub const CLONE_READY: &str = "clone_ready";
pub const TASK_COMPLETE: &str = "task_complete";
pub const TASK_BATCH: &str = "task_batch";
pub const STATUS_CHECK: &str = "status_check";
pub const RELEASE: &str = "release";
pub const HELP_REQUEST: &str = "help_request";
pub const TASK_FAILED: &str = "task_failed";

/// Every kind the router handles natively.
pub const BUILTIN_KINDS: &[&str] = &[
    HELP_AVAILABLE,
    CLONE_READY,
    TASK_COMPLETE,
    TASK_BATCH,
    STATUS_CHECK,
    RELEASE,
    HELP_REQUEST,
    TASK_FAILED,
];

// ── Payloads ─────────────────────────────────────────────────────────

/// One task shipped inside a `task_batch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTask {
    pub task_id: String,
    pub payload: Value,
    /// Band the task had on the sending node; receivers demote to `low`.
    #[serde(default)]
    pub priority: TaskPriority,
}

/// Inbound and outbound peer traffic, one variant per message kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PeerMessage {
    /// A peer confirms it will take overflow; `clones` are the names to send work to.
    HelpAvailable { clones: Vec<String> },
    /// The sender itself is ready as a helper.
    CloneReady {},
    TaskComplete { task_id: String, result: Value },
    TaskBatch { tasks: Vec<BatchTask>, callback: String },
    StatusCheck {},
    /// Reclaim-capacity signal: drop the local backlog.
    Release {},
    HelpRequest {
        reason: String,
        needed_clones: usize,
        callback: String,
    },
    TaskFailed {
        task_id: String,
        error: String,
        attempts: u32,
    },
    /// Anything the router does not know natively.
    #[serde(skip)]
    Custom { kind: String, payload: Value },
}

impl PeerMessage {
    pub fn kind(&self) -> &str {
        match self {
            Self::HelpAvailable { .. } => HELP_AVAILABLE,
            Self::CloneReady {} => CLONE_READY,
            Self::TaskComplete { .. } => TASK_COMPLETE,
            Self::TaskBatch { .. } => TASK_BATCH,
            Self::StatusCheck {} => STATUS_CHECK,
            Self::Release {} => RELEASE,
            Self::HelpRequest { .. } => HELP_REQUEST,
            Self::TaskFailed { .. } => TASK_FAILED,
            Self::Custom { kind, .. } => kind,
        }
    }

    /// Split into `(kind, payload)` for the wire.
    pub fn to_wire(&self) -> Result<(String, Value), serde_json::Error> {
        if let Self::Custom { kind, payload } = self {
            return Ok((kind.clone(), payload.clone()));
        }
        let mut tagged = serde_json::to_value(self)?;
        let payload = tagged
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or_else(|| Value::Object(Default::default()));
        Ok((self.kind().to_string(), payload))
    }

    /// Rebuild from `(kind, payload)`. Unknown kinds become [`PeerMessage::Custom`];
    /// a known kind with a malformed payload is an error.
    pub fn from_wire(kind: &str, payload: Value) -> Result<Self, serde_json::Error> {
        if !BUILTIN_KINDS.contains(&kind) {
            return Ok(Self::Custom {
                kind: kind.to_string(),
                payload,
            });
        }
        let payload = if payload.is_null() {
            Value::Object(Default::default())
        } else {
            payload
        };
        serde_json::from_value(serde_json::json!({ "type": kind, "payload": payload }))
    }
}

// ── Envelope ─────────────────────────────────────────────────────────

/// Transport priority hint. Brokers may ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    High,
    #[default]
    Normal,
}

/// Addressed message as handed to and delivered by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub from: String,
    pub to: String,
    pub kind: String,
    pub payload: Value,
    #[serde(default)]
    pub priority: MessagePriority,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        message: &PeerMessage,
    ) -> Result<Self, serde_json::Error> {
        let (kind, payload) = message.to_wire()?;
        Ok(Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to: to.into(),
            kind,
            payload,
            priority: MessagePriority::Normal,
            sent_at: Utc::now(),
        })
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Decode the payload into a typed message.
    pub fn message(&self) -> Result<PeerMessage, serde_json::Error> {
        PeerMessage::from_wire(&self.kind, self.payload.clone())
    }
}

// ── Help query ───────────────────────────────────────────────────────

/// Capacity query fanned out by the broker to peers of the same type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpQuery {
    pub reason: String,
    pub load: f64,
    pub queue_size: usize,
    pub needed_clones: usize,
    pub task_type: String,
    pub capabilities: Vec<String>,
}

/// A peer's answer to a [`HelpQuery`]. `success` means it accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpResponse {
    pub success: bool,
    pub load: f64,
    pub queue_size: usize,
    pub available_slots: usize,
}

/// One respondent to a help query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelpReply {
    pub from: String,
    pub res: HelpResponse,
}
