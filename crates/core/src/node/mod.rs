//! The dendrite node: a single-writer actor plus a cloneable handle.
//!
//! The actor task exclusively owns the queue, the helper set and all
//! counters. Everything else, including executions, retry timers, help
//! queries and message sends, runs in spawned tasks that report back
//! through the actor's mailbox, so state is only ever touched by one task.

mod core;
mod engine;
mod help;
mod router;


use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::info;

use crate::broker::{Broker, NodeMeta};
use crate::config::NodeConfig;
use crate::error::DendriteError;
use crate::load::{LoadSnapshot, NodePhase};
use crate::messages::{Envelope, HelpQuery, HelpResponse, BUILTIN_KINDS};
use crate::metrics::MetricsSnapshot;
use crate::task::{AddTaskOutcome, TaskEntry, TaskOptions, TaskProcessor};

use self::core::NodeActor;

pub use help::{OFFLOAD_TIMED_OUT, PERIODIC_OVERLOAD_CHECK, QUEUE_FULL, RELEASED};

const MAILBOX_CAPACITY: usize = 1024;
const EVENT_CAPACITY: usize = 256;

// ── Public result types ──────────────────────────────────────────────

/// Result of a help solicitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HelpOutcome {
    /// Helpers are already engaged; nothing was sent.
    HelpersPresent,
    /// A solicitation is already under way; nothing was sent.
    InFlight,
    /// `help_request` went out to these peers.
    Requested { helpers: Vec<String> },
    /// No peer accepted the query.
    NoHelpers,
    ShuttingDown,
}

impl HelpOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::HelpersPresent | Self::InFlight | Self::Requested { .. }
        )
    }
}

/// Result of routing one inbound message. Never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Ack,
    Status(Box<NodeStatus>),
    /// Reply from the processor's custom-message hook.
    Custom(Value),
    /// Understood but refused in the current state.
    Declined { reason: String },
    /// Known kind whose payload did not decode.
    Rejected { kind: String, reason: String },
    Unknown { kind: String },
}

impl RouteOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ack | Self::Status(_) | Self::Custom(_))
    }
}

/// Local notifications published by a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    TaskCompleted { task_id: String, result: Value },
    TaskRetrying { task_id: String, attempts: u32, delay: Duration },
    TaskFailed { task_id: String, error: String, attempts: u32 },
    HelpersChanged { helpers: Vec<String> },
    /// A helper reported terminal failure of work it took from us.
    PeerTaskFailed { task_id: String, error: String, from: String },
}

/// Node bookkeeping as seen from outside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub queue_size: usize,
    pub processing: usize,
    pub max_concurrent: usize,
    pub max_queue: usize,
    pub helpers: Vec<String>,
    pub total_processed: u64,
    pub total_errors: u64,
    pub retries_pending: usize,
    /// Entries in a `task_batch` whose send has not settled.
    pub offloading: usize,
    pub outstanding_offloads: usize,
    pub start_time: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: String,
    pub phase: NodePhase,
    pub state: StateSnapshot,
    pub metrics: MetricsSnapshot,
    pub load: LoadSnapshot,
    pub uptime_ms: u64,
}

// ── Commands ─────────────────────────────────────────────────────────

pub(crate) enum Command {
    AddTask {
        payload: Value,
        options: TaskOptions,
        respond_to: oneshot::Sender<AddTaskOutcome>,
    },
    RequestHelp {
        reason: String,
        respond_to: oneshot::Sender<HelpOutcome>,
    },
    DistributeWork {
        respond_to: oneshot::Sender<usize>,
    },
    Status {
        respond_to: oneshot::Sender<NodeStatus>,
    },
    Inbound {
        envelope: Envelope,
        respond_to: Option<oneshot::Sender<RouteOutcome>>,
    },
    HelpQuery {
        query: HelpQuery,
        respond_to: oneshot::Sender<HelpResponse>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
    // Reports from spawned work.
    Finished {
        entry: TaskEntry,
        outcome: Result<Value, String>,
        elapsed: Duration,
    },
    RetryDue {
        entry: TaskEntry,
    },
    HelpSettled,
    BatchDelivered {
        count: usize,
    },
    BatchUndelivered {
        entries: Vec<TaskEntry>,
    },
}

// ── Handle ───────────────────────────────────────────────────────────

/// Cloneable handle to a running node.
///
/// Every call goes through the node's mailbox; it fails only with
/// [`DendriteError::NodeStopped`] once the node is gone.
#[derive(Clone)]
pub struct DendriteHandle {
    name: Arc<str>,
    tx: mpsc::Sender<Command>,
    events: broadcast::Sender<NodeEvent>,
}

impl std::fmt::Debug for DendriteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DendriteHandle").field("name", &self.name).finish()
    }
}

impl DendriteHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit a task. A full queue first triggers a `queue_full` help request.
    pub async fn add_task(&self, payload: Value, options: TaskOptions) -> Result<AddTaskOutcome, DendriteError> {
        self.request(|respond_to| Command::AddTask {
            payload,
            options,
            respond_to,
        })
        .await
    }

    pub async fn request_help(&self, reason: impl Into<String>) -> Result<HelpOutcome, DendriteError> {
        let reason = reason.into();
        self.request(|respond_to| Command::RequestHelp { reason, respond_to })
            .await
    }

    /// Offload the local backlog across current helpers; returns how many tasks moved.
    pub async fn distribute_work(&self) -> Result<usize, DendriteError> {
        self.request(|respond_to| Command::DistributeWork { respond_to })
            .await
    }

    pub async fn status(&self) -> Result<NodeStatus, DendriteError> {
        self.request(|respond_to| Command::Status { respond_to }).await
    }

    /// Route an inbound message and wait for the outcome.
    pub async fn deliver(&self, envelope: Envelope) -> Result<RouteOutcome, DendriteError> {
        self.request(|respond_to| Command::Inbound {
            envelope,
            respond_to: Some(respond_to),
        })
        .await
    }

    /// Hand an inbound message to the node without waiting for it to be routed.
    pub async fn post(&self, envelope: Envelope) -> Result<(), DendriteError> {
        self.tx
            .send(Command::Inbound {
                envelope,
                respond_to: None,
            })
            .await
            .map_err(|_| self.stopped())
    }

    /// Answer a peer's capacity query.
    pub async fn answer_help_query(&self, query: HelpQuery) -> Result<HelpResponse, DendriteError> {
        self.request(|respond_to| Command::HelpQuery { query, respond_to })
            .await
    }

    /// Stop the load monitor and release all helpers. Idempotent.
    ///
    /// In-flight executions are not aborted.
    pub async fn shutdown(&self) -> Result<(), DendriteError> {
        self.request(|respond_to| Command::Shutdown { respond_to })
            .await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, DendriteError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).await.map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())
    }

    fn stopped(&self) -> DendriteError {
        DendriteError::NodeStopped(self.name.to_string())
    }
}

// ── Builder ──────────────────────────────────────────────────────────

/// Entry point for starting nodes.
pub struct Dendrite;

impl Dendrite {
    pub fn builder(config: NodeConfig) -> DendriteBuilder {
        DendriteBuilder {
            config,
            processor: None,
            broker: None,
        }
    }
}

/// Fluent builder for a node.
///
/// # Example
/// ```ignore
/// let handle = Dendrite::builder(NodeConfig::named("scraper-1"))
///     .processor(Arc::new(MyProcessor))
///     .broker(broker.clone())
///     .spawn()
///     .await?;
/// ```
pub struct DendriteBuilder {
    config: NodeConfig,
    processor: Option<Arc<dyn TaskProcessor>>,
    broker: Option<Arc<dyn Broker>>,
}

impl DendriteBuilder {
    pub fn processor(mut self, processor: Arc<dyn TaskProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Start the node actor, register it with the broker and subscribe its message kinds.
    pub async fn spawn(self) -> Result<DendriteHandle, DendriteError> {
        self.config.validate()?;
        let processor = self
            .processor
            .ok_or_else(|| DendriteError::Config("a task processor is required".into()))?;
        let broker = self
            .broker
            .ok_or_else(|| DendriteError::Config("a broker is required".into()))?;

        let name = self.config.name.clone();
        let meta = NodeMeta {
            name: name.clone(),
            capability: self.config.capability.clone(),
            capabilities: self.config.capabilities.clone(),
        };
        let custom_kinds = processor.custom_kinds();

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = DendriteHandle {
            name: Arc::from(name.as_str()),
            tx,
            events: events.clone(),
        };

        let actor = NodeActor::new(
            self.config,
            processor,
            Arc::clone(&broker),
            handle.tx.downgrade(),
            events,
        );
        tokio::spawn(actor.run(rx));

        broker.register(meta, handle.clone()).await?;
        for kind in BUILTIN_KINDS.iter().copied().chain(custom_kinds.iter().map(String::as_str)) {
            broker.subscribe(&name, kind).await?;
        }

        info!(node = %name, "node started");
        Ok(handle)
    }
}
