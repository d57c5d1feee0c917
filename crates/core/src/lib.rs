pub mod broker;
pub mod config;
pub mod error;
pub mod load;
pub mod messages;
pub mod metrics;
pub mod node;
pub mod queue;
pub mod retry;
pub mod task;

pub use broker::{Broker, LocalBroker, NodeMeta};
pub use config::NodeConfig;
pub use error::*;
pub use load::{LoadSnapshot, NodePhase};
pub use messages::{Envelope, HelpQuery, HelpReply, HelpResponse, MessagePriority, PeerMessage};
pub use metrics::MetricsSnapshot;
pub use node::{
    Dendrite, DendriteBuilder, DendriteHandle, HelpOutcome, NodeEvent, NodeStatus, RouteOutcome,
    StateSnapshot,
};
pub use queue::PriorityTaskQueue;
pub use retry::{RetryDecision, RetryPolicy};
pub use task::{
    AddTaskOutcome, RejectReason, TaskContext, TaskEntry, TaskOptions, TaskPriority, TaskProcessor,
};
