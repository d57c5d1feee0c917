//! Help protocol and work distribution.
//!
//! An overloaded node asks the broker for peers of its capability, sends
//! `help_request` to those that accept, and once helpers confirm with
//! `help_available` ships its backlog to them in `task_batch` messages.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::load::clones_needed;
use crate::messages::{BatchTask, Envelope, HelpQuery, HelpResponse, MessagePriority, PeerMessage};
use crate::task::{AddTaskOutcome, RejectReason, TaskEntry};

use super::core::NodeActor;
use super::{Command, HelpOutcome, NodeEvent};

/// Help reason used when admission finds the queue full.
pub const QUEUE_FULL: &str = "queue_full";

/// Help reason used by the load monitor.
pub const PERIODIC_OVERLOAD_CHECK: &str = "periodic_overload_check";

/// `task_failed` error for queued work dropped by a `release`.
pub const RELEASED: &str = "released";

/// `task_failed` error for offloaded work whose helper never reported back.
pub const OFFLOAD_TIMED_OUT: &str = "offload_timed_out";

/// A task shipped to a helper and not yet reported back.
#[derive(Debug)]
pub(super) struct Offload {
    pub(super) helper: String,
    /// The submitter's callback, which the helper's report is relayed to.
    pub(super) reply_to: Option<String>,
    pub(super) deadline: Instant,
}

/// Who is waiting on a help solicitation.
pub(crate) enum HelpResponder {
    Caller(oneshot::Sender<HelpOutcome>),
    /// A rejected `add_task`; answered with `QueueFull` whatever the outcome.
    Admission(oneshot::Sender<AddTaskOutcome>),
    Monitor,
}

impl HelpResponder {
    fn respond(self, outcome: HelpOutcome) {
        match self {
            Self::Caller(tx) => {
                let _ = tx.send(outcome);
            }
            Self::Admission(tx) => {
                let _ = tx.send(AddTaskOutcome::Rejected {
                    reason: RejectReason::QueueFull,
                });
            }
            Self::Monitor => {}
        }
    }
}

impl NodeActor {
    /// Solicit helpers unless some are already engaged or a solicitation is under way.
    pub(super) fn request_help(&mut self, reason: &str, responder: HelpResponder) {
        if self.shutting_down {
            responder.respond(HelpOutcome::ShuttingDown);
            return;
        }
        if !self.helpers.is_empty() {
            debug!(node = %self.config.name, "helpers already engaged");
            responder.respond(HelpOutcome::HelpersPresent);
            return;
        }
        if self.help_in_flight {
            responder.respond(HelpOutcome::InFlight);
            return;
        }
        let Some(tx) = self.tx.upgrade() else {
            responder.respond(HelpOutcome::NoHelpers);
            return;
        };

        let load = self.load();
        let query = HelpQuery {
            reason: reason.to_string(),
            load: load.overall,
            queue_size: self.queue.len(),
            needed_clones: clones_needed(self.queue.len(), self.config.helper_clone_limit),
            task_type: self.config.capability.clone(),
            capabilities: self.config.capabilities.clone(),
        };
        info!(
            node = %self.config.name,
            reason,
            queue = query.queue_size,
            load = query.load,
            needed_clones = query.needed_clones,
            "requesting help"
        );

        self.help_in_flight = true;
        let solicitation = Solicitation {
            broker: Arc::clone(&self.broker),
            name: self.config.name.clone(),
            capability: self.config.capability.clone(),
            reason: reason.to_string(),
            max_helpers: self.config.max_helpers,
        };
        tokio::spawn(async move {
            let outcome = solicitation.run(query).await;
            // Clear the guard before anyone waiting on the outcome can ask again.
            let _ = tx.send(Command::HelpSettled).await;
            responder.respond(outcome);
        });
    }

    /// Answer a peer's capacity query from current load.
    pub(super) fn answer_help_query(&self, query: &HelpQuery) -> HelpResponse {
        let load = self.load();
        let success = !self.shutting_down && !load.is_overloaded;
        debug!(
            node = %self.config.name,
            reason = %query.reason,
            asker_load = query.load,
            success,
            "answering help query"
        );
        HelpResponse {
            success,
            load: load.overall,
            queue_size: self.queue.len(),
            available_slots: self.config.max_concurrent.saturating_sub(self.processing),
        }
    }

    /// Add confirmed helpers, skipping ourselves and duplicates. Returns whether the set grew.
    pub(super) fn add_helpers<I>(&mut self, names: I) -> bool
    where
        I: IntoIterator<Item = String>,
    {
        let mut grew = false;
        for name in names {
            if name == self.config.name {
                continue;
            }
            grew |= self.helpers.insert(name);
        }
        if grew {
            info!(node = %self.config.name, helpers = self.helpers.len(), "helpers engaged");
            self.emit(NodeEvent::HelpersChanged {
                helpers: self.helpers.iter().cloned().collect(),
            });
        }
        grew
    }

    /// Split the backlog into `ceil(queue / helpers)` slices from the head and
    /// ship one slice per helper. Returns how many tasks left the queue.
    pub(super) fn distribute_work(&mut self) -> usize {
        if self.helpers.is_empty() || self.queue.is_empty() {
            return 0;
        }
        let per_helper = self.queue.len().div_ceil(self.helpers.len());
        let helpers: Vec<String> = self.helpers.iter().cloned().collect();
        let deadline = Instant::now() + self.config.offload_timeout();

        let mut moved = 0;
        for helper in helpers {
            if self.queue.is_empty() {
                break;
            }
            let entries = self.queue.take_front(per_helper);
            moved += entries.len();
            self.offloading += entries.len();
            for entry in &entries {
                self.outstanding.insert(
                    entry.task_id.clone(),
                    Offload {
                        helper: helper.clone(),
                        reply_to: entry.reply_to.clone(),
                        deadline,
                    },
                );
            }
            self.send_batch(&helper, entries);
        }

        info!(
            node = %self.config.name,
            moved,
            helpers = self.helpers.len(),
            per_helper,
            "distributed backlog"
        );
        moved
    }

    fn send_batch(&self, helper: &str, entries: Vec<TaskEntry>) {
        let message = PeerMessage::TaskBatch {
            tasks: entries
                .iter()
                .map(|e| BatchTask {
                    task_id: e.task_id.clone(),
                    payload: e.payload.clone(),
                    priority: e.priority,
                })
                .collect(),
            callback: self.config.name.clone(),
        };
        let envelope = Envelope::new(&self.config.name, helper, &message)
            .map(|e| e.with_priority(MessagePriority::High));
        let broker = Arc::clone(&self.broker);
        let tx = self.tx.upgrade();
        let helper = helper.to_string();

        tokio::spawn(async move {
            let result = match envelope {
                Ok(envelope) => broker.send_message(envelope).await,
                Err(e) => Err(e.into()),
            };
            let command = match result {
                Ok(()) => Command::BatchDelivered {
                    count: entries.len(),
                },
                Err(e) => {
                    warn!(helper = %helper, count = entries.len(), error = %e, "task batch not delivered");
                    Command::BatchUndelivered { entries }
                }
            };
            if let Some(tx) = tx {
                let _ = tx.send(command).await;
            }
        });
    }

    /// A helper's report on offloaded work: settle it and relay it to the
    /// submitter's callback. Reports for ids we never offloaded are not relayed.
    pub(super) fn settle_offload(&mut self, task_id: &str, report: PeerMessage) {
        let Some(offload) = self.outstanding.remove(task_id) else {
            return;
        };
        if let Some(reply_to) = offload.reply_to {
            self.send(&reply_to, report, MessagePriority::Normal);
        }
    }

    /// Give up on offloads whose helper has been silent past the deadline.
    pub(super) fn expire_offloads(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .outstanding
            .iter()
            .filter(|(_, offload)| offload.deadline <= now)
            .map(|(task_id, _)| task_id.clone())
            .collect();
        for task_id in expired {
            let Some(offload) = self.outstanding.remove(&task_id) else {
                continue;
            };
            warn!(node = %self.config.name, task_id = %task_id, helper = %offload.helper, "offloaded task timed out");
            if let Some(reply_to) = &offload.reply_to {
                self.send(
                    reply_to,
                    PeerMessage::TaskFailed {
                        task_id: task_id.clone(),
                        error: OFFLOAD_TIMED_OUT.to_string(),
                        attempts: 0,
                    },
                    MessagePriority::Normal,
                );
            }
            self.emit(NodeEvent::PeerTaskFailed {
                task_id,
                error: OFFLOAD_TIMED_OUT.to_string(),
                from: offload.helper,
            });
        }
    }

    /// Send `release` to every helper and forget them.
    pub(super) fn release_helpers(&mut self) {
        let helpers: Vec<String> = self.helpers.drain(..).collect();
        if helpers.is_empty() {
            return;
        }
        info!(node = %self.config.name, helpers = helpers.len(), "releasing helpers");
        for helper in &helpers {
            self.send(helper, PeerMessage::Release {}, MessagePriority::Normal);
        }
        self.emit(NodeEvent::HelpersChanged { helpers: Vec::new() });
    }
}

/// One help round: query peers, then contact those that accept.
struct Solicitation {
    broker: Arc<dyn Broker>,
    name: String,
    capability: String,
    reason: String,
    max_helpers: usize,
}

impl Solicitation {
    async fn run(self, query: HelpQuery) -> HelpOutcome {
        let replies = match self
            .broker
            .request_help(&self.name, &self.capability, query)
            .await
        {
            Ok(replies) => replies,
            Err(e) => {
                warn!(node = %self.name, error = %e, "help query failed");
                return HelpOutcome::NoHelpers;
            }
        };

        let accepting: Vec<String> = replies
            .into_iter()
            .filter(|r| r.res.success && r.from != self.name)
            .map(|r| r.from)
            .collect();
        if accepting.is_empty() {
            info!(node = %self.name, "no peers available to help");
            return HelpOutcome::NoHelpers;
        }

        let mut contacted = Vec::new();
        for peer in accepting.into_iter().take(self.max_helpers) {
            let message = PeerMessage::HelpRequest {
                reason: self.reason.clone(),
                needed_clones: 1,
                callback: self.name.clone(),
            };
            match Envelope::new(&self.name, &peer, &message) {
                Ok(envelope) => {
                    if let Err(e) = self.broker.send_message(envelope).await {
                        warn!(node = %self.name, peer = %peer, error = %e, "help request not delivered");
                    }
                }
                Err(e) => warn!(node = %self.name, error = %e, "failed to encode help request"),
            }
            contacted.push(peer);
        }

        info!(node = %self.name, helpers = ?contacted, "help requested");
        HelpOutcome::Requested { helpers: contacted }
    }
}
