use tracing::{debug, info, warn};

use crate::messages::{Envelope, MessagePriority, PeerMessage};

use super::core::NodeActor;
use super::help::RELEASED;
use super::{NodeEvent, RouteOutcome};

impl NodeActor {
    /// Dispatch one inbound message by kind. Never fails; problems come back
    /// as a non-success [`RouteOutcome`].
    pub(super) fn route(&mut self, envelope: Envelope) -> RouteOutcome {
        let message = match envelope.message() {
            Ok(message) => message,
            Err(e) => {
                warn!(node = %self.config.name, from = %envelope.from, kind = %envelope.kind, error = %e, "malformed message");
                return RouteOutcome::Rejected {
                    kind: envelope.kind,
                    reason: e.to_string(),
                };
            }
        };
        let from = envelope.from;
        debug!(node = %self.config.name, from = %from, kind = message.kind(), "routing message");

        match message {
            PeerMessage::HelpAvailable { clones } => {
                if self.shutting_down {
                    return declined("shutting_down");
                }
                self.add_helpers(clones);
                self.distribute_work();
                RouteOutcome::Ack
            }
            PeerMessage::CloneReady {} => {
                if self.shutting_down {
                    return declined("shutting_down");
                }
                self.add_helpers([from]);
                RouteOutcome::Ack
            }
            PeerMessage::TaskComplete { task_id, result } => {
                self.processor.process_helper_result(&task_id, &result, &from);
                self.total_processed += 1;
                self.last_active = chrono::Utc::now();
                let report = PeerMessage::TaskComplete {
                    task_id: task_id.clone(),
                    result,
                };
                self.settle_offload(&task_id, report);
                RouteOutcome::Ack
            }
            PeerMessage::TaskBatch { tasks, callback } => {
                self.accept_batch(tasks, callback);
                RouteOutcome::Ack
            }
            PeerMessage::StatusCheck {} => RouteOutcome::Status(Box::new(self.status())),
            PeerMessage::Release {} => {
                let dropped = self.queue.drain();
                info!(node = %self.config.name, from = %from, dropped = dropped.len(), "released, backlog cleared");
                for entry in dropped {
                    if let Some(reply_to) = &entry.reply_to {
                        self.send(
                            reply_to,
                            PeerMessage::TaskFailed {
                                task_id: entry.task_id.clone(),
                                error: RELEASED.to_string(),
                                attempts: entry.attempts,
                            },
                            MessagePriority::Normal,
                        );
                    }
                }
                RouteOutcome::Ack
            }
            PeerMessage::HelpRequest {
                reason, callback, ..
            } => {
                if self.shutting_down {
                    return declined("shutting_down");
                }
                if self.load().is_overloaded {
                    return declined("overloaded");
                }
                info!(node = %self.config.name, peer = %callback, reason = %reason, "offering help");
                let name = self.config.name.clone();
                self.send(
                    &callback,
                    PeerMessage::HelpAvailable { clones: vec![name] },
                    MessagePriority::Normal,
                );
                RouteOutcome::Ack
            }
            PeerMessage::TaskFailed {
                task_id,
                error,
                attempts,
            } => {
                warn!(node = %self.config.name, from = %from, task_id = %task_id, attempts, error = %error, "peer reported task failure");
                let report = PeerMessage::TaskFailed {
                    task_id: task_id.clone(),
                    error: error.clone(),
                    attempts,
                };
                self.settle_offload(&task_id, report);
                self.emit(NodeEvent::PeerTaskFailed { task_id, error, from });
                RouteOutcome::Ack
            }
            PeerMessage::Custom { kind, payload } => {
                match self.processor.handle_custom_message(&kind, &payload, &from) {
                    Some(reply) => RouteOutcome::Custom(reply),
                    None => {
                        debug!(node = %self.config.name, kind = %kind, "unknown message type");
                        RouteOutcome::Unknown { kind }
                    }
                }
            }
        }
    }
}

fn declined(reason: &str) -> RouteOutcome {
    RouteOutcome::Declined {
        reason: reason.to_string(),
    }
}
