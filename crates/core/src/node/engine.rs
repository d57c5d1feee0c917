//! Admission, dispatch and retry: the execution half of the node.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::messages::{MessagePriority, PeerMessage};
use crate::retry::RetryDecision;
use crate::task::{AddTaskOutcome, RejectReason, TaskContext, TaskEntry, TaskOptions, TaskPriority};

use super::core::NodeActor;
use super::help::HelpResponder;
use super::{Command, NodeEvent, QUEUE_FULL};

impl NodeActor {
    /// Queued entries, entries waiting out a retry backoff and entries in an
    /// unsettled batch send together stay under `max_queue`.
    pub(super) fn has_capacity(&self) -> bool {
        self.queue.len() + self.retries_pending + self.offloading < self.config.max_queue
    }

    pub(super) fn add_task(
        &mut self,
        payload: Value,
        options: TaskOptions,
        respond_to: oneshot::Sender<AddTaskOutcome>,
    ) {
        if self.shutting_down {
            let _ = respond_to.send(AddTaskOutcome::Rejected {
                reason: RejectReason::ShuttingDown,
            });
            return;
        }

        if !self.has_capacity() {
            warn!(
                node = %self.config.name,
                queue = self.queue.len(),
                retries_pending = self.retries_pending,
                offloading = self.offloading,
                "queue full, rejecting task"
            );
            // The caller hears back once the help attempt has settled.
            self.request_help(QUEUE_FULL, HelpResponder::Admission(respond_to));
            return;
        }

        let max_attempts = options.max_attempts.unwrap_or(self.config.max_attempts);
        let mut entry = TaskEntry::new(payload, options.priority, max_attempts)
            .with_reply_to(options.callback);
        if let Some(task_id) = options.task_id {
            entry = entry.with_id(task_id);
        }
        let task_id = entry.task_id.clone();

        debug!(node = %self.config.name, task_id = %task_id, priority = %entry.priority, "task queued");
        self.queue.enqueue(entry);
        self.last_active = chrono::Utc::now();
        self.drain();

        let _ = respond_to.send(AddTaskOutcome::Accepted { task_id });
    }

    /// Start queued entries while slots are free.
    pub(super) fn drain(&mut self) {
        while self.processing < self.config.max_concurrent {
            let Some(entry) = self.queue.pop_front() else {
                break;
            };
            self.dispatch(entry);
        }
    }

    fn dispatch(&mut self, mut entry: TaskEntry) {
        let Some(tx) = self.tx.upgrade() else {
            warn!(node = %self.config.name, task_id = %entry.task_id, "no handles left, dropping task");
            return;
        };

        entry.attempts += 1;
        self.processing += 1;
        debug!(
            node = %self.config.name,
            task_id = %entry.task_id,
            attempt = entry.attempts,
            processing = self.processing,
            "dispatching task"
        );

        let processor = Arc::clone(&self.processor);
        let ctx = TaskContext {
            task_id: entry.task_id.clone(),
            reply_to: entry.reply_to.clone(),
            attempt: entry.attempts,
        };
        let payload = entry.payload.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            // A panicking processor must not leak the slot.
            let outcome = match tokio::spawn(async move { processor.process_task(payload, ctx).await }).await {
                Ok(outcome) => outcome,
                Err(e) => Err(format!("task panicked: {e}")),
            };
            let elapsed = started.elapsed();
            let _ = tx
                .send(Command::Finished {
                    entry,
                    outcome,
                    elapsed,
                })
                .await;
        });
    }

    pub(super) fn on_finished(&mut self, entry: TaskEntry, outcome: Result<Value, String>, elapsed: Duration) {
        self.processing = self.processing.saturating_sub(1);
        self.last_active = chrono::Utc::now();
        self.metrics.record(elapsed);

        match outcome {
            Ok(result) => {
                self.total_processed += 1;
                debug!(
                    node = %self.config.name,
                    task_id = %entry.task_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "task completed"
                );
                if let Some(reply_to) = &entry.reply_to {
                    self.send(
                        reply_to,
                        PeerMessage::TaskComplete {
                            task_id: entry.task_id.clone(),
                            result: result.clone(),
                        },
                        MessagePriority::Normal,
                    );
                }
                self.emit(NodeEvent::TaskCompleted {
                    task_id: entry.task_id,
                    result,
                });
            }
            Err(err) => {
                self.total_errors += 1;
                self.schedule_retry(entry, err);
            }
        }

        self.drain();
    }

    fn schedule_retry(&mut self, entry: TaskEntry, err: String) {
        match self.retry.decide(entry.attempts, entry.max_attempts) {
            RetryDecision::Retry(delay) => {
                let Some(tx) = self.tx.upgrade() else {
                    self.report_terminal(entry, err);
                    return;
                };
                warn!(
                    node = %self.config.name,
                    task_id = %entry.task_id,
                    attempt = entry.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "task failed, retrying"
                );
                self.retries_pending += 1;
                self.emit(NodeEvent::TaskRetrying {
                    task_id: entry.task_id.clone(),
                    attempts: entry.attempts,
                    delay,
                });
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Command::RetryDue { entry }).await;
                });
            }
            RetryDecision::Exhausted => self.report_terminal(entry, err),
        }
    }

    pub(super) fn on_retry_due(&mut self, entry: TaskEntry) {
        self.retries_pending = self.retries_pending.saturating_sub(1);
        debug!(node = %self.config.name, task_id = %entry.task_id, "retry due");
        self.queue.requeue_front(entry);
        self.drain();
    }

    /// Out of attempts: tell the orchestrator, and the origin node for offloaded work.
    fn report_terminal(&mut self, entry: TaskEntry, err: String) {
        error!(
            node = %self.config.name,
            task_id = %entry.task_id,
            attempts = entry.attempts,
            error = %err,
            "task failed permanently"
        );
        let message = PeerMessage::TaskFailed {
            task_id: entry.task_id.clone(),
            error: err.clone(),
            attempts: entry.attempts,
        };
        let orchestrator = self.config.orchestrator.clone();
        self.send(&orchestrator, message.clone(), MessagePriority::Normal);
        if let Some(reply_to) = entry.reply_to.as_deref() {
            if reply_to != orchestrator {
                self.send(reply_to, message, MessagePriority::Normal);
            }
        }
        self.emit(NodeEvent::TaskFailed {
            task_id: entry.task_id,
            error: err,
            attempts: entry.attempts,
        });
    }

    /// Admit tasks shipped by an overloaded peer. They run at the lowest band
    /// and report back to `callback`.
    pub(super) fn accept_batch(&mut self, tasks: Vec<crate::messages::BatchTask>, callback: String) {
        let offered = tasks.len();
        let mut accepted = 0usize;
        for task in tasks {
            if self.shutting_down || !self.has_capacity() {
                self.send(
                    &callback,
                    PeerMessage::TaskFailed {
                        task_id: task.task_id,
                        error: QUEUE_FULL.to_string(),
                        attempts: 0,
                    },
                    MessagePriority::Normal,
                );
                continue;
            }
            let entry = TaskEntry::new(task.payload, TaskPriority::Low, self.config.max_attempts)
                .with_id(task.task_id)
                .with_reply_to(Some(callback.clone()));
            self.queue.enqueue(entry);
            accepted += 1;
        }
        info!(node = %self.config.name, from = %callback, offered, accepted, "accepted task batch");
        if accepted > 0 {
            self.last_active = chrono::Utc::now();
        }
        self.drain();
    }

    /// A batch never reached its helper: put the entries back where they were.
    /// Their slots were held while the send was pending, so this cannot overfill.
    pub(super) fn on_batch_undelivered(&mut self, entries: Vec<TaskEntry>) {
        warn!(node = %self.config.name, count = entries.len(), "batch undelivered, requeueing");
        self.offloading = self.offloading.saturating_sub(entries.len());
        for entry in entries.into_iter().rev() {
            self.outstanding.remove(&entry.task_id);
            self.queue.requeue_front(entry);
        }
        self.drain();
    }
}
