use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::config::NodeConfig;
use crate::load::{LoadSnapshot, NodePhase};
use crate::messages::{Envelope, MessagePriority, PeerMessage};
use crate::metrics::NodeMetrics;
use crate::queue::PriorityTaskQueue;
use crate::retry::RetryPolicy;
use crate::task::TaskProcessor;

use super::help::{HelpResponder, Offload};
use super::{Command, NodeEvent, NodeStatus, StateSnapshot};

/// State owned by a node's control loop. Only [`NodeActor::run`] touches it.
pub(crate) struct NodeActor {
    pub(super) config: NodeConfig,
    pub(super) processor: Arc<dyn TaskProcessor>,
    pub(super) broker: Arc<dyn Broker>,
    /// Mailbox sender for spawned work to report back through.
    pub(super) tx: mpsc::WeakSender<Command>,
    pub(super) events: broadcast::Sender<NodeEvent>,
    pub(super) queue: PriorityTaskQueue,
    pub(super) retry: RetryPolicy,
    /// Peers currently absorbing overflow, in acquisition order.
    pub(super) helpers: IndexSet<String>,
    /// Tasks shipped to helpers and not yet reported back, by task id.
    pub(super) outstanding: HashMap<String, Offload>,
    pub(super) processing: usize,
    /// Failed entries waiting out their backoff; they hold queue capacity.
    pub(super) retries_pending: usize,
    /// Entries handed to a batch send that has not settled; they hold queue capacity.
    pub(super) offloading: usize,
    pub(super) total_processed: u64,
    pub(super) total_errors: u64,
    pub(super) metrics: NodeMetrics,
    pub(super) help_in_flight: bool,
    pub(super) shutting_down: bool,
    pub(super) started: Instant,
    pub(super) start_time: DateTime<Utc>,
    pub(super) last_active: DateTime<Utc>,
}

impl NodeActor {
    pub(crate) fn new(
        config: NodeConfig,
        processor: Arc<dyn TaskProcessor>,
        broker: Arc<dyn Broker>,
        tx: mpsc::WeakSender<Command>,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        let now = Utc::now();
        Self {
            retry: RetryPolicy::new(config.retry_delay_base()),
            config,
            processor,
            broker,
            tx,
            events,
            queue: PriorityTaskQueue::new(),
            helpers: IndexSet::new(),
            outstanding: HashMap::new(),
            processing: 0,
            retries_pending: 0,
            offloading: 0,
            total_processed: 0,
            total_errors: 0,
            metrics: NodeMetrics::default(),
            help_in_flight: false,
            shutting_down: false,
            started: Instant::now(),
            start_time: now,
            last_active: now,
        }
    }

    /// Control loop: mailbox commands interleaved with the load monitor tick.
    ///
    /// Exits once every handle and every spawned reporter is gone.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let period = self.config.monitor_interval();
        // First tick one full period after start, not immediately.
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = ticker.tick(), if !self.shutting_down => self.monitor_tick(),
            }
        }

        info!(node = %self.config.name, dropped = self.queue.len(), "node loop exited");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::AddTask {
                payload,
                options,
                respond_to,
            } => self.add_task(payload, options, respond_to),
            Command::RequestHelp { reason, respond_to } => {
                self.request_help(&reason, HelpResponder::Caller(respond_to));
            }
            Command::DistributeWork { respond_to } => {
                let moved = self.distribute_work();
                let _ = respond_to.send(moved);
            }
            Command::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            Command::Inbound {
                envelope,
                respond_to,
            } => {
                let outcome = self.route(envelope);
                if let Some(tx) = respond_to {
                    let _ = tx.send(outcome);
                }
            }
            Command::HelpQuery { query, respond_to } => {
                let _ = respond_to.send(self.answer_help_query(&query));
            }
            Command::Shutdown { respond_to } => self.shutdown(respond_to),
            Command::Finished {
                entry,
                outcome,
                elapsed,
            } => self.on_finished(entry, outcome, elapsed),
            Command::RetryDue { entry } => self.on_retry_due(entry),
            Command::HelpSettled => {
                self.help_in_flight = false;
            }
            Command::BatchDelivered { count } => {
                self.offloading = self.offloading.saturating_sub(count);
            }
            Command::BatchUndelivered { entries } => self.on_batch_undelivered(entries),
        }
    }

    /// Periodic overload check.
    ///
    /// Expires silent offloads first. Then it solicits help while overloaded
    /// and unhelped, keeps offloading while helped and overloaded, and lets
    /// helpers go once everything is drained.
    fn monitor_tick(&mut self) {
        self.expire_offloads();
        let load = self.load();
        debug!(
            node = %self.config.name,
            queue = self.queue.len(),
            processing = self.processing,
            overall = load.overall,
            overloaded = load.is_overloaded,
            "monitor tick"
        );

        if self.helpers.is_empty() {
            if load.is_overloaded {
                self.request_help(super::PERIODIC_OVERLOAD_CHECK, HelpResponder::Monitor);
            }
        } else if load.is_overloaded {
            if !self.queue.is_empty() {
                self.distribute_work();
            }
        } else if self.queue.is_empty() && self.outstanding.is_empty() {
            self.release_helpers();
        }
    }

    fn shutdown(&mut self, respond_to: oneshot::Sender<()>) {
        if self.shutting_down {
            let _ = respond_to.send(());
            return;
        }
        self.shutting_down = true;
        let helpers: Vec<String> = self.helpers.drain(..).collect();
        info!(node = %self.config.name, helpers = helpers.len(), "shutting down");
        if !helpers.is_empty() {
            self.emit(NodeEvent::HelpersChanged { helpers: Vec::new() });
        }

        let broker = Arc::clone(&self.broker);
        let from = self.config.name.clone();
        tokio::spawn(async move {
            for helper in helpers {
                match Envelope::new(&from, &helper, &PeerMessage::Release {}) {
                    Ok(envelope) => {
                        if let Err(e) = broker.send_message(envelope).await {
                            warn!(node = %from, helper = %helper, error = %e, "release failed");
                        }
                    }
                    Err(e) => warn!(node = %from, error = %e, "failed to encode release"),
                }
            }
            let _ = respond_to.send(());
        });
    }

    // ── Shared helpers ───────────────────────────────────────────────

    pub(super) fn load(&self) -> LoadSnapshot {
        LoadSnapshot::compute(
            self.queue.len(),
            self.config.max_queue,
            self.processing,
            self.config.max_concurrent,
        )
    }

    pub(super) fn status(&self) -> NodeStatus {
        let load = self.load();
        let uptime = self.started.elapsed();
        NodeStatus {
            id: self.config.name.clone(),
            phase: NodePhase::derive(
                self.shutting_down,
                self.helpers.len(),
                self.help_in_flight,
                &load,
            ),
            state: StateSnapshot {
                queue_size: self.queue.len(),
                processing: self.processing,
                max_concurrent: self.config.max_concurrent,
                max_queue: self.config.max_queue,
                helpers: self.helpers.iter().cloned().collect(),
                total_processed: self.total_processed,
                total_errors: self.total_errors,
                retries_pending: self.retries_pending,
                offloading: self.offloading,
                outstanding_offloads: self.outstanding.len(),
                start_time: self.start_time,
                last_active: self.last_active,
            },
            metrics: self
                .metrics
                .snapshot(self.total_processed, self.total_errors, uptime),
            load,
            uptime_ms: uptime.as_millis() as u64,
        }
    }

    pub(super) fn emit(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Fire-and-forget send. Failures are logged, never surfaced.
    pub(super) fn send(&self, to: &str, message: PeerMessage, priority: MessagePriority) {
        let envelope = match Envelope::new(&self.config.name, to, &message) {
            Ok(envelope) => envelope.with_priority(priority),
            Err(e) => {
                warn!(node = %self.config.name, kind = message.kind(), error = %e, "failed to encode message");
                return;
            }
        };
        let broker = Arc::clone(&self.broker);
        tokio::spawn(async move {
            if let Err(e) = broker.send_message(envelope.clone()).await {
                warn!(
                    from = %envelope.from,
                    to = %envelope.to,
                    kind = %envelope.kind,
                    error = %e,
                    "send failed"
                );
            }
        });
    }
}
