//! [`Broker`] implementation over the ZeroMQ PUB/SUB proxy.
//!
//! Every process joining the mesh owns one [`ZmqMesh`]: a single publisher
//! connected to the broker frontend, plus one subscriber and pump task per
//! registered node. A pump listens on three topics for its node:
//!
//! - its inbox, carrying peer [`Envelope`]s, posted to the node when the
//!   kind is subscribed;
//! - its reply topic, carrying [`HelpReply`]s for `request_help` calls made
//!   by this node, matched by correlation id;
//! - its capability's query topic, where it answers other nodes' help
//!   queries on the node's behalf.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dendrite_core::{
    Broker, DendriteError, DendriteHandle, Envelope, HelpQuery, HelpReply, NodeMeta,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MeshConfig;
use crate::error::EisenbahnError;
use crate::message::Message;
use crate::pubsub::{ZmqPublisher, ZmqSubscriber};
use crate::topics;
use crate::traits::{EventPublisher, EventSubscriber};
use crate::transport::Transport;

/// Pause after a failed `recv` before trying again.
const RECV_BACKOFF: Duration = Duration::from_millis(100);

/// Payload of a capability query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFrame {
    /// Node that asked; replies go to its reply topic.
    pub from: String,
    pub query: HelpQuery,
}

type PendingReplies = Arc<Mutex<HashMap<Uuid, mpsc::UnboundedSender<HelpReply>>>>;

struct NodeLink {
    kinds: Arc<RwLock<HashSet<String>>>,
    pump: JoinHandle<()>,
}

/// A process's connection to the mesh.
pub struct ZmqMesh {
    publisher: Arc<ZmqPublisher>,
    backend: Transport,
    help_query_timeout: Duration,
    nodes: Mutex<HashMap<String, NodeLink>>,
    pending: PendingReplies,
}

impl ZmqMesh {
    /// Connect the publisher to the broker frontend.
    ///
    /// Subscribers are opened per node in [`Broker::register`].
    pub async fn connect(config: &MeshConfig) -> Result<Self, EisenbahnError> {
        config.validate()?;
        let publisher = ZmqPublisher::connect(&config.frontend_transport()?).await?;
        Ok(Self {
            publisher: Arc::new(publisher),
            backend: config.backend_transport()?,
            help_query_timeout: config.help_query_timeout(),
            nodes: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Names of nodes registered through this mesh.
    pub async fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every pump. Registered nodes stop receiving peer traffic.
    pub async fn close(&self) {
        let mut nodes = self.nodes.lock().await;
        for (name, link) in nodes.drain() {
            link.pump.abort();
            debug!(node = %name, "mesh pump stopped");
        }
    }
}

impl Drop for ZmqMesh {
    fn drop(&mut self) {
        for link in self.nodes.get_mut().values() {
            link.pump.abort();
        }
    }
}

#[async_trait]
impl Broker for ZmqMesh {
    async fn register(&self, meta: NodeMeta, handle: DendriteHandle) -> Result<(), DendriteError> {
        let subscriber = ZmqSubscriber::connect(&self.backend).await?;
        // All subscriptions go in before the pump starts: recv holds the socket.
        let inbox = topics::node_inbox(&meta.name);
        let replies = topics::node_replies(&meta.name);
        let queries = topics::capability_query(&meta.capability);
        for topic in [&inbox, &replies, &queries] {
            subscriber.subscribe(topic).await?;
        }

        let kinds = Arc::new(RwLock::new(HashSet::new()));
        let pump = Pump {
            name: meta.name.clone(),
            inbox,
            replies,
            queries,
            subscriber,
            handle,
            kinds: kinds.clone(),
            publisher: self.publisher.clone(),
            pending: self.pending.clone(),
        };
        let link = NodeLink {
            kinds,
            pump: tokio::spawn(pump.run()),
        };

        info!(node = %meta.name, capability = %meta.capability, "registered node on mesh");
        if let Some(old) = self.nodes.lock().await.insert(meta.name, link) {
            old.pump.abort();
        }
        Ok(())
    }

    async fn subscribe(&self, name: &str, kind: &str) -> Result<(), DendriteError> {
        let kinds = self
            .nodes
            .lock()
            .await
            .get(name)
            .map(|link| link.kinds.clone())
            .ok_or_else(|| DendriteError::UnknownNode(name.to_string()))?;
        kinds.write().await.insert(kind.to_string());
        Ok(())
    }

    /// Publish to the target's inbox. The priority hint is not used: the
    /// proxy forwards in arrival order.
    async fn send_message(&self, envelope: Envelope) -> Result<(), DendriteError> {
        let message = Message::new(topics::node_inbox(&envelope.to), &envelope)?;
        debug!(from = %envelope.from, to = %envelope.to, kind = %envelope.kind, "publishing envelope");
        self.publisher.publish(message).await?;
        Ok(())
    }

    /// Fan the query out on the capability topic and gather replies until
    /// the help-query timeout. `from` must be registered on this mesh, since
    /// replies arrive through its pump.
    async fn request_help(
        &self,
        from: &str,
        capability: &str,
        query: HelpQuery,
    ) -> Result<Vec<HelpReply>, DendriteError> {
        let correlation_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.lock().await.insert(correlation_id, tx);

        let frame = QueryFrame {
            from: from.to_string(),
            query,
        };
        let published = match Message::with_correlation(
            topics::capability_query(capability),
            &frame,
            correlation_id,
        ) {
            Ok(message) => self.publisher.publish(message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            self.pending.lock().await.remove(&correlation_id);
            return Err(e.into());
        }

        let deadline = Instant::now() + self.help_query_timeout;
        let mut replies = Vec::new();
        while let Ok(Some(reply)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            replies.push(reply);
        }
        self.pending.lock().await.remove(&correlation_id);

        debug!(node = %from, capability = %capability, replies = replies.len(), "help query closed");
        replies.sort_by(|a, b| a.from.cmp(&b.from));
        Ok(replies)
    }
}

/// Per-node receive loop.
struct Pump {
    name: String,
    inbox: String,
    replies: String,
    queries: String,
    subscriber: ZmqSubscriber,
    handle: DendriteHandle,
    kinds: Arc<RwLock<HashSet<String>>>,
    publisher: Arc<ZmqPublisher>,
    pending: PendingReplies,
}

impl Pump {
    async fn run(self) {
        loop {
            let message = match self.subscriber.recv().await {
                Ok(message) => message,
                Err(e) => {
                    warn!(node = %self.name, error = %e, "mesh recv error");
                    tokio::time::sleep(RECV_BACKOFF).await;
                    continue;
                }
            };

            let flow = if message.topic == self.inbox {
                self.on_envelope(&message).await
            } else if message.topic == self.replies {
                self.on_reply(&message).await;
                ControlFlow::Continue(())
            } else if message.topic == self.queries {
                self.on_query(&message).await
            } else {
                ControlFlow::Continue(())
            };

            if flow.is_break() {
                info!(node = %self.name, "node stopped, mesh pump exiting");
                break;
            }
        }
    }

    async fn on_envelope(&self, message: &Message) -> ControlFlow<()> {
        let envelope: Envelope = match message.decode() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(node = %self.name, error = %e, "undecodable envelope");
                return ControlFlow::Continue(());
            }
        };
        if !self.kinds.read().await.contains(&envelope.kind) {
            debug!(node = %self.name, kind = %envelope.kind, "dropping unsubscribed kind");
            return ControlFlow::Continue(());
        }
        match self.handle.post(envelope).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(DendriteError::NodeStopped(_)) => ControlFlow::Break(()),
            Err(e) => {
                warn!(node = %self.name, error = %e, "failed to post envelope");
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_reply(&self, message: &Message) {
        let reply: HelpReply = match message.decode() {
            Ok(reply) => reply,
            Err(e) => {
                warn!(node = %self.name, error = %e, "undecodable help reply");
                return;
            }
        };
        match self.pending.lock().await.get(&message.correlation_id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(node = %self.name, from = %reply.from, "late help reply dropped"),
        }
    }

    async fn on_query(&self, message: &Message) -> ControlFlow<()> {
        let frame: QueryFrame = match message.decode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(node = %self.name, error = %e, "undecodable help query");
                return ControlFlow::Continue(());
            }
        };
        if frame.from == self.name {
            return ControlFlow::Continue(());
        }

        let res = match self.handle.answer_help_query(frame.query).await {
            Ok(res) => res,
            Err(DendriteError::NodeStopped(_)) => return ControlFlow::Break(()),
            Err(e) => {
                warn!(node = %self.name, error = %e, "failed to answer help query");
                return ControlFlow::Continue(());
            }
        };
        let reply = HelpReply {
            from: self.name.clone(),
            res,
        };
        let published = Message::with_correlation(
            topics::node_replies(&frame.from),
            &reply,
            message.correlation_id,
        );
        let result = match published {
            Ok(reply) => self.publisher.publish(reply).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(node = %self.name, to = %frame.from, error = %e, "failed to publish help reply");
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dendrite_core::HelpResponse;

    #[test]
    fn query_frame_travels_in_a_message() {
        let frame = QueryFrame {
            from: "origin".into(),
            query: HelpQuery {
                reason: "queue_full".into(),
                load: 1.0,
                queue_size: 12,
                needed_clones: 1,
                task_type: "scraper".into(),
                capabilities: vec!["http".into()],
            },
        };
        let msg = Message::new(topics::capability_query("scraper"), &frame).unwrap();
        assert_eq!(msg.decode::<QueryFrame>().unwrap(), frame);
    }

    #[test]
    fn help_reply_keeps_correlation() {
        let id = Uuid::new_v4();
        let reply = HelpReply {
            from: "helper".into(),
            res: HelpResponse {
                success: true,
                load: 0.2,
                queue_size: 0,
                available_slots: 4,
            },
        };
        let msg = Message::with_correlation(topics::node_replies("origin"), &reply, id).unwrap();
        assert_eq!(msg.correlation_id, id);
        assert_eq!(msg.decode::<HelpReply>().unwrap(), reply);
    }
}
