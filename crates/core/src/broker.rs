//! The broker seam: name resolution and message delivery between nodes.
//!
//! [`Broker`] is what a node needs from the substrate. [`LocalBroker`] is an
//! in-process implementation that routes between nodes living in the same
//! runtime; networked implementations live in other crates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::DendriteError;
use crate::messages::{Envelope, HelpQuery, HelpReply};
use crate::node::DendriteHandle;

/// Registration metadata a node announces to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub name: String,
    /// Capability type peers are looked up by.
    pub capability: String,
    pub capabilities: Vec<String>,
}

/// Message substrate a node talks through.
///
/// Delivery is best-effort: no retry and no ordering across messages.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Make `handle` reachable under `meta.name`.
    async fn register(&self, meta: NodeMeta, handle: DendriteHandle) -> Result<(), DendriteError>;

    /// Accept messages of `kind` for node `name`.
    async fn subscribe(&self, name: &str, kind: &str) -> Result<(), DendriteError>;

    async fn send_message(&self, envelope: Envelope) -> Result<(), DendriteError>;

    /// Ask peers advertising `capability` whether they can absorb load.
    async fn request_help(
        &self,
        from: &str,
        capability: &str,
        query: HelpQuery,
    ) -> Result<Vec<HelpReply>, DendriteError>;
}

/// Blanket implementation so `Arc<dyn Broker>` can be used directly.
#[async_trait]
impl<T: Broker + ?Sized> Broker for Arc<T> {
    async fn register(&self, meta: NodeMeta, handle: DendriteHandle) -> Result<(), DendriteError> {
        (**self).register(meta, handle).await
    }

    async fn subscribe(&self, name: &str, kind: &str) -> Result<(), DendriteError> {
        (**self).subscribe(name, kind).await
    }

    async fn send_message(&self, envelope: Envelope) -> Result<(), DendriteError> {
        (**self).send_message(envelope).await
    }

    async fn request_help(
        &self,
        from: &str,
        capability: &str,
        query: HelpQuery,
    ) -> Result<Vec<HelpReply>, DendriteError> {
        (**self).request_help(from, capability, query).await
    }
}

// ── LocalBroker ──────────────────────────────────────────────────────

struct Registration {
    meta: NodeMeta,
    handle: DendriteHandle,
    subscriptions: HashSet<String>,
}

/// In-process broker that resolves node names to their handles.
#[derive(Default)]
pub struct LocalBroker {
    nodes: RwLock<HashMap<String, Registration>>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of every registered node.
    pub async fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn register(&self, meta: NodeMeta, handle: DendriteHandle) -> Result<(), DendriteError> {
        info!(node = %meta.name, capability = %meta.capability, "registered node");
        self.nodes.write().await.insert(
            meta.name.clone(),
            Registration {
                meta,
                handle,
                subscriptions: HashSet::new(),
            },
        );
        Ok(())
    }

    async fn subscribe(&self, name: &str, kind: &str) -> Result<(), DendriteError> {
        let mut nodes = self.nodes.write().await;
        let reg = nodes
            .get_mut(name)
            .ok_or_else(|| DendriteError::UnknownNode(name.to_string()))?;
        reg.subscriptions.insert(kind.to_string());
        Ok(())
    }

    async fn send_message(&self, envelope: Envelope) -> Result<(), DendriteError> {
        let handle = {
            let nodes = self.nodes.read().await;
            let reg = nodes
                .get(&envelope.to)
                .ok_or_else(|| DendriteError::UnknownNode(envelope.to.clone()))?;
            if !reg.subscriptions.contains(&envelope.kind) {
                return Err(DendriteError::NotSubscribed {
                    node: envelope.to.clone(),
                    kind: envelope.kind.clone(),
                });
            }
            reg.handle.clone()
        };
        debug!(from = %envelope.from, to = %envelope.to, kind = %envelope.kind, "delivering message");
        handle.post(envelope).await
    }

    async fn request_help(
        &self,
        from: &str,
        capability: &str,
        query: HelpQuery,
    ) -> Result<Vec<HelpReply>, DendriteError> {
        let candidates: Vec<(String, DendriteHandle)> = {
            let nodes = self.nodes.read().await;
            nodes
                .values()
                .filter(|reg| reg.meta.name != from && reg.meta.capability == capability)
                .map(|reg| (reg.meta.name.clone(), reg.handle.clone()))
                .collect()
        };

        let asks = candidates.into_iter().map(|(name, handle)| {
            let query = query.clone();
            async move { (name, handle.answer_help_query(query).await) }
        });

        let mut replies = Vec::new();
        for (name, answer) in join_all(asks).await {
            match answer {
                Ok(res) => replies.push(HelpReply { from: name, res }),
                Err(e) => debug!(node = %name, error = %e, "peer did not answer help query"),
            }
        }
        replies.sort_by(|a, b| a.from.cmp(&b.from));
        Ok(replies)
    }
}
