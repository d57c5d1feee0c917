use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use zeromq::prelude::*;
use zeromq::{PubSocket, SubSocket};

use crate::error::EisenbahnError;
use crate::message::Message;
use crate::traits::{EventPublisher, EventSubscriber};
use crate::transport::Transport;

/// PUB socket. Connects to the broker frontend, or binds for direct use.
///
/// Every message goes out as two frames, `[topic, envelope]`.
pub struct ZmqPublisher {
    socket: Mutex<PubSocket>,
}

impl ZmqPublisher {
    /// Connect to the broker's frontend (where its SUB socket binds).
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn connect(transport: &Transport) -> Result<Self, EisenbahnError> {
        let mut socket = PubSocket::new();
        info!("connecting PUB socket to broker frontend");
        socket.connect(&transport.endpoint()).await?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }

    /// Bind directly; subscribers connect to this endpoint with no broker in between.
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn bind(transport: &Transport) -> Result<Self, EisenbahnError> {
        transport.ensure_ipc_dir()?;
        let mut socket = PubSocket::new();
        info!("binding PUB socket");
        socket.bind(&transport.endpoint()).await?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }
}

#[async_trait]
impl EventPublisher for ZmqPublisher {
    async fn publish(&self, message: Message) -> Result<(), EisenbahnError> {
        let frames = message.to_zmq()?;
        self.socket.lock().await.send(frames).await?;
        debug!(topic = %message.topic, "published message");
        Ok(())
    }
}

/// SUB socket. Connects to the broker backend, or straight to a bound publisher.
pub struct ZmqSubscriber {
    socket: Mutex<SubSocket>,
}

impl ZmqSubscriber {
    /// Connect to the broker's backend (where its PUB socket binds).
    #[instrument(skip_all, fields(endpoint = %transport))]
    pub async fn connect(transport: &Transport) -> Result<Self, EisenbahnError> {
        let mut socket = SubSocket::new();
        info!("connecting SUB socket");
        socket.connect(&transport.endpoint()).await?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }
}

#[async_trait]
impl EventSubscriber for ZmqSubscriber {
    /// An empty prefix subscribes to everything.
    async fn subscribe(&self, topic_prefix: &str) -> Result<(), EisenbahnError> {
        self.socket.lock().await.subscribe(topic_prefix).await?;
        debug!(topic_prefix = %topic_prefix, "subscribed to topic prefix");
        Ok(())
    }

    async fn recv(&self) -> Result<Message, EisenbahnError> {
        let frames = self.socket.lock().await.recv().await?;
        let message = Message::from_zmq(&frames)?;
        debug!(topic = %message.topic, "received message");
        Ok(message)
    }
}
