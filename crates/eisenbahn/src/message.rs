use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeromq::ZmqMessage;

use crate::error::EisenbahnError;

/// Wire envelope for everything that crosses the mesh.
///
/// The payload is MessagePack; `topic` drives PUB/SUB filtering and
/// `correlation_id` pairs help replies with the query that caused them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,

    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    pub timestamp: DateTime<Utc>,

    pub correlation_id: Uuid,

    /// Bumped on incompatible payload changes.
    #[serde(default = "default_version")]
    pub version: u16,
}

fn default_version() -> u16 {
    1
}

impl Message {
    pub fn new<T: Serialize>(topic: impl Into<String>, payload: &T) -> Result<Self, EisenbahnError> {
        Self::with_correlation(topic, payload, Uuid::new_v4())
    }

    /// Build a message that continues an existing exchange.
    pub fn with_correlation<T: Serialize>(
        topic: impl Into<String>,
        payload: &T,
        correlation_id: Uuid,
    ) -> Result<Self, EisenbahnError> {
        Ok(Self {
            topic: topic.into(),
            payload: rmp_serde::to_vec(payload)?,
            timestamp: Utc::now(),
            correlation_id,
            version: default_version(),
        })
    }

    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, EisenbahnError> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    /// Two ZeroMQ frames: `[topic, envelope]`. The topic frame is what SUB
    /// sockets prefix-match on.
    pub fn to_zmq(&self) -> Result<ZmqMessage, EisenbahnError> {
        let mut frames = ZmqMessage::from(self.topic.as_str());
        frames.push_back(rmp_serde::to_vec(self)?.into());
        Ok(frames)
    }

    /// Decode the envelope frame of a received ZeroMQ message.
    ///
    /// A lone frame is taken to be the envelope itself.
    pub fn from_zmq(frames: &ZmqMessage) -> Result<Self, EisenbahnError> {
        let parts: Vec<_> = frames.iter().collect();
        let envelope = match parts.as_slice() {
            [] => return Err(EisenbahnError::Transport("empty ZMQ message".into())),
            [only] => only,
            [_topic, envelope, ..] => envelope,
        };
        Ok(rmp_serde::from_slice(envelope.as_ref())?)
    }
}

/// Serialize `Vec<u8>` as MessagePack bin rather than an array of ints.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}
