//! ZeroMQ substrate for dendrite nodes.
//!
//! A central [`EventBroker`] proxies PUB/SUB traffic; each process joins
//! through a [`ZmqMesh`], which implements the core `Broker` trait so nodes
//! can address peers in other processes by name.

pub mod broker;
pub mod config;
pub mod error;
pub mod mesh;
pub mod message;
pub mod pubsub;
pub mod topics;
pub mod traits;
pub mod transport;

pub use broker::{BrokerConfig, BrokerMetrics, EventBroker};
pub use config::{BrokerEndpoints, MeshConfig};
pub use error::EisenbahnError;
pub use mesh::{QueryFrame, ZmqMesh};
pub use message::Message;
pub use pubsub::{ZmqPublisher, ZmqSubscriber};
pub use traits::{EventPublisher, EventSubscriber};
pub use transport::Transport;
