use dendrite_core::DendriteError;
use thiserror::Error;

/// Errors raised by the ZeroMQ mesh.
#[derive(Debug, Error)]
pub enum EisenbahnError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid endpoint '{0}': expected ipc://<path> or tcp://<host>:<port>")]
    InvalidEndpoint(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mesh failures surface through the `Broker` seam as transport errors.
impl From<EisenbahnError> for DendriteError {
    fn from(err: EisenbahnError) -> Self {
        DendriteError::Transport(err.to_string())
    }
}
