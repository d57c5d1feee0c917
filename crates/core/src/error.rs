use thiserror::Error;

/// Errors surfaced by a dendrite node and its collaborators.
#[derive(Debug, Error)]
pub enum DendriteError {
    /// The node actor has exited; its handle can no longer reach it.
    #[error("node '{0}' is no longer running")]
    NodeStopped(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("node '{node}' is not subscribed to '{kind}' messages")]
    NotSubscribed { node: String, kind: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}
