use thiserror::Error;

#[derive(Error, Debug)]
pub enum SynthError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid CIDR: {0}")]
    InvalidCidr(#[from] ipnetwork::IpNetworkError),

    #[error("pod IP pool {pool} exhausted")]
    PoolExhausted { pool: String },

    #[error("service graph references unknown service: {service}")]
    UnknownService { service: String },

    #[error("service graph contains a cycle through {service}")]
    CyclicServiceGraph { service: String },

    #[error("missing or invalid parameter: {what}")]
    MissingParameter { what: String },

    #[error("invalid timestamp {value:?}: expected \"YYYY-MM-DD\" or \"YYYY-MM-DD HH:MM:SS\"")]
    Time { value: String },

    #[error("update channel closed for node {node}")]
    ChannelClosed { node: String },

    #[error("worker task failed: {0}")]
    Task(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("output error: {0}")]
    Output(String),
}

pub type Result<T> = std::result::Result<T, SynthError>;
