use std::time::Duration;

/// Errors surfaced by a broker client
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection is down")]
    NotConnected,

    #[error("publisher buffer capacity exhausted")]
    InsufficientResources,

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("receiver or publisher already terminated")]
    Terminated,

    #[error("queue '{0}' does not exist and creation is disabled")]
    MissingResource(String),

    #[error("replay is not available: {0}")]
    Replay(String),

    #[error("acknowledgement failed: {0}")]
    AckFailed(String),

    #[error("broker call did not complete within {0:?}")]
    Timeout(Duration),
}
