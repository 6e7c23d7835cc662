use sb_broker::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Backpressure buffer capacity exceeded")]
    CapacityExceeded,

    #[error("Channel is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ConnectorError>;
