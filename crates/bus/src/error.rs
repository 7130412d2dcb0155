use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("not connected to broker")]
    NotConnected,
    #[error("failed to encode payload for {topic}: {source}")]
    Encode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out after {0:?} waiting for broker connection")]
    ConnectTimeout(std::time::Duration),
    #[error("shutdown requested while connecting")]
    Shutdown,
}

/// Inbound payload that could not be decoded. Counted and logged by the bus,
/// never returned to callers.
#[derive(Debug, Error)]
#[error("malformed payload on {topic}: {source}")]
pub struct DecodeError {
    pub topic: String,
    #[source]
    pub source: serde_json::Error,
}
