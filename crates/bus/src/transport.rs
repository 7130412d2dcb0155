use crate::error::BusError;

/// Outbound half of a broker connection.
///
/// Implementations only queue requests; delivery and acknowledgements are
/// reported back to the bus as [`BusEvent`]s by whoever drives the connection.
pub trait Transport: Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError>;
    fn subscribe(&self, filter: &str) -> Result<(), BusError>;
    fn disconnect(&self) -> Result<(), BusError>;
}

/// Connection lifecycle and inbound traffic, as observed by the driver thread.
#[derive(Clone, Debug, PartialEq)]
pub enum BusEvent {
    Connected,
    Disconnected { reason: String },
    Message { topic: String, payload: Vec<u8> },
    Acked,
}
