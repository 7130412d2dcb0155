use thiserror::Error;

use crate::command::SignalCommand;

#[derive(Debug, Error)]
#[error("failed to deliver command for {intersection_id}: {reason}")]
pub struct SinkError {
    pub intersection_id: String,
    pub reason: String,
}

/// Outbound channel for signal commands, typically the message bus.
pub trait CommandSink: Send + Sync {
    fn send(&self, command: &SignalCommand) -> Result<(), SinkError>;
}
