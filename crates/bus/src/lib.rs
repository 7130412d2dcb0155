//! Topic-based publish/subscribe between edge gateways and the control server.
//!
//! [`MessageBus`] owns connection state, presence announcements and inbound
//! routing. The broker client is hidden behind [`Transport`]; the MQTT
//! implementation lives in [`mqtt`].

pub mod bus;
pub mod error;
pub mod mqtt;
pub mod presence;
pub mod topic;
pub mod transport;

pub use bus::{Ack, BusConfig, BusStats, Inbound, MessageBus};
pub use error::{BusError, DecodeError};
pub use mqtt::MqttTransport;
pub use presence::{PresenceState, PresenceStatus, unix_now};
pub use transport::{BusEvent, Transport};
