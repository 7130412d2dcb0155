//! MQTT transport backed by `rumqttc`'s synchronous client.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use rumqttc::{Client, Connection, Event, LastWill, MqttOptions, Outgoing, Packet, QoS, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::{
    bus::{BusConfig, MessageBus},
    error::BusError,
    transport::{BusEvent, Transport},
};

const REQUEST_CAPACITY: usize = 64;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long the driver keeps flushing after a disconnect was requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MqttTransport {
    client: Client,
}

impl Transport for MqttTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload)
            .map_err(|err| BusError::Transport(err.to_string()))
    }

    fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        self.client
            .try_subscribe(filter, QoS::AtLeastOnce)
            .map_err(|err| BusError::Transport(err.to_string()))
    }

    fn disconnect(&self) -> Result<(), BusError> {
        self.client
            .try_disconnect()
            .map_err(|err| BusError::Transport(err.to_string()))
    }
}

fn mqtt_options(config: &BusConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(true);
    if let Some((topic, payload)) = config.last_will() {
        options.set_last_will(LastWill::new(topic, payload, QoS::AtLeastOnce, true));
    }
    options
}

impl MessageBus<MqttTransport> {
    /// Create an MQTT-backed bus and start its driver thread.
    ///
    /// Returns immediately; use [`MessageBus::wait_connected`] to block until
    /// the broker accepts the session. The driver reconnects on its own after
    /// transport errors until [`MessageBus::disconnect`] is called.
    pub fn connect(config: BusConfig) -> Result<Arc<Self>, BusError> {
        let (client, connection) = Client::new(mqtt_options(&config), REQUEST_CAPACITY);
        info!(broker = %config.broker(), client_id = %config.client_id, "connecting to broker");
        let bus = Arc::new(MessageBus::new(MqttTransport { client }, config));

        let driver_bus = Arc::clone(&bus);
        let handle = thread::Builder::new()
            .name(format!("mqtt-{}", bus.config().client_id))
            .spawn(move || drive(connection, driver_bus))
            .map_err(|err| BusError::Transport(format!("failed to spawn mqtt driver: {err}")))?;
        bus.attach_driver(handle);
        Ok(bus)
    }
}

fn drive(mut connection: Connection, bus: Arc<MessageBus<MqttTransport>>) {
    let reconnect_delay = bus.config().reconnect_delay;
    let mut drain_deadline: Option<Instant> = None;

    loop {
        if bus.is_stopping() {
            let deadline = *drain_deadline.get_or_insert_with(|| Instant::now() + DRAIN_TIMEOUT);
            if Instant::now() >= deadline {
                debug!("mqtt driver drain timed out");
                break;
            }
        }

        match connection.recv_timeout(POLL_INTERVAL) {
            Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => bus.handle_event(BusEvent::Connected),
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => bus.handle_event(BusEvent::Message {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
            }),
            Ok(Ok(Event::Incoming(Packet::PubAck(_)))) => bus.handle_event(BusEvent::Acked),
            Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) => {
                debug!("mqtt disconnect flushed");
                break;
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                bus.handle_event(BusEvent::Disconnected {
                    reason: err.to_string(),
                });
                if bus.is_stopping() {
                    break;
                }
                pause(reconnect_delay, &bus);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("mqtt request channel closed");
                break;
            }
        }
    }
    bus.handle_event(BusEvent::Disconnected {
        reason: "driver stopped".to_string(),
    });
}

fn pause(delay: Duration, bus: &MessageBus<MqttTransport>) {
    let deadline = Instant::now() + delay;
    while Instant::now() < deadline && !bus.is_stopping() {
        thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
    }
}
