use std::{
    collections::BTreeMap,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use metrics::counter;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info, warn};

use crate::{
    error::{BusError, DecodeError},
    presence::{PresenceState, PresenceStatus},
    topic,
    transport::{BusEvent, Transport},
};

#[derive(Clone, Debug)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub base_topic: String,
    pub keep_alive: Duration,
    /// Delay between reconnection attempts after a transport error.
    pub reconnect_delay: Duration,
    /// When set, the bus announces this intersection as online/offline on
    /// `{base_topic}/status` and registers an offline last will.
    pub presence_id: Option<String>,
}

impl BusConfig {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>, base_topic: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            base_topic: base_topic.into(),
            keep_alive: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(1),
            presence_id: None,
        }
    }

    pub fn with_presence(mut self, intersection_id: impl Into<String>) -> Self {
        self.presence_id = Some(intersection_id.into());
        self
    }

    pub fn status_topic(&self) -> String {
        topic::join(&self.base_topic, topic::STATUS_SUFFIX)
    }

    pub fn broker(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Topic and payload the broker should publish (retained) if this client
    /// disappears without a clean disconnect.
    pub fn last_will(&self) -> Option<(String, Vec<u8>)> {
        let id = self.presence_id.as_deref()?;
        let payload = serde_json::to_vec(&PresenceStatus::now(id, PresenceState::Offline)).ok()?;
        Some((self.status_topic(), payload))
    }
}

/// Message routed to a subscriber, tagged with the concrete topic it arrived on.
#[derive(Clone, Debug, PartialEq)]
pub struct Inbound<M> {
    pub topic: String,
    pub message: M,
}

/// Receipt for a publish request accepted by the transport.
#[derive(Clone, Debug, PartialEq)]
pub struct Ack {
    pub topic: String,
    pub bytes: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct BusStats {
    pub broker: String,
    pub connected: bool,
    pub messages_published: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub malformed_payloads: u64,
    pub last_publish_time: Option<f64>,
}

type Sink = Box<dyn Fn(&str, &[u8]) -> Result<(), DecodeError> + Send + Sync>;

struct Subscription {
    filter: String,
    sink: Sink,
}

/// Publish/subscribe facade over a broker [`Transport`].
///
/// Inbound messages are decoded on the driver thread and handed to consumers
/// through channels; consumers never run on the driver thread.
pub struct MessageBus<T: Transport> {
    transport: T,
    config: BusConfig,
    connected: AtomicBool,
    stopping: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
    presence: Mutex<BTreeMap<String, PresenceStatus>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    published: AtomicU64,
    acked: AtomicU64,
    received: AtomicU64,
    malformed: AtomicU64,
    last_publish_micros: AtomicU64,
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Transport> MessageBus<T> {
    pub fn new(transport: T, config: BusConfig) -> Self {
        Self {
            transport,
            config,
            connected: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            presence: Mutex::new(BTreeMap::new()),
            driver: Mutex::new(None),
            published: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            received: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            last_publish_micros: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn attach_driver(&self, handle: JoinHandle<()>) {
        *lock(&self.driver) = Some(handle);
    }

    /// Serialize `payload` as JSON and publish it on `{base_topic}/{suffix}`.
    ///
    /// Fails fast with [`BusError::NotConnected`] rather than queueing while
    /// the broker is unreachable.
    pub fn publish<P: Serialize + ?Sized>(&self, suffix: &str, payload: &P) -> Result<Ack, BusError> {
        let topic = topic::join(&self.config.base_topic, suffix);
        if !self.is_connected() {
            counter!("bus_publish_rejected_total").increment(1);
            warn!(%topic, "not connected to broker, skipping publish");
            return Err(BusError::NotConnected);
        }
        let bytes = serde_json::to_vec(payload).map_err(|source| BusError::Encode {
            topic: topic.clone(),
            source,
        })?;
        self.publish_raw(&topic, bytes, false)
    }

    fn publish_raw(&self, topic: &str, bytes: Vec<u8>, retain: bool) -> Result<Ack, BusError> {
        let len = bytes.len();
        self.transport.publish(topic, bytes, retain)?;
        self.published.fetch_add(1, Ordering::Relaxed);
        self.last_publish_micros
            .store(chrono::Utc::now().timestamp_micros().max(0) as u64, Ordering::Relaxed);
        counter!("bus_messages_published_total").increment(1);
        debug!(%topic, bytes = len, retain, "published");
        Ok(Ack {
            topic: topic.to_string(),
            bytes: len,
        })
    }

    /// Subscribe to `{base_topic}/{filter}` and receive decoded messages of type `M`.
    ///
    /// The subscription is replayed on every reconnect. Presence messages on
    /// the status topic are never forwarded.
    pub fn subscribe<M>(&self, filter: &str) -> Result<Receiver<Inbound<M>>, BusError>
    where
        M: DeserializeOwned + Send + 'static,
    {
        let filter = topic::join(&self.config.base_topic, filter);
        let (tx, rx) = unbounded();
        let sink = decoding_sink::<M>(tx);
        lock(&self.subscriptions).push(Subscription {
            filter: filter.clone(),
            sink,
        });
        if self.is_connected() {
            self.transport.subscribe(&filter)?;
            info!(%filter, "subscribed");
        }
        Ok(rx)
    }

    /// Feed a connection event from the driver thread into the bus.
    pub fn handle_event(&self, event: BusEvent) {
        match event {
            BusEvent::Connected => self.on_connected(),
            BusEvent::Disconnected { reason } => {
                if self.connected.swap(false, Ordering::SeqCst) && !self.is_stopping() {
                    warn!(%reason, broker = %self.config.broker(), "unexpected disconnection, will auto-reconnect");
                } else {
                    debug!(%reason, "broker connection unavailable");
                }
            }
            BusEvent::Message { topic, payload } => self.dispatch(&topic, &payload),
            BusEvent::Acked => {
                self.acked.fetch_add(1, Ordering::Relaxed);
                counter!("bus_messages_acked_total").increment(1);
            }
        }
    }

    fn on_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        info!(broker = %self.config.broker(), client_id = %self.config.client_id, "connected to broker");

        if let Some(id) = self.config.presence_id.as_deref() {
            let status = PresenceStatus::now(id, PresenceState::Online);
            match serde_json::to_vec(&status) {
                Ok(bytes) => {
                    if let Err(err) = self.publish_raw(&self.config.status_topic(), bytes, true) {
                        warn!(error = %err, "failed to announce presence");
                    }
                }
                Err(err) => warn!(error = %err, "failed to encode presence"),
            }
        }

        for sub in lock(&self.subscriptions).iter() {
            match self.transport.subscribe(&sub.filter) {
                Ok(()) => info!(filter = %sub.filter, "subscribed"),
                Err(err) => warn!(filter = %sub.filter, error = %err, "subscribe failed"),
            }
        }
    }

    fn dispatch(&self, topic: &str, payload: &[u8]) {
        self.received.fetch_add(1, Ordering::Relaxed);
        counter!("bus_messages_received_total").increment(1);

        if topic == self.config.status_topic() {
            match serde_json::from_slice::<PresenceStatus>(payload) {
                Ok(status) => {
                    info!(intersection = %status.intersection_id, status = ?status.status, "presence update");
                    lock(&self.presence).insert(status.intersection_id.clone(), status);
                }
                Err(source) => self.record_malformed(DecodeError {
                    topic: topic.to_string(),
                    source,
                }),
            }
            return;
        }

        let subscriptions = lock(&self.subscriptions);
        let mut routed = false;
        for sub in subscriptions.iter().filter(|sub| topic::matches(&sub.filter, topic)) {
            routed = true;
            if let Err(err) = (sub.sink)(topic, payload) {
                self.record_malformed(err);
            }
        }
        if !routed {
            debug!(%topic, "no subscriber for topic");
        }
    }

    fn record_malformed(&self, err: DecodeError) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        counter!("bus_malformed_payloads_total").increment(1);
        warn!(topic = %err.topic, error = %err.source, "dropping malformed payload");
    }

    /// Last presence status seen for each intersection.
    pub fn presence(&self) -> Vec<PresenceStatus> {
        lock(&self.presence).values().cloned().collect()
    }

    /// Block until the broker acknowledges the session, the timeout elapses,
    /// or `shutdown` is raised.
    pub fn wait_connected(&self, timeout: Duration, shutdown: &AtomicBool) -> Result<(), BusError> {
        let deadline = Instant::now() + timeout;
        while !self.is_connected() {
            if shutdown.load(Ordering::SeqCst) {
                return Err(BusError::Shutdown);
            }
            if Instant::now() >= deadline {
                return Err(BusError::ConnectTimeout(timeout));
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        Ok(())
    }

    /// Announce offline (when presence is configured), close the session and
    /// join the driver thread. Safe to call more than once.
    pub fn disconnect(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.is_connected() {
            if let Some(id) = self.config.presence_id.as_deref() {
                let status = PresenceStatus::now(id, PresenceState::Offline);
                if let Ok(bytes) = serde_json::to_vec(&status) {
                    if let Err(err) = self.publish_raw(&self.config.status_topic(), bytes, true) {
                        warn!(error = %err, "failed to announce offline status");
                    }
                }
            }
            if let Err(err) = self.transport.disconnect() {
                warn!(error = %err, "disconnect request failed");
            }
        }
        if let Some(handle) = lock(&self.driver).take() {
            if handle.join().is_err() {
                warn!("bus driver thread panicked");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        info!(
            broker = %self.config.broker(),
            published = self.published.load(Ordering::Relaxed),
            "disconnected from broker"
        );
    }

    pub fn stats(&self) -> BusStats {
        let micros = self.last_publish_micros.load(Ordering::Relaxed);
        BusStats {
            broker: self.config.broker(),
            connected: self.is_connected(),
            messages_published: self.published.load(Ordering::Relaxed),
            messages_sent: self.acked.load(Ordering::Relaxed),
            messages_received: self.received.load(Ordering::Relaxed),
            malformed_payloads: self.malformed.load(Ordering::Relaxed),
            last_publish_time: (micros > 0).then(|| micros as f64 / 1_000_000.0),
        }
    }
}

fn decoding_sink<M>(tx: Sender<Inbound<M>>) -> Sink
where
    M: DeserializeOwned + Send + 'static,
{
    Box::new(move |topic, payload| {
        let message = serde_json::from_slice::<M>(payload).map_err(|source| DecodeError {
            topic: topic.to_string(),
            source,
        })?;
        if tx
            .send(Inbound {
                topic: topic.to_string(),
                message,
            })
            .is_err()
        {
            debug!(%topic, "subscriber dropped, discarding message");
        }
        Ok(())
    })
}
