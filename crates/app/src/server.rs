//! Control server: detections in, signal commands out, API on the side.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use bus::{Inbound, MessageBus, Transport};
use controller::{AdaptiveController, CommandSink, MemoryStore, SignalCommand, SignalStore, SinkError};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use ml_core::DetectionRecord;
use tracing::{debug, info, info_span, warn};

use crate::{
    api::{self, ApiState},
    config::ServerConfig,
    telemetry,
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Publishes controller commands on `<commands topic>/<intersection_id>`.
struct BusCommandSink<T: Transport>(Arc<MessageBus<T>>);

impl<T: Transport> CommandSink for BusCommandSink<T> {
    fn send(&self, command: &SignalCommand) -> Result<(), SinkError> {
        self.0
            .publish(&command.intersection_id, command)
            .map(|_| ())
            .map_err(|err| SinkError {
                intersection_id: command.intersection_id.clone(),
                reason: err.to_string(),
            })
    }
}

/// Disconnects the wrapped bus when dropped, so early returns still say goodbye.
struct Connected<T: Transport>(Arc<MessageBus<T>>);

impl<T: Transport> Drop for Connected<T> {
    fn drop(&mut self) {
        self.0.disconnect();
    }
}

/// Store the detection and let the controller decide on a command.
pub(crate) fn handle_detection(record: &DetectionRecord, store: &dyn SignalStore, controller: &AdaptiveController) {
    let intersection_id = record.intersection_id();
    debug!(
        intersection_id,
        total_vehicles = record.total_vehicles(),
        frame = record.frame_number(),
        "detection received"
    );
    if let Err(err) = store.ensure_intersection(intersection_id) {
        warn!(intersection_id, "failed to register intersection: {err}");
    }
    if let Err(err) = store.record_detection(record) {
        warn!(intersection_id, "failed to store detection: {err}");
    }
    if let Some(command) = controller.process(record) {
        debug!(intersection_id, phase = %command.phase, "command issued");
    }
}

/// Drain inbound detections until shutdown or the bus drops the channel.
pub(crate) fn dispatch_detections(
    inbound: Receiver<Inbound<DetectionRecord>>,
    store: Arc<dyn SignalStore>,
    controller: Arc<AdaptiveController>,
    shutdown: Arc<AtomicBool>,
) -> u64 {
    let mut handled = 0u64;
    while !shutdown.load(Ordering::Relaxed) {
        match inbound.recv_timeout(POLL_INTERVAL) {
            Ok(Inbound { topic, message }) => {
                if topic.rsplit('/').next() != Some(message.intersection_id()) {
                    debug!(%topic, intersection_id = message.intersection_id(), "topic and payload disagree on intersection");
                }
                handle_detection(&message, store.as_ref(), &controller);
                handled += 1;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    handled
}

pub(crate) fn run(config: ServerConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    let _span = info_span!("server", http = %config.http_addr).entered();
    info!("Traffic controller server starting");
    info!(
        detections = %config.detections_bus.base_topic,
        commands = %config.commands_bus.base_topic,
        broker = %config.detections_bus.broker(),
        min_green = config.timing.min_green_sec,
        max_green = config.timing.max_green_sec,
        base_green = config.timing.base_green_sec,
        "configuration"
    );
    let started_at = Instant::now();
    let prometheus = telemetry::init_metrics_recorder()?;

    let store: Arc<dyn SignalStore> = Arc::new(MemoryStore::new());

    let commands = Connected(MessageBus::connect(config.commands_bus).context("failed to start command publisher")?);
    let detections =
        Connected(MessageBus::connect(config.detections_bus).context("failed to start detection subscriber")?);
    let inbound = detections
        .0
        .subscribe::<DetectionRecord>("+")
        .context("failed to subscribe to detections")?;

    commands
        .0
        .wait_connected(config.connect_timeout, &shutdown)
        .context("command publisher never reached the broker")?;
    detections
        .0
        .wait_connected(config.connect_timeout, &shutdown)
        .context("detection subscriber never reached the broker")?;

    let controller = Arc::new(AdaptiveController::new(
        config.timing,
        Arc::new(BusCommandSink(commands.0.clone())),
        store.clone(),
    ));

    let dispatcher = {
        let store = store.clone();
        let controller = controller.clone();
        let shutdown = shutdown.clone();
        telemetry::spawn_thread("detection-dispatch", move || {
            dispatch_detections(inbound, store, controller, shutdown)
        })
        .context("failed to spawn detection dispatcher")?
    };

    let api_state = ApiState {
        controller: controller.clone(),
        store,
        detections: detections.0.clone(),
        commands: commands.0.clone(),
        prometheus: Some(prometheus),
        started_at,
    };
    let api = match api::spawn_api_server(config.http_addr, api_state) {
        Ok(api) => api,
        Err(err) => {
            shutdown.store(true, Ordering::SeqCst);
            let _ = dispatcher.join();
            return Err(err);
        }
    };
    info!("Server ready");

    while !shutdown.load(Ordering::Relaxed) {
        if dispatcher.is_finished() {
            warn!("detection dispatcher exited; shutting down");
            shutdown.store(true, Ordering::SeqCst);
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    info!("Shutting down server...");
    api.stop();
    let handled = dispatcher.join().unwrap_or_default();
    drop(detections);
    drop(commands);
    info!(
        detections_handled = handled,
        commands_sent = controller.commands_sent(),
        "Server stopped. Goodbye!"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Mutex};

    use bus::{BusConfig, BusError, BusEvent};
    use controller::{Phase, TimingConfig};

    use super::*;

    #[derive(Default)]
    struct RecordingTransport {
        published: Mutex<Vec<String>>,
    }

    impl Transport for RecordingTransport {
        fn publish(&self, topic: &str, _payload: Vec<u8>, _retain: bool) -> Result<(), BusError> {
            self.published.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        fn subscribe(&self, _filter: &str) -> Result<(), BusError> {
            Ok(())
        }

        fn disconnect(&self) -> Result<(), BusError> {
            Ok(())
        }
    }

    fn record(id: &str, frame: u64, cars: u32) -> DetectionRecord {
        let counts = BTreeMap::from([("car".to_string(), cars)]);
        DetectionRecord::new(id, frame, frame as f64, counts, Vec::new(), 15.0)
    }

    fn command_bus() -> Arc<MessageBus<RecordingTransport>> {
        let bus = Arc::new(MessageBus::new(
            RecordingTransport::default(),
            BusConfig::new("localhost", 1883, "test-controller", "neuroflow/commands"),
        ));
        bus.handle_event(BusEvent::Connected);
        bus
    }

    #[test]
    fn commands_reach_intersection_topic() {
        let bus = command_bus();
        let store = Arc::new(MemoryStore::new());
        let controller = AdaptiveController::new(
            TimingConfig::default(),
            Arc::new(BusCommandSink(bus.clone())),
            store.clone(),
        );

        handle_detection(&record("INT-001", 0, 12), store.as_ref(), &controller);

        assert_eq!(controller.active_phase("INT-001"), Some(Phase::Green));
        assert_eq!(controller.commands_sent(), 1);
        assert_eq!(
            *bus.transport().published.lock().unwrap(),
            vec!["neuroflow/commands/INT-001".to_string()]
        );
        assert_eq!(store.counts().unwrap().detections, 1);
    }

    #[test]
    fn offline_publisher_still_advances_controller() {
        let bus = Arc::new(MessageBus::new(
            RecordingTransport::default(),
            BusConfig::new("localhost", 1883, "test-controller", "neuroflow/commands"),
        ));
        let store = Arc::new(MemoryStore::new());
        store.ensure_intersection("INT-002").unwrap();
        let controller =
            AdaptiveController::new(TimingConfig::default(), Arc::new(BusCommandSink(bus.clone())), store.clone());

        let command = controller.manual_override("INT-002", Phase::Red, 30);

        assert!(command.is_override);
        assert_eq!(controller.commands_sent(), 0);
        assert_eq!(controller.active_phase("INT-002"), Some(Phase::Red));
        assert!(bus.transport().published.lock().unwrap().is_empty());
        assert_eq!(store.command_history("INT-002", 5).unwrap().len(), 1);
        assert_eq!(bus.stats().messages_published, 0);
    }

    #[test]
    fn overflowing_counts_are_dropped_as_malformed() {
        let bus = MessageBus::new(
            RecordingTransport::default(),
            BusConfig::new("localhost", 1883, "traffic-server", "neuroflow/detections"),
        );
        let inbound = bus.subscribe::<DetectionRecord>("+").unwrap();
        bus.handle_event(BusEvent::Connected);

        bus.handle_event(BusEvent::Message {
            topic: "neuroflow/detections/INT-001".into(),
            payload: br#"{"intersection_id":"INT-001","total_vehicles":0,"vehicle_counts":{"car":4294967295,"bus":1}}"#
                .to_vec(),
        });
        bus.handle_event(BusEvent::Message {
            topic: "neuroflow/detections/INT-001".into(),
            payload: br#"{"intersection_id":"INT-001","total_vehicles":2,"vehicle_counts":{"car":2}}"#.to_vec(),
        });

        assert_eq!(bus.stats().malformed_payloads, 1);
        assert_eq!(inbound.try_recv().unwrap().message.total_vehicles(), 2);
        assert!(inbound.try_recv().is_err());
    }

    #[test]
    fn dispatcher_drains_until_channel_closes() {
        let bus = command_bus();
        let store: Arc<dyn SignalStore> = Arc::new(MemoryStore::new());
        let controller = Arc::new(AdaptiveController::new(
            TimingConfig::default(),
            Arc::new(BusCommandSink(bus)),
            store.clone(),
        ));
        let (tx, rx) = crossbeam_channel::unbounded();
        for frame in 0..3 {
            tx.send(Inbound {
                topic: "neuroflow/detections/INT-003".into(),
                message: record("INT-003", frame, 1),
            })
            .unwrap();
        }
        drop(tx);

        let handled = dispatch_detections(rx, store.clone(), controller.clone(), Arc::new(AtomicBool::new(false)));
        assert_eq!(handled, 3);
        assert_eq!(store.counts().unwrap().detections, 3);
        assert_eq!(controller.active_phase("INT-003"), Some(Phase::Red));
    }

    #[test]
    fn dispatcher_stops_on_shutdown() {
        let store: Arc<dyn SignalStore> = Arc::new(MemoryStore::new());
        let controller = Arc::new(AdaptiveController::new(
            TimingConfig::default(),
            Arc::new(BusCommandSink(command_bus())),
            store.clone(),
        ));
        let (_tx, rx) = crossbeam_channel::unbounded();
        let handled = dispatch_detections(rx, store, controller, Arc::new(AtomicBool::new(true)));
        assert_eq!(handled, 0);
    }
}
