//! Edge gateway: camera → vehicle detector → message bus, paced to a fixed interval.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use bus::{MessageBus, MqttTransport, Transport};
use ml_core::{Classifier, DetectionRecord, VehicleDetector};
use tracing::{error, info, warn};
use video_ingest::{CaptureBackend, FeedError, SourceFeed, sleep_unless_shutdown};

use crate::config::EdgeConfig;

const SUMMARY_EVERY: u64 = 20;
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// What one pass of the loop did.
#[derive(Debug)]
pub(crate) enum Cycle {
    Published(DetectionRecord),
    /// Detection ran but the bus refused the record.
    Unsent(DetectionRecord),
    NoFrame,
    Stopped,
}

pub(crate) struct EdgeGateway<B: CaptureBackend, C: Classifier, T: Transport> {
    intersection_id: String,
    feed: SourceFeed<B>,
    detector: VehicleDetector<C>,
    bus: Arc<MessageBus<T>>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    total_detections: u64,
    exhaustion_reported: bool,
    stopped: bool,
}

impl<B: CaptureBackend, C: Classifier, T: Transport> EdgeGateway<B, C, T> {
    pub(crate) fn new(
        intersection_id: String,
        feed: SourceFeed<B>,
        detector: VehicleDetector<C>,
        bus: Arc<MessageBus<T>>,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            intersection_id,
            feed,
            detector,
            bus,
            interval,
            shutdown,
            total_detections: 0,
            exhaustion_reported: false,
            stopped: false,
        }
    }

    /// Load the model, open the camera and wait for the broker. Any failure
    /// here is fatal for the process.
    pub(crate) fn start(&mut self, classifier: C, connect_timeout: Duration) -> Result<()> {
        info!("Initializing vehicle detector");
        self.detector
            .load_model(classifier)
            .context("failed to load detection model")?;

        info!("Connecting to camera feed");
        self.feed.connect().context("failed to connect to camera")?;

        info!("Connecting to message broker");
        self.bus
            .wait_connected(connect_timeout, &self.shutdown)
            .context("failed to connect to message broker")?;

        info!("All components initialized; starting detection pipeline");
        Ok(())
    }

    /// Read, detect and publish once.
    pub(crate) fn run_cycle(&mut self) -> Result<Cycle> {
        let frame = match self.feed.read_frame() {
            Ok(frame) => frame,
            Err(FeedError::Shutdown) => return Ok(Cycle::Stopped),
            Err(FeedError::Exhausted { attempts }) => {
                if !self.exhaustion_reported {
                    error!(attempts, "camera feed exhausted; skipping cycles until restart");
                    self.exhaustion_reported = true;
                }
                return Ok(Cycle::NoFrame);
            }
            Err(err) => {
                warn!(error = %err, "No frame available; retrying");
                return Ok(Cycle::NoFrame);
            }
        };

        let record = self.detector.detect(&frame, self.feed.frame_count())?;
        self.total_detections += 1;

        let sent = self.bus.publish(&self.intersection_id, &record).is_ok();
        if self.total_detections % SUMMARY_EVERY == 0 {
            self.log_summary(&record);
        }
        Ok(if sent { Cycle::Published(record) } else { Cycle::Unsent(record) })
    }

    /// Loop until shutdown, keeping one detection per interval.
    pub(crate) fn run(&mut self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();
            let pause = match self.run_cycle() {
                Ok(Cycle::Published(_) | Cycle::Unsent(_)) => self.interval.saturating_sub(started.elapsed()),
                Ok(Cycle::NoFrame) => RETRY_PAUSE,
                Ok(Cycle::Stopped) => break,
                Err(err) => {
                    error!("Pipeline error: {err:?}");
                    RETRY_PAUSE
                }
            };
            if !pause.is_zero() && !sleep_unless_shutdown(pause, &self.shutdown) {
                break;
            }
        }
    }

    fn log_summary(&self, record: &DetectionRecord) {
        let detector = self.detector.stats();
        let bus = self.bus.stats();
        info!(
            detections = self.total_detections,
            vehicles_in_frame = record.total_vehicles(),
            counts = ?record.vehicle_counts(),
            inference_ms = record.inference_time_ms(),
            avg_inference_ms = detector.avg_inference_ms,
            messages_sent = bus.messages_sent,
            "[Summary]"
        );
    }

    /// Release the camera and close the broker session. Idempotent.
    pub(crate) fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("Shutting down edge gateway");
        self.feed.release();
        self.bus.disconnect();
        info!(feed = ?self.feed.stats(), "Edge gateway stopped");
    }
}

impl<B: CaptureBackend, C: Classifier, T: Transport> Drop for EdgeGateway<B, C, T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(feature = "with-opencv")]
fn capture_backend(source: &str) -> Box<dyn CaptureBackend> {
    Box::new(video_ingest::OpenCvBackend::new(source))
}

#[cfg(not(feature = "with-opencv"))]
fn capture_backend(source: &str) -> Box<dyn CaptureBackend> {
    Box::new(video_ingest::FfmpegBackend::new(source))
}

#[cfg(feature = "with-tch")]
fn load_classifier(config: &EdgeConfig) -> Result<Box<dyn Classifier>> {
    use ml_core::tch::{Cuda, Device};

    let device = if config.use_cpu || !Cuda::is_available() {
        Device::Cpu
    } else {
        Device::Cuda(0)
    };
    info!(model = %config.model_path.display(), ?device, "Loading TorchScript detector");
    let classifier = ml_core::TorchScriptClassifier::load(&config.model_path, device)
        .with_context(|| format!("failed to load model from {}", config.model_path.display()))?;
    Ok(Box::new(classifier))
}

#[cfg(not(feature = "with-tch"))]
fn load_classifier(_config: &EdgeConfig) -> Result<Box<dyn Classifier>> {
    anyhow::bail!("this build has no inference backend; rebuild with `--features with-tch`")
}

/// Entry point for the `edge` subcommand.
pub(crate) fn run(config: EdgeConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    let span = tracing::info_span!(
        "edge",
        intersection_id = %config.intersection_id,
        source = %config.source,
    );
    let _span = span.enter();

    info!(
        intersection_id = %config.intersection_id,
        source = %config.source,
        model = %config.model_path.display(),
        confidence = config.inference.confidence_threshold,
        broker = %config.bus.broker(),
        interval_ms = config.interval.as_millis() as u64,
        "Edge gateway configuration"
    );

    let classifier = load_classifier(&config)?;
    let feed = SourceFeed::new(
        capture_backend(&config.source),
        config.capture.clone(),
        config.reconnect.clone(),
        shutdown.clone(),
    );
    let detector = VehicleDetector::new(config.intersection_id.clone(), config.inference.clone());
    let bus: Arc<MessageBus<MqttTransport>> =
        MessageBus::connect(config.bus.clone()).context("failed to start MQTT client")?;

    let mut gateway = EdgeGateway::new(
        config.intersection_id.clone(),
        feed,
        detector,
        bus,
        config.interval,
        shutdown,
    );
    gateway.start(classifier, config.connect_timeout)?;
    gateway.run();
    gateway.stop();
    info!("Edge gateway stopped. Goodbye!");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, VecDeque},
        sync::Mutex,
    };

    use bus::{BusConfig, BusError, BusEvent};
    use ml_core::{InferenceParams, RawDetection};
    use video_ingest::{CaptureError, CaptureSettings, Frame, ReconnectPolicy};

    use super::*;

    struct ScriptedBackend {
        reads: VecDeque<Result<(), ()>>,
    }

    impl CaptureBackend for ScriptedBackend {
        fn open(&mut self, _settings: &CaptureSettings) -> Result<(), CaptureError> {
            Ok(())
        }

        fn read(&mut self) -> Result<Frame, CaptureError> {
            match self.reads.pop_front() {
                Some(Ok(())) => Ok(Frame::blank(64, 48)),
                _ => Err(CaptureError::NotOpen),
            }
        }

        fn release(&mut self) {}

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    struct TwoCars;

    impl Classifier for TwoCars {
        fn infer(&mut self, _frame: &Frame, _params: &InferenceParams) -> anyhow::Result<Vec<RawDetection>> {
            Ok(vec![
                RawDetection {
                    class_id: 2,
                    confidence: 0.9,
                    bbox_xyxy: [0.0, 0.0, 10.0, 10.0],
                },
                RawDetection {
                    class_id: 2,
                    confidence: 0.8,
                    bbox_xyxy: [20.0, 20.0, 30.0, 30.0],
                },
            ])
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl Transport for RecordingTransport {
        fn publish(&self, topic: &str, payload: Vec<u8>, _retain: bool) -> Result<(), BusError> {
            self.published.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }

        fn subscribe(&self, _filter: &str) -> Result<(), BusError> {
            Ok(())
        }

        fn disconnect(&self) -> Result<(), BusError> {
            Ok(())
        }
    }

    fn gateway(
        reads: Vec<Result<(), ()>>,
        connected: bool,
    ) -> (
        EdgeGateway<ScriptedBackend, TwoCars, RecordingTransport>,
        Arc<MessageBus<RecordingTransport>>,
    ) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let feed = SourceFeed::new(
            ScriptedBackend { reads: reads.into() },
            CaptureSettings::default(),
            ReconnectPolicy::new(Duration::from_millis(1), 2),
            shutdown.clone(),
        );
        let detector = VehicleDetector::new("INT-001", InferenceParams::default());
        let config = BusConfig::new("localhost", 1883, "edge", "neuroflow/detections").with_presence("INT-001");
        let bus = Arc::new(MessageBus::new(RecordingTransport::default(), config));
        bus.handle_event(BusEvent::Connected);
        let mut gateway = EdgeGateway::new(
            "INT-001".into(),
            feed,
            detector,
            bus.clone(),
            Duration::from_millis(10),
            shutdown,
        );
        gateway.start(TwoCars, Duration::from_millis(200)).unwrap();
        if !connected {
            bus.handle_event(BusEvent::Disconnected {
                reason: "broker went away".into(),
            });
        }
        (gateway, bus)
    }

    #[test]
    fn publishes_record_under_intersection_topic() {
        let (mut gateway, bus) = gateway(vec![Ok(())], true);
        let Cycle::Published(record) = gateway.run_cycle().unwrap() else {
            panic!("expected a published record");
        };
        assert_eq!(record.total_vehicles(), 2);
        assert_eq!(record.frame_number(), 1);
        assert_eq!(record.vehicle_counts(), &BTreeMap::from([
            ("bus".to_string(), 0),
            ("car".to_string(), 2),
            ("motorcycle".to_string(), 0),
            ("truck".to_string(), 0),
        ]));
        assert_eq!(bus.stats().messages_published, 2, "presence + record");
    }

    #[test]
    fn missing_frame_skips_cycle() {
        let (mut gateway, _bus) = gateway(vec![Err(())], true);
        assert!(matches!(gateway.run_cycle().unwrap(), Cycle::NoFrame));
    }

    #[test]
    fn disconnected_bus_does_not_stop_detection() {
        let (mut gateway, bus) = gateway(vec![Ok(())], false);
        assert!(matches!(gateway.run_cycle().unwrap(), Cycle::Unsent(_)));
        assert_eq!(bus.stats().messages_published, 1, "only the presence announcement");
    }

    #[test]
    fn start_fails_without_broker() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let feed = SourceFeed::new(
            ScriptedBackend { reads: VecDeque::new() },
            CaptureSettings::default(),
            ReconnectPolicy::new(Duration::from_millis(1), 1),
            shutdown.clone(),
        );
        let bus = Arc::new(MessageBus::new(
            RecordingTransport::default(),
            BusConfig::new("localhost", 1883, "edge", "t"),
        ));
        let mut gateway = EdgeGateway::new(
            "INT-001".into(),
            feed,
            VehicleDetector::new("INT-001", InferenceParams::default()),
            bus,
            Duration::from_millis(10),
            shutdown,
        );
        let err = gateway.start(TwoCars, Duration::from_millis(150)).unwrap_err();
        assert!(format!("{err:#}").contains("message broker"));
    }

    #[test]
    fn stop_announces_offline_once() {
        let (mut gateway, bus) = gateway(vec![], true);
        gateway.stop();
        gateway.stop();
        assert!(!bus.is_connected());
        assert_eq!(bus.stats().messages_published, 2, "online + offline");
    }
}
