//! Command-line and environment configuration for both services.
//!
//! Clap parses raw arguments (every flag can also come from the environment or
//! a `.env` file); `TryFrom` turns them into validated configs that the rest of
//! the binary uses without re-checking.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use bus::BusConfig;
use clap::Args;
use controller::TimingConfig;
use ml_core::InferenceParams;
use video_ingest::{CaptureSettings, ReconnectPolicy};

/// Optional tracing outputs.
#[derive(Clone, Debug, Default)]
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing spans.
    pub chrome_trace_path: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct TelemetryArgs {
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH", env = "CHROME_TRACE")]
    pub chrome_trace: Option<PathBuf>,
}

impl From<TelemetryArgs> for TelemetryOptions {
    fn from(args: TelemetryArgs) -> Self {
        Self {
            chrome_trace_path: args.chrome_trace,
        }
    }
}

#[derive(Debug, Args)]
pub struct BrokerArgs {
    #[arg(long = "mqtt-host", env = "MQTT_BROKER_HOST", default_value = "localhost")]
    pub host: String,
    #[arg(long = "mqtt-port", env = "MQTT_BROKER_PORT", default_value_t = 1883)]
    pub port: u16,
    /// Base topic for detection records; presence lives under `<topic>/status`.
    #[arg(long = "detections-topic", env = "MQTT_TOPIC_DETECTIONS", default_value = "neuroflow/detections")]
    pub detections_topic: String,
}

fn check_broker(args: &BrokerArgs) -> Result<()> {
    if args.host.trim().is_empty() {
        bail!("--mqtt-host must not be empty");
    }
    if args.port == 0 {
        bail!("--mqtt-port must be non-zero");
    }
    check_topic("--detections-topic", &args.detections_topic)
}

fn check_topic(flag: &str, topic: &str) -> Result<()> {
    let topic = topic.trim_matches('/');
    if topic.is_empty() {
        bail!("{flag} must not be empty");
    }
    if topic.contains(['+', '#']) {
        bail!("{flag} must not contain MQTT wildcards");
    }
    Ok(())
}

/// CLI arguments accepted by the `edge` subcommand.
#[derive(Debug, Args)]
pub struct EdgeArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,
    #[arg(long = "client-id", env = "MQTT_CLIENT_ID_EDGE", default_value = "edge-gateway-01")]
    pub client_id: String,
    #[arg(long = "intersection-id", env = "INTERSECTION_ID", default_value = "INT-001")]
    pub intersection_id: String,

    /// Camera device index or stream URI (rtsp://...).
    #[arg(long = "source", env = "CAMERA_SOURCE", default_value = "0")]
    pub source: String,
    #[arg(long = "width", env = "CAMERA_FRAME_WIDTH", default_value_t = 1280)]
    pub width: i32,
    #[arg(long = "height", env = "CAMERA_FRAME_HEIGHT", default_value_t = 720)]
    pub height: i32,
    #[arg(long = "fps", env = "CAMERA_FPS", default_value_t = 30.0)]
    pub fps: f64,
    /// Base delay before the first reconnect attempt, doubled per attempt.
    #[arg(long = "reconnect-delay-sec", env = "CAMERA_RECONNECT_DELAY_SEC", default_value_t = 5)]
    pub reconnect_delay_sec: u64,
    #[arg(long = "max-retries", env = "CAMERA_MAX_RETRIES", default_value_t = 10)]
    pub max_retries: u32,
    /// Seconds without a frame before the camera counts as stalled.
    #[arg(long = "read-timeout-sec", env = "CAMERA_READ_TIMEOUT_SEC", default_value_t = 5)]
    pub read_timeout_sec: u64,

    /// TorchScript export of the detector.
    #[arg(long = "model", env = "YOLO_MODEL_PATH", default_value = "yolov8n.torchscript")]
    pub model_path: PathBuf,
    #[arg(long = "confidence", env = "YOLO_CONFIDENCE_THRESHOLD", default_value_t = 0.5)]
    pub confidence: f32,
    #[arg(long = "iou", env = "YOLO_IOU_THRESHOLD", default_value_t = 0.45)]
    pub iou: f32,
    #[arg(long = "image-size", env = "YOLO_IMG_SIZE", default_value_t = 640)]
    pub image_size: u32,
    /// Force CPU inference.
    #[arg(long = "cpu", env = "EDGE_FORCE_CPU", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,

    #[arg(long = "interval-ms", env = "DETECTION_INTERVAL_MS", default_value_t = 500)]
    pub interval_ms: u64,
    /// Seconds to wait for the first broker session before giving up.
    #[arg(long = "connect-timeout-sec", env = "MQTT_CONNECT_TIMEOUT_SEC", default_value_t = 10)]
    pub connect_timeout_sec: u64,

    #[command(flatten)]
    pub telemetry: TelemetryArgs,
}

#[derive(Clone, Debug)]
pub struct EdgeConfig {
    pub intersection_id: String,
    pub source: String,
    pub capture: CaptureSettings,
    pub reconnect: ReconnectPolicy,
    pub model_path: PathBuf,
    pub use_cpu: bool,
    pub inference: InferenceParams,
    pub interval: Duration,
    pub connect_timeout: Duration,
    pub bus: BusConfig,
    pub telemetry: TelemetryOptions,
}

impl TryFrom<EdgeArgs> for EdgeConfig {
    type Error = anyhow::Error;

    fn try_from(args: EdgeArgs) -> Result<Self> {
        check_broker(&args.broker)?;
        let intersection_id = args.intersection_id.trim().to_string();
        if intersection_id.is_empty() {
            bail!("--intersection-id must not be empty");
        }
        if intersection_id.contains(['/', '+', '#']) {
            bail!("--intersection-id is used as a topic level and must not contain '/', '+' or '#'");
        }
        if intersection_id == bus::topic::STATUS_SUFFIX {
            bail!("--intersection-id `{intersection_id}` is reserved for presence messages");
        }
        if args.source.trim().is_empty() {
            bail!("--source must not be empty");
        }
        if args.width <= 0 || args.height <= 0 {
            bail!("Capture width and height must be positive integers");
        }
        if !(args.fps.is_finite() && args.fps > 0.0) {
            bail!("--fps must be positive");
        }
        if args.reconnect_delay_sec == 0 {
            bail!("--reconnect-delay-sec must be at least 1");
        }
        if !(0.0..=1.0).contains(&args.confidence) {
            bail!("--confidence must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&args.iou) {
            bail!("--iou must be within [0, 1]");
        }
        if args.image_size == 0 || args.image_size % 32 != 0 {
            bail!("--image-size must be a positive multiple of 32");
        }
        if args.interval_ms == 0 {
            bail!("--interval-ms must be at least 1");
        }
        if args.connect_timeout_sec == 0 {
            bail!("--connect-timeout-sec must be at least 1");
        }
        if args.read_timeout_sec == 0 {
            bail!("--read-timeout-sec must be at least 1");
        }

        let capture = CaptureSettings {
            width: args.width,
            height: args.height,
            fps: args.fps,
            read_timeout: Duration::from_secs(args.read_timeout_sec),
            ..CaptureSettings::default()
        };
        let reconnect = ReconnectPolicy::new(Duration::from_secs(args.reconnect_delay_sec), args.max_retries);
        let inference = InferenceParams {
            confidence_threshold: args.confidence,
            iou_threshold: args.iou,
            image_size: args.image_size,
            ..InferenceParams::default()
        };
        let bus = BusConfig::new(
            args.broker.host,
            args.broker.port,
            args.client_id,
            args.broker.detections_topic,
        )
        .with_presence(intersection_id.clone());

        Ok(Self {
            intersection_id,
            source: args.source,
            capture,
            reconnect,
            model_path: args.model_path,
            use_cpu: args.use_cpu,
            inference,
            interval: Duration::from_millis(args.interval_ms),
            connect_timeout: Duration::from_secs(args.connect_timeout_sec),
            bus,
            telemetry: args.telemetry.into(),
        })
    }
}

/// CLI arguments accepted by the `server` subcommand.
#[derive(Debug, Args)]
pub struct ServerArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,
    #[arg(long = "commands-topic", env = "MQTT_TOPIC_COMMANDS", default_value = "neuroflow/commands")]
    pub commands_topic: String,
    /// Client id of the detection subscriber; the command publisher appends `-controller`.
    #[arg(long = "client-id", env = "MQTT_CLIENT_ID_SERVER", default_value = "traffic-server")]
    pub client_id: String,

    #[arg(long = "host", env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub http_host: String,
    #[arg(long = "port", env = "SERVER_PORT", default_value_t = 8000)]
    pub http_port: u16,

    #[arg(long = "min-green", env = "MIN_GREEN_DURATION_SEC", default_value_t = 15)]
    pub min_green_sec: u32,
    #[arg(long = "max-green", env = "MAX_GREEN_DURATION_SEC", default_value_t = 90)]
    pub max_green_sec: u32,
    #[arg(long = "base-green", env = "DEFAULT_GREEN_DURATION_SEC", default_value_t = 30)]
    pub base_green_sec: u32,
    #[arg(long = "yellow", env = "YELLOW_DURATION_SEC", default_value_t = 5)]
    pub yellow_sec: u32,
    #[arg(long = "scaling-factor", env = "DENSITY_SCALING_FACTOR", default_value_t = 2.5)]
    pub scaling_factor: f64,
    /// Vehicles per lane at saturation.
    #[arg(long = "lane-capacity", env = "LANE_CAPACITY", default_value_t = 15.0)]
    pub lane_capacity: f64,

    #[arg(long = "connect-timeout-sec", env = "MQTT_CONNECT_TIMEOUT_SEC", default_value_t = 10)]
    pub connect_timeout_sec: u64,

    #[command(flatten)]
    pub telemetry: TelemetryArgs,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub detections_bus: BusConfig,
    pub commands_bus: BusConfig,
    pub http_addr: SocketAddr,
    pub timing: TimingConfig,
    pub connect_timeout: Duration,
    pub telemetry: TelemetryOptions,
}

impl TryFrom<ServerArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServerArgs) -> Result<Self> {
        check_broker(&args.broker)?;
        check_topic("--commands-topic", &args.commands_topic)?;
        if args.client_id.trim().is_empty() {
            bail!("--client-id must not be empty");
        }
        let http_addr: SocketAddr = format!("{}:{}", args.http_host, args.http_port)
            .parse()
            .with_context(|| format!("invalid HTTP bind address {}:{}", args.http_host, args.http_port))?;

        if args.min_green_sec == 0 {
            bail!("--min-green must be at least 1");
        }
        if !(args.min_green_sec <= args.base_green_sec && args.base_green_sec <= args.max_green_sec) {
            bail!(
                "green durations must satisfy min <= base <= max (got {} / {} / {})",
                args.min_green_sec,
                args.base_green_sec,
                args.max_green_sec
            );
        }
        if !(args.lane_capacity.is_finite() && args.lane_capacity > 0.0) {
            bail!("--lane-capacity must be positive");
        }
        if !(args.scaling_factor.is_finite() && args.scaling_factor >= 0.0) {
            bail!("--scaling-factor must be non-negative");
        }
        if args.connect_timeout_sec == 0 {
            bail!("--connect-timeout-sec must be at least 1");
        }

        let timing = TimingConfig {
            lane_capacity: args.lane_capacity,
            min_green_sec: args.min_green_sec,
            max_green_sec: args.max_green_sec,
            base_green_sec: args.base_green_sec,
            yellow_sec: args.yellow_sec,
            scaling_factor: args.scaling_factor,
            ..TimingConfig::default()
        };
        let detections_bus = BusConfig::new(
            args.broker.host.clone(),
            args.broker.port,
            args.client_id.clone(),
            args.broker.detections_topic,
        );
        let commands_bus = BusConfig::new(
            args.broker.host,
            args.broker.port,
            format!("{}-controller", args.client_id),
            args.commands_topic,
        );

        Ok(Self {
            detections_bus,
            commands_bus,
            http_addr,
            timing,
            connect_timeout: Duration::from_secs(args.connect_timeout_sec),
            telemetry: args.telemetry.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct EdgeOnly {
        #[command(flatten)]
        args: EdgeArgs,
    }

    #[derive(Parser)]
    struct ServerOnly {
        #[command(flatten)]
        args: ServerArgs,
    }

    fn edge(argv: &[&str]) -> Result<EdgeConfig> {
        let parsed = EdgeOnly::try_parse_from(std::iter::once("edge").chain(argv.iter().copied()))?;
        EdgeConfig::try_from(parsed.args)
    }

    fn server(argv: &[&str]) -> Result<ServerConfig> {
        let parsed = ServerOnly::try_parse_from(std::iter::once("server").chain(argv.iter().copied()))?;
        ServerConfig::try_from(parsed.args)
    }

    #[test]
    fn edge_overrides_apply() {
        let config = edge(&[
            "--intersection-id",
            "INT-042",
            "--source",
            "rtsp://cam/stream",
            "--interval-ms",
            "250",
            "--max-retries",
            "3",
        ])
        .unwrap();
        assert_eq!(config.intersection_id, "INT-042");
        assert_eq!(config.source, "rtsp://cam/stream");
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.reconnect.max_retries, 3);
        assert_eq!(config.capture.read_timeout, Duration::from_secs(5));
        assert_eq!(config.bus.presence_id.as_deref(), Some("INT-042"));
        assert_eq!(config.bus.status_topic(), format!("{}/status", config.bus.base_topic));
    }

    #[test]
    fn edge_rejects_bad_values() {
        assert!(edge(&["--intersection-id", "a/b"]).is_err());
        assert!(edge(&["--intersection-id", "+"]).is_err());
        let err = edge(&["--intersection-id", "status"]).unwrap_err();
        assert!(err.to_string().contains("reserved"), "{err}");
        assert!(edge(&["--confidence", "1.5"]).is_err());
        assert!(edge(&["--image-size", "100"]).is_err());
        assert!(edge(&["--interval-ms", "0"]).is_err());
        assert!(edge(&["--read-timeout-sec", "0"]).is_err());
    }

    #[test]
    fn server_splits_client_ids() {
        let config = server(&["--client-id", "srv", "--port", "9000"]).unwrap();
        assert_eq!(config.detections_bus.client_id, "srv");
        assert_eq!(config.commands_bus.client_id, "srv-controller");
        assert_eq!(config.http_addr.port(), 9000);
        assert!(config.detections_bus.presence_id.is_none());
    }

    #[test]
    fn server_validates_green_bounds() {
        assert!(server(&["--min-green", "40", "--base-green", "30"]).is_err());
        assert!(server(&["--max-green", "20"]).is_err());
        assert!(server(&["--lane-capacity", "0"]).is_err());
    }
}
