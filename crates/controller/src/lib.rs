//! Adaptive signal control.
//!
//! [`AdaptiveController`] keeps a sliding window of vehicle totals per
//! intersection, decides between green and red with hysteresis, and arbitrates
//! operator overrides. Commands leave through a [`CommandSink`] and are
//! persisted through a [`SignalStore`].

pub mod command;
pub mod controller;
pub mod phase;
pub mod sink;
pub mod store;
pub mod timing;
pub mod window;

pub use command::{SignalCommand, dominant_class};
pub use controller::{AdaptiveController, ControllerStats};
pub use phase::{Phase, PhaseParseError, valid_phases};
pub use sink::{CommandSink, SinkError};
pub use store::{
    DetectionSummary, IntersectionRecord, MemoryStore, SignalStore, StoreCounts, StoreError, StoredCommand,
    StoredDetection,
};
pub use timing::TimingConfig;
pub use window::DensityWindow;
