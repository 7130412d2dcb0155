//! Vehicle counting on top of an opaque object classifier.
//!
//! [`VehicleDetector`] owns the counting and aggregation rules; anything that
//! implements [`Classifier`] can supply the raw boxes. The TorchScript
//! classifier is available behind the `with-tch` feature.

pub mod classifier;
pub mod detector;
pub mod record;
pub mod taxonomy;
#[cfg(feature = "with-tch")]
pub mod torchscript;

pub use classifier::{Classifier, InferenceParams, RawDetection, non_max_suppression};
pub use detector::{DetectError, DetectorStats, VehicleDetector};
pub use record::{BoundingBox, BoundingBoxDetection, DetectionRecord, RecordError};
pub use taxonomy::VehicleClass;

#[cfg(feature = "with-tch")]
pub use tch;
#[cfg(feature = "with-tch")]
pub use torchscript::TorchScriptClassifier;
