use std::{collections::BTreeMap, time::Instant};

use anyhow::Context;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};
use video_ingest::Frame;

use crate::{
    classifier::{Classifier, InferenceParams},
    record::{BoundingBox, BoundingBoxDetection, DetectionRecord, round_to},
    taxonomy::VehicleClass,
};

/// Side length of the blank frame used to warm the model up.
const WARMUP_SIZE: i32 = 640;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("model not loaded; call load_model() first")]
    ModelNotReady,
    #[error(transparent)]
    Inference(#[from] anyhow::Error),
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetectorStats {
    pub is_loaded: bool,
    pub total_inferences: u64,
    pub avg_inference_ms: f64,
}

/// Turns one classifier invocation into a [`DetectionRecord`].
pub struct VehicleDetector<C: Classifier> {
    classifier: Option<C>,
    intersection_id: String,
    params: InferenceParams,
    total_inferences: u64,
    avg_inference_ms: f64,
}

impl<C: Classifier> VehicleDetector<C> {
    /// The class filter in `params` is replaced with the vehicle whitelist.
    pub fn new(intersection_id: impl Into<String>, mut params: InferenceParams) -> Self {
        params.class_filter = VehicleClass::class_filter();
        Self {
            classifier: None,
            intersection_id: intersection_id.into(),
            params,
            total_inferences: 0,
            avg_inference_ms: 0.0,
        }
    }

    /// Install the classifier and warm it up with a dummy inference.
    pub fn load_model(&mut self, mut classifier: C) -> Result<(), DetectError> {
        let warmup = Frame::blank(WARMUP_SIZE, WARMUP_SIZE);
        classifier
            .infer(&warmup, &self.params)
            .context("classifier warm-up failed")?;
        self.classifier = Some(classifier);
        info!("Vehicle classifier loaded and warmed up");
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.classifier.is_some()
    }

    pub fn detect(&mut self, frame: &Frame, frame_number: u64) -> Result<DetectionRecord, DetectError> {
        let classifier = self.classifier.as_mut().ok_or(DetectError::ModelNotReady)?;

        let started = Instant::now();
        let raw = classifier
            .infer(frame, &self.params)
            .with_context(|| format!("inference failed on frame #{frame_number}"))?;
        let inference_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut vehicle_counts: BTreeMap<String, u32> = VehicleClass::ALL
            .iter()
            .map(|class| (class.name().to_string(), 0))
            .collect();
        let mut detections = Vec::with_capacity(raw.len());

        for det in raw {
            let Some(class) = VehicleClass::from_class_id(det.class_id) else {
                continue;
            };
            *vehicle_counts.entry(class.name().to_string()).or_insert(0) += 1;
            let [x1, y1, x2, y2] = det.bbox_xyxy;
            detections.push(BoundingBoxDetection {
                class_name: class.name().to_string(),
                class_id: det.class_id,
                confidence: round_to(det.confidence as f64, 3) as f32,
                bbox: BoundingBox {
                    x1: round_to(x1 as f64, 1) as f32,
                    y1: round_to(y1 as f64, 1) as f32,
                    x2: round_to(x2 as f64, 1) as f32,
                    y2: round_to(y2 as f64, 1) as f32,
                },
            });
        }

        self.record_latency(inference_time_ms);
        metrics::histogram!("detector_inference_ms").record(inference_time_ms);

        let timestamp = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let record = DetectionRecord::new(
            self.intersection_id.clone(),
            frame_number,
            timestamp,
            vehicle_counts,
            detections,
            inference_time_ms,
        );
        debug!(
            frame = frame_number,
            vehicles = record.total_vehicles(),
            inference_ms = inference_time_ms,
            "frame processed"
        );
        Ok(record)
    }

    /// Incremental mean: avg_n = avg_{n-1} + (x_n - avg_{n-1}) / n.
    fn record_latency(&mut self, sample_ms: f64) {
        self.total_inferences += 1;
        self.avg_inference_ms += (sample_ms - self.avg_inference_ms) / self.total_inferences as f64;
    }

    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            is_loaded: self.is_loaded(),
            total_inferences: self.total_inferences,
            avg_inference_ms: round_to(self.avg_inference_ms, 2),
        }
    }
}
