//! Per-frame detection record published from the edge to the server.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// A single retained vehicle detection in source-frame pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBoxDetection {
    #[serde(rename = "class", alias = "class_name")]
    pub class_name: String,
    pub class_id: u32,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("intersection_id must not be empty")]
    MissingIntersection,
    #[error("total_vehicles {total} does not match the sum of vehicle_counts {sum}")]
    TotalMismatch { total: u32, sum: u32 },
    #[error("vehicle_counts sum overflows u32")]
    CountOverflow,
}

fn checked_total(counts: &BTreeMap<String, u32>) -> Option<u32> {
    counts.values().try_fold(0u32, |acc, v| acc.checked_add(*v))
}

/// Vehicle counts for one processed frame.
///
/// `total_vehicles` always equals the sum of `vehicle_counts`; the constructor
/// derives it and decoding rejects payloads that disagree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DetectionRecordWire")]
pub struct DetectionRecord {
    timestamp: f64,
    intersection_id: String,
    frame_number: u64,
    total_vehicles: u32,
    vehicle_counts: BTreeMap<String, u32>,
    detections: Vec<BoundingBoxDetection>,
    inference_time_ms: f64,
}

impl DetectionRecord {
    pub fn new(
        intersection_id: impl Into<String>,
        frame_number: u64,
        timestamp: f64,
        vehicle_counts: BTreeMap<String, u32>,
        detections: Vec<BoundingBoxDetection>,
        inference_time_ms: f64,
    ) -> Self {
        // Per-frame counts are bounded by the detection count; saturate rather than wrap.
        let total_vehicles = checked_total(&vehicle_counts).unwrap_or(u32::MAX);
        Self {
            timestamp,
            intersection_id: intersection_id.into(),
            frame_number,
            total_vehicles,
            vehicle_counts,
            detections,
            inference_time_ms: round_to(inference_time_ms, 2),
        }
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn intersection_id(&self) -> &str {
        &self.intersection_id
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn total_vehicles(&self) -> u32 {
        self.total_vehicles
    }

    pub fn vehicle_counts(&self) -> &BTreeMap<String, u32> {
        &self.vehicle_counts
    }

    pub fn detections(&self) -> &[BoundingBoxDetection] {
        &self.detections
    }

    pub fn inference_time_ms(&self) -> f64 {
        self.inference_time_ms
    }
}

#[derive(Deserialize)]
struct DetectionRecordWire {
    #[serde(default)]
    timestamp: f64,
    intersection_id: String,
    #[serde(default)]
    frame_number: u64,
    total_vehicles: u32,
    #[serde(default)]
    vehicle_counts: BTreeMap<String, u32>,
    #[serde(default)]
    detections: Vec<BoundingBoxDetection>,
    #[serde(default)]
    inference_time_ms: f64,
}

impl TryFrom<DetectionRecordWire> for DetectionRecord {
    type Error = RecordError;

    fn try_from(wire: DetectionRecordWire) -> Result<Self, Self::Error> {
        if wire.intersection_id.trim().is_empty() {
            return Err(RecordError::MissingIntersection);
        }
        let sum = checked_total(&wire.vehicle_counts).ok_or(RecordError::CountOverflow)?;
        if sum != wire.total_vehicles {
            return Err(RecordError::TotalMismatch {
                total: wire.total_vehicles,
                sum,
            });
        }
        Ok(Self {
            timestamp: wire.timestamp,
            intersection_id: wire.intersection_id,
            frame_number: wire.frame_number,
            total_vehicles: wire.total_vehicles,
            vehicle_counts: wire.vehicle_counts,
            detections: wire.detections,
            inference_time_ms: wire.inference_time_ms,
        })
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}
