//! Persistence boundary for detections and signal commands.
//!
//! Intersections are keyed by their string id and registered on first
//! sighting; detections and commands are append-only.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use ml_core::DetectionRecord;
use serde::Serialize;
use thiserror::Error;

use crate::{command::SignalCommand, phase::Phase};

const DEFAULT_LANES: u32 = 4;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("intersection {0} is not registered")]
    UnknownIntersection(String),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IntersectionRecord {
    pub id: u64,
    pub intersection_id: String,
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub num_lanes: u32,
    pub is_active: bool,
    pub created_at: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoredDetection {
    pub id: u64,
    pub intersection_id: String,
    pub timestamp: f64,
    pub total_vehicles: u32,
    pub vehicle_counts: BTreeMap<String, u32>,
    pub inference_time_ms: f64,
    pub frame_number: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoredCommand {
    pub id: u64,
    pub intersection_id: String,
    pub timestamp: f64,
    pub phase: Phase,
    pub duration_sec: u32,
    pub reason: String,
    pub vehicle_density: f64,
    pub is_override: bool,
}

/// Aggregate of the detections stored for one intersection since a cut-off.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionSummary {
    pub intersection_id: String,
    pub avg_vehicle_count: f64,
    pub max_vehicle_count: u32,
    pub total_detections: u64,
    pub avg_inference_ms: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub intersections: usize,
    pub detections: usize,
    pub commands: usize,
}

pub trait SignalStore: Send + Sync {
    /// Return the intersection, registering it if it has not been seen.
    fn ensure_intersection(&self, intersection_id: &str) -> Result<IntersectionRecord, StoreError>;
    fn record_detection(&self, record: &DetectionRecord) -> Result<u64, StoreError>;
    fn record_command(&self, command: &SignalCommand) -> Result<u64, StoreError>;

    fn intersections(&self) -> Result<Vec<IntersectionRecord>, StoreError>;
    fn intersection(&self, intersection_id: &str) -> Result<Option<IntersectionRecord>, StoreError>;
    /// Newest first, optionally restricted to one intersection.
    fn recent_detections(&self, intersection_id: Option<&str>, limit: usize) -> Result<Vec<StoredDetection>, StoreError>;
    /// Newest first.
    fn command_history(&self, intersection_id: &str, limit: usize) -> Result<Vec<StoredCommand>, StoreError>;
    fn detection_summary(&self, intersection_id: &str, since: f64) -> Result<DetectionSummary, StoreError>;
    fn counts(&self) -> Result<StoreCounts, StoreError>;
}

#[derive(Default)]
struct Tables {
    intersections: BTreeMap<String, IntersectionRecord>,
    detections: Vec<StoredDetection>,
    commands: Vec<StoredCommand>,
}

/// Process-local [`SignalStore`]. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl SignalStore for MemoryStore {
    fn ensure_intersection(&self, intersection_id: &str) -> Result<IntersectionRecord, StoreError> {
        let mut tables = self.tables();
        let next_id = tables.intersections.len() as u64 + 1;
        let record = tables
            .intersections
            .entry(intersection_id.to_string())
            .or_insert_with(|| {
                tracing::info!(intersection_id, "registered new intersection");
                IntersectionRecord {
                    id: next_id,
                    intersection_id: intersection_id.to_string(),
                    name: format!("Intersection {intersection_id}"),
                    latitude: None,
                    longitude: None,
                    num_lanes: DEFAULT_LANES,
                    is_active: true,
                    created_at: now(),
                }
            });
        Ok(record.clone())
    }

    fn record_detection(&self, record: &DetectionRecord) -> Result<u64, StoreError> {
        let mut tables = self.tables();
        if !tables.intersections.contains_key(record.intersection_id()) {
            return Err(StoreError::UnknownIntersection(record.intersection_id().to_string()));
        }
        let id = tables.detections.len() as u64 + 1;
        tables.detections.push(StoredDetection {
            id,
            intersection_id: record.intersection_id().to_string(),
            timestamp: record.timestamp(),
            total_vehicles: record.total_vehicles(),
            vehicle_counts: record.vehicle_counts().clone(),
            inference_time_ms: record.inference_time_ms(),
            frame_number: record.frame_number(),
        });
        Ok(id)
    }

    fn record_command(&self, command: &SignalCommand) -> Result<u64, StoreError> {
        let mut tables = self.tables();
        if !tables.intersections.contains_key(&command.intersection_id) {
            return Err(StoreError::UnknownIntersection(command.intersection_id.clone()));
        }
        let id = tables.commands.len() as u64 + 1;
        tables.commands.push(StoredCommand {
            id,
            intersection_id: command.intersection_id.clone(),
            timestamp: command.timestamp,
            phase: command.phase,
            duration_sec: command.green_duration_sec,
            reason: command.reason.clone(),
            vehicle_density: command.density_ratio,
            is_override: command.is_override,
        });
        Ok(id)
    }

    fn intersections(&self) -> Result<Vec<IntersectionRecord>, StoreError> {
        let tables = self.tables();
        let mut active: Vec<_> = tables.intersections.values().filter(|i| i.is_active).cloned().collect();
        active.sort_by_key(|i| i.id);
        Ok(active)
    }

    fn intersection(&self, intersection_id: &str) -> Result<Option<IntersectionRecord>, StoreError> {
        Ok(self.tables().intersections.get(intersection_id).cloned())
    }

    fn recent_detections(&self, intersection_id: Option<&str>, limit: usize) -> Result<Vec<StoredDetection>, StoreError> {
        let tables = self.tables();
        let mut rows: Vec<_> = tables
            .detections
            .iter()
            .filter(|d| intersection_id.is_none_or(|id| d.intersection_id == id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.timestamp.total_cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    fn command_history(&self, intersection_id: &str, limit: usize) -> Result<Vec<StoredCommand>, StoreError> {
        let tables = self.tables();
        let mut rows: Vec<_> = tables
            .commands
            .iter()
            .filter(|c| c.intersection_id == intersection_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.timestamp.total_cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    fn detection_summary(&self, intersection_id: &str, since: f64) -> Result<DetectionSummary, StoreError> {
        let tables = self.tables();
        let (mut total, mut max, mut count, mut inference) = (0u64, 0u32, 0u64, 0.0f64);
        for d in tables
            .detections
            .iter()
            .filter(|d| d.intersection_id == intersection_id && d.timestamp >= since)
        {
            total += u64::from(d.total_vehicles);
            max = max.max(d.total_vehicles);
            count += 1;
            inference += d.inference_time_ms;
        }
        let mean = |sum: f64| if count == 0 { 0.0 } else { sum / count as f64 };
        Ok(DetectionSummary {
            intersection_id: intersection_id.to_string(),
            avg_vehicle_count: (mean(total as f64) * 10.0).round() / 10.0,
            max_vehicle_count: max,
            total_detections: count,
            avg_inference_ms: (mean(inference) * 100.0).round() / 100.0,
        })
    }

    fn counts(&self) -> Result<StoreCounts, StoreError> {
        let tables = self.tables();
        Ok(StoreCounts {
            intersections: tables.intersections.len(),
            detections: tables.detections.len(),
            commands: tables.commands.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, frame: u64, timestamp: f64, cars: u32) -> DetectionRecord {
        let counts = BTreeMap::from([("car".to_string(), cars)]);
        DetectionRecord::new(id, frame, timestamp, counts, Vec::new(), 10.0)
    }

    #[test]
    fn registers_once_with_default_name() {
        let store = MemoryStore::new();
        let first = store.ensure_intersection("INT-007").unwrap();
        let again = store.ensure_intersection("INT-007").unwrap();
        assert_eq!(first, again);
        assert_eq!(first.name, "Intersection INT-007");
        assert_eq!(store.counts().unwrap().intersections, 1);
    }

    #[test]
    fn rejects_unregistered_inserts() {
        let store = MemoryStore::new();
        let err = store.record_detection(&record("INT-404", 1, 1.0, 1)).unwrap_err();
        assert!(matches!(err, StoreError::UnknownIntersection(id) if id == "INT-404"));
    }

    #[test]
    fn recent_detections_newest_first_with_limit() {
        let store = MemoryStore::new();
        store.ensure_intersection("A").unwrap();
        store.ensure_intersection("B").unwrap();
        for (i, id) in ["A", "B", "A", "A"].into_iter().enumerate() {
            store.record_detection(&record(id, i as u64, i as f64, 1)).unwrap();
        }
        let rows = store.recent_detections(Some("A"), 2).unwrap();
        assert_eq!(rows.iter().map(|r| r.frame_number).collect::<Vec<_>>(), vec![3, 2]);
        assert_eq!(store.recent_detections(None, 50).unwrap().len(), 4);
    }

    #[test]
    fn summary_averages_window() {
        let store = MemoryStore::new();
        store.ensure_intersection("A").unwrap();
        store.record_detection(&record("A", 1, 10.0, 3)).unwrap();
        store.record_detection(&record("A", 2, 20.0, 4)).unwrap();
        store.record_detection(&record("A", 3, 30.0, 8)).unwrap();
        let summary = store.detection_summary("A", 15.0).unwrap();
        assert_eq!(summary.total_detections, 2);
        assert_eq!(summary.max_vehicle_count, 8);
        assert_eq!(summary.avg_vehicle_count, 6.0);
        assert_eq!(summary.avg_inference_ms, 10.0);
    }
}
