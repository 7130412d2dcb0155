use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use metrics::counter;
use ml_core::DetectionRecord;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    command::{SignalCommand, automatic_reason, override_reason},
    phase::Phase,
    sink::CommandSink,
    store::SignalStore,
    timing::TimingConfig,
    window::DensityWindow,
};

struct IntersectionState {
    active_phase: Option<Phase>,
    window: DensityWindow,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ControllerStats {
    pub commands_sent: u64,
    pub active_phases: BTreeMap<String, Phase>,
    pub monitored_intersections: usize,
}

/// Turns per-intersection vehicle counts into phase decisions.
///
/// All state sits behind one lock. A command is delivered and persisted
/// before the lock is released, so commands for an intersection leave in the
/// order their triggering events were processed.
pub struct AdaptiveController {
    timing: TimingConfig,
    sink: Arc<dyn CommandSink>,
    store: Arc<dyn SignalStore>,
    state: Mutex<HashMap<String, IntersectionState>>,
    commands_sent: AtomicU64,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl AdaptiveController {
    pub fn new(timing: TimingConfig, sink: Arc<dyn CommandSink>, store: Arc<dyn SignalStore>) -> Self {
        Self {
            timing,
            sink,
            store,
            state: Mutex::new(HashMap::new()),
            commands_sent: AtomicU64::new(0),
        }
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    fn state(&self) -> MutexGuard<'_, HashMap<String, IntersectionState>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Feed one detection into the intersection's window and return a command
    /// if the desired phase differs from the active one.
    pub fn process(&self, record: &DetectionRecord) -> Option<SignalCommand> {
        let id = record.intersection_id();
        let mut states = self.state();
        let state = states.entry(id.to_string()).or_insert_with(|| {
            debug!(intersection_id = %id, "cold start");
            IntersectionState {
                active_phase: None,
                window: DensityWindow::new(self.timing.window_size),
            }
        });

        state.window.push(record.total_vehicles());
        let smoothed = state.window.mean();
        let density_ratio = self.timing.density_ratio(smoothed);
        let desired = if density_ratio >= self.timing.green_threshold {
            Phase::Green
        } else {
            Phase::Red
        };

        if state.active_phase == Some(desired) {
            return None;
        }

        let command = SignalCommand {
            intersection_id: id.to_string(),
            phase: desired,
            green_duration_sec: self.timing.green_duration(density_ratio),
            yellow_duration_sec: self.timing.yellow_sec,
            vehicle_count: record.total_vehicles(),
            smoothed_count: round_to(smoothed, 1),
            density_ratio: round_to(density_ratio, 3),
            timestamp: now(),
            reason: automatic_reason(
                desired,
                density_ratio,
                smoothed,
                self.timing.traffic_label(density_ratio),
                record.vehicle_counts(),
            ),
            is_override: false,
        };
        state.active_phase = Some(desired);
        self.deliver(&command);
        Some(command)
    }

    /// Force a phase. Always emits; `duration_sec` is used as given.
    pub fn manual_override(&self, intersection_id: &str, phase: Phase, duration_sec: u32) -> SignalCommand {
        let mut states = self.state();
        let state = states
            .entry(intersection_id.to_string())
            .or_insert_with(|| IntersectionState {
                active_phase: None,
                window: DensityWindow::new(self.timing.window_size),
            });

        let command = SignalCommand {
            intersection_id: intersection_id.to_string(),
            phase,
            green_duration_sec: duration_sec,
            yellow_duration_sec: self.timing.yellow_sec,
            vehicle_count: 0,
            smoothed_count: 0.0,
            density_ratio: 0.0,
            timestamp: now(),
            reason: override_reason(phase, duration_sec),
            is_override: true,
        };
        state.active_phase = Some(phase);
        info!(intersection_id, %phase, duration_sec, "manual override");
        self.deliver(&command);
        command
    }

    fn deliver(&self, command: &SignalCommand) {
        match self.sink.send(command) {
            Ok(()) => {
                self.commands_sent.fetch_add(1, Ordering::Relaxed);
                counter!("controller_commands_total", "kind" => command.kind()).increment(1);
                info!(
                    intersection_id = %command.intersection_id,
                    phase = %command.phase,
                    green_duration_sec = command.green_duration_sec,
                    density_ratio = command.density_ratio,
                    "signal command sent"
                );
            }
            Err(err) => warn!(error = %err, "signal command not published"),
        }
        if let Err(err) = self.store.record_command(command) {
            warn!(error = %err, "failed to store signal command");
        }
    }

    pub fn active_phase(&self, intersection_id: &str) -> Option<Phase> {
        self.state().get(intersection_id).and_then(|s| s.active_phase)
    }

    /// Number of samples currently smoothed for an intersection.
    pub fn window_len(&self, intersection_id: &str) -> Option<usize> {
        self.state().get(intersection_id).map(|s| s.window.len())
    }

    pub fn commands_sent(&self) -> u64 {
        self.commands_sent.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ControllerStats {
        let states = self.state();
        ControllerStats {
            commands_sent: self.commands_sent(),
            active_phases: states
                .iter()
                .filter_map(|(id, s)| s.active_phase.map(|phase| (id.clone(), phase)))
                .collect(),
            monitored_intersections: states.values().filter(|s| !s.window.is_empty()).count(),
        }
    }
}
