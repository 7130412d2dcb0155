use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    thread,
};

use controller::{
    AdaptiveController, CommandSink, MemoryStore, Phase, SignalCommand, SignalStore, SinkError, TimingConfig,
};
use ml_core::DetectionRecord;

#[derive(Default)]
struct CapturingSink {
    sent: Mutex<Vec<SignalCommand>>,
    offline: bool,
}

impl CommandSink for CapturingSink {
    fn send(&self, command: &SignalCommand) -> Result<(), SinkError> {
        if self.offline {
            return Err(SinkError {
                intersection_id: command.intersection_id.clone(),
                reason: "not connected".into(),
            });
        }
        self.sent.lock().unwrap().push(command.clone());
        Ok(())
    }
}

struct Harness {
    controller: AdaptiveController,
    sink: Arc<CapturingSink>,
    store: Arc<MemoryStore>,
}

fn harness() -> Harness {
    harness_with(CapturingSink::default())
}

fn harness_with(sink: CapturingSink) -> Harness {
    let sink = Arc::new(sink);
    let store = Arc::new(MemoryStore::new());
    let controller = AdaptiveController::new(TimingConfig::default(), sink.clone(), store.clone());
    Harness { controller, sink, store }
}

fn detection(intersection_id: &str, frame: u64, cars: u32, buses: u32) -> DetectionRecord {
    let counts = BTreeMap::from([
        ("bus".to_string(), buses),
        ("car".to_string(), cars),
        ("motorcycle".to_string(), 0),
        ("truck".to_string(), 0),
    ]);
    DetectionRecord::new(intersection_id, frame, frame as f64, counts, Vec::new(), 12.5)
}

impl Harness {
    fn feed(&self, record: &DetectionRecord) -> Option<SignalCommand> {
        self.store.ensure_intersection(record.intersection_id()).unwrap();
        self.controller.process(record)
    }
}

#[test]
fn sustained_heavy_traffic_turns_green_for_max_duration() {
    let h = harness();
    let mut commands = Vec::new();
    for frame in 0..10 {
        commands.extend(h.feed(&detection("INT-001", frame, 12, 0)));
    }

    assert_eq!(commands.len(), 1, "hysteresis keeps a stable phase silent");
    let command = &commands[0];
    assert_eq!(command.phase, Phase::Green);
    assert_eq!(command.density_ratio, 0.8);
    assert_eq!(command.smoothed_count, 12.0);
    assert_eq!(command.green_duration_sec, 90);
    assert_eq!(command.yellow_duration_sec, 5);
    assert!(!command.is_override);
    assert_eq!(
        command.reason,
        "Phase changed to GREEN (high traffic). Density: 80.0% (12 vehicles avg). Dominant type: car."
    );
    assert_eq!(h.controller.active_phase("INT-001"), Some(Phase::Green));
    assert_eq!(*h.sink.sent.lock().unwrap(), commands);
}

#[test]
fn empty_road_goes_red_once() {
    let h = harness();
    let first = h.feed(&detection("INT-002", 0, 0, 0)).expect("cold start always emits");
    assert_eq!(first.phase, Phase::Red);
    assert_eq!(first.density_ratio, 0.0);
    assert!(first.reason.ends_with("Dominant type: N/A."));

    for frame in 1..15 {
        assert!(h.feed(&detection("INT-002", frame, 0, 0)).is_none());
    }
    assert_eq!(h.controller.commands_sent(), 1);
}

#[test]
fn duplicate_delivery_is_idempotent() {
    let h = harness();
    let record = detection("INT-003", 7, 9, 0);
    assert!(h.feed(&record).is_some());
    assert!(h.feed(&record).is_none());
    assert_eq!(h.sink.sent.lock().unwrap().len(), 1);
}

#[test]
fn override_becomes_hysteresis_baseline() {
    let h = harness();
    h.feed(&detection("INT-004", 0, 0, 0));
    assert_eq!(h.controller.active_phase("INT-004"), Some(Phase::Red));

    let command = h.controller.manual_override("INT-004", Phase::Green, 45);
    assert!(command.is_override);
    assert_eq!(command.green_duration_sec, 45);
    assert_eq!(command.reason, "Manual override to GREEN for 45s.");
    assert_eq!(h.controller.active_phase("INT-004"), Some(Phase::Green));

    // Window mean is still low, so automatic control wants RED again and
    // compares against the overridden GREEN.
    let next = h.feed(&detection("INT-004", 1, 0, 0)).expect("differs from override");
    assert_eq!(next.phase, Phase::Red);
}

#[test]
fn override_is_not_clamped() {
    let h = harness();
    h.store.ensure_intersection("INT-005").unwrap();
    let command = h.controller.manual_override("INT-005", Phase::FlashingRed, 600);
    assert_eq!(command.green_duration_sec, 600);
    let history = h.store.command_history("INT-005", 20).unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].is_override);
    assert_eq!(history[0].phase, Phase::FlashingRed);
}

#[test]
fn smoothing_uses_last_ten_samples() {
    let h = harness();
    let samples = [0u32, 0, 0, 0, 0, 0, 0, 0, 0, 0, 10, 10, 10, 10, 10];
    let mut last = None;
    for (frame, &cars) in samples.iter().enumerate() {
        if let Some(command) = h.feed(&detection("INT-006", frame as u64, cars, 0)) {
            last = Some((frame, command));
        }
    }
    // The mean crosses 0.3 * 15 = 4.5 at frame 14, whose window holds five 0s
    // and five 10s.
    let (frame, command) = last.expect("traffic increase switches phase");
    assert_eq!(command.phase, Phase::Green);
    let window_start = (frame + 1).saturating_sub(10);
    let window = &samples[window_start..=frame];
    let mean = window.iter().map(|&v| f64::from(v)).sum::<f64>() / window.len() as f64;
    assert_eq!(command.smoothed_count, (mean * 10.0).round() / 10.0);
}

#[test]
fn intersections_are_independent() {
    let h = harness();
    assert!(h.feed(&detection("A", 0, 14, 0)).is_some());
    assert!(h.feed(&detection("B", 0, 14, 0)).is_some());
    assert!(h.feed(&detection("A", 1, 14, 0)).is_none());
    let stats = h.controller.stats();
    assert_eq!(stats.monitored_intersections, 2);
    assert_eq!(stats.active_phases.get("B"), Some(&Phase::Green));
}

#[test]
fn dominant_type_tie_breaks_on_name() {
    let h = harness();
    let command = h.feed(&detection("INT-008", 0, 3, 3)).unwrap();
    assert!(command.reason.ends_with("Dominant type: bus."), "{}", command.reason);
}

#[test]
fn offline_sink_still_updates_state_and_persists() {
    let h = harness_with(CapturingSink {
        offline: true,
        ..CapturingSink::default()
    });
    let command = h.feed(&detection("INT-009", 0, 10, 0)).unwrap();
    assert_eq!(command.phase, Phase::Green);
    assert_eq!(h.controller.commands_sent(), 0);
    assert_eq!(h.controller.active_phase("INT-009"), Some(Phase::Green));
    assert_eq!(h.store.command_history("INT-009", 5).unwrap().len(), 1);
}

#[test]
fn concurrent_overrides_and_detections_stay_ordered() {
    let h = Arc::new(harness());
    h.store.ensure_intersection("INT-010").unwrap();

    thread::scope(|scope| {
        for worker in 0..4u64 {
            let h = h.clone();
            scope.spawn(move || {
                for i in 0..50u64 {
                    let cars = if (i / 5 + worker) % 2 == 0 { 14 } else { 0 };
                    h.controller.process(&detection("INT-010", worker * 1000 + i, cars, 0));
                    assert!(h.controller.window_len("INT-010").unwrap() <= 10);
                }
            });
        }
        for worker in 0..2u32 {
            let h = h.clone();
            scope.spawn(move || {
                for i in 0..20u32 {
                    let phase = if (i + worker) % 2 == 0 { Phase::Green } else { Phase::FlashingRed };
                    h.controller.manual_override("INT-010", phase, 30 + i);
                }
            });
        }
    });

    let sent = h.sink.sent.lock().unwrap();
    assert_eq!(sent.iter().filter(|c| c.is_override).count(), 40);
    // An automatic command is only ever issued against a different prior phase.
    for pair in sent.windows(2) {
        if !pair[1].is_override {
            assert_ne!(pair[0].phase, pair[1].phase, "{:?}", pair);
        }
    }
    assert_eq!(h.controller.active_phase("INT-010"), sent.last().map(|c| c.phase));
    assert_eq!(h.controller.window_len("INT-010"), Some(10));
    assert_eq!(h.store.command_history("INT-010", 1000).unwrap().len(), sent.len());
}
