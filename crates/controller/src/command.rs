use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::phase::Phase;

/// A phase change for one intersection, either computed from traffic density
/// or requested by an operator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalCommand {
    pub intersection_id: String,
    pub phase: Phase,
    pub green_duration_sec: u32,
    pub yellow_duration_sec: u32,
    pub vehicle_count: u32,
    pub smoothed_count: f64,
    pub density_ratio: f64,
    pub timestamp: f64,
    pub reason: String,
    #[serde(default)]
    pub is_override: bool,
}

impl SignalCommand {
    pub fn kind(&self) -> &'static str {
        if self.is_override { "override" } else { "auto" }
    }
}

/// Class with the highest count. Ties go to the lexicographically smallest
/// name; `None` when nothing was counted.
pub fn dominant_class(counts: &BTreeMap<String, u32>) -> Option<&str> {
    counts
        .iter()
        .filter(|(_, count)| **count > 0)
        .fold(None::<(&str, u32)>, |best, (name, &count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((name.as_str(), count)),
        })
        .map(|(name, _)| name)
}

pub(crate) fn automatic_reason(
    phase: Phase,
    density_ratio: f64,
    smoothed: f64,
    label: &str,
    counts: &BTreeMap<String, u32>,
) -> String {
    format!(
        "Phase changed to {phase} ({label}). Density: {:.1}% ({smoothed:.0} vehicles avg). Dominant type: {}.",
        density_ratio * 100.0,
        dominant_class(counts).unwrap_or("N/A"),
    )
}

pub(crate) fn override_reason(phase: Phase, duration_sec: u32) -> String {
    format!("Manual override to {phase} for {duration_sec}s.")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(pairs: &[(&str, u32)]) -> BTreeMap<String, u32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn dominant_prefers_count_then_name() {
        assert_eq!(dominant_class(&counts(&[("bus", 1), ("car", 4), ("truck", 2)])), Some("car"));
        assert_eq!(dominant_class(&counts(&[("truck", 3), ("bus", 3), ("car", 1)])), Some("bus"));
        assert_eq!(dominant_class(&counts(&[("car", 0), ("bus", 0)])), None);
        assert_eq!(dominant_class(&BTreeMap::new()), None);
    }

    #[test]
    fn reason_text() {
        let reason = automatic_reason(Phase::Green, 0.8, 12.0, "high traffic", &counts(&[("car", 10), ("bus", 2)]));
        assert_eq!(
            reason,
            "Phase changed to GREEN (high traffic). Density: 80.0% (12 vehicles avg). Dominant type: car."
        );
        assert_eq!(override_reason(Phase::Red, 45), "Manual override to RED for 45s.");
    }

    #[test]
    fn wire_shape() {
        let command = SignalCommand {
            intersection_id: "INT-001".into(),
            phase: Phase::FlashingRed,
            green_duration_sec: 20,
            yellow_duration_sec: 5,
            vehicle_count: 0,
            smoothed_count: 0.0,
            density_ratio: 0.0,
            timestamp: 1.0,
            reason: "x".into(),
            is_override: true,
        };
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(value["phase"], "FLASHING_RED");
        assert_eq!(value["is_override"], true);
    }
}
