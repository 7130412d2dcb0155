use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    Offline,
}

/// Retained liveness message published under `{base_topic}/status`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceStatus {
    pub intersection_id: String,
    pub status: PresenceState,
    pub timestamp: f64,
}

impl PresenceStatus {
    pub fn now(intersection_id: &str, status: PresenceState) -> Self {
        Self {
            intersection_id: intersection_id.to_string(),
            status,
            timestamp: unix_now(),
        }
    }
}

/// Current wall clock as fractional unix seconds.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
