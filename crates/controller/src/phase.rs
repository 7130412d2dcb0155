use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Red,
    Yellow,
    Green,
    FlashingRed,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Red, Phase::Yellow, Phase::Green, Phase::FlashingRed];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Red => "RED",
            Phase::Yellow => "YELLOW",
            Phase::Green => "GREEN",
            Phase::FlashingRed => "FLASHING_RED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid phase {given:?}; valid phases: {}", valid_phases().join(", "))]
pub struct PhaseParseError {
    pub given: String,
}

pub fn valid_phases() -> Vec<&'static str> {
    Phase::ALL.iter().map(|phase| phase.as_str()).collect()
}

impl FromStr for Phase {
    type Err = PhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| PhaseParseError { given: s.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_names_only() {
        assert_eq!("FLASHING_RED".parse::<Phase>(), Ok(Phase::FlashingRed));
        assert_eq!("GREEN".parse::<Phase>(), Ok(Phase::Green));
        let err = "green".parse::<Phase>().unwrap_err();
        assert!(err.to_string().contains("RED, YELLOW, GREEN, FLASHING_RED"));
    }

    #[test]
    fn serde_matches_display() {
        for phase in Phase::ALL {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json, format!("\"{phase}\""));
        }
    }
}
