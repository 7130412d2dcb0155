/// Signal timing model. Durations are whole seconds.
#[derive(Clone, Debug, PartialEq)]
pub struct TimingConfig {
    /// Vehicle count at which a lane is considered saturated.
    pub lane_capacity: f64,
    pub min_green_sec: u32,
    pub max_green_sec: u32,
    pub base_green_sec: u32,
    pub yellow_sec: u32,
    pub scaling_factor: f64,
    /// Density ratio at or above which the approach gets green.
    pub green_threshold: f64,
    /// Density ratio at or above which traffic is labelled "high".
    pub high_threshold: f64,
    pub window_size: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            lane_capacity: 15.0,
            min_green_sec: 15,
            max_green_sec: 90,
            base_green_sec: 30,
            yellow_sec: 5,
            scaling_factor: 2.5,
            green_threshold: 0.3,
            high_threshold: 0.7,
            window_size: 10,
        }
    }
}

impl TimingConfig {
    pub fn density_ratio(&self, smoothed: f64) -> f64 {
        smoothed / self.lane_capacity
    }

    /// `base + ratio * scaling * base`, with the ratio capped at 1.0, truncated
    /// to whole seconds and clamped to `[min_green, max_green]`.
    pub fn green_duration(&self, density_ratio: f64) -> u32 {
        let ratio = density_ratio.clamp(0.0, 1.0);
        let base = f64::from(self.base_green_sec);
        let scaled = (base + ratio * self.scaling_factor * base).floor();
        let scaled = if scaled >= f64::from(u32::MAX) { u32::MAX } else { scaled as u32 };
        scaled.min(self.max_green_sec).max(self.min_green_sec)
    }

    pub fn traffic_label(&self, density_ratio: f64) -> &'static str {
        if density_ratio >= self.high_threshold {
            "high traffic"
        } else if density_ratio >= self.green_threshold {
            "moderate traffic"
        } else {
            "low traffic"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_stays_within_bounds() {
        let timing = TimingConfig::default();
        for step in 0..=100 {
            let ratio = f64::from(step) / 100.0;
            let duration = timing.green_duration(ratio);
            assert!((timing.min_green_sec..=timing.max_green_sec).contains(&duration), "{ratio} -> {duration}");
        }
        assert_eq!(timing.green_duration(3.0), 90);
        assert_eq!(timing.green_duration(0.0), 30);
    }

    #[test]
    fn duration_truncates() {
        let timing = TimingConfig::default();
        // 30 + 0.1 * 2.5 * 30 = 37.5
        assert_eq!(timing.green_duration(0.1), 37);
    }

    #[test]
    fn labels_use_both_thresholds() {
        let timing = TimingConfig::default();
        assert_eq!(timing.traffic_label(0.8), "high traffic");
        assert_eq!(timing.traffic_label(0.3), "moderate traffic");
        assert_eq!(timing.traffic_label(0.29), "low traffic");
    }
}
