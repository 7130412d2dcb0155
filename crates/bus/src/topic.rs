/// Sub-topic carrying retained presence messages.
pub const STATUS_SUFFIX: &str = "status";

/// Join a base topic and a suffix with a single `/`.
pub fn join(base: &str, suffix: &str) -> String {
    let base = base.trim_end_matches('/');
    let suffix = suffix.trim_start_matches('/');
    if suffix.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{suffix}")
    }
}

/// MQTT topic filter matching with `+` (single level) and `#` (remaining levels).
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_normalises_slashes() {
        assert_eq!(join("neuroflow/detections", "INT-001"), "neuroflow/detections/INT-001");
        assert_eq!(join("neuroflow/detections/", "/status"), "neuroflow/detections/status");
        assert_eq!(join("base", ""), "base");
    }

    #[test]
    fn wildcard_matching() {
        assert!(matches("a/+", "a/INT-001"));
        assert!(matches("a/+", "a/status"));
        assert!(!matches("a/+", "a/b/c"));
        assert!(!matches("a/+", "a"));
        assert!(matches("a/#", "a/b/c"));
        assert!(matches("a/b", "a/b"));
        assert!(!matches("a/b", "a/c"));
    }
}
