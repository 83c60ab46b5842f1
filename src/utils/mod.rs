use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Generate a unique request ID
pub fn generate_request_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let random = rand::random::<u32>();
    format!("req_{timestamp:x}_{random:x}")
}

/// Format duration in a human-readable way
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if total_secs == 0 {
        format!("{millis}ms")
    } else if total_secs < 60 {
        format!("{total_secs}.{millis:03}s")
    } else if total_secs < 3600 {
        let minutes = total_secs / 60;
        let seconds = total_secs % 60;
        format!("{minutes}m {seconds}s")
    } else {
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let seconds = total_secs % 60;
        format!("{hours}h {minutes}m {seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(5_000)), "5.000s");
        assert_eq!(format_duration(Duration::from_secs(900)), "15m 0s");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "1h 2m 5s");
    }

    #[test]
    fn test_request_ids_are_unique() {
        let first = generate_request_id();
        let second = generate_request_id();
        assert!(first.starts_with("req_"));
        assert_ne!(first, second);
    }
}
