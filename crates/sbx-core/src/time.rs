use chrono::{DateTime, TimeZone, Utc};

/// Current UTC time, truncated to whole seconds to match what the store keeps.
pub fn now() -> DateTime<Utc> {
    from_epoch(Utc::now().timestamp())
}

/// Convert a stored epoch-seconds value back to a UTC timestamp.
pub fn from_epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// Epoch seconds for storage.
pub fn to_epoch(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_roundtrip() {
        let ts = now();
        assert_eq!(from_epoch(to_epoch(ts)), ts);
    }

    #[test]
    fn test_now_has_no_subsecond_part() {
        assert_eq!(now().timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn test_from_epoch_known_value() {
        let ts = from_epoch(1735689600);
        assert_eq!(ts.to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }
}
