use chrono::{SecondsFormat, Utc};

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns the current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns the current UTC time as an RFC 3339 string with second precision.
///
/// All persisted timestamps (company state, sessions, audit rows, the crash
/// sidecar) use this one shape so they compare lexicographically.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_units_agree() {
        let secs = current_unix_timestamp();
        let ms = current_unix_timestamp_ms() / 1_000;
        assert!(ms >= secs);
        assert!(ms <= secs.saturating_add(1));
    }

    #[test]
    fn now_iso_is_rfc3339_utc() {
        let stamp = now_iso();
        assert!(stamp.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&stamp).is_ok());
    }
}
