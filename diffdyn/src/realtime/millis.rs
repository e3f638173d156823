use std::time::{SystemTime, UNIX_EPOCH};

/// Wall clock milliseconds since the Unix epoch.
pub fn time_since_epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
