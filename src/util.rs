//! Small helpers shared across modules.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as epoch milliseconds.
#[allow(clippy::cast_possible_truncation)]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
