// Time types used across the crawler.
//
// Packet expirations and node database bookkeeping are expressed in unix
// seconds, so small clock drift between peers is absorbed by the protocol's
// expiration window.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Seconds timestamps used to determine it using its type
pub type TimestampSeconds = u64;

#[inline]
pub fn get_current_time() -> Duration {
    // A clock set before 1970 is reported as the epoch itself
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

// Return timestamp in seconds
pub fn get_current_time_in_seconds() -> TimestampSeconds {
    get_current_time().as_secs()
}
