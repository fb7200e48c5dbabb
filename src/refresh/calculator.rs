//! Next-refresh delay calculation.

use std::time::{Duration, SystemTime};

/// Minimum remaining certificate validity needed for the next refresh
/// attempt to have adequate time to complete; absorbs clock skew and
/// in-flight refresh latency.
pub const REFRESH_BUFFER: Duration = Duration::from_secs(4 * 60);

const ONE_HOUR: Duration = Duration::from_secs(60 * 60);

/// Compute the delay until the next refresh, given the current time and the
/// certificate expiration.
///
/// Certificates with under an hour of validity are refreshed `REFRESH_BUFFER`
/// before expiry (immediately once inside the buffer). Longer-lived
/// certificates are refreshed at half their remaining lifetime, halving API
/// call frequency.
pub fn delay_until_next_refresh(now: SystemTime, expiration: SystemTime) -> Duration {
    let until_exp = expiration
        .duration_since(now)
        .unwrap_or(Duration::ZERO);

    if until_exp < ONE_HOUR {
        if until_exp < REFRESH_BUFFER {
            return Duration::ZERO;
        }
        return until_exp - REFRESH_BUFFER;
    }

    until_exp / 2
}
