//! Cache clock
//!
//! All expiry math runs on `tokio::time::Instant` so a paused runtime can
//! drive TTLs deterministically. Wall-clock timestamps embedded in
//! distributed payloads are derived from the same monotonic source,
//! anchored to the system clock the first time they are requested.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

static ANCHOR: OnceLock<(u64, Instant)> = OnceLock::new();

/// Current monotonic instant
#[inline]
pub fn now() -> Instant {
    Instant::now()
}

/// Current Unix time in milliseconds
pub fn unix_millis() -> u64 {
    let (base_ms, base_instant) = ANCHOR.get_or_init(|| {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        (ms, Instant::now())
    });
    // Paused runtimes may sit before or after the anchor
    let now = Instant::now();
    if now >= *base_instant {
        base_ms + (now - *base_instant).as_millis() as u64
    } else {
        base_ms.saturating_sub((*base_instant - now).as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_unix_millis_follows_paused_clock() {
        let before = unix_millis();
        tokio::time::advance(Duration::from_secs(30)).await;
        let after = unix_millis();
        assert!(after - before >= 30_000);
    }
}
