//! `PreciseTime`: all `created_at`/`updated_at`/`last_sync_time` values come
//! from here rather than the raw wall clock, per SPEC_FULL.md §5.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Offset (in milliseconds) added to `Utc::now()` to approximate the
/// external reference clock. Stored as a single atomic so readers never
/// block on the background monitor.
#[derive(Clone)]
pub struct PreciseTime {
    offset_ms: Arc<AtomicI64>,
}

impl PreciseTime {
    pub fn new() -> Self {
        Self {
            offset_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let offset = self.offset_ms.load(Ordering::Relaxed);
        Utc::now() + chrono::Duration::milliseconds(offset)
    }

    fn set_offset(&self, offset: chrono::Duration) {
        self.offset_ms.store(
            offset.num_milliseconds(),
            Ordering::Relaxed,
        );
    }

    /// Issues one probe against `time_sync_url`'s `Date` header and updates
    /// the stored offset on success. Returns `true` if the offset changed.
    pub async fn refresh(&self, client: &reqwest::Client, time_sync_url: &str) -> bool {
        let resp = match client.head(time_sync_url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "time sync connectivity probe failed");
                return false;
            }
        };

        let Some(date_header) = resp.headers().get(reqwest::header::DATE) else {
            return false;
        };
        let Ok(date_str) = date_header.to_str() else {
            return false;
        };
        let Ok(server_time) = DateTime::parse_from_rfc2822(date_str) else {
            warn!(raw = date_str, "failed to parse Date header during time sync");
            return false;
        };

        let server_utc = server_time.with_timezone(&Utc);
        let local_utc = Utc::now();
        self.set_offset(server_utc - local_utc);
        true
    }

    /// Spawns the background monitor loop (~45s by default). Returns the
    /// task handle so the caller can register it with the job registry for
    /// cancellation on shutdown.
    pub fn spawn_monitor(
        &self,
        time_sync_url: String,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(3))
                .build()
                .unwrap_or_default();
            loop {
                this.refresh(&client, &time_sync_url).await;
                tokio::time::sleep(interval).await;
            }
        })
    }
}

impl Default for PreciseTime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero_offset_and_tracks_wall_clock() {
        let pt = PreciseTime::new();
        let before = Utc::now();
        let now = pt.now();
        let after = Utc::now();
        assert!(now >= before && now <= after + chrono::Duration::milliseconds(50));
    }

    #[tokio::test]
    async fn refresh_is_false_for_unreachable_host() {
        let pt = PreciseTime::new();
        let client = reqwest::Client::new();
        let changed = pt
            .refresh(&client, "http://127.0.0.1:1/not-a-real-endpoint")
            .await;
        assert!(!changed);
    }
}
