use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use mproxy_core::StatusError;

/// Bucket that absorbs requests arriving without an auth ID. They still
/// compete for admission instead of silently bypassing the limiter.
pub const GLOBAL_BUCKET_KEY: &str = "(global)";

/// Per-credential sliding-window admission.
///
/// One mutex guards the whole map; contention is bounded by request rate and
/// the critical section is a few pointer moves.
pub struct SlidingWindowLimiter {
    label: &'static str,
    limit: usize,
    window: Duration,
    requests: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(label: &'static str, limit: usize, window: Duration) -> Self {
        Self {
            label,
            limit: limit.max(1),
            window,
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Admits or rejects one request for `auth_id` at the current instant.
    /// Rejections carry a synthesized 429 whose body matches the upstream
    /// rate-limit error shape.
    pub fn admit(&self, auth_id: &str) -> Result<(), StatusError> {
        self.admit_at(auth_id, Instant::now())
    }

    fn admit_at(&self, auth_id: &str, now: Instant) -> Result<(), StatusError> {
        let key = if auth_id.is_empty() {
            debug!(
                event = "rate_limit_empty_auth_id",
                limiter = self.label,
                "attributing request to the global bucket"
            );
            GLOBAL_BUCKET_KEY
        } else {
            auth_id
        };

        let mut guard = self.lock_requests();
        let entry = guard.entry(key.to_string()).or_default();
        if let Some(window_start) = now.checked_sub(self.window) {
            while entry.front().is_some_and(|ts| *ts <= window_start) {
                entry.pop_front();
            }
        }

        if entry.len() >= self.limit {
            let oldest = *entry.front().expect("window is full");
            let retry_after = (oldest + self.window)
                .saturating_duration_since(now)
                .max(Duration::from_secs(1));
            return Err(StatusError::new(
                429,
                format!(
                    r#"{{"error":{{"code":"rate_limit_exceeded","message":"{} rate limit: {} requests/minute exceeded, retry after {}s","type":"rate_limit_exceeded"}}}}"#,
                    self.label,
                    self.limit,
                    retry_after.as_secs()
                ),
            )
            .with_retry_after(retry_after));
        }

        entry.push_back(now);
        Ok(())
    }

    /// Drops expired timestamps everywhere and deletes empty entries so
    /// transient auth IDs cannot grow the map without bound.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&self, now: Instant) {
        let Some(window_start) = now.checked_sub(self.window) else {
            return;
        };
        let mut guard = self.lock_requests();
        guard.retain(|_, timestamps| {
            while timestamps.front().is_some_and(|ts| *ts <= window_start) {
                timestamps.pop_front();
            }
            !timestamps.is_empty()
        });
    }

    fn lock_requests(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> Vec<String> {
        self.lock_requests().keys().cloned().collect()
    }
}
