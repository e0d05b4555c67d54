use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

pub const MAX_ATTEMPTS: u32 = 5;
pub const WINDOW_DURATION: Duration = Duration::from_secs(15 * 60);
pub const BLOCK_DURATION: Duration = Duration::from_secs(15 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct ThrottleEntry {
    attempts: u32,
    first_attempt: Instant,
    blocked_until: Option<Instant>,
}

/// Outcome of a pre-attempt check.
#[derive(Debug, Clone, Copy)]
pub struct CheckResult {
    pub limited: bool,
    /// Seconds until the block lifts, when limited.
    pub remaining_secs: Option<u64>,
}

/// Outcome of recording a verified credential failure.
#[derive(Debug, Clone, Copy)]
pub struct FailureVerdict {
    pub blocked: bool,
    /// Attempts left before blocking, when not yet blocked.
    pub remaining_attempts: Option<u32>,
}

/// Diagnostic snapshot of one (client, file) key.
#[derive(Debug, Clone, Copy)]
pub struct ThrottleInfo {
    pub attempts: u32,
    pub is_blocked: bool,
    pub blocked_until: Option<DateTime<Utc>>,
}

/// Tracks failed password attempts per (client IP, file id) key and blocks the
/// key for `block_duration` once `max_attempts` failures accumulate inside the
/// counting window.
///
/// State is process-lifetime and in-memory only; the audit log is the durable
/// record of attempt history. A key whose window lapsed with no active block
/// behaves exactly like an absent key.
#[derive(Debug, Clone)]
pub struct AttemptThrottle {
    max_attempts: u32,
    window: Duration,
    block_duration: Duration,
    inner: Arc<Mutex<HashMap<String, ThrottleEntry>>>,
}

fn key(ip: &str, file_id: &str) -> String {
    format!("{ip}:{file_id}")
}

fn secs_ceil(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

impl AttemptThrottle {
    pub fn new() -> Self {
        Self::with_policy(MAX_ATTEMPTS, WINDOW_DURATION, BLOCK_DURATION)
    }

    pub fn with_policy(max_attempts: u32, window: Duration, block_duration: Duration) -> Self {
        Self {
            max_attempts,
            window,
            block_duration,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Check whether the key is currently blocked. Read-only except for
    /// evicting an entry whose block has already expired.
    pub async fn check(&self, ip: &str, file_id: &str) -> CheckResult {
        let key = key(ip, file_id);
        let now = Instant::now();
        let mut map = self.inner.lock().await;

        if let Some(entry) = map.get(&key) {
            if let Some(blocked_until) = entry.blocked_until {
                if now < blocked_until {
                    return CheckResult {
                        limited: true,
                        remaining_secs: Some(secs_ceil(blocked_until - now)),
                    };
                }
                // Block expired, remove entry
                map.remove(&key);
            }
        }

        CheckResult {
            limited: false,
            remaining_secs: None,
        }
    }

    /// Record a verified authentication failure for the key.
    ///
    /// A stale entry (window elapsed, no block) is reset as if fresh rather
    /// than accumulating. This bounds the worst-case lockout duration.
    pub async fn record_failure(&self, ip: &str, file_id: &str) -> FailureVerdict {
        let key = key(ip, file_id);
        let now = Instant::now();
        let mut map = self.inner.lock().await;

        let entry = map.entry(key).or_insert(ThrottleEntry {
            attempts: 0,
            first_attempt: now,
            blocked_until: None,
        });

        // First failure for the key, or a lapsed window: restart the count
        if entry.attempts == 0 || now.duration_since(entry.first_attempt) > self.window {
            entry.attempts = 1;
            entry.first_attempt = now;
            entry.blocked_until = None;
            return FailureVerdict {
                blocked: false,
                remaining_attempts: Some(self.max_attempts - 1),
            };
        }

        entry.attempts += 1;

        if entry.attempts >= self.max_attempts {
            entry.blocked_until = Some(now + self.block_duration);
            debug!("throttle block set for key after {} attempts", entry.attempts);
            return FailureVerdict {
                blocked: true,
                remaining_attempts: None,
            };
        }

        FailureVerdict {
            blocked: false,
            remaining_attempts: Some(self.max_attempts - entry.attempts),
        }
    }

    /// Drop all failure history for the key. Called on successful
    /// authentication.
    pub async fn clear(&self, ip: &str, file_id: &str) {
        let mut map = self.inner.lock().await;
        map.remove(&key(ip, file_id));
    }

    /// Diagnostic read with no side effects.
    pub async fn inspect(&self, ip: &str, file_id: &str) -> ThrottleInfo {
        let map = self.inner.lock().await;
        let now = Instant::now();

        match map.get(&key(ip, file_id)) {
            None => ThrottleInfo {
                attempts: 0,
                is_blocked: false,
                blocked_until: None,
            },
            Some(entry) => ThrottleInfo {
                attempts: entry.attempts,
                is_blocked: entry.blocked_until.is_some_and(|t| now < t),
                blocked_until: entry.blocked_until.map(|t| {
                    if t >= now {
                        Utc::now()
                            + chrono::Duration::from_std(t - now)
                                .unwrap_or_else(|_| chrono::Duration::zero())
                    } else {
                        Utc::now()
                            - chrono::Duration::from_std(now - t)
                                .unwrap_or_else(|_| chrono::Duration::zero())
                    }
                }),
            },
        }
    }

    /// One cleanup pass: drop entries whose block expired and stale entries
    /// whose window lapsed without a block. Entries with an active block are
    /// always kept.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut map = self.inner.lock().await;
        let before = map.len();
        map.retain(|_, entry| match entry.blocked_until {
            Some(blocked_until) => now < blocked_until,
            None => now.duration_since(entry.first_attempt) <= self.window,
        });
        let removed = before - map.len();
        if removed > 0 {
            debug!("throttle sweep removed {} stale entries", removed);
        }
    }

    /// Spawn the recurring cleanup task. The returned handle is aborted when
    /// the server shuts down.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let throttle = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                throttle.sweep().await;
            }
        })
    }
}

impl Default for AttemptThrottle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_failures_count_down_to_block() {
        let throttle = AttemptThrottle::with_policy(5, LONG, LONG);

        for expected_remaining in [4, 3, 2, 1] {
            let verdict = throttle.record_failure("1.2.3.4", "file-a").await;
            assert!(!verdict.blocked);
            assert_eq!(verdict.remaining_attempts, Some(expected_remaining));
        }

        let verdict = throttle.record_failure("1.2.3.4", "file-a").await;
        assert!(verdict.blocked);
        assert_eq!(verdict.remaining_attempts, None);

        let check = throttle.check("1.2.3.4", "file-a").await;
        assert!(check.limited);
        let remaining = check.remaining_secs.unwrap();
        assert!(remaining > 0 && remaining <= 3600);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let throttle = AttemptThrottle::with_policy(2, LONG, LONG);

        throttle.record_failure("1.2.3.4", "file-a").await;
        throttle.record_failure("1.2.3.4", "file-a").await;

        assert!(throttle.check("1.2.3.4", "file-a").await.limited);
        assert!(!throttle.check("1.2.3.4", "file-b").await.limited);
        assert!(!throttle.check("5.6.7.8", "file-a").await.limited);
    }

    #[tokio::test]
    async fn test_clear_resets_history() {
        let throttle = AttemptThrottle::with_policy(5, LONG, LONG);

        for _ in 0..4 {
            throttle.record_failure("1.2.3.4", "file-a").await;
        }
        throttle.clear("1.2.3.4", "file-a").await;

        let info = throttle.inspect("1.2.3.4", "file-a").await;
        assert_eq!(info.attempts, 0);
        assert!(!info.is_blocked);

        // A failure after clear starts a fresh count
        let verdict = throttle.record_failure("1.2.3.4", "file-a").await;
        assert_eq!(verdict.remaining_attempts, Some(4));
    }

    #[tokio::test]
    async fn test_window_expiry_resets_count() {
        let throttle = AttemptThrottle::with_policy(5, Duration::from_millis(40), LONG);

        throttle.record_failure("1.2.3.4", "file-a").await;
        throttle.record_failure("1.2.3.4", "file-a").await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Stale entry is treated as fresh, not accumulated
        let verdict = throttle.record_failure("1.2.3.4", "file-a").await;
        assert!(!verdict.blocked);
        assert_eq!(verdict.remaining_attempts, Some(4));
        assert_eq!(throttle.inspect("1.2.3.4", "file-a").await.attempts, 1);
    }

    #[tokio::test]
    async fn test_block_expires_and_entry_evicted() {
        let throttle = AttemptThrottle::with_policy(2, LONG, Duration::from_millis(40));

        throttle.record_failure("1.2.3.4", "file-a").await;
        let verdict = throttle.record_failure("1.2.3.4", "file-a").await;
        assert!(verdict.blocked);
        assert!(throttle.check("1.2.3.4", "file-a").await.limited);

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(!throttle.check("1.2.3.4", "file-a").await.limited);
        // check() lazily evicted the expired entry
        assert_eq!(throttle.inspect("1.2.3.4", "file-a").await.attempts, 0);
    }

    #[tokio::test]
    async fn test_inspect_reports_block() {
        let throttle = AttemptThrottle::with_policy(2, LONG, LONG);

        throttle.record_failure("1.2.3.4", "file-a").await;
        throttle.record_failure("1.2.3.4", "file-a").await;

        let info = throttle.inspect("1.2.3.4", "file-a").await;
        assert_eq!(info.attempts, 2);
        assert!(info.is_blocked);
        assert!(info.blocked_until.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_sweep_keeps_active_blocks() {
        let throttle = AttemptThrottle::with_policy(2, Duration::from_millis(30), LONG);

        // Blocked key stays across sweeps
        throttle.record_failure("1.2.3.4", "blocked").await;
        throttle.record_failure("1.2.3.4", "blocked").await;
        // Stale key lapses
        throttle.record_failure("5.6.7.8", "stale").await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        throttle.sweep().await;

        assert!(throttle.check("1.2.3.4", "blocked").await.limited);
        assert_eq!(throttle.inspect("5.6.7.8", "stale").await.attempts, 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_block() {
        let throttle = AttemptThrottle::with_policy(2, LONG, Duration::from_millis(30));

        throttle.record_failure("1.2.3.4", "file-a").await;
        throttle.record_failure("1.2.3.4", "file-a").await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        throttle.sweep().await;

        assert_eq!(throttle.inspect("1.2.3.4", "file-a").await.attempts, 0);
    }

    #[tokio::test]
    async fn test_concurrent_failures_never_undercount() {
        let throttle = AttemptThrottle::with_policy(5, LONG, LONG);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let t = throttle.clone();
            handles.push(tokio::spawn(async move {
                t.record_failure("1.2.3.4", "file-a").await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // A burst of simultaneous failures must still trip the block
        assert!(throttle.check("1.2.3.4", "file-a").await.limited);
    }
}
