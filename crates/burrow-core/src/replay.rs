//! Replay and freshness checks for tunnel envelopes.
//!
//! Each session owns one [`ReplayGuard`]. An envelope is accepted when its
//! timestamp is within [`MAX_CLOCK_SKEW`] of the local clock and its
//! `message_id` has not been seen during the last [`RETENTION`].

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Largest tolerated difference between envelope timestamp and local clock.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

/// How long a seen `message_id` is remembered.
pub const RETENTION: Duration = Duration::from_secs(10 * 60);

/// Minimum spacing between opportunistic prunes.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of [`ReplayGuard::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayVerdict {
    Accepted,
    /// Timestamp too far from the local clock.
    Stale,
    /// `message_id` seen within the retention window.
    Duplicate,
}

impl ReplayVerdict {
    pub const fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }
}

#[derive(Debug, Default)]
struct SeenIds {
    first_seen: HashMap<String, i64>,
    last_prune_ms: i64,
}

/// Tracks recently seen message ids.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    seen: Mutex<SeenIds>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check against the current wall clock. `true` means process it.
    pub fn accept(&self, message_id: &str, timestamp_ms: i64) -> bool {
        self.check(message_id, timestamp_ms, wall_clock_ms())
            .is_accepted()
    }

    /// Check an envelope as if the local clock read `now_ms`.
    pub fn check(&self, message_id: &str, timestamp_ms: i64, now_ms: i64) -> ReplayVerdict {
        if timestamp_ms.abs_diff(now_ms) > duration_ms(MAX_CLOCK_SKEW) {
            return ReplayVerdict::Stale;
        }

        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if now_ms.saturating_sub(seen.last_prune_ms) >= to_i64(PRUNE_INTERVAL) {
            prune_locked(&mut seen, now_ms);
        }

        let retention = to_i64(RETENTION);
        match seen.first_seen.get(message_id) {
            Some(&at) if now_ms.saturating_sub(at) < retention => ReplayVerdict::Duplicate,
            _ => {
                seen.first_seen.insert(message_id.to_owned(), now_ms);
                ReplayVerdict::Accepted
            }
        }
    }

    /// Forget ids first seen more than [`RETENTION`] before `now_ms`.
    pub fn prune(&self, now_ms: i64) {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        prune_locked(&mut seen, now_ms);
    }

    /// Number of ids currently remembered.
    pub fn len(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .first_seen
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn prune_locked(seen: &mut SeenIds, now_ms: i64) {
    let retention = to_i64(RETENTION);
    seen.first_seen
        .retain(|_, at| now_ms.saturating_sub(*at) < retention);
    seen.last_prune_ms = now_ms;
}

fn wall_clock_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn to_i64(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
