//! Time as an injectable capability.
//!
//! Everything in the core that reads "now" or sleeps goes through [`Clock`],
//! so tests can drive time explicitly with [`ManualClock`] while production
//! code uses [`SystemClock`].

use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Notify;

/// Monotonic-enough source of UTC instants plus a sleep primitive.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// The current UTC instant.
    fn now(&self) -> OffsetDateTime;

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);

    /// Suspend the caller until `deadline` (no-op if already past).
    async fn sleep_until(&self, deadline: OffsetDateTime) {
        let remaining = until(self.now(), deadline);
        if !remaining.is_zero() {
            self.sleep(remaining).await;
        }
    }
}

/// Duration from `now` until `deadline`, saturating at zero.
pub fn until(now: OffsetDateTime, deadline: OffsetDateTime) -> Duration {
    let delta = deadline - now;
    if delta.is_positive() {
        delta.unsigned_abs()
    } else {
        Duration::ZERO
    }
}

/// Wall-clock implementation backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Hand-driven clock for development and testing.
///
/// Time only moves when [`advance`](ManualClock::advance) or
/// [`set`](ManualClock::set) is called; sleepers are woken whenever their
/// deadline has been reached.
pub struct ManualClock {
    now: std::sync::Mutex<OffsetDateTime>,
    tick: Notify,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
            tick: Notify::new(),
        }
    }

    /// Move time forward by `delta` and wake any sleepers that are now due.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("clock poisoned");
        *now += delta;
        drop(now);
        self.tick.notify_waiters();
    }

    /// Jump directly to `instant`. Must not move backwards.
    pub fn set(&self, instant: OffsetDateTime) {
        let mut now = self.now.lock().expect("clock poisoned");
        debug_assert!(instant >= *now, "manual clock moved backwards");
        *now = instant;
        drop(now);
        self.tick.notify_waiters();
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().expect("clock poisoned")
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.now() + duration;
        loop {
            let notified = self.tick.notified();
            if self.now() >= deadline {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn until_saturates_at_zero() {
        let t0 = datetime!(2026-01-01 12:00 UTC);
        let t1 = datetime!(2026-01-01 12:00:05 UTC);
        assert_eq!(until(t0, t1), Duration::from_secs(5));
        assert_eq!(until(t1, t0), Duration::ZERO);
    }

    #[tokio::test]
    async fn manual_clock_wakes_sleepers_on_advance() {
        let clock = std::sync::Arc::new(ManualClock::new(datetime!(2026-01-01 0:00 UTC)));
        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep(Duration::from_secs(60)).await })
        };

        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(61));
        sleeper.await.expect("sleeper completes");
    }
}
