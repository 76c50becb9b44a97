//! The `Clock` capability (§6): monotonic time for timeouts, wall-clock time
//! for `last_updated` stamps. Kept behind a trait so tests can freeze time.

use std::time::Instant;

pub trait Clock: Send + Sync {
    fn now_monotonic(&self) -> Instant;
    fn now_unix(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_monotonic(&self) -> Instant {
        Instant::now()
    }

    fn now_unix(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    pub struct FakeClock {
        unix: AtomicI64,
        started: Instant,
    }

    impl FakeClock {
        pub fn at(unix: i64) -> Self {
            Self {
                unix: AtomicI64::new(unix),
                started: Instant::now(),
            }
        }

        pub fn advance_secs(&self, secs: i64) {
            self.unix.fetch_add(secs, Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now_monotonic(&self) -> Instant {
            self.started
        }

        fn now_unix(&self) -> i64 {
            self.unix.load(Ordering::SeqCst)
        }
    }
}
