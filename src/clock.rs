//! Wall-clock abstraction. The sweeper and flow timestamps only need
//! second-granularity epoch time (mirroring the original `time(NULL)` use);
//! going through a trait lets tests advance time without sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now_secs(&self) -> i64;
}

#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// A clock tests can advance explicitly, e.g. to simulate
/// "advance clock past UDP_TIMEOUT_53" in timeout-eviction tests.
pub struct FakeClock(AtomicI64);

impl FakeClock {
    pub fn new(start_secs: i64) -> Self {
        FakeClock(AtomicI64::new(start_secs))
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_secs(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}
