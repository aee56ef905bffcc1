use chrono::{DateTime, Local};
use std::sync::Mutex;
use std::time::Duration;

/// Source of wall-clock time and of blocking waits.
///
/// Every component that needs "now" or has to wait (volume slides, playback
/// polling, device latency) goes through this trait, so tests can swap in a
/// [`ManualClock`] and run hours of broadcast in microseconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
    fn sleep(&self, duration: Duration);
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock. `sleep` advances time instead of blocking.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Local>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Local>) -> Self {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    /// Jump to an arbitrary time, including backwards.
    pub fn set(&self, when: DateTime<Local>) {
        *self.lock() = when;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.lock();
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Local>> {
        // A poisoned clock still holds a valid timestamp.
        self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}
