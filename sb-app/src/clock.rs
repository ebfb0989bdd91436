use chrono::{DateTime, Utc};

/// Source of wall-clock time for everything that is persisted or compared
/// across workers.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use test_clocks::{ManualClock, TokioClock};

#[cfg(test)]
mod test_clocks {
    use super::Clock;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Time that only moves when a test says so.
    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self {
                now: Mutex::new(
                    Utc.with_ymd_and_hms(2030, 3, 13, 9, 0, 0)
                        .single()
                        .expect("valid start time"),
                ),
            }
        }

        pub fn advance(&self, by: Duration) {
            let mut now = self.now.lock().expect("clock lock");
            *now += chrono::Duration::from_std(by).expect("duration in range");
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().expect("clock lock")
        }
    }

    /// Wall time derived from tokio's clock, so paused-time tests can drive
    /// timers and timestamps together.
    pub struct TokioClock {
        base: DateTime<Utc>,
        origin: tokio::time::Instant,
    }

    impl TokioClock {
        pub fn new() -> Self {
            Self {
                base: ManualClock::new().now(),
                origin: tokio::time::Instant::now(),
            }
        }
    }

    impl Clock for TokioClock {
        fn now(&self) -> DateTime<Utc> {
            let elapsed = self.origin.elapsed();
            self.base + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero())
        }
    }
}
