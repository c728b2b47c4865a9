//! Poll-until-ready with an injectable clock
//!
//! A timeout is a normal outcome, not an error; callers decide what it means.

use std::time::{Duration, Instant};

/// Monotonic time source. `now` is measured from an arbitrary origin.
pub trait Clock {
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

/// Wall-clock time with real sleeps
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A condition to poll for
pub struct ReadinessCondition<F> {
    pub description: String,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub check: F,
}

impl<F: FnMut() -> bool> ReadinessCondition<F> {
    pub fn new(description: impl Into<String>, poll_interval: Duration, timeout: Duration, check: F) -> Self {
        Self {
            description: description.into(),
            poll_interval,
            timeout,
            check,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready { attempts: u32, elapsed: Duration },
    TimedOut { attempts: u32, elapsed: Duration },
}

impl WaitOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            WaitOutcome::Ready { attempts, .. } | WaitOutcome::TimedOut { attempts, .. } => *attempts,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            WaitOutcome::Ready { elapsed, .. } | WaitOutcome::TimedOut { elapsed, .. } => *elapsed,
        }
    }
}

/// Evaluate the condition until it holds or the timeout elapses.
///
/// The check runs immediately, then once per poll interval. The final sleep is
/// cut short so a timeout is reported no earlier than `timeout` and no later
/// than `timeout + poll_interval`.
pub fn wait_until<C, F>(clock: &C, mut condition: ReadinessCondition<F>) -> WaitOutcome
where
    C: Clock + ?Sized,
    F: FnMut() -> bool,
{
    let start = clock.now();
    let poll_interval = condition.poll_interval.max(Duration::from_millis(1));
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if (condition.check)() {
            return WaitOutcome::Ready {
                attempts,
                elapsed: clock.now().saturating_sub(start),
            };
        }

        let elapsed = clock.now().saturating_sub(start);
        if elapsed >= condition.timeout {
            return WaitOutcome::TimedOut { attempts, elapsed };
        }

        let remaining = condition.timeout - elapsed;
        tracing::debug!(
            condition = %condition.description,
            attempt = attempts,
            elapsed_secs = elapsed.as_secs(),
            "not ready yet"
        );
        if attempts % 6 == 0 {
            println!(
                "  Still waiting for {}... ({} seconds elapsed)",
                condition.description,
                elapsed.as_secs()
            );
        }
        clock.sleep(poll_interval.min(remaining));
    }
}
