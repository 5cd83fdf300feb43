//! Bounded fixed-interval polling.
//!
//! Every wait in a run goes through [`PollPolicy`], so no loop can spin forever:
//! there is no external cancel signal, only the attempt ceiling.

use std::thread;
use std::time::Duration;

/// Interval between attempts and the maximum number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

/// What a single poll attempt observed.
#[derive(Debug)]
pub enum Poll<T> {
    /// The awaited condition holds; stop polling.
    Ready(T),
    /// Not yet; try again after the interval.
    Pending,
    /// The condition can no longer be met; stop polling.
    Abort(anyhow::Error),
}

/// Why a poll loop stopped without a value.
#[derive(Debug)]
pub enum PollExit {
    Exhausted { attempts: u32 },
    Aborted(anyhow::Error),
}

impl PollPolicy {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    pub const fn from_secs(interval_secs: u64, max_attempts: u32) -> Self {
        Self::new(Duration::from_secs(interval_secs), max_attempts)
    }

    /// Run `attempt` until it is ready, aborts, or the budget is spent.
    ///
    /// `attempt` receives the 1-based attempt number. Sleeps happen only between
    /// attempts, never after the last one.
    pub fn run<T, F>(&self, mut attempt: F) -> Result<T, PollExit>
    where
        F: FnMut(u32) -> Poll<T>,
    {
        for n in 1..=self.max_attempts {
            match attempt(n) {
                Poll::Ready(value) => return Ok(value),
                Poll::Abort(err) => return Err(PollExit::Aborted(err)),
                Poll::Pending => {}
            }
            if n < self.max_attempts && !self.interval.is_zero() {
                thread::sleep(self.interval);
            }
        }
        Err(PollExit::Exhausted {
            attempts: self.max_attempts,
        })
    }
}
