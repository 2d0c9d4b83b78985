use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};

/// A number of attempts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attempts(pub u16);

/// Result of [`RetryTimer::what_should_i_do`].
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum YouShould {
  /// Attempts have been exhausted; the retried work should be considered poisoned.
  Cry,
  /// Not enough time has passed since the last attempt.
  Wait,
  /// A retry should be performed now.
  Retry,
}

/// Strategy to employ when retrying a CON transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Pick a random delay in `[init_min, init_max]` for the first retry, then
  /// double it on each subsequent attempt (exponential backoff with jitter).
  Exponential {
    /// Minimum (inclusive) delay before the second attempt.
    init_min: Duration,
    /// Maximum (inclusive) delay before the second attempt.
    init_max: Duration,
  },
  /// Pick a random delay in `[min, max]` and wait that long between every attempt.
  Delay {
    /// Minimum (inclusive) delay.
    min: Duration,
    /// Maximum (inclusive) delay.
    max: Duration,
  },
}

impl Strategy {
  fn range(&self) -> (Duration, Duration) {
    match *self {
      | Self::Exponential { init_min, init_max } => (init_min, init_max),
      | Self::Delay { min, max } => (min, max),
    }
  }

  fn has_jitter(&self) -> bool {
    let (min, max) = self.range();
    min != max
  }

  /// The total time elapsed since the first attempt if every retry up to
  /// `max_attempts` is exhausted without success.
  pub fn max_time(&self, max_attempts: Attempts) -> Duration {
    match *self {
      | Self::Exponential { init_max, .. } => Self::total_delay_exp(init_max, max_attempts.0),
      | Self::Delay { max, .. } => max * max_attempts.0 as u32,
    }
  }

  fn total_delay_exp(init: Duration, attempt: u16) -> Duration {
    init * 2u32.pow((attempt.max(1) - 1) as u32)
  }
}

/// A non-blocking timer living alongside a CON transmission, telling the
/// caller when to retry and when to give up.
///
/// Unlike the teacher's `no_std` `RetryTimer<C: Clock>`, this is built directly
/// on `std::time::Instant`, since this crate always runs on a hosted target.
#[derive(Debug, Clone, Copy)]
pub struct RetryTimer {
  start: Instant,
  init: Duration,
  strategy: Strategy,
  attempts: Attempts,
  max_attempts: Attempts,
}

impl RetryTimer {
  /// Create a new retry timer, starting the clock now.
  pub fn new(start: Instant, strategy: Strategy, max_attempts: Attempts) -> Self {
    let init = if strategy.has_jitter() {
      let (min, max) = strategy.range();
      let mut rng = rand_chacha::ChaCha8Rng::from_entropy();
      Duration::from_nanos(rng.gen_range(min.as_nanos() as u64..=max.as_nanos() as u64))
    } else {
      strategy.range().0
    };

    Self { start, init, strategy, max_attempts, attempts: Attempts(1) }
  }

  /// The deadline for the next retry attempt.
  pub fn next_deadline(&self) -> Instant {
    self.start + self.delay_for_attempt(self.attempts.0)
  }

  fn delay_for_attempt(&self, attempt: u16) -> Duration {
    match self.strategy {
      | Strategy::Delay { .. } => self.init * attempt as u32,
      | Strategy::Exponential { .. } => Strategy::total_delay_exp(self.init, attempt),
    }
  }

  /// Ask the timer what to do, given the current time.
  pub fn what_should_i_do(&mut self, now: Instant) -> YouShould {
    if self.attempts >= self.max_attempts {
      return YouShould::Cry;
    }

    if now >= self.next_deadline() {
      self.attempts.0 += 1;
      YouShould::Retry
    } else {
      YouShould::Wait
    }
  }

  /// Number of attempts made so far (including the first transmission).
  pub fn attempts(&self) -> Attempts {
    self.attempts
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn delay_retrier_waits_then_retries() {
    let start = Instant::now() - Duration::from_millis(2500);
    let mut retry = RetryTimer::new(start,
                                    Strategy::Delay { min: Duration::from_millis(1000),
                                                      max: Duration::from_millis(1000) },
                                    Attempts(5));

    assert_eq!(retry.what_should_i_do(start + Duration::from_millis(999)), YouShould::Wait);
    assert_eq!(retry.what_should_i_do(start + Duration::from_millis(1000)), YouShould::Retry);
    assert_eq!(retry.what_should_i_do(start + Duration::from_millis(1500)), YouShould::Wait);
  }

  #[test]
  fn exhausts_after_max_attempts() {
    let start = Instant::now();
    let mut retry = RetryTimer::new(start,
                                    Strategy::Delay { min: Duration::from_millis(1),
                                                      max: Duration::from_millis(1) },
                                    Attempts(2));

    let far_future = start + Duration::from_secs(10);
    assert_eq!(retry.what_should_i_do(far_future), YouShould::Retry);
    assert_eq!(retry.what_should_i_do(far_future), YouShould::Cry);
  }

  #[test]
  fn exponential_strategy_doubles_each_attempt() {
    let strategy = Strategy::Exponential { init_min: Duration::from_millis(100),
                                           init_max: Duration::from_millis(100) };
    assert_eq!(strategy.max_time(Attempts(1)), Duration::from_millis(100));
    assert_eq!(strategy.max_time(Attempts(3)), Duration::from_millis(400));
  }
}
