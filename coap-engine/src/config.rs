use std::time::Duration;

use crate::retry::{Attempts, Strategy};

/// Configuration for outbound CON reliability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Con {
  /// Retry strategy used while no ACK has arrived.
  ///
  /// Defaults to an exponential strategy with `ACK_TIMEOUT = 2s` and
  /// `ACK_RANDOM_FACTOR = 1.5` (RFC 7252 section 4.8):
  /// ```
  /// use std::time::Duration;
  ///
  /// use coap_engine::config::Con;
  /// use coap_engine::retry::Strategy;
  ///
  /// assert_eq!(Con::default().retry_strategy,
  ///            Strategy::Exponential { init_min: Duration::from_millis(2_000),
  ///                                    init_max: Duration::from_millis(3_000) });
  /// ```
  pub retry_strategy: Strategy,
  /// Total number of transmissions attempted before the transaction is
  /// abandoned -- the initial CON plus every retransmission.
  ///
  /// `RetryTimer` counts the initial send as attempt 1, so `MAX_RETRANSMIT = 4`
  /// retransmissions (per RFC 7252 section 4.8) means 5 total transmissions at
  /// t≈0, 2, 4, 8, 16s before giving up:
  /// ```
  /// use coap_engine::config::Con;
  /// use coap_engine::retry::Attempts;
  ///
  /// assert_eq!(Con::default().max_attempts, Attempts(5));
  /// ```
  pub max_attempts: Attempts,
}

impl Default for Con {
  fn default() -> Self {
    Self { retry_strategy: Strategy::Exponential { init_min: Duration::from_millis(2_000),
                                                    init_max: Duration::from_millis(3_000) },
           max_attempts: Attempts(5) }
  }
}

/// Configuration for the worker pool and its background service loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPool {
  /// A worker is considered heavily loaded once its queue reaches this length.
  ///
  /// Defaults to `64`.
  /// ```
  /// use coap_engine::config::WorkerPool;
  ///
  /// assert_eq!(WorkerPool::default().heavy_load_queue_len, 64);
  /// ```
  pub heavy_load_queue_len: usize,
  /// A worker is never selected once its queue reaches this length, regardless
  /// of load elsewhere in the pool.
  ///
  /// Defaults to `10_000`.
  /// ```
  /// use coap_engine::config::WorkerPool;
  ///
  /// assert_eq!(WorkerPool::default().max_queue_len, 10_000);
  /// ```
  pub max_queue_len: usize,
  /// A worker idle for longer than this is retired, as long as at least one
  /// worker remains.
  ///
  /// Defaults to 60 seconds.
  /// ```
  /// use std::time::Duration;
  ///
  /// use coap_engine::config::WorkerPool;
  ///
  /// assert_eq!(WorkerPool::default().allowed_idle_time, Duration::from_secs(60));
  /// ```
  pub allowed_idle_time: Duration,
}

impl Default for WorkerPool {
  fn default() -> Self {
    Self { heavy_load_queue_len: 64,
           max_queue_len: 10_000,
           allowed_idle_time: Duration::from_secs(60) }
  }
}

/// Configuration for deduplication of inbound work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dedup {
  /// Upper bound on how long a short- or long-term work id is retained for
  /// duplicate detection, per RFC 7252's `EXCHANGE_LIFETIME`.
  ///
  /// Defaults to 247 seconds.
  /// ```
  /// use std::time::Duration;
  ///
  /// use coap_engine::config::Dedup;
  ///
  /// assert_eq!(Dedup::default().exchange_lifetime, Duration::from_secs(247));
  /// ```
  pub exchange_lifetime: Duration,
}

impl Default for Dedup {
  fn default() -> Self {
    Self { exchange_lifetime: Duration::from_secs(247) }
  }
}

/// Runtime configuration for a [`crate::dispatcher::Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  /// See [`Con`].
  pub con: Con,
  /// See [`WorkerPool`].
  pub worker_pool: WorkerPool,
  /// See [`Dedup`].
  pub dedup: Dedup,
  /// How long the listen loop blocks per socket read before checking for
  /// shutdown and nudging the other service loops.
  ///
  /// Defaults to 1 second.
  /// ```
  /// use std::time::Duration;
  ///
  /// use coap_engine::config::Config;
  ///
  /// assert_eq!(Config::default().poll_timeout, Duration::from_secs(1));
  /// ```
  pub poll_timeout: Duration,
}

impl Default for Config {
  fn default() -> Self {
    Self { con: Con::default(),
           worker_pool: WorkerPool::default(),
           dedup: Dedup::default(),
           poll_timeout: Duration::from_secs(1) }
  }
}
