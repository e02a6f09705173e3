//! Timing constants for the lifecycle engine and HCI transport.

/// Frequency of the periodic timer driving tick events and retry checks.
pub const PERIODIC_TIMER_FREQUENCY_SECONDS: u64 = 1;

/// Delay before a failed initialization step is retried.
pub const RETRY_DELAY_SECONDS: u64 = 2;

/// Sleep between idle passes over the update queue.
pub const IDLE_FREQUENCY_MS: u64 = 10;

/// Poll window used by the HCI socket while waiting for data or shutdown.
pub const DATA_WAIT_TIME_MS: u64 = 10;

/// Upper bound on waiting for a management command's completion event.
pub const MAX_EVENT_WAIT_MS: u64 = 1000;

/// Interval at which `start` re-checks the run state during async init.
pub const MAX_ASYNC_INIT_CHECK_INTERVAL_MS: u64 = 10;

/// Largest HCI management frame we will read in one pass.
pub const RESPONSE_MAX_SIZE: usize = 64 * 1024;
