//! Configuration for the publish engine.

use std::time::Duration;

use chrono::TimeDelta;

/// Tunables for a [`crate::engine::PublishEngine`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use chrono::TimeDelta;
/// use pressline::config::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_history_capacity(50)
///     .with_shutdown_grace(Duration::from_secs(10))
///     .with_long_job_threshold(TimeDelta::minutes(5));
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub(crate) history_capacity: usize,
    pub(crate) shutdown_grace: Duration,
    pub(crate) tick_delay: Duration,
    pub(crate) long_job: TimeDelta,
    pub(crate) large_job: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            shutdown_grace: Duration::from_secs(30),
            tick_delay: Duration::from_millis(100),
            long_job: TimeDelta::minutes(2),
            large_job: 100,
        }
    }
}

impl EngineConfig {
    /// How many finished jobs the history retains before evicting the
    /// oldest.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// How long `shutdown` waits for a running job before interrupting it.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// The fixed pause inserted before each scheduling check, giving a
    /// just-finished worker time to fully release its slot.
    pub fn with_tick_delay(mut self, delay: Duration) -> Self {
        self.tick_delay = delay;
        self
    }

    /// Jobs whose time from enqueue to finish exceeds this always notify
    /// their owner on completion.
    pub fn with_long_job_threshold(mut self, threshold: TimeDelta) -> Self {
        self.long_job = threshold;
        self
    }

    /// Jobs publishing more resources than this always notify their owner on
    /// completion.
    pub fn with_large_job_threshold(mut self, threshold: usize) -> Self {
        self.large_job = threshold;
        self
    }
}
