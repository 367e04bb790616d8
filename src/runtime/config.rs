//! Cell configuration.
//!
//! This module defines the configuration structure for a single cell,
//! including heap limits, timer floors and loop tuning.

use crate::error::{Error, Result};
use deno_core::v8;
use std::time::Duration;

/// Default bound on how long `stop` waits for a loop to drain.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Minimum delay for `setTimeout` and `setImmediate`.
pub const DEFAULT_TIMEOUT_FLOOR: Duration = Duration::from_millis(1);
/// Minimum delay for `setInterval`.
pub const DEFAULT_INTERVAL_FLOOR: Duration = Duration::from_millis(10);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a single cell and its interpreter.
#[derive(Debug, Clone)]
pub struct CellConfig {
    /// Maximum heap size in bytes (None = V8 default)
    pub max_heap_size: Option<usize>,

    /// Initial heap size in bytes (None = V8 default)
    pub initial_heap_size: Option<usize>,

    /// Script run after the built-in glue, before any host code.
    pub bootstrap_script: Option<String>,

    pub stop_timeout: Duration,

    pub timeout_floor: Duration,

    pub interval_floor: Duration,

    /// Capacity of the ready channel. Values below 1 are raised to 1.
    pub ready_capacity: usize,

    /// Timeout for network fetches (None = no timeout).
    pub fetch_timeout: Option<Duration>,

    /// Forward `console.*` output to the signal handler (default: true)
    pub enable_console: bool,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            max_heap_size: None,
            initial_heap_size: None,
            bootstrap_script: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            timeout_floor: DEFAULT_TIMEOUT_FLOOR,
            interval_floor: DEFAULT_INTERVAL_FLOOR,
            ready_capacity: 1,
            fetch_timeout: Some(DEFAULT_FETCH_TIMEOUT),
            enable_console: true,
        }
    }
}

impl CellConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_heap_size(mut self, bytes: usize) -> Self {
        self.max_heap_size = Some(bytes);
        self
    }

    pub fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = Some(bytes);
        self
    }

    pub fn with_bootstrap(mut self, source: impl Into<String>) -> Self {
        self.bootstrap_script = Some(source.into());
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_timer_floors(mut self, timeout: Duration, interval: Duration) -> Self {
        self.timeout_floor = timeout;
        self.interval_floor = interval;
        self
    }

    pub fn with_ready_capacity(mut self, capacity: usize) -> Self {
        self.ready_capacity = capacity;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.enable_console = enabled;
        self
    }

    /// Effective ready channel capacity. tokio channels need at least one slot.
    pub fn ready_channel_capacity(&self) -> usize {
        self.ready_capacity.max(1)
    }

    /// Clamp a script-supplied delay in milliseconds to the floor for its kind.
    pub fn timer_delay(&self, delay_ms: f64, repeat: bool) -> Duration {
        let floor = if repeat {
            self.interval_floor
        } else {
            self.timeout_floor
        };
        let requested = if delay_ms.is_finite() && delay_ms > 0.0 {
            Duration::from_secs_f64(delay_ms / 1000.0)
        } else {
            Duration::ZERO
        };
        requested.max(floor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_heap_size.is_some() && self.max_heap_size.is_none() {
            return Err(Error::init(
                "initial_heap_size requires max_heap_size to be set as well",
            ));
        }

        if let (Some(initial), Some(max)) = (self.initial_heap_size, self.max_heap_size) {
            if initial > max {
                return Err(Error::init(format!(
                    "initial_heap_size ({}) cannot exceed max_heap_size ({})",
                    initial, max
                )));
            }
        }

        Ok(())
    }

    pub(crate) fn create_params(&self) -> Option<v8::CreateParams> {
        match (self.max_heap_size, self.initial_heap_size) {
            (Some(max), initial) => {
                let initial_bytes = initial.unwrap_or(0);
                Some(v8::CreateParams::default().heap_limits(initial_bytes, max))
            }
            (None, _) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CellConfig::default();
        assert!(config.max_heap_size.is_none());
        assert!(config.initial_heap_size.is_none());
        assert!(config.bootstrap_script.is_none());
        assert_eq!(config.stop_timeout, DEFAULT_STOP_TIMEOUT);
        assert!(config.enable_console);
        assert!(config.timeout_floor < config.interval_floor);
    }

    #[test]
    fn test_config_builder() {
        let config = CellConfig::new()
            .with_max_heap_size(100 * 1024 * 1024)
            .with_stop_timeout(Duration::from_secs(1))
            .with_ready_capacity(0);

        assert_eq!(config.max_heap_size, Some(100 * 1024 * 1024));
        assert_eq!(config.stop_timeout, Duration::from_secs(1));
        assert_eq!(config.ready_channel_capacity(), 1);
    }

    #[test]
    fn test_timer_delay_floors() {
        let config = CellConfig::default();
        assert_eq!(config.timer_delay(0.0, false), DEFAULT_TIMEOUT_FLOOR);
        assert_eq!(config.timer_delay(-5.0, true), DEFAULT_INTERVAL_FLOOR);
        assert_eq!(config.timer_delay(f64::NAN, false), DEFAULT_TIMEOUT_FLOOR);
        assert_eq!(config.timer_delay(3.0, true), DEFAULT_INTERVAL_FLOOR);
        assert_eq!(config.timer_delay(250.0, true), Duration::from_millis(250));
    }

    #[test]
    fn test_heap_validation() {
        let config = CellConfig::new().with_initial_heap_size(1024);
        assert!(config.validate().is_err());

        let config = CellConfig::new()
            .with_max_heap_size(1024)
            .with_initial_heap_size(2048);
        assert!(config.validate().is_err());

        let config = CellConfig::new()
            .with_max_heap_size(10 * 1024 * 1024)
            .with_initial_heap_size(1024 * 1024);
        assert!(config.validate().is_ok());
    }
}
