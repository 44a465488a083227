//! Configuration for image acquisition

use std::time::Duration;

/// Default number of concurrent range fetches per download
pub const DEFAULT_CONNECTIONS: usize = 4;

/// Upper bound for concurrent range fetches
pub const MAX_CONNECTIONS: usize = 16;

/// Default connect/read timeout for network operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default block size for checksum streaming (1 MB)
pub const DEFAULT_READ_BLOCK_SIZE: usize = 1024 * 1024;

/// Default per-segment write batch (256 KB)
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// Default EWMA smoothing factor for speed estimation
pub const DEFAULT_SMOOTHING_FACTOR: f64 = 0.005;

/// Progress tracker timing and smoothing
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressConfig {
    /// Delay before the first sampling tick
    pub initial_delay: Duration,

    /// Cadence of sampling ticks after the initial delay
    pub tick_interval: Duration,

    /// EWMA weight of the newest speed sample, in (0, 1]
    pub smoothing_factor: f64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(2000),
            tick_interval: Duration::from_secs(1),
            smoothing_factor: DEFAULT_SMOOTHING_FACTOR,
        }
    }
}

impl ProgressConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial sampling delay
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the tick cadence (zero is bumped to 1 ms)
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set the smoothing factor (clamped to (0, 1])
    pub fn smoothing_factor(mut self, alpha: f64) -> Self {
        self.smoothing_factor = if alpha.is_finite() {
            alpha.clamp(f64::EPSILON, 1.0)
        } else {
            DEFAULT_SMOOTHING_FACTOR
        };
        self
    }
}

/// Main configuration struct, passed to the orchestrator at call time
#[derive(Debug, Clone)]
pub struct AcquireConfig {
    /// Number of concurrent byte-range fetches
    pub connections: usize,

    /// Connect and read timeout for each network operation
    pub timeout: Duration,

    /// Reconnect attempts per segment on connection-class errors
    pub retry_attempts: u32,

    /// Delay between reconnect attempts
    pub retry_delay: Duration,

    /// Block size used when streaming a file through a hasher
    pub read_block_size: usize,

    /// Bytes a segment buffers before writing them to disk
    pub write_buffer_size: usize,

    /// Minimum interval between transfer-state persists
    pub state_save_interval: Duration,

    /// Minimum interval between aggregate progress updates
    pub progress_update_interval: Duration,

    /// User-Agent header for HTTP requests
    pub user_agent: String,

    /// Progress tracker settings for every phase
    pub progress: ProgressConfig,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            connections: DEFAULT_CONNECTIONS,
            timeout: DEFAULT_TIMEOUT,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            read_block_size: DEFAULT_READ_BLOCK_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            state_save_interval: Duration::from_secs(1),
            progress_update_interval: Duration::from_millis(500),
            user_agent: concat!("imgfetch/", env!("CARGO_PKG_VERSION")).to_string(),
            progress: ProgressConfig::default(),
        }
    }
}

impl AcquireConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of connections (clamped to 1..=MAX_CONNECTIONS)
    pub fn connections(mut self, connections: usize) -> Self {
        self.connections = connections.clamp(1, MAX_CONNECTIONS);
        self
    }

    /// Set the network timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set retry attempts
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Set delay between retries
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set checksum read block size
    pub fn read_block_size(mut self, size: usize) -> Self {
        self.read_block_size = size.max(1);
        self
    }

    /// Set per-segment write buffer size
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size.max(1);
        self
    }

    /// Set the transfer-state persistence interval
    pub fn state_save_interval(mut self, interval: Duration) -> Self {
        self.state_save_interval = interval;
        self
    }

    /// Set the aggregate progress update interval
    pub fn progress_update_interval(mut self, interval: Duration) -> Self {
        self.progress_update_interval = interval;
        self
    }

    /// Set the User-Agent header
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set progress tracker settings
    pub fn progress(mut self, progress: ProgressConfig) -> Self {
        self.progress = progress;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = AcquireConfig::default();
        assert_eq!(config.connections, DEFAULT_CONNECTIONS);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.read_block_size, DEFAULT_READ_BLOCK_SIZE);
        assert_eq!(config.progress_update_interval, Duration::from_millis(500));
        assert!(config.user_agent.starts_with("imgfetch/"));
    }

    #[test]
    fn test_config_builder() {
        let config = AcquireConfig::new()
            .connections(8)
            .timeout(Duration::from_secs(5))
            .retry_attempts(0)
            .write_buffer_size(4096)
            .user_agent("test-agent");

        assert_eq!(config.connections, 8);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.retry_attempts, 0);
        assert_eq!(config.write_buffer_size, 4096);
        assert_eq!(config.user_agent, "test-agent");
    }

    #[test]
    fn test_connections_clamping() {
        assert_eq!(AcquireConfig::new().connections(0).connections, 1);
        assert_eq!(AcquireConfig::new().connections(100).connections, MAX_CONNECTIONS);
    }

    #[test]
    fn test_progress_config_default() {
        let progress = ProgressConfig::default();
        assert_eq!(progress.initial_delay, Duration::from_millis(2000));
        assert_eq!(progress.tick_interval, Duration::from_secs(1));
        assert!((progress.smoothing_factor - 0.005).abs() < f64::EPSILON);
    }

    #[test]
    fn test_smoothing_factor_clamping() {
        assert!((ProgressConfig::new().smoothing_factor(3.0).smoothing_factor - 1.0).abs() < 1e-12);
        assert!(ProgressConfig::new().smoothing_factor(-1.0).smoothing_factor > 0.0);
        assert!(
            (ProgressConfig::new().smoothing_factor(f64::NAN).smoothing_factor
                - DEFAULT_SMOOTHING_FACTOR)
                .abs()
                < 1e-12
        );
    }
}
