#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_BASE_DELAY_DURATION: Duration = Duration::from_millis(3000);
const DEFAULT_MAX_DELAY_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_GROWTH_FACTOR: f64 = 1.5;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Configuration for connection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval for sending the liveness ping while the connection is open
    pub heartbeat_interval: Duration,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
    /// Transport-specific handshake options
    pub protocol: ProtocolOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            reconnect: ReconnectConfig::default(),
            protocol: ProtocolOptions::default(),
        }
    }
}

/// Configuration for automatic reconnection behavior.
///
/// The delay before retry `n` is `base_delay * growth_factor^(n-1)`, capped
/// at `max_delay`.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Delay before the first reconnection attempt
    pub base_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt
    pub growth_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            base_delay: DEFAULT_BASE_DELAY_DURATION,
            max_delay: DEFAULT_MAX_DELAY_DURATION,
            growth_factor: DEFAULT_GROWTH_FACTOR,
        }
    }
}

/// Transport-specific options applied to the opening handshake.
#[non_exhaustive]
#[derive(Debug, Clone, Default)]
pub struct ProtocolOptions {
    /// WebSocket subprotocols offered via `Sec-WebSocket-Protocol`
    pub subprotocols: Vec<String>,
    /// Additional handshake headers as name/value pairs
    pub headers: Vec<(String, String)>,
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        // Randomization factor zero so the documented delay formula holds exactly
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.base_delay)
            .with_randomization_factor(0.0)
            .with_max_interval(config.max_delay)
            .with_multiplier(config.growth_factor)
            .with_max_elapsed_time(None) // Max attempts are handled separately
            .build()
    }
}
