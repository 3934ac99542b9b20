//! Configuration for the sync client.

use std::time::Duration;

/// Configuration for a sync client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL (e.g. `ws://localhost:3210/sync`).
    pub url: String,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Liveness checking.
    pub heartbeat: HeartbeatConfig,
    /// Token presented on every new connection.
    pub auth_token: Option<String>,
    /// Capacity of the runtime command channel.
    pub command_capacity: usize,
}

impl ClientConfig {
    /// Creates a configuration for the given server URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            backoff: BackoffConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            auth_token: None,
            command_capacity: 256,
        }
    }

    /// Sets the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the heartbeat configuration.
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Sets the initial authentication token.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Sets the command channel capacity.
    pub fn with_command_capacity(mut self, capacity: usize) -> Self {
        self.command_capacity = capacity.max(1);
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Exponential reconnect backoff with a cap and jitter.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound for the un-jittered delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Maximum extra delay as a fraction of the base delay (0.0 to 1.0).
    pub jitter: f64,
}

impl BackoffConfig {
    /// Creates a backoff with the given initial delay and default growth.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(16),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the jitter fraction. Clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Un-jittered delay for a 1-based attempt number.
    ///
    /// `min(initial * multiplier^(attempt-1), max)`; attempt 0 means no
    /// delay.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else if capped > 0.0 {
            self.max_delay
        } else {
            Duration::ZERO
        }
    }

    /// Delay for an attempt with a jitter sample in `0.0..1.0`.
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.base_delay(attempt);
        let extra = base.as_secs_f64() * self.jitter * sample.clamp(0.0, 1.0);
        base + Duration::from_secs_f64(extra)
    }

    /// Delay for an attempt with random jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_sample(attempt, rand::random::<f64>())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

/// Liveness checking for an open connection.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Send a ping after this long without server traffic.
    pub idle_timeout: Duration,
    /// Treat the connection as dead if nothing arrives this long after a ping.
    pub pong_timeout: Duration,
    /// Whether heartbeats run at all.
    pub enabled: bool,
}

impl HeartbeatConfig {
    /// Creates a heartbeat configuration.
    pub fn new(idle_timeout: Duration, pong_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            pong_timeout,
            enabled: true,
        }
    }

    /// Disables heartbeats.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(10))
    }
}
