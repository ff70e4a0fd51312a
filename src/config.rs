//! Configuration for tunnel agents.

use std::time::Duration;

/// Configuration shared by tunnel establishment and agent pooling.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Timeout for the whole CONNECT handshake.
    pub connect_timeout: Duration,
    /// How long a pooled socket may sit free before it is destroyed.
    pub idle_timeout: Duration,
    /// Maximum number of free sockets kept per agent.
    pub max_idle: usize,
    /// Interval at which the reaper scans the free pool.
    pub reaper_interval: Duration,
    /// Skip certificate validation on the proxy hop itself. The proxy leg
    /// is treated as trusted infrastructure; validation of the tunneled
    /// destination stays with the TLS layer above this crate.
    pub accept_invalid_proxy_certs: bool,
}

impl TunnelConfig {
    /// Create a new configuration builder.
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::new()
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfigBuilder::new().build()
    }
}

/// Builder for `TunnelConfig`.
pub struct TunnelConfigBuilder {
    connect_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    max_idle: Option<usize>,
    reaper_interval: Option<Duration>,
    accept_invalid_proxy_certs: Option<bool>,
}

impl TunnelConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            connect_timeout: None,
            idle_timeout: None,
            max_idle: None,
            reaper_interval: None,
            accept_invalid_proxy_certs: None,
        }
    }

    /// Set the timeout for the CONNECT handshake.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set how long a pooled socket may sit free before eviction.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set the maximum number of free sockets kept per agent.
    pub fn max_idle(mut self, max: usize) -> Self {
        self.max_idle = Some(max);
        self
    }

    /// Set the interval at which the reaper scans the free pool.
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = Some(interval);
        self
    }

    /// Set whether certificate validation is skipped on the proxy hop.
    pub fn accept_invalid_proxy_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_proxy_certs = Some(accept);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TunnelConfig {
        TunnelConfig {
            connect_timeout: self.connect_timeout.unwrap_or(Duration::from_secs(16)),
            idle_timeout: self.idle_timeout.unwrap_or(Duration::from_secs(60)),
            max_idle: self.max_idle.unwrap_or(8),
            reaper_interval: self.reaper_interval.unwrap_or(Duration::from_secs(1)),
            accept_invalid_proxy_certs: self.accept_invalid_proxy_certs.unwrap_or(true),
        }
    }
}

impl Default for TunnelConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let config = TunnelConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(16));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert!(config.accept_invalid_proxy_certs);
    }

    #[test]
    fn builder_overrides() {
        let config = TunnelConfig::builder()
            .connect_timeout(Duration::from_secs(2))
            .idle_timeout(Duration::from_secs(5))
            .max_idle(2)
            .accept_invalid_proxy_certs(false)
            .build();
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.max_idle, 2);
        assert!(!config.accept_invalid_proxy_certs);
    }
}
