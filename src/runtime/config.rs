use anyhow::{bail, Result};
use std::time::Duration;

use crate::runtime::telemetry;

const DEFAULT_MAX_ACTIVE_SESSIONS: usize = 100;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1;
const DEFAULT_READY_WAIT_SECS: u64 = 10;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SSH_PORT: u16 = 22;

/// Runtime configuration for a fleet run.
///
/// All instances must be constructed via [`FleetConfig::builder`] or
/// [`FleetConfig::new`] so invariants are validated before any consumer
/// observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetConfig {
    max_active_sessions: usize,
    poll_interval: Duration,
    ready_wait: Duration,
    connect_timeout: Duration,
    stall_budget: Option<Duration>,
    metrics_interval: Duration,
    ssh_port: u16,
}

pub struct FleetConfigParams {
    pub max_active_sessions: usize,
    pub poll_interval: Duration,
    pub ready_wait: Duration,
    pub connect_timeout: Duration,
    pub stall_budget: Option<Duration>,
    pub metrics_interval: Duration,
    pub ssh_port: u16,
}

impl FleetConfig {
    /// Returns a builder to incrementally construct and validate a
    /// configuration.
    pub fn builder() -> FleetConfigBuilder {
        FleetConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values,
    /// enforcing the same validation as the builder.
    pub fn new(params: FleetConfigParams) -> Result<Self> {
        let FleetConfigParams {
            max_active_sessions,
            poll_interval,
            ready_wait,
            connect_timeout,
            stall_budget,
            metrics_interval,
            ssh_port,
        } = params;

        let config = Self {
            max_active_sessions,
            poll_interval,
            ready_wait,
            connect_timeout,
            stall_budget,
            metrics_interval,
            ssh_port,
        };

        config.validate()?;
        Ok(config)
    }

    /// Concurrency ceiling: maximum simultaneously active session drivers.
    pub fn max_active_sessions(&self) -> usize {
        self.max_active_sessions
    }

    /// Sleep between scheduler scan steps.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Length of one readiness-wait window during channel operations.
    pub fn ready_wait(&self) -> Duration {
        self.ready_wait
    }

    /// Ceiling on the TCP connect to a host.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Cumulative readiness-wait budget per channel operation. `None`
    /// retries indefinitely; setting it converts a stalled peer into a
    /// hard failure instead of an indefinite hang.
    pub fn stall_budget(&self) -> Option<Duration> {
        self.stall_budget
    }

    /// Interval used by the metrics reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Port used when a host address does not carry one.
    pub fn ssh_port(&self) -> u16 {
        self.ssh_port
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.max_active_sessions == 0 {
            bail!("max_active_sessions must be greater than 0");
        }
        if self.poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }
        if self.ready_wait.is_zero() {
            bail!("ready_wait must be greater than 0");
        }
        if self.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }
        if let Some(budget) = self.stall_budget {
            if budget < self.ready_wait {
                bail!(
                    "stall_budget ({:?}) must be at least one ready_wait window ({:?})",
                    budget,
                    self.ready_wait,
                );
            }
        }
        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }
        Ok(())
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_active_sessions: DEFAULT_MAX_ACTIVE_SESSIONS,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            ready_wait: Duration::from_secs(DEFAULT_READY_WAIT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            stall_budget: None,
            metrics_interval: telemetry::DEFAULT_METRICS_INTERVAL,
            ssh_port: DEFAULT_SSH_PORT,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct FleetConfigBuilder {
    max_active_sessions: Option<usize>,
    poll_interval: Option<Duration>,
    ready_wait: Option<Duration>,
    connect_timeout: Option<Duration>,
    stall_budget: Option<Duration>,
    metrics_interval: Option<Duration>,
    ssh_port: Option<u16>,
}

impl FleetConfigBuilder {
    pub fn max_active_sessions(mut self, ceiling: usize) -> Self {
        self.max_active_sessions = Some(ceiling);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn ready_wait(mut self, window: Duration) -> Self {
        self.ready_wait = Some(window);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn stall_budget(mut self, budget: Duration) -> Self {
        self.stall_budget = Some(budget);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = Some(port);
        self
    }

    pub fn build(self) -> Result<FleetConfig> {
        let defaults = FleetConfig::default();
        FleetConfig::new(FleetConfigParams {
            max_active_sessions: self
                .max_active_sessions
                .unwrap_or(defaults.max_active_sessions),
            poll_interval: self.poll_interval.unwrap_or(defaults.poll_interval),
            ready_wait: self.ready_wait.unwrap_or(defaults.ready_wait),
            connect_timeout: self.connect_timeout.unwrap_or(defaults.connect_timeout),
            stall_budget: self.stall_budget.or(defaults.stall_budget),
            metrics_interval: self.metrics_interval.unwrap_or(defaults.metrics_interval),
            ssh_port: self.ssh_port.unwrap_or(defaults.ssh_port),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = FleetConfig::builder().build().expect("defaults are valid");
        assert_eq!(config.max_active_sessions(), 100);
        assert_eq!(config.ready_wait(), Duration::from_secs(10));
        assert_eq!(config.ssh_port(), 22);
        assert_eq!(config.stall_budget(), None);
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(FleetConfig::builder().max_active_sessions(0).build().is_err());
        assert!(FleetConfig::builder()
            .poll_interval(Duration::ZERO)
            .build()
            .is_err());
        assert!(FleetConfig::builder()
            .ready_wait(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn stall_budget_must_cover_one_ready_wait_window() {
        let err = FleetConfig::builder()
            .ready_wait(Duration::from_secs(10))
            .stall_budget(Duration::from_secs(5))
            .build()
            .expect_err("budget below one window is rejected");
        assert!(err.to_string().contains("stall_budget"));

        assert!(FleetConfig::builder()
            .ready_wait(Duration::from_secs(10))
            .stall_budget(Duration::from_secs(60))
            .build()
            .is_ok());
    }
}
