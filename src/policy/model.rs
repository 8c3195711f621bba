use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{duration_ms, Result, ServiceMetrics};

/// Upper bound on retry attempts a policy may request
pub const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Load balancing algorithm understood by the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LbAlgorithm {
    RoundRobin,
    LeastRequest,
    RingHash,
    Random,
}

impl LbAlgorithm {
    /// Name used in the bootstrap document (`lb_policy`)
    pub fn as_str(&self) -> &'static str {
        match self {
            LbAlgorithm::RoundRobin => "ROUND_ROBIN",
            LbAlgorithm::LeastRequest => "LEAST_REQUEST",
            LbAlgorithm::RingHash => "RING_HASH",
            LbAlgorithm::Random => "RANDOM",
        }
    }
}

impl Default for LbAlgorithm {
    fn default() -> Self {
        LbAlgorithm::RoundRobin
    }
}

impl fmt::Display for LbAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LbAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ROUND_ROBIN" => Ok(LbAlgorithm::RoundRobin),
            "LEAST_REQUEST" => Ok(LbAlgorithm::LeastRequest),
            "RING_HASH" => Ok(LbAlgorithm::RingHash),
            "RANDOM" => Ok(LbAlgorithm::Random),
            other => Err(Error::Validation(format!(
                "unsupported load balancing algorithm: {:?}",
                other
            ))),
        }
    }
}

/// Load balancing policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancingPolicy {
    /// One of ROUND_ROBIN, LEAST_REQUEST, RING_HASH, RANDOM
    pub algorithm: String,
}

impl LoadBalancingPolicy {
    pub fn new(algorithm: LbAlgorithm) -> Self {
        Self { algorithm: algorithm.as_str().to_string() }
    }

    pub fn validate(&self) -> Result<()> {
        self.algorithm().map(|_| ())
    }

    /// Parsed algorithm
    pub fn algorithm(&self) -> Result<LbAlgorithm> {
        self.algorithm.parse()
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub max_connections: u32,
    pub max_pending_requests: u32,
    pub max_requests: u32,
    pub max_retries: u32,
    /// Error ratio, in percent, at which the breaker opens
    pub error_threshold_percent: f64,
    #[serde(rename = "sleep_window_ms", with = "duration_ms")]
    pub sleep_window: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            max_pending_requests: 1024,
            max_requests: 1024,
            max_retries: 3,
            error_threshold_percent: 50.0,
            sleep_window: Duration::from_secs(30),
        }
    }
}

impl CircuitBreaker {
    pub fn validate(&self) -> Result<()> {
        // Counters are unsigned, so only the percentage can be out of range.
        let pct = self.error_threshold_percent;
        if !(0.0..=100.0).contains(&pct) {
            return Err(Error::Validation(format!(
                "circuit breaker error_threshold_percent must be within [0, 100], got {}",
                pct
            )));
        }
        Ok(())
    }

    /// Whether traffic should stop flowing given the observed metrics.
    ///
    /// A breaker already reported open by the proxy stays open. Otherwise the
    /// error ratio is compared against the threshold; with no requests the
    /// ratio is zero, so an idle service never trips on ratio alone.
    pub fn is_open(&self, metrics: &ServiceMetrics) -> bool {
        if metrics.circuit_breaker_open {
            return true;
        }

        let error_rate = if metrics.request_count == 0 {
            0.0
        } else {
            metrics.error_count as f64 / metrics.request_count as f64 * 100.0
        };

        error_rate >= self.error_threshold_percent
    }
}

/// Retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total tries, the first one included
    pub attempts: u32,
    #[serde(rename = "per_try_timeout_ms", with = "duration_ms")]
    pub per_try_timeout: Duration,
    /// Retry conditions, e.g. "5xx", "connect-failure"
    pub retry_on: Vec<String>,
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.attempts < 1 || self.attempts > MAX_RETRY_ATTEMPTS {
            return Err(Error::Validation(format!(
                "retry attempts must be within [1, {}], got {}",
                MAX_RETRY_ATTEMPTS, self.attempts
            )));
        }
        if self.retry_on.is_empty() {
            return Err(Error::Validation("retry_on must not be empty".into()));
        }
        Ok(())
    }
}

/// Active health check parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
    pub path: String,
}

impl HealthCheck {
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() || self.interval.is_zero() {
            return Err(Error::Validation(
                "health check timeout and interval must be positive".into(),
            ));
        }
        if self.unhealthy_threshold == 0 || self.healthy_threshold == 0 {
            return Err(Error::Validation(
                "health check thresholds must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Named bundle of traffic settings applied to a service's sidecar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficPolicy {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancing: Option<LoadBalancingPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreaker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

impl TrafficPolicy {
    /// Empty policy with the given name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            load_balancing: None,
            circuit_breaker: None,
            retry: None,
            health_check: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("policy name must not be empty".into()));
        }
        if let Some(lb) = &self.load_balancing {
            lb.validate()?;
        }
        if let Some(cb) = &self.circuit_breaker {
            cb.validate()?;
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        if let Some(hc) = &self.health_check {
            hc.validate()?;
        }
        Ok(())
    }

    /// Registry key for this policy on the given service
    pub fn key(&self, service_id: &str) -> String {
        policy_key(service_id, &self.name)
    }
}

/// Composite `serviceID/policyName` key
pub fn policy_key(service_id: &str, name: &str) -> String {
    format!("{}/{}", service_id, name)
}
