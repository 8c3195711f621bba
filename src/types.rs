use std::fmt;
use serde::{Serialize, Deserialize};

/// Project-wide Result type
pub type Result<T> = std::result::Result<T, crate::error::Error>;

/// Application protocol spoken by a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP/1.1 or HTTP/2
    Http,
    /// gRPC (HTTP/2)
    Grpc,
    /// Opaque TCP
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Grpc => write!(f, "grpc"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Http
    }
}

/// Sidecar lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SidecarStatus {
    /// Starting
    Starting,
    /// Running
    Running,
    /// Stopping
    Stopping,
    /// Stopped
    Stopped,
    /// Bootstrap generation failed
    Failed,
}

impl fmt::Display for SidecarStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SidecarStatus::Starting => write!(f, "starting"),
            SidecarStatus::Running => write!(f, "running"),
            SidecarStatus::Stopping => write!(f, "stopping"),
            SidecarStatus::Stopped => write!(f, "stopped"),
            SidecarStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Observed traffic counters for one sidecar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetrics {
    /// Total upstream requests
    pub request_count: u64,
    /// Requests answered with 5xx or reset
    pub error_count: u64,
    /// Requests per second over the last poll interval
    pub request_rate: f64,
    /// Errors per second over the last poll interval
    pub error_rate: f64,
    /// Latency percentiles in milliseconds
    pub latency_p50: f64,
    pub latency_p95: f64,
    pub latency_p99: f64,
    /// Currently open upstream connections
    pub active_connections: u64,
    /// Whether a circuit breaker is currently tripped
    pub circuit_breaker_open: bool,
    /// Time of the last successful poll
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self {
            request_count: 0,
            error_count: 0,
            request_rate: 0.0,
            error_rate: 0.0,
            latency_p50: 0.0,
            latency_p95: 0.0,
            latency_p99: 0.0,
            active_connections: 0,
            circuit_breaker_open: false,
            last_updated: chrono::Utc::now(),
        }
    }
}

/// Serde helpers that carry a `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
