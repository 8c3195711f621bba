use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::Error;
use crate::policy::TrafficPolicy;
use crate::types::Result;

/// Default config path when neither an argument nor `MESH_CONFIG` is given
pub const DEFAULT_CONFIG_PATH: &str = "config/mesh.yaml";

/// Main configuration structure for the mesh control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Master switch for the mesh
    pub enabled: bool,

    /// Inject a sidecar into every newly registered service
    pub auto_inject: bool,

    /// Mutual TLS settings
    pub mtls: MtlsConfig,

    /// Sidecar proxy settings
    pub proxy: ProxyConfig,

    /// Policies applied to every new sidecar before service-specific ones
    pub default_policies: Vec<TrafficPolicy>,

    /// Directory holding `services.json` and `policies.json`
    pub store_dir: PathBuf,

    /// Directory holding issued certificates
    pub certs_dir: PathBuf,

    /// Capacity of the event notification queue
    pub event_queue_size: usize,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// REST API configuration
    pub api: ApiConfig,
}

/// mTLS mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MtlsMode {
    /// Only mutually authenticated traffic is accepted
    Strict,
    /// Plaintext is accepted alongside mTLS
    Permissive,
    /// mTLS is switched off mesh-wide
    Disabled,
}

impl MtlsMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, MtlsMode::Disabled)
    }
}

impl fmt::Display for MtlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MtlsMode::Strict => write!(f, "strict"),
            MtlsMode::Permissive => write!(f, "permissive"),
            MtlsMode::Disabled => write!(f, "disabled"),
        }
    }
}

impl FromStr for MtlsMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(MtlsMode::Strict),
            "permissive" => Ok(MtlsMode::Permissive),
            "disabled" => Ok(MtlsMode::Disabled),
            other => Err(Error::Config(format!("Unknown mTLS mode: {}", other))),
        }
    }
}

/// Mutual TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MtlsConfig {
    /// strict, permissive or disabled
    pub mode: MtlsMode,

    /// Trust domain used in SPIFFE URIs
    pub trust_domain: String,

    /// Certificate lifetime in hours
    pub cert_validity_hours: u64,

    /// Renew certificates expiring within this many hours
    pub renew_before_hours: u64,

    /// How often the rotation task looks for expiring certificates
    pub rotation_check_secs: u64,
}

/// Sidecar proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy container image
    pub image: String,

    /// Proxy version, reported in node metadata
    pub version: String,

    /// Admin endpoint port
    pub admin_port: u16,

    /// Inbound interception port
    pub inbound_port: u16,

    /// Outbound interception port
    pub outbound_port: u16,

    /// Resource limits handed to the runtime
    pub resources: ResourceLimits,

    /// Metrics polling interval in seconds
    pub metrics_interval_secs: u64,

    /// Timeout for admin endpoint calls in milliseconds
    pub admin_timeout_ms: u64,

    /// Upstream connect timeout written into generated clusters, in milliseconds
    pub connect_timeout_ms: u64,
}

/// Sidecar resource limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu: String,
    pub memory: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,

    /// Emit JSON lines instead of text
    pub json: bool,
}

/// REST API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address
    pub listen_addr: String,

    /// Path prefix for versioned routes
    pub path_prefix: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_inject: true,
            mtls: MtlsConfig::default(),
            proxy: ProxyConfig::default(),
            default_policies: Vec::new(),
            store_dir: PathBuf::from("./data/mesh"),
            certs_dir: PathBuf::from("./data/mesh/certs"),
            event_queue_size: 256,
            logging: LoggingConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl Default for MtlsConfig {
    fn default() -> Self {
        Self {
            mode: MtlsMode::Permissive,
            trust_domain: "cluster.local".to_string(),
            cert_validity_hours: 24,
            renew_before_hours: 4,
            rotation_check_secs: 300,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            image: "envoyproxy/envoy".to_string(),
            version: "v1.28.0".to_string(),
            admin_port: 15000,
            inbound_port: 15006,
            outbound_port: 15001,
            resources: ResourceLimits::default(),
            metrics_interval_secs: 10,
            admin_timeout_ms: 2000,
            connect_timeout_ms: 5000,
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu: "500m".to_string(),
            memory: "256Mi".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            path_prefix: "/api/v1".to_string(),
        }
    }
}

impl MeshConfig {
    /// Certificate lifetime
    pub fn cert_validity(&self) -> Duration {
        Duration::from_secs(self.mtls.cert_validity_hours * 3600)
    }

    /// Renewal window for certificate rotation
    pub fn renew_before(&self) -> Duration {
        Duration::from_secs(self.mtls.renew_before_hours * 3600)
    }

    /// Interval of the certificate rotation task
    pub fn rotation_check_interval(&self) -> Duration {
        Duration::from_secs(self.mtls.rotation_check_secs)
    }

    /// Interval of sidecar metrics polling
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.proxy.metrics_interval_secs)
    }

    /// Timeout for admin endpoint calls
    pub fn admin_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy.admin_timeout_ms)
    }
}

/// Load configuration from a YAML file and environment variables.
///
/// The path comes from `path`, then `MESH_CONFIG`, then [`DEFAULT_CONFIG_PATH`].
/// A missing file yields the built-in defaults; a malformed one is an error.
pub fn load_config(path: Option<&Path>) -> Result<MeshConfig> {
    let config_path = match path {
        Some(p) => p.to_path_buf(),
        None => env::var("MESH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH)),
    };

    debug!("Loading configuration from {}", config_path.display());

    let mut config = if config_path.exists() {
        let config_str = fs::read_to_string(&config_path)?;
        serde_yaml::from_str::<MeshConfig>(&config_str)?
    } else {
        info!(
            "Config file {} not found, using built-in defaults",
            config_path.display()
        );
        MeshConfig::default()
    };

    apply_env_overrides(&mut config)?;
    validate_config(&config)?;

    info!("Configuration loaded successfully");
    Ok(config)
}

/// Apply environment variable overrides to configuration
fn apply_env_overrides(config: &mut MeshConfig) -> Result<()> {
    if let Ok(dir) = env::var("MESH_STORE_DIR") {
        config.store_dir = PathBuf::from(dir);
    }

    if let Ok(dir) = env::var("MESH_CERTS_DIR") {
        config.certs_dir = PathBuf::from(dir);
    }

    if let Ok(mode) = env::var("MESH_MTLS_MODE") {
        config.mtls.mode = mode.parse()?;
    }

    if let Ok(addr) = env::var("MESH_API_ADDR") {
        config.api.listen_addr = addr;
    }

    if let Ok(level) = env::var("MESH_LOG_LEVEL") {
        config.logging.level = level;
    }

    Ok(())
}

/// Validate configuration values
pub fn validate_config(config: &MeshConfig) -> Result<()> {
    let proxy = &config.proxy;
    let ports = [proxy.admin_port, proxy.inbound_port, proxy.outbound_port];
    if ports.iter().any(|p| *p == 0) {
        return Err(Error::Config("Proxy ports must be non-zero".into()));
    }
    if proxy.admin_port == proxy.inbound_port
        || proxy.admin_port == proxy.outbound_port
        || proxy.inbound_port == proxy.outbound_port
    {
        return Err(Error::Config(format!(
            "Proxy ports must be distinct: admin={}, inbound={}, outbound={}",
            proxy.admin_port, proxy.inbound_port, proxy.outbound_port
        )));
    }

    if proxy.metrics_interval_secs == 0 {
        return Err(Error::Config("Metrics interval cannot be zero".into()));
    }

    if !config.api.path_prefix.is_empty() && !config.api.path_prefix.starts_with('/') {
        return Err(Error::Config(format!(
            "API path prefix must start with '/': {:?}",
            config.api.path_prefix
        )));
    }

    if config.event_queue_size == 0 {
        return Err(Error::Config("Event queue size cannot be zero".into()));
    }

    if config.mtls.mode.is_enabled() {
        if config.mtls.trust_domain.is_empty() {
            return Err(Error::Config("Trust domain cannot be empty".into()));
        }
        if config.mtls.cert_validity_hours == 0 {
            return Err(Error::Config("Certificate validity cannot be zero".into()));
        }
        if config.mtls.rotation_check_secs == 0 {
            return Err(Error::Config("Rotation check interval cannot be zero".into()));
        }
    }

    for policy in &config.default_policies {
        policy
            .validate()
            .map_err(|e| Error::Config(format!("Default policy {:?}: {}", policy.name, e)))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.yaml"))).unwrap();

        assert!(config.enabled);
        assert_eq!(config.proxy.admin_port, 15000);
        assert_eq!(config.proxy.inbound_port, 15006);
        assert_eq!(config.proxy.outbound_port, 15001);
        assert_eq!(config.metrics_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_valid_config() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("mesh.yaml");

        let config_content = r#"
enabled: true
auto_inject: false
mtls:
  mode: strict
  trust_domain: "example.org"
proxy:
  image: "envoyproxy/envoy"
  version: "v1.29.1"
  admin_port: 19000
  resources:
    cpu: "1"
    memory: "512Mi"
default_policies:
  - name: baseline
    load_balancing:
      algorithm: LEAST_REQUEST
store_dir: "/var/lib/mesh"
"#;

        let mut file = File::create(&config_path).unwrap();
        file.write_all(config_content.as_bytes()).unwrap();

        let config = load_config(Some(&config_path)).unwrap();
        assert!(!config.auto_inject);
        assert_eq!(config.mtls.mode, MtlsMode::Strict);
        assert_eq!(config.mtls.trust_domain, "example.org");
        assert_eq!(config.proxy.admin_port, 19000);
        // Unspecified fields keep their defaults
        assert_eq!(config.proxy.inbound_port, 15006);
        assert_eq!(config.proxy.resources.memory, "512Mi");
        assert_eq!(config.default_policies.len(), 1);
        assert_eq!(config.store_dir, PathBuf::from("/var/lib/mesh"));
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("mesh.yaml");
        fs::write(&config_path, "mtls: [not, a, map\n").unwrap();

        assert!(matches!(load_config(Some(&config_path)), Err(Error::Yaml(_))));

        fs::write(&config_path, "mtls:\n  mode: sometimes\n").unwrap();
        assert!(load_config(Some(&config_path)).is_err());
    }

    #[test]
    fn test_validate_rejects_port_clash_and_bad_policy() {
        let mut config = MeshConfig::default();
        config.proxy.outbound_port = config.proxy.inbound_port;
        assert!(matches!(validate_config(&config), Err(Error::Config(_))));

        let mut config = MeshConfig::default();
        config.default_policies.push(TrafficPolicy::named(""));
        assert!(validate_config(&config).is_err());

        let mut config = MeshConfig::default();
        config.api.path_prefix = "api".into();
        assert!(matches!(validate_config(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH);
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.default_policies.len(), 1);
        assert_eq!(config.api.path_prefix, "/api/v1");
    }

    #[test]
    fn test_mtls_mode_parse() {
        assert_eq!("STRICT".parse::<MtlsMode>().unwrap(), MtlsMode::Strict);
        assert!(!"disabled".parse::<MtlsMode>().unwrap().is_enabled());
        assert!("off".parse::<MtlsMode>().is_err());
    }
}
