use std::time::Duration;
use serde::{Serialize, Deserialize};

use crate::config::{MeshConfig, MtlsMode};
use crate::error::Error;
use crate::mesh::Service;
use crate::policy::{CircuitBreaker, HealthCheck, LbAlgorithm};
use crate::types::{duration_ms, Protocol, Result};

/// Name of the cluster that fronts the service itself
pub const LOCAL_CLUSTER: &str = "local_service";

/// Name of the default inbound listener
pub const INBOUND_LISTENER: &str = "inbound_listener";

/// Upstream discovery type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryType {
    Static,
    StrictDns,
    LogicalDns,
}

impl DiscoveryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryType::Static => "STATIC",
            DiscoveryType::StrictDns => "STRICT_DNS",
            DiscoveryType::LogicalDns => "LOGICAL_DNS",
        }
    }
}

impl Default for DiscoveryType {
    fn default() -> Self {
        DiscoveryType::Static
    }
}

/// One upstream address of a cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            weight: None,
            priority: None,
        }
    }
}

/// Upstream cluster known to a sidecar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub discovery: DiscoveryType,
    #[serde(default)]
    pub lb_policy: LbAlgorithm,
    #[serde(rename = "connect_timeout_ms", with = "duration_ms", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreaker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

impl ClusterConfig {
    /// Static round-robin cluster over the given endpoints
    pub fn new(name: impl Into<String>, endpoints: Vec<Endpoint>) -> Self {
        Self {
            name: name.into(),
            discovery: DiscoveryType::Static,
            lb_policy: LbAlgorithm::RoundRobin,
            connect_timeout: default_connect_timeout(),
            endpoints,
            circuit_breaker: None,
            health_check: None,
        }
    }
}

/// User-registered listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub name: String,
    #[serde(default = "default_listen_address")]
    pub address: String,
    pub port: u16,
    /// Cluster that receives the listener's traffic
    pub cluster: String,
    /// Route prefix matched by the listener
    #[serde(default = "default_route_prefix")]
    pub prefix: String,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_route_prefix() -> String {
    "/".to_string()
}

impl ListenerConfig {
    pub fn new(name: impl Into<String>, port: u16, cluster: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: default_listen_address(),
            port,
            cluster: cluster.into(),
            prefix: default_route_prefix(),
        }
    }
}

/// Everything needed to render one sidecar's bootstrap document
#[derive(Debug, Clone, PartialEq)]
pub struct SidecarConfig {
    /// Owning service id
    pub service_id: String,
    /// Owning service name
    pub service_name: String,
    /// Owning service namespace
    pub namespace: String,
    /// Port the service listens on locally
    pub service_port: u16,
    /// Service protocol
    pub protocol: Protocol,
    /// Proxy version recorded in node metadata
    pub proxy_version: String,
    /// Proxy admin port
    pub admin_port: u16,
    /// Inbound listener port
    pub inbound_port: u16,
    /// Outbound capture port
    pub outbound_port: u16,
    /// Mesh mTLS mode at creation time
    pub mtls_mode: MtlsMode,
    /// Interval between metrics polls
    pub metrics_interval: Duration,
    /// Timeout for admin calls
    pub admin_timeout: Duration,
    /// Cluster for the service itself
    pub local_cluster: ClusterConfig,
    /// User clusters
    pub clusters: Vec<ClusterConfig>,
    /// User listeners
    pub listeners: Vec<ListenerConfig>,
}

impl SidecarConfig {
    /// Derive a sidecar configuration from a service and the mesh settings
    pub fn for_service(service: &Service, config: &MeshConfig) -> Self {
        let mut local_cluster = ClusterConfig::new(
            LOCAL_CLUSTER,
            vec![Endpoint::new("127.0.0.1", service.port)],
        );
        local_cluster.connect_timeout = Duration::from_millis(config.proxy.connect_timeout_ms);

        Self {
            service_id: service.id.clone(),
            service_name: service.name.clone(),
            namespace: service.namespace.clone(),
            service_port: service.port,
            protocol: service.protocol,
            proxy_version: config.proxy.version.clone(),
            admin_port: config.proxy.admin_port,
            inbound_port: config.proxy.inbound_port,
            outbound_port: config.proxy.outbound_port,
            mtls_mode: config.mtls.mode,
            metrics_interval: config.metrics_interval(),
            admin_timeout: config.admin_timeout(),
            local_cluster,
            clusters: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Whether mTLS material may be attached to this sidecar
    pub fn mtls_enabled(&self) -> bool {
        self.mtls_mode.is_enabled()
    }

    /// Local cluster followed by user clusters
    pub fn all_clusters(&self) -> impl Iterator<Item = &ClusterConfig> {
        std::iter::once(&self.local_cluster).chain(self.clusters.iter())
    }

    pub fn all_clusters_mut(&mut self) -> impl Iterator<Item = &mut ClusterConfig> {
        std::iter::once(&mut self.local_cluster).chain(self.clusters.iter_mut())
    }

    pub fn has_cluster(&self, name: &str) -> bool {
        self.all_clusters().any(|c| c.name == name)
    }

    pub fn has_listener(&self, name: &str) -> bool {
        name == INBOUND_LISTENER || self.listeners.iter().any(|l| l.name == name)
    }

    /// Add a user cluster; names are unique per sidecar
    pub fn insert_cluster(&mut self, cluster: ClusterConfig) -> Result<()> {
        if self.has_cluster(&cluster.name) {
            return Err(Error::AlreadyExists(format!("cluster {}", cluster.name)));
        }
        self.clusters.push(cluster);
        Ok(())
    }

    /// Remove a user cluster, returning it with its former position
    pub fn take_cluster(&mut self, name: &str) -> Result<(usize, ClusterConfig)> {
        let index = self
            .clusters
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::NotFound(format!("cluster {}", name)))?;
        Ok((index, self.clusters.remove(index)))
    }

    /// Add a user listener; names are unique per sidecar
    pub fn insert_listener(&mut self, listener: ListenerConfig) -> Result<()> {
        if self.has_listener(&listener.name) {
            return Err(Error::AlreadyExists(format!("listener {}", listener.name)));
        }
        self.listeners.push(listener);
        Ok(())
    }

    /// Remove a user listener, returning it with its former position
    pub fn take_listener(&mut self, name: &str) -> Result<(usize, ListenerConfig)> {
        let index = self
            .listeners
            .iter()
            .position(|l| l.name == name)
            .ok_or_else(|| Error::NotFound(format!("listener {}", name)))?;
        Ok((index, self.listeners.remove(index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sidecar_config() -> SidecarConfig {
        let service = Service::new("svc-1", "web", "default", 8080);
        SidecarConfig::for_service(&service, &MeshConfig::default())
    }

    #[test]
    fn test_for_service_points_local_cluster_at_service_port() {
        let config = sidecar_config();
        assert_eq!(config.local_cluster.name, LOCAL_CLUSTER);
        assert_eq!(config.local_cluster.endpoints, vec![Endpoint::new("127.0.0.1", 8080)]);
        assert_eq!(config.admin_port, 15000);
        assert!(config.clusters.is_empty());
    }

    #[test]
    fn test_cluster_names_are_unique() {
        let mut config = sidecar_config();
        let backend = ClusterConfig::new("backend", vec![Endpoint::new("10.0.0.1", 80)]);

        config.insert_cluster(backend.clone()).unwrap();
        assert!(config.insert_cluster(backend).unwrap_err().is_already_exists());

        let local = ClusterConfig::new(LOCAL_CLUSTER, vec![Endpoint::new("10.0.0.1", 80)]);
        assert!(config.insert_cluster(local).unwrap_err().is_already_exists());

        let (index, removed) = config.take_cluster("backend").unwrap();
        assert_eq!(index, 0);
        assert_eq!(removed.name, "backend");
        assert!(config.take_cluster("backend").unwrap_err().is_not_found());
    }

    #[test]
    fn test_listener_names_are_unique() {
        let mut config = sidecar_config();
        config.insert_listener(ListenerConfig::new("edge", 9000, "backend")).unwrap();
        assert!(config
            .insert_listener(ListenerConfig::new("edge", 9001, "backend"))
            .unwrap_err()
            .is_already_exists());
        assert!(config
            .insert_listener(ListenerConfig::new(INBOUND_LISTENER, 9002, "backend"))
            .unwrap_err()
            .is_already_exists());
        assert!(config.take_listener("missing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_cluster_json_shape() {
        let json = r#"{
            "name": "backend",
            "type": "STRICT_DNS",
            "lb_policy": "LEAST_REQUEST",
            "endpoints": [{"address": "backend.internal", "port": 80, "weight": 3}]
        }"#;
        let cluster: ClusterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cluster.discovery, DiscoveryType::StrictDns);
        assert_eq!(cluster.lb_policy, LbAlgorithm::LeastRequest);
        assert_eq!(cluster.connect_timeout, Duration::from_secs(5));
        assert_eq!(cluster.endpoints[0].weight, Some(3));
        assert_eq!(cluster.endpoints[0].priority, None);
    }
}
