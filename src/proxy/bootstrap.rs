//! Proxy bootstrap document.
//!
//! Field names follow the proxy's static bootstrap format and must not be
//! renamed; the document is handed to the proxy verbatim.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use serde::{Serialize, Deserialize};

use crate::ca::Certificate;
use crate::config::MtlsMode;
use crate::error::Error;
use crate::policy::{CircuitBreaker, HealthCheck, RetryPolicy};
use crate::proxy::types::{ClusterConfig, SidecarConfig, INBOUND_LISTENER, LOCAL_CLUSTER};
use crate::types::Result;

const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";
const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bootstrap {
    pub node: Node,
    pub admin: Admin,
    pub static_resources: StaticResources,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub cluster: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Admin {
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub socket_address: SocketAddress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketAddress {
    pub address: String,
    pub port_value: u16,
}

impl Address {
    fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            socket_address: SocketAddress {
                address: address.into(),
                port_value: port,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticResources {
    pub listeners: Vec<Listener>,
    pub clusters: Vec<Cluster>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listener {
    pub name: String,
    pub address: Address,
    pub filter_chains: Vec<FilterChain>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterChain {
    pub filters: Vec<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_socket: Option<TransportSocket>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub name: String,
    pub typed_config: HttpConnectionManager,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConnectionManager {
    pub stat_prefix: String,
    pub route_config: RouteConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    pub virtual_hosts: Vec<VirtualHost>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "match")]
    pub route_match: RouteMatch,
    pub route: RouteAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteMatch {
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteAction {
    pub cluster: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RouteRetryPolicy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRetryPolicy {
    pub retry_on: String,
    pub num_retries: u32,
    pub per_try_timeout: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSocket {
    pub name: String,
    pub typed_config: DownstreamTlsContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownstreamTlsContext {
    pub common_tls_context: CommonTlsContext,
    pub require_client_certificate: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonTlsContext {
    pub tls_certificates: Vec<TlsCertificate>,
    pub validation_context: ValidationContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsCertificate {
    pub certificate_chain: DataSource,
    pub private_key: DataSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationContext {
    pub trusted_ca: DataSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub connect_timeout: String,
    #[serde(rename = "type")]
    pub cluster_type: String,
    pub lb_policy: String,
    pub load_assignment: LoadAssignment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breakers: Option<CircuitBreakers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_checks: Option<Vec<HealthCheckSpec>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadAssignment {
    pub cluster_name: String,
    pub endpoints: Vec<LocalityEndpoints>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalityEndpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    pub lb_endpoints: Vec<LbEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LbEndpoint {
    pub endpoint: EndpointAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancing_weight: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakers {
    pub thresholds: Vec<Thresholds>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub max_connections: u32,
    pub max_pending_requests: u32,
    pub max_requests: u32,
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub timeout: String,
    pub interval: String,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
    pub http_health_check: HttpHealthCheck,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpHealthCheck {
    pub path: String,
}

/// Render a duration the way the proxy expects it, e.g. `5s` or `0.250s`
pub fn format_duration(d: Duration) -> String {
    let millis = d.subsec_millis();
    if millis == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}.{:03}s", d.as_secs(), millis)
    }
}

/// Build the bootstrap document for a sidecar.
///
/// `certificate` adds TLS to the inbound listener; `retry` attaches a retry
/// policy to every route.
pub fn generate(
    config: &SidecarConfig,
    certificate: Option<&Certificate>,
    retry: Option<&RetryPolicy>,
) -> Result<Bootstrap> {
    check(config)?;

    let mut metadata = BTreeMap::new();
    metadata.insert("namespace".to_string(), config.namespace.clone());
    metadata.insert("service_id".to_string(), config.service_id.clone());
    metadata.insert("proxy_version".to_string(), config.proxy_version.clone());

    let node = Node {
        id: format!(
            "sidecar~{}~{}.{}",
            config.service_id, config.service_name, config.namespace
        ),
        cluster: config.service_name.clone(),
        metadata,
    };

    let admin = Admin {
        address: Address::new("127.0.0.1", config.admin_port),
    };

    let mut inbound = listener(
        INBOUND_LISTENER,
        "0.0.0.0",
        config.inbound_port,
        "/",
        LOCAL_CLUSTER,
        retry,
    );
    if let Some(cert) = certificate {
        inbound.filter_chains[0].transport_socket =
            Some(transport_socket(cert, config.mtls_mode == MtlsMode::Strict));
    }

    let mut listeners = vec![inbound];
    listeners.extend(config.listeners.iter().map(|l| {
        listener(&l.name, &l.address, l.port, &l.prefix, &l.cluster, retry)
    }));

    let clusters = config.all_clusters().map(cluster).collect();

    Ok(Bootstrap {
        node,
        admin,
        static_resources: StaticResources { listeners, clusters },
    })
}

fn check(config: &SidecarConfig) -> Result<()> {
    if config.service_port == 0 {
        return Err(Error::ConfigGeneration(format!(
            "service {} has no port",
            config.service_id
        )));
    }

    for c in config.all_clusters() {
        if c.name.is_empty() {
            return Err(Error::ConfigGeneration("cluster with empty name".into()));
        }
        if c.endpoints.is_empty() {
            return Err(Error::ConfigGeneration(format!(
                "cluster {} has no endpoints",
                c.name
            )));
        }
    }

    let mut ports: HashMap<u16, &str> = HashMap::new();
    ports.insert(config.admin_port, "admin");
    ports.insert(config.inbound_port, INBOUND_LISTENER);
    for l in &config.listeners {
        if let Some(owner) = ports.insert(l.port, l.name.as_str()) {
            return Err(Error::ConfigGeneration(format!(
                "listener {} port {} clashes with {}",
                l.name, l.port, owner
            )));
        }
        if !config.has_cluster(&l.cluster) {
            return Err(Error::ConfigGeneration(format!(
                "listener {} routes to unknown cluster {}",
                l.name, l.cluster
            )));
        }
    }

    Ok(())
}

fn listener(
    name: &str,
    address: &str,
    port: u16,
    prefix: &str,
    cluster: &str,
    retry: Option<&RetryPolicy>,
) -> Listener {
    let route = Route {
        route_match: RouteMatch {
            prefix: prefix.to_string(),
        },
        route: RouteAction {
            cluster: cluster.to_string(),
            timeout: None,
            retry_policy: retry.map(route_retry),
        },
    };

    Listener {
        name: name.to_string(),
        address: Address::new(address, port),
        filter_chains: vec![FilterChain {
            filters: vec![Filter {
                name: HTTP_CONNECTION_MANAGER.to_string(),
                typed_config: HttpConnectionManager {
                    stat_prefix: name.to_string(),
                    route_config: RouteConfig {
                        name: format!("{}_route", name),
                        virtual_hosts: vec![VirtualHost {
                            name: format!("{}_host", name),
                            domains: vec!["*".to_string()],
                            routes: vec![route],
                        }],
                    },
                },
            }],
            transport_socket: None,
        }],
    }
}

/// `attempts` counts the first try, Envoy's `num_retries` does not
fn route_retry(retry: &RetryPolicy) -> RouteRetryPolicy {
    RouteRetryPolicy {
        retry_on: retry.retry_on.join(","),
        num_retries: retry.attempts.saturating_sub(1),
        per_try_timeout: format_duration(retry.per_try_timeout),
    }
}

fn transport_socket(cert: &Certificate, require_client_certificate: bool) -> TransportSocket {
    TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        typed_config: DownstreamTlsContext {
            common_tls_context: CommonTlsContext {
                tls_certificates: vec![TlsCertificate {
                    certificate_chain: DataSource {
                        filename: cert.cert_path.display().to_string(),
                    },
                    private_key: DataSource {
                        filename: cert.key_path.display().to_string(),
                    },
                }],
                validation_context: ValidationContext {
                    trusted_ca: DataSource {
                        filename: cert.ca_path.display().to_string(),
                    },
                },
            },
            require_client_certificate,
        },
    }
}

fn cluster(c: &ClusterConfig) -> Cluster {
    // Endpoints sharing a priority form one locality group
    let mut groups: BTreeMap<Option<u32>, Vec<LbEndpoint>> = BTreeMap::new();
    for e in &c.endpoints {
        groups.entry(e.priority).or_default().push(LbEndpoint {
            endpoint: EndpointAddress {
                address: Address::new(e.address.clone(), e.port),
            },
            load_balancing_weight: e.weight,
        });
    }

    Cluster {
        name: c.name.clone(),
        connect_timeout: format_duration(c.connect_timeout),
        cluster_type: c.discovery.as_str().to_string(),
        lb_policy: c.lb_policy.as_str().to_string(),
        load_assignment: LoadAssignment {
            cluster_name: c.name.clone(),
            endpoints: groups
                .into_iter()
                .map(|(priority, lb_endpoints)| LocalityEndpoints { priority, lb_endpoints })
                .collect(),
        },
        circuit_breakers: c.circuit_breaker.as_ref().map(circuit_breakers),
        health_checks: c.health_check.as_ref().map(|hc| vec![health_check(hc)]),
    }
}

fn circuit_breakers(cb: &CircuitBreaker) -> CircuitBreakers {
    CircuitBreakers {
        thresholds: vec![Thresholds {
            max_connections: cb.max_connections,
            max_pending_requests: cb.max_pending_requests,
            max_requests: cb.max_requests,
            max_retries: cb.max_retries,
        }],
    }
}

fn health_check(hc: &HealthCheck) -> HealthCheckSpec {
    HealthCheckSpec {
        timeout: format_duration(hc.timeout),
        interval: format_duration(hc.interval),
        unhealthy_threshold: hc.unhealthy_threshold,
        healthy_threshold: hc.healthy_threshold,
        http_health_check: HttpHealthCheck {
            path: hc.path.clone(),
        },
    }
}
