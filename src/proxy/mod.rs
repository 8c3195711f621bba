pub mod admin;
pub mod bootstrap;
pub mod types;

pub use admin::{HttpProxyAdmin, ProxyAdmin, StatsSample};
pub use bootstrap::Bootstrap;
pub use types::{
    ClusterConfig, DiscoveryType, Endpoint, ListenerConfig, SidecarConfig, INBOUND_LISTENER,
    LOCAL_CLUSTER,
};
