use std::collections::{BTreeMap, HashMap};
use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::types::Protocol;

/// Workload registered with the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Caller-supplied unique id
    pub id: String,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub container_id: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub sidecar_injected: bool,
    #[serde(default)]
    pub mtls_enabled: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Service {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
        port: u16,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            namespace: namespace.into(),
            container_id: String::new(),
            port,
            protocol: Protocol::default(),
            labels: HashMap::new(),
            sidecar_injected: false,
            mtls_enabled: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump `updated_at`, never moving it before `created_at`
    pub fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.created_at);
    }
}

/// Kind of a mesh notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "service.registered")]
    ServiceRegistered,
    #[serde(rename = "service.unregistered")]
    ServiceUnregistered,
    #[serde(rename = "sidecar.injected")]
    SidecarInjected,
    #[serde(rename = "sidecar.removed")]
    SidecarRemoved,
    #[serde(rename = "policy.applied")]
    PolicyApplied,
    #[serde(rename = "mtls.enabled")]
    MtlsEnabled,
    #[serde(rename = "certificate.rotated")]
    CertificateRotated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ServiceRegistered => "service.registered",
            EventKind::ServiceUnregistered => "service.unregistered",
            EventKind::SidecarInjected => "sidecar.injected",
            EventKind::SidecarRemoved => "sidecar.removed",
            EventKind::PolicyApplied => "policy.applied",
            EventKind::MtlsEnabled => "mtls.enabled",
            EventKind::CertificateRotated => "certificate.rotated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best-effort notification of a registry change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshEvent {
    pub kind: EventKind,
    pub service_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

impl MeshEvent {
    pub fn new(kind: EventKind, service_id: impl Into<String>) -> Self {
        Self {
            kind,
            service_id: service_id.into(),
            timestamp: Utc::now(),
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }
}
