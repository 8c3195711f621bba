//! Meshplane - service mesh control plane for container workloads
//!
//! Registers services, injects and supervises their proxy sidecars,
//! applies traffic policies and issues mTLS certificates from a local CA.

// Foundational layer
pub mod error;
pub mod types;
pub mod utils;
pub mod telemetry;
pub mod config;

// Core layer
pub mod ca;
pub mod policy;
pub mod proxy;

// Application layer
pub mod controller;
pub mod mesh;

// Interface layer
pub mod api;

// Public key types
pub use crate::error::Error;
pub use crate::types::{Protocol, Result, ServiceMetrics, SidecarStatus};
pub use crate::config::MeshConfig;
pub use crate::ca::{Certificate, CertificateAuthority};
pub use crate::policy::TrafficPolicy;
pub use crate::controller::SidecarController;
pub use crate::mesh::{MeshEvent, MeshManager, Service};
pub use crate::telemetry::MeshMetrics;
