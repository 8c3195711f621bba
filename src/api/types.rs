use std::sync::Arc;
use std::time::Instant;
use serde::{Serialize, Deserialize};

use crate::mesh::MeshManager;
use crate::types::SidecarStatus;

/// API state shared between handlers
#[derive(Clone)]
pub struct ApiState {
    /// Mesh manager
    pub manager: Arc<MeshManager>,
    /// Process start, for uptime
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(manager: Arc<MeshManager>) -> Self {
        Self {
            manager,
            started_at: Instant::now(),
        }
    }
}

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Success status
    pub success: bool,
    /// Response data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Error message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Create a success response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status
    pub status: String,
    /// Version
    pub version: String,
    /// Uptime in seconds
    pub uptime: u64,
    /// Registered services
    pub services: usize,
}

/// Sidecar status response
#[derive(Debug, Serialize, Deserialize)]
pub struct SidecarStatusResponse {
    pub service_id: String,
    pub status: SidecarStatus,
}

/// Drain request payload
#[derive(Debug, Serialize, Deserialize)]
pub struct DrainRequest {
    /// How long to wait for connections to finish
    #[serde(default = "default_drain_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_drain_timeout_ms() -> u64 {
    5000
}
