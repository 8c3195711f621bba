use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::Error;
use crate::types::Result;

/// Control plane metrics collector
#[derive(Clone)]
pub struct MeshMetrics {
    /// Registry
    registry: Registry,
    /// Registered services
    registered_services: IntGauge,
    /// Sidecars in the running state
    running_sidecars: IntGauge,
    /// Events handed to the notification queue
    events_published: IntCounter,
    /// Events dropped because the queue was full
    events_dropped: IntCounter,
    /// Certificates issued or renewed
    certificates_issued: IntCounter,
    /// Policy applications by outcome
    policy_applications: IntCounterVec,
}

impl MeshMetrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let registered_services = IntGauge::with_opts(Opts::new(
            "mesh_registered_services",
            "Number of registered services",
        ))?;
        let running_sidecars = IntGauge::with_opts(Opts::new(
            "mesh_running_sidecars",
            "Number of sidecars in the running state",
        ))?;
        let events_published = IntCounter::with_opts(Opts::new(
            "mesh_events_published_total",
            "Events accepted by the notification queue",
        ))?;
        let events_dropped = IntCounter::with_opts(Opts::new(
            "mesh_events_dropped_total",
            "Events dropped because the notification queue was full",
        ))?;
        let certificates_issued = IntCounter::with_opts(Opts::new(
            "mesh_certificates_issued_total",
            "Certificates issued or renewed",
        ))?;
        let policy_applications = IntCounterVec::new(
            Opts::new("mesh_policy_applications_total", "Traffic policy applications"),
            &["result"],
        )?;

        registry.register(Box::new(registered_services.clone()))?;
        registry.register(Box::new(running_sidecars.clone()))?;
        registry.register(Box::new(events_published.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(certificates_issued.clone()))?;
        registry.register(Box::new(policy_applications.clone()))?;

        Ok(Self {
            registry,
            registered_services,
            running_sidecars,
            events_published,
            events_dropped,
            certificates_issued,
            policy_applications,
        })
    }

    pub fn set_registered_services(&self, count: usize) {
        self.registered_services.set(count as i64);
    }

    pub fn set_running_sidecars(&self, count: usize) {
        self.running_sidecars.set(count as i64);
    }

    pub fn inc_events_published(&self) {
        self.events_published.inc();
    }

    pub fn inc_events_dropped(&self) {
        self.events_dropped.inc();
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.get()
    }

    pub fn inc_certificates_issued(&self) {
        self.certificates_issued.inc();
    }

    pub fn certificates_issued(&self) -> u64 {
        self.certificates_issued.get()
    }

    /// Record a policy application, `ok` or `error`
    pub fn observe_policy_application(&self, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.policy_applications.with_label_values(&[result]).inc();
    }

    /// Render all metrics in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("Metrics output is not UTF-8: {}", e)))
    }
}
