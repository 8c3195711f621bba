use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ca::Certificate;
use crate::error::Error;
use crate::policy::{CircuitBreaker, RetryPolicy, TrafficPolicy};
use crate::proxy::{bootstrap, Bootstrap, ClusterConfig, ListenerConfig, ProxyAdmin, SidecarConfig, StatsSample};
use crate::types::{Result, ServiceMetrics, SidecarStatus};

/// Controller for one logical sidecar proxy.
///
/// All state sits behind a single lock. Paths that already hold it
/// regenerate through `reload_locked`; only `reload` takes the lock itself.
pub struct SidecarController {
    /// Owning service id, fixed for the controller's lifetime
    service_id: String,
    /// Admin client of the proxy
    admin: Arc<dyn ProxyAdmin>,
    /// Mutable state, shared with the polling task
    state: Arc<RwLock<SidecarState>>,
}

struct SidecarState {
    config: SidecarConfig,
    status: SidecarStatus,
    instance_id: Option<String>,
    bootstrap: Option<Bootstrap>,
    metrics: ServiceMetrics,
    certificate: Option<Certificate>,
    /// Last applied breaker, used to derive `circuit_breaker_open`
    circuit_breaker: Option<CircuitBreaker>,
    /// Retry policy attached to routes
    retry: Option<RetryPolicy>,
    last_sample: Option<(StatsSample, Instant)>,
    poller: Option<Poller>,
}

struct Poller {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl SidecarState {
    fn generate(&self) -> Result<Bootstrap> {
        bootstrap::generate(&self.config, self.certificate.as_ref(), self.retry.as_ref())
    }

    fn require_running(&self, op: &str) -> Result<()> {
        if self.status != SidecarStatus::Running {
            return Err(Error::InvalidState(format!(
                "{}: sidecar for {} is {}",
                op, self.config.service_id, self.status
            )));
        }
        Ok(())
    }

    /// Fold a fresh admin reading into the metrics
    fn record_sample(&mut self, sample: StatsSample, at: Instant) {
        let (request_rate, error_rate) = match &self.last_sample {
            Some((previous, previous_at)) => {
                let elapsed = at.duration_since(*previous_at).as_secs_f64();
                if elapsed > 0.0 {
                    (
                        sample.request_count.saturating_sub(previous.request_count) as f64 / elapsed,
                        sample.error_count.saturating_sub(previous.error_count) as f64 / elapsed,
                    )
                } else {
                    (self.metrics.request_rate, self.metrics.error_rate)
                }
            }
            None => (0.0, 0.0),
        };

        let mut metrics = ServiceMetrics {
            request_count: sample.request_count,
            error_count: sample.error_count,
            request_rate,
            error_rate,
            latency_p50: sample.latency_p50,
            latency_p95: sample.latency_p95,
            latency_p99: sample.latency_p99,
            active_connections: sample.active_connections,
            circuit_breaker_open: sample.circuit_breaker_open,
            last_updated: Utc::now(),
        };
        if let Some(cb) = &self.circuit_breaker {
            metrics.circuit_breaker_open = cb.is_open(&metrics);
        }

        self.metrics = metrics;
        self.last_sample = Some((sample, at));
    }
}

impl SidecarController {
    /// Create a stopped sidecar
    pub fn new(config: SidecarConfig, admin: Arc<dyn ProxyAdmin>) -> Self {
        let service_id = config.service_id.clone();
        Self {
            service_id,
            admin,
            state: Arc::new(RwLock::new(SidecarState {
                config,
                status: SidecarStatus::Stopped,
                instance_id: None,
                bootstrap: None,
                metrics: ServiceMetrics::default(),
                certificate: None,
                circuit_breaker: None,
                retry: None,
                last_sample: None,
                poller: None,
            })),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Generate the bootstrap document and begin polling metrics
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;

        match state.status {
            SidecarStatus::Stopped | SidecarStatus::Failed => {}
            other => {
                return Err(Error::InvalidState(format!(
                    "start: sidecar for {} is {}",
                    self.service_id, other
                )));
            }
        }

        state.status = SidecarStatus::Starting;
        let document = match state.generate() {
            Ok(document) => document,
            Err(e) => {
                error!("Sidecar for {} failed to start: {}", self.service_id, e);
                state.status = SidecarStatus::Failed;
                return Err(e);
            }
        };

        let instance_id = Uuid::new_v4().to_string();
        state.bootstrap = Some(document);
        state.instance_id = Some(instance_id.clone());
        state.last_sample = None;
        state.status = SidecarStatus::Running;

        let token = CancellationToken::new();
        let handle = tokio::spawn(poll_metrics(
            self.service_id.clone(),
            self.state.clone(),
            self.admin.clone(),
            state.config.metrics_interval,
            token.clone(),
        ));
        state.poller = Some(Poller { token, handle });

        info!("Sidecar started: service={}, instance={}", self.service_id, instance_id);
        Ok(())
    }

    /// Stop polling and mark the sidecar stopped. Stopping twice is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let poller = {
            let mut state = self.state.write().await;
            match state.status {
                SidecarStatus::Stopped | SidecarStatus::Stopping => return Ok(()),
                _ => {}
            }
            state.status = SidecarStatus::Stopping;
            state.poller.take()
        };

        // The polling task takes the state lock, so it is joined unlocked
        if let Some(poller) = poller {
            poller.token.cancel();
            if let Err(e) = poller.handle.await {
                warn!("Metrics poller for {} ended abnormally: {}", self.service_id, e);
            }
        }

        let mut state = self.state.write().await;
        state.status = SidecarStatus::Stopped;
        state.instance_id = None;

        info!("Sidecar stopped: service={}", self.service_id);
        Ok(())
    }

    /// Regenerate the bootstrap document
    pub async fn reload(&self) -> Result<()> {
        let mut state = self.state.write().await;
        reload_locked(&mut state)
    }

    /// Apply a traffic policy to every cluster and reload.
    ///
    /// Absent policy fields leave the cluster's current settings in place.
    /// A stopped sidecar keeps the settings for its next start.
    pub async fn apply_policy(&self, policy: &TrafficPolicy) -> Result<()> {
        policy.validate()?;
        let algorithm = match &policy.load_balancing {
            Some(lb) => Some(lb.algorithm()?),
            None => None,
        };

        let mut state = self.state.write().await;
        let saved_config = state.config.clone();
        let saved_breaker = state.circuit_breaker.clone();
        let saved_retry = state.retry.clone();
        for cluster in state.config.all_clusters_mut() {
            if let Some(algorithm) = algorithm {
                cluster.lb_policy = algorithm;
            }
            if let Some(cb) = &policy.circuit_breaker {
                cluster.circuit_breaker = Some(cb.clone());
            }
            if let Some(hc) = &policy.health_check {
                cluster.health_check = Some(hc.clone());
            }
        }
        if let Some(cb) = &policy.circuit_breaker {
            state.circuit_breaker = Some(cb.clone());
        }
        if let Some(retry) = &policy.retry {
            state.retry = Some(retry.clone());
        }

        if let Err(e) = reload_if_running(&mut state) {
            // Nothing of a rejected policy stays behind
            state.config = saved_config;
            state.circuit_breaker = saved_breaker;
            state.retry = saved_retry;
            return Err(e);
        }
        debug!("Applied policy {} to sidecar for {}", policy.name, self.service_id);
        Ok(())
    }

    /// Attach mTLS material and reload
    pub async fn configure_mtls(&self, certificate: Certificate) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.config.mtls_enabled() {
            return Err(Error::InvalidState(format!(
                "configure_mtls: mTLS is disabled for sidecar of {}",
                self.service_id
            )));
        }

        info!(
            "Configuring mTLS for {} with certificate serial={}",
            self.service_id, certificate.serial_number
        );
        state.certificate = Some(certificate);
        reload_if_running(&mut state)
    }

    pub async fn add_cluster(&self, cluster: ClusterConfig) -> Result<()> {
        let mut state = self.state.write().await;
        let name = cluster.name.clone();
        state.config.insert_cluster(cluster)?;

        if let Err(e) = reload_if_running(&mut state) {
            // A cluster that breaks generation is not kept
            state.config.clusters.retain(|c| c.name != name);
            return Err(e);
        }
        Ok(())
    }

    pub async fn remove_cluster(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let (index, cluster) = state.config.take_cluster(name)?;

        if let Err(e) = reload_if_running(&mut state) {
            state.config.clusters.insert(index, cluster);
            return Err(e);
        }
        Ok(())
    }

    pub async fn add_listener(&self, listener: ListenerConfig) -> Result<()> {
        let mut state = self.state.write().await;
        let name = listener.name.clone();
        state.config.insert_listener(listener)?;

        if let Err(e) = reload_if_running(&mut state) {
            state.config.listeners.retain(|l| l.name != name);
            return Err(e);
        }
        Ok(())
    }

    pub async fn remove_listener(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let (index, listener) = state.config.take_listener(name)?;

        if let Err(e) = reload_if_running(&mut state) {
            state.config.listeners.insert(index, listener);
            return Err(e);
        }
        Ok(())
    }

    /// Give in-flight connections `timeout` to finish
    pub async fn drain_connections(&self, timeout: Duration) -> Result<()> {
        {
            let state = self.state.read().await;
            state.require_running("drain_connections")?;
        }

        info!("Draining sidecar for {} for {:?}", self.service_id, timeout);
        time::sleep(timeout).await;
        Ok(())
    }

    /// Copy of the last observed metrics
    pub async fn get_metrics(&self) -> Result<ServiceMetrics> {
        let state = self.state.read().await;
        state.require_running("get_metrics")?;
        Ok(state.metrics.clone())
    }

    /// Configuration as reported by the proxy, or the local document when
    /// the admin interface cannot be reached
    pub async fn get_config_dump(&self) -> Result<serde_json::Value> {
        let local = {
            let state = self.state.read().await;
            state.require_running("get_config_dump")?;
            state.bootstrap.clone()
        };

        match self.admin.config_dump().await {
            Ok(dump) => Ok(dump),
            Err(e) => {
                debug!(
                    "Admin config_dump for {} failed, using local document: {}",
                    self.service_id, e
                );
                Ok(serde_json::to_value(&local)?)
            }
        }
    }

    pub async fn status(&self) -> SidecarStatus {
        self.state.read().await.status
    }

    pub async fn instance_id(&self) -> Option<String> {
        self.state.read().await.instance_id.clone()
    }

    /// Last generated bootstrap document
    pub async fn bootstrap(&self) -> Option<Bootstrap> {
        self.state.read().await.bootstrap.clone()
    }

    pub async fn certificate(&self) -> Option<Certificate> {
        self.state.read().await.certificate.clone()
    }

    pub async fn config(&self) -> SidecarConfig {
        self.state.read().await.config.clone()
    }

    /// Add a cluster without validating or reloading
    #[cfg(test)]
    pub(crate) async fn insert_cluster_unchecked(&self, cluster: ClusterConfig) {
        self.state.write().await.config.clusters.push(cluster);
    }
}

fn reload_locked(state: &mut SidecarState) -> Result<()> {
    state.require_running("reload")?;
    let document = state.generate()?;
    state.bootstrap = Some(document);
    debug!("Regenerated bootstrap for {}", state.config.service_id);
    Ok(())
}

fn reload_if_running(state: &mut SidecarState) -> Result<()> {
    if state.status == SidecarStatus::Running {
        reload_locked(state)
    } else {
        Ok(())
    }
}

async fn poll_metrics(
    service_id: String,
    state: Arc<RwLock<SidecarState>>,
    admin: Arc<dyn ProxyAdmin>,
    period: Duration,
    token: CancellationToken,
) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the proxy needs a moment to come up
    interval.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = admin.stats() => result,
        };

        match result {
            Ok(sample) => {
                let mut state = state.write().await;
                state.record_sample(sample, Instant::now());
            }
            Err(e) => debug!("Metrics poll for {} failed: {}", service_id, e),
        }
    }

    debug!("Metrics poller for {} exited", service_id);
}
