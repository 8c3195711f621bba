use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ca::{Certificate, CertificateAuthority};
use crate::config::{validate_config, MeshConfig};
use crate::controller::{rotation, RotationController, SidecarController};
use crate::error::Error;
use crate::mesh::events::{self, EventBus};
use crate::mesh::registry::{RegistrySnapshot, RegistryStore};
use crate::mesh::types::{EventKind, MeshEvent, Service};
use crate::policy::{policy_key, TrafficPolicy};
use crate::proxy::{HttpProxyAdmin, ProxyAdmin, SidecarConfig};
use crate::telemetry::MeshMetrics;
use crate::types::{Result, ServiceMetrics, SidecarStatus};

/// Builds the admin client for a new sidecar
pub type AdminFactory = Arc<dyn Fn(&SidecarConfig) -> Result<Arc<dyn ProxyAdmin>> + Send + Sync>;

/// Admin clients that talk HTTP to the sidecar's admin port
pub fn http_admin_factory() -> AdminFactory {
    Arc::new(|config: &SidecarConfig| -> Result<Arc<dyn ProxyAdmin>> {
        let admin = HttpProxyAdmin::new(config.admin_port, config.admin_timeout)?;
        Ok(Arc::new(admin) as Arc<dyn ProxyAdmin>)
    })
}

/// Registry guarded by the manager lock
struct MeshState {
    /// Services by id
    services: HashMap<String, Service>,
    /// Sidecars by service id
    sidecars: HashMap<String, Arc<SidecarController>>,
    /// Policies by `serviceID/policyName`
    policies: HashMap<String, TrafficPolicy>,
}

/// Central registry of services, sidecars and policies.
///
/// Every mutation writes the next registry snapshot to disk before it is
/// committed to memory. Locks are only ever taken manager first, sidecar
/// second.
pub struct MeshManager {
    config: Arc<MeshConfig>,
    state: RwLock<MeshState>,
    store: RegistryStore,
    /// Present unless mTLS is disabled
    ca: Option<Arc<CertificateAuthority>>,
    rotation: Option<RotationController>,
    events: EventBus,
    metrics: MeshMetrics,
    admin_factory: AdminFactory,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MeshManager {
    /// Create a manager with HTTP admin clients, restoring persisted state
    pub async fn new(config: Arc<MeshConfig>, metrics: MeshMetrics) -> Result<Arc<Self>> {
        Self::with_admin_factory(config, metrics, http_admin_factory()).await
    }

    pub async fn with_admin_factory(
        config: Arc<MeshConfig>,
        metrics: MeshMetrics,
        admin_factory: AdminFactory,
    ) -> Result<Arc<Self>> {
        validate_config(&config)?;

        let ca = if config.mtls.mode.is_enabled() {
            let ca = CertificateAuthority::new(
                config.certs_dir.clone(),
                config.mtls.trust_domain.clone(),
                config.cert_validity(),
            )
            .await?;
            Some(Arc::new(ca))
        } else {
            info!("mTLS disabled, certificate authority not started");
            None
        };
        let rotation = ca
            .as_ref()
            .map(|ca| RotationController::new(ca.clone(), config.renew_before()));

        let (events, event_loop) = events::channel(config.event_queue_size, metrics.clone());
        let store = RegistryStore::new(config.store_dir.clone());
        let snapshot = store.load().await?;

        let manager = Arc::new(Self {
            config: config.clone(),
            state: RwLock::new(MeshState {
                services: HashMap::new(),
                sidecars: HashMap::new(),
                policies: HashMap::new(),
            }),
            store,
            ca,
            rotation,
            events,
            metrics,
            admin_factory,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        manager.restore(snapshot).await?;

        let mut tasks = manager.tasks.lock().await;
        tasks.push(tokio::spawn(event_loop.run(manager.shutdown.child_token())));
        if manager.rotation.is_some() {
            tasks.push(rotation::spawn(
                Arc::downgrade(&manager),
                config.rotation_check_interval(),
                manager.shutdown.child_token(),
            ));
        }
        drop(tasks);

        info!("Mesh manager ready (mtls={})", config.mtls.mode);
        Ok(manager)
    }

    /// Load the persisted registry and bring injected services' sidecars back
    async fn restore(&self, snapshot: RegistrySnapshot) -> Result<()> {
        let mut state = self.state.write().await;
        state.services = snapshot.services;
        state.policies = snapshot.policies;

        let mut injected: Vec<String> = state
            .services
            .values()
            .filter(|s| s.sidecar_injected)
            .map(|s| s.id.clone())
            .collect();
        injected.sort();

        let mut cleared = false;
        for id in injected {
            let service = match state.services.get(&id) {
                Some(service) => service.clone(),
                None => continue,
            };
            match self.create_sidecar(&service, &state.policies).await {
                Ok(sidecar) => {
                    state.sidecars.insert(id, sidecar);
                }
                Err(e) => {
                    warn!("Could not restore sidecar for {}: {}", id, e);
                    if let Some(service) = state.services.get_mut(&id) {
                        service.sidecar_injected = false;
                        service.touch();
                    }
                    cleared = true;
                }
            }
        }

        if cleared {
            self.store.save(&state.services, &state.policies).await?;
        }
        self.update_gauges(&state);
        Ok(())
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MeshMetrics {
        &self.metrics
    }

    /// Root certificate of the mesh, if mTLS is configured
    pub fn root_certificate_pem(&self) -> Option<String> {
        self.ca.as_ref().map(|ca| ca.root_certificate_pem().to_string())
    }

    /// Register a service, injecting a sidecar when auto-injection is on
    pub async fn register_service(&self, mut service: Service) -> Result<Service> {
        if service.id.is_empty() {
            return Err(Error::Validation("register_service: service id must not be empty".into()));
        }

        let mut state = self.state.write().await;
        if state.services.contains_key(&service.id) {
            return Err(Error::AlreadyExists(format!(
                "register_service: service {}",
                service.id
            )));
        }

        let now = Utc::now();
        service.created_at = now;
        service.updated_at = now;

        let sidecar = if self.config.enabled && self.config.auto_inject && !service.sidecar_injected {
            let sidecar = self.create_sidecar(&service, &state.policies).await?;
            service.sidecar_injected = true;
            Some(sidecar)
        } else {
            None
        };

        let mut services = state.services.clone();
        services.insert(service.id.clone(), service.clone());
        self.persist(&services, &state.policies, sidecar.as_deref()).await?;

        state.services = services;
        if let Some(sidecar) = sidecar {
            state.sidecars.insert(service.id.clone(), sidecar);
        }
        self.update_gauges(&state);

        info!(
            "Registered service {} ({}/{}), sidecar_injected={}",
            service.id, service.namespace, service.name, service.sidecar_injected
        );
        self.events.publish(
            MeshEvent::new(EventKind::ServiceRegistered, &service.id)
                .with_detail("name", &service.name)
                .with_detail("namespace", &service.namespace),
        );
        Ok(service)
    }

    /// Remove a service, its sidecar and its policies.
    ///
    /// The identity certificate is revoked once no other mTLS service
    /// shares the same name and namespace.
    pub async fn unregister_service(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let mut services = state.services.clone();
        let removed = services
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("unregister_service: service {}", id)))?;
        let prefix = policy_key(id, "");
        let mut policies = state.policies.clone();
        policies.retain(|key, _| !key.starts_with(&prefix));
        self.persist(&services, &policies, None).await?;

        if let Some(sidecar) = state.sidecars.remove(id) {
            if let Err(e) = sidecar.stop().await {
                warn!("Failed to stop sidecar of {}: {}", id, e);
            }
        }
        state.services = services;
        state.policies = policies;
        self.update_gauges(&state);

        if removed.mtls_enabled {
            self.release_certificate(&state.services, &removed).await;
        }

        info!("Unregistered service {}", id);
        self.events.publish(MeshEvent::new(EventKind::ServiceUnregistered, id));
        Ok(())
    }

    pub async fn get_service(&self, id: &str) -> Result<Service> {
        let state = self.state.read().await;
        state
            .services
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("get_service: service {}", id)))
    }

    /// All services, ordered by id
    pub async fn list_services(&self) -> Vec<Service> {
        let state = self.state.read().await;
        let mut services: Vec<Service> = state.services.values().cloned().collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        services
    }

    /// Create and start a sidecar for a registered service
    pub async fn inject_sidecar(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let mut service = state
            .services
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("inject_sidecar: service {}", id)))?;
        if service.sidecar_injected || state.sidecars.contains_key(id) {
            return Err(Error::InvalidState(format!(
                "inject_sidecar: service {} already has a sidecar",
                id
            )));
        }

        let sidecar = self.create_sidecar(&service, &state.policies).await?;
        service.sidecar_injected = true;
        service.touch();

        let mut services = state.services.clone();
        services.insert(id.to_string(), service);
        self.persist(&services, &state.policies, Some(sidecar.as_ref())).await?;

        let instance = sidecar.instance_id().await.unwrap_or_default();
        state.services = services;
        state.sidecars.insert(id.to_string(), sidecar);
        self.update_gauges(&state);

        info!("Injected sidecar into {}", id);
        self.events.publish(
            MeshEvent::new(EventKind::SidecarInjected, id).with_detail("instance_id", instance),
        );
        Ok(())
    }

    /// Stop and delete a service's sidecar
    pub async fn remove_sidecar(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let sidecar = state
            .sidecars
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("remove_sidecar: no sidecar for {}", id)))?;

        let mut services = state.services.clone();
        if let Some(service) = services.get_mut(id) {
            service.sidecar_injected = false;
            service.touch();
        }
        self.persist(&services, &state.policies, None).await?;

        sidecar.stop().await?;
        state.sidecars.remove(id);
        state.services = services;
        self.update_gauges(&state);

        info!("Removed sidecar from {}", id);
        self.events.publish(MeshEvent::new(EventKind::SidecarRemoved, id));
        Ok(())
    }

    /// Revoke the certificate of `removed` unless another mTLS service still uses it
    async fn release_certificate(&self, services: &HashMap<String, Service>, removed: &Service) {
        let ca = match &self.ca {
            Some(ca) => ca,
            None => return,
        };
        let shared = services.values().any(|s| {
            s.mtls_enabled && s.name == removed.name && s.namespace == removed.namespace
        });
        if shared {
            debug!(
                "Keeping certificate of {}/{}, still in use",
                removed.namespace, removed.name
            );
            return;
        }

        match ca.revoke_certificate(&removed.name, &removed.namespace).await {
            Ok(()) => info!(
                "Revoked certificate of {}/{} with service {}",
                removed.namespace, removed.name, removed.id
            ),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(
                "Failed to revoke certificate of {}/{}: {}",
                removed.namespace, removed.name, e
            ),
        }
    }

    /// Store a policy for a service and push it to the service's sidecar.
    ///
    /// If the sidecar rejects the policy the stored policy set is restored.
    pub async fn apply_policy(&self, service_id: &str, policy: TrafficPolicy) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.services.contains_key(service_id) {
            return Err(Error::NotFound(format!("apply_policy: service {}", service_id)));
        }
        if let Err(e) = policy.validate() {
            self.metrics.observe_policy_application(false);
            return Err(e);
        }

        let mut policies = state.policies.clone();
        policies.insert(policy.key(service_id), policy.clone());
        self.persist(&state.services, &policies, None).await?;
        let previous = std::mem::replace(&mut state.policies, policies);

        if let Some(sidecar) = state.sidecars.get(service_id).cloned() {
            let result = sidecar.apply_policy(&policy).await;
            self.metrics.observe_policy_application(result.is_ok());
            if let Err(e) = result {
                warn!("Sidecar of {} rejected policy {}: {}", service_id, policy.name, e);
                match self.store.save(&state.services, &previous).await {
                    Ok(()) => state.policies = previous,
                    Err(save_err) => error!(
                        "Failed to restore policies of {} after rejected apply: {}",
                        service_id, save_err
                    ),
                }
                return Err(e);
            }
        } else {
            self.metrics.observe_policy_application(true);
        }

        info!("Applied policy {} to {}", policy.name, service_id);
        self.events.publish(
            MeshEvent::new(EventKind::PolicyApplied, service_id).with_detail("policy", &policy.name),
        );
        Ok(())
    }

    pub async fn get_policy(&self, service_id: &str, name: &str) -> Result<TrafficPolicy> {
        let state = self.state.read().await;
        state
            .policies
            .get(&policy_key(service_id, name))
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("get_policy: policy {} on {}", name, service_id))
            })
    }

    /// Policies stored for a service, ordered by name
    pub async fn list_policies(&self, service_id: &str) -> Result<Vec<TrafficPolicy>> {
        let state = self.state.read().await;
        if !state.services.contains_key(service_id) {
            return Err(Error::NotFound(format!("list_policies: service {}", service_id)));
        }
        Ok(policies_of(&state.policies, service_id))
    }

    /// Delete a stored policy.
    ///
    /// Settings already pushed to a running sidecar stay in effect until
    /// another policy overrides them or the sidecar is re-created.
    pub async fn remove_policy(&self, service_id: &str, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let key = policy_key(service_id, name);
        if !state.policies.contains_key(&key) {
            return Err(Error::NotFound(format!(
                "remove_policy: policy {} on {}",
                name, service_id
            )));
        }

        let mut policies = state.policies.clone();
        policies.remove(&key);
        self.persist(&state.services, &policies, None).await?;
        state.policies = policies;

        info!("Removed policy {} from {}", name, service_id);
        Ok(())
    }

    /// Issue a certificate for the service and hand it to its sidecar
    pub async fn enable_mtls(&self, id: &str) -> Result<Certificate> {
        let ca = self.ca.as_ref().ok_or_else(|| {
            Error::InvalidState(format!("enable_mtls: mTLS not configured (service {})", id))
        })?;

        let mut state = self.state.write().await;
        let mut service = state
            .services
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("enable_mtls: service {}", id)))?;

        let cert = ca.generate_service_certificate(&service.name, &service.namespace).await?;
        self.metrics.inc_certificates_issued();

        service.mtls_enabled = true;
        service.touch();
        let mut services = state.services.clone();
        services.insert(id.to_string(), service);
        self.persist(&services, &state.policies, None).await?;
        state.services = services;

        if let Some(sidecar) = state.sidecars.get(id) {
            sidecar.configure_mtls(cert.clone()).await?;
        }

        info!("Enabled mTLS for {} (serial={})", id, cert.serial_number);
        self.events.publish(
            MeshEvent::new(EventKind::MtlsEnabled, id).with_detail("serial", cert.serial_number),
        );
        Ok(cert)
    }

    pub async fn get_metrics(&self, id: &str) -> Result<ServiceMetrics> {
        self.sidecar("get_metrics", id).await?.get_metrics().await
    }

    pub async fn sidecar_status(&self, id: &str) -> Result<SidecarStatus> {
        Ok(self.sidecar("sidecar_status", id).await?.status().await)
    }

    pub async fn config_dump(&self, id: &str) -> Result<serde_json::Value> {
        self.sidecar("config_dump", id).await?.get_config_dump().await
    }

    /// Drain the sidecar's connections; the manager lock is not held meanwhile
    pub async fn drain_sidecar(&self, id: &str, timeout: Duration) -> Result<()> {
        self.sidecar("drain_sidecar", id).await?.drain_connections(timeout).await
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Events dropped because the queue was full
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }

    /// Renew certificates close to expiry and push them to sidecars
    pub async fn rotate_certificates(&self) -> Result<Vec<Certificate>> {
        let rotation = match &self.rotation {
            Some(rotation) => rotation,
            None => return Ok(Vec::new()),
        };

        let renewed = rotation.rotate_expiring().await;
        if renewed.is_empty() {
            return Ok(renewed);
        }

        let state = self.state.read().await;
        for cert in &renewed {
            self.metrics.inc_certificates_issued();

            let holders = state.services.values().filter(|s| {
                s.mtls_enabled && s.name == cert.service_name && s.namespace == cert.namespace
            });
            for service in holders {
                if let Some(sidecar) = state.sidecars.get(&service.id) {
                    if let Err(e) = sidecar.configure_mtls(cert.clone()).await {
                        warn!("Failed to push renewed certificate to {}: {}", service.id, e);
                        continue;
                    }
                }
                self.events.publish(
                    MeshEvent::new(EventKind::CertificateRotated, &service.id)
                        .with_detail("serial", cert.serial_number),
                );
            }
        }

        Ok(renewed)
    }

    /// Stop background tasks and every sidecar. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Mesh manager already closed");
            return Ok(());
        }

        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        let state = self.state.write().await;
        let mut ids: Vec<&String> = state.sidecars.keys().collect();
        ids.sort();
        for id in ids {
            if let Some(sidecar) = state.sidecars.get(id) {
                if let Err(e) = sidecar.stop().await {
                    warn!("Failed to stop sidecar of {}: {}", id, e);
                }
            }
        }
        self.metrics.set_running_sidecars(0);

        info!("Mesh manager closed");
        Ok(())
    }

    async fn sidecar(&self, op: &str, id: &str) -> Result<Arc<SidecarController>> {
        let state = self.state.read().await;
        state
            .sidecars
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{}: no sidecar for {}", op, id)))
    }

    /// Build a sidecar with default and stored policies, mTLS material if
    /// the service has it, and start it
    async fn create_sidecar(
        &self,
        service: &Service,
        policies: &HashMap<String, TrafficPolicy>,
    ) -> Result<Arc<SidecarController>> {
        let config = SidecarConfig::for_service(service, &self.config);
        let admin = (self.admin_factory)(&config)?;
        let sidecar = Arc::new(SidecarController::new(config, admin));

        for policy in self.config.default_policies.iter() {
            sidecar.apply_policy(policy).await?;
        }
        for policy in policies_of(policies, &service.id).iter() {
            sidecar.apply_policy(policy).await?;
        }

        if service.mtls_enabled {
            if let Some(ca) = &self.ca {
                let cert = match ca.get_certificate(&service.name, &service.namespace).await {
                    Ok(cert) => cert,
                    Err(e) if e.is_not_found() => {
                        let cert = ca
                            .generate_service_certificate(&service.name, &service.namespace)
                            .await?;
                        self.metrics.inc_certificates_issued();
                        cert
                    }
                    Err(e) => return Err(e),
                };
                sidecar.configure_mtls(cert).await?;
            }
        }

        sidecar.start().await?;
        Ok(sidecar)
    }

    /// Write the next snapshot; a sidecar started for the operation is
    /// stopped again if the write fails
    async fn persist(
        &self,
        services: &HashMap<String, Service>,
        policies: &HashMap<String, TrafficPolicy>,
        started: Option<&SidecarController>,
    ) -> Result<()> {
        if let Err(e) = self.store.save(services, policies).await {
            error!("Failed to persist registry: {}", e);
            if let Some(sidecar) = started {
                if let Err(stop_err) = sidecar.stop().await {
                    warn!("Failed to stop sidecar of {}: {}", sidecar.service_id(), stop_err);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn update_gauges(&self, state: &MeshState) {
        self.metrics.set_registered_services(state.services.len());
        self.metrics.set_running_sidecars(state.sidecars.len());
    }
}

fn policies_of(policies: &HashMap<String, TrafficPolicy>, service_id: &str) -> Vec<TrafficPolicy> {
    let prefix = policy_key(service_id, "");
    let mut matching: Vec<TrafficPolicy> = policies
        .iter()
        .filter(|(key, _)| key.starts_with(&prefix))
        .map(|(_, policy)| policy.clone())
        .collect();
    matching.sort_by(|a, b| a.name.cmp(&b.name));
    matching
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};
    use crate::config::MtlsMode;
    use crate::policy::{CircuitBreaker, LbAlgorithm, LoadBalancingPolicy, RetryPolicy};
    use crate::proxy::admin::MockProxyAdmin;

    fn test_config(dir: &Path, mode: MtlsMode, auto_inject: bool) -> Arc<MeshConfig> {
        let mut config = MeshConfig::default();
        config.store_dir = dir.join("store");
        config.certs_dir = dir.join("certs");
        config.mtls.mode = mode;
        config.auto_inject = auto_inject;
        Arc::new(config)
    }

    fn idle_admin_factory() -> AdminFactory {
        Arc::new(|_config: &SidecarConfig| -> Result<Arc<dyn ProxyAdmin>> {
            let mut admin = MockProxyAdmin::new();
            admin
                .expect_stats()
                .returning(|| Err(Error::HttpClient("unreachable".into())));
            admin
                .expect_config_dump()
                .returning(|| Err(Error::HttpClient("unreachable".into())));
            Ok(Arc::new(admin) as Arc<dyn ProxyAdmin>)
        })
    }

    async fn manager(dir: &TempDir, mode: MtlsMode, auto_inject: bool) -> Arc<MeshManager> {
        crate::telemetry::logging::init_test_logging();
        MeshManager::with_admin_factory(
            test_config(dir.path(), mode, auto_inject),
            MeshMetrics::new().unwrap(),
            idle_admin_factory(),
        )
        .await
        .unwrap()
    }

    fn service(id: &str) -> Service {
        Service::new(id, "web", "default", 8080)
    }

    #[tokio::test]
    async fn test_register_with_auto_inject_starts_sidecar() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir, MtlsMode::Disabled, true).await;

        let registered = manager.register_service(service("svc-1")).await.unwrap();
        assert!(registered.sidecar_injected);
        assert_eq!(manager.sidecar_status("svc-1").await.unwrap(), SidecarStatus::Running);

        let fetched = manager.get_service("svc-1").await.unwrap();
        assert_eq!(fetched.id, "svc-1");
        assert!(fetched.updated_at >= fetched.created_at);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_registration_leaves_original() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir, MtlsMode::Disabled, false).await;

        let original = manager.register_service(service("svc-1")).await.unwrap();
        let mut duplicate = service("svc-1");
        duplicate.port = 9090;
        let err = manager.register_service(duplicate).await.unwrap_err();
        assert!(err.is_already_exists());

        assert_eq!(manager.get_service("svc-1").await.unwrap(), original);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_inject_keeps_one_sidecar() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir, MtlsMode::Disabled, false).await;
        manager.register_service(service("svc-1")).await.unwrap();

        manager.inject_sidecar("svc-1").await.unwrap();
        let err = manager.inject_sidecar("svc-1").await.unwrap_err();
        assert!(err.is_invalid_state());
        assert_eq!(manager.state.read().await.sidecars.len(), 1);

        assert!(manager.inject_sidecar("missing").await.unwrap_err().is_not_found());
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_sidecar_without_injection() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir, MtlsMode::Disabled, false).await;
        let before = manager.register_service(service("svc-1")).await.unwrap();

        let err = manager.remove_sidecar("svc-1").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(manager.get_service("svc-1").await.unwrap(), before);

        manager.inject_sidecar("svc-1").await.unwrap();
        manager.remove_sidecar("svc-1").await.unwrap();
        assert!(!manager.get_service("svc-1").await.unwrap().sidecar_injected);
        assert!(manager.get_metrics("svc-1").await.unwrap_err().is_not_found());

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_enable_mtls_when_disabled() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir, MtlsMode::Disabled, true).await;
        manager.register_service(service("svc-1")).await.unwrap();

        let err = manager.enable_mtls("svc-1").await.unwrap_err();
        assert!(err.is_invalid_state());
        assert!(err.to_string().contains("mTLS not configured"));

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_enable_mtls_pushes_certificate() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir, MtlsMode::Strict, true).await;
        manager.register_service(service("svc-1")).await.unwrap();

        assert!(manager.enable_mtls("missing").await.unwrap_err().is_not_found());

        let cert = manager.enable_mtls("svc-1").await.unwrap();
        assert!(cert.is_valid());
        assert!(cert.cert_path.exists());
        assert!(manager.get_service("svc-1").await.unwrap().mtls_enabled);

        let sidecar = manager.sidecar("test", "svc-1").await.unwrap();
        assert_eq!(sidecar.certificate().await.unwrap().serial_number, cert.serial_number);
        assert_eq!(manager.metrics().certificates_issued(), 1);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_policy_lifecycle() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir, MtlsMode::Disabled, true).await;
        manager.register_service(service("svc-1")).await.unwrap();

        let mut policy = TrafficPolicy::named("resilience");
        policy.load_balancing = Some(LoadBalancingPolicy::new(LbAlgorithm::RingHash));
        policy.circuit_breaker = Some(CircuitBreaker {
            error_threshold_percent: 50.0,
            ..CircuitBreaker::default()
        });
        manager.apply_policy("svc-1", policy.clone()).await.unwrap();

        let stored = manager.get_policy("svc-1", "resilience").await.unwrap();
        assert_eq!(stored, policy);

        let cb = stored.circuit_breaker.unwrap();
        let metrics = |errors| ServiceMetrics {
            request_count: 100,
            error_count: errors,
            ..ServiceMetrics::default()
        };
        assert!(cb.is_open(&metrics(50)));
        assert!(!cb.is_open(&metrics(49)));

        let doc = manager.sidecar("test", "svc-1").await.unwrap().bootstrap().await.unwrap();
        assert_eq!(doc.static_resources.clusters[0].lb_policy, "RING_HASH");

        let mut invalid = TrafficPolicy::named("bad");
        invalid.retry = Some(RetryPolicy {
            attempts: 0,
            per_try_timeout: Duration::from_secs(1),
            retry_on: vec!["5xx".into()],
        });
        assert!(matches!(
            manager.apply_policy("svc-1", invalid).await,
            Err(Error::Validation(_))
        ));
        assert!(manager
            .apply_policy("missing", TrafficPolicy::named("x"))
            .await
            .unwrap_err()
            .is_not_found());

        assert_eq!(manager.list_policies("svc-1").await.unwrap().len(), 1);
        manager.remove_policy("svc-1", "resilience").await.unwrap();
        assert!(manager.get_policy("svc-1", "resilience").await.unwrap_err().is_not_found());
        assert!(manager.remove_policy("svc-1", "resilience").await.unwrap_err().is_not_found());

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_registration() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir, MtlsMode::Disabled, true).await;

        let mut handles = Vec::new();
        for i in 0..32 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.register_service(service(&format!("svc-{}", i))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let services = manager.list_services().await;
        assert_eq!(services.len(), 32);
        for service in &services {
            assert!(service.sidecar_injected);
        }

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let manager = manager(&dir, MtlsMode::Disabled, true).await;
            manager.register_service(service("svc-1")).await.unwrap();
            manager.apply_policy("svc-1", TrafficPolicy::named("p")).await.unwrap();
            manager.close().await.unwrap();
        }

        let manager = manager(&dir, MtlsMode::Disabled, true).await;
        let restored = manager.get_service("svc-1").await.unwrap();
        assert!(restored.sidecar_injected);
        assert_eq!(manager.sidecar_status("svc-1").await.unwrap(), SidecarStatus::Running);
        assert!(manager.get_policy("svc-1", "p").await.is_ok());

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unrestorable_sidecar_clears_flag() {
        let dir = tempdir().unwrap();
        {
            let manager = manager(&dir, MtlsMode::Disabled, false).await;
            let mut broken = Service::new("svc-0", "web", "default", 0);
            broken.sidecar_injected = true;
            manager.register_service(broken).await.unwrap();
            manager.close().await.unwrap();
        }

        let manager = manager(&dir, MtlsMode::Disabled, false).await;
        assert!(!manager.get_service("svc-0").await.unwrap().sidecar_injected);
        assert!(manager.sidecar_status("svc-0").await.unwrap_err().is_not_found());
        manager.close().await.unwrap();

        let snapshot = RegistryStore::new(dir.path().join("store")).load().await.unwrap();
        assert!(!snapshot.services["svc-0"].sidecar_injected);
    }

    #[tokio::test]
    async fn test_unregister_stops_sidecar_and_drops_policies() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir, MtlsMode::Disabled, true).await;
        manager.register_service(service("svc-1")).await.unwrap();
        manager.apply_policy("svc-1", TrafficPolicy::named("p")).await.unwrap();
        let sidecar = manager.sidecar("test", "svc-1").await.unwrap();

        manager.unregister_service("svc-1").await.unwrap();
        assert_eq!(sidecar.status().await, SidecarStatus::Stopped);
        assert!(manager.get_service("svc-1").await.unwrap_err().is_not_found());
        assert!(manager.get_policy("svc-1", "p").await.unwrap_err().is_not_found());
        assert!(manager.unregister_service("svc-1").await.unwrap_err().is_not_found());

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_revokes_unshared_certificate() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir, MtlsMode::Permissive, false).await;
        manager.register_service(service("svc-1")).await.unwrap();
        manager.register_service(service("svc-2")).await.unwrap();
        manager.enable_mtls("svc-1").await.unwrap();
        let cert = manager.enable_mtls("svc-2").await.unwrap();
        let ca = manager.ca.clone().unwrap();

        // svc-2 still presents the web/default identity
        manager.unregister_service("svc-1").await.unwrap();
        assert!(ca.get_certificate("web", "default").await.is_ok());
        assert!(cert.key_path.exists());

        manager.unregister_service("svc-2").await.unwrap();
        assert!(ca.get_certificate("web", "default").await.unwrap_err().is_not_found());
        assert!(!cert.key_path.exists());
        assert!(manager.rotate_certificates().await.unwrap().is_empty());

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_enable_mtls_rejects_identity_outside_certs_dir() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir, MtlsMode::Permissive, false).await;
        let outside = dir.path().join("outside");

        let evil = Service::new("evil", "pwn", outside.to_str().unwrap(), 8080);
        manager.register_service(evil).await.unwrap();
        assert!(matches!(
            manager.enable_mtls("evil").await,
            Err(Error::Validation(_))
        ));

        assert!(!outside.exists());
        assert!(!manager.get_service("evil").await.unwrap().mtls_enabled);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_at_construction() {
        let dir = tempdir().unwrap();

        let mut config = (*test_config(dir.path(), MtlsMode::Disabled, false)).clone();
        config.proxy.metrics_interval_secs = 0;
        let result = MeshManager::with_admin_factory(
            Arc::new(config),
            MeshMetrics::new().unwrap(),
            idle_admin_factory(),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));

        let mut config = (*test_config(dir.path(), MtlsMode::Strict, false)).clone();
        config.mtls.rotation_check_secs = 0;
        let result = MeshManager::with_admin_factory(
            Arc::new(config),
            MeshMetrics::new().unwrap(),
            idle_admin_factory(),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_mtls_certificate_survives_restart() {
        let dir = tempdir().unwrap();
        let (root_pem, issued) = {
            let manager = manager(&dir, MtlsMode::Permissive, true).await;
            manager.register_service(service("svc-1")).await.unwrap();
            let issued = manager.enable_mtls("svc-1").await.unwrap();
            let root_pem = manager.ca.as_ref().unwrap().root_certificate_pem().to_string();
            manager.close().await.unwrap();
            (root_pem, issued)
        };

        let manager = manager(&dir, MtlsMode::Permissive, true).await;
        assert_eq!(manager.ca.as_ref().unwrap().root_certificate_pem(), root_pem);

        let sidecar = manager.sidecar("test", "svc-1").await.unwrap();
        let pushed = sidecar.certificate().await.unwrap();
        assert_eq!(pushed.serial_number, issued.serial_number);
        assert_eq!(pushed.cert_pem, issued.cert_pem);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_policy_rejected_by_sidecar_is_not_stored() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir, MtlsMode::Disabled, true).await;
        manager.register_service(service("svc-1")).await.unwrap();
        let sidecar = manager.sidecar("test", "svc-1").await.unwrap();
        sidecar
            .insert_cluster_unchecked(crate::proxy::ClusterConfig::new("empty", Vec::new()))
            .await;

        let mut policy = TrafficPolicy::named("lb");
        policy.load_balancing = Some(LoadBalancingPolicy::new(LbAlgorithm::Random));
        let err = manager.apply_policy("svc-1", policy).await.unwrap_err();
        assert!(matches!(err, Error::ConfigGeneration(_)));

        assert!(manager.get_policy("svc-1", "lb").await.unwrap_err().is_not_found());
        let snapshot = RegistryStore::new(dir.path().join("store")).load().await.unwrap();
        assert!(snapshot.policies.is_empty());
        assert_eq!(sidecar.config().await.local_cluster.lb_policy, LbAlgorithm::RoundRobin);

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir, MtlsMode::Disabled, true).await;
        let mut events = manager.subscribe();

        manager.register_service(service("svc-1")).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::ServiceRegistered);
        assert_eq!(event.service_id, "svc-1");

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rotation_pushes_renewed_certificates() {
        let dir = tempdir().unwrap();
        let mut config = MeshConfig::default();
        config.store_dir = dir.path().join("store");
        config.certs_dir = dir.path().join("certs");
        config.mtls.mode = MtlsMode::Permissive;
        // Everything issued is immediately due for renewal
        config.mtls.cert_validity_hours = 1;
        config.mtls.renew_before_hours = 2;
        let manager = MeshManager::with_admin_factory(
            Arc::new(config),
            MeshMetrics::new().unwrap(),
            idle_admin_factory(),
        )
        .await
        .unwrap();

        manager.register_service(service("svc-1")).await.unwrap();
        let first = manager.enable_mtls("svc-1").await.unwrap();

        let renewed = manager.rotate_certificates().await.unwrap();
        assert_eq!(renewed.len(), 1);
        assert!(renewed[0].serial_number > first.serial_number);

        let sidecar = manager.sidecar("test", "svc-1").await.unwrap();
        assert_eq!(
            sidecar.certificate().await.unwrap().serial_number,
            renewed[0].serial_number
        );

        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir, MtlsMode::Disabled, true).await;
        manager.register_service(service("svc-1")).await.unwrap();
        let sidecar = manager.sidecar("test", "svc-1").await.unwrap();

        manager.close().await.unwrap();
        manager.close().await.unwrap();
        assert_eq!(sidecar.status().await, SidecarStatus::Stopped);
    }

    #[tokio::test]
    async fn test_persist_failure_rolls_back() {
        let dir = tempdir().unwrap();
        let manager = manager(&dir, MtlsMode::Disabled, true).await;

        // A regular file where the store directory should be
        std::fs::write(dir.path().join("store"), b"").unwrap();

        assert!(manager.register_service(service("svc-1")).await.is_err());
        assert!(manager.get_service("svc-1").await.unwrap_err().is_not_found());
        assert!(manager.state.read().await.sidecars.is_empty());

        manager.close().await.unwrap();
    }
}
