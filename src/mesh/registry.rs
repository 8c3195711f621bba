use std::collections::HashMap;
use std::path::{Path, PathBuf};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::mesh::types::Service;
use crate::policy::TrafficPolicy;
use crate::types::Result;
use crate::utils::FsUtils;

pub const SERVICES_FILE: &str = "services.json";
pub const POLICIES_FILE: &str = "policies.json";

/// Registry contents as stored on disk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    /// Services by id
    pub services: HashMap<String, Service>,
    /// Policies by `serviceID/policyName`
    pub policies: HashMap<String, TrafficPolicy>,
}

/// Persists the registry as two JSON documents in one directory
#[derive(Debug, Clone)]
pub struct RegistryStore {
    dir: PathBuf,
}

impl RegistryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load both documents; missing files yield an empty registry
    pub async fn load(&self) -> Result<RegistrySnapshot> {
        let services = read_map(&self.dir.join(SERVICES_FILE)).await?;
        let policies = read_map(&self.dir.join(POLICIES_FILE)).await?;

        info!(
            "Loaded registry from {}: {} services, {} policies",
            self.dir.display(),
            services.len(),
            policies.len()
        );
        Ok(RegistrySnapshot { services, policies })
    }

    /// Overwrite both documents
    pub async fn save(
        &self,
        services: &HashMap<String, Service>,
        policies: &HashMap<String, TrafficPolicy>,
    ) -> Result<()> {
        FsUtils::ensure_private_dir(&self.dir).await?;

        let services_json = serde_json::to_vec_pretty(services)?;
        let policies_json = serde_json::to_vec_pretty(policies)?;
        FsUtils::write_atomic(self.dir.join(SERVICES_FILE), &services_json).await?;
        FsUtils::write_atomic(self.dir.join(POLICIES_FILE), &policies_json).await?;

        debug!(
            "Persisted registry: {} services, {} policies",
            services.len(),
            policies.len()
        );
        Ok(())
    }
}

async fn read_map<T: DeserializeOwned>(path: &Path) -> Result<HashMap<String, T>> {
    match FsUtils::read_optional(path).await? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
        None => Ok(HashMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use crate::error::Error;
    use crate::policy::{LbAlgorithm, LoadBalancingPolicy};

    #[tokio::test]
    async fn test_missing_files_load_empty() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path().join("absent"));
        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot, RegistrySnapshot::default());
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = RegistryStore::new(dir.path());

        let mut service = Service::new("svc-1", "web", "default", 8080);
        service.sidecar_injected = true;
        service.labels.insert("tier".into(), "frontend".into());
        let mut policy = TrafficPolicy::named("lb");
        policy.load_balancing = Some(LoadBalancingPolicy::new(LbAlgorithm::Random));

        let services = HashMap::from([(service.id.clone(), service)]);
        let policies = HashMap::from([(policy.key("svc-1"), policy)]);
        store.save(&services, &policies).await.unwrap();

        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.services, services);
        assert_eq!(snapshot.policies, policies);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join(SERVICES_FILE))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(SERVICES_FILE), b"{not json").unwrap();
        let store = RegistryStore::new(dir.path());
        assert!(matches!(store.load().await, Err(Error::Json(_))));
    }
}
