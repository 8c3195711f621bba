use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ca::{Certificate, CertificateAuthority};
use crate::mesh::MeshManager;

/// Renews certificates that are close to expiry
pub struct RotationController {
    /// Issuing authority
    ca: Arc<CertificateAuthority>,
    /// Certificates expiring within this window are renewed
    renew_before: Duration,
}

impl RotationController {
    pub fn new(ca: Arc<CertificateAuthority>, renew_before: Duration) -> Self {
        Self { ca, renew_before }
    }

    /// Renew every certificate expiring within the window.
    ///
    /// Failures are logged and skipped; the certificate is retried on the
    /// next pass.
    pub async fn rotate_expiring(&self) -> Vec<Certificate> {
        let expiring = self.ca.expiring_within(self.renew_before).await;
        if expiring.is_empty() {
            debug!("No certificates due for rotation");
            return Vec::new();
        }

        let mut renewed = Vec::with_capacity(expiring.len());
        for cert in expiring {
            match self.ca.renew_certificate(&cert.service_name, &cert.namespace).await {
                Ok(fresh) => renewed.push(fresh),
                Err(e) => warn!(
                    "Failed to renew certificate for {}/{}: {}",
                    cert.namespace, cert.service_name, e
                ),
            }
        }

        info!("Rotated {} certificate(s)", renewed.len());
        renewed
    }
}

/// Run `rotate_certificates` on the manager every `period` until `token`
/// is cancelled or the manager is dropped
pub fn spawn(manager: Weak<MeshManager>, period: Duration, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let manager = match manager.upgrade() {
                Some(manager) => manager,
                None => break,
            };
            if let Err(e) = manager.rotate_certificates().await {
                error!("Certificate rotation failed: {}", e);
            }
        }

        debug!("Certificate rotation task exited");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_rotates_only_expiring_certificates() {
        let dir = tempdir().unwrap();
        let ca = Arc::new(
            CertificateAuthority::new(dir.path(), "cluster.local", Duration::from_secs(3600))
                .await
                .unwrap(),
        );
        let issued = ca.generate_service_certificate("web", "default").await.unwrap();

        // Nothing expires within a minute
        let relaxed = RotationController::new(ca.clone(), Duration::from_secs(60));
        assert!(relaxed.rotate_expiring().await.is_empty());

        // Everything expires within two hours
        let eager = RotationController::new(ca.clone(), Duration::from_secs(7200));
        let renewed = eager.rotate_expiring().await;
        assert_eq!(renewed.len(), 1);
        assert!(renewed[0].serial_number > issued.serial_number);

        let current = ca.get_certificate("web", "default").await.unwrap();
        assert_eq!(current.serial_number, renewed[0].serial_number);
    }
}
