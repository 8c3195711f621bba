use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use chrono::{DateTime, SubsecRound, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use time::OffsetDateTime;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::ca::types::Certificate;
use crate::error::Error;
use crate::types::Result;
use crate::utils::FsUtils;

/// Lifetime of the self-signed mesh root
const ROOT_VALIDITY_DAYS: i64 = 3650;

/// File name of the root certificate inside the store
pub const ROOT_CERT_FILE: &str = "ca.crt";
/// File name of the root private key inside the store
pub const ROOT_KEY_FILE: &str = "ca.key";

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
/// Serial and validity of an issued certificate, next to its PEM files
const META_FILE: &str = "cert.json";

type Store = HashMap<(String, String), Certificate>;

/// In-process certificate authority for service identities.
///
/// Certificates are keyed by `(namespace, service_name)`; PEM material is
/// mirrored to `<certs_dir>/<namespace>/<service_name>/{cert,key}.pem`.
/// The root key pair lives in the same directory and survives restarts.
pub struct CertificateAuthority {
    /// Certificate store directory
    certs_dir: PathBuf,
    /// Trust domain used in SPIFFE URIs
    trust_domain: String,
    /// Lifetime of issued certificates
    validity: Duration,
    /// Root signing certificate
    root: rcgen::Certificate,
    /// Root certificate PEM
    root_pem: String,
    /// Next serial number to hand out
    next_serial: AtomicU64,
    /// Issued certificates
    store: RwLock<Store>,
}

impl CertificateAuthority {
    /// Open the authority kept in `certs_dir`, creating a root on first use.
    ///
    /// A reloaded root brings back every certificate it issued. A new root
    /// starts from an empty store, since older leaves do not chain to it.
    pub async fn new(
        certs_dir: impl Into<PathBuf>,
        trust_domain: impl Into<String>,
        validity: Duration,
    ) -> Result<Self> {
        let certs_dir = certs_dir.into();
        let trust_domain = trust_domain.into();
        FsUtils::ensure_private_dir(&certs_dir).await?;

        let cert_path = certs_dir.join(ROOT_CERT_FILE);
        let key_path = certs_dir.join(ROOT_KEY_FILE);
        let existing = match (
            FsUtils::read_optional(&cert_path).await?,
            FsUtils::read_optional(&key_path).await?,
        ) {
            (Some(cert), Some(key)) => Some((into_utf8(cert)?, into_utf8(key)?)),
            _ => None,
        };

        let (root, root_pem, store) = match existing {
            Some((root_pem, key_pem)) => {
                let key_pair = KeyPair::from_pem(&key_pem)?;
                let params = CertificateParams::from_ca_cert_pem(&root_pem, key_pair)?;
                let root = rcgen::Certificate::from_params(params)?;
                let store = load_issued(&certs_dir).await?;
                info!(
                    "Loaded certificate authority from {} with {} issued certificate(s)",
                    certs_dir.display(),
                    store.len()
                );
                (root, root_pem, store)
            }
            None => {
                let root = Self::build_root(&trust_domain)?;
                let root_pem = root.serialize_pem()?;
                FsUtils::write_atomic(&key_path, root.serialize_private_key_pem().as_bytes()).await?;
                FsUtils::write_atomic(&cert_path, root_pem.as_bytes()).await?;
                info!("Created certificate authority root for trust domain {}", trust_domain);
                (root, root_pem, Store::new())
            }
        };

        // Serial 1 belongs to the root
        let next_serial = store.values().map(|c| c.serial_number).max().unwrap_or(1) + 1;

        Ok(Self {
            certs_dir,
            trust_domain,
            validity,
            root,
            root_pem,
            next_serial: AtomicU64::new(next_serial),
            store: RwLock::new(store),
        })
    }

    fn build_root(trust_domain: &str) -> Result<rcgen::Certificate> {
        let now = Utc::now().trunc_subsecs(0);

        let mut params = CertificateParams::new(Vec::<String>::new());
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("{} mesh root", trust_domain));
        dn.push(DnType::OrganizationName, trust_domain.to_string());
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(1);
        params.not_before = to_offset(now)?;
        params.not_after = to_offset(now + chrono::Duration::days(ROOT_VALIDITY_DAYS))?;

        Ok(rcgen::Certificate::from_params(params)?)
    }

    /// Root certificate PEM, the trust anchor handed to proxies
    pub fn root_certificate_pem(&self) -> &str {
        &self.root_pem
    }

    /// SPIFFE URI of a service
    pub fn spiffe_id(&self, name: &str, namespace: &str) -> String {
        format!("spiffe://{}/ns/{}/sa/{}", self.trust_domain, namespace, name)
    }

    /// Issue a certificate for `name` in `namespace`, replacing any stored one
    pub async fn generate_service_certificate(&self, name: &str, namespace: &str) -> Result<Certificate> {
        check_identity("generate_service_certificate", name, namespace)?;

        let mut store = self.store.write().await;
        let cert = self.issue(name, namespace).await?;
        store.insert(cert.key(), cert.clone());

        info!(
            "Issued certificate serial={} for {}/{}",
            cert.serial_number, namespace, name
        );
        Ok(cert)
    }

    /// Issue a replacement certificate with a new serial number.
    ///
    /// The previous certificate is overwritten in the store and on disk; no
    /// revocation list is kept for it.
    pub async fn renew_certificate(&self, name: &str, namespace: &str) -> Result<Certificate> {
        check_identity("renew_certificate", name, namespace)?;

        let mut store = self.store.write().await;
        let key = (namespace.to_string(), name.to_string());
        let previous = store.get(&key).map(|c| c.serial_number).ok_or_else(|| {
            Error::NotFound(format!("renew_certificate: no certificate for {}/{}", namespace, name))
        })?;

        let cert = self.issue(name, namespace).await?;
        store.insert(key, cert.clone());

        info!(
            "Renewed certificate for {}/{}: serial {} -> {}",
            namespace, name, previous, cert.serial_number
        );
        Ok(cert)
    }

    /// Delete the stored certificate and its files
    pub async fn revoke_certificate(&self, name: &str, namespace: &str) -> Result<()> {
        check_identity("revoke_certificate", name, namespace)?;

        let mut store = self.store.write().await;
        let key = (namespace.to_string(), name.to_string());
        if store.remove(&key).is_none() {
            return Err(Error::NotFound(format!(
                "revoke_certificate: no certificate for {}/{}",
                namespace, name
            )));
        }

        FsUtils::remove_dir_all(self.service_dir(name, namespace)).await?;

        info!("Revoked certificate for {}/{}", namespace, name);
        Ok(())
    }

    /// Look up the current certificate
    pub async fn get_certificate(&self, name: &str, namespace: &str) -> Result<Certificate> {
        let store = self.store.read().await;
        store
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("get_certificate: no certificate for {}/{}", namespace, name))
            })
    }

    /// All issued certificates
    pub async fn list_certificates(&self) -> Vec<Certificate> {
        let store = self.store.read().await;
        store.values().cloned().collect()
    }

    /// Certificates whose expiry falls within `window` from now
    pub async fn expiring_within(&self, window: Duration) -> Vec<Certificate> {
        let store = self.store.read().await;
        store
            .values()
            .filter(|c| c.is_expiring_soon(window))
            .cloned()
            .collect()
    }

    /// Only called with identities that passed `check_identity`
    fn service_dir(&self, name: &str, namespace: &str) -> PathBuf {
        self.certs_dir.join(namespace).join(name)
    }

    /// Build, sign and persist one certificate. Callers hold the store lock.
    async fn issue(&self, name: &str, namespace: &str) -> Result<Certificate> {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let not_before = Utc::now().trunc_subsecs(0);
        let validity = chrono::Duration::from_std(self.validity)
            .map_err(|e| Error::Certificate(format!("validity out of range: {}", e)))?;
        let not_after = not_before + validity;

        let mut params = CertificateParams::new(vec![format!("{}.{}.svc", name, namespace)]);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("{}.{}", name, namespace));
        dn.push(DnType::OrganizationName, self.trust_domain.clone());
        params.distinguished_name = dn;
        params
            .subject_alt_names
            .push(SanType::URI(self.spiffe_id(name, namespace)));
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.serial_number = Some(serial);
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_after)?;

        let leaf = rcgen::Certificate::from_params(params)?;
        let cert_pem = leaf.serialize_pem_with_signer(&self.root)?;
        let key_pem = leaf.serialize_private_key_pem();

        let dir = self.service_dir(name, namespace);
        let cert = Certificate {
            service_name: name.to_string(),
            namespace: namespace.to_string(),
            serial_number: serial,
            not_before,
            not_after,
            cert_pem,
            key_pem,
            cert_path: dir.join(CERT_FILE),
            key_path: dir.join(KEY_FILE),
            ca_path: self.certs_dir.join(ROOT_CERT_FILE),
        };

        FsUtils::ensure_private_dir(&dir).await?;
        FsUtils::write_atomic(&cert.key_path, cert.key_pem.as_bytes()).await?;
        FsUtils::write_atomic(&cert.cert_path, cert.cert_pem.as_bytes()).await?;
        FsUtils::write_atomic(dir.join(META_FILE), &serde_json::to_vec_pretty(&cert)?).await?;

        debug!("Wrote certificate material to {}", dir.display());
        Ok(cert)
    }
}

/// Name and namespace must each stay a single directory below the store
fn check_identity(op: &str, name: &str, namespace: &str) -> Result<()> {
    for (kind, value) in [("service name", name), ("namespace", namespace)] {
        let invalid = value.is_empty()
            || value == "."
            || value == ".."
            || value.chars().any(|c| matches!(c, '/' | '\\' | ':' | '\0'))
            || Path::new(value).is_absolute();
        if invalid {
            return Err(Error::Validation(format!("{}: invalid {} {:?}", op, kind, value)));
        }
    }
    Ok(())
}

/// Rebuild the issued-certificate store from `<ns>/<name>/cert.json`
async fn load_issued(certs_dir: &Path) -> Result<Store> {
    let mut store = Store::new();

    let mut namespaces = fs::read_dir(certs_dir).await?;
    while let Some(ns_entry) = namespaces.next_entry().await? {
        if !ns_entry.file_type().await?.is_dir() {
            continue;
        }

        let mut services = fs::read_dir(ns_entry.path()).await?;
        while let Some(entry) = services.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let dir = entry.path();

            let meta = match FsUtils::read_optional(dir.join(META_FILE)).await? {
                Some(meta) => meta,
                None => continue,
            };
            let mut cert: Certificate = match serde_json::from_slice(&meta) {
                Ok(cert) => cert,
                Err(e) => {
                    warn!("Skipping unreadable certificate metadata in {}: {}", dir.display(), e);
                    continue;
                }
            };
            if check_identity("load", &cert.service_name, &cert.namespace).is_err() {
                warn!("Skipping certificate with invalid identity in {}", dir.display());
                continue;
            }
            cert.key_pem = match FsUtils::read_optional(dir.join(KEY_FILE)).await? {
                Some(key) => into_utf8(key)?,
                None => {
                    warn!("Skipping certificate without private key in {}", dir.display());
                    continue;
                }
            };
            cert.cert_path = dir.join(CERT_FILE);
            cert.key_path = dir.join(KEY_FILE);
            cert.ca_path = certs_dir.join(ROOT_CERT_FILE);

            store.insert(cert.key(), cert);
        }
    }

    Ok(store)
}

fn into_utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| Error::Certificate(format!("PEM is not UTF-8: {}", e)))
}

fn to_offset(ts: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts.timestamp())
        .map_err(|e| Error::Certificate(format!("timestamp out of range: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn authority(dir: &Path) -> CertificateAuthority {
        CertificateAuthority::new(dir, "cluster.local", Duration::from_secs(3600))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_generate_persists_pem_material() {
        let dir = tempdir().unwrap();
        let ca = authority(dir.path()).await;

        let cert = ca.generate_service_certificate("web", "shop").await.unwrap();
        assert!(cert.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(cert.key_pem.contains("PRIVATE KEY"));
        assert!(cert.is_valid());
        assert_eq!(cert.not_after - cert.not_before, chrono::Duration::hours(1));

        assert_eq!(cert.cert_path, dir.path().join("shop").join("web").join("cert.pem"));
        let on_disk = std::fs::read_to_string(&cert.cert_path).unwrap();
        assert_eq!(on_disk, cert.cert_pem);
        assert!(std::fs::read_to_string(&cert.key_path).unwrap().contains("PRIVATE KEY"));
        assert!(dir.path().join(ROOT_CERT_FILE).exists());
        assert!(ca.root_certificate_pem().starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[tokio::test]
    async fn test_serials_strictly_increase() {
        let dir = tempdir().unwrap();
        let ca = authority(dir.path()).await;

        let a = ca.generate_service_certificate("a", "default").await.unwrap();
        let b = ca.generate_service_certificate("b", "default").await.unwrap();
        let a2 = ca.renew_certificate("a", "default").await.unwrap();

        assert!(a.serial_number < b.serial_number);
        assert!(b.serial_number < a2.serial_number);
    }

    #[tokio::test]
    async fn test_concurrent_issuance_yields_unique_serials() {
        let dir = tempdir().unwrap();
        let ca = Arc::new(authority(dir.path()).await);

        let mut handles = Vec::new();
        for i in 0..8 {
            let ca = ca.clone();
            handles.push(tokio::spawn(async move {
                ca.generate_service_certificate(&format!("svc-{}", i), "default")
                    .await
                    .unwrap()
                    .serial_number
            }));
        }

        let mut serials = Vec::new();
        for h in handles {
            serials.push(h.await.unwrap());
        }
        serials.sort_unstable();
        serials.dedup();
        assert_eq!(serials.len(), 8);
    }

    #[tokio::test]
    async fn test_renew_replaces_stored_certificate() {
        let dir = tempdir().unwrap();
        let ca = authority(dir.path()).await;

        let old = ca.generate_service_certificate("web", "default").await.unwrap();
        let new = ca.renew_certificate("web", "default").await.unwrap();
        assert_ne!(old.serial_number, new.serial_number);

        let current = ca.get_certificate("web", "default").await.unwrap();
        assert_eq!(current.serial_number, new.serial_number);
        assert_eq!(std::fs::read_to_string(&new.cert_path).unwrap(), new.cert_pem);

        let err = ca.renew_certificate("missing", "default").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_revoke_removes_certificate() {
        let dir = tempdir().unwrap();
        let ca = authority(dir.path()).await;

        let cert = ca.generate_service_certificate("web", "default").await.unwrap();
        ca.revoke_certificate("web", "default").await.unwrap();

        assert!(ca.get_certificate("web", "default").await.unwrap_err().is_not_found());
        assert!(!cert.cert_path.exists());
        assert!(ca.revoke_certificate("web", "default").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_expiring_within() {
        let dir = tempdir().unwrap();
        let ca = authority(dir.path()).await;
        ca.generate_service_certificate("web", "default").await.unwrap();

        assert!(ca.expiring_within(Duration::from_secs(60)).await.is_empty());
        assert_eq!(ca.expiring_within(Duration::from_secs(2 * 3600)).await.len(), 1);
        assert_eq!(ca.list_certificates().await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_identities_outside_store() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("certs");
        let ca = authority(&store).await;
        let outside = dir.path().join("outside");

        for (name, namespace) in [
            ("", "default"),
            ("web", ""),
            ("..", "default"),
            ("web", "../outside"),
            ("a/b", "default"),
            ("web", "a\\b"),
            ("pwn", outside.to_str().unwrap()),
        ] {
            assert!(
                matches!(
                    ca.generate_service_certificate(name, namespace).await,
                    Err(Error::Validation(_))
                ),
                "{:?}/{:?} accepted",
                namespace,
                name
            );
        }
        assert!(matches!(
            ca.revoke_certificate("web", "..").await,
            Err(Error::Validation(_))
        ));
        assert!(!outside.exists());
        assert!(ca.list_certificates().await.is_empty());
    }

    #[tokio::test]
    async fn test_reopen_keeps_root_and_issued_certificates() {
        let dir = tempdir().unwrap();

        let (root_pem, issued) = {
            let ca = authority(dir.path()).await;
            let issued = ca.generate_service_certificate("web", "shop").await.unwrap();
            (ca.root_certificate_pem().to_string(), issued)
        };
        assert!(dir.path().join(ROOT_KEY_FILE).exists());

        let ca = authority(dir.path()).await;
        assert_eq!(ca.root_certificate_pem(), root_pem);

        let reloaded = ca.get_certificate("web", "shop").await.unwrap();
        assert_eq!(reloaded.serial_number, issued.serial_number);
        assert_eq!(reloaded.not_after, issued.not_after);
        assert_eq!(reloaded.cert_pem, issued.cert_pem);
        assert_eq!(reloaded.key_pem, issued.key_pem);

        let next = ca.generate_service_certificate("api", "shop").await.unwrap();
        assert!(next.serial_number > issued.serial_number);
        let renewed = ca.renew_certificate("web", "shop").await.unwrap();
        assert!(renewed.serial_number > next.serial_number);
    }

    #[tokio::test]
    async fn test_revoked_certificate_stays_gone_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let ca = authority(dir.path()).await;
            ca.generate_service_certificate("web", "default").await.unwrap();
            ca.generate_service_certificate("api", "default").await.unwrap();
            ca.revoke_certificate("web", "default").await.unwrap();
        }

        let ca = authority(dir.path()).await;
        assert!(ca.get_certificate("web", "default").await.unwrap_err().is_not_found());
        assert_eq!(ca.list_certificates().await.len(), 1);
    }
}
