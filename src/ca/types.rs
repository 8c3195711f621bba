use std::path::PathBuf;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Certificate issued to one service in one namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    /// Service name
    pub service_name: String,
    /// Namespace
    pub namespace: String,
    /// Serial number, strictly increasing within one authority
    pub serial_number: u64,
    /// Start of the validity window
    pub not_before: DateTime<Utc>,
    /// End of the validity window
    pub not_after: DateTime<Utc>,
    /// Certificate PEM
    pub cert_pem: String,
    /// Private key PEM
    #[serde(skip)]
    pub key_pem: String,
    /// Where the certificate PEM is stored
    pub cert_path: PathBuf,
    /// Where the private key PEM is stored
    pub key_path: PathBuf,
    /// Where the issuing root certificate is stored
    pub ca_path: PathBuf,
}

impl Certificate {
    /// Whether the current time lies within the validity window
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Whether the certificate expires within `window` from now
    pub fn is_expiring_soon(&self, window: Duration) -> bool {
        self.is_expiring_soon_at(Utc::now(), window)
    }

    pub fn is_expiring_soon_at(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match chrono::Duration::from_std(window) {
            Ok(window) => self.not_after - now <= window,
            // A window beyond chrono's range covers every expiry date
            Err(_) => true,
        }
    }

    /// Store key of the certificate
    pub fn key(&self) -> (String, String) {
        (self.namespace.clone(), self.service_name.clone())
    }
}
