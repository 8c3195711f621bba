pub mod authority;
pub mod types;

pub use authority::CertificateAuthority;
pub use types::Certificate;
