//! `certwatch` TLS credential library
//!
//! Keeps rustls client and server configurations bound to PEM files that an
//! external issuer rewrites in place.
//!
//! ## Components
//!
//! - **Source**: reads the key, certificate chain and CA bundle on demand
//! - **Fingerprint**: SHA-256 content digests for cheap change detection
//! - **Store**: owns the last good material, reconciles it on a timer and
//!   hands out client certificates and immutable server config snapshots

#[cfg(any(test, feature = "certs"))]
pub mod certs;
pub mod error;
pub mod fingerprint;
pub mod material;
pub mod resolver;
pub mod snapshot;
pub mod source;
pub mod store;

pub use error::{CredentialError, StoreError};
pub use fingerprint::{Fingerprint, FingerprintPair};
pub use material::{CredentialMaterial, default_provider};
pub use resolver::{ClientCertResolver, FixedServerCert};
pub use snapshot::{ServerSnapshot, TlsOptions};
pub use source::{CredentialPaths, CredentialSource, RawKeyPair};
pub use store::{CaUpdate, CredentialStore, ReconcileOutcome, StoreConfig};
