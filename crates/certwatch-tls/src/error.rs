//! Credential and store error types.

use std::path::PathBuf;

/// Errors reading or parsing credential material.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid PEM in {}: {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },

    #[error("No private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("Private key {} does not match certificate {}", .key.display(), .cert.display())]
    KeyMismatch { cert: PathBuf, key: PathBuf },

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Client verifier error: {0}")]
    Verifier(String),
}

/// Errors surfaced by the credential store.
///
/// Only `Configuration` and `InvalidSettings` abort startup. `TransientRead`
/// is what a failed reconcile tick reports; the store keeps serving the last
/// good material when it happens.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid credential configuration: {0}")]
    Configuration(#[source] CredentialError),

    #[error("Invalid store settings: {0}")]
    InvalidSettings(String),

    #[error("Credential refresh failed: {0}")]
    TransientRead(#[source] CredentialError),

    #[error("Failed to build server config: {0}")]
    Snapshot(#[source] CredentialError),
}
