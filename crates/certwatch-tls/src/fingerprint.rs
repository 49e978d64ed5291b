//! Content fingerprints for change detection.
//!
//! A fingerprint is only ever compared with another fingerprint of the same
//! file; it carries no identity or trust meaning.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::CredentialError;
use crate::source::read_file;

/// SHA-256 digest of a byte blob.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Read `path` and fingerprint its full contents.
    pub fn of_file(path: &Path) -> Result<Self, CredentialError> {
        read_file(path).map(|bytes| Self::of(&bytes))
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex()[..16])
    }
}

/// Fingerprints of the material an outbound connection was built from.
///
/// A slot is `None` when the connection does not use that file (plaintext
/// connections have neither, server-only TLS has no client certificate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FingerprintPair {
    pub client_cert: Option<Fingerprint>,
    pub server_ca: Option<Fingerprint>,
}

impl FingerprintPair {
    /// Fingerprint whichever of the two files are configured.
    pub fn read(
        client_cert: Option<&Path>,
        server_ca: Option<&Path>,
    ) -> Result<Self, CredentialError> {
        Ok(Self {
            client_cert: client_cert.map(Fingerprint::of_file).transpose()?,
            server_ca: server_ca.map(Fingerprint::of_file).transpose()?,
        })
    }
}
