//! On-demand reads of the credential files.
//!
//! Nothing here is cached: every call goes to the filesystem, because the
//! files are rewritten in place by whatever issues the certificates.

use std::path::{Path, PathBuf};

use zeroize::Zeroizing;

use crate::error::CredentialError;

/// The three PEM files a credential store is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPaths {
    /// PEM private key (PKCS#8, PKCS#1 or SEC1).
    pub key: PathBuf,
    /// PEM leaf certificate, optionally followed by intermediates.
    pub cert: PathBuf,
    /// PEM CA bundle.
    pub ca: PathBuf,
}

impl CredentialPaths {
    pub fn new(
        key: impl Into<PathBuf>,
        cert: impl Into<PathBuf>,
        ca: impl Into<PathBuf>,
    ) -> Self {
        Self {
            key: key.into(),
            cert: cert.into(),
            ca: ca.into(),
        }
    }

    /// Conventional file names inside a single directory.
    pub fn in_dir(dir: &Path, cert_name: &str) -> Self {
        Self::new(
            dir.join(format!("{cert_name}-key.pem")),
            dir.join(format!("{cert_name}.pem")),
            dir.join("ca.pem"),
        )
    }
}

/// Raw certificate and key bytes, read together.
pub struct RawKeyPair {
    pub cert_pem: Vec<u8>,
    pub key_pem: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for RawKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawKeyPair")
            .field("cert_len", &self.cert_pem.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Reads raw credential bytes from the configured paths.
#[derive(Debug, Clone)]
pub struct CredentialSource {
    paths: CredentialPaths,
}

impl CredentialSource {
    pub const fn new(paths: CredentialPaths) -> Self {
        Self { paths }
    }

    pub const fn paths(&self) -> &CredentialPaths {
        &self.paths
    }

    /// Read the CA bundle.
    pub fn read_ca(&self) -> Result<Vec<u8>, CredentialError> {
        read_file(&self.paths.ca)
    }

    /// Read the certificate and key files back to back.
    pub fn read_keypair(&self) -> Result<RawKeyPair, CredentialError> {
        let cert_pem = read_file(&self.paths.cert)?;
        let key_pem = Zeroizing::new(read_file(&self.paths.key)?);
        Ok(RawKeyPair { cert_pem, key_pem })
    }
}

/// Read a whole file, tagging failures with the path.
pub fn read_file(path: &Path) -> Result<Vec<u8>, CredentialError> {
    std::fs::read(path).map_err(|source| CredentialError::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn reads_current_file_contents_every_time() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CredentialPaths::in_dir(dir.path(), "client");
        std::fs::write(&paths.ca, b"first").unwrap();

        let source = CredentialSource::new(paths.clone());
        assert_eq!(source.read_ca().unwrap(), b"first");

        std::fs::write(&paths.ca, b"second").unwrap();
        assert_eq!(source.read_ca().unwrap(), b"second");
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CredentialPaths::in_dir(dir.path(), "client");
        let source = CredentialSource::new(paths.clone());

        match source.read_keypair() {
            Err(CredentialError::Read { path, .. }) => assert_eq!(path, paths.cert),
            other => panic!("expected read error, got {other:?}"),
        }
    }

    #[test]
    fn in_dir_uses_conventional_names() {
        let paths = CredentialPaths::in_dir(Path::new("/certs"), "server");
        assert_eq!(paths.cert, Path::new("/certs/server.pem"));
        assert_eq!(paths.key, Path::new("/certs/server-key.pem"));
        assert_eq!(paths.ca, Path::new("/certs/ca.pem"));
    }
}
