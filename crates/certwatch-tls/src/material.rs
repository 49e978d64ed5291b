//! Parsing raw PEM bytes into rustls material.

use std::path::Path;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::CredentialError;
use crate::source::{CredentialSource, RawKeyPair};

/// The crypto provider every config built by this crate uses.
pub fn default_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Parsed credential material together with the bytes it came from.
///
/// The raw bytes are kept for byte-for-byte comparison on the next
/// reconcile tick. The certified key always holds a certificate and key
/// that were read, parsed and checked together.
pub struct CredentialMaterial {
    pub(crate) certified_key: Arc<CertifiedKey>,
    pub(crate) cert_pem: Vec<u8>,
    pub(crate) key_pem: Zeroizing<Vec<u8>>,
    pub(crate) roots: Arc<RootCertStore>,
    pub(crate) ca_pem: Vec<u8>,
}

impl std::fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialMaterial")
            .field("chain_len", &self.certified_key.cert.len())
            .field("roots", &self.roots.len())
            .finish_non_exhaustive()
    }
}

impl CredentialMaterial {
    /// Read and parse everything the source points at.
    pub fn load(
        source: &CredentialSource,
        provider: &CryptoProvider,
    ) -> Result<Self, CredentialError> {
        let paths = source.paths();
        let ca_pem = source.read_ca()?;
        let roots = parse_roots(&ca_pem, &paths.ca)?;
        let raw = source.read_keypair()?;
        let certified_key = parse_certified_key(provider, &raw, &paths.cert, &paths.key)?;

        Ok(Self {
            certified_key,
            cert_pem: raw.cert_pem,
            key_pem: raw.key_pem,
            roots,
            ca_pem,
        })
    }

    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified_key
    }

    pub fn roots(&self) -> &Arc<RootCertStore> {
        &self.roots
    }

    pub fn ca_pem(&self) -> &[u8] {
        &self.ca_pem
    }

    /// Whether `raw` differs from the keypair this material was built from.
    pub(crate) fn keypair_differs(&self, raw: &RawKeyPair) -> bool {
        self.cert_pem != raw.cert_pem || *self.key_pem != *raw.key_pem
    }
}

/// Parse every certificate in a PEM blob.
pub fn parse_certs(
    pem: &[u8],
    path: &Path,
) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CredentialError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(CredentialError::Parse {
            path: path.to_path_buf(),
            reason: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

/// Build a root store from a CA bundle.
pub fn parse_roots(ca_pem: &[u8], path: &Path) -> Result<Arc<RootCertStore>, CredentialError> {
    let certs = parse_certs(ca_pem, path)?;
    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(certs);
    debug!(path = %path.display(), added, ignored, "Loaded CA bundle");

    if store.is_empty() {
        return Err(CredentialError::Parse {
            path: path.to_path_buf(),
            reason: "no usable CA certificates".to_string(),
        });
    }
    Ok(Arc::new(store))
}

/// Parse a certificate chain and private key into a checked `CertifiedKey`.
///
/// Fails with `KeyMismatch` when the key does not belong to the leaf, which
/// is what a reader sees if it races an issuer that has written the new
/// certificate but not yet the new key.
pub fn parse_certified_key(
    provider: &CryptoProvider,
    raw: &RawKeyPair,
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<CertifiedKey>, CredentialError> {
    let chain = parse_certs(&raw.cert_pem, cert_path)?;

    let key = rustls_pemfile::private_key(&mut &raw.key_pem[..])
        .map_err(|e| CredentialError::Parse {
            path: key_path.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| CredentialError::NoPrivateKey(key_path.to_path_buf()))?;

    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|e| CredentialError::Parse {
            path: key_path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let certified = CertifiedKey::new(chain, signing_key);
    match certified.keys_match() {
        Ok(()) | Err(rustls::Error::InconsistentKeys(rustls::InconsistentKeys::Unknown)) => {}
        Err(_) => {
            return Err(CredentialError::KeyMismatch {
                cert: cert_path.to_path_buf(),
                key: key_path.to_path_buf(),
            });
        }
    }
    Ok(Arc::new(certified))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::certs::{generate_ca, generate_server_cert};

    fn raw(cert_pem: &str, key_pem: &str) -> RawKeyPair {
        RawKeyPair {
            cert_pem: cert_pem.as_bytes().to_vec(),
            key_pem: Zeroizing::new(key_pem.as_bytes().to_vec()),
        }
    }

    #[test]
    fn parses_matching_pair() {
        let ca = generate_ca("Material Test").unwrap();
        let leaf = generate_server_cert(&ca, &["localhost"]).unwrap();

        let key = parse_certified_key(
            &default_provider(),
            &raw(&leaf.cert_pem, &leaf.key_pem),
            Path::new("leaf.pem"),
            Path::new("leaf-key.pem"),
        )
        .unwrap();
        assert_eq!(key.cert.len(), 1);
    }

    #[test]
    fn rejects_key_from_another_pair() {
        let ca = generate_ca("Material Test").unwrap();
        let a = generate_server_cert(&ca, &["localhost"]).unwrap();
        let b = generate_server_cert(&ca, &["localhost"]).unwrap();

        let err = parse_certified_key(
            &default_provider(),
            &raw(&a.cert_pem, &b.key_pem),
            Path::new("a.pem"),
            Path::new("b-key.pem"),
        )
        .unwrap_err();
        assert!(matches!(err, CredentialError::KeyMismatch { .. }), "{err}");
    }

    #[test]
    fn missing_key_block_is_reported() {
        let ca = generate_ca("Material Test").unwrap();
        let leaf = generate_server_cert(&ca, &["localhost"]).unwrap();

        let err = parse_certified_key(
            &default_provider(),
            &raw(&leaf.cert_pem, &leaf.cert_pem),
            Path::new("leaf.pem"),
            Path::new("leaf-key.pem"),
        )
        .unwrap_err();
        assert!(matches!(err, CredentialError::NoPrivateKey(_)), "{err}");
    }

    #[test]
    fn garbage_ca_is_a_parse_error() {
        let err = parse_roots(b"not a pem file", Path::new("ca.pem")).unwrap_err();
        assert!(matches!(err, CredentialError::Parse { .. }));
    }

    #[test]
    fn ca_bundle_builds_root_store() {
        let ca = generate_ca("Material Test").unwrap();
        let roots = parse_roots(ca.ca_cert_pem.as_bytes(), Path::new("ca.pem")).unwrap();
        assert_eq!(roots.len(), 1);
    }
}
