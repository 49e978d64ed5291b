//! Development certificate generation using rcgen.
//!
//! Mints a self-signed CA plus server and client leaves for local
//! development and tests. NOT suitable for production use.
//!
//! Requires the `certs` feature to be enabled.

use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use tracing::info;

use crate::source::CredentialPaths;

/// CA material for signing leaves.
pub struct CaBundle {
    /// CA certificate parameters (needed for signing).
    pub params: CertificateParams,
    /// CA key pair.
    pub key_pair: KeyPair,
    /// PEM-encoded CA certificate.
    pub ca_cert_pem: String,
}

/// PEM-encoded leaf certificate and its private key.
pub struct LeafBundle {
    pub cert_pem: String,
    pub key_pem: String,
}

/// A CA with one server and one client leaf.
pub struct DevBundle {
    pub ca_cert_pem: String,
    pub server: LeafBundle,
    pub client: LeafBundle,
}

/// Certificate generation errors.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("Certificate generation error: {0}")]
    Generation(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Generate a self-signed CA.
pub fn generate_ca(org_name: &str) -> Result<CaBundle, CertError> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{org_name} CA"));
    params
        .distinguished_name
        .push(DnType::OrganizationName, org_name);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);

    let key_pair = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let ca_cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(CaBundle {
        ca_cert_pem: ca_cert.pem(),
        params,
        key_pair,
    })
}

/// Generate a server certificate for `server_names`, signed by `ca`.
pub fn generate_server_cert(ca: &CaBundle, server_names: &[&str]) -> Result<LeafBundle, CertError> {
    let params = CertificateParams::new(
        server_names
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
    )
    .map_err(|e| CertError::Generation(e.to_string()))?;

    sign_leaf(ca, params, "certwatch server", ExtendedKeyUsagePurpose::ServerAuth)
}

/// Generate a client certificate with `client_id` as its Common Name, signed by `ca`.
pub fn generate_client_cert(ca: &CaBundle, client_id: &str) -> Result<LeafBundle, CertError> {
    sign_leaf(
        ca,
        CertificateParams::default(),
        client_id,
        ExtendedKeyUsagePurpose::ClientAuth,
    )
}

fn sign_leaf(
    ca: &CaBundle,
    mut params: CertificateParams,
    common_name: &str,
    usage: ExtendedKeyUsagePurpose,
) -> Result<LeafBundle, CertError> {
    let issuer = Issuer::from_params(&ca.params, &ca.key_pair);

    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params.extended_key_usages.push(usage);

    let key = KeyPair::generate().map_err(|e| CertError::Generation(e.to_string()))?;
    let cert = params
        .signed_by(&key, &issuer)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    Ok(LeafBundle {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Generate a CA, a server leaf for `server_names` and a client leaf for `client_id`.
pub fn generate_dev_bundle(server_names: &[&str], client_id: &str) -> Result<DevBundle, CertError> {
    let ca = generate_ca("certwatch Dev")?;
    let server = generate_server_cert(&ca, server_names)?;
    let client = generate_client_cert(&ca, client_id)?;

    Ok(DevBundle {
        ca_cert_pem: ca.ca_cert_pem,
        server,
        client,
    })
}

/// Paths written by [`write_dev_bundle`].
#[derive(Debug, Clone)]
pub struct DevPaths {
    pub server: CredentialPaths,
    pub client: CredentialPaths,
}

/// Write a dev bundle to `dir` as `ca.pem`, `server.pem`, `server-key.pem`,
/// `client.pem` and `client-key.pem`.
pub fn write_dev_bundle(dir: &Path, bundle: &DevBundle) -> Result<DevPaths, CertError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| CertError::Io(format!("Failed to create cert dir: {e}")))?;

    let server = CredentialPaths::in_dir(dir, "server");
    let client = CredentialPaths::in_dir(dir, "client");

    write_pem(&server.ca, &bundle.ca_cert_pem)?;
    write_leaf(&server, &bundle.server)?;
    write_leaf(&client, &bundle.client)?;

    info!(dir = %dir.display(), "Dev certificates written");

    Ok(DevPaths { server, client })
}

/// Overwrite the cert and key files of `paths` with `leaf`.
pub fn write_leaf(paths: &CredentialPaths, leaf: &LeafBundle) -> Result<(), CertError> {
    write_pem(&paths.cert, &leaf.cert_pem)?;
    write_pem(&paths.key, &leaf.key_pem)?;
    #[cfg(unix)]
    restrict_key_permissions(&paths.key)?;
    Ok(())
}

fn write_pem(path: &Path, pem: &str) -> Result<(), CertError> {
    std::fs::write(path, pem)
        .map_err(|e| CertError::Io(format!("Failed to write {}: {e}", path.display())))
}

#[cfg(unix)]
fn restrict_key_permissions(path: &Path) -> Result<(), CertError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|e| {
        CertError::Io(format!("Failed to restrict permissions on {}: {e}", path.display()))
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn generate_ca_produces_valid_pem() {
        let ca = generate_ca("certwatch Test").unwrap();
        assert!(ca.ca_cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.ca_cert_pem.contains("END CERTIFICATE"));
    }

    #[test]
    fn leaves_differ_and_have_keys() {
        let ca = generate_ca("certwatch Test").unwrap();
        let server = generate_server_cert(&ca, &["localhost", "127.0.0.1"]).unwrap();
        let client = generate_client_cert(&ca, "site-agent-1").unwrap();

        assert!(server.key_pem.contains("BEGIN PRIVATE KEY"));
        assert!(client.key_pem.contains("BEGIN PRIVATE KEY"));
        assert_ne!(server.cert_pem, client.cert_pem);
        assert_ne!(server.cert_pem, ca.ca_cert_pem);
    }

    #[test]
    fn write_dev_bundle_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = generate_dev_bundle(&["localhost"], "dev-client").unwrap();
        let paths = write_dev_bundle(dir.path(), &bundle).unwrap();

        for path in [
            &paths.server.ca,
            &paths.server.cert,
            &paths.server.key,
            &paths.client.cert,
            &paths.client.key,
        ] {
            assert!(path.exists(), "{} missing", path.display());
        }
        assert_eq!(paths.server.ca, paths.client.ca);
    }

    #[cfg(unix)]
    #[test]
    fn written_keys_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bundle = generate_dev_bundle(&["localhost"], "dev-client").unwrap();
        let paths = write_dev_bundle(dir.path(), &bundle).unwrap();

        let mode = std::fs::metadata(&paths.client.key)
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }
}
