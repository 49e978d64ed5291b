//! Immutable TLS configuration snapshots.

use std::sync::Arc;

use certwatch_core::MinTlsVersion;
use rustls::client::ResolvesClientCert;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::ClientCertVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};

use crate::error::CredentialError;
use crate::material::CredentialMaterial;
use crate::resolver::FixedServerCert;

static TLS12_AND_UP: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Static TLS options that do not come from the credential files.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub min_version: MinTlsVersion,
    /// Name a client verifies the server certificate against.
    pub server_name: Option<String>,
    /// ALPN protocols a server snapshot advertises (`h2` for gRPC).
    pub alpn_protocols: Vec<Vec<u8>>,
    /// Reject clients that present no certificate.
    pub require_client_auth: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            min_version: MinTlsVersion::default(),
            server_name: None,
            alpn_protocols: Vec::new(),
            require_client_auth: true,
        }
    }
}

impl TlsOptions {
    pub const fn protocol_versions(&self) -> &'static [&'static SupportedProtocolVersion] {
        match self.min_version {
            MinTlsVersion::Tls12 => TLS12_AND_UP,
            MinTlsVersion::Tls13 => TLS13_ONLY,
        }
    }

    pub fn server_name(&self) -> Result<Option<ServerName<'static>>, CredentialError> {
        self.server_name
            .as_deref()
            .map(|name| {
                ServerName::try_from(name.to_string()).map_err(|e| {
                    CredentialError::Verifier(format!("invalid server name {name}: {e}"))
                })
            })
            .transpose()
    }
}

/// A fully built server config plus the verifier inside it.
///
/// Shared by every handshake until the store marks it stale.
pub struct ServerSnapshot {
    config: Arc<ServerConfig>,
    client_verifier: Arc<dyn ClientCertVerifier>,
    generation: u64,
}

impl std::fmt::Debug for ServerSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSnapshot")
            .field("generation", &self.generation)
            .field("alpn", &self.config.alpn_protocols)
            .finish_non_exhaustive()
    }
}

impl ServerSnapshot {
    pub(crate) fn build(
        provider: &Arc<CryptoProvider>,
        material: &CredentialMaterial,
        options: &TlsOptions,
        generation: u64,
    ) -> Result<Self, CredentialError> {
        let verifier_builder = WebPkiClientVerifier::builder_with_provider(
            Arc::clone(&material.roots),
            Arc::clone(provider),
        );
        let verifier_builder = if options.require_client_auth {
            verifier_builder
        } else {
            verifier_builder.allow_unauthenticated()
        };
        let client_verifier = verifier_builder
            .build()
            .map_err(|e| CredentialError::Verifier(e.to_string()))?;

        let mut config = ServerConfig::builder_with_provider(Arc::clone(provider))
            .with_protocol_versions(options.protocol_versions())?
            .with_client_cert_verifier(Arc::clone(&client_verifier))
            .with_cert_resolver(Arc::new(FixedServerCert::new(Arc::clone(
                &material.certified_key,
            ))));
        config.alpn_protocols.clone_from(&options.alpn_protocols);

        Ok(Self {
            config: Arc::new(config),
            client_verifier,
            generation,
        })
    }

    pub const fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// The verifier client certificates are checked with.
    pub fn client_verifier(&self) -> &Arc<dyn ClientCertVerifier> {
        &self.client_verifier
    }

    /// Increments each time the store rebuilds its snapshot.
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

/// Build a client config trusting `roots` and presenting certificates from `resolver`.
pub(crate) fn build_client_config(
    provider: &Arc<CryptoProvider>,
    roots: Arc<RootCertStore>,
    resolver: Arc<dyn ResolvesClientCert>,
    options: &TlsOptions,
) -> Result<ClientConfig, CredentialError> {
    Ok(ClientConfig::builder_with_provider(Arc::clone(provider))
        .with_protocol_versions(options.protocol_versions())?
        .with_root_certificates(roots)
        .with_client_cert_resolver(resolver))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn protocol_versions_follow_minimum() {
        let mut options = TlsOptions::default();
        assert_eq!(options.protocol_versions().len(), 2);
        options.min_version = MinTlsVersion::Tls13;
        assert_eq!(options.protocol_versions().len(), 1);
    }

    #[test]
    fn server_name_is_validated() {
        let mut options = TlsOptions::default();
        assert!(options.server_name().unwrap().is_none());

        options.server_name = Some("controller.example.com".to_string());
        assert!(options.server_name().unwrap().is_some());

        options.server_name = Some("not a hostname!".to_string());
        assert!(options.server_name().is_err());
    }
}
