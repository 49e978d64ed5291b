//! rustls certificate resolvers backed by the credential store.

use std::sync::Arc;

use rustls::SignatureScheme;
use rustls::client::ResolvesClientCert;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use crate::store::StoreInner;

/// Presents whatever client certificate the store holds at handshake time.
///
/// Installed into the store's `ClientConfig`, so an already-built client
/// config picks up rotated keypairs without being rebuilt.
pub struct ClientCertResolver {
    inner: Arc<StoreInner>,
}

impl ClientCertResolver {
    pub(crate) const fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }
}

impl std::fmt::Debug for ClientCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCertResolver")
            .field("cert", &self.inner.source.paths().cert)
            .finish()
    }
}

impl ResolvesClientCert for ClientCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.inner.client_certificate())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Server certificate frozen into one snapshot.
///
/// Each `ServerSnapshot` gets its own instance, so a snapshot never changes
/// after it has been handed out.
#[derive(Debug)]
pub struct FixedServerCert(Arc<CertifiedKey>);

impl FixedServerCert {
    pub const fn new(key: Arc<CertifiedKey>) -> Self {
        Self(key)
    }
}

impl ResolvesServerCert for FixedServerCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}
