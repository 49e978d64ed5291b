//! Building outbound connections from credentials on disk.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use certwatch_core::SecureMode;
use certwatch_tls::material::parse_certified_key;
use certwatch_tls::source::read_file;
use certwatch_tls::{RawKeyPair, default_provider};
use parking_lot::Mutex;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic_health::pb::HealthCheckRequest;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, error_chain};

/// An outbound connection that can be shut down explicitly.
pub trait Connection: Send + Sync + 'static {
    /// Release the connection. Calls already in flight may finish; new ones fail.
    fn close(&self);
}

/// The credential files a factory reads when it builds a connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchedFiles<'a> {
    pub client_cert: Option<&'a Path>,
    pub server_ca: Option<&'a Path>,
}

/// Builds connections to one remote endpoint.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Connection;

    /// Read the current credentials, dial, and check the endpoint is reachable.
    fn connect(&self) -> impl Future<Output = Result<Self::Connection, ClientError>> + Send;

    /// Files whose content change should trigger a rebuild.
    fn watched_files(&self) -> WatchedFiles<'_>;
}

/// A tonic channel that has passed a health probe.
pub struct GrpcConnection {
    address: String,
    channel: Mutex<Option<Channel>>,
}

impl std::fmt::Debug for GrpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcConnection")
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl GrpcConnection {
    pub const fn new(address: String, channel: Channel) -> Self {
        Self {
            address,
            channel: Mutex::new(Some(channel)),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// A handle to the underlying channel for building service clients.
    pub fn channel(&self) -> Result<Channel, ClientError> {
        self.channel.lock().clone().ok_or(ClientError::Closed)
    }

    pub fn health_client(&self) -> Result<HealthClient<Channel>, ClientError> {
        self.channel().map(HealthClient::new)
    }

    pub fn is_closed(&self) -> bool {
        self.channel.lock().is_none()
    }
}

impl Connection for GrpcConnection {
    fn close(&self) {
        if self.channel.lock().take().is_some() {
            info!(address = %self.address, "Closed gRPC connection");
        }
    }
}

/// Dials gRPC connections according to a [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct GrpcConnectionFactory {
    config: ClientConfig,
}

impl GrpcConnectionFactory {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn endpoint(&self) -> Result<Endpoint, ClientError> {
        let endpoint = Channel::from_shared(self.config.address.clone())
            .map_err(|e| ClientError::InvalidConfig(format!("invalid address: {e}")))?
            .connect_timeout(self.config.connect_timeout);

        match self.tls_config()? {
            Some(tls) => endpoint
                .tls_config(tls)
                .map_err(|e| ClientError::Connect(format!("{e}: {}", error_chain(&e)))),
            None => Ok(endpoint),
        }
    }

    /// Read the credential files into a tonic TLS config.
    fn tls_config(&self) -> Result<Option<ClientTlsConfig>, ClientError> {
        if self.config.secure == SecureMode::Insecure {
            return Ok(None);
        }

        let ca_path = required(self.config.server_ca_path.as_deref(), "server CA")?;
        let ca_pem = read_file(ca_path)?;
        let mut tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca_pem));

        if self.config.secure == SecureMode::MutualTls {
            let cert_path = required(self.config.client_cert_path.as_deref(), "client cert")?;
            let key_path = required(self.config.client_key_path.as_deref(), "client key")?;
            let raw = RawKeyPair {
                cert_pem: read_file(cert_path)?,
                key_pem: read_file(key_path)?.into(),
            };
            // Reject a half-written pair before it reaches the handshake.
            parse_certified_key(&default_provider(), &raw, cert_path, key_path)?;
            tls = tls.identity(Identity::from_pem(&raw.cert_pem, &*raw.key_pem));
        }

        if let Some(name) = &self.config.server_name {
            tls = tls.domain_name(name.clone());
        }
        Ok(Some(tls))
    }
}

fn required<'a>(path: Option<&'a Path>, what: &str) -> Result<&'a Path, ClientError> {
    path.ok_or_else(|| ClientError::InvalidConfig(format!("{what} path is not configured")))
}

impl ConnectionFactory for GrpcConnectionFactory {
    type Connection = GrpcConnection;

    async fn connect(&self) -> Result<GrpcConnection, ClientError> {
        let endpoint = self.endpoint()?;
        let channel = endpoint.connect().await.map_err(|e| {
            debug!(error = ?e, "connection error details");
            ClientError::Connect(format!("{e}: {}", error_chain(&e)))
        })?;

        probe(channel.clone(), self.config.probe_timeout).await?;

        info!(
            address = %self.config.address,
            secure = ?self.config.secure,
            "gRPC connection established"
        );
        Ok(GrpcConnection::new(self.config.address.clone(), channel))
    }

    fn watched_files(&self) -> WatchedFiles<'_> {
        match self.config.secure {
            SecureMode::Insecure => WatchedFiles::default(),
            SecureMode::ServerTls => WatchedFiles {
                client_cert: None,
                server_ca: self.config.server_ca_path.as_deref(),
            },
            SecureMode::MutualTls => WatchedFiles {
                client_cert: self.config.client_cert_path.as_deref(),
                server_ca: self.config.server_ca_path.as_deref(),
            },
        }
    }
}

/// Issue a health check and fail if no answer arrives within `deadline`.
///
/// Any answer proves the endpoint is reachable with these credentials; a
/// status other than `SERVING` is only logged.
pub async fn probe(channel: Channel, deadline: Duration) -> Result<(), ClientError> {
    let mut client = HealthClient::new(channel);
    let request = HealthCheckRequest {
        service: String::new(),
    };

    let response = tokio::time::timeout(deadline, client.check(request))
        .await
        .map_err(|_| ClientError::Probe(format!("no answer within {deadline:?}")))?
        .map_err(|status| ClientError::Probe(status.to_string()))?;

    let status = response.into_inner().status();
    if status != ServingStatus::Serving {
        warn!(status = ?status, "Remote endpoint reachable but not serving");
    }
    Ok(())
}
