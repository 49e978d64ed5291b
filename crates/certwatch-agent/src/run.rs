//! `run`: the long-lived agent process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use certwatch_core::config::{Config, load_config};
use certwatch_core::{CredentialMode, SecureMode};
use certwatch_grpc::{
    ClientConfig, GrpcConnectionFactory, HandleConfig, RotatingConnectionHandle, TlsIncoming,
};
use certwatch_tls::{CredentialStore, StoreConfig};

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Settings file (JSON). Defaults to the per-user settings file if present.
    #[arg(long, env = "CERTWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// TCP bind address for the health server
    #[arg(long, default_value = "127.0.0.1:50443", env = "CERTWATCH_ADDR")]
    addr: SocketAddr,

    /// Server certificate chain (PEM)
    #[arg(long, env = "CERTWATCH_SERVER_CERT")]
    cert: Option<PathBuf>,

    /// Server private key (PEM)
    #[arg(long, env = "CERTWATCH_SERVER_KEY")]
    key: Option<PathBuf>,

    /// CA bundle client certificates are verified against (PEM)
    #[arg(long, env = "CERTWATCH_CA")]
    ca: Option<PathBuf>,

    /// Upstream endpoint to keep a rotating connection to (e.g. "<https://controller:443>")
    #[arg(long, env = "CERTWATCH_UPSTREAM")]
    upstream: Option<String>,

    /// Client certificate for the upstream connection (PEM)
    #[arg(long, env = "CERTWATCH_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Client private key for the upstream connection (PEM)
    #[arg(long, env = "CERTWATCH_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// CA bundle the upstream server certificate is verified against (PEM)
    #[arg(long, env = "CERTWATCH_UPSTREAM_CA")]
    upstream_ca: Option<PathBuf>,

    /// Use plaintext for the upstream connection (development only)
    #[arg(long)]
    upstream_insecure: bool,
}

impl RunArgs {
    /// CLI flags take precedence over the settings file and environment.
    fn apply(&self, config: &mut Config) {
        let store = &mut config.store;
        store.mode = CredentialMode::Server;
        override_with(&mut store.cert_path, self.cert.as_ref());
        override_with(&mut store.key_path, self.key.as_ref());
        override_with(&mut store.ca_path, self.ca.as_ref());

        let client = &mut config.client;
        override_with(&mut client.address, self.upstream.as_ref());
        override_with(&mut client.client_cert_path, self.client_cert.as_ref());
        override_with(&mut client.client_key_path, self.client_key.as_ref());
        override_with(&mut client.server_ca_path, self.upstream_ca.as_ref());
        if self.upstream_insecure {
            client.secure = SecureMode::Insecure;
        }
    }
}

fn override_with<T: Clone>(slot: &mut Option<T>, value: Option<&T>) {
    if let Some(value) = value {
        *slot = Some(value.clone());
    }
}

pub async fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref()).context("Failed to load settings")?;
    args.apply(&mut config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        upstream = config.client.address.is_some(),
        "Starting certwatch-agent"
    );

    let mut store_config =
        StoreConfig::from_settings(&config.store).context("Invalid store settings")?;
    store_config.options.alpn_protocols = vec![b"h2".to_vec()];
    let store = Arc::new(
        CredentialStore::start(store_config).context("Failed to load server credentials")?,
    );

    let cancel = CancellationToken::new();

    let listener = TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("Failed to bind {}", args.addr))?;
    let incoming = TlsIncoming::spawn(listener, Arc::clone(&store), cancel.clone());

    let (_health_reporter, health_service) = tonic_health::server::health_reporter();
    let server_shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(health_service)
            .serve_with_incoming_shutdown(incoming, server_shutdown.cancelled_owned())
            .await
    });

    let upstream = match &config.client.address {
        Some(_) => {
            let client_config =
                ClientConfig::from_settings(&config.client).context("Invalid client settings")?;
            let handle_config =
                HandleConfig::from_settings(&config.rotation).context("Invalid rotation settings")?;
            let factory = GrpcConnectionFactory::new(client_config)?;
            let handle = Arc::new(
                RotatingConnectionHandle::new(factory, handle_config)
                    .await
                    .context("Failed to connect to upstream")?,
            );
            handle.spawn_reload_loop();
            Some(handle)
        }
        None => None,
    };

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!(addr = %args.addr, "Health server ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    cancel.cancel();
    if let Some(handle) = upstream {
        handle.shutdown().await;
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Health server exited with error"),
        Err(e) => warn!(error = %e, "Health server task failed"),
    }
    store.shutdown().await;

    info!("Agent stopped");
    Ok(())
}
