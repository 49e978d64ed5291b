//! End-to-end rotation over real mutual TLS: a tonic health server fed by a
//! server-mode credential store, and a rotating client handle.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;
use std::sync::Arc;

use certwatch_core::CredentialMode;
use certwatch_grpc::{
    ClientConfig, GrpcConnectionFactory, HandleConfig, RotatingConnectionHandle, RotationResult,
    TlsIncoming,
};
use certwatch_tls::certs::{
    DevBundle, DevPaths, generate_ca, generate_client_cert, generate_dev_bundle,
    generate_server_cert, write_dev_bundle, write_leaf,
};
use certwatch_tls::{CaUpdate, CredentialStore, StoreConfig, TlsOptions};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic_health::pb::HealthCheckRequest;

struct Server {
    addr: SocketAddr,
    store: Arc<CredentialStore>,
    cancel: CancellationToken,
}

async fn start_server(paths: &DevPaths) -> Server {
    let options = TlsOptions {
        alpn_protocols: vec![b"h2".to_vec()],
        ..TlsOptions::default()
    };
    let store = Arc::new(
        CredentialStore::open(
            StoreConfig::new(paths.server.clone(), CredentialMode::Server).with_options(options),
        )
        .unwrap(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let incoming = TlsIncoming::spawn(listener, Arc::clone(&store), cancel.clone());

    let (_reporter, health) = tonic_health::server::health_reporter();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(health)
            .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
            .await
            .unwrap();
    });

    Server {
        addr,
        store,
        cancel,
    }
}

fn client_config(addr: SocketAddr, paths: &DevPaths) -> ClientConfig {
    let mut config = ClientConfig::mutual_tls(
        format!("https://{addr}"),
        &paths.client.ca,
        &paths.client.cert,
        &paths.client.key,
    );
    config.server_name = Some("localhost".into());
    config
}

#[tokio::test]
async fn client_and_server_rotate_without_restart() {
    let dir = tempfile::tempdir().unwrap();
    let ca = generate_ca("certwatch Test").unwrap();
    let bundle = DevBundle {
        ca_cert_pem: ca.ca_cert_pem.clone(),
        server: generate_server_cert(&ca, &["localhost"]).unwrap(),
        client: generate_client_cert(&ca, "site-agent").unwrap(),
    };
    let paths = write_dev_bundle(dir.path(), &bundle).unwrap();

    let server = start_server(&paths).await;
    let factory = GrpcConnectionFactory::new(client_config(server.addr, &paths)).unwrap();
    let handle = RotatingConnectionHandle::new(factory, HandleConfig::default())
        .await
        .unwrap();
    let first = handle.connection();
    assert_eq!(handle.version(), 0);

    // Nothing changed on disk.
    assert_eq!(handle.check_and_reload().await, RotationResult::NotNeeded);

    // A -> B: a renewed client certificate from the same CA.
    write_leaf(&paths.client, &generate_client_cert(&ca, "site-agent").unwrap()).unwrap();
    assert_eq!(
        handle.check_and_reload().await,
        RotationResult::Rotated { version: 1 }
    );
    let second = handle.connection();
    assert!(!Arc::ptr_eq(&first, &second));

    // C -> C2: the whole deployment moves to a new CA. The server side
    // rotates first, then the client picks up its new files.
    let c2 = generate_ca("certwatch Rotated").unwrap();
    write_leaf(&paths.server, &generate_server_cert(&c2, &["localhost"]).unwrap()).unwrap();
    std::fs::write(&paths.server.ca, &c2.ca_cert_pem).unwrap();

    let outcome = server.store.reconcile().unwrap();
    assert!(outcome.keypair_rotated);
    assert_eq!(outcome.ca, CaUpdate::Rotated);

    write_leaf(&paths.client, &generate_client_cert(&c2, "site-agent").unwrap()).unwrap();
    assert_eq!(
        handle.check_and_reload().await,
        RotationResult::Rotated { version: 2 }
    );

    let third = handle.connection();
    assert!(!Arc::ptr_eq(&second, &third));
    third
        .health_client()
        .unwrap()
        .check(HealthCheckRequest {
            service: String::new(),
        })
        .await
        .unwrap();

    // Superseded connections stay usable until their grace delay ends.
    assert!(!first.is_closed());
    assert!(!second.is_closed());

    handle.shutdown().await;
    assert!(first.is_closed());
    assert!(second.is_closed());
    server.cancel.cancel();
}

#[tokio::test]
async fn server_rejects_client_from_retired_ca() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = generate_dev_bundle(&["localhost"], "site-agent").unwrap();
    let paths = write_dev_bundle(dir.path(), &bundle).unwrap();
    let server = start_server(&paths).await;

    // Keep a copy of the original client material elsewhere.
    let stale_dir = tempfile::tempdir().unwrap();
    let stale = write_dev_bundle(stale_dir.path(), &bundle).unwrap();

    let c2 = generate_ca("certwatch Rotated").unwrap();
    write_leaf(&paths.server, &generate_server_cert(&c2, &["localhost"]).unwrap()).unwrap();
    std::fs::write(&paths.server.ca, &c2.ca_cert_pem).unwrap();
    server.store.reconcile().unwrap();

    // Trusts C2 for the server but still presents a certificate from C.
    std::fs::write(&stale.client.ca, &c2.ca_cert_pem).unwrap();
    let factory = GrpcConnectionFactory::new(client_config(server.addr, &stale)).unwrap();
    assert!(
        RotatingConnectionHandle::new(factory, HandleConfig::default())
            .await
            .is_err()
    );

    server.cancel.cancel();
}

#[tokio::test]
async fn failed_rebuild_keeps_serving_old_connection() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = generate_dev_bundle(&["localhost"], "site-agent").unwrap();
    let paths = write_dev_bundle(dir.path(), &bundle).unwrap();
    let server = start_server(&paths).await;

    let factory = GrpcConnectionFactory::new(client_config(server.addr, &paths)).unwrap();
    let handle = RotatingConnectionHandle::new(factory, HandleConfig::default())
        .await
        .unwrap();
    let first = handle.connection();

    // A client certificate from a CA the server does not trust.
    let rogue = generate_ca("rogue").unwrap();
    write_leaf(&paths.client, &generate_client_cert(&rogue, "site-agent").unwrap()).unwrap();

    assert!(matches!(
        handle.check_and_reload().await,
        RotationResult::Failed(_)
    ));
    assert!(Arc::ptr_eq(&first, &handle.connection()));
    first
        .health_client()
        .unwrap()
        .check(HealthCheckRequest {
            service: String::new(),
        })
        .await
        .unwrap();

    handle.close();
    server.cancel.cancel();
}
