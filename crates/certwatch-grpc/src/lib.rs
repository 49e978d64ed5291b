//! `certwatch` gRPC plumbing
//!
//! - **Factory**: dials a tonic channel from credential files and probes it
//!   with a gRPC health check
//! - **Handle**: keeps one outbound connection current, rebuilding it when
//!   the client certificate or server CA changes on disk
//! - **Incoming**: a TLS accept stream for `serve_with_incoming` that takes
//!   its server config from a `CredentialStore` per connection

pub mod config;
pub mod error;
pub mod factory;
pub mod handle;
pub mod incoming;

pub use config::{ClientConfig, HandleConfig};
pub use error::ClientError;
pub use factory::{
    Connection, ConnectionFactory, GrpcConnection, GrpcConnectionFactory, WatchedFiles,
};
pub use handle::{RotatingConnectionHandle, RotationResult};
pub use incoming::{TlsConn, TlsIncoming};
