//! Outbound connection error types.

use certwatch_tls::CredentialError;

/// Errors building or using an outbound connection.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),

    #[error("Credential error: {0}")]
    Credentials(#[from] CredentialError),

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Health probe failed: {0}")]
    Probe(String),

    #[error("Connection is closed")]
    Closed,
}

/// Walk the `source()` chain of an error and join into a single string.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(e) = current {
        chain.push(e.to_string());
        current = e.source();
    }
    if chain.is_empty() {
        String::from("(no further details)")
    } else {
        chain.join(" -> ")
    }
}
