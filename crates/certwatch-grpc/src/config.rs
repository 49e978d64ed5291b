//! Outbound connection configuration.

use std::path::PathBuf;
use std::time::Duration;

use certwatch_core::{ClientSettings, RotationSettings, SecureMode};

use crate::error::ClientError;

/// Default period between credential checks for a rotating handle.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Default wait before a superseded connection is closed.
pub const DEFAULT_GRACE_DELAY: Duration = Duration::from_secs(10);

/// Deadline for the health probe issued after every dial.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to dial one remote endpoint.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Endpoint URI (e.g., "https://controller.example.com:443").
    pub address: String,

    pub secure: SecureMode,

    /// CA bundle the server certificate is verified against.
    /// Required unless `secure` is `Insecure`.
    pub server_ca_path: Option<PathBuf>,

    /// Client certificate and key. Required for `MutualTls`.
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,

    /// Overrides the name the server certificate must be valid for.
    pub server_name: Option<String>,

    pub connect_timeout: Duration,
    pub probe_timeout: Duration,
}

impl ClientConfig {
    /// Create a plaintext config with default timeouts.
    pub fn insecure(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            secure: SecureMode::Insecure,
            server_ca_path: None,
            client_cert_path: None,
            client_key_path: None,
            server_name: None,
            connect_timeout: Duration::from_secs(5),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Create a mutual TLS config with default timeouts.
    pub fn mutual_tls(
        address: impl Into<String>,
        server_ca_path: impl Into<PathBuf>,
        client_cert_path: impl Into<PathBuf>,
        client_key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            secure: SecureMode::MutualTls,
            server_ca_path: Some(server_ca_path.into()),
            client_cert_path: Some(client_cert_path.into()),
            client_key_path: Some(client_key_path.into()),
            ..Self::insecure(address)
        }
    }

    /// Build and validate a config from the `client` section of the settings file.
    pub fn from_settings(settings: &ClientSettings) -> Result<Self, ClientError> {
        let config = Self {
            address: settings.address.clone().unwrap_or_default(),
            secure: settings.secure,
            server_ca_path: settings.server_ca_path.clone(),
            client_cert_path: settings.client_cert_path.clone(),
            client_key_path: settings.client_key_path.clone(),
            server_name: settings.server_name.clone(),
            connect_timeout: settings.connect_timeout(),
            probe_timeout: settings.probe_timeout(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that every file the secure mode needs is configured.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.address.trim().is_empty() {
            return Err(ClientError::InvalidConfig(
                "server address is not configured".into(),
            ));
        }
        if self.secure == SecureMode::Insecure {
            return Ok(());
        }
        if self.server_ca_path.is_none() {
            return Err(ClientError::InvalidConfig(format!(
                "server CA path is required for {:?}",
                self.secure
            )));
        }
        if self.secure == SecureMode::MutualTls {
            if self.client_cert_path.is_none() {
                return Err(ClientError::InvalidConfig(
                    "client certificate path is required for mutual TLS".into(),
                ));
            }
            if self.client_key_path.is_none() {
                return Err(ClientError::InvalidConfig(
                    "client key path is required for mutual TLS".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Timing for a rotating connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleConfig {
    pub check_interval: Duration,
    pub grace_delay: Duration,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            grace_delay: DEFAULT_GRACE_DELAY,
        }
    }
}

impl HandleConfig {
    pub fn from_settings(settings: &RotationSettings) -> Result<Self, ClientError> {
        let config = Self {
            check_interval: settings.check_interval(),
            grace_delay: settings.grace_delay(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.check_interval.is_zero() {
            return Err(ClientError::InvalidConfig(
                "check interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn insecure_needs_only_an_address() {
        assert!(ClientConfig::insecure("http://127.0.0.1:50051").validate().is_ok());
        assert!(matches!(
            ClientConfig::insecure("  ").validate(),
            Err(ClientError::InvalidConfig(_))
        ));
    }

    #[test]
    fn server_tls_requires_ca() {
        let mut config = ClientConfig::insecure("https://controller:443");
        config.secure = SecureMode::ServerTls;
        assert!(config.validate().is_err());

        config.server_ca_path = Some("ca.pem".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn mutual_tls_requires_cert_and_key() {
        let mut config =
            ClientConfig::mutual_tls("https://controller:443", "ca.pem", "c.pem", "k.pem");
        assert!(config.validate().is_ok());

        config.client_key_path = None;
        match config.validate() {
            Err(ClientError::InvalidConfig(msg)) => assert!(msg.contains("key")),
            other => panic!("expected invalid config, got {other:?}"),
        }

        config.client_key_path = Some("k.pem".into());
        config.client_cert_path = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_settings_applies_defaults_and_validates() {
        let settings = ClientSettings::default();
        assert!(ClientConfig::from_settings(&settings).is_err());

        let settings = ClientSettings {
            address: Some("http://127.0.0.1:50051".into()),
            secure: SecureMode::Insecure,
            ..ClientSettings::default()
        };
        let config = ClientConfig::from_settings(&settings).unwrap();
        assert_eq!(config.probe_timeout, DEFAULT_PROBE_TIMEOUT);
    }

    #[test]
    fn handle_defaults() {
        let config = HandleConfig::default();
        assert_eq!(config.check_interval, Duration::from_secs(900));
        assert_eq!(config.grace_delay, Duration::from_secs(10));
        assert_eq!(
            HandleConfig::from_settings(&RotationSettings::default()).unwrap(),
            config
        );

        let zero = RotationSettings {
            check_interval_secs: 0,
            ..RotationSettings::default()
        };
        assert!(HandleConfig::from_settings(&zero).is_err());
    }
}
