//! Configuration resolution for certwatch.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Settings file (explicit path, or ~/.config/certwatch/settings.json)
//! 3. Environment variables
//! 4. CLI arguments (highest priority, applied by the binary)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Error, Result};

/// Environment variable overriding the outbound certificate check interval (seconds).
pub const CERT_CHECK_INTERVAL_ENV: &str = "CERTWATCH_CERT_CHECK_INTERVAL";
/// Environment variable overriding the credential store reconcile interval (seconds).
pub const RECONCILE_INTERVAL_ENV: &str = "CERTWATCH_RECONCILE_INTERVAL";
/// Environment variable overriding the grace delay before closing a superseded connection (seconds).
pub const GRACE_DELAY_ENV: &str = "CERTWATCH_GRACE_DELAY";

/// Complete certwatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub rotation: RotationSettings,
}

/// Which side of the TLS handshake a credential store serves.
///
/// The mode decides how a changed CA bundle is handled: servers rebuild
/// their client-verification roots, clients keep the trust anchor they
/// were opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CredentialMode {
    #[default]
    Client,
    Server,
}

/// Lowest TLS protocol version a config will negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MinTlsVersion {
    #[default]
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

/// Transport security for outbound gRPC connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecureMode {
    /// Plaintext HTTP/2. Development only.
    Insecure,
    /// TLS with server verification against a custom CA.
    ServerTls,
    /// Mutual TLS: custom CA plus a client certificate and key.
    #[default]
    MutualTls,
}

/// Credential store settings (the three PEM files and how often to re-read them).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub key_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub mode: CredentialMode,
    pub reconcile_interval_secs: u64,
    pub min_tls_version: MinTlsVersion,
    /// Server name clients verify the peer certificate against.
    pub server_name: Option<String>,
    /// Whether a server-mode store rejects clients without a certificate.
    pub require_client_auth: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            key_path: None,
            cert_path: None,
            ca_path: None,
            mode: CredentialMode::default(),
            reconcile_interval_secs: 30,
            min_tls_version: MinTlsVersion::default(),
            server_name: None,
            require_client_auth: true,
        }
    }
}

impl StoreSettings {
    pub const fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// Outbound client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Remote endpoint, e.g. `https://controller.example.com:443`.
    pub address: Option<String>,
    pub secure: SecureMode,
    pub server_ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// Overrides the domain name used for server certificate verification.
    pub server_name: Option<String>,
    pub connect_timeout_ms: u64,
    /// Deadline for the reachability probe issued after every dial.
    pub probe_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            address: None,
            secure: SecureMode::default(),
            server_ca_path: None,
            client_cert_path: None,
            client_key_path: None,
            server_name: None,
            connect_timeout_ms: 5_000,
            probe_timeout_ms: 5_000,
        }
    }
}

impl ClientSettings {
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Outbound connection rotation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    pub check_interval_secs: u64,
    pub grace_delay_secs: u64,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: 15 * 60,
            grace_delay_secs: 10,
        }
    }
}

impl RotationSettings {
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub const fn grace_delay(&self) -> Duration {
        Duration::from_secs(self.grace_delay_secs)
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicit `path` must exist; the global settings file is optional.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) => load_config_file(p)?,
        None => match global_config_path() {
            Some(global) if global.exists() => load_config_file(&global)?,
            _ => Config::default(),
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global settings file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/certwatch/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("certwatch").join("settings.json"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply interval overrides from the environment.
///
/// `lookup` is the variable source (normally `std::env::var`). Values that do
/// not parse as whole seconds are logged and ignored.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(secs) = parse_secs(&lookup, CERT_CHECK_INTERVAL_ENV) {
        config.rotation.check_interval_secs = secs;
    }
    if let Some(secs) = parse_secs(&lookup, RECONCILE_INTERVAL_ENV) {
        config.store.reconcile_interval_secs = secs;
    }
    if let Some(secs) = parse_secs(&lookup, GRACE_DELAY_ENV) {
        config.rotation.grace_delay_secs = secs;
    }
}

fn parse_secs<F>(lookup: &F, key: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(0) => {
            error!(var = key, "Interval must be positive; using default");
            None
        }
        Ok(secs) => Some(secs),
        Err(e) => {
            error!(var = key, value = %raw, error = %e, "Invalid interval value; using default");
            None
        }
    }
}
