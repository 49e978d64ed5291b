//! `certwatch` Core Library
//!
//! Shared functionality for `certwatch` components:
//! - Configuration resolution (defaults, settings file, environment)
//! - Tracing subscriber initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{
    ClientSettings, Config, CredentialMode, MinTlsVersion, RotationSettings, SecureMode,
    StoreSettings,
};
pub use error::{Error, Result};
