//! Typed configuration.
//!
//! Process settings come from environment variables, loaded once at
//! startup. The services to wire up come from a TOML file (see
//! [`services`]). Secrets are read into `secrecy::SecretString` so they
//! never end up in logs.

pub mod services;

pub use services::{ServiceDefinition, ServicesConfig};

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::path::PathBuf;

pub const DEFAULT_SERVICES_PATH: &str = "services.toml";

#[derive(Debug)]
pub struct Config {
    /// Services file (`JOBTREE_SERVICES`).
    pub services_path: PathBuf,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            services_path: std::env::var("JOBTREE_SERVICES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_SERVICES_PATH)),
            otel_endpoint: std::env::var("OTEL_ENDPOINT")
                .ok()
                .filter(|v| !v.is_empty()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Read a required secret from the environment.
pub fn secret_var(name: &str) -> Result<SecretString> {
    required_var(name).map(SecretString::from)
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}
