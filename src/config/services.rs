//! Services file: which backends to build, in which order.
//!
//! ```toml
//! [[services]]
//! service_name = "database"
//! service_type = "postgres"
//!
//! [[services]]
//! service_name = "job_manager"
//! service_type = "postgres"
//! depends_on = ["database"]
//! ```
//!
//! A service may only depend on services declared before it.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::path::Path;

use crate::error::{Error, Result};

fn default_service_type() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDefinition {
    pub service_name: String,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub options: toml::Table,
}

impl ServiceDefinition {
    /// Registry key, `"<service_name>.<service_type>"`, lowercased.
    pub fn key(&self) -> String {
        format!("{}.{}", self.service_name, self.service_type).to_lowercase()
    }

    /// Whether `name` is listed in `depends_on`.
    pub fn depends_on(&self, name: &str) -> bool {
        self.depends_on.iter().any(|d| d.eq_ignore_ascii_case(name))
    }

    /// Deserialize the options table. Missing keys take the type's defaults.
    pub fn options<T: DeserializeOwned>(&self) -> Result<T> {
        toml::Value::Table(self.options.clone())
            .try_into()
            .map_err(|e| Error::Config(format!("bad options for {}: {e}", self.key())))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServicesConfig {
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

impl ServicesConfig {
    /// Read, parse and validate a services file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read services file {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Parse and validate services TOML.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("bad services file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Names are unique and every dependency was declared earlier.
    /// Comparison is case-insensitive.
    pub fn validate(&self) -> Result<()> {
        for (index, service) in self.services.iter().enumerate() {
            let earlier = &self.services[..index];
            if earlier
                .iter()
                .any(|s| s.service_name.eq_ignore_ascii_case(&service.service_name))
            {
                return Err(Error::Config(format!(
                    "service {} is declared more than once",
                    service.service_name
                )));
            }
            for dependency in &service.depends_on {
                if !earlier
                    .iter()
                    .any(|s| s.service_name.eq_ignore_ascii_case(dependency))
                {
                    return Err(Error::Config(format!(
                        "service {} depends on {dependency}, which is not declared before it",
                        service.service_name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn find(&self, service_name: &str) -> Option<&ServiceDefinition> {
        self.services
            .iter()
            .find(|s| s.service_name.eq_ignore_ascii_case(service_name))
    }
}
