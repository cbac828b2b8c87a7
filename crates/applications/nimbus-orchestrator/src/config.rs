//! Engine configuration
//!
//! One YAML document with three optional sections:
//!
//! ```yaml
//! identity:
//!   auth_url: https://keystone.example.net/v3
//!   username: nimbus
//!   project_name: workloads
//!   region: RegionOne
//! driver:
//!   stack_retries: 60
//!   stack_retry_wait_secs: 10
//! compiler:
//!   flavor_extra_specs:
//!     "hw:watchdog_action": reset
//! ```
//!
//! The password is never read from the file when `NIMBUS_PASSWORD` is set.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::compiler::CompilerConfig;
use crate::driver::DriverConfig;
use crate::error::{OrchestratorError, Result};

/// Environment variable overriding the identity password
pub const PASSWORD_ENV: &str = "NIMBUS_PASSWORD";

/// Credentials and location of the identity service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Base URL of the identity API, including the version segment
    pub auth_url: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub user_domain_name: String,
    pub project_name: String,
    pub project_domain_name: String,
    /// Region used when resolving service endpoints
    pub region: Option<String>,
    /// Endpoint interface to pick from the catalog
    pub interface: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            auth_url: "http://localhost:5000/v3".to_string(),
            username: "admin".to_string(),
            password: None,
            user_domain_name: "Default".to_string(),
            project_name: "admin".to_string(),
            project_domain_name: "Default".to_string(),
            region: None,
            interface: "public".to_string(),
        }
    }
}

impl IdentityConfig {
    pub fn with_auth_url(mut self, url: impl Into<String>) -> Self {
        self.auth_url = url.into();
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project_name = project.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// Top-level configuration of the engine and CLI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub identity: IdentityConfig,
    pub driver: DriverConfig,
    pub compiler: CompilerConfig,
}

impl EngineConfig {
    /// Parse a YAML document
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load from a YAML file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loaded engine configuration");
        Ok(Self::from_yaml(&text)?.with_env_overrides())
    }

    /// Apply `NIMBUS_PASSWORD` when set
    pub fn with_env_overrides(self) -> Self {
        self.with_password_override(std::env::var(PASSWORD_ENV).ok())
    }

    fn with_password_override(mut self, password: Option<String>) -> Self {
        if let Some(password) = password.filter(|p| !p.is_empty()) {
            self.identity.password = Some(password);
        }
        self
    }

    pub fn with_identity(mut self, identity: IdentityConfig) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_driver(mut self, driver: DriverConfig) -> Self {
        self.driver = driver;
        self
    }

    pub fn with_compiler(mut self, compiler: CompilerConfig) -> Self {
        self.compiler = compiler;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(EngineConfig::from_yaml("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = EngineConfig::from_yaml(
            r#"
identity:
  auth_url: https://id.example.net/v3
  region: RegionTwo
driver:
  stack_retries: 5
compiler:
  flavor_extra_specs:
    "hw:watchdog_action": reset
"#,
        )
        .unwrap();

        assert_eq!(config.identity.auth_url, "https://id.example.net/v3");
        assert_eq!(config.identity.region.as_deref(), Some("RegionTwo"));
        assert_eq!(config.identity.username, "admin");
        assert_eq!(config.driver.stack_retries, 5);
        assert_eq!(config.driver.stack_retry_wait_secs, 10);
        assert_eq!(config.compiler.flavor_extra_specs["hw:watchdog_action"], "reset");
    }

    #[test]
    fn test_password_override() {
        let config = EngineConfig::default()
            .with_identity(IdentityConfig::default().with_password("from-file"))
            .with_password_override(Some("from-env".to_string()));
        assert_eq!(config.identity.password.as_deref(), Some("from-env"));

        let config = EngineConfig::default()
            .with_identity(IdentityConfig::default().with_password("from-file"))
            .with_password_override(Some(String::new()));
        assert_eq!(config.identity.password.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_password_is_not_serialized() {
        let config = EngineConfig::default()
            .with_identity(IdentityConfig::default().with_password("secret"));
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(!yaml.contains("secret"));
    }

    #[test]
    fn test_malformed_document() {
        assert!(matches!(
            EngineConfig::from_yaml("driver: [1, 2"),
            Err(OrchestratorError::Yaml(_))
        ));
    }
}
