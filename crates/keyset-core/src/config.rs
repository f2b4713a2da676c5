//! Module: config
//! Responsibility: engine configuration loaded from TOML or built in code.
//! Invariants: a validated config has a positive temp-key TTL and a
//! parseable backend connection string.

use crate::{
    db::{backend::ConnectionSpec, key::KeyNamespace},
    error::{ErrorClass, ErrorOrigin, InternalError},
};
use serde::Deserialize;
use std::{fs, io, path::Path};
use thiserror::Error as ThisError;

/// Default expiry bound, in seconds, for temporary result keys.
pub const DEFAULT_TEMP_KEY_TTL_SECS: u64 = 10;

/// Default ceiling on literal values the simple lookup path resolves.
pub const DEFAULT_SIMPLE_LOOKUP_LIMIT: usize = 50;

pub const DEFAULT_BACKEND: &str = "redis://127.0.0.1:6379?db=7";

///
/// ConfigError
///

#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    InvalidToml(#[from] toml::de::Error),

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },

    #[error("invalid connection string '{url}': {reason}")]
    InvalidConnection { url: String, reason: String },
}

impl ConfigError {
    pub(crate) const fn class(&self) -> ErrorClass {
        match self {
            Self::Io { .. } => ErrorClass::NotFound,
            _ => ErrorClass::Unsupported,
        }
    }
}

impl From<ConfigError> for InternalError {
    fn from(err: ConfigError) -> Self {
        Self::classified(err.class(), ErrorOrigin::Config, err.to_string())
    }
}

///
/// EngineConfig
///
/// Knobs shared by the query compiler and the session.
/// Unknown keys are rejected so typos surface at load time.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Prefix prepended to every store key.
    pub namespace: String,

    /// Expiry bound for temporary result keys.
    pub temp_key_ttl_secs: u64,

    /// Maximum literal ids / unique values resolved without set algebra.
    /// Zero disables the simple path.
    pub simple_lookup_limit: usize,

    /// Backend connection string.
    pub backend: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            temp_key_ttl_secs: DEFAULT_TEMP_KEY_TTL_SECS,
            simple_lookup_limit: DEFAULT_SIMPLE_LOOKUP_LIMIT,
            backend: DEFAULT_BACKEND.to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;

        Ok(config)
    }

    /// Read, parse, and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&contents)?;

        tracing::debug!(
            path = %path.display(),
            namespace = %config.namespace,
            temp_key_ttl_secs = config.temp_key_ttl_secs,
            "loaded engine config"
        );

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.temp_key_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "temp_key_ttl_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.namespace.chars().any(|c| c.is_whitespace() || c == '*') {
            return Err(ConfigError::InvalidValue {
                field: "namespace",
                reason: "must not contain whitespace or '*'".to_string(),
            });
        }
        self.connection_spec()?;

        Ok(())
    }

    pub fn connection_spec(&self) -> Result<ConnectionSpec, ConfigError> {
        ConnectionSpec::parse(&self.backend)
    }

    #[must_use]
    pub fn key_namespace(&self) -> KeyNamespace {
        KeyNamespace::new(self.namespace.clone())
    }

    /// Whether the compiler may resolve `count` literal values without set algebra.
    #[must_use]
    pub const fn allows_simple_lookup(&self, count: usize) -> bool {
        count > 0 && count <= self.simple_lookup_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = EngineConfig::from_toml_str("").expect("empty config should parse");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.temp_key_ttl_secs, 10);
        assert_eq!(config.simple_lookup_limit, 50);
    }

    #[test]
    fn overrides_are_applied() {
        let config = EngineConfig::from_toml_str(
            r#"
namespace = "app."
temp_key_ttl_secs = 30
simple_lookup_limit = 0
backend = "redis://localhost?db=3"
"#,
        )
        .expect("config should parse");

        assert_eq!(config.namespace, "app.");
        assert_eq!(config.temp_key_ttl_secs, 30);
        assert!(!config.allows_simple_lookup(1));

        let spec = config.connection_spec().expect("backend should parse");
        assert_eq!(spec.host, "127.0.0.1");
        assert_eq!(spec.port, 6379);
        assert_eq!(spec.db, 3);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = EngineConfig::from_toml_str("temp_key_ttl = 5").expect_err("typo should fail");
        assert!(matches!(err, ConfigError::InvalidToml(_)));
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let err =
            EngineConfig::from_toml_str("temp_key_ttl_secs = 0").expect_err("zero ttl should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "temp_key_ttl_secs",
                ..
            }
        ));
    }

    #[test]
    fn missing_file_maps_to_not_found() {
        let err = EngineConfig::load("/nonexistent/keyset.toml").expect_err("missing file");
        let err: InternalError = err.into();
        assert!(err.is_not_found());
    }
}
