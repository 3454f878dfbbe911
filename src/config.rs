//! Runtime configuration.
//!
//! Resolution order (highest priority first):
//! 1. Environment variables (`ERP_*`)
//! 2. TOML file (explicit path, or `erp.toml` in the working directory)
//! 3. Compiled defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the config file picked up from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "erp.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid TOML in {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

/// SMTP settings for password reset mail. Absent means codes are only logged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

fn default_smtp_port() -> u16 {
    465
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ErpConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub upload_dir: PathBuf,
    pub session_hours: u64,
    pub max_upload_bytes: usize,
    pub currency: String,
    pub smtp: Option<SmtpConfig>,
}

impl Default for ErpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            database_path: PathBuf::from("database/erp.db"),
            upload_dir: PathBuf::from("database/uploads"),
            session_hours: 24,
            max_upload_bytes: 10 * 1024 * 1024,
            currency: "USD".to_string(),
            smtp: None,
        }
    }
}

impl ErpConfig {
    /// Load with layered resolution. `path` is an explicit config file; when it
    /// is `None` the default file is used if it exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: "<string>".to_string(),
            message: e.to_string(),
        })
    }

    /// Apply `ERP_*` overrides. The lookup is injected so tests never touch the
    /// process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("ERP_BIND_ADDR") {
            self.bind_addr = value;
        }
        if let Some(value) = lookup("ERP_DATABASE_PATH") {
            self.database_path = PathBuf::from(value);
        }
        if let Some(value) = lookup("ERP_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("ERP_SESSION_HOURS") {
            self.session_hours = parse_number("ERP_SESSION_HOURS", &value)?;
        }
        if let Some(value) = lookup("ERP_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = parse_number("ERP_MAX_UPLOAD_BYTES", &value)?;
        }
        if let Some(value) = lookup("ERP_CURRENCY") {
            self.currency = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_hours == 0 {
            return Err(ConfigError::Invalid {
                field: "session_hours".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "database_path".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_upload_bytes".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        field: field.to_string(),
        message: format!("'{value}' is not a number"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ErpConfig::from_toml(
            r#"
            bind_addr = "0.0.0.0:8080"

            [smtp]
            host = "smtp.example.com"
            username = "erp"
            password = "secret"
            from = "ERP <erp@example.com>"
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.session_hours, 24);
        assert_eq!(config.smtp.as_ref().unwrap().port, 465);
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("ERP_SESSION_HOURS", "8"),
            ("ERP_DATABASE_PATH", "/tmp/erp.db"),
        ]
        .into_iter()
        .collect();

        let mut config = ErpConfig::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.session_hours, 8);
        assert_eq!(config.database_path, PathBuf::from("/tmp/erp.db"));
    }

    #[test]
    fn bad_numbers_and_zero_session_are_rejected() {
        let mut config = ErpConfig::default();
        let err = config
            .apply_env_overrides(|key| (key == "ERP_SESSION_HOURS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));

        config.session_hours = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let err = ErpConfig::from_toml("bind_addr = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
