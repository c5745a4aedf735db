//! Service configuration
//!
//! Loaded once from environment variables (after `.env` is applied). The
//! resource policy lives in its own TOML file, see `policy`.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

use crate::sandbox::RunnerSettings;

const MIN_SECRET_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    /// `LOG_FORMAT=json` selects JSON lines; anything else is plain text
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// How the single configured user's password is supplied
#[derive(Clone, PartialEq, Eq)]
pub enum PasswordSource {
    /// Plaintext, hashed at startup
    Plain(String),
    /// Pre-computed Argon2 PHC string
    Hashed(String),
}

impl std::fmt::Debug for PasswordSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PasswordSource::Plain(_) => f.write_str("Plain(<redacted>)"),
            PasswordSource::Hashed(_) => f.write_str("Hashed(<redacted>)"),
        }
    }
}

/// Everything the server binary needs besides the resource policy
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub secret_key: String,
    pub token_lifetime: chrono::Duration,
    pub username: String,
    pub password: PasswordSource,
    /// `None` uses the embedded default policy
    pub policy_path: Option<PathBuf>,
    pub workspace_root: PathBuf,
    pub runner: RunnerSettings,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let bind_addr = var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8001".into());
        let bind_addr: SocketAddr = bind_addr.parse().map_err(|_| ConfigError::Invalid {
            name: "BIND_ADDR",
            value: bind_addr.clone(),
        })?;

        let secret_key = var("SECRET_KEY").ok_or(ConfigError::Missing("SECRET_KEY"))?;
        if secret_key.len() < MIN_SECRET_BYTES {
            warn!(
                "SECRET_KEY is shorter than {} bytes; tokens are easier to forge",
                MIN_SECRET_BYTES
            );
        }

        let minutes = var("TOKEN_EXPIRES_MINUTES").unwrap_or_else(|| "30".into());
        let token_lifetime = match minutes.parse::<i64>() {
            Ok(m) if m > 0 => chrono::Duration::minutes(m),
            _ => {
                return Err(ConfigError::Invalid {
                    name: "TOKEN_EXPIRES_MINUTES",
                    value: minutes,
                })
            }
        };

        let username = var("OAUTH_USERNAME").unwrap_or_else(|| "agent_user".into());
        let password = match (var("OAUTH_PASSWORD_HASH"), var("OAUTH_PASSWORD")) {
            (Some(hash), _) => PasswordSource::Hashed(hash),
            (None, Some(password)) => PasswordSource::Plain(password),
            (None, None) => {
                return Err(ConfigError::Missing("OAUTH_PASSWORD or OAUTH_PASSWORD_HASH"))
            }
        };

        let defaults = RunnerSettings::default();
        let runner = RunnerSettings {
            image: var("SANDBOX_IMAGE").unwrap_or(defaults.image),
            // Set but empty disables the bootstrap
            bootstrap: match lookup("SANDBOX_BOOTSTRAP") {
                Some(value) if value.trim().is_empty() => None,
                Some(value) => Some(value),
                None => defaults.bootstrap,
            },
            ..defaults
        };

        Ok(Self {
            bind_addr,
            secret_key,
            token_lifetime,
            username,
            password,
            policy_path: var("SANDBOX_POLICY").map(PathBuf::from),
            workspace_root: var("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            runner,
        })
    }
}
