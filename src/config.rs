//! Environment-driven configuration.
//!
//! Everything is read once at startup into an owned [`Config`] that is
//! passed explicitly to the subsystems that need it; there is no global.
//! `from_env` delegates to `from_lookup` so tests can feed a plain map
//! instead of mutating the process environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::core::vault::KEY_HEX_LEN;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {name}: {reason}")]
    InvalidVar { name: &'static str, reason: String },
    #[error("API_AUTH_TOKEN is required in release mode")]
    AuthTokenRequired,
    #[error("ENCRYPTION_KEY is required in release mode")]
    EncryptionKeyRequired,
    #[error("TLS_CERT_PATH and TLS_KEY_PATH must be set together")]
    PartialTls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Debug,
    Release,
}

impl Mode {
    pub fn is_release(self) -> bool {
        self == Mode::Release
    }
}

/// Whether a session's workspace outlives the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceType {
    /// Workspace directory is deleted when the session terminates.
    Isolated,
    /// Workspace directory is kept for reuse by later sessions.
    Persistent,
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub mode: Mode,
    /// `None` only in debug mode; release refuses to start without it.
    pub auth_token: Option<String>,
    pub cors_allowed_origins: Vec<String>,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub max_sessions_per_user: usize,
    pub output_buffer_capacity: usize,
    pub workspace_base_path: PathBuf,
    pub workspace_type: WorkspaceType,
    /// Command line of the wrapped tool, split on whitespace at spawn.
    pub command: String,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub instance: Url,
    pub user: String,
    pub password: String,
    pub topic: String,
    pub response_topic: String,
    pub poll_interval: Duration,
    pub batch_limit: u32,
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub sslmode: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http: HttpConfig,
    pub session: SessionSettings,
    pub queue: QueueConfig,
    /// `None` when `DB_HOST` is unset — the broker runs in-memory only.
    pub db: Option<DbConfig>,
    /// 64 hex chars; `None` enables the degraded plaintext mode (debug only).
    pub encryption_key: Option<String>,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any string lookup. Used directly by tests.
    pub fn from_lookup<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| get(key).filter(|v| !v.is_empty());

        let mode = match get("MODE").as_deref() {
            None | Some("debug") => Mode::Debug,
            Some("release") => Mode::Release,
            Some(other) => {
                return Err(ConfigError::InvalidVar {
                    name: "MODE",
                    reason: format!("expected debug or release, got {other}"),
                })
            }
        };

        let auth_token = get("API_AUTH_TOKEN");
        if mode.is_release() && auth_token.is_none() {
            return Err(ConfigError::AuthTokenRequired);
        }

        let encryption_key = get("ENCRYPTION_KEY");
        if let Some(key) = &encryption_key {
            let ok = key.len() == KEY_HEX_LEN && key.chars().all(|c| c.is_ascii_hexdigit());
            if !ok {
                return Err(ConfigError::InvalidVar {
                    name: "ENCRYPTION_KEY",
                    reason: format!("expected {KEY_HEX_LEN} hex characters"),
                });
            }
        } else if mode.is_release() {
            return Err(ConfigError::EncryptionKeyRequired);
        }

        let cors_allowed_origins: Vec<String> = get("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if cors_allowed_origins.iter().any(|o| o == "*") {
            return Err(ConfigError::InvalidVar {
                name: "CORS_ALLOWED_ORIGINS",
                reason: "wildcard origins are not allowed".to_string(),
            });
        }

        let tls = match (get("TLS_CERT_PATH"), get("TLS_KEY_PATH")) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            }),
            (None, None) => None,
            _ => return Err(ConfigError::PartialTls),
        };

        let http = HttpConfig {
            host: get("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or("PORT", get("PORT"), 8585)?,
            mode,
            auth_token,
            cors_allowed_origins,
            tls,
        };

        let session = SessionSettings {
            idle_timeout: Duration::from_secs(
                parse_or("SESSION_TIMEOUT_MINUTES", get("SESSION_TIMEOUT_MINUTES"), 30u64)? * 60,
            ),
            max_sessions_per_user: parse_or(
                "MAX_SESSIONS_PER_USER",
                get("MAX_SESSIONS_PER_USER"),
                3,
            )?,
            output_buffer_capacity: parse_or("OUTPUT_BUFFER_SIZE", get("OUTPUT_BUFFER_SIZE"), 100)?,
            workspace_base_path: PathBuf::from(
                get("WORKSPACE_BASE_PATH")
                    .unwrap_or_else(|| "/tmp/termbridge/workspaces".to_string()),
            ),
            workspace_type: match get("WORKSPACE_TYPE").as_deref() {
                None | Some("isolated") => WorkspaceType::Isolated,
                Some("persistent") => WorkspaceType::Persistent,
                Some(other) => {
                    return Err(ConfigError::InvalidVar {
                        name: "WORKSPACE_TYPE",
                        reason: format!("expected isolated or persistent, got {other}"),
                    })
                }
            },
            command: get("CLAUDE_COMMAND").unwrap_or_else(|| "claude".to_string()),
        };

        let instance_raw = get("SERVICE_INSTANCE").ok_or(ConfigError::MissingVar("SERVICE_INSTANCE"))?;
        let instance = Url::parse(&instance_raw).map_err(|e| ConfigError::InvalidVar {
            name: "SERVICE_INSTANCE",
            reason: e.to_string(),
        })?;
        let topic = get("QUEUE_TOPIC").unwrap_or_else(|| "claude.session".to_string());
        let response_topic =
            get("QUEUE_RESPONSE_TOPIC").unwrap_or_else(|| format!("{topic}.response"));

        let queue = QueueConfig {
            instance,
            user: get("API_USER").ok_or(ConfigError::MissingVar("API_USER"))?,
            password: get("API_PASSWORD").ok_or(ConfigError::MissingVar("API_PASSWORD"))?,
            topic,
            response_topic,
            poll_interval: Duration::from_secs(parse_or(
                "QUEUE_POLL_INTERVAL_SECONDS",
                get("QUEUE_POLL_INTERVAL_SECONDS"),
                5u64,
            )?),
            batch_limit: parse_or("QUEUE_BATCH_LIMIT", get("QUEUE_BATCH_LIMIT"), 10)?,
            workers: parse_or("QUEUE_WORKERS", get("QUEUE_WORKERS"), 5)?,
        };

        let db = match get("DB_HOST") {
            Some(host) => Some(DbConfig {
                host,
                port: parse_or("DB_PORT", get("DB_PORT"), 5432)?,
                user: get("DB_USER").ok_or(ConfigError::MissingVar("DB_USER"))?,
                password: get("DB_PASSWORD").unwrap_or_default(),
                name: get("DB_NAME").ok_or(ConfigError::MissingVar("DB_NAME"))?,
                sslmode: get("DB_SSLMODE").unwrap_or_else(|| "prefer".to_string()),
            }),
            None => None,
        };

        Ok(Config {
            http,
            session,
            queue,
            db,
            encryption_key,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_file: get("LOG_FILE").map(PathBuf::from),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidVar {
            name,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("SERVICE_INSTANCE", "https://example.service-now.com"),
            ("API_USER", "poller"),
            ("API_PASSWORD", "secret"),
        ])
    }

    fn build(env: HashMap<&'static str, &'static str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|k| env.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults() {
        let cfg = build(base_env()).unwrap();
        assert_eq!(cfg.http.port, 8585);
        assert_eq!(cfg.http.mode, Mode::Debug);
        assert_eq!(cfg.session.max_sessions_per_user, 3);
        assert_eq!(cfg.session.output_buffer_capacity, 100);
        assert_eq!(cfg.session.idle_timeout, Duration::from_secs(30 * 60));
        assert_eq!(cfg.session.workspace_type, WorkspaceType::Isolated);
        assert_eq!(cfg.queue.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.queue.workers, 5);
        assert_eq!(cfg.queue.response_topic, "claude.session.response");
        assert_eq!(cfg.http.cors_allowed_origins, vec!["http://localhost"]);
        assert!(cfg.db.is_none());
    }

    #[test]
    fn test_missing_queue_credentials() {
        let mut env = base_env();
        env.remove("API_PASSWORD");
        assert!(matches!(
            build(env),
            Err(ConfigError::MissingVar("API_PASSWORD"))
        ));
    }

    #[test]
    fn test_release_requires_auth_token_and_key() {
        let mut env = base_env();
        env.insert("MODE", "release");
        assert!(matches!(build(env.clone()), Err(ConfigError::AuthTokenRequired)));

        env.insert("API_AUTH_TOKEN", "tok");
        assert!(matches!(build(env.clone()), Err(ConfigError::EncryptionKeyRequired)));

        env.insert(
            "ENCRYPTION_KEY",
            "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
        );
        assert!(build(env).is_ok());
    }

    #[test]
    fn test_bad_encryption_key_rejected() {
        let mut env = base_env();
        env.insert("ENCRYPTION_KEY", "deadbeef");
        assert!(matches!(
            build(env),
            Err(ConfigError::InvalidVar {
                name: "ENCRYPTION_KEY",
                ..
            })
        ));
    }

    #[test]
    fn test_wildcard_cors_rejected() {
        let mut env = base_env();
        env.insert("CORS_ALLOWED_ORIGINS", "http://localhost,*");
        assert!(matches!(
            build(env),
            Err(ConfigError::InvalidVar {
                name: "CORS_ALLOWED_ORIGINS",
                ..
            })
        ));
    }

    #[test]
    fn test_partial_tls_rejected() {
        let mut env = base_env();
        env.insert("TLS_CERT_PATH", "/etc/tls/cert.pem");
        assert!(matches!(build(env), Err(ConfigError::PartialTls)));
    }

    #[test]
    fn test_db_config_requires_name_and_user() {
        let mut env = base_env();
        env.insert("DB_HOST", "db.internal");
        assert!(matches!(build(env.clone()), Err(ConfigError::MissingVar(_))));

        env.insert("DB_USER", "broker");
        env.insert("DB_NAME", "sessions");
        let cfg = build(env).unwrap();
        let db = cfg.db.unwrap();
        assert_eq!(db.port, 5432);
        assert_eq!(db.sslmode, "prefer");
    }

    #[test]
    fn test_cors_list_is_split_and_trimmed() {
        let mut env = base_env();
        env.insert(
            "CORS_ALLOWED_ORIGINS",
            "http://localhost:3000, https://ui.example.com",
        );
        let cfg = build(env).unwrap();
        assert_eq!(
            cfg.http.cors_allowed_origins,
            vec!["http://localhost:3000", "https://ui.example.com"]
        );
    }
}
