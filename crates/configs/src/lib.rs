//! # configs
//!
//! Builds the single immutable [`Settings`] record at boot. Sources, lowest
//! precedence first: built-in defaults, `config/default.{toml,yaml,json}`
//! (optional), then `CUTECHAN__SECTION__KEY` environment variables. A `.env`
//! file is loaded into the environment first when present.

use std::path::PathBuf;

use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub uploads: UploadSettings,
    pub thumbnailer: ThumbnailerSettings,
    pub storage: StorageSettings,
    pub sessions: SessionSettings,
    pub log: LogSettings,
}

#[derive(Debug, Deserialize)]
pub struct ServerSettings {
    /// e.g. "127.0.0.1:8000"
    pub bind: String,
    /// Trust `X-Forwarded-For` for the client address
    pub reverse_proxied: bool,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize)]
pub struct UploadSettings {
    /// Largest accepted file, in bytes
    pub max_size: usize,
    pub max_files: usize,
    /// Allowance for the non-file part of a request body
    pub json_limit: usize,
}

#[derive(Debug, Deserialize)]
pub struct ThumbnailerSettings {
    pub program: PathBuf,
    /// Run the child as this user through `sudo -u`
    pub isolation_user: Option<String>,
    pub workers: usize,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageSettings {
    Local {
        root: PathBuf,
    },
    Sftp {
        host: String,
        port: u16,
        user: String,
        private_key: PathBuf,
        passphrase: Option<SecretString>,
        /// Remote directory the blob layout is rooted at
        root: String,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: String,
        endpoint: Option<String>,
        region: Option<String>,
        access_key_id: Option<SecretString>,
        secret_access_key: Option<SecretString>,
    },
}

#[derive(Debug, Deserialize)]
pub struct SessionSettings {
    pub ttl_days: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Deserialize)]
pub struct LogSettings {
    pub format: LogFormat,
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Settings {
    /// Defaults only; callers add their own sources on top.
    pub fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Ok(config::Config::builder()
            .set_default("server.bind", "127.0.0.1:8000")?
            .set_default("server.reverse_proxied", false)?
            .set_default("database.url", "sqlite://cutechan.db")?
            .set_default("database.max_connections", 8)?
            .set_default("uploads.max_size", 20 * 1024 * 1024)?
            .set_default("uploads.max_files", 4)?
            .set_default("uploads.json_limit", 64 * 1024)?
            .set_default("thumbnailer.program", "cutethumb")?
            .set_default("thumbnailer.workers", 1)?
            .set_default("storage.backend", "local")?
            .set_default("storage.root", "./data/images")?
            .set_default("sessions.ttl_days", 30)?
            .set_default("log.format", "pretty")?
            .set_default("log.filter", "info")?)
    }

    /// Loads `.env`, the optional config file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        let cfg = Self::defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(
                Environment::with_prefix("CUTECHAN")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Self::from_config(cfg)
    }

    pub fn from_config(cfg: config::Config) -> Result<Self, ConfigError> {
        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.uploads.max_size == 0 {
            return invalid("uploads.max_size must be positive");
        }
        if self.uploads.max_files == 0 {
            return invalid("uploads.max_files must be at least 1");
        }
        if self.thumbnailer.workers == 0 {
            return invalid("thumbnailer.workers must be at least 1");
        }
        if self.sessions.ttl_days == 0 {
            return invalid("sessions.ttl_days must be at least 1");
        }
        if self.body_limit().is_none() {
            return invalid("uploads limits overflow");
        }
        match &self.storage {
            StorageSettings::Local { root } if root.as_os_str().is_empty() => invalid("storage.root is empty"),
            StorageSettings::Sftp { host, .. } if host.is_empty() => invalid("storage.host is empty"),
            StorageSettings::S3 { bucket, .. } if bucket.is_empty() => invalid("storage.bucket is empty"),
            _ => Ok(()),
        }
    }

    /// Largest request body: every file at full size plus the form fields.
    pub fn body_limit(&self) -> Option<usize> {
        self.uploads
            .max_size
            .checked_mul(self.uploads.max_files)?
            .checked_add(self.uploads.json_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn build(overrides: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        build_with(overrides, Vec::new())
    }

    /// Typed overrides stand in for what `try_parsing` does to env values.
    fn build_with(overrides: &[(&str, &str)], typed: Vec<(&str, config::Value)>) -> Result<Settings, ConfigError> {
        let mut builder = Settings::defaults()?;
        for (k, v) in overrides {
            builder = builder.set_override(*k, *v)?;
        }
        for (k, v) in typed {
            builder = builder.set_override(k, v)?;
        }
        Settings::from_config(builder.build()?)
    }

    #[test]
    fn defaults_are_valid() {
        let s = build(&[]).unwrap();
        assert_eq!(s.server.bind, "127.0.0.1:8000");
        assert_eq!(s.thumbnailer.workers, 1);
        assert_eq!(s.sessions.ttl_days, 30);
        assert_eq!(s.log.format, LogFormat::Pretty);
        assert!(matches!(s.storage, StorageSettings::Local { .. }));
        assert_eq!(s.body_limit(), Some(4 * 20 * 1024 * 1024 + 64 * 1024));
    }

    #[test]
    fn sftp_backend_with_secret() {
        let s = build_with(
            &[
                ("storage.backend", "sftp"),
                ("storage.host", "files.internal"),
                ("storage.user", "cutechan"),
                ("storage.private_key", "/etc/cutechan/id_ed25519"),
                ("storage.passphrase", "hunter2"),
                ("storage.root", "/srv/images"),
            ],
            vec![("storage.port", 22.into())],
        )
        .unwrap();
        match s.storage {
            StorageSettings::Sftp { port, passphrase, .. } => {
                assert_eq!(port, 22);
                assert_eq!(passphrase.unwrap().expose_secret(), "hunter2");
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = build(&[("thumbnailer.workers", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_backend_fails_to_load() {
        let err = build(&[("storage.backend", "ftp")]).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let s = build(&[
            ("storage.backend", "s3"),
            ("storage.bucket", "media"),
            ("storage.secret_access_key", "very-secret"),
        ])
        .unwrap();
        assert!(!format!("{s:?}").contains("very-secret"));
    }
}
