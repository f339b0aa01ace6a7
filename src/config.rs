//! Configuration types.
//!
//! Everything is read from the process environment exactly once, in
//! [`AppConfig::from_env`], and then passed by reference into the components
//! that need it.

use std::path::PathBuf;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

/// Default IMAPS port.
const DEFAULT_IMAP_PORT: u16 = 993;

/// Default folder scanned for orders.
const DEFAULT_FOLDER: &str = "INBOX";

/// Default directory for generated CSV files.
const DEFAULT_OUTPUT_DIR: &str = "CSV_files";

/// File name of the error log.
pub const ERROR_LOG_FILE: &str = "email_bot.log";

/// Mailbox connection settings.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub folder: String,
}

impl MailConfig {
    /// Build from `IMAP_*` variables.
    ///
    /// Missing host or credentials are not rejected here: they surface as a
    /// connection failure when a run starts.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or_default("IMAP_HOST", ""),
            port: parse_env("IMAP_PORT", DEFAULT_IMAP_PORT)?,
            username: env_or_default("IMAP_USER", ""),
            password: SecretString::from(env_or_default("IMAP_PASSWORD", "")),
            folder: env_or_default("IMAP_FOLDER", DEFAULT_FOLDER),
        })
    }
}

/// Output file settings.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Directory holding `orders_*.csv`, created on demand.
    pub dir: PathBuf,
    /// Directory holding the error log.
    pub log_dir: PathBuf,
}

/// Whole-application configuration. Immutable once built.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mail: MailConfig,
    pub llm: LlmConfig,
    pub output: OutputConfig,
    /// Upper bound on concurrently running extraction units.
    pub max_parallel: usize,
}

impl AppConfig {
    /// Read the whole configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend: LlmBackend = env_or_default("LLM_BACKEND", "openai").parse()?;

        let llm = LlmConfig {
            backend,
            api_key: SecretString::from(env_or_default(backend.key_var(), "")),
            model: env_or_default("OPENAI_MODEL", ""),
        };

        let output = OutputConfig {
            dir: PathBuf::from(env_or_default("ORDERS_OUTPUT_DIR", DEFAULT_OUTPUT_DIR)),
            log_dir: PathBuf::from(env_or_default("ORDERS_LOG_DIR", ".")),
        };

        let default_parallel = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let max_parallel = parse_env("ORDERS_MAX_PARALLEL", default_parallel)?;
        if max_parallel == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ORDERS_MAX_PARALLEL".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            mail: MailConfig::from_env()?,
            llm,
            output,
            max_parallel,
        })
    }

    /// Check the settings a run cannot start without.
    ///
    /// A missing AI key or model blocks the run before any connection is made.
    pub fn check_ready(&self) -> Result<(), ConfigError> {
        self.llm.check_ready()
    }
}

fn env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}
