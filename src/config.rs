//! Configuration types.
//!
//! Everything is read once from the environment by [`AppConfig::from_env`]
//! and handed to component constructors.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::extract::DEFAULT_COMMAND_TIMEOUT;
use crate::llm::{LlmBackend, LlmConfig};

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    /// `None` when no IMAP host is configured (mailbox integration disabled).
    pub mailbox: Option<ImapConfig>,
    pub monitor: MonitorConfig,
    pub logging: LogConfig,
    /// Upper bound for one external text-extraction command.
    pub extract_timeout: Duration,
}

impl AppConfig {
    /// Build the configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            llm: llm_from_env()?,
            storage: StorageConfig::from_env()?,
            api: ApiConfig::from_env()?,
            mailbox: ImapConfig::from_env()?,
            monitor: MonitorConfig::from_env()?,
            logging: LogConfig::from_env(),
            extract_timeout: extract_timeout_from_env()?,
        })
    }
}

fn extract_timeout_from_env() -> Result<Duration, ConfigError> {
    let secs: u64 = env_parse("EXTRACT_TIMEOUT_SECS", DEFAULT_COMMAND_TIMEOUT.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: "EXTRACT_TIMEOUT_SECS".into(),
            message: "must be at least 1".into(),
        });
    }
    Ok(Duration::from_secs(secs))
}

fn llm_from_env() -> Result<LlmConfig, ConfigError> {
    let backend = match std::env::var("LLM_BACKEND")
        .unwrap_or_else(|_| "openai".to_string())
        .to_lowercase()
        .as_str()
    {
        "openai" => LlmBackend::OpenAi,
        "anthropic" => LlmBackend::Anthropic,
        other => {
            return Err(ConfigError::InvalidValue {
                key: "LLM_BACKEND".into(),
                message: format!("unknown backend '{other}' (expected openai or anthropic)"),
            });
        }
    };

    let key_var = backend.api_key_var();
    let api_key =
        std::env::var(key_var).map_err(|_| ConfigError::MissingEnvVar(key_var.to_string()))?;
    let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| backend.default_model().to_string());

    Ok(LlmConfig {
        backend,
        api_key: SecretString::from(api_key),
        model,
        request_timeout: Duration::from_secs(env_parse("LLM_TIMEOUT_SECS", 60)?),
    })
}

/// Storage layout: three sibling folders under a base path.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub base_path: PathBuf,
    pub invoices_folder: String,
    pub others_folder: String,
    pub temp_folder: String,
    /// Temp files older than this are swept after a successful run.
    pub temp_max_age: Duration,
}

impl StorageConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            base_path: std::env::var("STORAGE_BASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.base_path),
            invoices_folder: std::env::var("INVOICES_FOLDER").unwrap_or(defaults.invoices_folder),
            others_folder: std::env::var("OTHERS_FOLDER").unwrap_or(defaults.others_folder),
            temp_folder: std::env::var("TEMP_FOLDER").unwrap_or(defaults.temp_folder),
            temp_max_age: Duration::from_secs(env_parse(
                "TEMP_MAX_AGE_SECS",
                defaults.temp_max_age.as_secs(),
            )?),
        })
    }

    /// Storage rooted at `base_path` with default folder names.
    pub fn with_base(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Self::default()
        }
    }

    pub fn invoices_path(&self) -> PathBuf {
        self.base_path.join(&self.invoices_folder)
    }

    pub fn others_path(&self) -> PathBuf {
        self.base_path.join(&self.others_folder)
    }

    pub fn temp_path(&self) -> PathBuf {
        self.base_path.join(&self.temp_folder)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./storage"),
            invoices_folder: "invoices".to_string(),
            others_folder: "others".to_string(),
            temp_folder: "temp".to_string(),
            temp_max_age: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: std::env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("API_PORT", 8000)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// IMAP mailbox configuration.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub folder: String,
    pub timeout: Duration,
}

impl ImapConfig {
    /// Returns `Ok(None)` if `EMAIL_IMAP_HOST` is not set (mailbox disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(host) = std::env::var("EMAIL_IMAP_HOST") else {
            return Ok(None);
        };

        Ok(Some(Self {
            host,
            port: env_parse("EMAIL_IMAP_PORT", 993)?,
            username: std::env::var("EMAIL_USERNAME").unwrap_or_default(),
            password: SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default()),
            folder: std::env::var("EMAIL_FOLDER").unwrap_or_else(|_| "INBOX".to_string()),
            timeout: Duration::from_secs(env_parse("EMAIL_TIMEOUT_SECS", 30)?),
        }))
    }
}

/// Background mailbox monitoring and batch concurrency.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between automatic mailbox checks. Zero disables the monitor.
    pub check_interval: Duration,
    pub max_emails_per_check: usize,
    /// Maximum pipeline runs in flight during one batch.
    pub max_concurrent_runs: usize,
}

impl MonitorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_concurrent_runs: usize =
            env_parse("PIPELINE_MAX_CONCURRENCY", defaults.max_concurrent_runs)?;
        if max_concurrent_runs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PIPELINE_MAX_CONCURRENCY".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            check_interval: Duration::from_secs(env_parse(
                "EMAIL_CHECK_INTERVAL_SECS",
                defaults.check_interval.as_secs(),
            )?),
            max_emails_per_check: env_parse("MAX_EMAILS_PER_CHECK", defaults.max_emails_per_check)?,
            max_concurrent_runs,
        })
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300), // 5 minutes
            max_emails_per_check: 10,
            max_concurrent_runs: 4,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub file: PathBuf,
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            file: std::env::var("LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./logs/app.log")),
        }
    }
}

/// Parse an optional environment variable, falling back to `default` when unset.
fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_paths_are_siblings_under_base() {
        let config = StorageConfig::with_base("/data/store");
        assert_eq!(config.invoices_path(), PathBuf::from("/data/store/invoices"));
        assert_eq!(config.others_path(), PathBuf::from("/data/store/others"));
        assert_eq!(config.temp_path(), PathBuf::from("/data/store/temp"));
    }

    #[test]
    fn storage_default_temp_age_is_one_hour() {
        assert_eq!(StorageConfig::default().temp_max_age, Duration::from_secs(3600));
    }

    #[test]
    fn monitor_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.check_interval, Duration::from_secs(300));
        assert_eq!(config.max_emails_per_check, 10);
        assert!(config.max_concurrent_runs >= 1);
    }

    #[test]
    fn env_parse_uses_default_when_unset() {
        let value: u16 = env_parse("INVOICE_AGENT_TEST_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn env_parse_rejects_garbage() {
        // SAFETY: this variable name is unique to this test.
        unsafe { std::env::set_var("INVOICE_AGENT_TEST_BAD_PORT", "eighty") };
        let result: Result<u16, _> = env_parse("INVOICE_AGENT_TEST_BAD_PORT", 80);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
        unsafe { std::env::remove_var("INVOICE_AGENT_TEST_BAD_PORT") };
    }

    #[test]
    fn extract_timeout_from_env_and_zero_rejected() {
        // SAFETY: EXTRACT_TIMEOUT_SECS is only touched by this test.
        unsafe { std::env::remove_var("EXTRACT_TIMEOUT_SECS") };
        assert_eq!(extract_timeout_from_env().unwrap(), DEFAULT_COMMAND_TIMEOUT);

        unsafe { std::env::set_var("EXTRACT_TIMEOUT_SECS", "7") };
        assert_eq!(extract_timeout_from_env().unwrap(), Duration::from_secs(7));

        unsafe { std::env::set_var("EXTRACT_TIMEOUT_SECS", "0") };
        assert!(matches!(
            extract_timeout_from_env(),
            Err(ConfigError::InvalidValue { .. })
        ));
        unsafe { std::env::remove_var("EXTRACT_TIMEOUT_SECS") };
    }

    #[test]
    fn api_bind_addr() {
        let api = ApiConfig {
            host: "127.0.0.1".into(),
            port: 9000,
        };
        assert_eq!(api.bind_addr(), "127.0.0.1:9000");
    }
}
