use std::{env, fmt, net::SocketAddr, time::Duration};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_API_BASE_URL: &str = "https://api.twilio.com/2010-04-01/";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_RECORD_LIMIT: u32 = 200;
pub const DEFAULT_START_OFFSET: &str = "-10m";
pub const DEFAULT_DURATION: &str = "5m";
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
/// Upper bound for `WEBHOOK_DEDUPE_CAPACITY`.
pub const MAX_DEDUPE_CAPACITY: u64 = 1_000_000;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Credentials and endpoint for the upstream REST API.
#[derive(Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub api_base_url: String,
}

impl fmt::Debug for TwilioConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwilioConfig")
            .field("account_sid", &self.account_sid)
            .field("auth_token", &"<REDACTED>")
            .field("api_base_url", &self.api_base_url)
            .finish()
    }
}

/// Settings for the scrape-time reconciliation.
///
/// `start_offset` and `duration` are kept verbatim; they are parsed when a fetch
/// needs them so a bad value only fails that fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeConfig {
    pub record_limit: u32,
    pub start_offset: String,
    pub duration: String,
    pub skip_missing: bool,
    pub fetch_timeout: Duration,
}

/// Settings for inbound status callbacks.
#[derive(Clone)]
pub struct WebhookConfig {
    pub secret: String,
    pub public_url: Option<String>,
    pub dedupe_capacity: usize,
}

impl fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("secret", &"<REDACTED>")
            .field("public_url", &self.public_url)
            .field("dedupe_capacity", &self.dedupe_capacity)
            .finish()
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub log_level: String,
    pub twilio: TwilioConfig,
    pub scrape: ScrapeConfig,
    pub webhook: WebhookConfig,
}

impl AppConfig {
    /// Reads `.env` when one is present, then resolves the configuration.
    ///
    /// Variables already set in the process environment win over the file.
    pub fn load() -> Result<Self, ConfigError> {
        // A missing .env is the normal case outside local development.
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = optional("APP_BIND_ADDR")
            .as_deref()
            .unwrap_or(DEFAULT_BIND_ADDR)
            .parse::<SocketAddr>()
            .map_err(ConfigError::BindAddress)?;

        let account_sid = required("TWILIO_ACCOUNT_SID")?;
        let auth_token = required("TWILIO_AUTH_TOKEN")?;
        let api_base_url = optional("TWILIO_API_BASE_URL")
            .map(|value| absolute_url("TWILIO_API_BASE_URL", value))
            .transpose()?
            .map(|value| {
                if value.ends_with('/') {
                    value
                } else {
                    format!("{value}/")
                }
            })
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

        let scrape = ScrapeConfig {
            record_limit: positive("RECORD_LIMIT", DEFAULT_RECORD_LIMIT as u64)? as u32,
            start_offset: optional("START_DATE").unwrap_or_else(|| DEFAULT_START_OFFSET.into()),
            duration: optional("DURATION").unwrap_or_else(|| DEFAULT_DURATION.into()),
            skip_missing: boolean("SKIP_MISSING", false)?,
            fetch_timeout: Duration::from_secs(positive(
                "FETCH_TIMEOUT_SECS",
                DEFAULT_FETCH_TIMEOUT_SECS,
            )?),
        };

        let webhook = WebhookConfig {
            secret: optional("TWILIO_WEBHOOK_SECRET").unwrap_or_else(|| auth_token.clone()),
            public_url: optional("WEBHOOK_PUBLIC_URL")
                .map(|value| absolute_url("WEBHOOK_PUBLIC_URL", value))
                .transpose()?,
            dedupe_capacity: bounded("WEBHOOK_DEDUPE_CAPACITY", 0, MAX_DEDUPE_CAPACITY)? as usize,
        };

        Ok(Self {
            bind_addr,
            environment,
            log_level: optional("LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            twilio: TwilioConfig {
                account_sid,
                auth_token,
                api_base_url,
            },
            scrape,
            webhook,
        })
    }
}

fn optional(name: &'static str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn non_negative(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match optional(name) {
        None => Ok(default),
        Some(value) => value
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
    }
}

fn positive(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let value = non_negative(name, default)?;
    if value == 0 || value > u32::MAX as u64 {
        return Err(ConfigError::InvalidNumber {
            name,
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn bounded(name: &'static str, default: u64, max: u64) -> Result<u64, ConfigError> {
    let value = non_negative(name, default)?;
    if value > max {
        return Err(ConfigError::OutOfRange { name, value, max });
    }
    Ok(value)
}

fn boolean(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional(name) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "t" => Ok(true),
            "false" | "0" | "no" | "f" => Ok(false),
            _ => Err(ConfigError::InvalidBool { name, value }),
        },
    }
}

fn absolute_url(name: &'static str, value: String) -> Result<String, ConfigError> {
    if value.starts_with("https://") || value.starts_with("http://") {
        Ok(value)
    } else {
        Err(ConfigError::InvalidUrl { name, value })
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    Missing(&'static str),
    InvalidNumber { name: &'static str, value: String },
    OutOfRange { name: &'static str, value: u64, max: u64 },
    InvalidBool { name: &'static str, value: String },
    InvalidUrl { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::Missing(name) => write!(f, "{name} must be set"),
            Self::InvalidNumber { name, value } => {
                write!(f, "{name} must be a positive integer (got {value})")
            }
            Self::OutOfRange { name, value, max } => {
                write!(f, "{name} must be at most {max} (got {value})")
            }
            Self::InvalidBool { name, value } => {
                write!(f, "{name} must be true or false (got {value})")
            }
            Self::InvalidUrl { name, value } => {
                write!(f, "{name} must be an absolute http(s) URL (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
pub(crate) static ENV_GUARD: std::sync::LazyLock<std::sync::Mutex<()>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(()));
