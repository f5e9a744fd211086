use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to build transport: {0}")]
    Transport(String),
}

impl ConfigError {
    fn invalid(name: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub posts_per_account: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            posts_per_account: 20,
        }
    }
}

impl PollConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::invalid("POLL_INTERVAL_SECS", "must be at least 1"));
        }
        if self.posts_per_account == 0 {
            return Err(ConfigError::invalid("POSTS_PER_ACCOUNT", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub probe_url: String,
    pub timeout: Duration,
    pub max_concurrency: usize,
    pub user_agent: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            probe_url: "http://httpbin.org/ip".to_string(),
            timeout: Duration::from_secs(5),
            max_concurrency: 100,
            user_agent: "post-tracker/0.1".to_string(),
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url("PROBE_URL", &self.probe_url)?;
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("PROBE_TIMEOUT_SECS", "must be at least 1"));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid("PROBE_CONCURRENCY", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: Option<String>,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: Duration::from_secs(30),
            user_agent: "post-tracker/0.1".to_string(),
        }
    }
}

impl HttpSourceConfig {
    /// The base url, which only `watch` needs.
    pub fn require_base_url(&self) -> Result<Url, ConfigError> {
        let raw = self
            .base_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("SOURCE_BASE_URL".to_string()))?;
        validate_url("SOURCE_BASE_URL", raw)
    }
}

/// Everything the binary needs, loaded from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub state_path: PathBuf,
    pub proxies_path: PathBuf,
    pub poll: PollConfig,
    pub probe: ProbeConfig,
    pub source: HttpSourceConfig,
}

impl TrackerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let user_agent = env_or_default("USER_AGENT", "post-tracker/0.1");

        Ok(Self {
            state_path: PathBuf::from(env_or_default("STATE_PATH", "./data/state.json")),
            proxies_path: PathBuf::from(env_or_default("PROXIES_PATH", "./proxies.txt")),
            poll: PollConfig {
                interval: Duration::from_secs(parse_env_u64("POLL_INTERVAL_SECS", 10)?),
                posts_per_account: parse_env_usize("POSTS_PER_ACCOUNT", 20)?,
            },
            probe: ProbeConfig {
                probe_url: env_or_default("PROBE_URL", "http://httpbin.org/ip"),
                timeout: Duration::from_secs(parse_env_u64("PROBE_TIMEOUT_SECS", 5)?),
                max_concurrency: parse_env_usize("PROBE_CONCURRENCY", 100)?,
                user_agent: user_agent.clone(),
            },
            source: HttpSourceConfig {
                base_url: optional_env("SOURCE_BASE_URL"),
                timeout: Duration::from_secs(parse_env_u64("SOURCE_TIMEOUT_SECS", 30)?),
                user_agent,
            },
        })
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.poll.validate()?;
        self.probe.validate()?;
        if self.source.timeout.is_zero() {
            return Err(ConfigError::invalid("SOURCE_TIMEOUT_SECS", "must be at least 1"));
        }
        if let Some(base_url) = &self.source.base_url {
            validate_url("SOURCE_BASE_URL", base_url)?;
        }
        Ok(())
    }
}

fn validate_url(name: &str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::invalid(name, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::invalid(name, format!("unsupported scheme '{other}'"))),
    }
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}
