use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use crate::config::ConfigError;
pub use interfaces::defs::{Account, AccountRegistry, Post, PostKind, PostSource};

/// A network relay used as the outbound transport for fetches and probes.
///
/// Displays in its canonical line form, `host:port` or
/// `host:port:username:password`, which parses back to the same value.
/// `Debug` masks the password so endpoints can be logged freely.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Username and password, when both are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        Some((self.username.as_deref()?, self.password.as_deref()?))
    }

    /// URL the transport connects to. Credentials are not embedded; they are
    /// applied as basic auth by the caller.
    pub fn proxy_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Loggable form with the password hidden.
    pub fn redacted(&self) -> String {
        match &self.username {
            Some(username) => format!("{}:{}:{}:***", self.host, self.port, username),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                write!(f, "{}:{}:{}:{}", self.host, self.port, username, password)
            }
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Outcome of a single live probe through a proxy. Built once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyCheckResult {
    pub endpoint: ProxyEndpoint,
    pub working: bool,
    pub latency_ms: Option<f64>,
    pub observed_external_ip: Option<String>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Aggregate view over a batch of probe results.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckSummary {
    pub total: usize,
    pub working: usize,
    pub average_latency_ms: Option<f64>,
    pub elapsed: Duration,
}

impl CheckSummary {
    pub fn from_results(results: &[ProxyCheckResult], elapsed: Duration) -> Self {
        let latencies: Vec<f64> = results
            .iter()
            .filter(|r| r.working)
            .filter_map(|r| r.latency_ms)
            .collect();
        let average_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };

        Self {
            total: results.len(),
            working: results.iter().filter(|r| r.working).count(),
            average_latency_ms,
            elapsed,
        }
    }

    pub fn working_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.working as f64 * 100.0 / self.total as f64
        }
    }
}

/// What one pass over the tracked accounts did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub accounts_polled: usize,
    pub accounts_failed: usize,
    pub posts_delivered: usize,
    /// True when a stop request ended the pass before every account was visited.
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    FieldCount,
    InvalidHost,
    InvalidPort,
    EmptyCredential,
    InvalidUrl,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ParseErrorKind::FieldCount => "expected host:port or host:port:username:password",
            ParseErrorKind::InvalidHost => "invalid host",
            ParseErrorKind::InvalidPort => "invalid port",
            ParseErrorKind::EmptyCredential => "empty username or password",
            ParseErrorKind::InvalidUrl => "invalid url",
        };
        f.write_str(text)
    }
}

/// Malformed proxy line or URL. `input` never carries a password.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {input}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub input: String,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, input: impl Into<String>) -> Self {
        Self {
            kind,
            input: input.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Polling session is active; stop it first")]
    SessionActive,

    #[error("Unknown account: {handle}")]
    UnknownAccount { handle: String },

    #[error("Account already tracked: {handle}")]
    DuplicateAccount { handle: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TrackerError {
    pub fn storage(err: impl fmt::Display) -> Self {
        TrackerError::Storage(format!("{err:#}"))
    }

    pub fn transport(err: impl fmt::Display) -> Self {
        TrackerError::Transport(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;
