use std::{env, time::Duration};

use thiserror::Error;
use url::Url;

use super::storage::file::DEFAULT_STATE_FILE;

pub const DEFAULT_BUCKET_CREATION_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_USER_CREATION_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_INDEX_WATCH_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_INDEX_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CLUSTER_NAME: &str = "default";

const ADMIN_PORT: u16 = 8091;
const ADMIN_TLS_PORT: u16 = 18091;

/// Connection and timing settings shared by every operation of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub url: String,
    /// Stable name the state file records resources under. Independent of the node in `url`.
    pub cluster: String,
    pub username: String,
    pub password: String,
    pub query_url: Option<String>,
    pub bucket_creation_delay: Duration,
    pub user_creation_delay: Duration,
    pub index_watch_timeout: Duration,
    pub index_poll_interval: Duration,
    pub request_timeout: Duration,
    pub state_file: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            cluster: DEFAULT_CLUSTER_NAME.to_string(),
            username: String::new(),
            password: String::new(),
            query_url: None,
            bucket_creation_delay: DEFAULT_BUCKET_CREATION_DELAY,
            user_creation_delay: DEFAULT_USER_CREATION_DELAY,
            index_watch_timeout: DEFAULT_INDEX_WATCH_TIMEOUT,
            index_poll_interval: DEFAULT_INDEX_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            state_file: DEFAULT_STATE_FILE.to_string(),
        }
    }
}

impl ProviderConfig {
    /// Reads `COUCHBASE_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            url: var("COUCHBASE_URL").ok_or(ConfigError::Missing("COUCHBASE_URL"))?,
            cluster: var("COUCHBASE_CLUSTER")
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or(defaults.cluster.clone()),
            username: var("COUCHBASE_USERNAME").ok_or(ConfigError::Missing("COUCHBASE_USERNAME"))?,
            password: var("COUCHBASE_PASSWORD").unwrap_or_default(),
            query_url: var("COUCHBASE_QUERY_URL").filter(|url| !url.is_empty()),
            bucket_creation_delay: seconds(&var, "COUCHBASE_BUCKET_CREATION_DELAY")?
                .unwrap_or(defaults.bucket_creation_delay),
            request_timeout: seconds(&var, "COUCHBASE_REQUEST_TIMEOUT")?
                .unwrap_or(defaults.request_timeout),
            state_file: var("COUCHBASE_STATE_FILE").unwrap_or(defaults.state_file),
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::EmptyUrl);
        }
        self.admin_url()?;
        self.query_base_url()?;
        Ok(())
    }

    /// Administrative REST endpoint. `couchbase://` and `couchbases://` connection strings are
    /// mapped to the first host's admin port.
    pub fn admin_url(&self) -> Result<Url, ConfigError> {
        let raw = self.url.trim();
        let (scheme, port, rest) = if let Some(rest) = raw.strip_prefix("couchbase://") {
            ("http", ADMIN_PORT, rest)
        } else if let Some(rest) = raw.strip_prefix("couchbases://") {
            ("https", ADMIN_TLS_PORT, rest)
        } else {
            return parse_http(raw);
        };
        let host = rest
            .split(|c: char| matches!(c, ',' | '/' | '?'))
            .next()
            .map(without_port)
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConfigError::InvalidUrl(raw.to_string(), "no host".to_string()))?;
        parse_http(&format!("{scheme}://{host}:{port}"))
    }

    pub fn query_base_url(&self) -> Result<Option<Url>, ConfigError> {
        self.query_url.as_deref().map(parse_http).transpose()
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster
    }
}

/// `db1:11210` -> `db1`, `[::1]:11210` -> `[::1]`. Connection string ports are KV ports.
fn without_port(host: &str) -> &str {
    match host.find(']') {
        Some(end) if host.starts_with('[') => &host[..=end],
        _ => host.split(':').next().unwrap_or(host),
    }
}

fn parse_http(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl(raw.to_string(), e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::InvalidUrl(
            raw.to_string(),
            format!("unsupported scheme {other}"),
        )),
    }
}

fn seconds(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    var(key)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::InvalidDuration(key, value))
        })
        .transpose()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("url must not be an empty string")]
    EmptyUrl,
    #[error("{0} is not a valid cluster url: {1}")]
    InvalidUrl(String, String),
    #[error("{0} must be a whole number of seconds, got {1:?}")]
    InvalidDuration(&'static str, String),
}
