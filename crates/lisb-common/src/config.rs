//! Configuration for LiSB

use crate::types::FilterName;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Inbound listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream relay configuration
    pub forwarding: ForwardingConfig,

    /// Filtering configuration
    #[serde(default)]
    pub filtering: FilteringConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Inbound listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_local_ip")]
    pub local_ip: String,

    /// Bind port
    #[serde(default = "default_local_port")]
    pub local_port: u16,

    /// Hostname announced in the SMTP banner
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Maximum concurrent SMTP sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum accepted message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            local_ip: default_local_ip(),
            local_port: default_local_port(),
            hostname: default_hostname(),
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
        }
    }
}

fn default_local_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_local_port() -> u16 {
    25
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_max_connections() -> usize {
    100
}

fn default_max_message_size() -> usize {
    52_428_800 // 50MB
}

/// Upstream relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    /// Relay address
    pub remote_ip: String,

    /// Relay port
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,

    /// Number of forwarder workers (0 = one per CPU)
    #[serde(default)]
    pub n_forwarder_threads: usize,

    /// Pause after a failed delivery before reconnecting
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// How long a worker blocks on an empty queue before re-checking shutdown
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Deadline for every relay conversation
    #[serde(default = "default_relay_timeout")]
    pub relay_timeout_secs: u64,

    /// Upper bound on the shutdown drain
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl ForwardingConfig {
    /// Effective worker count
    pub fn worker_count(&self) -> usize {
        if self.n_forwarder_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.n_forwarder_threads
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

fn default_remote_port() -> u16 {
    1025
}

fn default_retry_backoff() -> u64 {
    15
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_relay_timeout() -> u64 {
    60
}

fn default_drain_timeout() -> u64 {
    120
}

/// Addresses exempt from filtering
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExceptionsConfig {
    #[serde(default)]
    pub ip_addresses: HashSet<String>,

    #[serde(default)]
    pub email_addresses: HashSet<String>,

    #[serde(default)]
    pub email_domains: HashSet<String>,
}

/// Filtering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilteringConfig {
    /// Race filters concurrently instead of running them in order
    #[serde(default = "default_enable_threading")]
    pub enable_threading: bool,

    /// Seconds between two flushes of filter state
    #[serde(default = "default_storing_frequency")]
    pub storing_frequency: u64,

    /// Detections an IP may accumulate before being blocked outright
    #[serde(default = "default_black_listing_threshold")]
    pub black_listing_threshold: u32,

    /// Lifetime of a blacklist entry in days
    #[serde(default = "default_black_listed_days")]
    pub black_listed_days: u32,

    /// Time budget of racing evaluation in seconds
    #[serde(default = "default_time_limit")]
    pub time_limit: f64,

    /// Filters that must not be registered
    #[serde(default)]
    pub disabled_filters: HashSet<FilterName>,

    /// Traffic that bypasses filtering entirely
    #[serde(default)]
    pub exceptions: ExceptionsConfig,

    /// Directory holding the state files of stateful filters
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Spamhaus DROP-format list of blocked networks
    pub drop_list: Option<PathBuf>,

    /// Trained model for the classifier filter
    pub model_path: Option<PathBuf>,

    /// Deadline for a single DNS lookup
    #[serde(default = "default_dns_timeout")]
    pub dns_timeout_secs: u64,
}

impl Default for FilteringConfig {
    fn default() -> Self {
        Self {
            enable_threading: default_enable_threading(),
            storing_frequency: default_storing_frequency(),
            black_listing_threshold: default_black_listing_threshold(),
            black_listed_days: default_black_listed_days(),
            time_limit: default_time_limit(),
            disabled_filters: HashSet::new(),
            exceptions: ExceptionsConfig::default(),
            data_dir: default_data_dir(),
            drop_list: None,
            model_path: None,
            dns_timeout_secs: default_dns_timeout(),
        }
    }
}

impl FilteringConfig {
    pub fn storing_interval(&self) -> Duration {
        Duration::from_secs(self.storing_frequency)
    }

    /// Decision budget; values validation rejects fall back to the default
    pub fn time_budget(&self) -> Duration {
        Duration::try_from_secs_f64(self.time_limit)
            .ok()
            .filter(|budget| *budget <= MAX_TIME_LIMIT)
            .unwrap_or_else(|| Duration::from_secs_f64(default_time_limit()))
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }

    pub fn is_enabled(&self, name: FilterName) -> bool {
        !self.disabled_filters.contains(&name)
    }
}

fn default_enable_threading() -> bool {
    true
}

fn default_storing_frequency() -> u64 {
    300
}

fn default_black_listing_threshold() -> u32 {
    10
}

fn default_black_listed_days() -> u32 {
    7
}

/// Longest decision budget accepted; keeps the decision deadline representable
const MAX_TIME_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

fn default_time_limit() -> f64 {
    5.0
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/lisb/data")
}

fn default_dns_timeout() -> u64 {
    5
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML document
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `LISB_CONFIG` or the default locations
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var("LISB_CONFIG") {
            return Self::from_file(Path::new(&path));
        }

        let paths = [
            PathBuf::from("./lisb.toml"),
            PathBuf::from("/etc/lisb/lisb.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }

    /// Check the value constraints serde cannot express
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: String| Err(crate::Error::Config(msg));

        if self.server.local_ip.parse::<IpAddr>().is_err() {
            return invalid(format!("server.local_ip is not an IP: {}", self.server.local_ip));
        }
        if self.forwarding.remote_ip.parse::<IpAddr>().is_err() {
            return invalid(format!(
                "forwarding.remote_ip is not an IP: {}",
                self.forwarding.remote_ip
            ));
        }
        if self.server.max_connections == 0 {
            return invalid("server.max_connections must be > 0".to_string());
        }
        if self.forwarding.poll_interval_ms == 0 {
            return invalid("forwarding.poll_interval_ms must be > 0".to_string());
        }

        let filtering = &self.filtering;
        if filtering.storing_frequency == 0 {
            return invalid("filtering.storing_frequency must be > 0".to_string());
        }
        if filtering.black_listing_threshold == 0 {
            return invalid("filtering.black_listing_threshold must be > 0".to_string());
        }
        if filtering.black_listed_days == 0 {
            return invalid("filtering.black_listed_days must be > 0".to_string());
        }
        if !(filtering.time_limit.is_finite() && filtering.time_limit > 0.0) {
            return invalid("filtering.time_limit must be > 0".to_string());
        }
        if !matches!(
            Duration::try_from_secs_f64(filtering.time_limit),
            Ok(budget) if budget <= MAX_TIME_LIMIT
        ) {
            return invalid(format!(
                "filtering.time_limit must be at most {} seconds",
                MAX_TIME_LIMIT.as_secs()
            ));
        }

        let exceptions = &filtering.exceptions;
        if let Some(ip) = exceptions
            .ip_addresses
            .iter()
            .find(|ip| ip.parse::<IpAddr>().is_err())
        {
            return invalid(format!("Invalid exempt IP address: {}", ip));
        }
        if let Some(address) = exceptions
            .email_addresses
            .iter()
            .find(|address| !is_email_address(address))
        {
            return invalid(format!("Invalid exempt email address: {}", address));
        }
        if let Some(domain) = exceptions
            .email_domains
            .iter()
            .find(|domain| !is_domain(domain))
        {
            return invalid(format!("Invalid exempt email domain: {}", domain));
        }

        Ok(())
    }
}

fn is_domain(s: &str) -> bool {
    let labels: Vec<&str> = s.split('.').collect();
    labels.len() >= 2
        && labels.iter().all(|label| {
            !label.is_empty()
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

fn is_email_address(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && local
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'))
                && is_domain(domain)
        }
        None => false,
    }
}
