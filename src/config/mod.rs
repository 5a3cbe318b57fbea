use crate::batching::BatchConfig;
use crate::filter::FilterConfig;
use crate::ingest::{IngestOptions, RetryPolicy};
use crate::provisioning::schema::{DEFAULT_PROJECT, DEFAULT_TABLE};
use crate::provisioning::{ProvisioningRequest, ResourceChoice};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Default config file path, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "hydrolix_history.toml";

/// Complete shipper configuration
#[derive(Clone, Deserialize)]
pub struct HistoryConfig {
    /// Cluster hostname, without scheme
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub bearer_token: String,
    #[serde(default = "default_true")]
    pub use_ssl: bool,

    /// Project name to find or create
    #[serde(default = "default_project")]
    pub project: String,
    #[serde(default = "default_table")]
    pub table: String,
    /// Use this existing project instead of resolving `project` by name
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub table_id: Option<String>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds between time-triggered flushes
    #[serde(default = "default_batch_interval")]
    pub batch_interval: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Gzip ingest bodies
    #[serde(default = "default_true")]
    pub compress: bool,
    /// How often to log a diagnostics snapshot (seconds)
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,

    #[serde(flatten)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub retry: RetrySettings,
}

/// Ingest retry configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_project() -> String {
    DEFAULT_PROJECT.to_string()
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_interval() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_report_interval() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_secs() -> u64 {
    60
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            bearer_token: String::new(),
            use_ssl: default_true(),
            project: default_project(),
            table: default_table(),
            project_id: None,
            table_id: None,
            batch_size: default_batch_size(),
            batch_interval: default_batch_interval(),
            request_timeout_secs: default_request_timeout(),
            compress: default_true(),
            report_interval_secs: default_report_interval(),
            filter: FilterConfig::default(),
            retry: RetrySettings::default(),
        }
    }
}

// Token stays out of Debug output so configs can be logged
impl fmt::Debug for HistoryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryConfig")
            .field("host", &self.host)
            .field("bearer_token", &"<redacted>")
            .field("use_ssl", &self.use_ssl)
            .field("project", &self.project)
            .field("table", &self.table)
            .field("project_id", &self.project_id)
            .field("table_id", &self.table_id)
            .field("batch_size", &self.batch_size)
            .field("batch_interval", &self.batch_interval)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("compress", &self.compress)
            .field("report_interval_secs", &self.report_interval_secs)
            .field("filter", &self.filter)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Configuration load or validation error
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: String,
        source: std::io::Error,
    },
    Parse {
        path: String,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config file {}: {}", path, source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config file {}: {}", path, source)
            }
            ConfigError::Invalid(reason) => write!(f, "invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl HistoryConfig {
    /// Apply `HYDROLIX_*` environment overrides. Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("HYDROLIX_HOST") {
            self.host = v;
        }
        if let Some(v) = lookup("HYDROLIX_TOKEN") {
            self.bearer_token = v;
        }
        if let Some(v) = lookup("HYDROLIX_USE_SSL") {
            if let Ok(b) = v.parse::<bool>() {
                self.use_ssl = b;
            }
        }
        if let Some(v) = lookup("HYDROLIX_BATCH_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                self.batch_size = n;
            }
        }
        if let Some(v) = lookup("HYDROLIX_BATCH_INTERVAL") {
            if let Ok(n) = v.parse::<u64>() {
                self.batch_interval = n;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host must not be empty".to_string()));
        }
        if self.bearer_token.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "bearer_token must not be empty".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// `scheme://host` for both the config API and the ingest endpoint.
    pub fn base_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}", scheme, self.host.trim().trim_end_matches('/'))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn filter_config(&self) -> FilterConfig {
        self.filter.clone()
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            batch_interval: Duration::from_secs(self.batch_interval),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
        }
    }

    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            request_timeout: self.request_timeout(),
            compress: self.compress,
            retry: self.retry_policy(),
        }
    }

    /// A configured id selects an existing resource; otherwise resolve by name.
    pub fn provisioning_request(&self) -> ProvisioningRequest {
        ProvisioningRequest {
            project: choice(&self.project_id, &self.project),
            table: choice(&self.table_id, &self.table),
        }
    }
}

fn choice(id: &Option<String>, name: &str) -> ResourceChoice {
    match id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => ResourceChoice::Existing {
            id: id.to_string(),
            name: name.to_string(),
        },
        _ => ResourceChoice::Create {
            name: name.to_string(),
        },
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<HistoryConfig, ConfigError> {
    let path = path.as_ref();
    let display = path.display().to_string();

    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: display.clone(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: display,
        source,
    })
}
