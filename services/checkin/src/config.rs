use serde::Deserialize;
use std::time::Duration;

/// Minimum length of the HS256 signing key in bytes
pub const MIN_SIGNING_KEY_LEN: usize = 32;

/// Longest token lifetime accepted, ten years in seconds
pub const MAX_TOKEN_TTL_SECS: u64 = 10 * 365 * 86_400;

/// Main configuration for the check-in service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Token and password configuration
    pub auth: AuthConfig,
    /// Backing store selection and limits
    #[serde(default)]
    pub stores: StoreConfig,
    /// S3 configuration for post media
    #[serde(default)]
    pub s3: S3Config,
    /// Elasticsearch configuration for posts and credentials
    #[serde(default)]
    pub elasticsearch: ElasticsearchConfig,
    /// ClickHouse configuration for the post cell table
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
    /// Image annotation endpoint
    #[serde(default)]
    pub annotator: AnnotatorConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Maximum request body size, media included
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

/// Token and password hashing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Symmetric HS256 signing key
    pub signing_key: String,
    /// Token lifetime in seconds
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
    /// Argon2 memory cost in KiB
    #[serde(default = "default_argon2_memory_kib")]
    pub argon2_memory_kib: u32,
    /// Argon2 iteration count
    #[serde(default = "default_argon2_iterations")]
    pub argon2_iterations: u32,
}

/// Which implementation backs the store traits
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// S3, Elasticsearch and ClickHouse
    Remote,
    /// Process-local maps, for local development
    Memory,
}

/// Backing store selection and limits
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    /// Upper bound on every single store call in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for post media
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Base URL that public object links are built from (e.g. a CDN)
    pub public_base_url: Option<String>,
}

/// Elasticsearch configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ElasticsearchConfig {
    #[serde(default = "default_es_url")]
    pub url: String,
    /// Index holding posts, `location` mapped as geo_point
    #[serde(default = "default_post_index")]
    pub post_index: String,
    /// Index holding credential records keyed by username
    #[serde(default = "default_user_index")]
    pub user_index: String,
    /// Maximum hits returned by one radius query
    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

/// ClickHouse configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    #[serde(default = "default_clickhouse_url")]
    pub url: String,
    #[serde(default = "default_clickhouse_database")]
    pub database: String,
    /// Table storing one row per (post id, family, qualifier, write time)
    #[serde(default = "default_clickhouse_table")]
    pub table: String,
}

/// Image annotation configuration; disabled when no endpoint is set
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnnotatorConfig {
    /// Prediction endpoint URL
    pub endpoint: Option<String>,
    /// Bearer token sent with prediction requests
    pub bearer_token: Option<String>,
}

// Default value functions
fn default_service_name() -> String {
    "checkin-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_max_upload_bytes() -> usize {
    32 * 1024 * 1024 // 32MB
}

fn default_token_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_argon2_memory_kib() -> u32 {
    19 * 1024
}

fn default_argon2_iterations() -> u32 {
    2
}

fn default_backend() -> StoreBackend {
    StoreBackend::Remote
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_bucket() -> String {
    "around-post-images".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_es_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_post_index() -> String {
    "around".to_string()
}

fn default_user_index() -> String {
    "around-users".to_string()
}

fn default_max_results() -> u32 {
    100
}

fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}

fn default_clickhouse_database() -> String {
    "default".to_string()
}

fn default_clickhouse_table() -> String {
    "post_cells".to_string()
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "checkin-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/checkin").required(false))
            .add_source(config::File::with_name("/etc/around/checkin").required(false))
            // Override with environment variables
            // CHECKIN__AUTH__SIGNING_KEY -> auth.signing_key
            .add_source(
                config::Environment::with_prefix("CHECKIN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth.signing_key.len() < MIN_SIGNING_KEY_LEN {
            anyhow::bail!(
                "auth.signing_key must be at least {} bytes",
                MIN_SIGNING_KEY_LEN
            );
        }
        if self.auth.token_ttl_secs == 0 || self.auth.token_ttl_secs > MAX_TOKEN_TTL_SECS {
            anyhow::bail!(
                "auth.token_ttl_secs must be between 1 and {}",
                MAX_TOKEN_TTL_SECS
            );
        }
        if self.stores.request_timeout_ms == 0 {
            anyhow::bail!("stores.request_timeout_ms must be positive");
        }
        Ok(())
    }

    /// Get the per-call store timeout as Duration
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.stores.request_timeout_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            public_base_url: None,
        }
    }
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: default_es_url(),
            post_index: default_post_index(),
            user_index: default_user_index(),
            max_results: default_max_results(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: default_clickhouse_url(),
            database: default_clickhouse_database(),
            table: default_clickhouse_table(),
        }
    }
}

impl AuthConfig {
    /// Config with the given key and default lifetimes/costs
    pub fn with_signing_key(signing_key: impl Into<String>) -> Self {
        Self {
            signing_key: signing_key.into(),
            token_ttl_secs: default_token_ttl_secs(),
            argon2_memory_kib: default_argon2_memory_kib(),
            argon2_iterations: default_argon2_iterations(),
        }
    }

    /// Get the token lifetime as Duration
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}
