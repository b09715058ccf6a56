use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;
use std::time::Duration;

use crate::object_key::KeyScheme;

/// Main configuration for the archiver service
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration
    #[serde(default)]
    pub kafka: KafkaConfig,
    /// Object store configuration
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    /// Archiver loop configuration
    #[serde(default)]
    pub archiver: ArchiverConfig,
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
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
    /// Prometheus exporter port; the exporter is not started when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Kafka consumer and producer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    /// Client ID reported to the brokers
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic carrying request events
    #[serde(default = "default_input_topic")]
    pub input_topic: String,
    /// Topic receiving confirmation events
    #[serde(default = "default_output_topic")]
    pub output_topic: String,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
    /// How long a confirmation publish may wait for broker acknowledgement
    #[serde(default = "default_produce_timeout_ms")]
    pub produce_timeout_ms: u64,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
}

/// Object store (S3 / MinIO) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStoreConfig {
    /// Endpoint as `host:port`, or a full URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Access key
    #[serde(default = "default_access_key")]
    pub access_key: String,
    /// Secret key
    #[serde(default = "default_secret_key")]
    pub secret_key: String,
    /// Bucket receiving archived events
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Region used for request signing and bucket creation
    #[serde(default = "default_region")]
    pub region: String,
    /// Use https when the endpoint carries no scheme
    #[serde(default)]
    pub secure: bool,
    /// Force path-style access (required for MinIO)
    #[serde(default = "default_true")]
    pub force_path_style: bool,
}

/// Archiver loop configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiverConfig {
    /// Object key naming scheme
    #[serde(default)]
    pub key_scheme: KeyScheme,
}

// Default value functions
fn default_service_name() -> String {
    "archiver".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bootstrap_servers() -> String {
    "kafka-broker-1:9092".to_string()
}

fn default_client_id() -> String {
    "archiver".to_string()
}

fn default_consumer_group() -> String {
    "analytics_processor_group".to_string()
}

fn default_input_topic() -> String {
    "nbs_request".to_string()
}

fn default_output_topic() -> String {
    "analytcs_result".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    300000
}

fn default_produce_timeout_ms() -> u64 {
    30000
}

fn default_endpoint() -> String {
    "minio:9000".to_string()
}

fn default_access_key() -> String {
    "minioaccess".to_string()
}

fn default_secret_key() -> String {
    "miniosecret".to_string()
}

fn default_bucket() -> String {
    "messages".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_port: None,
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            consumer_group: default_consumer_group(),
            input_topic: default_input_topic(),
            output_topic: default_output_topic(),
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            produce_timeout_ms: default_produce_timeout_ms(),
            ssl_enabled: false,
            ssl_ca_location: None,
            sasl_username: None,
            sasl_password: None,
        }
    }
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            access_key: default_access_key(),
            secret_key: default_secret_key(),
            bucket: default_bucket(),
            region: default_region(),
            secure: false,
            force_path_style: true,
        }
    }
}

/// Flat variables used by existing deployments, mapped onto config keys.
/// These take precedence over files and `ARCHIVER__*` variables.
const LEGACY_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("KAFKA_BOOTSTRAP_SERVERS", "kafka.bootstrap_servers"),
    ("MINIO_ENDPOINT", "object_store.endpoint"),
    ("MINIO_ACCESS_KEY", "object_store.access_key"),
    ("MINIO_SECRET_KEY", "object_store.secret_key"),
    ("MINIO_BUCKET", "object_store.bucket"),
    ("LOGLEVEL", "service.log_level"),
];

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let builder = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/archiver").required(false))
            .add_source(config::File::with_name("/etc/archiver/archiver").required(false))
            // Override with environment variables
            // ARCHIVER__KAFKA__INPUT_TOPIC -> kafka.input_topic
            .add_source(
                config::Environment::with_prefix("ARCHIVER")
                    .separator("__")
                    .try_parsing(true),
            );

        let builder = apply_legacy_overrides(builder, |name| std::env::var(name).ok())?;

        let mut config: Self = builder.build()?.try_deserialize()?;
        config.service.log_level = normalize_log_level(&config.service.log_level);
        Ok(config)
    }
}

impl KafkaConfig {
    /// Get the confirmation publish timeout as Duration
    pub fn produce_timeout(&self) -> Duration {
        Duration::from_millis(self.produce_timeout_ms)
    }
}

impl ObjectStoreConfig {
    /// Endpoint as a URL the S3 client accepts
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://") {
            self.endpoint.clone()
        } else if self.secure {
            format!("https://{}", self.endpoint)
        } else {
            format!("http://{}", self.endpoint)
        }
    }
}

fn apply_legacy_overrides<F>(
    mut builder: ConfigBuilder<DefaultState>,
    lookup: F,
) -> Result<ConfigBuilder<DefaultState>, config::ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    for (var, key) in LEGACY_ENV_OVERRIDES {
        builder = builder.set_override_option(*key, lookup(var))?;
    }
    Ok(builder)
}

/// Map Python-logging style level names onto tracing filter directives
pub fn normalize_log_level(level: &str) -> String {
    match level.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        "notset" => "trace".to_string(),
        other => other.to_string(),
    }
}
