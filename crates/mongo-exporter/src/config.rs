//! Exporter configuration: defaults, then the YAML file, then environment
//! overrides, then validation.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mongo_exporter_core::client::{AuthMechanism, ConnectionSettings, TlsSettings};
use mongo_exporter_core::collector::{DEFAULT_TIMEOUT, EXTENDED_TIMEOUT, Timeouts};
use mongo_exporter_core::config::CollectorConfig;
use serde::{Deserialize, Serialize};

use crate::server::ConnectionLimits;

#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    Read { path: PathBuf, source: std::io::Error },
    /// The config file is not valid YAML for [`Config`].
    Parse { path: PathBuf, message: String },
    /// An environment override could not be parsed.
    Env { var: &'static str, message: String },
    /// The resolved configuration is unusable.
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, message } => {
                write!(f, "failed to parse {}: {}", path.display(), message)
            }
            ConfigError::Env { var, message } => write!(f, "{}: {}", var, message),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Durations as humantime strings (`10s`, `1m 30s`, `30m`).
mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mongodb: MongoConfig,
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
    /// Per-collector settings keyed by collector name, passed through as-is.
    pub collectors: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MongoConfig {
    pub uri: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub auth_source: String,
    pub auth_mechanism: String,
    pub tls_enabled: bool,
    pub tls_insecure_skip_verify: bool,
    pub tls_cert_file: String,
    pub tls_key_file: String,
    pub tls_ca_file: String,
    #[serde(with = "duration")]
    pub connection_timeout: Duration,
    #[serde(with = "duration")]
    pub server_selection_timeout: Duration,
    pub max_pool_size: u32,
    pub min_pool_size: u32,
    #[serde(with = "duration")]
    pub max_idle_time: Duration,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".into(),
            username: String::new(),
            password: String::new(),
            database: "admin".into(),
            auth_source: "admin".into(),
            auth_mechanism: "SCRAM-SHA-256".into(),
            tls_enabled: false,
            tls_insecure_skip_verify: false,
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
            tls_ca_file: String::new(),
            connection_timeout: Duration::from_secs(10),
            server_selection_timeout: Duration::from_secs(30),
            max_pool_size: 100,
            min_pool_size: 5,
            max_idle_time: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    #[serde(with = "duration")]
    pub read_timeout: Duration,
    #[serde(with = "duration")]
    pub write_timeout: Duration,
    #[serde(with = "duration")]
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".into(),
            port: 8080,
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// `read_timeout` bounds the request head, `idle_timeout` paces HTTP/2
    /// keep-alive pings.
    pub fn connection_limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            header_read_timeout: self.read_timeout,
            keep_alive_interval: self.idle_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Expected scrape cadence. Informational; cycles run per scrape.
    #[serde(with = "duration")]
    pub collection_interval: Duration,
    pub enabled_metrics: Vec<String>,
    pub disabled_metrics: Vec<String>,
    pub custom_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            collection_interval: Duration::from_secs(15),
            enabled_metrics: Vec::new(),
            disabled_metrics: Vec::new(),
            custom_labels: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    #[serde(alias = "pretty")]
    Console,
}

impl LogFormat {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(LogFormat::Json),
            "console" | "pretty" => Some(LogFormat::Console),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Log file; empty means stdout.
    pub output_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Json,
            output_path: String::new(),
        }
    }
}

impl Config {
    /// Resolves the configuration from `path` (if any) and the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self, String> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| e.to_string())
    }

    /// Applies environment overrides. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let m = &mut self.mongodb;
        set_string(&get, "MONGO_URI", &mut m.uri);
        set_string(&get, "MONGO_USERNAME", &mut m.username);
        set_string(&get, "MONGO_PASSWORD", &mut m.password);
        set_string(&get, "MONGO_DATABASE", &mut m.database);
        set_string(&get, "MONGO_AUTH_SOURCE", &mut m.auth_source);
        set_string(&get, "MONGO_AUTH_MECHANISM", &mut m.auth_mechanism);
        set_bool(&get, "MONGO_TLS_ENABLED", &mut m.tls_enabled)?;
        set_bool(
            &get,
            "MONGO_TLS_INSECURE_SKIP_VERIFY",
            &mut m.tls_insecure_skip_verify,
        )?;
        set_string(&get, "MONGO_TLS_CERT_FILE", &mut m.tls_cert_file);
        set_string(&get, "MONGO_TLS_KEY_FILE", &mut m.tls_key_file);
        set_string(&get, "MONGO_TLS_CA_FILE", &mut m.tls_ca_file);
        set_duration(&get, "MONGO_CONNECTION_TIMEOUT", &mut m.connection_timeout)?;
        set_duration(
            &get,
            "MONGO_SERVER_SELECTION_TIMEOUT",
            &mut m.server_selection_timeout,
        )?;
        set_number(&get, "MONGO_MAX_POOL_SIZE", &mut m.max_pool_size)?;
        set_number(&get, "MONGO_MIN_POOL_SIZE", &mut m.min_pool_size)?;
        set_duration(&get, "MONGO_MAX_IDLE_TIME", &mut m.max_idle_time)?;

        let s = &mut self.server;
        set_number(&get, "SERVER_PORT", &mut s.port)?;
        set_duration(&get, "SERVER_READ_TIMEOUT", &mut s.read_timeout)?;
        set_duration(&get, "SERVER_WRITE_TIMEOUT", &mut s.write_timeout)?;
        set_duration(&get, "SERVER_IDLE_TIMEOUT", &mut s.idle_timeout)?;

        let mc = &mut self.metrics;
        set_duration(
            &get,
            "METRICS_COLLECTION_INTERVAL",
            &mut mc.collection_interval,
        )?;
        if let Some(v) = get("METRICS_ENABLED") {
            mc.enabled_metrics = split_list(&v);
        }
        if let Some(v) = get("METRICS_DISABLED") {
            mc.disabled_metrics = split_list(&v);
        }
        if let Some(v) = get("METRICS_CUSTOM_LABELS") {
            mc.custom_labels = parse_labels(&v).map_err(|message| ConfigError::Env {
                var: "METRICS_CUSTOM_LABELS",
                message,
            })?;
        }

        let l = &mut self.logging;
        set_string(&get, "LOG_LEVEL", &mut l.level);
        if let Some(v) = get("LOG_FORMAT") {
            l.format = LogFormat::parse(&v).ok_or_else(|| ConfigError::Env {
                var: "LOG_FORMAT",
                message: format!("unknown log format '{}'", v),
            })?;
        }
        set_string(&get, "LOG_OUTPUT_PATH", &mut l.output_path);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        let m = &self.mongodb;
        if m.uri.trim().is_empty() {
            return invalid("MongoDB URI is required");
        }
        if m.connection_timeout.is_zero() {
            return invalid("connection timeout must be positive");
        }
        if m.server_selection_timeout.is_zero() {
            return invalid("server selection timeout must be positive");
        }
        if m.max_pool_size < m.min_pool_size {
            return invalid("max pool size cannot be less than min pool size");
        }
        if AuthMechanism::from_name(&m.auth_mechanism).is_none() {
            return Err(ConfigError::Invalid(format!(
                "unsupported auth mechanism '{}'",
                m.auth_mechanism
            )));
        }

        let s = &self.server;
        if s.port == 0 {
            return invalid("server port is required");
        }
        if s.read_timeout.is_zero() {
            return invalid("read timeout must be positive");
        }
        if s.write_timeout.is_zero() {
            return invalid("write timeout must be positive");
        }
        if s.idle_timeout.is_zero() {
            return invalid("idle timeout must be positive");
        }
        if self.metrics.collection_interval.is_zero() {
            return invalid("collection interval must be positive");
        }
        if self.logging.level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "unknown log level '{}'",
                self.logging.level
            )));
        }
        self.collector_config()
            .static_labels()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    /// The slice of the configuration the collectors see.
    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            custom_labels: self.metrics.custom_labels.clone(),
            enabled_metrics: self.metrics.enabled_metrics.clone(),
            disabled_metrics: self.metrics.disabled_metrics.clone(),
            collectors: self.collectors.clone(),
        }
    }

    pub fn connection_settings(&self) -> Result<ConnectionSettings, ConfigError> {
        let m = &self.mongodb;
        let auth_mechanism = AuthMechanism::from_name(&m.auth_mechanism).ok_or_else(|| {
            ConfigError::Invalid(format!("unsupported auth mechanism '{}'", m.auth_mechanism))
        })?;
        let path = |s: &str| (!s.is_empty()).then(|| PathBuf::from(s));
        let tls = m.tls_enabled.then(|| TlsSettings {
            allow_invalid_certificates: m.tls_insecure_skip_verify,
            ca_file: path(&m.tls_ca_file),
            cert_file: path(&m.tls_cert_file),
            key_file: path(&m.tls_key_file),
        });
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

        Ok(ConnectionSettings {
            uri: m.uri.clone(),
            database: m.database.clone(),
            username: non_empty(&m.username),
            password: non_empty(&m.password),
            auth_source: m.auth_source.clone(),
            auth_mechanism,
            tls,
            connect_timeout: m.connection_timeout,
            server_selection_timeout: m.server_selection_timeout,
            max_pool_size: m.max_pool_size,
            min_pool_size: m.min_pool_size,
            max_idle_time: m.max_idle_time,
        })
    }

    /// Per-query timeouts; never longer than the HTTP write timeout.
    pub fn timeouts(&self) -> Timeouts {
        let cap = self.server.write_timeout;
        Timeouts {
            default: DEFAULT_TIMEOUT.min(cap),
            extended: EXTENDED_TIMEOUT.min(cap),
        }
    }
}

fn set_string<G: Fn(&str) -> Option<String>>(get: &G, var: &str, target: &mut String) {
    if let Some(v) = get(var) {
        *target = v;
    }
}

fn set_bool<G: Fn(&str) -> Option<String>>(
    get: &G,
    var: &'static str,
    target: &mut bool,
) -> Result<(), ConfigError> {
    if let Some(v) = get(var) {
        *target = match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(ConfigError::Env {
                    var,
                    message: format!("expected a boolean, got '{}'", v),
                });
            }
        };
    }
    Ok(())
}

fn set_number<G, T>(get: &G, var: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    if let Some(v) = get(var) {
        *target = v.trim().parse().map_err(|e: T::Err| ConfigError::Env {
            var,
            message: e.to_string(),
        })?;
    }
    Ok(())
}

fn set_duration<G: Fn(&str) -> Option<String>>(
    get: &G,
    var: &'static str,
    target: &mut Duration,
) -> Result<(), ConfigError> {
    if let Some(v) = get(var) {
        *target = humantime::parse_duration(v.trim()).map_err(|e| ConfigError::Env {
            var,
            message: e.to_string(),
        })?;
    }
    Ok(())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parses `k=v,k=v`.
fn parse_labels(raw: &str) -> Result<HashMap<String, String>, String> {
    let mut labels = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((name, value)) = pair.split_once('=') else {
            return Err(format!("expected name=value, got '{}'", pair));
        };
        labels.insert(name.trim().to_string(), value.trim().to_string());
    }
    Ok(labels)
}
