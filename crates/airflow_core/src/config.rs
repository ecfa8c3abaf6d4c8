//! Unified configuration via a single `config.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::parser::NumberPolicy;
use crate::types::{DeviceEndpoint, Framing};

/// Longest reply deadline accepted for one exchange (ms).
pub const MAX_READ_TIMEOUT_MS: u64 = 60_000;

/// Whether the serial port stays open between cycles.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    /// Open, query and close on every cycle.
    #[default]
    Reopen,
    /// Hold the port across cycles, reopening only after a failure.
    KeepOpen,
}

/// Publish transport.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// ZeroMQ PUB socket; SUB peers receive one JSON frame per sample.
    #[default]
    Zmq,
    /// Bound TCP endpoint; subscribers connect and receive JSON lines.
    Tcp,
    /// One datagram per sample to a fixed destination.
    Udp,
}

/// Serial link to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Serial device path
    pub path: String,
    /// Line speed (baud)
    pub baud_rate: u32,
    /// Controller query address
    pub address: String,
    /// Reply deadline per exchange (ms)
    pub read_timeout_ms: u64,
    /// "terminated" or "single-read"
    pub framing: Framing,
    /// Buffer size for single-read framing
    pub single_read_max_len: usize,
    /// Send the wake sequence at startup
    pub wake: bool,
    /// "reopen" or "keep-open"
    pub session: SessionMode,
    /// "lenient" or "strict"
    pub number_policy: NumberPolicy,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyS5".into(),
            baud_rate: 9600,
            address: "A".into(),
            read_timeout_ms: 2000,
            framing: Framing::Terminated,
            single_read_max_len: 128,
            wake: true,
            session: SessionMode::Reopen,
            number_policy: NumberPolicy::Lenient,
        }
    }
}

impl DeviceConfig {
    /// Immutable endpoint description handed to the device session.
    pub fn endpoint(&self) -> DeviceEndpoint {
        DeviceEndpoint {
            path: self.path.clone(),
            baud_rate: self.baud_rate,
            address: self.address.clone(),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            framing: self.framing,
            single_read_max_len: self.single_read_max_len,
        }
    }
}

/// Sampling cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Interval between cycles in seconds
    pub interval_secs: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10.0,
        }
    }
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }
}

/// Publish bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// "zmq", "tcp" or "udp"
    pub transport: Transport,
    /// ZeroMQ endpoint the PUB socket binds
    pub zmq_endpoint: String,
    /// Local address the TCP publisher binds
    pub bind_addr: String,
    /// Destination for UDP datagrams
    pub dest_addr: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Zmq,
            zmq_endpoint: "tcp://0.0.0.0:5558".into(),
            bind_addr: "0.0.0.0:5558".into(),
            dest_addr: "255.255.255.255:5558".into(),
        }
    }
}

/// Prometheus scrape endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
    pub metrics_path: String,
    pub gauge_name: String,
    /// Optional prefix for the gauge name
    pub namespace: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:9093".into(),
            metrics_path: "/metrics".into(),
            gauge_name: "trailer_air_flow".into(),
            namespace: None,
        }
    }
}

/// Startup connection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Retries after the first failed open (at least 1)
    pub connect_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            connect_retries: 3,
            backoff_initial_ms: 500,
            backoff_max_ms: 8000,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Site identifier stamped on every sample
    pub site: String,
    pub device: DeviceConfig,
    pub sampler: SamplerConfig,
    pub publish: PublishConfig,
    pub metrics: MetricsConfig,
    pub startup: StartupConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            site: "glbrc".into(),
            device: DeviceConfig::default(),
            sampler: SamplerConfig::default(),
            publish: PublishConfig::default(),
            metrics: MetricsConfig::default(),
            startup: StartupConfig::default(),
        }
    }
}

/// Errors saving the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// A missing or unreadable file falls back to the defaults.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str::<AppConfig>(&content) {
                    Ok(config) => {
                        info!("Configuration loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        warn!("Failed to parse {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    warn!("Failed to read {}: {}", path.display(), e);
                }
            }
        }

        info!("Using default configuration");
        AppConfig::default()
    }

    /// Saves configuration as TOML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Default `config.toml` location, next to the executable.
    pub fn default_path() -> PathBuf {
        let exe_dir = std::env::current_exe()
            .map(|p| p.parent().unwrap_or(Path::new(".")).to_path_buf())
            .unwrap_or_else(|_| PathBuf::from("."));
        exe_dir.join("config.toml")
    }

    /// Validates the configuration and returns every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.site.trim().is_empty() {
            errors.push("site must not be empty".into());
        }
        if self.device.path.is_empty() {
            errors.push("device.path must not be empty".into());
        }
        if self.device.address.is_empty() || self.device.address.contains(char::is_whitespace) {
            errors.push(format!(
                "device.address must be a non-empty token without whitespace: {:?}",
                self.device.address
            ));
        }
        if self.device.baud_rate == 0 {
            errors.push("device.baud_rate must not be 0".into());
        }
        if !(1..=MAX_READ_TIMEOUT_MS).contains(&self.device.read_timeout_ms) {
            errors.push(format!(
                "invalid device.read_timeout_ms: {} (1–{MAX_READ_TIMEOUT_MS})",
                self.device.read_timeout_ms
            ));
        }
        if self.device.framing == Framing::SingleRead && self.device.single_read_max_len == 0 {
            errors.push("device.single_read_max_len must not be 0".into());
        }
        if !(0.1..=3600.0).contains(&self.sampler.interval_secs) {
            errors.push(format!(
                "invalid sampler.interval_secs: {} (0.1–3600.0)",
                self.sampler.interval_secs
            ));
        }
        match self.publish.transport {
            Transport::Zmq if !self.publish.zmq_endpoint.starts_with("tcp://") => {
                errors.push(format!(
                    "publish.zmq_endpoint must be a tcp:// endpoint: {:?}",
                    self.publish.zmq_endpoint
                ));
            }
            Transport::Tcp if self.publish.bind_addr.is_empty() => {
                errors.push("publish.bind_addr must not be empty".into());
            }
            Transport::Udp if self.publish.dest_addr.is_empty() => {
                errors.push("publish.dest_addr must not be empty".into());
            }
            _ => {}
        }
        if self.metrics.enabled {
            if !self.metrics.metrics_path.starts_with('/') {
                errors.push(format!(
                    "metrics.metrics_path must start with '/': {:?}",
                    self.metrics.metrics_path
                ));
            }
            if self.metrics.gauge_name.is_empty() {
                errors.push("metrics.gauge_name must not be empty".into());
            }
        }
        if self.startup.connect_retries == 0 {
            errors.push("startup.connect_retries must be at least 1".into());
        }

        errors
    }
}
