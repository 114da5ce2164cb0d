//! Configuration module for slipscan runs

use crate::realtest::RealTestMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for a scan run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Tunnel domain appended to every probe query
    pub domain: String,

    /// Timeout for each DNS probe in milliseconds
    pub timeout_ms: u64,

    /// Number of concurrent scan workers
    pub threads: usize,

    /// Sample this many random addresses per CIDR instead of expanding it (0 = expand fully)
    pub random_per_cidr: u32,

    /// Real-test settings
    pub realtest: RealTestConfig,
}

/// Settings for verifying responsive resolvers with a real slipstream client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealTestConfig {
    /// When to real-test responsive resolvers
    pub mode: RealTestMode,

    /// Only real-test resolvers that answered faster than this many milliseconds
    pub ms_max: Option<i64>,

    /// Timeout for one SOCKS5 connect attempt in seconds
    pub timeout_s: f64,

    /// How long to wait for the client to signal readiness, in milliseconds
    pub ready_ms: u64,

    /// Number of concurrent real-test workers in live mode
    pub parallel: usize,

    /// How long to wait for queued live real tests after the scan finishes, in seconds
    pub drain_timeout_s: f64,

    /// Path to the slipstream client binary
    pub binary_path: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            timeout_ms: 800, // Aggressive timeout keeps big sweeps moving
            threads: 200,
            random_per_cidr: 0,
            realtest: RealTestConfig::default(),
        }
    }
}

impl Default for RealTestConfig {
    fn default() -> Self {
        Self {
            mode: RealTestMode::Off,
            ms_max: None,
            timeout_s: 5.0,
            ready_ms: 2000,
            parallel: 1,
            drain_timeout_s: 30.0,
            binary_path: default_transport_binary(),
        }
    }
}

impl ScanConfig {
    /// Create a new scan configuration for the given tunnel domain
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Default::default()
        }
    }

    /// Set the per-probe timeout in milliseconds
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the number of scan workers
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Set per-CIDR random sampling
    pub fn with_random_per_cidr(mut self, count: u32) -> Self {
        self.random_per_cidr = count;
        self
    }

    /// Set the real-test mode
    pub fn with_realtest_mode(mut self, mode: RealTestMode) -> Self {
        self.realtest.mode = mode;
        self
    }

    /// Get the probe timeout as Duration, floored at 50ms
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(50))
    }

    /// Load configuration from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = fs::read_to_string(&path).map_err(|e| {
            crate::ScanError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: ScanConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from the default location, falling back to defaults
    pub fn load_default_config() -> Self {
        let config_path = dirs::config_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("slipscan")
            .join("config.toml");

        if config_path.exists() {
            if let Ok(config) = Self::from_toml_file(&config_path) {
                println!("[~] Loaded config from {}", config_path.display());
                return config;
            }
        }

        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.domain.trim().is_empty() {
            return Err(crate::ScanError::ConfigError(
                "Domain cannot be empty".to_string(),
            ));
        }

        if self.threads == 0 {
            return Err(crate::ScanError::ConfigError(
                "Thread count must be greater than 0".to_string(),
            ));
        }

        if self.realtest.parallel == 0 {
            return Err(crate::ScanError::ConfigError(
                "Real-test parallelism must be greater than 0".to_string(),
            ));
        }

        if self.realtest.timeout_s <= 0.0 {
            return Err(crate::ScanError::ConfigError(
                "Real-test timeout must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

impl RealTestConfig {
    /// Timeout budget for one SOCKS5 round trip
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s)
    }

    /// How long to wait for client readiness, floored at 200ms
    pub fn ready_wait(&self) -> Duration {
        Duration::from_millis(self.ready_ms.max(200))
    }

    /// Post-scan drain budget for live mode, floored at 5s
    pub fn drain_deadline(&self) -> Duration {
        Duration::from_secs_f64(self.drain_timeout_s.max(5.0))
    }
}

/// Platform-specific default name of the slipstream client binary
pub fn default_transport_binary() -> String {
    if cfg!(windows) {
        "slipstream-client-windows-amd64.exe".to_string()
    } else {
        "slipstream-client".to_string()
    }
}
