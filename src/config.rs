use crate::error::{Result, TrackerError};
use chrono::{Duration, Weekday};
use log::warn;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure for the tracker
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Session accounting timings
    pub tracking: TrackingConfig,

    /// Data file and write debouncing
    pub persistence: PersistenceConfig,

    /// Monthly archive configuration
    pub archive: ArchiveConfig,

    /// Retry configuration
    pub retry: RetryConfig,
}

/// Timings that drive the session state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Interval between ticks in seconds
    pub tick_interval_secs: u64,

    /// Silence after the last accepted heartbeat before a session is finalized
    pub idle_timeout_secs: u64,

    /// Heartbeats closer than this to the last accepted one are ignored
    pub throttle_ms: u64,

    /// A gap between two ticks larger than this is treated as system sleep
    pub sleep_gap_secs: u64,

    /// Finalized sessions closer than this are merged into one
    pub merge_gap_secs: u64,

    /// Spans shorter than this are discarded as noise
    pub min_session_ms: u64,

    /// Checkpoints older than this are not recovered
    pub max_checkpoint_age_secs: u64,

    /// First day of the week for the weekly total ("monday" or "sunday")
    pub week_start: String,
}

/// Data file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Path to the data file (relative to data directory)
    pub data_file: String,

    /// Debounce window for coalescing saves in milliseconds
    pub debounce_ms: u64,
}

/// Archive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Whether past months are rolled out of the live data file
    pub enabled: bool,

    /// Path to the archive database (relative to data directory)
    pub path: String,

    /// Maximum connection pool size
    pub max_connections: u32,

    /// Busy timeout in milliseconds
    pub busy_timeout_ms: u32,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Data file lock retry configuration
    pub file_ops: RetrySettings,

    /// Archive database retry configuration
    pub db_ops: RetrySettings,
}

/// Individual retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum number of retry attempts
    pub max_attempts: u32,

    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,

    /// Backoff factor (multiplier for each retry)
    pub backoff_factor: f32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        TrackingConfig {
            tick_interval_secs: 60,
            idle_timeout_secs: 600,
            throttle_ms: 1000,
            sleep_gap_secs: 120,
            merge_gap_secs: 300,
            min_session_ms: 1000,
            max_checkpoint_age_secs: 3600,
            week_start: "monday".to_string(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            data_file: "activity.json".to_string(),
            debounce_ms: 750,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            enabled: true,
            path: "archive.db".to_string(),
            max_connections: 2,
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            file_ops: RetrySettings {
                max_attempts: 3,
                initial_delay_ms: 100,
                max_delay_ms: 5000,
                backoff_factor: 2.0,
            },
            db_ops: RetrySettings {
                max_attempts: 5,
                initial_delay_ms: 50,
                max_delay_ms: 2000,
                backoff_factor: 1.5,
            },
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_factor: 2.0,
        }
    }
}

// Typed accessors so the engine never juggles raw integers
impl TrackingConfig {
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        seconds(self.idle_timeout_secs)
    }

    pub fn throttle_window(&self) -> Duration {
        milliseconds(self.throttle_ms)
    }

    pub fn sleep_gap(&self) -> Duration {
        seconds(self.sleep_gap_secs)
    }

    pub fn merge_gap(&self) -> Duration {
        seconds(self.merge_gap_secs)
    }

    pub fn min_session(&self) -> Duration {
        milliseconds(self.min_session_ms)
    }

    pub fn max_checkpoint_age(&self) -> Duration {
        seconds(self.max_checkpoint_age_secs)
    }

    /// Parsed week start; anything unrecognized falls back to Monday
    pub fn week_start_day(&self) -> Weekday {
        match self.week_start.to_lowercase().as_str() {
            "sunday" | "sun" => Weekday::Sun,
            "saturday" | "sat" => Weekday::Sat,
            "monday" | "mon" => Weekday::Mon,
            other => {
                log::debug!("Unknown week_start '{}', using monday", other);
                Weekday::Mon
            }
        }
    }
}

/// Upper bound for configured timings: one hundred years
const MAX_TIMING_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn seconds(value: u64) -> Duration {
    Duration::seconds(value.min(MAX_TIMING_SECS) as i64)
}

fn milliseconds(value: u64) -> Duration {
    Duration::milliseconds(value.min(MAX_TIMING_SECS * 1000) as i64)
}

impl PersistenceConfig {
    pub fn debounce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.debounce_ms.min(MAX_TIMING_SECS * 1000))
    }
}

// Configuration loading
impl Config {
    /// Load configuration from file, or use defaults
    pub fn load() -> Result<Self> {
        if let Some(config_path) = Self::find_config_file() {
            Self::load_from_file(&config_path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| TrackerError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| TrackerError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| TrackerError::Config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                TrackerError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        fs::write(path, toml_string)
            .map_err(|e| TrackerError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Apply `TIMEKEEPER_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        if let Some(secs) = env_u64("TIMEKEEPER_IDLE_TIMEOUT_SECS") {
            self.tracking.idle_timeout_secs = secs;
        }
        if let Some(secs) = env_u64("TIMEKEEPER_TICK_SECS") {
            self.tracking.tick_interval_secs = secs;
        }
        if let Ok(path) = env::var("TIMEKEEPER_DATA_FILE") {
            self.persistence.data_file = path;
        }
    }

    /// Find config file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        // 1. Environment variable from CLI flag
        if let Ok(path) = env::var("TIMEKEEPER_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // 2. Environment variable
        if let Ok(path) = env::var("TIMEKEEPER_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // 3. XDG config directory
        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("timekeeper").join("config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        // 4. Home directory
        if let Some(home_dir) = dirs::home_dir() {
            let path = home_dir.join(".timekeeper.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Get default config file path (for creating new config)
    pub fn default_config_path() -> Result<PathBuf> {
        if let Some(config_dir) = dirs::config_dir() {
            Ok(config_dir.join("timekeeper").join("config.toml"))
        } else {
            Err(TrackerError::Config(
                "Could not determine config directory".into(),
            ))
        }
    }

    /// Generate example config file content
    pub fn example_toml() -> &'static str {
        r#"# Timekeeper Configuration File
#
# All values shown are the defaults - you can override only what you need.

[tracking]
tick_interval_secs = 60        # How often idle/sleep/midnight checks run
idle_timeout_secs = 600        # Silence before an active session is closed
throttle_ms = 1000             # Heartbeats inside this window are ignored
sleep_gap_secs = 120           # Tick gap treated as system sleep
merge_gap_secs = 300           # Sessions closer than this are merged
min_session_ms = 1000          # Shorter spans are discarded
max_checkpoint_age_secs = 3600 # Older crash checkpoints are not recovered
week_start = "monday"          # "monday" or "sunday"

[persistence]
data_file = "activity.json"    # Relative to data directory
debounce_ms = 750              # Coalesce bursts of saves into one write

[archive]
enabled = true                 # Roll past months out of the live file
path = "archive.db"            # Relative to data directory
max_connections = 2
busy_timeout_ms = 5000

[retry.file_ops]
max_attempts = 3
initial_delay_ms = 100
max_delay_ms = 5000
backoff_factor = 2.0

[retry.db_ops]
max_attempts = 5
initial_delay_ms = 50
max_delay_ms = 2000
backoff_factor = 1.5
"#
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring {}={}: {}", name, raw, e);
            None
        }
    }
}

// Global configuration instance
use std::sync::OnceLock;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration instance
pub fn get_config() -> &'static Config {
    CONFIG.get_or_init(|| {
        let mut config = Config::load().unwrap_or_else(|e| {
            warn!("Failed to load config: {}. Using defaults.", e);
            Config::default()
        });
        config.apply_env_overrides();
        config
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.tracking.tick_interval_secs, 60);
        assert_eq!(config.tracking.idle_timeout(), Duration::minutes(10));
        assert_eq!(config.tracking.merge_gap(), Duration::minutes(5));
        assert_eq!(config.tracking.throttle_window(), Duration::seconds(1));
        assert_eq!(config.persistence.data_file, "activity.json");
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.tracking.idle_timeout_secs = 900;
        config.save(&config_path).unwrap();

        let loaded_config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(loaded_config.tracking.idle_timeout_secs, 900);
        assert_eq!(loaded_config.archive.path, config.archive.path);
    }

    #[test]
    fn test_example_config_parses_to_defaults() {
        let example: Config = toml::from_str(Config::example_toml()).unwrap();
        let defaults = Config::default();
        assert_eq!(example.tracking.idle_timeout_secs, defaults.tracking.idle_timeout_secs);
        assert_eq!(example.persistence.debounce_ms, defaults.persistence.debounce_ms);
        assert_eq!(example.retry.db_ops.max_attempts, defaults.retry.db_ops.max_attempts);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: Config = toml::from_str("[tracking]\nidle_timeout_secs = 120\n").unwrap();
        assert_eq!(config.tracking.idle_timeout_secs, 120);
        assert_eq!(config.tracking.sleep_gap_secs, 120);
        assert!(config.archive.enabled);
    }

    #[test]
    fn test_week_start_parsing() {
        let mut tracking = TrackingConfig::default();
        assert_eq!(tracking.week_start_day(), Weekday::Mon);
        tracking.week_start = "Sunday".to_string();
        assert_eq!(tracking.week_start_day(), Weekday::Sun);
        tracking.week_start = "someday".to_string();
        assert_eq!(tracking.week_start_day(), Weekday::Mon);
    }

    #[test]
    fn test_huge_timings_are_clamped() {
        let mut tracking = TrackingConfig::default();
        tracking.idle_timeout_secs = u64::MAX;
        tracking.throttle_ms = u64::MAX;
        tracking.max_checkpoint_age_secs = i64::MAX as u64 + 1;

        let hundred_years = Duration::seconds(MAX_TIMING_SECS as i64);
        assert_eq!(tracking.idle_timeout(), hundred_years);
        assert_eq!(tracking.throttle_window(), hundred_years);
        assert_eq!(tracking.max_checkpoint_age(), hundred_years);
        assert!(tracking.sleep_gap() > Duration::zero());

        let persistence = PersistenceConfig {
            debounce_ms: u64::MAX,
            ..PersistenceConfig::default()
        };
        assert_eq!(persistence.debounce().as_secs(), MAX_TIMING_SECS);
    }

    #[test]
    #[serial]
    fn test_huge_env_override_does_not_panic() {
        env::set_var("TIMEKEEPER_IDLE_TIMEOUT_SECS", u64::MAX.to_string());

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.tracking.idle_timeout_secs, u64::MAX);
        assert!(config.tracking.idle_timeout() > Duration::zero());

        env::remove_var("TIMEKEEPER_IDLE_TIMEOUT_SECS");
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        env::set_var("TIMEKEEPER_IDLE_TIMEOUT_SECS", "42");
        env::set_var("TIMEKEEPER_TICK_SECS", "not-a-number");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.tracking.idle_timeout_secs, 42);
        assert_eq!(config.tracking.tick_interval_secs, 60);

        env::remove_var("TIMEKEEPER_IDLE_TIMEOUT_SECS");
        env::remove_var("TIMEKEEPER_TICK_SECS");
    }
}
