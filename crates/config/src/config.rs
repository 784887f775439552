//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),
    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

const DEFAULT_ROOT: &str = "/var/lib/rendition-ladder";

fn default_staging_dir() -> PathBuf {
    Path::new(DEFAULT_ROOT).join("staging")
}

fn default_working_dir() -> PathBuf {
    Path::new(DEFAULT_ROOT).join("encode")
}

fn default_output_dir() -> PathBuf {
    Path::new(DEFAULT_ROOT).join("videos")
}

fn default_state_dir() -> PathBuf {
    Path::new(DEFAULT_ROOT).join("renditions")
}

fn default_stale_after_secs() -> u64 {
    86_400
}

/// Where uploads, encoder output, finished renditions and their records live
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Temporary area the uploaded source is written to
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Area the encoder writes renditions into before relocation
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Durable destination for finished renditions
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Directory holding one metadata record per rendition
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Leftover temp files older than this are swept at startup
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            working_dir: default_working_dir(),
            output_dir: default_output_dir(),
            state_dir: default_state_dir(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_timeout_secs() -> u64 {
    6 * 60 * 60
}

fn default_probe_timeout_secs() -> u64 {
    60
}

/// External tool locations and time limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Upper bound for a single rendition encode
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            timeout_secs: default_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

/// Tier worker-pool sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConcurrencyConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Maximum tier encodes in flight (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_tiers: u32,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub encode: EncodeConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - LADDER_STAGING_DIR -> storage.staging_dir
    /// - LADDER_WORKING_DIR -> storage.working_dir
    /// - LADDER_OUTPUT_DIR -> storage.output_dir
    /// - LADDER_STATE_DIR -> storage.state_dir
    /// - LADDER_FFMPEG_PATH -> encode.ffmpeg_path
    /// - LADDER_FFPROBE_PATH -> encode.ffprobe_path
    /// - LADDER_ENCODE_TIMEOUT_SECS -> encode.timeout_secs
    /// - LADDER_LOGICAL_CORES -> concurrency.logical_cores
    /// - LADDER_MAX_CONCURRENT_TIERS -> concurrency.max_concurrent_tiers
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("LADDER_STAGING_DIR") {
            self.storage.staging_dir = PathBuf::from(val);
        }
        if let Ok(val) = env::var("LADDER_WORKING_DIR") {
            self.storage.working_dir = PathBuf::from(val);
        }
        if let Ok(val) = env::var("LADDER_OUTPUT_DIR") {
            self.storage.output_dir = PathBuf::from(val);
        }
        if let Ok(val) = env::var("LADDER_STATE_DIR") {
            self.storage.state_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("LADDER_FFMPEG_PATH") {
            self.encode.ffmpeg_path = val;
        }
        if let Ok(val) = env::var("LADDER_FFPROBE_PATH") {
            self.encode.ffprobe_path = val;
        }
        if let Ok(val) = env::var("LADDER_ENCODE_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.encode.timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("LADDER_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.concurrency.logical_cores = Some(cores);
            }
        }
        if let Ok(val) = env::var("LADDER_MAX_CONCURRENT_TIERS") {
            if let Ok(tiers) = val.parse::<u32>() {
                self.concurrency.max_concurrent_tiers = tiers;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file means "all defaults"
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = match Self::load_from_file(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e),
        };
        config.apply_env_overrides();
        Ok(config)
    }
}
