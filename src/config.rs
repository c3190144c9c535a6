//! Configuration management for matconv-emu.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (MATCONV_CLUSTERS, etc.)
//! 2. Project-local config file (`./matconv-emu.toml`)
//! 3. User config file (`~/.config/matconv-emu/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # matconv-emu.toml
//!
//! # Number of compute clusters sharing the eight pixel groups
//! n_clusters = 2
//!
//! # Compute ticks run for every bus packet
//! compute_ticks_per_packet = 4
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::device::protocol::PACKET_BYTES;

/// Largest kernel the register layout can describe.
pub const KERNEL_DIM_LIMIT: u16 = 15;

/// Errors from validating an accelerator configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("n_clusters must be 1, 2, 4 or 8 (got {0})")]
    InvalidClusters(usize),

    #[error("max_kernel_dim must be odd and at most {} (got {})", KERNEL_DIM_LIMIT, .0)]
    InvalidKernelDim(u16),

    #[error("cores_per_cluster must be at least {needed} (got {got})")]
    NotEnoughCores { needed: usize, got: usize },

    #[error("max_subject_cols must be a non-zero multiple of {} (got {})", PACKET_BYTES, .0)]
    InvalidSubjectCols(u16),

    #[error("compute_ticks_per_packet must be at least 2 (got {0})")]
    TooFewTicks(u32),

    #[error("cluster groups {start}..{end} run past the end of a packet")]
    GroupRange { start: usize, end: usize },

    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

/// Resolved accelerator parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceleratorConfig {
    /// Clusters sharing the eight pixel groups of a packet.
    pub n_clusters: usize,
    /// Cores per cluster; each (group, kernel row) pair needs one.
    pub cores_per_cluster: usize,
    /// Largest accepted kernel dimension.
    pub max_kernel_dim: u16,
    /// Widest accepted subject.
    pub max_subject_cols: u16,
    /// Compute ticks run for every bus packet.
    pub compute_ticks_per_packet: u32,
    /// Depth of the bus input FIFO.
    pub fifo_depth: usize,
    /// Cycles the host waits for an interrupt before giving up.
    pub max_wait_cycles: u64,
}

impl AcceleratorConfig {
    /// Pixel groups owned by each cluster.
    pub fn groups_per_cluster(&self) -> usize {
        PACKET_BYTES / self.n_clusters.max(1)
    }

    /// Check the parameters for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.n_clusters, 1 | 2 | 4 | 8) {
            return Err(ConfigError::InvalidClusters(self.n_clusters));
        }
        if self.max_kernel_dim & 1 == 0 || self.max_kernel_dim > KERNEL_DIM_LIMIT {
            return Err(ConfigError::InvalidKernelDim(self.max_kernel_dim));
        }

        let needed = self.groups_per_cluster() * self.max_kernel_dim as usize;
        if self.cores_per_cluster < needed {
            return Err(ConfigError::NotEnoughCores {
                needed,
                got: self.cores_per_cluster,
            });
        }

        if self.max_subject_cols == 0 || self.max_subject_cols as usize % PACKET_BYTES != 0 {
            return Err(ConfigError::InvalidSubjectCols(self.max_subject_cols));
        }
        if self.compute_ticks_per_packet < 2 {
            return Err(ConfigError::TooFewTicks(self.compute_ticks_per_packet));
        }
        if self.fifo_depth == 0 {
            return Err(ConfigError::Zero("fifo_depth"));
        }
        if self.max_wait_cycles == 0 {
            return Err(ConfigError::Zero("max_wait_cycles"));
        }
        Ok(())
    }
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            n_clusters: 2,
            cores_per_cluster: 28,
            max_kernel_dim: 7,
            max_subject_cols: 1920,
            compute_ticks_per_packet: 4,
            fifo_depth: 16,
            max_wait_cycles: 1_000_000,
        }
    }
}

/// matconv-emu configuration as read from files and the environment.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub n_clusters: Option<usize>,
    pub cores_per_cluster: Option<usize>,
    pub max_kernel_dim: Option<u16>,
    pub max_subject_cols: Option<u16>,
    pub compute_ticks_per_packet: Option<u32>,
    pub fifo_depth: Option<usize>,
    pub max_wait_cycles: Option<u64>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `matconv-emu.toml`
    /// 3. User config `~/.config/matconv-emu/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        config.apply_env_overrides();

        log::debug!("Loaded configuration: {:?}", config);
        config
    }

    /// Resolve the accelerator parameters, filling unset fields with
    /// defaults.
    pub fn accelerator(&self) -> AcceleratorConfig {
        let d = AcceleratorConfig::default();
        AcceleratorConfig {
            n_clusters: self.n_clusters.unwrap_or(d.n_clusters),
            cores_per_cluster: self.cores_per_cluster.unwrap_or(d.cores_per_cluster),
            max_kernel_dim: self.max_kernel_dim.unwrap_or(d.max_kernel_dim),
            max_subject_cols: self.max_subject_cols.unwrap_or(d.max_subject_cols),
            compute_ticks_per_packet: self
                .compute_ticks_per_packet
                .unwrap_or(d.compute_ticks_per_packet),
            fifo_depth: self.fifo_depth.unwrap_or(d.fifo_depth),
            max_wait_cycles: self.max_wait_cycles.unwrap_or(d.max_wait_cycles),
        }
    }

    /// Load user configuration from ~/.config/matconv-emu/config.toml
    fn load_user_config() -> Option<Self> {
        let config_path = Self::user_config_path()?;
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./matconv-emu.toml
    fn load_local_config() -> Option<Self> {
        let local_path = Path::new("matconv-emu.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("matconv-emu.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.n_clusters.is_some() {
            self.n_clusters = other.n_clusters;
        }
        if other.cores_per_cluster.is_some() {
            self.cores_per_cluster = other.cores_per_cluster;
        }
        if other.max_kernel_dim.is_some() {
            self.max_kernel_dim = other.max_kernel_dim;
        }
        if other.max_subject_cols.is_some() {
            self.max_subject_cols = other.max_subject_cols;
        }
        if other.compute_ticks_per_packet.is_some() {
            self.compute_ticks_per_packet = other.compute_ticks_per_packet;
        }
        if other.fifo_depth.is_some() {
            self.fifo_depth = other.fifo_depth;
        }
        if other.max_wait_cycles.is_some() {
            self.max_wait_cycles = other.max_wait_cycles;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_number("MATCONV_CLUSTERS") {
            self.n_clusters = Some(v);
        }
        if let Some(v) = env_number("MATCONV_CORES_PER_CLUSTER") {
            self.cores_per_cluster = Some(v);
        }
        if let Some(v) = env_number("MATCONV_TICKS_PER_PACKET") {
            self.compute_ticks_per_packet = Some(v);
        }
        if let Some(v) = env_number("MATCONV_MAX_WAIT_CYCLES") {
            self.max_wait_cycles = Some(v);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("matconv-emu").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# matconv-emu configuration
# Place this file at ~/.config/matconv-emu/config.toml or ./matconv-emu.toml

# Clusters sharing the eight pixel groups of a packet (1, 2, 4 or 8)
n_clusters = 2

# Cores per cluster, at least (8 / n_clusters) * max_kernel_dim
cores_per_cluster = 28

# Largest accepted kernel (odd, at most 15)
max_kernel_dim = 7

# Widest accepted subject (multiple of 8)
# max_subject_cols = 1920

# Compute ticks run for every bus packet (at least 2)
# compute_ticks_per_packet = 4

# Bus input FIFO depth
# fifo_depth = 16

# Cycles the host waits for an interrupt
# max_wait_cycles = 1000000
"#
        .to_string()
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => {
            log::info!("Using {} from environment: {}", name, raw);
            Some(v)
        }
        Err(_) => {
            log::warn!("Ignoring {}: '{}' is not a number", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default().accelerator();
        assert_eq!(config, AcceleratorConfig::default());
        assert_eq!(config.groups_per_cluster(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_merge() {
        let mut base = Config {
            n_clusters: Some(4),
            fifo_depth: Some(8),
            ..Config::default()
        };

        let overlay = Config {
            n_clusters: None,
            max_kernel_dim: Some(5),
            fifo_depth: Some(32),
            ..Config::default()
        };

        base.merge(overlay);

        assert_eq!(base.n_clusters, Some(4));
        assert_eq!(base.max_kernel_dim, Some(5));
        assert_eq!(base.fifo_depth, Some(32));
        assert_eq!(base.cores_per_cluster, None);
    }

    #[test]
    fn test_validation_errors() {
        let ok = AcceleratorConfig::default();

        let c = AcceleratorConfig { n_clusters: 3, ..ok };
        assert_eq!(c.validate(), Err(ConfigError::InvalidClusters(3)));

        let c = AcceleratorConfig { max_kernel_dim: 6, ..ok };
        assert_eq!(c.validate(), Err(ConfigError::InvalidKernelDim(6)));

        let c = AcceleratorConfig { max_kernel_dim: 17, ..ok };
        assert_eq!(c.validate(), Err(ConfigError::InvalidKernelDim(17)));

        let c = AcceleratorConfig { cores_per_cluster: 27, ..ok };
        assert_eq!(
            c.validate(),
            Err(ConfigError::NotEnoughCores { needed: 28, got: 27 })
        );

        let c = AcceleratorConfig { max_subject_cols: 1921, ..ok };
        assert_eq!(c.validate(), Err(ConfigError::InvalidSubjectCols(1921)));

        let c = AcceleratorConfig { compute_ticks_per_packet: 1, ..ok };
        assert_eq!(c.validate(), Err(ConfigError::TooFewTicks(1)));

        let c = AcceleratorConfig { fifo_depth: 0, ..ok };
        assert_eq!(c.validate(), Err(ConfigError::Zero("fifo_depth")));
    }

    #[test]
    fn test_more_clusters_need_fewer_cores() {
        let c = AcceleratorConfig {
            n_clusters: 8,
            cores_per_cluster: 7,
            ..AcceleratorConfig::default()
        };
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = Config::sample_config();
        let config: Config = toml::from_str(&sample).expect("Sample config should parse");
        assert_eq!(config.n_clusters, Some(2));
        assert!(config.accelerator().validate().is_ok());
    }
}
