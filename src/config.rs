//! Runtime configuration for the anti-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All anti-cache knobs (block size, chain layout, merge mode, devices and the
//! frequency sketch) live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Maximum number of anti-cache devices a registry can hold.
pub const MAX_DEVICES: usize = 8;

/// Default target size of an evicted block in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 100_000;

/// Command-line arguments for the simulator.
#[derive(Parser, Debug, Clone)]
#[command(name = "anticache-sim", about = "Anti-cache eviction and merge simulator")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "anticache.json")]
    pub config: PathBuf,

    /// Number of parent rows to load.
    #[arg(long, default_value_t = 10_000)]
    pub tuples: usize,

    /// Payload size of each row in bytes.
    #[arg(long, default_value_t = 256)]
    pub tuple_size: usize,

    /// Number of eviction rounds to run.
    #[arg(long, default_value_t = 4)]
    pub rounds: usize,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Eviction and merge settings.
    pub anticache: AntiCacheConfig,

    /// Devices registered at startup, in id order.
    pub devices: Vec<DeviceConfig>,

    /// Access-frequency sketch.
    pub sketch: SketchConfig,
}

/// Layout of the per-table LRU chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainKind {
    /// O(1) arbitrary removal.
    #[default]
    Doubly,
    /// One link per tuple; removal scans from the LRU end.
    Singly,
}

/// What a merge brings back when a block is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Every member of the block becomes resident.
    #[default]
    Block,
    /// Only requested tuples become resident; the rest stay evicted.
    Tuple,
}

/// Eviction/merge settings for one partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiCacheConfig {
    /// Partition owning the tables; blocks are tagged with it.
    pub partition_id: u32,

    /// Target block size in bytes.
    pub block_size: usize,

    /// LRU chain layout.
    pub chain: ChainKind,

    /// Merge granularity.
    pub merge_mode: MergeMode,

    /// Migrate blocks when no device has room. `None` enables migration
    /// automatically once more than one device is registered.
    pub migrate: Option<bool>,

    /// Apply zstd compression to encoded blocks.
    pub compress_blocks: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for AntiCacheConfig {
    fn default() -> Self {
        Self {
            partition_id: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            chain: ChainKind::Doubly,
            merge_mode: MergeMode::Block,
            migrate: None,
            compress_blocks: false,
            zstd_level: 3,
        }
    }
}

/// Storage backend behind a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Blocks kept in process memory (NVM-like tier).
    Memory,
    /// One file per block under `path`.
    Disk { path: PathBuf },
}

/// One anti-cache device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Display name.
    pub name: String,

    /// Capacity in bytes.
    pub capacity: u64,

    /// Whether accesses to blocks on this device may be merged inline
    /// without aborting the transaction.
    #[serde(default = "default_blockable")]
    pub blockable: bool,

    /// Storage backend.
    pub backend: BackendConfig,
}

fn default_blockable() -> bool {
    true
}

impl DeviceConfig {
    pub fn memory(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            capacity,
            blockable: true,
            backend: BackendConfig::Memory,
        }
    }

    pub fn disk(name: impl Into<String>, capacity: u64, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            capacity,
            blockable: false,
            backend: BackendConfig::Disk { path: path.into() },
        }
    }
}

/// Count-min sketch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SketchConfig {
    /// Track access frequency and spare hot tuples during eviction.
    pub enabled: bool,

    /// Counters per row (power of two).
    pub width: usize,

    /// Number of hashed rows.
    pub height: usize,

    /// Estimated access count at which a tuple counts as hot.
    pub threshold: u8,

    /// Number of estimates sampled before the threshold is re-derived.
    pub sample_size: usize,
}

impl Default for SketchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            width: 262_144,
            height: 3,
            threshold: 10,
            sample_size: 200,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.devices.len() > MAX_DEVICES {
            anyhow::bail!(
                "{} devices configured, at most {MAX_DEVICES} are supported",
                self.devices.len()
            );
        }
        if self.anticache.block_size == 0 {
            anyhow::bail!("block_size must be positive");
        }
        if !self.sketch.width.is_power_of_two() {
            anyhow::bail!("sketch width {} is not a power of two", self.sketch.width);
        }
        if self.sketch.height == 0 {
            anyhow::bail!("sketch height must be positive");
        }
        Ok(())
    }

    /// Whether migration is on for a registry holding `num_devices` devices.
    pub fn migrate_enabled(&self, num_devices: usize) -> bool {
        self.anticache.migrate.unwrap_or(num_devices > 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.anticache.block_size, 100_000);
        assert_eq!(cfg.anticache.chain, ChainKind::Doubly);
        assert_eq!(cfg.sketch.width, 262_144);
        assert_eq!(cfg.sketch.height, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "anticache": { "block_size": 4096, "merge_mode": "tuple", "chain": "singly" },
            "devices": [
                { "name": "nvm", "capacity": 1048576, "backend": { "type": "memory" } },
                { "name": "ssd", "capacity": 8388608, "blockable": false,
                  "backend": { "type": "disk", "path": "/tmp/ac" } }
            ],
            "sketch": { "enabled": true }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.anticache.block_size, 4096);
        assert_eq!(cfg.anticache.merge_mode, MergeMode::Tuple);
        assert_eq!(cfg.anticache.chain, ChainKind::Singly);
        assert!(cfg.devices[0].blockable);
        assert!(!cfg.devices[1].blockable);
        assert_eq!(
            cfg.devices[1].backend,
            BackendConfig::Disk {
                path: PathBuf::from("/tmp/ac")
            }
        );
        assert!(cfg.sketch.enabled);
        assert_eq!(cfg.sketch.sample_size, 200);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.devices = (0..9).map(|i| DeviceConfig::memory(format!("d{i}"), 1024)).collect();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.sketch.width = 1000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_migrate_auto() {
        let cfg = Config::default();
        assert!(!cfg.migrate_enabled(1));
        assert!(cfg.migrate_enabled(2));

        let mut cfg = Config::default();
        cfg.anticache.migrate = Some(false);
        assert!(!cfg.migrate_enabled(4));
    }
}
