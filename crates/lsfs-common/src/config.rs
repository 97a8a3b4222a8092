//! Configuration types for lsfs
//!
//! The atime file is configured once, when the filesystem instance is set
//! up. Its block size must never change for the lifetime of the file.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest supported metadata block size
pub const MIN_BLOCK_SIZE: usize = 512;

/// Largest supported metadata block size
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;

/// Configuration of the access-time attribute file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtimeConfig {
    /// Backing file; `None` keeps access times inline (bypass mode)
    pub path: Option<PathBuf>,
    /// Metadata block size in bytes (default: 4 KB)
    pub block_size: usize,
    /// Number of clean blocks kept resident in the block cache
    pub cache_blocks: usize,
    /// Dirty the block on every fill, even when the entry already existed
    pub mark_dirty_on_fill: bool,
}

impl Default for AtimeConfig {
    fn default() -> Self {
        Self {
            path: None,
            block_size: 4096,
            cache_blocks: 256,
            mark_dirty_on_fill: true,
        }
    }
}

impl AtimeConfig {
    /// Create a config backed by the given file
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Whether an atime file is configured at all
    #[must_use]
    pub const fn is_bypass(&self) -> bool {
        self.path.is_none()
    }

    /// Check the configuration for values the atime file cannot use
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(Error::configuration(format!(
                "block size {} must be a power of two between {} and {}",
                self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        if self.cache_blocks == 0 {
            return Err(Error::configuration("cache_blocks must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AtimeConfig::default();
        assert!(config.is_bypass());
        assert_eq!(config.block_size, 4096);
        assert!(config.mark_dirty_on_fill);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_block_sizes() {
        for block_size in [0, 256, 1000, 4097, 128 * 1024] {
            let config = AtimeConfig {
                block_size,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "block size {block_size}");
        }

        let config = AtimeConfig {
            cache_blocks: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: AtimeConfig = toml::from_str(
            r#"
            path = "/var/lib/lsfs/atime"
            block_size = 512
            "#,
        )
        .unwrap();

        assert_eq!(config.path, Some(PathBuf::from("/var/lib/lsfs/atime")));
        assert_eq!(config.block_size, 512);
        assert_eq!(config.cache_blocks, 256);
        assert!(!config.is_bypass());
    }
}
