//! Configuration for nvkv
//!
//! Centralized configuration with sensible defaults.

use serde::{Deserialize, Serialize};

/// Main configuration for a store instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Key/Value Limits
    // -------------------------------------------------------------------------
    /// Longest accepted key name, in bytes (at most 255)
    pub max_key_len: usize,

    /// Largest accepted value, in bytes
    pub max_value_len: usize,

    // -------------------------------------------------------------------------
    // Arena Configuration
    // -------------------------------------------------------------------------
    /// Most bytes the in-memory arena may grow to; growth beyond this is
    /// reported as out of memory
    pub arena_limit: usize,

    // -------------------------------------------------------------------------
    // Journal Configuration
    // -------------------------------------------------------------------------
    /// Number of rotating slots used when formatting a device
    pub slot_count: u32,

    /// Format the device on initialize if no journal header is found
    pub auto_format: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_key_len: 220,
            max_value_len: 64 * 1024,  // 64 KB
            arena_limit: 256 * 1024,   // 256 KB
            slot_count: 4,
            auto_format: true,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the maximum key length (clamped to 255, the header field width)
    pub fn max_key_len(mut self, len: usize) -> Self {
        self.config.max_key_len = len.min(u8::MAX as usize);
        self
    }

    /// Set the maximum value length (clamped to `u32::MAX`)
    pub fn max_value_len(mut self, len: usize) -> Self {
        self.config.max_value_len = len.min(u32::MAX as usize);
        self
    }

    /// Set the arena size limit (in bytes)
    pub fn arena_limit(mut self, bytes: usize) -> Self {
        self.config.arena_limit = bytes;
        self
    }

    /// Set the number of journal slots used when formatting
    pub fn slot_count(mut self, count: u32) -> Self {
        self.config.slot_count = count;
        self
    }

    /// Enable or disable formatting a blank device on initialize
    pub fn auto_format(mut self, enabled: bool) -> Self {
        self.config.auto_format = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
