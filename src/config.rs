//! Data store configuration
//!
//! Loaded from TOML, with environment variables taking precedence:
//!
//! ```toml
//! offset_bits = 22
//! num_buffers = 1024
//! min_arrays = 1024
//! enable_free_lists = true
//!
//! [compaction]
//! max_dead_bytes_ratio = 0.05
//! max_buffers = 1
//! ```

use crate::datastore::{CompactionStrategy, RefLayout};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Buffer slots created when `num_buffers` is not set, at most
pub const DEFAULT_MAX_NUM_BUFFERS: u32 = 1 << 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataStoreConfig {
    /// Bits of an entry ref used for the offset; the rest select the buffer
    pub offset_bits: u32,
    /// Buffer slots; defaults to what the layout addresses, capped at
    /// [`DEFAULT_MAX_NUM_BUFFERS`]
    pub num_buffers: Option<u32>,
    /// Arrays per buffer; defaults to the layout's offset size
    pub max_arrays: Option<usize>,
    /// Minimum arrays in a new buffer
    pub min_arrays: usize,
    pub enable_free_lists: bool,
    pub compaction: CompactionStrategy,
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self {
            offset_bits: RefLayout::DEFAULT_OFFSET_BITS,
            num_buffers: None,
            max_arrays: None,
            min_arrays: 1024,
            enable_free_lists: true,
            compaction: CompactionStrategy::default(),
        }
    }
}

impl DataStoreConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    /// Apply `PHOTON_DATASTORE_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid value for {}: {:?}", key, value)))
        }

        if let Some(v) = lookup("PHOTON_DATASTORE_OFFSET_BITS") {
            self.offset_bits = parse("PHOTON_DATASTORE_OFFSET_BITS", &v)?;
        }
        if let Some(v) = lookup("PHOTON_DATASTORE_NUM_BUFFERS") {
            self.num_buffers = Some(parse("PHOTON_DATASTORE_NUM_BUFFERS", &v)?);
        }
        if let Some(v) = lookup("PHOTON_DATASTORE_MAX_ARRAYS") {
            self.max_arrays = Some(parse("PHOTON_DATASTORE_MAX_ARRAYS", &v)?);
        }
        if let Some(v) = lookup("PHOTON_DATASTORE_FREE_LISTS") {
            self.enable_free_lists = parse("PHOTON_DATASTORE_FREE_LISTS", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn layout(&self) -> Result<RefLayout> {
        RefLayout::new(self.offset_bits).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn effective_num_buffers(&self) -> u32 {
        let addressable = 1u64 << (32 - self.offset_bits.clamp(1, 31));
        self.num_buffers
            .unwrap_or(addressable.min(DEFAULT_MAX_NUM_BUFFERS as u64) as u32)
    }

    pub fn effective_max_arrays(&self) -> usize {
        self.max_arrays
            .unwrap_or(1usize << self.offset_bits.clamp(1, 31))
    }

    pub fn validate(&self) -> Result<()> {
        let layout = self.layout()?;
        let num_buffers = self.effective_num_buffers();
        if num_buffers == 0 || num_buffers > layout.num_buffers() {
            return Err(Error::Config(format!(
                "num_buffers {} outside 1..={} for {} offset bits",
                num_buffers,
                layout.num_buffers(),
                self.offset_bits
            )));
        }
        let max_arrays = self.effective_max_arrays();
        if max_arrays == 0 || max_arrays > layout.offset_size() {
            return Err(Error::Config(format!(
                "max_arrays {} outside 1..={} for {} offset bits",
                max_arrays,
                layout.offset_size(),
                self.offset_bits
            )));
        }
        if self.min_arrays == 0 {
            return Err(Error::Config("min_arrays must be positive".to_string()));
        }
        let c = &self.compaction;
        if !(0.0..=1.0).contains(&c.active_buffers_ratio) {
            return Err(Error::Config(format!(
                "compaction.active_buffers_ratio {} outside 0..=1",
                c.active_buffers_ratio
            )));
        }
        if c.max_dead_bytes_ratio < 0.0 || c.max_dead_address_space_ratio < 0.0 {
            return Err(Error::Config("compaction ratios must not be negative".to_string()));
        }
        Ok(())
    }
}
