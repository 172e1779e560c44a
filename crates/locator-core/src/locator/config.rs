use serde::{Deserialize, Serialize};

use crate::offset::searcher::constants::{DEFAULT_REPLICATES, MAX_STRING_LEN, MIN_POOL_SIZE};
use crate::sample::Storage;

/// Configuration for a [`Locator`](super::Locator)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    /// Replicates per (storage, format) combination in a verification pool
    pub replicates: u8,
    /// Fewest samples a chain must be verified on
    pub min_pool_size: usize,
    /// Upper bound for string reads, in bytes
    pub max_string_len: usize,
    /// Storage axis of the verification pool
    pub storages: Vec<Storage>,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            replicates: DEFAULT_REPLICATES,
            min_pool_size: MIN_POOL_SIZE,
            max_string_len: MAX_STRING_LEN,
            storages: vec![Storage::File, Storage::Memory],
        }
    }
}

impl LocatorConfig {
    /// Create a new configuration builder
    pub fn builder() -> LocatorConfigBuilder {
        LocatorConfigBuilder::default()
    }
}

/// Builder for LocatorConfig
#[derive(Debug, Clone, Default)]
pub struct LocatorConfigBuilder {
    replicates: Option<u8>,
    min_pool_size: Option<usize>,
    max_string_len: Option<usize>,
    storages: Option<Vec<Storage>>,
}

impl LocatorConfigBuilder {
    pub fn replicates(mut self, replicates: u8) -> Self {
        self.replicates = Some(replicates);
        self
    }

    pub fn min_pool_size(mut self, size: usize) -> Self {
        self.min_pool_size = Some(size);
        self
    }

    pub fn max_string_len(mut self, len: usize) -> Self {
        self.max_string_len = Some(len);
        self
    }

    pub fn storages(mut self, storages: impl Into<Vec<Storage>>) -> Self {
        self.storages = Some(storages.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> LocatorConfig {
        let default = LocatorConfig::default();
        LocatorConfig {
            replicates: self.replicates.unwrap_or(default.replicates),
            min_pool_size: self.min_pool_size.unwrap_or(default.min_pool_size),
            max_string_len: self.max_string_len.unwrap_or(default.max_string_len),
            storages: self.storages.unwrap_or(default.storages),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = LocatorConfig::builder()
            .replicates(3)
            .storages([Storage::Memory])
            .build();
        assert_eq!(config.replicates, 3);
        assert_eq!(config.storages, vec![Storage::Memory]);
        assert_eq!(config.min_pool_size, MIN_POOL_SIZE);
        assert_eq!(config.max_string_len, MAX_STRING_LEN);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: LocatorConfig = serde_json::from_str(r#"{"replicates":2}"#).unwrap();
        assert_eq!(config.replicates, 2);
        assert_eq!(config.storages, vec![Storage::File, Storage::Memory]);
    }
}
