use serde::{Deserialize, Serialize};

/// Tuning for the [`Registry`](crate::Registry).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum number of closed durables kept in memory. Zero disables the
    /// cache, so every closed durable is destroyed once persisted.
    pub max_cache_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 1000,
        }
    }
}

impl RegistryConfig {
    pub fn with_max_cache_size(max_cache_size: usize) -> Self {
        Self { max_cache_size }
    }

    pub fn caching_enabled(&self) -> bool {
        self.max_cache_size > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = RegistryConfig::default();
        assert_eq!(c.max_cache_size, 1000);
        assert!(c.caching_enabled());
        assert!(!RegistryConfig::with_max_cache_size(0).caching_enabled());
    }
}
