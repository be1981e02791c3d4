use std::fs;
use std::path::{Path, PathBuf};

use dura_durable::RegistryConfig;
use dura_merge::MergeConfig;
use serde::{Deserialize, Serialize};

use crate::error::{RepoError, RepoResult};
use crate::removal::RemovalConfig;

/// Configuration for a whole engine: registry, merge lanes, and layer
/// reclamation.
///
/// Every section is optional in TOML; missing keys take their defaults.
///
/// ```toml
/// data_dir = "/var/lib/dura"
///
/// [registry]
/// max_cache_size = 1000
///
/// [merge]
/// mem_delay_ms = 50
/// disk_delay_ms = 250
/// block_slots_per_merger = 16
/// disk_merge_threshold = 3
///
/// [removal]
/// cleaner_interval_ms = 100
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root for durable records and layer files. `None` keeps everything
    /// in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    pub registry: RegistryConfig,
    pub merge: MergeConfig,
    pub removal: RemovalConfig,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> RepoResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| RepoError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file.
    pub fn load(path: impl AsRef<Path>) -> RepoResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> RepoResult<String> {
        toml::to_string_pretty(self).map_err(|e| RepoError::Config(e.to_string()))
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> RepoResult<()> {
        if self.removal.cleaner_interval_ms == 0 {
            return Err(RepoError::Config(
                "removal.cleaner_interval_ms must be positive".to_string(),
            ));
        }
        if self.merge.disk_merge_threshold < 2 {
            return Err(RepoError::Config(
                "merge.disk_merge_threshold must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory for durable records under `data_dir`.
    pub fn durables_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("durables"))
    }

    /// Directory for layer files under `data_dir`.
    pub fn layers_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join("layers"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.registry.max_cache_size, 1000);
        assert_eq!(config.merge.block_slots_per_merger, 16);
        assert_eq!(config.removal.cleaner_interval_ms, 100);
        assert!(config.durables_dir().is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            data_dir = "/tmp/dura"

            [merge]
            mem_delay_ms = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.merge.mem_delay_ms, 5);
        assert_eq!(config.merge.disk_delay_ms, 250);
        assert_eq!(config.layers_dir(), Some(PathBuf::from("/tmp/dura/layers")));
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = EngineConfig::default();
        config.registry.max_cache_size = 7;
        config.data_dir = Some(PathBuf::from("/data"));
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = EngineConfig::from_toml_str("[removal]\ncleaner_interval_ms = 0").unwrap_err();
        assert!(matches!(err, RepoError::Config(_)));
        assert!(EngineConfig::from_toml_str("[merge]\ndisk_merge_threshold = 1").is_err());
        assert!(EngineConfig::from_toml_str("registry = 3").is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dura.toml");
        fs::write(&path, "[registry]\nmax_cache_size = 2\n").unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap().registry.max_cache_size, 2);
        assert!(matches!(
            EngineConfig::load(dir.path().join("missing.toml")),
            Err(RepoError::Io(_))
        ));
    }
}
