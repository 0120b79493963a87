//! # Memory Layout Configuration
//!
//! The whole memory hierarchy can be described in TOML and built in one
//! call with [`crate::GlobalMemory::from_config`]. Loaded once at startup.
//!
//! ```toml
//! failure_policy = "log"
//!
//! [engine]
//! engine_bytes = 1048576
//! permanent_bytes = 524288
//! scratch_bytes = 65536
//!
//! [[areas]]
//! name = "Game"
//! size = 4194304
//! scratch = 262144
//!
//! [[areas.sub_areas]]
//! name = "Level"
//! size = 2097152
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::global::ENGINE_AREA;
use crate::report::{self, FailurePolicy, PolicyGuard};

/// Errors raised while loading or validating a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read memory config {path}: {source}")]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The TOML is malformed or does not match the schema.
    #[error("malformed memory config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The layout is well-formed but cannot be built.
    #[error("invalid memory config: {0}")]
    Invalid(String),
}

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// The whole memory hierarchy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// What reported failures do on the building thread.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Sizes of the engine area.
    pub engine: EngineMemoryConfig,
    /// Application areas, registered in order.
    #[serde(default)]
    pub areas: Vec<AreaConfig>,
}

/// Sizes of the engine area.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMemoryConfig {
    /// Engine area size, excluding scratch.
    pub engine_bytes: usize,
    /// Part of `engine_bytes` reserved for the permanent sub-area.
    pub permanent_bytes: usize,
    /// Scratch sub-area carved on top of `engine_bytes`.
    #[serde(default)]
    pub scratch_bytes: usize,
}

/// One application memory area.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AreaConfig {
    /// Area name, unique in the registry.
    pub name: String,
    /// Bytes available to `sub_areas`.
    pub size: usize,
    /// Scratch sub-area carved on top of `size`.
    #[serde(default)]
    pub scratch: usize,
    /// Sub-areas carved in order right after init.
    #[serde(default)]
    pub sub_areas: Vec<SubAreaConfig>,
}

/// One named sub-area.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubAreaConfig {
    /// Sub-area name, unique in its area.
    pub name: String,
    /// Size in bytes.
    pub size: usize,
}

impl MemoryConfig {
    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Reads, parses and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns I/O, parse and validation errors.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        config.validate()?;
        tracing::info!("memory config loaded from {}", path.display());
        Ok(config)
    }

    /// Switches this thread to the configured failure policy until the
    /// guard drops.
    pub fn scoped_failure_policy(&self) -> PolicyGuard {
        report::scoped_policy(self.failure_policy)
    }

    /// Checks that every size fits and every name is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first problem.
    pub fn validate(&self) -> ConfigResult<()> {
        let engine = &self.engine;
        if engine.engine_bytes.saturating_add(engine.scratch_bytes) == 0 {
            return Err(invalid("engine area has no memory"));
        }
        if engine.permanent_bytes > engine.engine_bytes {
            return Err(invalid(format!(
                "permanent_bytes ({}) exceed engine_bytes ({})",
                engine.permanent_bytes, engine.engine_bytes
            )));
        }

        let mut area_names = HashSet::new();
        for area in &self.areas {
            if area.name.is_empty() {
                return Err(invalid("memory area with an empty name"));
            }
            if area.name == ENGINE_AREA || !area_names.insert(area.name.as_str()) {
                return Err(invalid(format!("duplicate memory area '{}'", area.name)));
            }
            if area.size.saturating_add(area.scratch) == 0 {
                return Err(invalid(format!("memory area '{}' has no memory", area.name)));
            }
            validate_sub_areas(area)?;
        }
        Ok(())
    }
}

fn validate_sub_areas(area: &AreaConfig) -> ConfigResult<()> {
    let mut names = HashSet::new();
    let mut total: usize = 0;
    for sub_area in &area.sub_areas {
        if sub_area.name.is_empty() || sub_area.size == 0 {
            return Err(invalid(format!(
                "memory area '{}' has an unnamed or empty sub-area",
                area.name
            )));
        }
        if !names.insert(sub_area.name.as_str()) {
            return Err(invalid(format!(
                "memory area '{}' has duplicate sub-area '{}'",
                area.name, sub_area.name
            )));
        }
        total = total.saturating_add(sub_area.size);
    }
    if total > area.size {
        return Err(invalid(format!(
            "memory area '{}': sub-areas need {} bytes, only {} configured",
            area.name, total, area.size
        )));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: &str = r#"
        failure_policy = "log"

        [engine]
        engine_bytes = 65536
        permanent_bytes = 32768
        scratch_bytes = 4096

        [[areas]]
        name = "Game"
        size = 8192

        [[areas.sub_areas]]
        name = "Level"
        size = 4096

        [[areas.sub_areas]]
        name = "Entities"
        size = 4096
    "#;

    #[test]
    fn test_parse_layout() {
        let config = MemoryConfig::from_toml_str(LAYOUT).unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::Log);
        assert_eq!(config.engine.scratch_bytes, 4096);
        assert_eq!(config.areas[0].sub_areas.len(), 2);
        assert_eq!(config.areas[0].scratch, 0);
        config.validate().unwrap();
    }

    #[test]
    fn test_overcommitted_area_is_invalid() {
        let mut config = MemoryConfig::from_toml_str(LAYOUT).unwrap();
        config.areas[0].size = 4096;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_duplicate_names_are_invalid() {
        let mut config = MemoryConfig::from_toml_str(LAYOUT).unwrap();
        config.areas.push(config.areas[0].clone());
        assert!(config.validate().is_err());

        config.areas.truncate(1);
        config.areas[0].sub_areas[1].name = "Level".to_owned();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_permanent_must_fit_engine() {
        let mut config = MemoryConfig::from_toml_str(LAYOUT).unwrap();
        config.engine.permanent_bytes = config.engine.engine_bytes + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            MemoryConfig::from_toml_str("[engine]\nengine_bytes = \"lots\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = MemoryConfig::load("/definitely/not/here/memory.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
