//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use taskflow_types::{WorkflowError, WorkflowResult};

/// Runtime configuration of a [`WorkflowEngine`](crate::WorkflowEngine)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum consecutive switch evaluations in one advancement
    pub max_switch_hops: usize,

    /// Produce an archive record when an instance completes or fails
    pub archive_terminal: bool,

    /// Record the per-instance audit trail
    pub audit: bool,

    /// Tracing filter used by [`EngineConfig::init_tracing`] when `RUST_LOG`
    /// is unset
    pub default_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_switch_hops: 64,
            archive_terminal: true,
            audit: true,
            default_filter: "info".into(),
        }
    }
}

impl EngineConfig {
    /// Parse configuration from TOML; absent keys keep their defaults
    pub fn from_toml_str(contents: &str) -> WorkflowResult<Self> {
        let config: EngineConfig =
            toml::from_str(contents).map_err(|e| WorkflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> WorkflowResult<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| WorkflowError::Config(format!("{}: {}", path.display(), e)))?;
            Self::from_toml_str(&contents)
        } else {
            Ok(Self::default())
        }
    }

    /// Set the switch hop limit; values below 1 are raised to 1
    pub fn with_max_switch_hops(mut self, hops: usize) -> Self {
        self.max_switch_hops = hops.max(1);
        self
    }

    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    /// Install the global tracing subscriber with this configuration's
    /// filter. Returns false if one was already installed.
    pub fn init_tracing(&self) -> bool {
        crate::telemetry::init_tracing(&self.default_filter)
    }

    pub fn with_archive(mut self, enabled: bool) -> Self {
        self.archive_terminal = enabled;
        self
    }

    pub fn with_audit(mut self, enabled: bool) -> Self {
        self.audit = enabled;
        self
    }

    fn validate(&self) -> WorkflowResult<()> {
        if self.max_switch_hops == 0 {
            return Err(WorkflowError::Config(
                "max_switch_hops must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_switch_hops, 64);
        assert!(config.archive_terminal);
        assert!(config.audit);
        assert_eq!(config.default_filter, "info");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str("max_switch_hops = 8\naudit = false\n").unwrap();
        assert_eq!(config.max_switch_hops, 8);
        assert!(!config.audit);
        assert!(config.archive_terminal);
    }

    #[test]
    fn test_invalid_toml() {
        let result = EngineConfig::from_toml_str("max_switch_hops = \"many\"");
        assert!(matches!(result, Err(WorkflowError::Config(_))));

        let result = EngineConfig::from_toml_str("max_switch_hops = 0");
        assert!(matches!(result, Err(WorkflowError::Config(_))));
    }

    #[test]
    fn test_builder_keeps_hops_valid() {
        let config = EngineConfig::default().with_max_switch_hops(0);
        assert_eq!(config.max_switch_hops, 1);
        assert!(config.validate().is_ok());
        assert_eq!(EngineConfig::default().with_max_switch_hops(5).max_switch_hops, 5);
    }

    #[test]
    fn test_init_tracing_from_config() {
        let config = EngineConfig::default().with_default_filter("taskflow_engine=debug");
        assert_eq!(config.default_filter, "taskflow_engine=debug");
        config.init_tracing();
        assert!(!config.init_tracing());
    }

    #[test]
    fn test_load_missing_config() {
        // Should return default config when file doesn't exist
        let config = EngineConfig::load(Some(Path::new("/nonexistent/taskflow.toml"))).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(EngineConfig::load(None).unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("taskflow-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "archive_terminal = false\ndefault_filter = \"debug\"\n").unwrap();

        let config = EngineConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(!config.archive_terminal);
        assert_eq!(config.default_filter, "debug");
    }
}
