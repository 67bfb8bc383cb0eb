//! Runtime Configuration
//!
//! Settings for the actor system, the mailbox index policy and the
//! growth/shrink scenario. Every field has a default, so an empty TOML file
//! is a valid configuration.
//!
//! ```toml
//! [system]
//! name = "mbox-growth"
//!
//! [mailbox]
//! compact_limit = 8
//! low_water_divisor = 4
//!
//! [scenario]
//! iterations = 5
//! max_live_groups = 16
//! initial_group_size = 1
//! time_limit_secs = 240
//! ```
//!
//! [`RuntimeConfig::load`] layers `MBOX_`-prefixed environment variables on
//! top of the file, using `__` between nested keys
//! (`MBOX_SCENARIO__ITERATIONS=3`).

use crate::error::{ActorError, Result};
use crate::subscription::IndexPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "MBOX";

/// Upper bound on actors alive at the peak of one iteration
pub const MAX_PEAK_ACTORS: usize = 1 << 20;

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub system: SystemSettings,
    pub mailbox: IndexPolicy,
    pub scenario: ScenarioSettings,
}

/// Actor system identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSettings {
    /// Prefix of the generated system id
    pub name: String,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            name: "mbox-growth".to_string(),
        }
    }
}

/// Growth/shrink scenario parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioSettings {
    /// Full grow/shrink cycles to run
    pub iterations: u32,
    /// Live groups at the top of each cycle
    pub max_live_groups: usize,
    /// Member count of the first group; each following group doubles it
    pub initial_group_size: usize,
    /// Watchdog limit applied by the binary
    pub time_limit_secs: u64,
}

impl Default for ScenarioSettings {
    fn default() -> Self {
        Self {
            iterations: 5,
            max_live_groups: 16,
            initial_group_size: 1,
            time_limit_secs: 240,
        }
    }
}

impl ScenarioSettings {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }

    /// Size of the `index`-th group of an iteration (0-based)
    pub fn group_size(&self, index: usize) -> Option<usize> {
        let factor = 1usize.checked_shl(u32::try_from(index).ok()?)?;
        self.initial_group_size.checked_mul(factor)
    }

    /// Responders alive when all `max_live_groups` groups exist
    pub fn peak_actors(&self) -> Option<usize> {
        (0..self.max_live_groups).try_fold(0usize, |total, index| {
            total.checked_add(self.group_size(index)?)
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 {
            return Err(ActorError::config("scenario.iterations must be at least 1"));
        }
        if self.max_live_groups == 0 {
            return Err(ActorError::config("scenario.max_live_groups must be at least 1"));
        }
        if self.initial_group_size == 0 {
            return Err(ActorError::config(
                "scenario.initial_group_size must be at least 1",
            ));
        }
        if self.time_limit_secs == 0 {
            return Err(ActorError::config("scenario.time_limit_secs must be at least 1"));
        }
        match self.peak_actors() {
            Some(peak) if peak <= MAX_PEAK_ACTORS => Ok(()),
            _ => Err(ActorError::config(format!(
                "scenario would need more than {} live actors ({} groups starting at {})",
                MAX_PEAK_ACTORS, self.max_live_groups, self.initial_group_size
            ))),
        }
    }
}

impl RuntimeConfig {
    /// Load from a TOML file without environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ActorError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&contents)?;
        info!(path = %path.display(), "Loaded runtime configuration");
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| ActorError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional TOML file and `MBOX_` environment variables over
    /// the defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            debug!(path = %path.display(), "Adding configuration file");
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| ActorError::config(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;

        info!(
            iterations = config.scenario.iterations,
            max_live_groups = config.scenario.max_live_groups,
            compact_limit = config.mailbox.compact_limit,
            "Runtime configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.system.name.trim().is_empty() {
            return Err(ActorError::config("system.name must not be empty"));
        }
        self.mailbox.validate()?;
        self.scenario.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.system.name, "mbox-growth");
        assert_eq!(config.mailbox, IndexPolicy::default());
        assert_eq!(config.scenario.iterations, 5);
        assert_eq!(config.scenario.max_live_groups, 16);
        assert_eq!(config.scenario.peak_actors(), Some(65_535));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [scenario]
            iterations = 2
            max_live_groups = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.scenario.iterations, 2);
        assert_eq!(config.scenario.max_live_groups, 3);
        assert_eq!(config.scenario.initial_group_size, 1);
        assert_eq!(config.mailbox.compact_limit, 8);
        assert_eq!(config.scenario.peak_actors(), Some(7));
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            "[scenario]\niterations = 0",
            "[scenario]\nmax_live_groups = 0",
            "[scenario]\ninitial_group_size = 0",
            "[scenario]\nmax_live_groups = 64",
            "[mailbox]\nlow_water_divisor = 1",
            "[system]\nname = \"  \"",
        ];
        for case in cases {
            let err = RuntimeConfig::from_toml_str(case).unwrap_err();
            assert_eq!(err.category(), "config", "case: {}", case);
        }

        let err = RuntimeConfig::from_toml_str("[scenario]\niterations = \"many\"").unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_group_sizes_double() {
        let settings = ScenarioSettings {
            initial_group_size: 3,
            ..ScenarioSettings::default()
        };
        assert_eq!(settings.group_size(0), Some(3));
        assert_eq!(settings.group_size(1), Some(6));
        assert_eq!(settings.group_size(4), Some(48));
        assert_eq!(settings.group_size(200), None);
    }

    #[test]
    fn test_from_file_and_environment_layering() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[scenario]\niterations = 4\nmax_live_groups = 6").unwrap();

        let from_file = RuntimeConfig::from_file(file.path()).unwrap();
        assert_eq!(from_file.scenario.iterations, 4);

        // Only this test touches MBOX_ variables
        std::env::set_var("MBOX_SCENARIO__MAX_LIVE_GROUPS", "5");
        let layered = RuntimeConfig::load(Some(file.path()));
        std::env::remove_var("MBOX_SCENARIO__MAX_LIVE_GROUPS");
        let layered = layered.unwrap();

        assert_eq!(layered.scenario.iterations, 4);
        assert_eq!(layered.scenario.max_live_groups, 5);
        assert_eq!(layered.mailbox.low_water_divisor, 4);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = RuntimeConfig::from_file("/nonexistent/mbox_growth.toml").unwrap_err();
        assert!(matches!(err, ActorError::Config(_)));
    }
}
