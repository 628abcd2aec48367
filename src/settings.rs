//! Process settings loaded with Figment.
//!
//! Sources, later ones overriding earlier ones:
//! 1. built-in defaults
//! 2. an optional TOML file (`testbench.toml` unless given explicitly)
//! 3. environment variables prefixed `TESTBENCH_`, nested with `__`
//!    (e.g. `TESTBENCH_LOG__LEVEL=debug`)
//!
//! # Example
//! ```no_run
//! use testbench::settings::Settings;
//!
//! let settings = Settings::load(None)?;
//! println!("configuration in {}", settings.configuration_directory.display());
//! # Ok::<(), figment::Error>(())
//! ```

use crate::logging::{parse_log_level, LogFormat, LoggingConfig};
use bench_core::{BenchError, BenchResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings file read when none is given.
pub const DEFAULT_SETTINGS_FILE: &str = "testbench.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TESTBENCH_";

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Root of the `instruments/` and `experiments/` configuration directories
    pub configuration_directory: PathBuf,
    /// Logging
    #[serde(default)]
    pub log: LogSettings,
    /// Virtual instrument behaviour
    #[serde(default)]
    pub instruments: InstrumentSettings,
}

/// `[log]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// pretty, compact or json
    #[serde(default)]
    pub format: LogFormat,
}

/// `[instruments]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSettings {
    /// States retained per virtual instrument for sequence queries (0 disables)
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_history_capacity() -> usize {
    1000
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            configuration_directory: PathBuf::from("config"),
            log: LogSettings::default(),
            instruments: InstrumentSettings::default(),
        }
    }
}

impl Settings {
    /// Figment combining defaults, `path` (or [`DEFAULT_SETTINGS_FILE`]) and
    /// variables prefixed `env_prefix`.
    pub fn figment(path: Option<&Path>, env_prefix: &str) -> Figment {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_SETTINGS_FILE));
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(env_prefix).split("__"))
    }

    /// Load settings from the standard sources.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        Self::figment(path, ENV_PREFIX).extract()
    }

    /// Check values Figment cannot check by type.
    pub fn validate(&self) -> BenchResult<()> {
        parse_log_level(&self.log.level).map_err(BenchError::configuration)?;
        Ok(())
    }

    /// Subscriber options derived from the `[log]` section.
    pub fn logging(&self) -> BenchResult<LoggingConfig> {
        LoggingConfig::new(&self.log.level, self.log.format).map_err(BenchError::configuration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let settings: Settings = Settings::figment(
            Some(Path::new("/nonexistent/testbench.toml")),
            "TESTBENCH_UNIT_DEFAULTS_",
        )
        .extract()
        .unwrap();
        assert_eq!(settings, Settings::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn file_then_environment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "configuration_directory = \"/srv/bench\"\n[log]\nlevel = \"debug\"\nformat = \"json\"\n[instruments]\nhistory_capacity = 10"
        )
        .unwrap();

        std::env::set_var("TESTBENCH_UNIT_LAYERED_INSTRUMENTS__HISTORY_CAPACITY", "25");
        let settings: Settings = Settings::figment(Some(file.path()), "TESTBENCH_UNIT_LAYERED_")
            .extract()
            .unwrap();
        std::env::remove_var("TESTBENCH_UNIT_LAYERED_INSTRUMENTS__HISTORY_CAPACITY");

        assert_eq!(settings.configuration_directory, PathBuf::from("/srv/bench"));
        assert_eq!(settings.log.level, "debug");
        assert_eq!(settings.log.format, LogFormat::Json);
        assert_eq!(settings.instruments.history_capacity, 25);
    }

    #[test]
    fn invalid_level_fails_validation() {
        let mut settings = Settings::default();
        settings.log.level = "chatty".into();
        assert!(matches!(settings.validate(), Err(BenchError::Configuration(_))));
    }
}
