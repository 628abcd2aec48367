//! YAML configuration directories.
//!
//! The configuration root holds one directory per scope. Every `<uid>.yaml`
//! file inside a scope directory is one configuration, identified by its file
//! stem:
//!
//! ```text
//! config/
//! ├── instruments/
//! │   └── power-rig.yaml      # InstrumentConfiguration "power-rig"
//! └── experiments/
//!     └── burn-in.yaml        # ExperimentConfiguration "burn-in"
//! ```

use bench_core::{BenchError, BenchResult};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

const SUFFIX: &str = "yaml";

/// Configuration scopes, one directory each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationScope {
    /// Physical instruments and translators
    Instruments,
    /// Experiment step sequences
    Experiments,
}

impl ConfigurationScope {
    /// All scopes.
    pub const ALL: [ConfigurationScope; 2] =
        [ConfigurationScope::Instruments, ConfigurationScope::Experiments];

    /// Directory name under the configuration root.
    pub fn directory_name(self) -> &'static str {
        match self {
            ConfigurationScope::Instruments => "instruments",
            ConfigurationScope::Experiments => "experiments",
        }
    }
}

impl std::fmt::Display for ConfigurationScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.directory_name())
    }
}

/// One scope directory.
#[derive(Debug, Clone)]
pub struct ConfigurationDirectory {
    path: PathBuf,
}

impl ConfigurationDirectory {
    /// Open `path`, which must be an existing directory.
    pub fn open(path: impl Into<PathBuf>) -> BenchResult<Self> {
        let path = path.into();
        if !path.is_dir() {
            return Err(BenchError::configuration(format!(
                "configuration directory '{}' is not a directory",
                path.display()
            )));
        }
        Ok(Self { path })
    }

    /// Directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Uids (file stems) of the `.yaml` files in this directory, sorted.
    pub fn configuration_uids(&self) -> BenchResult<Vec<String>> {
        let mut uids = Vec::new();
        for entry in std::fs::read_dir(&self.path)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(SUFFIX) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                uids.push(stem.to_string());
            }
        }
        uids.sort();
        Ok(uids)
    }

    /// Path of configuration `uid`.
    pub fn file_path(&self, uid: &str) -> PathBuf {
        self.path.join(format!("{uid}.{SUFFIX}"))
    }

    /// Parse configuration `uid`.
    ///
    /// A missing file is `NotFound`; unreadable or invalid YAML is `Configuration`.
    pub fn contents<T: DeserializeOwned>(&self, uid: &str) -> BenchResult<T> {
        let path = self.file_path(uid);
        if !path.is_file() {
            return Err(BenchError::not_found("configuration", uid));
        }
        let text = std::fs::read_to_string(&path)?;
        serde_yaml::from_str(&text).map_err(|e| {
            BenchError::configuration(format!(
                "error parsing YAML configuration file '{}': {e}",
                path.display()
            ))
        })
    }

    /// Parse every configuration, logging and skipping the ones that fail.
    pub fn load_all<T: DeserializeOwned>(&self) -> BenchResult<Vec<(String, T)>> {
        let mut loaded = Vec::new();
        for uid in self.configuration_uids()? {
            match self.contents(&uid) {
                Ok(configuration) => {
                    debug!(configuration = %uid, "Configuration parsed");
                    loaded.push((uid, configuration));
                }
                Err(e) => error!(configuration = %uid, error = %e, "Skipping configuration"),
            }
        }
        Ok(loaded)
    }
}

/// Root of all scope directories.
#[derive(Debug, Clone)]
pub struct ConfigurationManager {
    root: PathBuf,
}

impl ConfigurationManager {
    /// Use `root`, warning about scope directories that do not exist.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        for scope in ConfigurationScope::ALL {
            let path = root.join(scope.directory_name());
            if !path.is_dir() {
                warn!(
                    scope = %scope,
                    path = %path.display(),
                    "Configuration directory for scope does not exist"
                );
            }
        }
        Self { root }
    }

    /// Configuration root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of `scope`.
    pub fn directory(&self, scope: ConfigurationScope) -> BenchResult<ConfigurationDirectory> {
        ConfigurationDirectory::open(self.root.join(scope.directory_name()))
    }
}
