//! Instrument manager: builds physical instruments and translators from
//! configuration and owns their lifecycle.
//!
//! Loading is tolerant: a physical instrument or translator that fails to build
//! is logged and skipped, so one faulty entry never blocks the rest of the rig.
//! Reloading stops every translator, unregisters their output instruments and
//! clears the physical registry before rebuilding.

use crate::physical::{
    physical_registry, PhysicalInstrumentConfiguration, PhysicalInstrumentFactories,
    PhysicalInstrumentRegistry,
};
use crate::translator::{Translator, TranslatorConfiguration, TranslatorContext, TranslatorRegistry};
use bench_core::{BenchError, BenchResult, Registry, VirtualInstrumentRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Contents of one instrument-scope configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentConfiguration {
    /// Display name of this part of the rig
    pub name: String,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Physical instruments to create
    #[serde(default)]
    pub physical_instruments: Vec<PhysicalInstrumentConfiguration>,
    /// Translators to create
    #[serde(default)]
    pub translators: Vec<TranslatorConfiguration>,
}

impl InstrumentConfiguration {
    /// Reject duplicate uids; warn about empty sections.
    pub fn validate(&self) -> BenchResult<()> {
        let mut seen = HashSet::new();
        for physical in &self.physical_instruments {
            if !seen.insert(physical.uid.as_str()) {
                return Err(BenchError::configuration(format!(
                    "'{}': duplicate physical instrument uid '{}'",
                    self.name, physical.uid
                )));
            }
        }
        if self.physical_instruments.is_empty() {
            warn!(configuration = %self.name, "No physical instruments configured. Is this correct?");
        }

        let mut seen = HashSet::new();
        for translator in &self.translators {
            if !seen.insert(translator.metadata.uid.as_str()) {
                return Err(BenchError::configuration(format!(
                    "'{}': duplicate translator uid '{}'",
                    self.name, translator.metadata.uid
                )));
            }
        }
        if self.translators.is_empty() {
            warn!(configuration = %self.name, "No translators configured. Is this correct?");
        }
        Ok(())
    }
}

/// Result of a (re)load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    /// Physical instruments registered
    pub physical_instruments: usize,
    /// Translators built
    pub translators: usize,
    /// Translator uids that failed to build
    pub failed_translators: Vec<String>,
}

/// Owns physical instruments and translators for the process.
pub struct InstrumentManager {
    factories: PhysicalInstrumentFactories,
    translator_types: TranslatorRegistry,
    physical: Arc<PhysicalInstrumentRegistry>,
    instruments: Arc<VirtualInstrumentRegistry>,
    translators: Registry<Arc<Translator>>,
    history_capacity: usize,
}

impl InstrumentManager {
    /// Manager with the built-in drivers and translator strategies.
    pub fn new(instruments: Arc<VirtualInstrumentRegistry>) -> Self {
        Self::with_registries(
            PhysicalInstrumentFactories::with_builtin(),
            TranslatorRegistry::with_builtin(),
            instruments,
        )
    }

    /// Manager with caller-supplied factories and strategies.
    pub fn with_registries(
        factories: PhysicalInstrumentFactories,
        translator_types: TranslatorRegistry,
        instruments: Arc<VirtualInstrumentRegistry>,
    ) -> Self {
        Self {
            factories,
            translator_types,
            physical: Arc::new(physical_registry()),
            instruments,
            translators: Registry::new("translator"),
            history_capacity: 0,
        }
    }

    /// History retained by output instruments built from now on.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Physical instrument registry.
    pub fn physical(&self) -> &Arc<PhysicalInstrumentRegistry> {
        &self.physical
    }

    /// Virtual instrument registry outputs are registered in.
    pub fn instruments(&self) -> &Arc<VirtualInstrumentRegistry> {
        &self.instruments
    }

    /// Uids of the loaded translators, sorted.
    pub fn translator_uids(&self) -> Vec<String> {
        self.translators.keys()
    }

    /// Look up a loaded translator.
    pub fn translator(&self, uid: &str) -> BenchResult<Arc<Translator>> {
        self.translators.get(uid)
    }

    /// Tear down whatever is loaded and build `configurations` from scratch.
    ///
    /// Translators are built but not started; see [`start_all`](Self::start_all).
    pub fn load<'a, I>(&self, configurations: I) -> LoadSummary
    where
        I: IntoIterator<Item = &'a InstrumentConfiguration>,
    {
        self.stop_all();
        self.physical.clear();

        let context = TranslatorContext {
            physical: self.physical.clone(),
            instruments: self.instruments.clone(),
            history_capacity: self.history_capacity,
        };

        let mut summary = LoadSummary::default();
        for configuration in configurations {
            if let Err(e) = configuration.validate() {
                error!(configuration = %configuration.name, error = %e, "Skipping invalid instrument configuration");
                continue;
            }
            summary.physical_instruments += self
                .factories
                .fill(&self.physical, &configuration.physical_instruments);

            for translator_configuration in &configuration.translators {
                let uid = &translator_configuration.metadata.uid;
                let built = self
                    .translator_types
                    .build(translator_configuration, &context)
                    .and_then(|translator| {
                        let translator = Arc::new(translator);
                        let registered = self.translators.register(uid.clone(), translator.clone());
                        if registered.is_err() {
                            translator.shutdown(&self.instruments);
                        }
                        registered
                    });
                match built {
                    Ok(()) => summary.translators += 1,
                    Err(e) => {
                        error!(translator = %uid, error = %e, "Failed to build translator");
                        summary.failed_translators.push(uid.clone());
                    }
                }
            }
        }

        info!(
            physical_instruments = summary.physical_instruments,
            translators = summary.translators,
            failed = summary.failed_translators.len(),
            "Instrument configuration loaded"
        );
        summary
    }

    /// Start every loaded translator that is not running yet.
    pub fn start_all(&self) {
        for translator in self.translators.values() {
            if translator.is_running() {
                continue;
            }
            if let Err(e) = translator.start() {
                error!(translator = %translator.metadata().uid, error = %e, "Failed to start translator");
            }
        }
    }

    /// Stop every translator and unregister its outputs.
    pub fn stop_all(&self) {
        for translator in self.translators.values() {
            translator.shutdown(&self.instruments);
        }
        self.translators.clear();
    }
}

impl Drop for InstrumentManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing_test::traced_test;

    fn configuration(value: serde_json::Value) -> InstrumentConfiguration {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn duplicate_uids_are_rejected() {
        let config = configuration(json!({
            "name": "rig",
            "physical_instruments": [
                { "uid": "psu", "class": "MockInstrument" },
                { "uid": "psu", "class": "MockInstrument" },
            ],
        }));
        assert!(matches!(config.validate(), Err(BenchError::Configuration(_))));

        let config = configuration(json!({
            "name": "rig",
            "translators": [
                { "metadata": { "uid": "t" }, "class": "PollingTranslator" },
                { "metadata": { "uid": "t" }, "class": "PollingTranslator" },
            ],
        }));
        assert!(matches!(config.validate(), Err(BenchError::Configuration(_))));
    }

    #[test]
    #[traced_test]
    fn empty_sections_only_warn() {
        let config = configuration(json!({ "name": "bare" }));
        assert!(config.validate().is_ok());
        assert!(logs_contain("No physical instruments configured"));
        assert!(logs_contain("No translators configured"));
    }

    #[test]
    fn faulty_translator_is_skipped() {
        let manager = InstrumentManager::new(Arc::new(bench_core::instrument_registry()));
        let config = configuration(json!({
            "name": "rig",
            "physical_instruments": [{ "uid": "psu", "class": "MockInstrument" }],
            "translators": [
                {
                    "metadata": { "uid": "good" },
                    "class": "PollingTranslator",
                    "physical_instrument_uid": "psu",
                    "getter_function": "read",
                    "entities": [{ "virtual_instrument": { "uid": "v" } }],
                },
                {
                    "metadata": { "uid": "orphan" },
                    "class": "PollingTranslator",
                    "physical_instrument_uid": "nowhere",
                    "getter_function": "read",
                },
            ],
        }));

        let summary = manager.load([&config]);
        assert_eq!(summary.physical_instruments, 1);
        assert_eq!(summary.translators, 1);
        assert_eq!(summary.failed_translators, vec!["orphan".to_string()]);
        assert_eq!(manager.translator_uids(), vec!["good".to_string()]);
        assert!(manager.instruments().contains("v"));
    }

    #[test]
    fn reload_replaces_outputs() {
        let manager = InstrumentManager::new(Arc::new(bench_core::instrument_registry()));
        let config = configuration(json!({
            "name": "rig",
            "physical_instruments": [{ "uid": "psu", "class": "MockInstrument" }],
            "translators": [{
                "metadata": { "uid": "poller" },
                "class": "PollingTranslator",
                "physical_instrument_uid": "psu",
                "getter_function": "read",
                "polling_interval": 0.01,
                "entities": [{ "virtual_instrument": { "uid": "v" } }],
            }],
        }));

        manager.load([&config]);
        manager.start_all();
        let first = manager.instruments().get("v").unwrap();
        first
            .wait_for(|_| true, Some(std::time::Duration::from_secs(2)))
            .unwrap();

        let summary = manager.load([&config]);
        assert_eq!(summary.translators, 1);
        let second = manager.instruments().get("v").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        manager.stop_all();
        assert!(manager.instruments().is_empty());
        assert!(manager.translator_uids().is_empty());
    }
}
