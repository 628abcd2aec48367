//! The test bench service: configuration, instruments and experiments wired
//! together for one rig.

use crate::configuration::{ConfigurationManager, ConfigurationScope};
use crate::settings::Settings;
use bench_core::{instrument_registry, BenchError, BenchResult, VirtualInstrumentRegistry};
use bench_experiment::{ExperimentConfiguration, ExperimentManager, ExperimentRun};
use bench_hardware::{InstrumentConfiguration, InstrumentManager, LoadSummary};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

/// Process-scoped services of the bench.
pub struct TestBench {
    configuration: ConfigurationManager,
    instruments: Arc<VirtualInstrumentRegistry>,
    instrument_manager: InstrumentManager,
    experiments: ExperimentManager,
    /// Held shared while a run starts and exclusively while reloading, so a
    /// reload never races a starting run.
    admission: RwLock<()>,
}

impl TestBench {
    /// Empty bench reading configuration from `configuration`.
    pub fn new(configuration: ConfigurationManager, history_capacity: usize) -> Self {
        let instruments = Arc::new(instrument_registry());
        Self {
            configuration,
            instrument_manager: InstrumentManager::new(instruments.clone())
                .with_history_capacity(history_capacity),
            experiments: ExperimentManager::new(instruments.clone()),
            instruments,
            admission: RwLock::new(()),
        }
    }

    /// Bench for the configuration directory and history size in `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            ConfigurationManager::new(&settings.configuration_directory),
            settings.instruments.history_capacity,
        )
    }

    /// Configuration root.
    pub fn configuration(&self) -> &ConfigurationManager {
        &self.configuration
    }

    /// Live virtual instruments.
    pub fn instruments(&self) -> &Arc<VirtualInstrumentRegistry> {
        &self.instruments
    }

    /// Physical instruments and translators.
    pub fn instrument_manager(&self) -> &InstrumentManager {
        &self.instrument_manager
    }

    /// Experiment runs.
    pub fn experiments(&self) -> &ExperimentManager {
        &self.experiments
    }

    /// (Re)build every instrument configuration and start the translators.
    ///
    /// Rejected with `RunActive` while an experiment run is in progress.
    pub fn reload(&self) -> BenchResult<LoadSummary> {
        let _exclusive = self.admission.write();
        if let Some(run) = self.experiments.active_run() {
            warn!(run = %run.uid(), "Refusing to reload configuration while a run is active");
            return Err(BenchError::RunActive(run.uid().to_string()));
        }

        let directory = self.configuration.directory(ConfigurationScope::Instruments)?;
        let configurations: Vec<(String, InstrumentConfiguration)> = directory.load_all()?;
        let summary = self
            .instrument_manager
            .load(configurations.iter().map(|(_, configuration)| configuration));
        self.instrument_manager.start_all();
        info!(
            configurations = configurations.len(),
            instruments = self.instruments.len(),
            "Instrument configuration reloaded"
        );
        Ok(summary)
    }

    /// Uids of the experiment configurations on disk.
    pub fn experiment_uids(&self) -> BenchResult<Vec<String>> {
        self.configuration
            .directory(ConfigurationScope::Experiments)?
            .configuration_uids()
    }

    /// Parse experiment configuration `uid`.
    pub fn experiment_configuration(&self, uid: &str) -> BenchResult<ExperimentConfiguration> {
        self.configuration
            .directory(ConfigurationScope::Experiments)?
            .contents(uid)
    }

    /// Build a run of experiment `experiment_uid` without starting it.
    pub fn create_run(&self, experiment_uid: &str) -> BenchResult<Arc<ExperimentRun>> {
        let configuration = self.experiment_configuration(experiment_uid)?;
        self.experiments.create_run(experiment_uid, &configuration)
    }

    /// Start a created run, subject to single-run admission.
    pub fn start_run(&self, run_uid: &str) -> BenchResult<Arc<ExperimentRun>> {
        let _shared = self.admission.read();
        self.experiments.start_run(run_uid)
    }

    /// Build and start a run of experiment `experiment_uid`.
    pub fn run_experiment(&self, experiment_uid: &str) -> BenchResult<Arc<ExperimentRun>> {
        let configuration = self.experiment_configuration(experiment_uid)?;
        let _shared = self.admission.read();
        self.experiments.submit(experiment_uid, &configuration)
    }

    /// Abort the active run (if any) and stop every translator.
    pub fn shutdown(&self) {
        if let Some(run) = self.experiments.stop_active() {
            info!(run = %run.uid(), "Aborting active run for shutdown");
        }
        self.instrument_manager.stop_all();
        info!("Test bench shut down");
    }
}
