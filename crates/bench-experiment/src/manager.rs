//! Experiment manager: run registry and single-run admission control.
//!
//! Runs are created (built) independently of being started. Starting claims
//! the one process-wide run slot without blocking: if another run is still
//! running or stopping the request fails with `RunActive` and nothing is
//! queued. The slot frees itself when its run completes.

use crate::configuration::ExperimentConfiguration;
use crate::run::{ExperimentRun, RunInfo};
use crate::state::State;
use crate::step::{StepContext, StepRegistry};
use bench_core::{BenchError, BenchResult, Registry, VirtualInstrumentRegistry};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Owns every experiment run of the process.
pub struct ExperimentManager {
    step_types: StepRegistry,
    context: StepContext,
    runs: Registry<Arc<ExperimentRun>>,
    active: Mutex<Option<Arc<ExperimentRun>>>,
}

impl ExperimentManager {
    /// Manager with the built-in step types.
    pub fn new(instruments: Arc<VirtualInstrumentRegistry>) -> Self {
        Self::with_step_registry(StepRegistry::with_builtin(), instruments)
    }

    /// Manager with caller-supplied step types.
    pub fn with_step_registry(
        step_types: StepRegistry,
        instruments: Arc<VirtualInstrumentRegistry>,
    ) -> Self {
        Self {
            step_types,
            context: StepContext { instruments },
            runs: Registry::new("experiment run"),
            active: Mutex::new(None),
        }
    }

    pub fn step_types(&self) -> &StepRegistry {
        &self.step_types
    }

    /// Build a run of `configuration` and register it under a fresh uid.
    pub fn create_run(
        &self,
        configuration_uid: &str,
        configuration: &ExperimentConfiguration,
    ) -> BenchResult<Arc<ExperimentRun>> {
        let uid = Uuid::new_v4().to_string();
        let run = Arc::new(ExperimentRun::build(
            uid.clone(),
            configuration_uid,
            configuration,
            &self.step_types,
            &self.context,
        )?);
        self.runs.register(uid, run.clone())?;
        Ok(run)
    }

    /// Start a `Ready` run if the run slot is free.
    pub fn start_run(&self, uid: &str) -> BenchResult<Arc<ExperimentRun>> {
        let run = self.runs.get(uid)?;
        let mut active = self.active.lock();
        if let Some(current) = active.as_ref() {
            if current.state() != State::Complete {
                warn!(run = %uid, active = %current.uid(), "Rejecting run: another run is active");
                return Err(BenchError::RunActive(current.uid().to_string()));
            }
        }
        run.start()?;
        *active = Some(run.clone());
        Ok(run)
    }

    /// Create and start a run in one go.
    pub fn submit(
        &self,
        configuration_uid: &str,
        configuration: &ExperimentConfiguration,
    ) -> BenchResult<Arc<ExperimentRun>> {
        if let Some(current) = self.active_run() {
            return Err(BenchError::RunActive(current.uid().to_string()));
        }
        let run = self.create_run(configuration_uid, configuration)?;
        self.start_run(run.uid())
    }

    /// The run holding the slot, unless it has completed.
    pub fn active_run(&self) -> Option<Arc<ExperimentRun>> {
        self.active
            .lock()
            .as_ref()
            .filter(|run| run.state() != State::Complete)
            .cloned()
    }

    /// Whether a run currently holds the slot.
    pub fn is_busy(&self) -> bool {
        self.active_run().is_some()
    }

    /// Request an abort of the active run, returning it.
    pub fn stop_active(&self) -> Option<Arc<ExperimentRun>> {
        let run = self.active_run()?;
        run.stop();
        Some(run)
    }

    /// Request an abort of a specific run. `false` if it already completed.
    pub fn stop_run(&self, uid: &str) -> BenchResult<bool> {
        Ok(self.runs.get(uid)?.stop())
    }

    pub fn run(&self, uid: &str) -> BenchResult<Arc<ExperimentRun>> {
        self.runs.get(uid)
    }

    /// Uids of all retained runs, sorted.
    pub fn run_uids(&self) -> Vec<String> {
        self.runs.keys()
    }

    /// Views of all retained runs, oldest start first; never started runs last.
    pub fn runs(&self) -> Vec<RunInfo> {
        let mut runs: Vec<RunInfo> = self.runs.values().iter().map(|r| r.info()).collect();
        runs.sort_by(|a, b| match (a.start_time, b.start_time) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.uid.cmp(&b.uid),
        });
        runs
    }

    /// Drop a run that is not running.
    pub fn remove_run(&self, uid: &str) -> BenchResult<()> {
        let run = self.runs.get(uid)?;
        if matches!(run.state(), State::Running | State::Stopping) {
            return Err(BenchError::InvalidState {
                uid: uid.to_string(),
                action: "be removed",
                state: run.state().to_string(),
            });
        }
        self.runs.unregister(uid)?;
        info!(run = %uid, "Experiment run removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Outcome;
    use serde_json::json;
    use std::time::Duration;

    fn wait_experiment(seconds: f64) -> ExperimentConfiguration {
        serde_json::from_value(json!({
            "metadata": { "name": "pause" },
            "steps": [{ "metadata": { "uid": "pause" }, "class": "Wait", "duration": seconds }],
        }))
        .unwrap()
    }

    #[test]
    fn create_does_not_start() {
        let manager = ExperimentManager::new(Arc::new(bench_core::instrument_registry()));
        let run = manager.create_run("pause", &wait_experiment(0.0)).unwrap();
        assert_eq!(run.state(), State::Ready);
        assert!(!manager.is_busy());
        assert_eq!(manager.run_uids(), vec![run.uid().to_string()]);

        manager.start_run(run.uid()).unwrap();
        run.wait(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(run.outcome(), Some(Outcome::Succeeded));
        assert!(matches!(
            manager.start_run(run.uid()),
            Err(BenchError::InvalidState { .. })
        ));
    }

    #[test]
    fn remove_rejects_running_run() {
        let manager = ExperimentManager::new(Arc::new(bench_core::instrument_registry()));
        let run = manager.submit("pause", &wait_experiment(10.0)).unwrap();
        assert!(manager.remove_run(run.uid()).is_err());

        assert!(manager.stop_active().is_some());
        run.wait(Some(Duration::from_secs(2))).unwrap();
        assert!(manager.stop_active().is_none());
        manager.remove_run(run.uid()).unwrap();
        assert!(manager.run(run.uid()).unwrap_err().is_not_found());
    }

    #[test]
    fn unknown_run_is_not_found() {
        let manager = ExperimentManager::new(Arc::new(bench_core::instrument_registry()));
        assert!(manager.start_run("nope").unwrap_err().is_not_found());
        assert!(manager.stop_run("nope").unwrap_err().is_not_found());
    }
}
