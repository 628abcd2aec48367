//! Request/response layer over [`TestBench`].
//!
//! Every operation returns serializable transmission structures and an
//! [`ApiError`] that keeps timeouts apart from missing resources and from
//! general failure, so a transport (HTTP, gRPC, CLI) only has to map
//! [`ApiError::status_code`].

use crate::bench::TestBench;
use bench_core::{BenchError, InstrumentState, InstrumentValue};
use bench_experiment::{ExperimentMetadata, RunInfo, StepInfo, StepMetadata};
use bench_hardware::LoadSummary;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors surfaced to API callers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Unknown instrument, experiment, run or step
    #[error("not found: {0}")]
    NotFound(String),

    /// A blocking read ran past its timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The request is valid but cannot be honoured now (active run, bad state,
    /// experiment fails to build)
    #[error("rejected: {0}")]
    Rejected(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP-style status code for transports that want one.
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::NotFound(_) => 404,
            ApiError::Timeout(_) => 408,
            ApiError::Rejected(_) => 409,
            ApiError::Internal(_) => 500,
        }
    }
}

impl From<BenchError> for ApiError {
    fn from(error: BenchError) -> Self {
        match error {
            BenchError::NotFound { .. } | BenchError::Uninitialized(_) => {
                ApiError::NotFound(error.to_string())
            }
            BenchError::Timeout(timeout) => ApiError::Timeout(timeout),
            BenchError::Duplicate { .. }
            | BenchError::Build(_)
            | BenchError::Configuration(_)
            | BenchError::RunActive(_)
            | BenchError::InvalidState { .. } => ApiError::Rejected(error.to_string()),
            BenchError::Io(_) => ApiError::Internal(error.to_string()),
        }
    }
}

/// One state of an instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstrumentStateView {
    /// Value
    pub value: InstrumentValue,
    /// Sequence number
    pub sequence: u64,
    /// Commit time
    pub timestamp: DateTime<Utc>,
}

impl From<InstrumentState> for InstrumentStateView {
    fn from(state: InstrumentState) -> Self {
        Self {
            value: state.value,
            sequence: state.sequence,
            timestamp: state.timestamp,
        }
    }
}

/// An instrument with one or more of its states.
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentReading {
    /// Instrument uid
    pub uid: String,
    /// Display name
    pub name: Option<String>,
    /// Unit of the values
    pub unit: Option<String>,
    /// Free-form description
    pub description: Option<String>,
    /// States, oldest first
    pub states: Vec<InstrumentStateView>,
}

/// Configured step as listed with its experiment.
#[derive(Debug, Clone, Serialize)]
pub struct StepConfigurationView {
    /// Step metadata
    pub metadata: StepMetadata,
    /// Step type tag
    pub class: String,
    /// Skip once the run has failed
    pub skip_on_previous_failure: bool,
    /// Skip once the run was aborted
    pub skip_on_abort: bool,
}

/// Experiment configuration as listed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentView {
    /// Configuration uid
    pub uid: String,
    /// Experiment metadata
    pub metadata: ExperimentMetadata,
    /// Steps in execution order
    pub steps: Vec<StepConfigurationView>,
}

/// API facade over a bench.
#[derive(Clone)]
pub struct Api {
    bench: Arc<TestBench>,
}

impl Api {
    /// Facade over `bench`.
    pub fn new(bench: Arc<TestBench>) -> Self {
        Self { bench }
    }

    /// The underlying bench.
    pub fn bench(&self) -> &Arc<TestBench> {
        &self.bench
    }

    /// Uids of all virtual instruments, sorted.
    pub fn list_instruments(&self) -> Vec<String> {
        self.bench.instruments().keys()
    }

    /// Read an instrument.
    ///
    /// Without `sequence` the latest state is returned. With `sequence` the call
    /// waits (up to `timeout`, indefinitely if `None`) until that sequence has
    /// been committed and returns every retained state from it on.
    pub fn read_instrument(
        &self,
        uid: &str,
        sequence: Option<u64>,
        timeout: Option<Duration>,
    ) -> ApiResult<InstrumentReading> {
        let instrument = self.bench.instruments().get(uid)?;
        let states = match sequence {
            None => vec![instrument.get_latest_state()?],
            Some(from) => {
                let reached = instrument.wait_for(|s| s.sequence >= from, timeout)?;
                let retained = instrument.states_since(from);
                if retained.is_empty() {
                    vec![reached]
                } else {
                    retained
                }
            }
        };
        let metadata = instrument.metadata();
        Ok(InstrumentReading {
            uid: metadata.uid.clone(),
            name: metadata.name.clone(),
            unit: metadata.unit.clone(),
            description: metadata.description.clone(),
            states: states.into_iter().map(InstrumentStateView::from).collect(),
        })
    }

    /// Uids of the experiment configurations.
    pub fn list_experiments(&self) -> ApiResult<Vec<String>> {
        Ok(self.bench.experiment_uids()?)
    }

    /// One experiment configuration.
    pub fn experiment(&self, uid: &str) -> ApiResult<ExperimentView> {
        let configuration = self.bench.experiment_configuration(uid)?;
        Ok(ExperimentView {
            uid: uid.to_string(),
            metadata: configuration.metadata,
            steps: configuration
                .steps
                .into_iter()
                .map(|step| StepConfigurationView {
                    metadata: step.metadata,
                    class: step.class,
                    skip_on_previous_failure: step.skip_on_previous_failure,
                    skip_on_abort: step.skip_on_abort,
                })
                .collect(),
        })
    }

    /// Build a run of an experiment, returning the run uid.
    pub fn create_run(&self, experiment_uid: &str) -> ApiResult<String> {
        Ok(self.bench.create_run(experiment_uid)?.uid().to_string())
    }

    /// Start a created run.
    pub fn start_run(&self, run_uid: &str) -> ApiResult<RunInfo> {
        Ok(self.bench.start_run(run_uid)?.info())
    }

    /// Build and start a run of an experiment, returning the run uid.
    pub fn run_experiment(&self, experiment_uid: &str) -> ApiResult<String> {
        Ok(self.bench.run_experiment(experiment_uid)?.uid().to_string())
    }

    /// Uids of the retained runs.
    pub fn list_runs(&self) -> Vec<String> {
        self.bench.experiments().run_uids()
    }

    /// One run.
    pub fn run(&self, run_uid: &str) -> ApiResult<RunInfo> {
        Ok(self.bench.experiments().run(run_uid)?.info())
    }

    /// Block until a run completes.
    pub fn wait_run(&self, run_uid: &str, timeout: Option<Duration>) -> ApiResult<RunInfo> {
        let run = self.bench.experiments().run(run_uid)?;
        run.wait(timeout)?;
        Ok(run.info())
    }

    /// Step uids of a run in execution order.
    pub fn list_steps(&self, run_uid: &str) -> ApiResult<Vec<String>> {
        let run = self.bench.experiments().run(run_uid)?;
        Ok(run.steps().iter().map(|s| s.uid().to_string()).collect())
    }

    /// One step of a run.
    pub fn step(&self, run_uid: &str, step_uid: &str) -> ApiResult<StepInfo> {
        let run = self.bench.experiments().run(run_uid)?;
        let step = run.step(step_uid)?;
        Ok(step.info())
    }

    /// Abort the active run.
    pub fn stop(&self) -> ApiResult<RunInfo> {
        self.bench
            .experiments()
            .stop_active()
            .map(|run| run.info())
            .ok_or_else(|| ApiError::Rejected("no experiment run is active".to_string()))
    }

    /// Reload the instrument configuration.
    pub fn reload(&self) -> ApiResult<LoadSummary> {
        Ok(self.bench.reload()?)
    }
}
