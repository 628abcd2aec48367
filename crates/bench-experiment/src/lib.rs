//! `bench-experiment`
//!
//! Sequencing engine for experiments run against the bench.
//!
//! - [`state`]: `State`/`Outcome` and the observable [`Lifecycle`] cell
//! - [`step`]: the [`StepAction`] contract, [`Step`] and the type-tag [`StepRegistry`]
//! - [`steps`]: built-in steps (`Wait`, `SetInstrument`, `WaitForInstrument`, `CheckInstrument`)
//! - [`configuration`]: experiment configuration files
//! - [`run`]: [`ExperimentRun`] with abort and skip policies
//! - [`manager`]: run registry and single-run admission control

pub mod configuration;
pub mod manager;
pub mod run;
pub mod state;
pub mod step;
pub mod steps;

pub use configuration::{ExperimentConfiguration, ExperimentMetadata};
pub use manager::ExperimentManager;
pub use run::{aggregate_outcome, ExperimentRun, RunInfo};
pub use state::{Lifecycle, LifecycleSnapshot, Outcome, State};
pub use step::{
    Step, StepAction, StepConfiguration, StepConstructor, StepContext, StepInfo, StepMetadata,
    StepRegistry,
};
