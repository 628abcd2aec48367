//! Experiment runs: ordered step execution with abort and skip policies.
//!
//! A run is built completely before anything touches the hardware: every step
//! type is resolved and every instrument dependency checked, and any failure
//! rejects the run. Execution happens on one dedicated `run-<uid>` thread.
//!
//! Before each step the run decides whether to skip it:
//!
//! 1. abort requested and `skip_on_abort` set: skipped
//! 2. outcome of the steps so far is `Failed` and `skip_on_previous_failure`
//!    set: skipped
//! 3. otherwise the step executes; an error or panic inside it only fails that
//!    step, and the run carries on with the next one
//!
//! [`stop`](ExperimentRun::stop) only raises the abort token. The step in
//! flight decides how quickly it honours it.

use crate::configuration::{ExperimentConfiguration, ExperimentMetadata};
use crate::state::{Lifecycle, LifecycleSnapshot, Outcome, State};
use crate::step::{Step, StepContext, StepRegistry};
use bench_core::{BenchError, BenchResult, CancellationToken};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Serializable view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub uid: String,
    /// Experiment the run was built from
    pub configuration_uid: String,
    pub metadata: ExperimentMetadata,
    pub state: State,
    pub outcome: Option<Outcome>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Step uids in execution order
    pub steps: Vec<String>,
}

/// Aggregate outcome of a run.
///
/// An abort request dominates; otherwise the worst step outcome wins in the
/// order `Failed`, `Aborted`, `SucceededWithWarnings`. Skipped and unfinished
/// steps do not count.
pub fn aggregate_outcome<I>(abort_requested: bool, outcomes: I) -> Outcome
where
    I: IntoIterator<Item = Option<Outcome>>,
{
    if abort_requested {
        return Outcome::Aborted;
    }
    let (mut failed, mut aborted, mut warnings) = (false, false, false);
    for outcome in outcomes.into_iter().flatten() {
        match outcome {
            Outcome::Failed => failed = true,
            Outcome::Aborted => aborted = true,
            Outcome::SucceededWithWarnings => warnings = true,
            Outcome::Succeeded | Outcome::Skipped => {}
        }
    }
    if failed {
        Outcome::Failed
    } else if aborted {
        Outcome::Aborted
    } else if warnings {
        Outcome::SucceededWithWarnings
    } else {
        Outcome::Succeeded
    }
}

/// One execution of an experiment configuration.
pub struct ExperimentRun {
    uid: String,
    configuration_uid: String,
    metadata: ExperimentMetadata,
    steps: Vec<Step>,
    abort: CancellationToken,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for ExperimentRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentRun")
            .field("uid", &self.uid)
            .field("configuration_uid", &self.configuration_uid)
            .field("steps", &self.steps.len())
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

impl ExperimentRun {
    /// Build every step of `configuration`, failing on the first problem.
    pub fn build(
        uid: impl Into<String>,
        configuration_uid: impl Into<String>,
        configuration: &ExperimentConfiguration,
        registry: &StepRegistry,
        context: &StepContext,
    ) -> BenchResult<Self> {
        let uid = uid.into();
        let configuration_uid = configuration_uid.into();
        configuration.validate()?;

        let mut steps = Vec::with_capacity(configuration.steps.len());
        for step_configuration in &configuration.steps {
            match registry.build(step_configuration, context) {
                Ok(step) => steps.push(step),
                Err(e) => {
                    error!(
                        run = %uid,
                        experiment = %configuration_uid,
                        step = %step_configuration.metadata.uid,
                        error = %e,
                        "Failed to build experiment run"
                    );
                    return Err(e);
                }
            }
        }
        info!(run = %uid, experiment = %configuration_uid, steps = steps.len(), "Experiment run built");

        Ok(Self {
            lifecycle: Lifecycle::new(format!("run-{uid}")),
            uid,
            configuration_uid,
            metadata: configuration.metadata.clone(),
            steps,
            abort: CancellationToken::new(),
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn configuration_uid(&self) -> &str {
        &self.configuration_uid
    }

    pub fn metadata(&self) -> &ExperimentMetadata {
        &self.metadata
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Look up a step by uid.
    pub fn step(&self, uid: &str) -> BenchResult<&Step> {
        self.steps
            .iter()
            .find(|step| step.uid() == uid)
            .ok_or_else(|| BenchError::not_found("step", uid))
    }

    /// Run state, outcome and timestamps.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.lifecycle.outcome()
    }

    /// Whether [`stop`](Self::stop) was called.
    pub fn abort_requested(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Serializable view of the run.
    pub fn info(&self) -> RunInfo {
        let LifecycleSnapshot {
            state,
            outcome,
            start_time,
            end_time,
        } = self.lifecycle.snapshot();
        RunInfo {
            uid: self.uid.clone(),
            configuration_uid: self.configuration_uid.clone(),
            metadata: self.metadata.clone(),
            state,
            outcome,
            start_time,
            end_time,
            steps: self.steps.iter().map(|s| s.uid().to_string()).collect(),
        }
    }

    /// Move to `Running` and execute the steps on a `run-<uid>` thread.
    ///
    /// The state is `Running` by the time this returns.
    pub fn start(self: &Arc<Self>) -> BenchResult<()> {
        self.begin()?;
        let run = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("run-{}", self.uid))
            .spawn(move || {
                run.execute_steps();
            });
        if let Err(e) = spawned {
            error!(run = %self.uid, error = %e, "Failed to spawn run thread");
            self.lifecycle.complete(Outcome::Failed);
            return Err(e.into());
        }
        Ok(())
    }

    /// Execute the steps on the calling thread and return the run outcome.
    pub fn run_blocking(&self) -> BenchResult<Outcome> {
        self.begin()?;
        Ok(self.execute_steps())
    }

    /// Request an abort.
    ///
    /// Returns `false` if the run already completed. A run that never started
    /// completes immediately as `Aborted` with every step skipped.
    pub fn stop(&self) -> bool {
        if self.lifecycle.state() == State::Complete {
            return false;
        }
        self.abort.cancel();
        info!(run = %self.uid, "Abort requested");

        // Claiming the run keeps a concurrent start from beginning it
        if self.lifecycle.stop_if_ready() {
            for step in &self.steps {
                step.skip("run aborted before start");
            }
            return self.lifecycle.complete(Outcome::Aborted);
        }
        self.lifecycle.request_stop();
        for step in &self.steps {
            step.request_stop();
        }
        true
    }

    /// Block until the run completes.
    pub fn wait(&self, timeout: Option<Duration>) -> BenchResult<LifecycleSnapshot> {
        self.lifecycle.wait_complete(timeout)
    }

    fn begin(&self) -> BenchResult<()> {
        if self.lifecycle.begin() {
            info!(run = %self.uid, experiment = %self.configuration_uid, "Experiment run started");
            Ok(())
        } else {
            Err(BenchError::InvalidState {
                uid: self.uid.clone(),
                action: "start",
                state: self.lifecycle.state().to_string(),
            })
        }
    }

    /// Aggregate of the step outcomes alone; an abort request does not hide a
    /// failure from `skip_on_previous_failure`.
    fn steps_outcome(&self) -> Outcome {
        aggregate_outcome(false, self.steps.iter().map(Step::outcome))
    }

    fn execute_steps(&self) -> Outcome {
        for step in &self.steps {
            if self.abort.is_cancelled() && step.skip_on_abort() {
                step.skip("experiment aborted");
                continue;
            }
            if step.skip_on_previous_failure() && self.steps_outcome() == Outcome::Failed {
                step.skip("previous step failed");
                continue;
            }
            let outcome = step.execute(&self.abort);
            if outcome == Outcome::Failed {
                warn!(run = %self.uid, step = %step.uid(), "Step failed, continuing with remaining steps");
            }
        }

        let outcome = aggregate_outcome(
            self.abort.is_cancelled(),
            self.steps.iter().map(Step::outcome),
        );
        self.lifecycle.complete(outcome);
        info!(run = %self.uid, outcome = %outcome, "Experiment run finished");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepAction;
    use serde_json::json;

    #[test]
    fn aggregate_precedence() {
        use Outcome::*;
        assert_eq!(aggregate_outcome(false, []), Succeeded);
        assert_eq!(aggregate_outcome(false, [Some(Succeeded), Some(Skipped), None]), Succeeded);
        assert_eq!(
            aggregate_outcome(false, [Some(SucceededWithWarnings), Some(Aborted)]),
            Aborted
        );
        assert_eq!(
            aggregate_outcome(false, [Some(Aborted), Some(Failed), Some(SucceededWithWarnings)]),
            Failed
        );
        assert_eq!(aggregate_outcome(true, [Some(Succeeded)]), Aborted);
        assert_eq!(
            aggregate_outcome(false, [Some(Succeeded), Some(SucceededWithWarnings)]),
            SucceededWithWarnings
        );
    }

    fn fails(_: &crate::step::StepConfiguration, _: &StepContext) -> BenchResult<Box<dyn StepAction>> {
        struct Fails;
        impl StepAction for Fails {
            fn execute(&self, _abort: &CancellationToken) -> anyhow::Result<Outcome> {
                anyhow::bail!("interlock open")
            }
        }
        Ok(Box::new(Fails))
    }

    fn build(steps: serde_json::Value) -> ExperimentRun {
        let registry = StepRegistry::with_builtin();
        registry.register("Fails", fails).unwrap();
        let configuration: ExperimentConfiguration = serde_json::from_value(json!({
            "metadata": { "name": "unit" },
            "steps": steps,
        }))
        .unwrap();
        let context = StepContext {
            instruments: Arc::new(bench_core::instrument_registry()),
        };
        ExperimentRun::build("r1", "unit", &configuration, &registry, &context).unwrap()
    }

    #[test]
    fn run_cannot_start_twice() {
        let run = build(json!([{ "metadata": { "uid": "w" }, "class": "Wait", "duration": 0.0 }]));
        assert_eq!(run.run_blocking().unwrap(), Outcome::Succeeded);
        assert!(matches!(run.run_blocking(), Err(BenchError::InvalidState { .. })));
        assert!(!run.stop());
        assert_eq!(run.state(), State::Complete);
    }

    #[test]
    fn skip_on_previous_failure_uses_outcome_so_far() {
        let run = build(json!([
            { "metadata": { "uid": "s1" }, "class": "Fails" },
            { "metadata": { "uid": "s2" }, "class": "Wait", "duration": 0.0, "skip_on_previous_failure": false },
            { "metadata": { "uid": "s3" }, "class": "Wait", "duration": 0.0 },
        ]));
        assert_eq!(run.run_blocking().unwrap(), Outcome::Failed);
        assert_eq!(run.step("s1").unwrap().outcome(), Some(Outcome::Failed));
        assert_eq!(run.step("s2").unwrap().outcome(), Some(Outcome::Succeeded));
        assert_eq!(run.step("s3").unwrap().outcome(), Some(Outcome::Skipped));
    }

    #[test]
    fn stop_before_start_aborts_everything() {
        let run = build(json!([{ "metadata": { "uid": "w" }, "class": "Wait", "duration": 10.0 }]));
        assert!(run.stop());
        assert_eq!(run.outcome(), Some(Outcome::Aborted));
        assert_eq!(run.step("w").unwrap().outcome(), Some(Outcome::Skipped));
        assert!(run.run_blocking().is_err());
    }

    #[test]
    fn stop_racing_start_never_skips_a_begun_step() {
        for _ in 0..50 {
            let run = Arc::new(build(json!([
                { "metadata": { "uid": "w1" }, "class": "Wait", "duration": 5.0 },
                { "metadata": { "uid": "w2" }, "class": "Wait", "duration": 5.0 },
            ])));
            let starter = {
                let run = Arc::clone(&run);
                thread::spawn(move || run.start().is_ok())
            };
            assert!(run.stop());
            let started = starter.join().unwrap();

            let snapshot = run.wait(Some(Duration::from_secs(2))).unwrap();
            assert_eq!(snapshot.outcome, Some(Outcome::Aborted));
            for step in run.steps() {
                let step = step.lifecycle().snapshot();
                assert_eq!(step.state, State::Complete);
                if step.outcome == Some(Outcome::Skipped) {
                    assert!(step.start_time.is_none());
                }
            }
            if !started {
                assert!(snapshot.start_time.is_none());
                assert!(run.steps().iter().all(|s| s.outcome() == Some(Outcome::Skipped)));
            }
        }
    }

    #[test]
    fn unknown_step_rejects_build() {
        let registry = StepRegistry::with_builtin();
        let configuration: ExperimentConfiguration = serde_json::from_value(json!({
            "metadata": { "name": "unit" },
            "steps": { "x": { "class": "Teleport" } },
        }))
        .unwrap();
        let context = StepContext {
            instruments: Arc::new(bench_core::instrument_registry()),
        };
        let err = ExperimentRun::build("r", "unit", &configuration, &registry, &context).unwrap_err();
        assert!(err.is_not_found());
    }
}
