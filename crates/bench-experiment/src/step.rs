//! Steps: the units of work an experiment run sequences.
//!
//! A [`Step`] pairs the configured metadata and skip policy with a
//! [`StepAction`], the type-specific body selected by the configuration's
//! `class` tag through the [`StepRegistry`]. The run owns every lifecycle
//! transition; actions only report the [`Outcome`] they reached.

use crate::state::{Lifecycle, LifecycleSnapshot, Outcome};
use bench_core::{
    panic_message, BenchError, BenchResult, CancellationToken, Registry,
    VirtualInstrumentRegistry,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Descriptive metadata of a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetadata {
    /// Unique within one experiment. May be left empty when the step is keyed by
    /// uid in the experiment file.
    #[serde(default)]
    pub uid: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Generic step configuration; type-specific fields stay in `parameters`.
#[derive(Debug, Clone, Deserialize)]
pub struct StepConfiguration {
    /// Step metadata
    #[serde(default)]
    pub metadata: StepMetadata,
    /// Step type tag
    #[serde(alias = "class_name")]
    pub class: String,
    /// Skip this step once the run's outcome so far is `Failed`
    #[serde(default = "default_true")]
    pub skip_on_previous_failure: bool,
    /// Skip this step once an abort was requested
    #[serde(default = "default_true")]
    pub skip_on_abort: bool,
    /// Remaining fields
    #[serde(flatten)]
    pub parameters: Map<String, Value>,
}

impl StepConfiguration {
    /// Parse the type-specific fields.
    pub fn parameters<T: DeserializeOwned>(&self) -> BenchResult<T> {
        serde_json::from_value(Value::Object(self.parameters.clone())).map_err(|e| {
            BenchError::build(format!("step '{}' ({}): {e}", self.metadata.uid, self.class))
        })
    }
}

/// Services a step constructor may resolve against.
#[derive(Clone)]
pub struct StepContext {
    /// Live virtual instruments
    pub instruments: Arc<VirtualInstrumentRegistry>,
}

/// Type-specific body of a step.
pub trait StepAction: Send + Sync {
    /// Virtual instruments this step reads or commands.
    fn instrument_uids(&self) -> Vec<String> {
        Vec::new()
    }

    /// Run the step. Implementations must watch `abort` and return early with
    /// [`Outcome::Aborted`] once it is cancelled.
    fn execute(&self, abort: &CancellationToken) -> anyhow::Result<Outcome>;
}

/// Serializable view of a step.
#[derive(Debug, Clone, Serialize)]
pub struct StepInfo {
    /// Step metadata
    pub metadata: StepMetadata,
    /// Step type tag
    pub class: String,
    /// Skip policy on failure
    pub skip_on_previous_failure: bool,
    /// Skip policy on abort
    pub skip_on_abort: bool,
    /// Instruments used
    pub instrument_uids: Vec<String>,
    /// Lifecycle state
    pub state: crate::state::State,
    /// Outcome once complete
    pub outcome: Option<Outcome>,
    /// Start of execution
    pub start_time: Option<DateTime<Utc>>,
    /// End of execution
    pub end_time: Option<DateTime<Utc>>,
}

/// A built step inside an experiment run.
pub struct Step {
    metadata: StepMetadata,
    class: String,
    skip_on_previous_failure: bool,
    skip_on_abort: bool,
    lifecycle: Lifecycle,
    action: Box<dyn StepAction>,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("uid", &self.metadata.uid)
            .field("class", &self.class)
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

impl Step {
    /// Assemble a step from its configuration and an already built action.
    pub fn new(configuration: &StepConfiguration, action: Box<dyn StepAction>) -> Self {
        Self {
            lifecycle: Lifecycle::new(format!("step-{}", configuration.metadata.uid)),
            metadata: configuration.metadata.clone(),
            class: configuration.class.clone(),
            skip_on_previous_failure: configuration.skip_on_previous_failure,
            skip_on_abort: configuration.skip_on_abort,
            action,
        }
    }

    pub fn metadata(&self) -> &StepMetadata {
        &self.metadata
    }

    pub fn uid(&self) -> &str {
        &self.metadata.uid
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn skip_on_previous_failure(&self) -> bool {
        self.skip_on_previous_failure
    }

    pub fn skip_on_abort(&self) -> bool {
        self.skip_on_abort
    }

    /// State, outcome and timestamps, observable by subscribers.
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.lifecycle.outcome()
    }

    /// Virtual instruments this step depends on.
    pub fn instrument_uids(&self) -> Vec<String> {
        self.action.instrument_uids()
    }

    /// Serializable view of the step.
    pub fn info(&self) -> StepInfo {
        let LifecycleSnapshot {
            state,
            outcome,
            start_time,
            end_time,
        } = self.lifecycle.snapshot();
        StepInfo {
            metadata: self.metadata.clone(),
            class: self.class.clone(),
            skip_on_previous_failure: self.skip_on_previous_failure,
            skip_on_abort: self.skip_on_abort,
            instrument_uids: self.instrument_uids(),
            state,
            outcome,
            start_time,
            end_time,
        }
    }

    /// Mark the step complete without running it.
    ///
    /// Returns `false` if the step has already begun; it then keeps running.
    pub fn skip(&self, reason: &str) -> bool {
        let skipped = self.lifecycle.complete_if_ready(Outcome::Skipped);
        if skipped {
            info!(step = %self.metadata.uid, reason, "Skipping step");
        }
        skipped
    }

    /// Run the action and record its outcome.
    ///
    /// An error or panic escaping the action completes the step as `Failed`;
    /// nothing propagates to the caller.
    pub fn execute(&self, abort: &CancellationToken) -> Outcome {
        if !self.lifecycle.begin() {
            warn!(
                step = %self.metadata.uid,
                state = %self.lifecycle.state(),
                "Step already executed"
            );
            return self.lifecycle.outcome().unwrap_or(Outcome::Failed);
        }
        info!(step = %self.metadata.uid, class = %self.class, "Executing step");

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.action.execute(abort)));
        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(step = %self.metadata.uid, error = %format!("{e:#}"), "Error occurred during step execution");
                Outcome::Failed
            }
            Err(payload) => {
                error!(
                    step = %self.metadata.uid,
                    panic = %panic_message(payload.as_ref()),
                    "Step panicked"
                );
                Outcome::Failed
            }
        };
        self.lifecycle.complete(outcome);
        info!(step = %self.metadata.uid, outcome = %outcome, "Step finished");
        outcome
    }

    /// Flag a running step as stopping. The action itself reacts to the abort
    /// token it was handed.
    pub(crate) fn request_stop(&self) {
        self.lifecycle.request_stop();
    }
}

/// Constructor registered for a step type tag.
pub type StepConstructor =
    fn(&StepConfiguration, &StepContext) -> BenchResult<Box<dyn StepAction>>;

/// Step type tag to constructor mapping.
pub struct StepRegistry {
    constructors: Registry<StepConstructor>,
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl StepRegistry {
    /// Registry with no step types.
    pub fn empty() -> Self {
        Self {
            constructors: Registry::new("step class"),
        }
    }

    /// Registry with the built-in steps.
    pub fn with_builtin() -> Self {
        let registry = Self::empty();
        for (tag, constructor) in crate::steps::builtin() {
            // Tags are distinct constants
            let _ = registry.register(tag, constructor);
        }
        registry
    }

    /// Add a step type. Fails with `Duplicate` if the tag is taken.
    pub fn register(&self, tag: &str, constructor: StepConstructor) -> BenchResult<()> {
        self.constructors.register(tag, constructor)
    }

    /// Registered type tags.
    pub fn class_names(&self) -> Vec<String> {
        self.constructors.keys()
    }

    /// Build one step and check its instrument dependencies.
    ///
    /// Fails with `NotFound` for an unknown tag and `Build` for a bad
    /// configuration or a dependency missing from the instrument registry.
    pub fn build(
        &self,
        configuration: &StepConfiguration,
        context: &StepContext,
    ) -> BenchResult<Step> {
        let uid = &configuration.metadata.uid;
        let constructor = match self.constructors.get(&configuration.class) {
            Ok(constructor) => constructor,
            Err(e) => {
                warn!(step = %uid, class = %configuration.class, "Step class not found in registry");
                return Err(e);
            }
        };
        let action = constructor(configuration, context)?;

        for instrument in action.instrument_uids() {
            if !context.instruments.contains(&instrument) {
                warn!(step = %uid, instrument = %instrument, "Step depends on an unregistered virtual instrument");
                return Err(BenchError::build(format!(
                    "virtual instrument '{instrument}' used in step '{uid}' is not registered"
                )));
            }
        }
        Ok(Step::new(configuration, action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Scripted(anyhow::Result<Outcome>);

    impl StepAction for Scripted {
        fn execute(&self, _abort: &CancellationToken) -> anyhow::Result<Outcome> {
            match &self.0 {
                Ok(outcome) => Ok(*outcome),
                Err(e) => Err(anyhow::anyhow!("{e}")),
            }
        }
    }

    struct Panicking;

    impl StepAction for Panicking {
        fn execute(&self, _abort: &CancellationToken) -> anyhow::Result<Outcome> {
            panic!("relay stuck");
        }
    }

    fn configuration(value: Value) -> StepConfiguration {
        serde_json::from_value(value).unwrap()
    }

    fn context() -> StepContext {
        StepContext {
            instruments: Arc::new(bench_core::instrument_registry()),
        }
    }

    #[test]
    fn configuration_defaults_and_parameters() {
        let config = configuration(json!({
            "metadata": { "uid": "settle" },
            "class_name": "Wait",
            "duration": 0.5,
        }));
        assert!(config.skip_on_previous_failure);
        assert!(config.skip_on_abort);
        assert_eq!(config.parameters.get("duration"), Some(&json!(0.5)));

        #[derive(Deserialize)]
        struct Params {
            duration: f64,
        }
        assert_eq!(config.parameters::<Params>().unwrap().duration, 0.5);
    }

    #[test]
    fn failing_and_panicking_actions_complete_as_failed() {
        let config = configuration(json!({ "metadata": { "uid": "s" }, "class": "X" }));
        let abort = CancellationToken::new();

        let step = Step::new(&config, Box::new(Scripted(Err(anyhow::anyhow!("no power")))));
        assert_eq!(step.execute(&abort), Outcome::Failed);
        assert_eq!(step.lifecycle().state(), crate::state::State::Complete);

        let step = Step::new(&config, Box::new(Panicking));
        assert_eq!(step.execute(&abort), Outcome::Failed);
        assert_eq!(step.outcome(), Some(Outcome::Failed));
    }

    #[test]
    fn step_runs_once() {
        let config = configuration(json!({ "metadata": { "uid": "s" }, "class": "X" }));
        let step = Step::new(&config, Box::new(Scripted(Ok(Outcome::SucceededWithWarnings))));
        let abort = CancellationToken::new();
        assert_eq!(step.execute(&abort), Outcome::SucceededWithWarnings);
        assert_eq!(step.execute(&abort), Outcome::SucceededWithWarnings);
        let info = step.info();
        assert!(info.start_time.is_some() && info.end_time.is_some());
    }

    #[test]
    fn unknown_class_is_not_found() {
        let registry = StepRegistry::with_builtin();
        let config = configuration(json!({ "metadata": { "uid": "s" }, "class": "Teleport" }));
        let err = registry.build(&config, &context()).unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("Teleport"));
    }

    #[test]
    fn missing_instrument_dependency_fails_build() {
        let registry = StepRegistry::with_builtin();
        let config = configuration(json!({
            "metadata": { "uid": "check" },
            "class": "CheckInstrument",
            "instrument_uid": "temperature",
            "condition": { "op": "lt", "value": 30.0 },
        }));
        let err = registry.build(&config, &context()).unwrap_err();
        assert!(matches!(err, BenchError::Build(_)));
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn builtin_tags_are_registered() {
        let names = StepRegistry::with_builtin().class_names();
        for tag in ["CheckInstrument", "SetInstrument", "Wait", "WaitForInstrument"] {
            assert!(names.contains(&tag.to_string()), "missing {tag}");
        }
    }
}
