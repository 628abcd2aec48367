//! Steps acting on virtual instruments.
//!
//! - `SetInstrument` commands an instrument with a fixed value
//! - `WaitForInstrument` blocks until the instrument satisfies a [`Condition`]
//! - `CheckInstrument` compares the latest value once
//!
//! Instruments are looked up when the step executes, so a step always talks to
//! the instrument currently registered under its uid. Setting and checking are
//! instantaneous and also run after an abort, which lets a step that opts out
//! of `skip_on_abort` bring the rig to a safe state.

use crate::state::Outcome;
use crate::step::{StepAction, StepConfiguration, StepContext};
use anyhow::{anyhow, bail, Context as _};
use bench_core::{
    BenchError, BenchResult, CancellationToken, Instrument, InstrumentValue,
    VirtualInstrumentRegistry,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const SET_CLASS_NAME: &str = "SetInstrument";
pub const WAIT_FOR_CLASS_NAME: &str = "WaitForInstrument";
pub const CHECK_CLASS_NAME: &str = "CheckInstrument";

/// Longest uninterrupted block while waiting on an instrument.
const ABORT_POLL: Duration = Duration::from_millis(100);

/// Comparison operator of a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// `value <op> operand`.
///
/// Numeric values compare numerically across bool/int/float; text only
/// supports `eq` and `ne`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub op: Comparison,
    pub value: InstrumentValue,
}

impl Condition {
    pub fn holds(&self, actual: &InstrumentValue) -> bool {
        match (actual.as_f64(), self.value.as_f64()) {
            (Some(a), Some(b)) => match self.op {
                Comparison::Eq => a == b,
                Comparison::Ne => a != b,
                Comparison::Lt => a < b,
                Comparison::Le => a <= b,
                Comparison::Gt => a > b,
                Comparison::Ge => a >= b,
            },
            _ => match self.op {
                Comparison::Eq => actual == &self.value,
                Comparison::Ne => actual != &self.value,
                _ => false,
            },
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self.op {
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
        };
        write!(f, "{op} {}", self.value)
    }
}

fn lookup(instruments: &VirtualInstrumentRegistry, uid: &str) -> anyhow::Result<Arc<Instrument>> {
    instruments
        .get(uid)
        .with_context(|| format!("instrument '{uid}' is no longer available"))
}

#[derive(Debug, Deserialize)]
struct SetParameters {
    instrument_uid: String,
    value: InstrumentValue,
}

/// Commands one instrument.
pub struct SetInstrument {
    instruments: Arc<VirtualInstrumentRegistry>,
    instrument_uid: String,
    value: InstrumentValue,
}

impl StepAction for SetInstrument {
    fn instrument_uids(&self) -> Vec<String> {
        vec![self.instrument_uid.clone()]
    }

    fn execute(&self, _abort: &CancellationToken) -> anyhow::Result<Outcome> {
        let instrument = lookup(&self.instruments, &self.instrument_uid)?;
        if !instrument.is_commandable() {
            bail!("instrument '{}' cannot be commanded", self.instrument_uid);
        }
        if !instrument.command(&self.value) {
            bail!("command {} to '{}' was not accepted", self.value, self.instrument_uid);
        }
        info!(instrument = %self.instrument_uid, value = %self.value, "Instrument commanded");
        Ok(Outcome::Succeeded)
    }
}

pub fn build_set(
    configuration: &StepConfiguration,
    context: &StepContext,
) -> BenchResult<Box<dyn StepAction>> {
    let parameters: SetParameters = configuration.parameters()?;
    Ok(Box::new(SetInstrument {
        instruments: context.instruments.clone(),
        instrument_uid: parameters.instrument_uid,
        value: parameters.value,
    }))
}

#[derive(Debug, Deserialize)]
struct WaitForParameters {
    instrument_uid: String,
    condition: Condition,
    /// Seconds; waits indefinitely when absent
    #[serde(default)]
    timeout: Option<f64>,
}

/// Blocks until an instrument satisfies a condition.
pub struct WaitForInstrument {
    instruments: Arc<VirtualInstrumentRegistry>,
    instrument_uid: String,
    condition: Condition,
    timeout: Option<Duration>,
}

impl StepAction for WaitForInstrument {
    fn instrument_uids(&self) -> Vec<String> {
        vec![self.instrument_uid.clone()]
    }

    fn execute(&self, abort: &CancellationToken) -> anyhow::Result<Outcome> {
        let instrument = lookup(&self.instruments, &self.instrument_uid)?;
        let deadline = self.timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            if abort.is_cancelled() {
                return Ok(Outcome::Aborted);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        bail!(
                            "instrument '{}' did not reach {} within {:?}",
                            self.instrument_uid,
                            self.condition,
                            self.timeout.unwrap_or_default()
                        );
                    }
                    remaining.min(ABORT_POLL)
                }
                None => ABORT_POLL,
            };
            match instrument.wait_for(|s| self.condition.holds(&s.value), Some(slice)) {
                Ok(state) => {
                    info!(
                        instrument = %self.instrument_uid,
                        value = %state.value,
                        sequence = state.sequence,
                        "Instrument condition met"
                    );
                    return Ok(Outcome::Succeeded);
                }
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

pub fn build_wait_for(
    configuration: &StepConfiguration,
    context: &StepContext,
) -> BenchResult<Box<dyn StepAction>> {
    let parameters: WaitForParameters = configuration.parameters()?;
    let timeout = parameters
        .timeout
        .map(Duration::try_from_secs_f64)
        .transpose()
        .map_err(|e| {
            BenchError::build(format!(
                "step '{}': invalid timeout: {e}",
                configuration.metadata.uid
            ))
        })?;
    Ok(Box::new(WaitForInstrument {
        instruments: context.instruments.clone(),
        instrument_uid: parameters.instrument_uid,
        condition: parameters.condition,
        timeout,
    }))
}

#[derive(Debug, Deserialize)]
struct CheckParameters {
    instrument_uid: String,
    condition: Condition,
    /// Report a violated condition as a warning instead of a failure
    #[serde(default)]
    warn_only: bool,
}

/// Compares the latest value of an instrument once.
pub struct CheckInstrument {
    instruments: Arc<VirtualInstrumentRegistry>,
    instrument_uid: String,
    condition: Condition,
    warn_only: bool,
}

impl StepAction for CheckInstrument {
    fn instrument_uids(&self) -> Vec<String> {
        vec![self.instrument_uid.clone()]
    }

    fn execute(&self, _abort: &CancellationToken) -> anyhow::Result<Outcome> {
        let instrument = lookup(&self.instruments, &self.instrument_uid)?;
        let value = instrument
            .value()
            .map_err(|e| anyhow!("cannot check '{}': {e}", self.instrument_uid))?;
        if self.condition.holds(&value) {
            return Ok(Outcome::Succeeded);
        }
        warn!(
            instrument = %self.instrument_uid,
            value = %value,
            condition = %self.condition,
            "Instrument check failed"
        );
        Ok(if self.warn_only {
            Outcome::SucceededWithWarnings
        } else {
            Outcome::Failed
        })
    }
}

pub fn build_check(
    configuration: &StepConfiguration,
    context: &StepContext,
) -> BenchResult<Box<dyn StepAction>> {
    let parameters: CheckParameters = configuration.parameters()?;
    Ok(Box::new(CheckInstrument {
        instruments: context.instruments.clone(),
        instrument_uid: parameters.instrument_uid,
        condition: parameters.condition,
        warn_only: parameters.warn_only,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::{instrument_registry, VirtualInstrument, VirtualInstrumentMetadata};
    use parking_lot::Mutex;
    use serde_json::json;
    use tracing_test::traced_test;

    fn context() -> StepContext {
        StepContext {
            instruments: Arc::new(instrument_registry()),
        }
    }

    fn configuration(value: serde_json::Value) -> StepConfiguration {
        serde_json::from_value(value).unwrap()
    }

    fn condition(op: Comparison, value: impl Into<InstrumentValue>) -> Condition {
        Condition {
            op,
            value: value.into(),
        }
    }

    #[test]
    fn conditions_compare_numbers_across_types() {
        assert!(condition(Comparison::Eq, 1_i64).holds(&InstrumentValue::Float(1.0)));
        assert!(condition(Comparison::Ge, 0.5).holds(&InstrumentValue::Bool(true)));
        assert!(condition(Comparison::Lt, 30.0).holds(&InstrumentValue::Int(21)));
        assert!(condition(Comparison::Ne, "idle").holds(&InstrumentValue::Text("busy".into())));
        assert!(!condition(Comparison::Gt, "a").holds(&InstrumentValue::Text("b".into())));
    }

    #[test]
    fn set_instrument_forwards_command() {
        let context = context();
        let received = Arc::new(Mutex::new(Vec::new()));
        let vi = {
            let received = received.clone();
            VirtualInstrument::new(VirtualInstrumentMetadata::new("heater")).with_command(
                move |v: &InstrumentValue| {
                    received.lock().push(v.clone());
                    Ok(())
                },
            )
        };
        context.instruments.register("heater", Arc::new(vi)).unwrap();

        let step = build_set(
            &configuration(json!({
                "metadata": { "uid": "on" },
                "class": SET_CLASS_NAME,
                "instrument_uid": "heater",
                "value": true,
            })),
            &context,
        )
        .unwrap();
        assert_eq!(step.instrument_uids(), vec!["heater".to_string()]);
        assert_eq!(step.execute(&CancellationToken::new()).unwrap(), Outcome::Succeeded);
        assert_eq!(*received.lock(), vec![InstrumentValue::Bool(true)]);
    }

    #[test]
    fn set_on_read_only_instrument_is_an_error() {
        let context = context();
        context
            .instruments
            .register(
                "thermometer",
                Arc::new(VirtualInstrument::new(VirtualInstrumentMetadata::new("thermometer"))),
            )
            .unwrap();
        let step = build_set(
            &configuration(json!({
                "metadata": { "uid": "bad" },
                "class": SET_CLASS_NAME,
                "instrument_uid": "thermometer",
                "value": 3,
            })),
            &context,
        )
        .unwrap();
        assert!(step.execute(&CancellationToken::new()).is_err());
    }

    #[test]
    fn wait_for_instrument_sees_later_update() {
        let context = context();
        let vi = Arc::new(VirtualInstrument::new(VirtualInstrumentMetadata::new("temp")));
        context.instruments.register("temp", vi.clone()).unwrap();
        vi.update_state(InstrumentValue::Float(20.0));

        let step = build_wait_for(
            &configuration(json!({
                "metadata": { "uid": "warm-up" },
                "class": WAIT_FOR_CLASS_NAME,
                "instrument_uid": "temp",
                "condition": { "op": "ge", "value": 40 },
                "timeout": 5.0,
            })),
            &context,
        )
        .unwrap();

        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            vi.update_state(InstrumentValue::Float(41.5));
        });
        assert_eq!(step.execute(&CancellationToken::new()).unwrap(), Outcome::Succeeded);
        producer.join().unwrap();
    }

    #[test]
    fn wait_for_instrument_times_out_and_honours_abort() {
        let context = context();
        let vi = Arc::new(VirtualInstrument::new(VirtualInstrumentMetadata::new("temp")));
        context.instruments.register("temp", vi).unwrap();
        let config = |timeout: f64| {
            configuration(json!({
                "metadata": { "uid": "warm-up" },
                "class": WAIT_FOR_CLASS_NAME,
                "instrument_uid": "temp",
                "condition": { "op": "gt", "value": 100 },
                "timeout": timeout,
            }))
        };

        let step = build_wait_for(&config(0.05), &context).unwrap();
        let err = step.execute(&CancellationToken::new()).unwrap_err();
        assert!(err.to_string().contains("did not reach > 100"));

        let step = build_wait_for(&config(10.0), &context).unwrap();
        let abort = CancellationToken::new();
        let trigger = abort.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            trigger.cancel();
        });
        let start = Instant::now();
        assert_eq!(step.execute(&abort).unwrap(), Outcome::Aborted);
        assert!(start.elapsed() < Duration::from_secs(1));
        canceller.join().unwrap();
    }

    #[test]
    #[traced_test]
    fn check_instrument_fails_or_warns() {
        let context = context();
        let vi = Arc::new(VirtualInstrument::new(VirtualInstrumentMetadata::new("pressure")));
        context.instruments.register("pressure", vi.clone()).unwrap();
        let config = |warn_only: bool| {
            configuration(json!({
                "metadata": { "uid": "leak-check" },
                "class": CHECK_CLASS_NAME,
                "instrument_uid": "pressure",
                "condition": { "op": "lt", "value": 1.0 },
                "warn_only": warn_only,
            }))
        };
        let abort = CancellationToken::new();

        let strict = build_check(&config(false), &context).unwrap();
        assert!(strict.execute(&abort).is_err());

        vi.update_state(InstrumentValue::Float(0.2));
        assert_eq!(strict.execute(&abort).unwrap(), Outcome::Succeeded);

        vi.update_state(InstrumentValue::Float(3.0));
        assert_eq!(strict.execute(&abort).unwrap(), Outcome::Failed);
        let lenient = build_check(&config(true), &context).unwrap();
        assert_eq!(lenient.execute(&abort).unwrap(), Outcome::SucceededWithWarnings);
        assert!(logs_contain("Instrument check failed"));
    }
}
