//! `Wait`: pause the run for a fixed duration.

use crate::state::Outcome;
use crate::step::{StepAction, StepConfiguration, StepContext};
use bench_core::{BenchError, BenchResult, CancellationToken};
use serde::Deserialize;
use std::time::Duration;

pub const CLASS_NAME: &str = "Wait";

#[derive(Debug, Deserialize)]
struct WaitParameters {
    /// Seconds
    duration: f64,
}

/// Sleeps for `duration`, waking early on abort.
#[derive(Debug)]
pub struct Wait {
    duration: Duration,
}

impl Wait {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl StepAction for Wait {
    fn execute(&self, abort: &CancellationToken) -> anyhow::Result<Outcome> {
        if abort.wait_timeout(self.duration) {
            Ok(Outcome::Aborted)
        } else {
            Ok(Outcome::Succeeded)
        }
    }
}

pub fn build(
    configuration: &StepConfiguration,
    _context: &StepContext,
) -> BenchResult<Box<dyn StepAction>> {
    let parameters: WaitParameters = configuration.parameters()?;
    let duration = Duration::try_from_secs_f64(parameters.duration).map_err(|e| {
        BenchError::build(format!(
            "step '{}': invalid duration {}: {e}",
            configuration.metadata.uid, parameters.duration
        ))
    })?;
    Ok(Box::new(Wait::new(duration)))
}
