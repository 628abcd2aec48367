//! Polling strategy: read one physical instrument at a fixed interval.
//!
//! The getter either returns a single scalar, broadcast to every output, or an
//! array mapped positionally onto the outputs in configuration order. A reading
//! whose length does not match the number of outputs is skipped with a warning.
//!
//! ```yaml
//! translators:
//!   - metadata: { uid: psu-poller }
//!     class: PollingTranslator
//!     physical_instrument_uid: psu
//!     getter_function: read_all
//!     polling_interval: 0.5
//!     entities:
//!       - virtual_instrument: { uid: psu-current, unit: A }
//!       - virtual_instrument: { uid: psu-voltage, unit: V }
//!         setter_function: set
//!         setter_arguments: { channel: voltage }
//! ```

use super::{
    build_output, register_outputs, TranslationLoop, Translator, TranslatorConfiguration,
    TranslatorContext,
};
use crate::physical::{Arguments, PhysicalInstrument};
use bench_core::{
    BenchError, BenchResult, CancellationToken, Instrument, InstrumentValue,
    VirtualInstrumentMetadata,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Class tag of the polling strategy.
pub const CLASS_NAME: &str = "PollingTranslator";

fn default_polling_interval() -> f64 {
    1.0
}

/// One output of a polling translator.
#[derive(Debug, Clone, Deserialize)]
pub struct PollingEntity {
    /// Physical method called by `command`
    #[serde(default)]
    pub setter_function: Option<String>,
    /// Keyword arguments passed to the setter
    #[serde(default)]
    pub setter_arguments: Arguments,
    /// Output instrument metadata
    pub virtual_instrument: VirtualInstrumentMetadata,
}

/// Fields specific to `PollingTranslator`.
#[derive(Debug, Clone, Deserialize)]
pub struct PollingSettings {
    /// Source instrument
    pub physical_instrument_uid: String,
    /// Method returning the reading(s)
    pub getter_function: String,
    /// Keyword arguments passed to the getter
    #[serde(default)]
    pub getter_arguments: Arguments,
    /// Seconds between the start of consecutive polls
    #[serde(default = "default_polling_interval")]
    pub polling_interval: f64,
    /// Outputs, in reading order
    #[serde(default)]
    pub entities: Vec<PollingEntity>,
}

/// Polling cycle state.
pub struct PollingLoop {
    translator_uid: String,
    physical_uid: String,
    physical: Arc<dyn PhysicalInstrument>,
    getter: String,
    getter_arguments: Arguments,
    interval: Duration,
    outputs: Vec<Arc<Instrument>>,
}

impl PollingLoop {
    /// Read once and distribute. Returns the number of outputs updated.
    pub fn poll_once(&self) -> usize {
        let reading = match self
            .physical
            .invoke(&self.getter, &[], &self.getter_arguments)
        {
            Ok(reading) => reading,
            Err(e) => {
                warn!(
                    translator = %self.translator_uid,
                    physical_instrument = %self.physical_uid,
                    error = %format!("{e:#}"),
                    "Error polling physical instrument"
                );
                return 0;
            }
        };

        let values = match reading {
            Value::Array(values) => values,
            scalar => vec![scalar; self.outputs.len()],
        };

        if values.len() != self.outputs.len() {
            warn!(
                translator = %self.translator_uid,
                "Polled {} values but have {} virtual instruments configured. Skipping update.",
                values.len(),
                self.outputs.len()
            );
            return 0;
        }

        let mut updated = 0;
        for (value, output) in values.into_iter().zip(&self.outputs) {
            match InstrumentValue::try_from(value) {
                Ok(value) => {
                    output.update_state(value);
                    updated += 1;
                }
                Err(e) => warn!(
                    translator = %self.translator_uid,
                    instrument = %output.uid(),
                    error = %e,
                    "Error updating virtual instrument state"
                ),
            }
        }
        updated
    }
}

impl TranslationLoop for PollingLoop {
    fn translate(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let started = Instant::now();
        self.poll_once();

        let elapsed = started.elapsed();
        match self.interval.checked_sub(elapsed) {
            Some(remaining) if !remaining.is_zero() => {
                cancel.wait_timeout(remaining);
            }
            _ => warn!(
                translator = %self.translator_uid,
                "Polling loop missed its interval by {:.3} seconds",
                elapsed.saturating_sub(self.interval).as_secs_f64()
            ),
        }
        Ok(())
    }
}

/// Settings plus the polling interval, which must be a positive, representable
/// number of seconds.
fn parse(configuration: &TranslatorConfiguration) -> BenchResult<(PollingSettings, Duration)> {
    let settings: PollingSettings = configuration.settings()?;
    let interval = Duration::try_from_secs_f64(settings.polling_interval)
        .ok()
        .filter(|interval| !interval.is_zero())
        .ok_or_else(|| {
            BenchError::build(format!(
                "translator '{}': polling_interval must be a positive number of seconds, got {}",
                configuration.metadata.uid, settings.polling_interval
            ))
        })?;
    if settings.entities.is_empty() {
        warn!(
            translator = %configuration.metadata.uid,
            "Polling translator has no entities configured"
        );
    }
    Ok((settings, interval))
}

/// Build the polling loop without registering or starting anything.
pub fn build_loop(
    configuration: &TranslatorConfiguration,
    context: &TranslatorContext,
) -> BenchResult<PollingLoop> {
    let (settings, interval) = parse(configuration)?;
    let physical = context.physical.get(&settings.physical_instrument_uid)?;

    let outputs = settings
        .entities
        .into_iter()
        .map(|entity| {
            build_output(
                context,
                entity.virtual_instrument,
                &physical,
                entity.setter_function.as_deref(),
                &entity.setter_arguments,
            )
        })
        .collect();

    Ok(PollingLoop {
        translator_uid: configuration.metadata.uid.clone(),
        physical_uid: settings.physical_instrument_uid,
        physical,
        getter: settings.getter_function,
        getter_arguments: settings.getter_arguments,
        interval,
        outputs,
    })
}

/// [`TranslatorConstructor`](super::TranslatorConstructor) for `PollingTranslator`.
pub fn build(
    configuration: &TranslatorConfiguration,
    context: &TranslatorContext,
) -> BenchResult<Translator> {
    let work = build_loop(configuration, context)?;
    let outputs = work.outputs.clone();
    register_outputs(&context.instruments, &outputs)?;

    Ok(Translator::new(
        configuration.metadata.clone(),
        CLASS_NAME,
        outputs,
        Box::new(work),
        CancellationToken::new(),
    ))
}
