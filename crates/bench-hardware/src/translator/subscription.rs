//! Subscription strategy: react to messages pushed by a physical instrument.
//!
//! The translator registers one callback with the instrument's push mechanism
//! when it is built. For every message, each output entity extracts its value by
//!
//! 1. `extractor_field`: a dot path into the message (`meta.version`, `samples.0`)
//! 2. `extractor_function`: a physical method called with the message
//! 3. neither: the raw message
//!
//! Extraction failures only affect their own entity. The worker loop itself has
//! nothing to do and just idles until stopped.

use super::{
    build_output, register_outputs, unregister_outputs, TranslationLoop, Translator,
    TranslatorConfiguration, TranslatorContext,
};
use crate::physical::{Arguments, PhysicalInstrument};
use bench_core::{
    BenchError, BenchResult, CancellationToken, Instrument, InstrumentValue,
    VirtualInstrumentMetadata,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Class tag of the subscription strategy.
pub const CLASS_NAME: &str = "SubscriptionTranslator";

const IDLE_POLL: Duration = Duration::from_millis(100);

/// One output of a subscription translator.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionEntity {
    /// Dot path into the message
    #[serde(default)]
    pub extractor_field: Option<String>,
    /// Physical method transforming the message
    #[serde(default)]
    pub extractor_function: Option<String>,
    /// Keyword arguments passed to the extractor function
    #[serde(default)]
    pub extractor_arguments: Arguments,
    /// Physical method called by `command`
    #[serde(default)]
    pub setter_function: Option<String>,
    /// Keyword arguments passed to the setter
    #[serde(default)]
    pub setter_arguments: Arguments,
    /// Output instrument metadata
    pub virtual_instrument: VirtualInstrumentMetadata,
}

/// Fields specific to `SubscriptionTranslator`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionSettings {
    /// Source instrument
    pub physical_instrument_uid: String,
    /// Push mechanism on the source
    pub subscribe_function: String,
    /// Outputs
    #[serde(default)]
    pub entities: Vec<SubscriptionEntity>,
}

enum Extractor {
    Field(Vec<String>),
    Function { method: String, arguments: Arguments },
    Raw,
}

impl Extractor {
    fn from_entity(entity: &SubscriptionEntity) -> Self {
        match (&entity.extractor_field, &entity.extractor_function) {
            (Some(path), _) => Extractor::Field(path.split('.').map(str::to_string).collect()),
            (None, Some(method)) => Extractor::Function {
                method: method.clone(),
                arguments: entity.extractor_arguments.clone(),
            },
            (None, None) => Extractor::Raw,
        }
    }

    fn extract(&self, physical: &Weak<dyn PhysicalInstrument>, message: &Value) -> anyhow::Result<Value> {
        match self {
            Extractor::Field(path) => project(message, path),
            Extractor::Function { method, arguments } => {
                let physical = physical
                    .upgrade()
                    .ok_or_else(|| anyhow::anyhow!("physical instrument is gone"))?;
                physical.invoke(method, std::slice::from_ref(message), arguments)
            }
            Extractor::Raw => Ok(message.clone()),
        }
    }
}

/// Follow a dot path through objects (by key) and arrays (by index).
fn project(message: &Value, path: &[String]) -> anyhow::Result<Value> {
    let mut current = message;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(|| anyhow::anyhow!("field '{}' not found in message", path.join(".")))?;
    }
    Ok(current.clone())
}

/// Routes pushed messages to the outputs.
struct Dispatcher {
    translator_uid: String,
    physical: Weak<dyn PhysicalInstrument>,
    routes: Vec<(Extractor, Arc<Instrument>)>,
    cancel: CancellationToken,
}

impl Dispatcher {
    fn on_message(&self, message: &Value) -> usize {
        if self.cancel.is_cancelled() {
            return 0;
        }
        let mut updated = 0;
        for (extractor, output) in &self.routes {
            let extracted = extractor
                .extract(&self.physical, message)
                .and_then(InstrumentValue::try_from);
            match extracted {
                Ok(value) => {
                    output.update_state(value);
                    updated += 1;
                }
                Err(e) => warn!(
                    translator = %self.translator_uid,
                    instrument = %output.uid(),
                    error = %format!("{e:#}"),
                    "Error processing subscription message"
                ),
            }
        }
        updated
    }
}

struct IdleLoop;

impl TranslationLoop for IdleLoop {
    fn translate(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
        cancel.wait_timeout(IDLE_POLL);
        Ok(())
    }
}

/// [`TranslatorConstructor`](super::TranslatorConstructor) for `SubscriptionTranslator`.
pub fn build(
    configuration: &TranslatorConfiguration,
    context: &TranslatorContext,
) -> BenchResult<Translator> {
    let uid = &configuration.metadata.uid;
    let settings: SubscriptionSettings = configuration.settings()?;
    let physical = context.physical.get(&settings.physical_instrument_uid)?;
    if settings.entities.is_empty() {
        warn!(translator = %uid, "Subscription translator has no entities configured");
    }

    let routes: Vec<(Extractor, Arc<Instrument>)> = settings
        .entities
        .into_iter()
        .map(|entity| {
            let extractor = Extractor::from_entity(&entity);
            let output = build_output(
                context,
                entity.virtual_instrument,
                &physical,
                entity.setter_function.as_deref(),
                &entity.setter_arguments,
            );
            (extractor, output)
        })
        .collect();
    let outputs: Vec<Arc<Instrument>> = routes.iter().map(|(_, vi)| vi.clone()).collect();
    register_outputs(&context.instruments, &outputs)?;

    let cancel = CancellationToken::new();
    let dispatcher = Arc::new(Dispatcher {
        translator_uid: uid.clone(),
        physical: Arc::downgrade(&physical),
        routes,
        cancel: cancel.clone(),
    });
    let callback = {
        let dispatcher = dispatcher.clone();
        Arc::new(move |message: Value| {
            dispatcher.on_message(&message);
        })
    };
    let subscription = match physical.subscribe(&settings.subscribe_function, callback) {
        Ok(id) => id,
        Err(e) => {
            unregister_outputs(&context.instruments, &outputs);
            return Err(BenchError::build(format!(
                "translator '{uid}': cannot subscribe via '{}': {e:#}",
                settings.subscribe_function
            )));
        }
    };
    let release = {
        let physical = Arc::downgrade(&physical);
        let method = settings.subscribe_function;
        let uid = uid.clone();
        Box::new(move || {
            if let Some(physical) = physical.upgrade() {
                if !physical.unsubscribe(&method, subscription) {
                    debug!(translator = %uid, "Subscription already released by the instrument");
                }
            }
        })
    };

    Ok(Translator::new(
        configuration.metadata.clone(),
        CLASS_NAME,
        outputs,
        Box::new(IdleLoop),
        cancel,
    )
    .with_release(release))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MockInstrument;
    use crate::physical::physical_registry;
    use serde_json::json;
    use tracing_test::traced_test;

    fn context() -> (TranslatorContext, Arc<MockInstrument>) {
        let mock = Arc::new(MockInstrument::new([
            ("current", json!(0.5)),
            ("status", json!("idle")),
            ("voltage", json!(12.0)),
        ]));
        let physical = physical_registry();
        physical.register("psu", mock.clone()).unwrap();
        let context = TranslatorContext {
            physical: Arc::new(physical),
            instruments: Arc::new(bench_core::instrument_registry()),
            history_capacity: 0,
        };
        (context, mock)
    }

    fn configuration(subscribe: &str) -> TranslatorConfiguration {
        serde_json::from_value(json!({
            "metadata": { "uid": "listener" },
            "class_name": CLASS_NAME,
            "physical_instrument_uid": "psu",
            "subscribe_function": subscribe,
            "entities": [
                { "virtual_instrument": { "uid": "status" }, "extractor_field": "status" },
                {
                    "virtual_instrument": { "uid": "millivolts" },
                    "extractor_function": "scale",
                    "extractor_arguments": { "channel": "voltage", "factor": 1000 }
                },
                { "virtual_instrument": { "uid": "missing" }, "extractor_field": "frequency" },
            ],
        }))
        .unwrap()
    }

    #[test]
    fn project_walks_objects_and_arrays() {
        let message = json!({ "meta": { "version": 3 }, "samples": [1, 2, 3] });
        let path = |p: &str| p.split('.').map(str::to_string).collect::<Vec<_>>();

        assert_eq!(project(&message, &path("meta.version")).unwrap(), json!(3));
        assert_eq!(project(&message, &path("samples.2")).unwrap(), json!(3));
        assert!(project(&message, &path("samples.9")).is_err());
        assert!(project(&message, &path("meta.version.major")).is_err());
    }

    #[test]
    #[traced_test]
    fn pushed_messages_update_outputs_with_isolated_failures() {
        let (context, mock) = context();
        let translator = build(&configuration("on_update"), &context).unwrap();
        assert_eq!(mock.listener_count(), 1);

        mock.set_channel("voltage", json!(1.5)).unwrap();

        let status = context.instruments.get("status").unwrap();
        let millivolts = context.instruments.get("millivolts").unwrap();
        let missing = context.instruments.get("missing").unwrap();
        assert_eq!(status.value().unwrap(), InstrumentValue::Text("idle".into()));
        assert_eq!(millivolts.value().unwrap(), InstrumentValue::Float(1500.0));
        assert!(missing.get_latest_state().is_err());
        assert!(logs_contain("field 'frequency' not found in message"));

        translator.stop();
        assert_eq!(mock.listener_count(), 0);
        mock.set_channel("voltage", json!(2.0)).unwrap();
        assert_eq!(millivolts.get_latest_state().unwrap().sequence, 0);
    }

    #[test]
    fn rebuilt_translators_do_not_accumulate_listeners() {
        let (context, mock) = context();
        for _ in 0..3 {
            let translator = build(&configuration("on_update"), &context).unwrap();
            translator.start().unwrap();
            assert_eq!(mock.listener_count(), 1);
            translator.shutdown(&context.instruments);
        }
        assert_eq!(mock.listener_count(), 0);
        assert!(context.instruments.is_empty());
    }

    #[test]
    fn raw_message_without_extractor() {
        let (context, mock) = context();
        let configuration: TranslatorConfiguration = serde_json::from_value(json!({
            "metadata": { "uid": "raw" },
            "class": CLASS_NAME,
            "physical_instrument_uid": "psu",
            "subscribe_function": "on_update",
            "entities": [{ "virtual_instrument": { "uid": "everything" } }],
        }))
        .unwrap();
        let _translator = build(&configuration, &context).unwrap();

        // Snapshots are objects, which are not scalar instrument values
        mock.set_channel("status", json!("busy")).unwrap();
        let vi = context.instruments.get("everything").unwrap();
        assert!(vi.get_latest_state().is_err());
    }

    #[test]
    fn failed_subscription_rolls_back_outputs() {
        let (context, _mock) = context();
        let err = build(&configuration("on_fire"), &context).unwrap_err();
        assert!(matches!(err, BenchError::Build(_)));
        assert!(context.instruments.is_empty());
    }

    #[test]
    fn idle_loop_returns_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = std::time::Instant::now();
        IdleLoop.translate(&cancel).unwrap();
        assert!(start.elapsed() < IDLE_POLL);
    }
}
