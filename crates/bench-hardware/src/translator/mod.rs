//! Translators: background workers mapping physical instruments onto virtual ones.
//!
//! Every [`Translator`] owns its output virtual instruments and exactly one
//! dedicated worker thread (`translator-<uid>`). The worker repeatedly runs one
//! [`TranslationLoop`] cycle until [`Translator::stop`] cancels it. A cycle that
//! returns an error or panics is logged and the loop carries on after a short
//! back-off, so one faulty translator never takes down its siblings.
//!
//! Concrete strategies are selected by the `class` tag of a
//! [`TranslatorConfiguration`] through the [`TranslatorRegistry`]:
//!
//! - `PollingTranslator` ([`polling`]) pulls readings at a fixed interval
//! - `SubscriptionTranslator` ([`subscription`]) reacts to pushed messages

pub mod polling;
pub mod subscription;

use crate::physical::{Arguments, PhysicalInstrument, PhysicalInstrumentRegistry};
use bench_core::{
    panic_message, BenchError, BenchResult, CancellationToken, Instrument, InstrumentValue,
    Registry, VirtualInstrument, VirtualInstrumentMetadata, VirtualInstrumentRegistry,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pause after a failed cycle before the next attempt.
const FAULT_BACKOFF: Duration = Duration::from_millis(100);

/// Descriptive metadata of a translator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslatorMetadata {
    /// Registry key
    pub uid: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Generic translator configuration.
///
/// Strategy-specific fields stay in `settings` until the constructor selected by
/// `class` parses them with [`settings`](Self::settings).
#[derive(Debug, Clone, Deserialize)]
pub struct TranslatorConfiguration {
    /// Translator metadata
    pub metadata: TranslatorMetadata,
    /// Strategy tag
    #[serde(alias = "class_name")]
    pub class: String,
    /// Remaining fields
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl TranslatorConfiguration {
    /// Parse the strategy-specific fields.
    pub fn settings<T: DeserializeOwned>(&self) -> BenchResult<T> {
        serde_json::from_value(Value::Object(self.settings.clone())).map_err(|e| {
            BenchError::build(format!(
                "translator '{}' ({}): {e}",
                self.metadata.uid, self.class
            ))
        })
    }
}

/// Registries a translator constructor resolves against.
#[derive(Clone)]
pub struct TranslatorContext {
    /// Source instruments
    pub physical: Arc<PhysicalInstrumentRegistry>,
    /// Where outputs are registered
    pub instruments: Arc<VirtualInstrumentRegistry>,
    /// History retained by each output instrument
    pub history_capacity: usize,
}

/// One cycle of translation work, run repeatedly on the worker thread.
pub trait TranslationLoop: Send {
    /// Run one cycle. Long waits inside a cycle should go through `cancel` so
    /// that [`Translator::stop`] is not held up.
    fn translate(&mut self, cancel: &CancellationToken) -> anyhow::Result<()>;
}

/// Hook run once when a translator stops, e.g. to drop a push subscription.
pub type ReleaseHook = Box<dyn FnOnce() + Send>;

/// A running (or runnable) translator and its outputs.
pub struct Translator {
    metadata: TranslatorMetadata,
    class: String,
    outputs: Vec<Arc<Instrument>>,
    cancel: CancellationToken,
    work: Mutex<Option<Box<dyn TranslationLoop>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    release: Mutex<Option<ReleaseHook>>,
}

impl std::fmt::Debug for Translator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translator")
            .field("uid", &self.metadata.uid)
            .field("class", &self.class)
            .field("outputs", &self.output_uids())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Translator {
    /// Assemble a translator. `cancel` must be the token the loop (and any push
    /// callbacks) observe.
    pub fn new(
        metadata: TranslatorMetadata,
        class: impl Into<String>,
        outputs: Vec<Arc<Instrument>>,
        work: Box<dyn TranslationLoop>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            metadata,
            class: class.into(),
            outputs,
            cancel,
            work: Mutex::new(Some(work)),
            worker: Mutex::new(None),
            release: Mutex::new(None),
        }
    }

    /// Run `release` once when the translator stops.
    pub fn with_release(self, release: ReleaseHook) -> Self {
        *self.release.lock() = Some(release);
        self
    }

    /// Translator metadata.
    pub fn metadata(&self) -> &TranslatorMetadata {
        &self.metadata
    }

    /// Strategy tag.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Output instruments, in configuration order.
    pub fn outputs(&self) -> &[Arc<Instrument>] {
        &self.outputs
    }

    /// Output instrument uids, in configuration order.
    pub fn output_uids(&self) -> Vec<String> {
        self.outputs.iter().map(|vi| vi.uid().to_string()).collect()
    }

    /// Whether the worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Launch the worker thread. A translator can be started once.
    pub fn start(&self) -> BenchResult<()> {
        let mut worker = self.worker.lock();
        let invalid = |state: &str| BenchError::InvalidState {
            uid: self.metadata.uid.clone(),
            action: "start",
            state: state.to_string(),
        };
        if self.cancel.is_cancelled() {
            return Err(invalid("stopped"));
        }
        let Some(mut work) = self.work.lock().take() else {
            return Err(invalid("running"));
        };

        let uid = self.metadata.uid.clone();
        let cancel = self.cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("translator-{uid}"))
            .spawn(move || run_worker(&uid, work.as_mut(), &cancel))?;
        *worker = Some(handle);

        info!(
            translator = %self.metadata.uid,
            class = %self.class,
            outputs = self.outputs.len(),
            "Translator started"
        );
        Ok(())
    }

    /// Cancel the worker and wait for its current cycle to finish. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(release) = self.release.lock().take() {
            release();
        }
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!(translator = %self.metadata.uid, "Translator worker terminated abnormally");
        }
        info!(translator = %self.metadata.uid, "Translator stopped");
    }

    /// Stop and unregister this translator's outputs from `registry`.
    ///
    /// Entries that were since replaced by another instrument are left alone.
    pub fn shutdown(&self, registry: &VirtualInstrumentRegistry) {
        self.stop();
        for output in &self.outputs {
            let ours = registry
                .get(output.uid())
                .is_ok_and(|registered| Arc::ptr_eq(&registered, output));
            if ours {
                let _ = registry.unregister(output.uid());
            }
        }
    }
}

impl Drop for Translator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(uid: &str, work: &mut dyn TranslationLoop, cancel: &CancellationToken) {
    debug!(translator = %uid, "Translator worker running");
    while !cancel.is_cancelled() {
        let fault = match panic::catch_unwind(AssertUnwindSafe(|| work.translate(cancel))) {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => format!("{e:#}"),
            Err(payload) => format!("panic: {}", panic_message(payload.as_ref())),
        };
        warn!(translator = %uid, error = %fault, "Translation cycle failed");
        cancel.wait_timeout(FAULT_BACKOFF);
    }
    debug!(translator = %uid, "Translator worker exiting");
}

/// Build an output instrument, wiring `setter` on `physical` as its command path.
pub(crate) fn build_output(
    context: &TranslatorContext,
    metadata: VirtualInstrumentMetadata,
    physical: &Arc<dyn PhysicalInstrument>,
    setter: Option<&str>,
    setter_arguments: &Arguments,
) -> Arc<Instrument> {
    let mut instrument =
        VirtualInstrument::new(metadata).with_history_capacity(context.history_capacity);
    if let Some(setter) = setter {
        let physical = Arc::downgrade(physical);
        let setter = setter.to_string();
        let arguments = setter_arguments.clone();
        instrument = instrument.with_command(move |value: &InstrumentValue| {
            let physical = physical
                .upgrade()
                .ok_or_else(|| anyhow::anyhow!("physical instrument is gone"))?;
            physical.invoke(&setter, &[value.to_json()], &arguments)?;
            Ok(())
        });
    }
    Arc::new(instrument)
}

/// Register every output, rolling back on the first collision.
pub(crate) fn register_outputs(
    registry: &VirtualInstrumentRegistry,
    outputs: &[Arc<Instrument>],
) -> BenchResult<()> {
    for (index, output) in outputs.iter().enumerate() {
        if let Err(e) = registry.register(output.uid(), output.clone()) {
            for registered in &outputs[..index] {
                let _ = registry.unregister(registered.uid());
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Undo [`register_outputs`].
pub(crate) fn unregister_outputs(registry: &VirtualInstrumentRegistry, outputs: &[Arc<Instrument>]) {
    for output in outputs {
        let _ = registry.unregister(output.uid());
    }
}

/// Constructor selected by a translator class tag.
pub type TranslatorConstructor =
    fn(&TranslatorConfiguration, &TranslatorContext) -> BenchResult<Translator>;

/// Class tag to translator constructor mapping.
pub struct TranslatorRegistry {
    constructors: Registry<TranslatorConstructor>,
}

impl Default for TranslatorRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl TranslatorRegistry {
    /// Registry with no strategies.
    pub fn empty() -> Self {
        Self {
            constructors: Registry::new("translator class"),
        }
    }

    /// Registry with the polling and subscription strategies.
    pub fn with_builtin() -> Self {
        let registry = Self::empty();
        let builtin: [(&str, TranslatorConstructor); 2] = [
            (polling::CLASS_NAME, polling::build),
            (subscription::CLASS_NAME, subscription::build),
        ];
        for (tag, constructor) in builtin {
            // Tags are distinct constants
            let _ = registry.register(tag, constructor);
        }
        registry
    }

    /// Add a strategy. Fails with `Duplicate` if the tag is taken.
    pub fn register(&self, tag: &str, constructor: TranslatorConstructor) -> BenchResult<()> {
        self.constructors.register(tag, constructor)
    }

    /// Registered class tags.
    pub fn class_names(&self) -> Vec<String> {
        self.constructors.keys()
    }

    /// Construct a translator. Unknown class tags fail with `NotFound`.
    pub fn build(
        &self,
        configuration: &TranslatorConfiguration,
        context: &TranslatorContext,
    ) -> BenchResult<Translator> {
        let constructor = self.constructors.get(&configuration.class)?;
        constructor(configuration, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        cycles: Arc<AtomicUsize>,
    }

    impl TranslationLoop for Flaky {
        fn translate(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
            let cycle = self.cycles.fetch_add(1, Ordering::SeqCst);
            match cycle % 3 {
                0 => anyhow::bail!("sensor glitch"),
                1 => panic!("driver bug"),
                _ => {
                    cancel.wait_timeout(Duration::from_millis(5));
                    Ok(())
                }
            }
        }
    }

    fn metadata(uid: &str) -> TranslatorMetadata {
        TranslatorMetadata {
            uid: uid.to_string(),
            name: None,
            description: None,
        }
    }

    #[test]
    fn worker_survives_errors_and_panics() {
        let cycles = Arc::new(AtomicUsize::new(0));
        let translator = Translator::new(
            metadata("flaky"),
            "Flaky",
            Vec::new(),
            Box::new(Flaky {
                cycles: cycles.clone(),
            }),
            CancellationToken::new(),
        );

        translator.start().unwrap();
        let start = std::time::Instant::now();
        while cycles.load(Ordering::SeqCst) < 5 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(translator.is_running());
        translator.stop();

        assert!(cycles.load(Ordering::SeqCst) >= 5);
        assert!(!translator.is_running());
    }

    #[test]
    fn start_twice_and_after_stop_is_rejected() {
        let translator = Translator::new(
            metadata("idle"),
            "Idle",
            Vec::new(),
            Box::new(Flaky {
                cycles: Arc::new(AtomicUsize::new(2)),
            }),
            CancellationToken::new(),
        );
        translator.start().unwrap();
        assert!(matches!(
            translator.start(),
            Err(BenchError::InvalidState { action: "start", .. })
        ));
        translator.stop();
        translator.stop();
        assert!(translator.start().is_err());
    }

    #[test]
    fn register_outputs_rolls_back_on_collision() {
        let registry = bench_core::instrument_registry();
        let taken = Arc::new(VirtualInstrument::new(VirtualInstrumentMetadata::new("b")));
        registry.register("b", taken).unwrap();

        let outputs: Vec<Arc<Instrument>> = ["a", "b", "c"]
            .into_iter()
            .map(|uid| Arc::new(VirtualInstrument::new(VirtualInstrumentMetadata::new(uid))))
            .collect();

        let err = register_outputs(&registry, &outputs).unwrap_err();
        assert!(matches!(err, BenchError::Duplicate { ref uid, .. } if uid == "b"));
        assert_eq!(registry.keys(), vec!["b".to_string()]);
    }

    #[test]
    fn unknown_class_is_not_found() {
        let registry = TranslatorRegistry::with_builtin();
        let configuration: TranslatorConfiguration = serde_json::from_value(serde_json::json!({
            "metadata": { "uid": "t" },
            "class_name": "TeleportTranslator",
        }))
        .unwrap();
        let context = TranslatorContext {
            physical: Arc::new(crate::physical::physical_registry()),
            instruments: Arc::new(bench_core::instrument_registry()),
            history_capacity: 0,
        };
        assert!(registry
            .build(&configuration, &context)
            .unwrap_err()
            .is_not_found());
    }
}
