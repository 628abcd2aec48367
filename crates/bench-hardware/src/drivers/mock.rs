//! Simulated multi-channel instrument.
//!
//! Used for bench configurations without attached hardware and throughout the
//! translator tests. Each named channel holds one JSON value.
//!
//! | Method | Arguments | Returns |
//! |--------|-----------|---------|
//! | `read` | `channel?` | value of the channel |
//! | `read_all` | | array of all channel values, ordered by channel name |
//! | `set` | `value`, `channel?` | `null`; publishes a snapshot to `on_update` listeners |
//! | `snapshot` | | object of all channels |
//! | `scale` | `message`, `channel?`, `factor?` | `message[channel] * factor` |
//!
//! Push subscriptions are offered through `on_update`.
//!
//! # Example
//!
//! ```yaml
//! physical_instruments:
//!   - uid: psu
//!     class: MockInstrument
//!     arguments:
//!       channels:
//!         voltage: 12.0
//!         current: 0.5
//! ```

use crate::physical::{
    Arguments, CallArguments, MessageCallback, PhysicalError, PhysicalInstrument,
    PhysicalInstrumentConfiguration, PhysicalInstrumentFactory,
};
use bench_core::{SubscriberSet, SubscriptionId};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const CLASS_NAME: &str = "MockInstrument";
const DEFAULT_CHANNEL: &str = "value";

/// Constructor arguments for [`MockInstrument`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MockInstrumentConfig {
    /// Channel name to initial value. Defaults to a single `value` channel at 0.0.
    #[serde(default)]
    pub channels: BTreeMap<String, Value>,
    /// Channel used when a call omits `channel`. Defaults to the first channel.
    #[serde(default)]
    pub default_channel: Option<String>,
    /// Make every read fail, simulating a disconnected device.
    #[serde(default)]
    pub fail_reads: bool,
}

/// Factory for [`MockInstrument`].
pub struct MockInstrumentFactory;

impl PhysicalInstrumentFactory for MockInstrumentFactory {
    fn class_name(&self) -> &'static str {
        CLASS_NAME
    }

    fn build(
        &self,
        configuration: &PhysicalInstrumentConfiguration,
    ) -> anyhow::Result<Arc<dyn PhysicalInstrument>> {
        let config: MockInstrumentConfig =
            serde_json::from_value(Value::Object(configuration.arguments.clone()))?;
        Ok(Arc::new(MockInstrument::from_config(config)?))
    }
}

/// In-memory instrument with named channels.
pub struct MockInstrument {
    channels: Mutex<BTreeMap<String, Value>>,
    default_channel: String,
    fail_reads: AtomicBool,
    listeners: SubscriberSet<Value>,
}

impl std::fmt::Debug for MockInstrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockInstrument")
            .field("channels", &*self.channels.lock())
            .field("default_channel", &self.default_channel)
            .finish()
    }
}

impl MockInstrument {
    /// Instrument with the given channels.
    pub fn new<I, K>(channels: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self::build_unchecked(
            channels.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            None,
        )
    }

    /// Instrument from parsed constructor arguments.
    pub fn from_config(config: MockInstrumentConfig) -> anyhow::Result<Self> {
        if let Some(channel) = &config.default_channel {
            if !config.channels.is_empty() && !config.channels.contains_key(channel) {
                anyhow::bail!("default channel '{channel}' is not one of the configured channels");
            }
        }
        let instrument = Self::build_unchecked(config.channels, config.default_channel);
        instrument.fail_reads.store(config.fail_reads, Ordering::SeqCst);
        Ok(instrument)
    }

    fn build_unchecked(mut channels: BTreeMap<String, Value>, default: Option<String>) -> Self {
        if channels.is_empty() {
            channels.insert(DEFAULT_CHANNEL.to_string(), Value::from(0.0));
        }
        let default_channel = default
            .or_else(|| channels.keys().next().cloned())
            .unwrap_or_else(|| DEFAULT_CHANNEL.to_string());
        Self {
            channels: Mutex::new(channels),
            default_channel,
            fail_reads: AtomicBool::new(false),
            listeners: SubscriberSet::new(CLASS_NAME),
        }
    }

    /// Current value of `channel`.
    pub fn channel(&self, channel: &str) -> Option<Value> {
        self.channels.lock().get(channel).cloned()
    }

    /// Set a channel and notify `on_update` listeners with a snapshot.
    pub fn set_channel(&self, channel: &str, value: Value) -> anyhow::Result<()> {
        let snapshot = {
            let mut channels = self.channels.lock();
            match channels.get_mut(channel) {
                Some(slot) => *slot = value,
                None => anyhow::bail!("unknown channel '{channel}'"),
            }
            Self::to_object(&channels)
        };
        self.listeners.notify(&snapshot);
        Ok(())
    }

    /// Make subsequent reads fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.fail_reads.store(failing, Ordering::SeqCst);
    }

    /// Number of registered `on_update` listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn to_object(channels: &BTreeMap<String, Value>) -> Value {
        Value::Object(
            channels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<String, Value>>(),
        )
    }

    fn check_readable(&self, call: &CallArguments<'_>) -> Result<(), PhysicalError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(call.invalid("device not responding"));
        }
        Ok(())
    }

    fn resolve_channel<'a>(
        &'a self,
        call: &CallArguments<'a>,
        position: usize,
    ) -> Result<&'a str, PhysicalError> {
        Ok(call
            .optional_str(position, "channel")?
            .unwrap_or(self.default_channel.as_str()))
    }
}

impl PhysicalInstrument for MockInstrument {
    fn class_name(&self) -> &str {
        CLASS_NAME
    }

    fn invoke(&self, method: &str, args: &[Value], kwargs: &Arguments) -> anyhow::Result<Value> {
        let call = CallArguments::new(CLASS_NAME, method, args, kwargs);
        match method {
            "read" => {
                self.check_readable(&call)?;
                let channel = self.resolve_channel(&call, 0)?;
                self.channel(channel)
                    .ok_or_else(|| call.invalid(format!("unknown channel '{channel}'")).into())
            }
            "read_all" => {
                self.check_readable(&call)?;
                Ok(Value::Array(self.channels.lock().values().cloned().collect()))
            }
            "snapshot" => {
                self.check_readable(&call)?;
                Ok(Self::to_object(&self.channels.lock()))
            }
            "set" => {
                let value = call.required(0, "value")?.clone();
                let channel = self.resolve_channel(&call, 1)?;
                self.set_channel(channel, value)?;
                Ok(Value::Null)
            }
            "scale" => {
                let message = call.required(0, "message")?;
                let channel = self.resolve_channel(&call, 1)?;
                let factor = call.optional_f64(2, "factor")?.unwrap_or(1.0);
                let reading = message
                    .get(channel)
                    .and_then(Value::as_f64)
                    .ok_or_else(|| call.invalid(format!("message has no numeric '{channel}'")))?;
                Ok(Value::from(reading * factor))
            }
            _ => Err(call.unknown_method().into()),
        }
    }

    fn subscribe(&self, method: &str, callback: MessageCallback) -> anyhow::Result<SubscriptionId> {
        if method != "on_update" {
            return Err(PhysicalError::SubscriptionUnsupported {
                class: CLASS_NAME.to_string(),
                method: method.to_string(),
            }
            .into());
        }
        Ok(self
            .listeners
            .subscribe(move |message: &Value| callback(message.clone())))
    }

    fn unsubscribe(&self, method: &str, id: SubscriptionId) -> bool {
        method == "on_update" && self.listeners.unsubscribe(id)
    }
}
