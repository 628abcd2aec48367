//! Boundary to the physical instruments translators read from and write to.
//!
//! A physical instrument is opaque to the bench. Translators address it by method
//! name (taken from configuration) and exchange JSON values with it, so any
//! driver can be plugged in by implementing [`PhysicalInstrument`] and registering a
//! [`PhysicalInstrumentFactory`] for its class tag.

use bench_core::{BenchError, BenchResult, Registry, SubscriptionId};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Callback receiving messages pushed by a physical instrument.
pub type MessageCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Keyword arguments passed along with a method call.
pub type Arguments = Map<String, Value>;

/// Failures raised by physical instrument method dispatch.
#[derive(Debug, Error)]
pub enum PhysicalError {
    /// The instrument has no method of that name.
    #[error("{class} has no method '{method}'")]
    UnknownMethod {
        /// Instrument class tag
        class: String,
        /// Requested method
        method: String,
    },

    /// A required argument was missing or had the wrong type.
    #[error("{class}.{method}: {reason}")]
    InvalidArgument {
        /// Instrument class tag
        class: String,
        /// Requested method
        method: String,
        /// What was wrong
        reason: String,
    },

    /// The method does not accept push subscriptions.
    #[error("{class} cannot push updates through '{method}'")]
    SubscriptionUnsupported {
        /// Instrument class tag
        class: String,
        /// Requested subscribe method
        method: String,
    },
}

/// A hardware-backed (or simulated) instrument addressed by method name.
pub trait PhysicalInstrument: Send + Sync {
    /// Class tag this instrument was built from.
    fn class_name(&self) -> &str;

    /// Call `method` with positional `args` and keyword `kwargs`.
    fn invoke(&self, method: &str, args: &[Value], kwargs: &Arguments) -> anyhow::Result<Value>;

    /// Register `callback` with the push mechanism named `method`.
    ///
    /// Callbacks may run on any thread the instrument chooses. The returned id
    /// releases the registration through [`unsubscribe`](Self::unsubscribe).
    fn subscribe(&self, method: &str, _callback: MessageCallback) -> anyhow::Result<SubscriptionId> {
        Err(PhysicalError::SubscriptionUnsupported {
            class: self.class_name().to_string(),
            method: method.to_string(),
        }
        .into())
    }

    /// Drop a registration made with [`subscribe`](Self::subscribe). Returns
    /// `false` if it was unknown.
    fn unsubscribe(&self, _method: &str, _id: SubscriptionId) -> bool {
        false
    }
}

/// Positional/keyword argument lookup for [`PhysicalInstrument::invoke`] implementations.
pub struct CallArguments<'a> {
    class: &'a str,
    method: &'a str,
    args: &'a [Value],
    kwargs: &'a Arguments,
}

impl<'a> CallArguments<'a> {
    /// Wrap the raw arguments of one call.
    pub fn new(class: &'a str, method: &'a str, args: &'a [Value], kwargs: &'a Arguments) -> Self {
        Self {
            class,
            method,
            args,
            kwargs,
        }
    }

    /// Argument at `position`, falling back to the keyword `name`.
    pub fn get(&self, position: usize, name: &str) -> Option<&'a Value> {
        self.args.get(position).or_else(|| self.kwargs.get(name))
    }

    /// Like [`get`](Self::get) but fails when the argument is absent.
    pub fn required(&self, position: usize, name: &str) -> Result<&'a Value, PhysicalError> {
        self.get(position, name)
            .ok_or_else(|| self.invalid(format!("missing argument '{name}'")))
    }

    /// Optional string argument.
    pub fn optional_str(&self, position: usize, name: &str) -> Result<Option<&'a str>, PhysicalError> {
        match self.get(position, name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(self.invalid(format!("'{name}' must be a string, got {other}"))),
        }
    }

    /// Optional numeric argument.
    pub fn optional_f64(&self, position: usize, name: &str) -> Result<Option<f64>, PhysicalError> {
        match self.get(position, name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.invalid(format!("'{name}' must be a number, got {value}"))),
        }
    }

    /// Build an `InvalidArgument` error for this call.
    pub fn invalid(&self, reason: impl Into<String>) -> PhysicalError {
        PhysicalError::InvalidArgument {
            class: self.class.to_string(),
            method: self.method.to_string(),
            reason: reason.into(),
        }
    }

    /// Build an `UnknownMethod` error for this call.
    pub fn unknown_method(&self) -> PhysicalError {
        PhysicalError::UnknownMethod {
            class: self.class.to_string(),
            method: self.method.to_string(),
        }
    }
}

/// Configuration of one physical instrument.
#[derive(Debug, Clone, Deserialize)]
pub struct PhysicalInstrumentConfiguration {
    /// Registry key
    pub uid: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Class tag resolved through [`PhysicalInstrumentFactories`]
    #[serde(alias = "class_name")]
    pub class: String,
    /// Constructor arguments, interpreted by the factory
    #[serde(default)]
    pub arguments: Arguments,
}

/// Builds physical instruments of one class.
pub trait PhysicalInstrumentFactory: Send + Sync {
    /// Class tag used in configuration files.
    fn class_name(&self) -> &'static str;

    /// Construct an instrument from its configuration.
    fn build(
        &self,
        configuration: &PhysicalInstrumentConfiguration,
    ) -> anyhow::Result<Arc<dyn PhysicalInstrument>>;
}

/// Process-wide physical instrument registry.
pub type PhysicalInstrumentRegistry = Registry<Arc<dyn PhysicalInstrument>>;

/// Create an empty [`PhysicalInstrumentRegistry`].
pub fn physical_registry() -> PhysicalInstrumentRegistry {
    Registry::new("physical instrument")
}

/// Class tag to factory mapping.
pub struct PhysicalInstrumentFactories {
    factories: Registry<Arc<dyn PhysicalInstrumentFactory>>,
}

impl Default for PhysicalInstrumentFactories {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalInstrumentFactories {
    /// Empty factory set.
    pub fn new() -> Self {
        Self {
            factories: Registry::new("physical instrument class"),
        }
    }

    /// Factory set with the drivers shipped in this crate.
    pub fn with_builtin() -> Self {
        let factories = Self::new();
        // Registering into a fresh registry cannot collide
        let _ = factories.register(Arc::new(crate::drivers::mock::MockInstrumentFactory));
        factories
    }

    /// Add a factory. Fails with `Duplicate` if its class tag is taken.
    pub fn register(&self, factory: Arc<dyn PhysicalInstrumentFactory>) -> BenchResult<()> {
        self.factories.register(factory.class_name(), factory)
    }

    /// Registered class tags.
    pub fn class_names(&self) -> Vec<String> {
        self.factories.keys()
    }

    /// Build one instrument. Unknown class tags fail with `NotFound`.
    pub fn create(
        &self,
        configuration: &PhysicalInstrumentConfiguration,
    ) -> BenchResult<Arc<dyn PhysicalInstrument>> {
        let factory = self.factories.get(&configuration.class)?;
        factory.build(configuration).map_err(|e| {
            BenchError::build(format!(
                "physical instrument '{}' ({}): {e:#}",
                configuration.uid, configuration.class
            ))
        })
    }

    /// Build and register every configured instrument.
    ///
    /// Failures are logged and skipped; returns how many instruments were registered.
    pub fn fill(
        &self,
        registry: &PhysicalInstrumentRegistry,
        configurations: &[PhysicalInstrumentConfiguration],
    ) -> usize {
        let mut registered = 0;
        for configuration in configurations {
            let result = self
                .create(configuration)
                .and_then(|instrument| registry.register(configuration.uid.clone(), instrument));
            match result {
                Ok(()) => {
                    info!(
                        physical_instrument = %configuration.uid,
                        class = %configuration.class,
                        "Physical instrument registered"
                    );
                    registered += 1;
                }
                Err(e) => error!(
                    physical_instrument = %configuration.uid,
                    error = %e,
                    "Failed to create physical instrument"
                ),
            }
        }
        registered
    }
}
