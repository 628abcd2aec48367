//! Error types shared by every test bench crate.
//!
//! `BenchError` covers the setup-time and query-time failures that propagate to
//! callers. Runtime failures inside translator loops and step bodies never show up
//! here: they are logged and converted into state (see the `bench-experiment`
//! outcome model).
//!
//! ## Error Categories
//!
//! - **Registry errors** - `Duplicate`, `NotFound`
//! - **Waiting** - `Timeout`, `Uninitialized`
//! - **Build errors** - `Build`, `Configuration`
//! - **Run control** - `RunActive`, `InvalidState`
//! - **I/O** - `Io`

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the bench error type.
pub type BenchResult<T> = std::result::Result<T, BenchError>;

/// Primary error type for the test bench.
#[derive(Error, Debug)]
pub enum BenchError {
    /// A uid was registered twice in the same registry.
    #[error("{kind} '{uid}' is already registered")]
    Duplicate {
        /// What the registry holds (e.g. "virtual instrument")
        kind: &'static str,
        /// The colliding uid
        uid: String,
    },

    /// A uid (or type tag) was not present in a registry.
    #[error("{kind} '{uid}' is not registered")]
    NotFound {
        /// What the registry holds
        kind: &'static str,
        /// The missing uid
        uid: String,
    },

    /// A blocking wait ran past its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A virtual instrument was read before its first update.
    #[error("virtual instrument '{0}' has not received any state yet")]
    Uninitialized(String),

    /// Experiment or step construction failed before any hardware action.
    #[error("build failed: {0}")]
    Build(String),

    /// A configuration model parsed but failed semantic validation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The single run slot is occupied.
    #[error("experiment run '{0}' is already active")]
    RunActive(String),

    /// An operation was requested in a state that does not allow it.
    #[error("'{uid}' cannot {action} while {state}")]
    InvalidState {
        /// Run, step or translator uid
        uid: String,
        /// Attempted action (e.g. "start")
        action: &'static str,
        /// Current state, rendered for display
        state: String,
    },

    /// Standard I/O failure (configuration files, thread spawning).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BenchError {
    /// Shorthand for [`BenchError::NotFound`].
    pub fn not_found(kind: &'static str, uid: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            uid: uid.into(),
        }
    }

    /// Shorthand for [`BenchError::Build`].
    pub fn build(message: impl Into<String>) -> Self {
        Self::Build(message.into())
    }

    /// Shorthand for [`BenchError::Configuration`].
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// True if this error is a wait deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// True if this error is a registry or type-tag miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Render a `catch_unwind` payload for logging.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
