//! `bench-core`
//!
//! Core types for the test bench: the uid registry, the shared error type,
//! cancellation tokens, subscriber fan-out and the virtual instrument.
//!
//! ## Key Types
//!
//! - [`Registry`]: thread-safe uid store with register-if-absent semantics
//! - [`VirtualInstrument`]: sequenced, observable value cell
//! - [`CancellationToken`]: one-way cooperative stop signal
//! - [`BenchError`]: errors surfaced to callers at setup and query time
//!
//! ## Example
//!
//! ```rust
//! use bench_core::{VirtualInstrument, VirtualInstrumentMetadata};
//! use std::time::Duration;
//!
//! let vi = VirtualInstrument::new(VirtualInstrumentMetadata::new("temperature"));
//! vi.update_state(21.5_f64);
//! let state = vi.wait_for(|s| s.value > 20.0, Some(Duration::from_millis(10))).unwrap();
//! assert_eq!(state.sequence, 0);
//! ```

pub mod cancel;
pub mod error;
pub mod instrument;
pub mod registry;
pub mod subscription;
pub mod value;

use std::sync::Arc;

pub use cancel::CancellationToken;
pub use error::{panic_message, BenchError, BenchResult};
pub use instrument::{
    CommandCallback, StateIter, StateQueue, VirtualInstrument, VirtualInstrumentMetadata,
    VirtualInstrumentState,
};
pub use registry::Registry;
pub use subscription::{SubscriberSet, SubscriptionId};
pub use value::InstrumentValue;

/// Virtual instrument carrying the bench-wide value type.
pub type Instrument = VirtualInstrument<InstrumentValue>;

/// State of an [`Instrument`].
pub type InstrumentState = VirtualInstrumentState<InstrumentValue>;

/// Process-wide virtual instrument registry.
pub type VirtualInstrumentRegistry = Registry<Arc<Instrument>>;

/// Create an empty [`VirtualInstrumentRegistry`].
pub fn instrument_registry() -> VirtualInstrumentRegistry {
    Registry::new("virtual instrument")
}
