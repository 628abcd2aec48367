//! Physical instrument drivers shipped with the bench.

pub mod mock;

pub use mock::{MockInstrument, MockInstrumentConfig, MockInstrumentFactory};
