//! `bench-hardware`
//!
//! Everything between the physical rig and the virtual instruments:
//!
//! - [`physical`]: the opaque physical-instrument boundary, factories and registry
//! - [`drivers`]: drivers shipped with the bench (currently the simulated [`MockInstrument`])
//! - [`translator`]: fault-isolated workers feeding virtual instruments
//! - [`manager`]: configuration-driven construction and reload

pub mod drivers;
pub mod manager;
pub mod physical;
pub mod translator;

pub use drivers::MockInstrument;
pub use manager::{InstrumentConfiguration, InstrumentManager, LoadSummary};
pub use physical::{
    physical_registry, Arguments, MessageCallback, PhysicalError, PhysicalInstrument,
    PhysicalInstrumentConfiguration, PhysicalInstrumentFactories, PhysicalInstrumentFactory,
    PhysicalInstrumentRegistry,
};
pub use translator::{
    ReleaseHook, TranslationLoop, Translator, TranslatorConfiguration, TranslatorConstructor,
    TranslatorContext, TranslatorMetadata, TranslatorRegistry,
};
