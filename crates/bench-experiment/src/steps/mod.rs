//! Built-in step types.

pub mod instrument;
pub mod wait;

pub use instrument::{CheckInstrument, Comparison, Condition, SetInstrument, WaitForInstrument};
pub use wait::Wait;

use crate::step::StepConstructor;

/// Tag and constructor of every built-in step.
pub(crate) fn builtin() -> [(&'static str, StepConstructor); 4] {
    [
        (wait::CLASS_NAME, wait::build),
        (instrument::SET_CLASS_NAME, instrument::build_set),
        (instrument::WAIT_FOR_CLASS_NAME, instrument::build_wait_for),
        (instrument::CHECK_CLASS_NAME, instrument::build_check),
    ]
}
