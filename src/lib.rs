//! # Test Bench Manager
//!
//! Manages a physical test bench: translators turn readings from lab hardware
//! into observable virtual instruments, and experiment runs sequence steps
//! against those instruments with abort and skip policies.
//!
//! ## Crate Structure
//!
//! - **`bench-core`**: registry, errors, cancellation and the `VirtualInstrument` value cell
//! - **`bench-hardware`**: physical instruments, translators and the instrument manager
//! - **`bench-experiment`**: steps, experiment runs and single-run admission
//!
//! This crate composes them into a service:
//!
//! - **`settings`**: process settings (Figment: defaults, TOML, `TESTBENCH_` environment)
//! - **`configuration`**: YAML configuration directories per scope
//! - **`logging`**: tracing subscriber setup
//! - **`bench`**: the [`TestBench`] service with reload
//! - **`api`**: request/response operations with distinct timeout errors

pub mod api;
pub mod bench;
pub mod configuration;
pub mod logging;
pub mod settings;

pub use api::{Api, ApiError, ApiResult};
pub use bench::TestBench;
pub use settings::Settings;

pub use bench_core;
pub use bench_experiment;
pub use bench_hardware;
