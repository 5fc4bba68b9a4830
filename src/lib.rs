//! # labsweep
//!
//! A laboratory-instrument automation layer: describe a multi-dimensional
//! sweep of physical control values (voltages, frequencies) across
//! heterogeneous hardware, have the values applied safely (with optional
//! smooth ramping), and have measurements captured in lock-step, with
//! pause/resume, abort, and stability-gated dwelling.
//!
//! The crate deliberately stops at two abstractions. Concrete instrument
//! drivers, plotting, and experiment-specific tuning live outside; they see
//! only a [`resource::Resource`] (a readable/writable named value) and a
//! [`device::Device`] (a synchronized ask/write node in a transport tree).
//!
//! ## Crate Structure
//!
//! - **`config`**: Connection parameters and rig settings loaded from TOML.
//!   One device table resolves to exactly one transport driver, checked in
//!   priority order.
//! - **`device`**: The transport tree. A root device owns one physical link
//!   (SCPI socket, telnet, HTTP, or VISA GPIB/USB); sub-devices share the
//!   root's lock so command traffic on one link never interleaves. Includes
//!   multi-command batching, resource path lookup, and the `*IDN?`/`*OPC?`
//!   conveniences.
//! - **`error`**: The `SweepError` taxonomy for the whole crate.
//! - **`resource`**: The uniform read/write handle the sweep layer drives,
//!   with converters, allowed-value constraints, and smooth ramping.
//! - **`sweep`**: The sweep orchestration state machine: ordered nested
//!   variable groups, parallel per-step fan-out, pulse-program execution,
//!   condition-gated dwelling, and graceful ramp-down.

pub mod config;
pub mod device;
pub mod error;
pub mod resource;
pub mod sweep;

pub use error::{AppResult, SweepError};
