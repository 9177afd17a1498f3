// SPDX-License-Identifier: MIT
//! Dice-rolling HTTP service instrumented with OpenTelemetry.
//!
//! The crate wires traces, metrics and logs through OTLP and exposes the one
//! piece of real machinery behind that wiring: an ordered shutdown registry
//! that drains every constructed provider exactly once, survives individual
//! teardown failures, and rolls back partially-completed initialization.
//!
//! * [`shutdown`] – the registry and its aggregate error type.
//! * [`telemetry`] – provider construction, global registration, rollback.
//! * [`routes`] – the `/rolldice` HTTP surface.
//!
//! # Quick Start
//! ```no_run
//! use dice_service::telemetry::{init_telemetry, TelemetryConfig};
//! fn main() -> anyhow::Result<()> {
//!     let handle = init_telemetry(TelemetryConfig::default())?;
//!     // business logic
//!     handle.shutdown()?;
//!     Ok(())
//! }
//! ```
pub mod routes;
pub mod shutdown;
pub mod telemetry;
