// SPDX-License-Identifier: MIT
//! Aggregated teardown of telemetry providers.
//!
//! Each provider constructed during bootstrap owns background flush/export
//! machinery that must be drained before process exit. Providers are
//! registered here in acquisition order and drained in that same order by a
//! single [`ShutdownRegistry::shutdown`] call. A failing teardown never stops
//! the remaining ones; every failure is collected into one [`AggregateError`]
//! whose parts stay individually inspectable.
//!
//! The registry has two states: *open* (accepting registrations) and
//! *drained*. The first `shutdown` call drains it; any later call runs
//! nothing and returns `Ok(())`.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use thiserror::Error;

/// A single teardown operation. Invoked at most once, with the deadline
/// budget the caller grants the whole drain.
pub type TeardownFn = Box<dyn FnOnce(Duration) -> OTelSdkResult + Send>;

/// Ordered collection of provider teardowns, drained exactly once.
#[derive(Default)]
pub struct ShutdownRegistry {
    teardowns: Mutex<Vec<TeardownFn>>,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a teardown operation. Operations run in registration order,
    /// which mirrors resource-acquisition order; the providers are
    /// independent, so the order is not reversed on drain.
    pub fn register<F>(&mut self, teardown: F)
    where
        F: FnOnce(Duration) -> OTelSdkResult + Send + 'static,
    {
        self.teardowns
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(teardown));
    }

    /// Number of teardowns still pending.
    pub fn len(&self) -> usize {
        self.teardowns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every registered teardown in registration order, passing each
    /// the same `budget`. No short-circuiting: a failing operation never
    /// prevents later ones from running. All failures are folded into one
    /// [`AggregateError`]; zero failures is `Ok(())`.
    ///
    /// The sequence is taken out under the lock before anything runs, so a
    /// concurrent or repeated call observes an empty registry and returns
    /// `Ok(())` instead of re-running teardowns.
    pub fn shutdown(&self, budget: Duration) -> Result<(), AggregateError> {
        let teardowns = std::mem::take(
            &mut *self.teardowns.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut errors = Vec::new();
        for teardown in teardowns {
            if let Err(e) = teardown(budget) {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AggregateError { errors })
        }
    }
}

/// One or more teardown failures from a single drain. Never empty.
#[derive(Debug, Error)]
#[error("telemetry shutdown reported {} error(s): {}", .errors.len(), join(.errors))]
pub struct AggregateError {
    errors: Vec<OTelSdkError>,
}

impl AggregateError {
    /// The individual failures, in the order the failing teardowns ran.
    pub fn errors(&self) -> &[OTelSdkError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<OTelSdkError> {
        self.errors
    }
}

fn join(errors: &[OTelSdkError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
