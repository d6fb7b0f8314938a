//! Error types for mesh components
//!
//! Simulated-world failures (discards, injected errors, exhausted retries) are never
//! errors in this sense: they travel back to the caller as a
//! [`ResponseStatus`](crate::request::ResponseStatus). The types here describe bugs in
//! the simulated topology or its configuration.

use std::time::Duration;
use thiserror::Error;

/// Invariant violations detected while handling an event. Always fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MeshError {
    #[error("routing integrity: expected {expected} on top of the return path, found {found}")]
    ReturnPathMismatch { expected: String, found: String },

    #[error("routing integrity: return path exhausted at {at}")]
    ReturnPathExhausted { at: String },

    #[error("routing integrity: {remaining} hops left on the return path at origin {at}")]
    ReturnPathNotUnwound { at: String, remaining: usize },

    #[error("router {router} got a response from {sender}, which is not in its pool")]
    UnknownResponder { router: String, sender: String },

    #[error("router {router}: in-flight count for {downstream} would go negative")]
    InFlightUnderflow { router: String, downstream: String },

    #[error("limiter released a slot it never granted (in flight: {in_flight})")]
    SlotOverRelease { in_flight: usize },
}

/// Rejected configuration, reported at construction time.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for field '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Field '{field}' must be {constraint}")]
    ConstraintViolation { field: String, constraint: String },

    #[error("router {router} needs at least one downstream")]
    EmptyPool { router: String },

    #[error("latency limiter: decrease trigger {decrease:?} is below increase trigger {increase:?}")]
    InvertedLatencyTriggers { decrease: Duration, increase: Duration },

    #[error("the unlimited limiter only supports the discard reaction")]
    WaitOnUnlimited,
}

pub type ConfigResult<T> = Result<T, ConfigError>;
