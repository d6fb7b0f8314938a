//! Error types for the simulation kernel

use thiserror::Error;

/// Errors raised by the kernel itself, as opposed to the simulated world.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Component not found with ID: {id}")]
    ComponentNotFound { id: String },

    #[error("Component {id} does not have type {expected}")]
    ComponentTypeMismatch { id: String, expected: &'static str },
}
