//! Error types shared by the library modules.

use thiserror::Error;

/// Failures from the hook registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HookError {
    /// The module or parameter that owned the hook no longer exists.
    #[error("hook owner has been dropped")]
    Detached,

    /// The handle points at a hook that is no longer registered.
    #[error("hook {0} is not registered")]
    UnknownHook(u64),

    /// Gradient hooks can only be attached to trainable parameters.
    #[error("parameter does not require gradients")]
    NotTrainable,
}

/// Top-level library error.
#[derive(Debug, Error)]
pub enum GradtopError {
    /// The flush cadence must be a positive number of steps.
    #[error("every_n_steps must be at least 1")]
    InvalidInterval,

    #[error(transparent)]
    Hook(#[from] HookError),

    /// Tensor data does not fill the requested shape.
    #[error("shape {shape:?} needs {expected} elements, got {actual}")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    /// A monitor rejected a report.
    #[error("monitor error: {0}")]
    Monitor(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T, E = GradtopError> = std::result::Result<T, E>;
