//! Error types for canary sessions.

use thiserror::Error;

use crate::canary::State;
use crate::metrics::Step;
use crate::store::StoreError;

/// Error type for canary operations.
///
/// Any of these aborts the current cycle. The store is not assumed to be consistent afterwards,
/// so the runner cleans up and terminates instead of resuming mid-sequence.
#[derive(Debug, Error)]
pub enum CanaryError {
    /// A bucket-level store call failed.
    #[error("{step} failed for bucket `{bucket}`")]
    Bucket {
        step: Step,
        bucket: String,
        #[source]
        source: StoreError,
    },

    /// An object-level store call failed.
    #[error("{step} failed for object `{key}`")]
    Object {
        step: Step,
        key: String,
        #[source]
        source: StoreError,
    },

    /// A step was invoked before the steps it depends on.
    #[error("cannot run {step} in state {state:?}")]
    OutOfOrder { step: Step, state: State },
}

impl CanaryError {
    /// The step during which the error occurred.
    pub fn step(&self) -> Step {
        match self {
            CanaryError::Bucket { step, .. }
            | CanaryError::Object { step, .. }
            | CanaryError::OutOfOrder { step, .. } => *step,
        }
    }

    /// The underlying store error, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            CanaryError::Bucket { source, .. } | CanaryError::Object { source, .. } => Some(source),
            CanaryError::OutOfOrder { .. } => None,
        }
    }
}

/// Result type for canary operations.
pub type CanaryResult<T> = Result<T, CanaryError>;
