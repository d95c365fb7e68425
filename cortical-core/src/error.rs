use crate::descent::TrainingMode;
use thiserror::Error;

/// Custom error type for the Cortical framework.
#[derive(Error, Debug)]
pub enum CorticalError {
    #[error("Shape mismatch: expected {expected:?}, got {actual:?} during operation {operation}")]
    MismatchedShapes {
        expected: Vec<usize>,
        actual: Vec<usize>,
        operation: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Incorrect training mode: operation requires {required:?}, layer is in {actual:?}")]
    IncorrectTrainingMode {
        required: TrainingMode,
        actual: TrainingMode,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Numeric instability: non-finite parameter at index {index} after {operation}")]
    NumericInstability { operation: String, index: usize },
}

impl CorticalError {
    /// Builds a `MismatchedShapes` error from two dimension slices.
    pub fn mismatched_shapes(expected: &[usize], actual: &[usize], operation: &str) -> Self {
        CorticalError::MismatchedShapes {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
            operation: operation.to_string(),
        }
    }
}
