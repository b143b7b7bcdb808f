//! # Function Errors

use thiserror::Error;

/// Result type for function registration
pub type FunctionResult<T> = Result<T, FunctionError>;

/// Function registration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FunctionError {
    #[error("Function already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid function name: {0:?}")]
    InvalidName(String),
}

impl FunctionError {
    pub fn code(&self) -> &'static str {
        match self {
            FunctionError::AlreadyExists(_) => "REFLUX_FUNCTION_EXISTS",
            FunctionError::InvalidName(_) => "REFLUX_FUNCTION_INVALID_NAME",
        }
    }
}
