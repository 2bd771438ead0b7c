//! Error types for the convolution engine

use crate::EngineState;
use thiserror::Error;

/// Engine error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvError {
    #[error("Operation not allowed in state {0}")]
    BadState(EngineState),

    #[error("Invalid parameter: {0}")]
    BadParam(String),

    #[error("Allocation failed: {0}")]
    MemAlloc(String),
}

impl ConvError {
    /// Classic numeric error code (-1 state, -2 parameter, -3 allocation)
    pub fn code(&self) -> i32 {
        match self {
            Self::BadState(_) => -1,
            Self::BadParam(_) => -2,
            Self::MemAlloc(_) => -3,
        }
    }
}

/// Result type alias
pub type ConvResult<T> = Result<T, ConvError>;

/// Allocate `len` copies of `value`, reporting allocation failure instead of aborting
pub fn try_filled<T: Clone>(len: usize, value: T) -> ConvResult<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|e| ConvError::MemAlloc(format!("{len} elements: {e}")))?;
    v.resize(len, value);
    Ok(v)
}
