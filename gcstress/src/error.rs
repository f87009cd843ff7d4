use std::error::Error;
use std::fmt;

use genheap::HeapError;

#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    HeapError(String),
    BadArgument(String),
    /// The heap handed back something the workload never wrote
    Corruption(String),
}

/// A stress run failure
#[derive(Debug, PartialEq)]
pub struct StressError {
    kind: ErrorKind,
}

impl StressError {
    pub fn new(kind: ErrorKind) -> StressError {
        StressError { kind }
    }

    pub fn error_kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl fmt::Display for StressError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            ErrorKind::HeapError(ref reason) => write!(f, "Heap error: {}", reason),
            ErrorKind::BadArgument(ref reason) => write!(f, "Bad argument: {}", reason),
            ErrorKind::Corruption(ref reason) => write!(f, "Heap corruption: {}", reason),
        }
    }
}

impl Error for StressError {}

impl From<HeapError> for StressError {
    fn from(other: HeapError) -> StressError {
        StressError::new(ErrorKind::HeapError(format!("{}", other)))
    }
}

pub fn err_corrupt<T>(reason: String) -> Result<T, StressError> {
    Err(StressError::new(ErrorKind::Corruption(reason)))
}
