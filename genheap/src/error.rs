use std::error::Error;
use std::fmt;

use blockalloc::BlockError;

#[derive(Clone, Debug, PartialEq)]
pub enum ErrorKind {
    /// The reserved free-list kind was requested
    BadAllocationRequest,
    /// Larger than any segment can hold
    AllocationTooLarge { requested: usize, max: usize },
    /// Segment memory could not be obtained
    OutOfMemory,
    InvalidConfig(String),
}

/// A heap error. Only requests that can be rejected up front surface this
/// way; running out of memory mid-collection is fatal.
#[derive(Clone, Debug, PartialEq)]
pub struct HeapError {
    kind: ErrorKind,
}

impl HeapError {
    pub fn new(kind: ErrorKind) -> HeapError {
        HeapError { kind }
    }

    pub fn error_kind(&self) -> &ErrorKind {
        &self.kind
    }
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            ErrorKind::BadAllocationRequest => {
                write!(f, "An invalid cell kind allocation was requested!")
            }
            ErrorKind::AllocationTooLarge { requested, max } => write!(
                f,
                "Allocation of {} bytes exceeds the maximum cell size of {} bytes",
                requested, max
            ),
            ErrorKind::OutOfMemory => write!(f, "Out of memory!"),
            ErrorKind::InvalidConfig(ref reason) => write!(f, "Invalid heap config: {}", reason),
        }
    }
}

impl Error for HeapError {}

/// Convert from BlockError
impl From<BlockError> for HeapError {
    fn from(other: BlockError) -> HeapError {
        match other {
            BlockError::BadRequest => HeapError::new(ErrorKind::BadAllocationRequest),
            BlockError::OOM => HeapError::new(ErrorKind::OutOfMemory),
        }
    }
}

/// Convenience shorthand for HeapError::new(ErrorKind::InvalidConfig(...))
pub fn err_config<T>(reason: &str) -> Result<T, HeapError> {
    Err(HeapError::new(ErrorKind::InvalidConfig(String::from(reason))))
}
