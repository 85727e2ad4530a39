//! Errors reported when creating fibers.

use thiserror::Error;

use crate::stack::{STACK_ALIGNMENT, STACK_MINIMUM};

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Creation failures. These are the only errors the runtime reports;
/// everything else is either a silent no-op or a broken contract.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error(
        "invalid stack size {stack_size}: must be a non-zero multiple of {} \
         and at least {} bytes",
        STACK_ALIGNMENT,
        STACK_MINIMUM
    )]
    InvalidArgument { stack_size: usize },

    #[error("out of memory allocating a {size} byte fiber block")]
    OutOfMemory { size: usize },
}
