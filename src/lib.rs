//! Cooperative, single-threaded stackful fibers with fiber-local storage.
//!
//! - [`Runtime`]: creates, switches between and deletes fibers
//! - fiber-local storage: [`Runtime::bind`] gives a shared location a
//!   private value per fiber, swapped in and out on every switch
//! - [`stack`]: stack sizing rules and the pluggable [`StackAllocator`]
//!
//! Only explicit switches suspend a fiber; there is no preemption and no
//! scheduler.

mod arch;
pub mod error;
mod fiber;
pub mod runtime;
pub mod stack;
mod storage;

pub use error::{Error, Result};
pub use fiber::Fiber;
pub use runtime::{Builder, EntryPoint, ExitHandler, Runtime};
pub use stack::{DEFAULT_STACK_SIZE, RED_ZONE, STACK_ALIGNMENT, STACK_MINIMUM, StackAllocator, System};
