//! Fiber handles and the blocks they point to.

use std::alloc::Layout;
use std::ffi::c_void;
use std::fmt;
use std::ptr::{self, NonNull};

use crate::arch::Context;
use crate::error::{Error, Result};
use crate::stack::{StackAllocator, block_layout};
use crate::storage::LocalStorage;

/// Handle to a fiber.
///
/// A fiber is identified by its allocation: copies of a handle all name the
/// same fiber, and two handles are equal only if they name the same one.
/// Handles are neither `Send` nor `Sync`; fibers never leave the thread that
/// created them.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fiber(NonNull<Header>);

/// Bookkeeping at the start of every fiber block; the stack follows it.
pub(crate) struct Header {
    pub(crate) context: Context,
    pub(crate) storage: LocalStorage,
    /// Closure of a spawned fiber that has not run yet
    pub(crate) pending: Option<PendingStart>,
    layout: Layout,
    stack_offset: usize,
    stack_size: usize,
}

/// Entry argument still owned by the fiber because it was never started.
pub(crate) struct PendingStart {
    pub(crate) arg: *mut c_void,
    pub(crate) drop: unsafe fn(*mut c_void),
}

impl Fiber {
    /// Allocate a block with an empty context and no bindings.
    pub(crate) fn allocate(allocator: &dyn StackAllocator, stack_size: usize) -> Result<Self> {
        let (layout, stack_offset) = block_layout::<Header>(stack_size)?;
        let block = allocator
            .allocate(layout)
            .ok_or(Error::OutOfMemory { size: layout.size() })?;

        let header = block.cast::<Header>();
        // SAFETY: the block is large enough and aligned for a header.
        unsafe {
            header.as_ptr().write(Header {
                context: Context::default(),
                storage: LocalStorage::default(),
                pending: None,
                layout,
                stack_offset,
                stack_size,
            });
        }

        Ok(Fiber(header))
    }

    /// Drop the header and hand the block back to `allocator`.
    ///
    /// # Safety
    /// The fiber must have been allocated by `allocator`, must not be
    /// running, and must not be used again.
    pub(crate) unsafe fn free(self, allocator: &dyn StackAllocator) {
        let header = self.header();
        unsafe {
            if let Some(pending) = (*header).pending.take() {
                (pending.drop)(pending.arg);
            }
            let layout = (*header).layout;
            ptr::drop_in_place(header);
            allocator.deallocate(self.0.cast(), layout);
        }
    }

    pub(crate) fn header(self) -> *mut Header {
        self.0.as_ptr()
    }

    /// The stack region; empty for a stackless fiber.
    ///
    /// # Safety
    /// The fiber must not have been freed.
    pub(crate) unsafe fn stack(self) -> *mut [u8] {
        unsafe {
            let header = self.header();
            let base = header.cast::<u8>().add((*header).stack_offset);
            ptr::slice_from_raw_parts_mut(base, (*header).stack_size)
        }
    }

    /// Address one past the highest stack byte.
    ///
    /// # Safety
    /// The fiber must not have been freed.
    pub(crate) unsafe fn stack_top(self) -> usize {
        unsafe {
            let stack = self.stack();
            stack.cast::<u8>() as usize + stack.len()
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({:p})", self.0)
    }
}
