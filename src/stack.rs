//! Fiber stack allocation.
//!
//! Every fiber lives in one aligned block: its bookkeeping header followed
//! by the machine stack. The stack grows down from the end of the block; the
//! topmost [`RED_ZONE`] bytes are left alone so code running before its
//! first push may use the space below the stack pointer.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Alignment of every stack (and of its size)
pub const STACK_ALIGNMENT: usize = 16;

/// Reserved, never pre-written margin at the top of each stack
pub const RED_ZONE: usize = 128;

/// Smallest accepted stack size
pub const STACK_MINIMUM: usize = RED_ZONE;

/// Stack size used by `spawn` unless configured otherwise (64KB)
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Source of fiber blocks.
///
/// Lets callers put stacks somewhere other than the global heap, and lets
/// tests inject allocation failures.
pub trait StackAllocator {
    /// Allocate a block for `layout`, or `None` if memory is exhausted.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Return a block obtained from [`StackAllocator::allocate`].
    ///
    /// # Safety
    /// `ptr` must come from `self.allocate(layout)` with the same `layout`,
    /// and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The global allocator. Blocks come back zeroed.
#[derive(Debug, Clone, Copy, Default)]
pub struct System;

impl StackAllocator for System {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: fiber block layouts always include the header, so they are
        // never zero-sized.
        NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Check a requested stack size.
pub fn validate_stack_size(stack_size: usize) -> Result<()> {
    if stack_size == 0 || stack_size % STACK_ALIGNMENT != 0 || stack_size < STACK_MINIMUM {
        return Err(Error::InvalidArgument { stack_size });
    }
    Ok(())
}

/// Layout of a block holding a header `H` followed by `stack_size` bytes
/// of stack, and the offset of the stack within it.
pub(crate) fn block_layout<H>(stack_size: usize) -> Result<(Layout, usize)> {
    let too_large = || Error::OutOfMemory { size: stack_size };

    let stack = Layout::from_size_align(stack_size, STACK_ALIGNMENT).map_err(|_| too_large())?;
    let (layout, offset) = Layout::new::<H>()
        .extend(stack)
        .map_err(|_| too_large())?;

    Ok((layout.pad_to_align(), offset))
}
