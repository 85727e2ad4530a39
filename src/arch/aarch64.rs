//! aarch64 implementation of context switching

use std::arch::naked_asm;
use std::mem::{offset_of, size_of};

/// Everything a suspended fiber needs to pick up where it left off.
///
/// Resume address, stack and frame pointers, then the registers AAPCS64
/// makes the callee preserve: x19-x28 and the low halves of v8-v15.
/// `context_switch` addresses every field by its byte offset.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Resume address
    pc: u64,
    /// Stack pointer
    sp: u64,
    /// Frame pointer
    fp: u64,
    x19: u64,
    x20: u64,
    x21: u64,
    x22: u64,
    x23: u64,
    x24: u64,
    x25: u64,
    x26: u64,
    x27: u64,
    x28: u64,
    d8: u64,
    d9: u64,
    d10: u64,
    d11: u64,
    d12: u64,
    d13: u64,
    d14: u64,
    d15: u64,
}

const _: () = {
    assert!(offset_of!(Context, pc) == 0x00);
    assert!(offset_of!(Context, sp) == 0x08);
    assert!(offset_of!(Context, fp) == 0x10);
    assert!(offset_of!(Context, x19) == 0x18);
    assert!(offset_of!(Context, x28) == 0x60);
    assert!(offset_of!(Context, d8) == 0x68);
    assert!(offset_of!(Context, d15) == 0xa0);
    assert!(size_of::<Context>() == 0xa8);
};

impl Context {
    /// Create a context that runs `entry(arg)` on a fresh stack.
    ///
    /// - `stack_pointer`: initial stack pointer, 16-byte aligned
    /// - `entry`: address of an `extern "C" fn(*mut c_void)`
    /// - `arg`: argument handed to `entry`
    /// - `exit`: address of an `extern "C" fn()` called if `entry` returns
    pub fn new(stack_pointer: usize, entry: usize, arg: usize, exit: usize) -> Self {
        debug_assert_eq!(stack_pointer % 16, 0);

        Context {
            pc: fiber_start as *const () as usize as u64,
            sp: stack_pointer as u64,
            x19: entry as u64,
            x20: arg as u64,
            x21: exit as u64,
            ..Default::default()
        }
    }
}

/// First code run by a new fiber.
#[unsafe(naked)]
extern "C" fn fiber_start() -> ! {
    naked_asm!(
        "mov x0, x20", // arg
        "blr x19",     // entry(arg)
        "blr x21",     // exit()
        "brk #0x1",    // exit handler returned
    );
}

/// Park the caller in `old` and resume whatever `new` describes.
///
/// A null `old` skips the save, abandoning the calling context.
/// This function returns when another context switches back to `old`.
///
/// # Safety
/// `old` must be null or valid for writes. The `new` context must have been
/// properly initialized (either by a previous `context_switch` or by
/// [`Context::new`]) and its stack must still be alive.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old: *mut Context, _new: *const Context) {
    // Arguments: x0 = old, x1 = new
    naked_asm!(
        "cbz x0, 2f",
        // Park the caller; lr is where it resumes
        "mov x9, sp",
        "stp x30, x9,  [x0, #0x00]",
        "stp x29, x19, [x0, #0x10]",
        "stp x20, x21, [x0, #0x20]",
        "stp x22, x23, [x0, #0x30]",
        "stp x24, x25, [x0, #0x40]",
        "stp x26, x27, [x0, #0x50]",
        "str x28,      [x0, #0x60]",
        "stp d8,  d9,  [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Resume the new context (x1)
        "2:",
        "ldp x9, x10,  [x1, #0x00]", // pc, sp
        "mov sp, x10",
        "ldp x29, x19, [x1, #0x10]",
        "ldp x20, x21, [x1, #0x20]",
        "ldp x22, x23, [x1, #0x30]",
        "ldp x24, x25, [x1, #0x40]",
        "ldp x26, x27, [x1, #0x50]",
        "ldr x28,      [x1, #0x60]",
        "ldp d8,  d9,  [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "br x9",
    );
}
