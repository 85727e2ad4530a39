//! x86_64 implementation of context switching

use std::arch::{asm, naked_asm};
use std::mem::{offset_of, size_of};

/// Everything a suspended fiber needs to pick up where it left off.
///
/// Resume address and stack pointer, followed by the System V callee-saved
/// registers and the floating-point control state. `context_switch`
/// addresses every field by its byte offset, so the order below is fixed.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Context {
    /// Resume address
    rip: u64,
    /// Stack pointer
    rsp: u64,
    /// Frame pointer
    rbp: u64,
    /// General purpose (callee-saved)
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    /// SSE control/status (rounding mode, exception masks)
    mxcsr: u32,
    /// x87 control word
    x87_cw: u16,
    _pad: u16,
}

/// MXCSR at process start: all exceptions masked, round to nearest
const DEFAULT_MXCSR: u32 = 0x1f80;
/// x87 control word at process start
const DEFAULT_X87_CW: u16 = 0x037f;

const _: () = {
    assert!(offset_of!(Context, rip) == 0x00);
    assert!(offset_of!(Context, rsp) == 0x08);
    assert!(offset_of!(Context, rbp) == 0x10);
    assert!(offset_of!(Context, rbx) == 0x18);
    assert!(offset_of!(Context, r12) == 0x20);
    assert!(offset_of!(Context, r13) == 0x28);
    assert!(offset_of!(Context, r14) == 0x30);
    assert!(offset_of!(Context, r15) == 0x38);
    assert!(offset_of!(Context, mxcsr) == 0x40);
    assert!(offset_of!(Context, x87_cw) == 0x44);
    assert!(size_of::<Context>() == 0x48);
};

impl Default for Context {
    fn default() -> Self {
        Context {
            rip: 0,
            rsp: 0,
            rbp: 0,
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            mxcsr: DEFAULT_MXCSR,
            x87_cw: DEFAULT_X87_CW,
            _pad: 0,
        }
    }
}

impl Context {
    /// Create a context that runs `entry(arg)` on a fresh stack.
    ///
    /// - `stack_pointer`: initial stack pointer, 16-byte aligned
    /// - `entry`: address of an `extern "C" fn(*mut c_void)`
    /// - `arg`: argument handed to `entry`
    /// - `exit`: address of an `extern "C" fn()` called if `entry` returns
    ///
    /// The three values ride in callee-saved registers until `fiber_start`
    /// picks them up. The fiber inherits the caller's floating-point control
    /// state.
    pub fn new(stack_pointer: usize, entry: usize, arg: usize, exit: usize) -> Self {
        debug_assert_eq!(stack_pointer % 16, 0);

        let mut mxcsr = DEFAULT_MXCSR;
        let mut x87_cw = DEFAULT_X87_CW;
        unsafe {
            asm!(
                "stmxcsr dword ptr [{mxcsr}]",
                "fnstcw word ptr [{cw}]",
                mxcsr = in(reg) &raw mut mxcsr,
                cw = in(reg) &raw mut x87_cw,
                options(nostack, preserves_flags)
            );
        }

        Context {
            rip: fiber_start as *const () as usize as u64,
            rsp: stack_pointer as u64,
            r12: entry as u64,
            r13: arg as u64,
            r14: exit as u64,
            mxcsr,
            x87_cw,
            ..Default::default()
        }
    }
}

/// First code run by a new fiber.
///
/// Entered by a jump with RSP 16-byte aligned, so both `call`s below leave
/// the callee with the 16n+8 alignment the ABI expects.
#[unsafe(naked)]
extern "C" fn fiber_start() -> ! {
    naked_asm!(
        "mov rdi, r13", // arg
        "call r12",     // entry(arg)
        "call r14",     // exit()
        "ud2",          // exit handler returned
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
    naked_asm!(
        "test rdi, rdi",
        "jz 2f",
        // Save to old context (rdi), resuming as if this call had returned
        "mov rax, [rsp]",
        "lea rdx, [rsp + 8]",
        "mov [rdi + 0x00], rax",
        "mov [rdi + 0x08], rdx",
        "mov [rdi + 0x10], rbp",
        "mov [rdi + 0x18], rbx",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "stmxcsr dword ptr [rdi + 0x40]",
        "fnstcw word ptr [rdi + 0x44]",
        // Load new context (rsi)
        "2:",
        "ldmxcsr dword ptr [rsi + 0x40]",
        "fldcw word ptr [rsi + 0x44]",
        "mov r15, [rsi + 0x38]",
        "mov r14, [rsi + 0x30]",
        "mov r13, [rsi + 0x28]",
        "mov r12, [rsi + 0x20]",
        "mov rbx, [rsi + 0x18]",
        "mov rbp, [rsi + 0x10]",
        "mov rsp, [rsi + 0x08]",
        // For a fresh fiber: jumps to fiber_start
        // For a suspended fiber: continues after its own context_switch call
        "jmp qword ptr [rsi + 0x00]",
    );
}
