//! Creating, entering, finishing and deleting fibers.

use std::cell::{Cell, RefCell};
use std::ffi::c_void;
use std::ptr;
use std::rc::Rc;

use myfiber::{Fiber, RED_ZONE, Runtime};

/// State shared with a plain `extern "C"` fiber through its argument.
struct EntryState {
    rt: *const Runtime,
    arg_seen: Cell<usize>,
    entries: Cell<u32>,
}

extern "C" fn count_entries(arg: *mut c_void) {
    let state = unsafe { &*arg.cast::<EntryState>() };
    let rt = unsafe { &*state.rt };
    state.arg_seen.set(arg as usize);
    loop {
        state.entries.set(state.entries.get() + 1);
        unsafe { rt.yield_to(rt.root()) };
    }
}

#[test]
fn entry_point_receives_its_argument() {
    let rt = Runtime::new().unwrap();
    let state = EntryState {
        rt: &rt,
        arg_seen: Cell::new(0),
        entries: Cell::new(0),
    };
    let arg = &state as *const EntryState as *mut c_void;

    let fiber = rt.create(count_entries, arg, 16 * 1024).unwrap();
    assert_eq!(state.entries.get(), 0, "nothing runs before the first switch");

    unsafe { rt.yield_to(fiber) };
    assert_eq!(state.entries.get(), 1);
    assert_eq!(state.arg_seen.get(), arg as usize);

    unsafe { rt.yield_to(fiber) };
    assert_eq!(state.entries.get(), 2);

    unsafe { rt.delete(fiber) };
}

thread_local! {
    static EXITING: Cell<*const Runtime> = const { Cell::new(ptr::null()) };
    static EXITS: Cell<u32> = const { Cell::new(0) };
}

/// Abandons the finished fiber and resumes the root fiber.
extern "C" fn back_to_root() {
    EXITS.with(|exits| exits.set(exits.get() + 1));
    let rt = unsafe { &*EXITING.with(Cell::get) };
    unsafe { rt.switch(None, rt.root()) };
}

extern "C" fn finish_immediately(_: *mut c_void) {}

#[test]
fn returning_fiber_runs_its_exit_handler() {
    let rt = Runtime::builder().exit_handler(back_to_root).build().unwrap();
    EXITING.with(|cell| cell.set(&rt));

    let spawned = rt.spawn(|| {}).unwrap();
    let created = rt
        .create_with_exit(finish_immediately, ptr::null_mut(), 16 * 1024, back_to_root)
        .unwrap();

    unsafe { rt.yield_to(spawned) };
    assert_eq!(EXITS.with(Cell::get), 1);
    assert_eq!(rt.current(), Some(rt.root()));

    unsafe { rt.yield_to(created) };
    assert_eq!(EXITS.with(Cell::get), 2);

    unsafe {
        rt.delete(spawned);
        rt.delete(created);
    }
}

#[test]
fn switching_to_the_running_fiber_returns_immediately() {
    let rt = Rc::new(Runtime::new().unwrap());
    let trace = Rc::new(RefCell::new(Vec::new()));

    let fiber = rt
        .spawn({
            let (rt, trace) = (rt.clone(), trace.clone());
            move || {
                let me = rt.current().unwrap();
                trace.borrow_mut().push("before");
                unsafe { rt.yield_to(me) };
                trace.borrow_mut().push("after");
                loop {
                    unsafe { rt.yield_to(rt.root()) };
                }
            }
        })
        .unwrap();

    unsafe { rt.yield_to(fiber) };
    assert_eq!(*trace.borrow(), ["before", "after"]);

    unsafe { rt.delete(fiber) };
}

#[test]
fn suspended_stacks_are_isolated() {
    const FILL: u8 = 0x5b;

    let rt = Rc::new(Runtime::new().unwrap());
    let intact = Rc::new(Cell::new(None));

    let spawn_holder = |report: Option<Rc<Cell<Option<bool>>>>| {
        let rt = rt.clone();
        move || {
            let marker = [FILL; 256];
            loop {
                unsafe { rt.yield_to(rt.root()) };
                if let Some(report) = &report {
                    report.set(Some(std::hint::black_box(&marker).iter().all(|&b| b == FILL)));
                }
            }
        }
    };

    let a = rt.spawn(spawn_holder(None)).unwrap();
    let b = rt.spawn(spawn_holder(Some(intact.clone()))).unwrap();
    unsafe {
        rt.yield_to(a);
        rt.yield_to(b);
    }

    let (a_stack, b_stack) = unsafe { (rt.stack(a), rt.stack(b)) };
    let snapshot = |stack: *mut [u8]| unsafe { (&*stack).to_vec() };
    let before = snapshot(b_stack);

    // Scribble over the unused low half of A's stack
    unsafe {
        let low_half = a_stack.len() / 2;
        ptr::write_bytes(a_stack.cast::<u8>(), 0xaa, low_half);
    }

    assert!(before == snapshot(b_stack));
    unsafe { rt.yield_to(b) };
    assert_eq!(intact.get(), Some(true));

    unsafe {
        rt.delete(a);
        rt.delete(b);
    }
}

#[test]
fn fresh_stack_red_zone_is_untouched() {
    let rt = Runtime::new().unwrap();
    let fiber: Fiber = rt.spawn(|| {}).unwrap();

    let stack = unsafe { rt.stack(fiber) };
    let top = unsafe { &(&*stack)[stack.len() - RED_ZONE..] };
    assert!(top.iter().all(|&b| b == 0));

    unsafe { rt.delete(fiber) };
}

#[test]
fn deleting_a_suspended_fiber_leaks_its_frames() {
    let rt = Rc::new(Runtime::new().unwrap());
    let token = Rc::new(());

    let fiber = rt
        .spawn({
            let (rt, token) = (rt.clone(), token.clone());
            move || {
                let _held = &token;
                loop {
                    unsafe { rt.yield_to(rt.root()) };
                }
            }
        })
        .unwrap();

    unsafe { rt.yield_to(fiber) };
    unsafe { rt.delete(fiber) };

    // The closure's captures lived on the freed stack and were never dropped
    assert_eq!(Rc::strong_count(&token), 2);
    assert_eq!(Rc::strong_count(&rt), 2);
}

#[cfg(target_arch = "x86_64")]
fn mxcsr() -> u32 {
    let mut value = 0u32;
    unsafe {
        std::arch::asm!(
            "stmxcsr dword ptr [{}]",
            in(reg) &raw mut value,
            options(nostack, preserves_flags)
        );
    }
    value
}

#[cfg(target_arch = "x86_64")]
fn set_mxcsr(value: u32) {
    unsafe {
        std::arch::asm!(
            "ldmxcsr dword ptr [{}]",
            in(reg) &raw const value,
            options(nostack, preserves_flags)
        );
    }
}

#[cfg(target_arch = "x86_64")]
#[test]
fn rounding_mode_stays_with_its_fiber() {
    const ROUND_DOWN: u32 = 0x2000;
    const ROUNDING_BITS: u32 = 0x6000;

    let rt = Rc::new(Runtime::new().unwrap());
    let seen = Rc::new(Cell::new(0u32));

    let fiber = rt
        .spawn({
            let (rt, seen) = (rt.clone(), seen.clone());
            move || {
                set_mxcsr((mxcsr() & !ROUNDING_BITS) | ROUND_DOWN);
                loop {
                    unsafe { rt.yield_to(rt.root()) };
                    seen.set(mxcsr());
                }
            }
        })
        .unwrap();

    let before = mxcsr();
    unsafe { rt.yield_to(fiber) };
    assert_eq!(mxcsr(), before);

    unsafe { rt.yield_to(fiber) };
    assert_eq!(seen.get() & ROUNDING_BITS, ROUND_DOWN);
    assert_eq!(mxcsr(), before);

    unsafe { rt.delete(fiber) };
}
