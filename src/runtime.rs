//! Fiber runtime: creation, switching, fiber-local storage and deletion.
//!
//! # Example
//!
//! ```no_run
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! use myfiber::Runtime;
//!
//! let rt = Rc::new(Runtime::new()?);
//! let counter = Rc::new(Cell::new(0));
//!
//! let fiber = rt.spawn({
//!     let rt = rt.clone();
//!     let counter = counter.clone();
//!     move || {
//!         let me = rt.current().unwrap();
//!         unsafe { rt.bind_value(me, counter.as_ptr()) };
//!         loop {
//!             counter.set(counter.get() + 1);
//!             unsafe { rt.yield_to(rt.root()) };
//!         }
//!     }
//! })?;
//!
//! unsafe {
//!     rt.yield_to(fiber);
//!     rt.yield_to(fiber);
//!     rt.delete(fiber);
//! }
//! # Ok::<(), myfiber::Error>(())
//! ```

use std::cell::Cell;
use std::ffi::c_void;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::ptr;
use std::sync::atomic::{Ordering, compiler_fence};

use tracing::{debug, error, info, trace};

use crate::arch::{Context, context_switch};
use crate::error::Result;
use crate::fiber::{Fiber, PendingStart};
use crate::stack::{DEFAULT_STACK_SIZE, RED_ZONE, StackAllocator, System, validate_stack_size};

/// Function a fiber starts in. Receives the argument given at creation.
pub type EntryPoint = extern "C" fn(*mut c_void);

/// Function run when a fiber's entry point returns.
///
/// It decides what happens to the finished fiber, typically by switching
/// away for good (`switch(None, ..)`) or by ending the process. It must not
/// return.
pub type ExitHandler = extern "C" fn();

/// Default exit handler: a finished fiber ends the process.
extern "C" fn exit_process() {
    info!("fiber returned from its entry point, exiting");
    process::exit(0);
}

/// Configuration for a [`Runtime`]
pub struct Builder {
    stack_size: usize,
    exit: ExitHandler,
    allocator: Box<dyn StackAllocator>,
}

impl Builder {
    fn new() -> Self {
        Builder {
            stack_size: DEFAULT_STACK_SIZE,
            exit: exit_process,
            allocator: Box::new(System),
        }
    }

    /// Stack size for fibers created with [`Runtime::spawn`].
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Exit handler for fibers that do not name their own.
    pub fn exit_handler(mut self, exit: ExitHandler) -> Self {
        self.exit = exit;
        self
    }

    /// Where fiber blocks are allocated.
    pub fn allocator(mut self, allocator: impl StackAllocator + 'static) -> Self {
        self.allocator = Box::new(allocator);
        self
    }

    /// Build the runtime, allocating the root fiber for the calling thread.
    pub fn build(self) -> Result<Runtime> {
        validate_stack_size(self.stack_size)?;
        let root = Fiber::allocate(&*self.allocator, 0)?;

        Ok(Runtime {
            root,
            current: Cell::new(None),
            live_bindings: Cell::new(0),
            stack_size: self.stack_size,
            exit: self.exit,
            allocator: self.allocator,
        })
    }
}

/// Single-threaded fiber runtime.
///
/// Owns the current-fiber marker and the allocator fibers come from. The
/// thread that builds it is represented by the [root fiber](Runtime::root),
/// which lets control come back to it.
///
/// Fibers must be deleted explicitly; dropping the runtime frees only the
/// root fiber.
pub struct Runtime {
    root: Fiber,
    current: Cell<Option<Fiber>>,
    live_bindings: Cell<usize>,
    stack_size: usize,
    exit: ExitHandler,
    allocator: Box<dyn StackAllocator>,
}

impl Runtime {
    /// Runtime with the default configuration.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Stackless fiber standing for the thread that built the runtime.
    pub fn root(&self) -> Fiber {
        self.root
    }

    /// The fiber currently executing, or `None` before the first switch.
    pub fn current(&self) -> Option<Fiber> {
        self.current.get()
    }

    /// Create a fiber that will run `entry(arg)` on a stack of `stack_size`
    /// bytes, using the runtime's exit handler.
    ///
    /// Nothing runs until the fiber is first switched to.
    pub fn create(&self, entry: EntryPoint, arg: *mut c_void, stack_size: usize) -> Result<Fiber> {
        self.create_with_exit(entry, arg, stack_size, self.exit)
    }

    /// Like [`Runtime::create`], with a fiber-specific exit handler.
    pub fn create_with_exit(
        &self,
        entry: EntryPoint,
        arg: *mut c_void,
        stack_size: usize,
        exit: ExitHandler,
    ) -> Result<Fiber> {
        validate_stack_size(stack_size)?;
        let fiber = Fiber::allocate(&*self.allocator, stack_size)?;

        // SAFETY: freshly allocated; the stack top is 16-byte aligned and so
        // is RED_ZONE.
        unsafe {
            let stack_pointer = fiber.stack_top() - RED_ZONE;
            (*fiber.header()).context =
                Context::new(stack_pointer, entry as usize, arg as usize, exit as usize);
        }

        debug!(?fiber, stack_size, "created fiber");
        Ok(fiber)
    }

    /// Create a fiber running `f` on a stack of the configured size.
    ///
    /// Deleting the fiber after it has started but before `f` returns leaks
    /// `f`'s captures; see [`Runtime::spawn_with_stack`].
    pub fn spawn<F>(&self, f: F) -> Result<Fiber>
    where
        F: FnOnce() + 'static,
    {
        self.spawn_with_stack(self.stack_size, f)
    }

    /// Create a fiber running `f` on a stack of `stack_size` bytes.
    ///
    /// If `f` returns, the runtime's exit handler runs. A panic escaping `f`
    /// aborts the process.
    ///
    /// Once the fiber has started, `f` and its captures live on the fiber's
    /// stack. Deleting the fiber before `f` returns frees that stack without
    /// dropping them, so anything captured leaks. A captured `Rc<Runtime>`
    /// then keeps the runtime alive.
    pub fn spawn_with_stack<F>(&self, stack_size: usize, f: F) -> Result<Fiber>
    where
        F: FnOnce() + 'static,
    {
        // Box the closure and leak it to get a raw pointer
        let arg = Box::into_raw(Box::new(f)).cast::<c_void>();

        match self.create(closure_entry::<F>, arg, stack_size) {
            Ok(fiber) => {
                // SAFETY: freshly created, not yet visible to anyone else.
                unsafe {
                    (*fiber.header()).pending = Some(PendingStart {
                        arg,
                        drop: drop_closure::<F>,
                    });
                }
                Ok(fiber)
            }
            Err(err) => {
                // SAFETY: the fiber was never created, so we still own `arg`.
                unsafe { drop_closure::<F>(arg) };
                Err(err)
            }
        }
    }

    /// Suspend `from` and resume `to`.
    ///
    /// Stores `from`'s fiber-local values, loads `to`'s, marks `to` current
    /// and switches stacks. Returns when some later switch targets `from`
    /// again. With `from == None` the calling context is abandoned and this
    /// never returns.
    ///
    /// # Safety
    /// `from`, if given, must be the fiber actually executing. `to` must be
    /// a live fiber of this runtime that is not executing, and every location
    /// bound by either fiber must still be valid.
    pub unsafe fn switch(&self, from: Option<Fiber>, to: Fiber) {
        trace!(?from, ?to, "switch");

        let from_ctx: *mut Context = match from {
            Some(from) => unsafe {
                let header = from.header();
                (*header).storage.store();
                &raw mut (*header).context
            },
            None => ptr::null_mut(),
        };

        let to_header = to.header();
        let to_ctx: *const Context = unsafe {
            (*to_header).storage.load();
            // Once started, the entry point owns its argument
            (*to_header).pending = None;
            &raw const (*to_header).context
        };

        self.current.set(Some(to));

        // Both contexts are live at once, so only raw pointers reach the switch
        unsafe { context_switch(from_ctx, to_ctx) };

        compiler_fence(Ordering::SeqCst);
    }

    /// Switch from the current fiber (or the root, before the first switch)
    /// to `to`.
    ///
    /// # Safety
    /// As for [`Runtime::switch`].
    pub unsafe fn yield_to(&self, to: Fiber) {
        let from = self.current().unwrap_or(self.root);
        unsafe { self.switch(Some(from), to) }
    }

    /// Make `size` bytes at `location` private to `fiber`; returns
    /// `location`.
    ///
    /// The binding starts out holding the bytes currently at `location`.
    /// Whenever `fiber` is switched to, its copy is written to `location`;
    /// whenever it is switched away from, `location` is copied back. Binding
    /// a location that is already bound replaces the earlier binding.
    ///
    /// # Safety
    /// `fiber` must be live. `location` must stay valid for reads and writes
    /// of `size` bytes until the binding is released or the fiber deleted.
    pub unsafe fn bind(&self, fiber: Fiber, location: *mut u8, size: usize) -> *mut u8 {
        let replaced = unsafe { (*fiber.header()).storage.bind(location, size) };
        if replaced {
            debug!(?fiber, ?location, size, "replaced fiber-local binding");
        } else {
            self.live_bindings.set(self.live_bindings.get() + 1);
            trace!(?fiber, ?location, size, "bound fiber-local storage");
        }
        location
    }

    /// Typed form of [`Runtime::bind`].
    ///
    /// # Safety
    /// As for [`Runtime::bind`], with `size_of::<T>()` bytes.
    pub unsafe fn bind_value<T: Copy>(&self, fiber: Fiber, location: *mut T) -> *mut T {
        let location = unsafe { self.bind(fiber, location.cast(), mem::size_of::<T>()) };
        location.cast()
    }

    /// Remove `fiber`'s binding of `location`. The location keeps whatever
    /// it holds right now. Does nothing if `location` is not bound.
    ///
    /// # Safety
    /// `fiber` must be live.
    pub unsafe fn release<T>(&self, fiber: Fiber, location: *mut T) {
        let location = location.cast::<u8>();
        if unsafe { (*fiber.header()).storage.release(location) } {
            self.live_bindings.set(self.live_bindings.get() - 1);
            trace!(?fiber, ?location, "released fiber-local storage");
        }
    }

    /// Number of locations bound by `fiber`.
    ///
    /// # Safety
    /// `fiber` must be live.
    pub unsafe fn bindings(&self, fiber: Fiber) -> usize {
        unsafe { (*fiber.header()).storage.len() }
    }

    /// Number of bindings held by all live fibers of this runtime.
    pub fn live_bindings(&self) -> usize {
        self.live_bindings.get()
    }

    /// The stack region of `fiber`; empty for the root fiber.
    ///
    /// # Safety
    /// `fiber` must be live. The region belongs to the fiber: touching it
    /// while the fiber has frames on it corrupts them.
    pub unsafe fn stack(&self, fiber: Fiber) -> *mut [u8] {
        unsafe { fiber.stack() }
    }

    /// Release every binding of `fiber` and free it.
    ///
    /// A fiber that never ran has its spawn closure dropped. A fiber that
    /// started and is suspended has its stack freed without running the
    /// destructors of the frames on it: whatever those frames own, including
    /// a spawned closure's captures, leaks.
    ///
    /// # Safety
    /// `fiber` must be a live fiber created by this runtime, must not be the
    /// current fiber or the root, and must never be used again.
    pub unsafe fn delete(&self, fiber: Fiber) {
        debug_assert_ne!(Some(fiber), self.current(), "deleting the running fiber");
        debug_assert_ne!(fiber, self.root, "deleting the root fiber");

        unsafe {
            let released = (*fiber.header()).storage.clear();
            self.live_bindings.set(self.live_bindings.get() - released);
            fiber.free(&*self.allocator);
        }

        debug!(?fiber, "deleted fiber");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // SAFETY: the root fiber was allocated by our allocator and, having
        // no stack, holds no frames that could outlive it.
        unsafe { self.root.free(&*self.allocator) };
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("root", &self.root)
            .field("current", &self.current.get())
            .field("live_bindings", &self.live_bindings.get())
            .field("stack_size", &self.stack_size)
            .finish_non_exhaustive()
    }
}

/// Entry point for spawned fibers
///
/// The closure pointer arrives as the entry argument.
extern "C" fn closure_entry<F>(arg: *mut c_void)
where
    F: FnOnce() + 'static,
{
    // SAFETY: `spawn_with_stack` leaked this box, and the first switch into
    // the fiber handed its ownership to us.
    let f = unsafe { Box::from_raw(arg.cast::<F>()) };

    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("panic escaped a fiber, aborting");
        process::abort();
    }
}

unsafe fn drop_closure<F>(arg: *mut c_void) {
    drop(unsafe { Box::from_raw(arg.cast::<F>()) });
}
