//! Fiber-local storage.
//!
//! A fiber's bindings map an external location to a private shadow copy of
//! its bytes. The runtime copies the live bytes into the shadows when the
//! fiber is switched away from (`store`) and copies the shadows back over
//! the locations when it is switched to (`load`).

use std::collections::HashMap;
use std::ptr;

/// Bindings owned by one fiber, keyed by location.
#[derive(Debug, Default)]
pub(crate) struct LocalStorage {
    bindings: HashMap<*mut u8, Box<[u8]>>,
}

impl LocalStorage {
    /// Bind `size` bytes at `location`, snapshotting their current value as
    /// the initial shadow.
    ///
    /// Returns `true` if an earlier binding of the same location was
    /// replaced.
    ///
    /// # Safety
    /// `location` must be valid for reads and writes of `size` bytes for as
    /// long as the binding exists.
    pub(crate) unsafe fn bind(&mut self, location: *mut u8, size: usize) -> bool {
        let mut shadow = vec![0u8; size].into_boxed_slice();
        unsafe { ptr::copy_nonoverlapping(location, shadow.as_mut_ptr(), size) };
        self.bindings.insert(location, shadow).is_some()
    }

    /// Remove the binding of `location`, if any.
    pub(crate) fn release(&mut self, location: *mut u8) -> bool {
        self.bindings.remove(&location).is_some()
    }

    /// Drop every binding, returning how many there were.
    pub(crate) fn clear(&mut self) -> usize {
        let released = self.bindings.len();
        self.bindings.clear();
        released
    }

    pub(crate) fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Copy every shadow over its location.
    ///
    /// # Safety
    /// Every bound location must still be valid (see [`LocalStorage::bind`]).
    pub(crate) unsafe fn load(&self) {
        for (&location, shadow) in &self.bindings {
            unsafe { ptr::copy_nonoverlapping(shadow.as_ptr(), location, shadow.len()) };
        }
    }

    /// Copy every location into its shadow.
    ///
    /// # Safety
    /// Every bound location must still be valid (see [`LocalStorage::bind`]).
    pub(crate) unsafe fn store(&mut self) {
        for (&location, shadow) in &mut self.bindings {
            unsafe { ptr::copy_nonoverlapping(location, shadow.as_mut_ptr(), shadow.len()) };
        }
    }
}
