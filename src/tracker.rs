use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::hooks::Allocator;

/// The external subsystem fed by the interceptors. Implementations must
/// guard their own notification paths against reentrancy: recording an
/// event may itself allocate, and that allocation re-enters the
/// interceptors.
pub trait Tracker: Send + Sync + 'static {
    fn track_allocation(&self, address: usize, size: usize, allocator: Allocator);
    fn track_deallocation(&self, address: usize, size: usize, allocator: Allocator);
    /// The set of loaded modules changed (`dlopen`/`dlclose`).
    fn invalidate_module_cache(&self);
    /// Hook the current thread into the host runtime's tracing.
    fn install_trace_function(&self);
    /// Drop cached native frames; their addresses may be unmapped.
    fn flush_native_trace_cache(&self);
}

struct TrackerCell {
    tracker: Box<dyn Tracker>,
}

// Single publication slot read from every interceptor. A thin pointer
// to an owning cell, so the fat trait pointer can be swapped in one
// atomic store.
static ACTIVE_TRACKER: AtomicPtr<TrackerCell> = AtomicPtr::new(null_mut());

/// Publishes `tracker` to the interceptors. The previous cell, if any,
/// is intentionally leaked: an interceptor on another thread may still
/// be mid-notification through it.
pub fn set_tracker(tracker: Box<dyn Tracker>) {
    let cell = Box::into_raw(Box::new(TrackerCell { tracker }));
    ACTIVE_TRACKER.store(cell, Ordering::Release);
}

/// Stops notifications. The cell leaks for the same reason as above.
pub fn clear_tracker() {
    ACTIVE_TRACKER.store(null_mut(), Ordering::Release);
}

#[inline(always)]
pub(crate) fn active() -> Option<&'static dyn Tracker> {
    let cell = ACTIVE_TRACKER.load(Ordering::Acquire);
    if cell.is_null() {
        return None;
    }
    Some(unsafe { &*(*cell).tracker })
}
