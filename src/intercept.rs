//! The wrapper functions installed into patched GOT slots. Each one is
//! ABI-identical to the symbol it replaces, forwards to the original
//! through the registry exactly once, and tells the active tracker
//! what happened.

use core::ffi::{c_char, c_int, c_void};

use libc::{off_t, size_t};

use crate::hooks::{self, Allocator};
use crate::patch;
use crate::tracker;

#[inline(always)]
fn track_allocation(address: *mut c_void, size: usize, allocator: Allocator) {
    if let Some(tracker) = tracker::active() {
        tracker.track_allocation(address as usize, size, allocator);
    }
}

#[inline(always)]
fn track_deallocation(address: *mut c_void, size: usize, allocator: Allocator) {
    if let Some(tracker) = tracker::active() {
        tracker.track_deallocation(address as usize, size, allocator);
    }
}

pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    let ptr = hooks::MALLOC.original()(size);
    if !ptr.is_null() {
        track_allocation(ptr, size, Allocator::Malloc);
    }
    ptr
}

pub unsafe extern "C" fn free(ptr: *mut c_void) {
    // Notify before the real free so the tracker records the event
    // while the address is still uniquely owned by the caller; its own
    // bookkeeping may allocate and must not be handed this pointer.
    track_deallocation(ptr, 0, Allocator::Free);
    hooks::FREE.original()(ptr)
}

pub unsafe extern "C" fn calloc(num: size_t, size: size_t) -> *mut c_void {
    let ptr = hooks::CALLOC.original()(num, size);
    if !ptr.is_null() {
        track_allocation(ptr, num * size, Allocator::Calloc);
    }
    ptr
}

pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    let new_ptr = hooks::REALLOC.original()(ptr, size);
    if !new_ptr.is_null() {
        track_deallocation(ptr, 0, Allocator::Free);
        track_allocation(new_ptr, size, Allocator::Realloc);
    }
    new_ptr
}

pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: size_t,
    size: size_t,
) -> c_int {
    let ret = hooks::POSIX_MEMALIGN.original()(memptr, alignment, size);
    if ret == 0 {
        track_allocation(*memptr, size, Allocator::PosixMemalign);
    }
    ret
}

pub unsafe extern "C" fn memalign(alignment: size_t, size: size_t) -> *mut c_void {
    let ptr = hooks::MEMALIGN.original()(alignment, size);
    if !ptr.is_null() {
        track_allocation(ptr, size, Allocator::Memalign);
    }
    ptr
}

pub unsafe extern "C" fn valloc(size: size_t) -> *mut c_void {
    let ptr = hooks::VALLOC.original()(size);
    if !ptr.is_null() {
        track_allocation(ptr, size, Allocator::Valloc);
    }
    ptr
}

pub unsafe extern "C" fn pvalloc(size: size_t) -> *mut c_void {
    let ptr = hooks::PVALLOC.original()(size);
    if !ptr.is_null() {
        track_allocation(ptr, size, Allocator::Pvalloc);
    }
    ptr
}

pub unsafe extern "C" fn mmap(
    addr: *mut c_void,
    length: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> *mut c_void {
    let ptr = hooks::MMAP.original()(addr, length, prot, flags, fd, offset);
    if ptr != libc::MAP_FAILED {
        track_allocation(ptr, length, Allocator::Mmap);
    }
    ptr
}

pub unsafe extern "C" fn mmap64(
    addr: *mut c_void,
    length: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off64_t,
) -> *mut c_void {
    let ptr = hooks::MMAP64.original()(addr, length, prot, flags, fd, offset);
    if ptr != libc::MAP_FAILED {
        track_allocation(ptr, length, Allocator::Mmap);
    }
    ptr
}

pub unsafe extern "C" fn munmap(addr: *mut c_void, length: size_t) -> c_int {
    // As with free: record before the range can be reused.
    track_deallocation(addr, length, Allocator::Munmap);
    hooks::MUNMAP.original()(addr, length)
}

pub unsafe extern "C" fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void {
    let handle = hooks::DLOPEN.original()(filename, flags);
    if !handle.is_null() {
        if let Some(tracker) = tracker::active() {
            tracker.invalidate_module_cache();
        }
        // The new object's GOT must point at the wrappers before any of
        // its allocations can slip past the tracker.
        patch::overwrite_symbols();
    }
    handle
}

pub unsafe extern "C" fn dlclose(handle: *mut c_void) -> c_int {
    let ret = hooks::DLCLOSE.original()(handle);
    if let Some(tracker) = tracker::active() {
        // Addresses inside the unloaded object are no longer valid
        // symbolisation targets.
        tracker.flush_native_trace_cache();
        if ret == 0 {
            tracker.invalidate_module_cache();
        }
    }
    ret
}

#[allow(non_snake_case)]
pub unsafe extern "C" fn PyGILState_Ensure() -> c_int {
    let state = hooks::PYGILSTATE_ENSURE.original()();
    // First GIL acquisition by a foreign thread is where that thread
    // becomes visible to tracking.
    if let Some(tracker) = tracker::active() {
        tracker.install_trace_function();
    }
    state
}
