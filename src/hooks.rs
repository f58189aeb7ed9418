use core::ffi::{c_char, c_int, c_void, CStr};
use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};

use libc::{off_t, size_t};
use tracing::debug;

use crate::elf::dynamic_array::DynamicArrayItem;
use crate::elf::view::DynamicView;
use crate::intercept;

/// Every allocator routine the tracer diverts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Allocator {
    Malloc,
    Calloc,
    Realloc,
    Memalign,
    PosixMemalign,
    Valloc,
    Pvalloc,
    Free,
    Mmap,
    Munmap,
}

/// What a tracker needs to know to update its shadow map, without
/// caring which allocator variant fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocatorKind {
    /// Single-address allocation (`malloc` and friends).
    SimpleAllocator,
    /// Single-address release (`free`).
    SimpleDeallocator,
    /// `(address, length)` allocation (`mmap`).
    RangedAllocator,
    /// `(address, length)` release (`munmap`).
    RangedDeallocator,
}

pub fn allocator_kind(allocator: Allocator) -> AllocatorKind {
    match allocator {
        Allocator::Malloc
        | Allocator::Calloc
        | Allocator::Realloc
        | Allocator::Memalign
        | Allocator::PosixMemalign
        | Allocator::Valloc
        | Allocator::Pvalloc => AllocatorKind::SimpleAllocator,
        Allocator::Free => AllocatorKind::SimpleDeallocator,
        Allocator::Mmap => AllocatorKind::RangedAllocator,
        Allocator::Munmap => AllocatorKind::RangedDeallocator,
    }
}

/// One tracked symbol: its name, the wrapper that replaces it in every
/// GOT, and the real implementation's address once resolved.
///
/// `F` is always one of the fourteen C function-pointer signatures, so
/// the cell holding the original can be a single pointer-width word.
pub struct SymbolHook<F> {
    symbol: &'static str,
    wrapper: F,
    original: AtomicUsize,
}

impl<F: Copy> SymbolHook<F> {
    pub const fn new(symbol: &'static str, wrapper: F) -> Self {
        Self {
            symbol,
            wrapper,
            original: AtomicUsize::new(0),
        }
    }

    /// The real implementation. Calling this before resolution is a
    /// programming error and aborts: a wrapper reached a symbol whose
    /// registry entry was never initialised.
    #[inline(always)]
    pub fn original(&self) -> F {
        let address = self.original.load(Ordering::Acquire);
        assert!(
            address != 0,
            "hook for '{}' entered before its original symbol was resolved",
            self.symbol
        );
        // F is pointer-sized by construction (asserted in Hook accessors).
        unsafe { mem::transmute_copy(&address) }
    }
}

/// Object-safe face of a `SymbolHook`, letting the patcher walk the
/// closed registry without knowing each entry's signature.
pub trait Hook: Sync {
    fn symbol(&self) -> &'static str;
    fn wrapper_address(&self) -> usize;
    fn original_address(&self) -> usize;
    fn is_initialised(&self) -> bool;
    /// Resolve the real implementation if not done yet; true on success.
    fn resolve_original(&self) -> bool;
}

impl<F: Copy + Sync + 'static> Hook for SymbolHook<F> {
    fn symbol(&self) -> &'static str {
        self.symbol
    }

    fn wrapper_address(&self) -> usize {
        debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<usize>());
        unsafe { mem::transmute_copy(&self.wrapper) }
    }

    fn original_address(&self) -> usize {
        self.original.load(Ordering::Acquire)
    }

    fn is_initialised(&self) -> bool {
        self.original_address() != 0
    }

    fn resolve_original(&self) -> bool {
        if self.is_initialised() {
            return true;
        }
        let address = resolve_symbol(self.symbol);
        if address == 0 {
            return false;
        }
        self.original.store(address, Ordering::Release);
        debug!(symbol = self.symbol, address, "resolved original symbol");
        true
    }
}

pub type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
pub type PosixMemalignFn = unsafe extern "C" fn(*mut *mut c_void, size_t, size_t) -> c_int;
pub type MemalignFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
pub type VallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
pub type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;
pub type DlcloseFn = unsafe extern "C" fn(*mut c_void) -> c_int;
pub type MmapFn = unsafe extern "C" fn(*mut c_void, size_t, c_int, c_int, c_int, off_t) -> *mut c_void;
pub type Mmap64Fn =
    unsafe extern "C" fn(*mut c_void, size_t, c_int, c_int, c_int, libc::off64_t) -> *mut c_void;
pub type MunmapFn = unsafe extern "C" fn(*mut c_void, size_t) -> c_int;
pub type GilEnsureFn = unsafe extern "C" fn() -> c_int;

pub static MALLOC: SymbolHook<MallocFn> = SymbolHook::new("malloc", intercept::malloc);
pub static FREE: SymbolHook<FreeFn> = SymbolHook::new("free", intercept::free);
pub static CALLOC: SymbolHook<CallocFn> = SymbolHook::new("calloc", intercept::calloc);
pub static REALLOC: SymbolHook<ReallocFn> = SymbolHook::new("realloc", intercept::realloc);
pub static POSIX_MEMALIGN: SymbolHook<PosixMemalignFn> =
    SymbolHook::new("posix_memalign", intercept::posix_memalign);
pub static MEMALIGN: SymbolHook<MemalignFn> = SymbolHook::new("memalign", intercept::memalign);
pub static VALLOC: SymbolHook<VallocFn> = SymbolHook::new("valloc", intercept::valloc);
pub static PVALLOC: SymbolHook<VallocFn> = SymbolHook::new("pvalloc", intercept::pvalloc);
pub static DLOPEN: SymbolHook<DlopenFn> = SymbolHook::new("dlopen", intercept::dlopen);
pub static DLCLOSE: SymbolHook<DlcloseFn> = SymbolHook::new("dlclose", intercept::dlclose);
pub static MMAP: SymbolHook<MmapFn> = SymbolHook::new("mmap", intercept::mmap);
pub static MMAP64: SymbolHook<Mmap64Fn> = SymbolHook::new("mmap64", intercept::mmap64);
pub static MUNMAP: SymbolHook<MunmapFn> = SymbolHook::new("munmap", intercept::munmap);
pub static PYGILSTATE_ENSURE: SymbolHook<GilEnsureFn> =
    SymbolHook::new("PyGILState_Ensure", intercept::PyGILState_Ensure);

/// The closed registry. No hooks are added at runtime.
pub static HOOKS: [&dyn Hook; 14] = [
    &MALLOC,
    &FREE,
    &CALLOC,
    &REALLOC,
    &POSIX_MEMALIGN,
    &MEMALIGN,
    &VALLOC,
    &PVALLOC,
    &DLOPEN,
    &DLCLOSE,
    &MMAP,
    &MMAP64,
    &MUNMAP,
    &PYGILSTATE_ENSURE,
];

/// Registry entry for a symbol name, if tracked.
pub(crate) fn find_hook(symbol_name: &str) -> Option<&'static dyn Hook> {
    if symbol_name.is_empty() {
        return None;
    }
    HOOKS.iter().copied().find(|hook| hook.symbol() == symbol_name)
}

/// Resolve every entry that still lacks its original pointer. Symbols
/// absent from the process (e.g. `PyGILState_Ensure` outside a Python
/// process) stay uninitialised and are skipped by the patcher.
pub(crate) fn resolve_pending_hooks() {
    for hook in HOOKS {
        if !hook.resolve_original() {
            debug!(symbol = hook.symbol(), "symbol not present in any loaded object");
        }
    }
}

/// Aborts unless every tracked symbol resolved. Call after the registry
/// was populated and before relying on interception: a wrapper reached
/// through an uninitialised entry cannot delegate anywhere.
pub fn ensure_all_hooks_are_valid() {
    resolve_pending_hooks();
    for hook in HOOKS {
        assert!(
            hook.is_initialised(),
            "no loaded object defines tracked symbol '{}'",
            hook.symbol()
        );
    }
}

struct SymbolQuery<'a> {
    symbol_name: &'a str,
    address: usize,
    maps_visited: usize,
}

/// First definition wins, in link-map order, matching what the dynamic
/// linker itself would have resolved before any patching.
unsafe extern "C" fn symfind_callback(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    let query = &mut *(data as *mut SymbolQuery);
    let info = &*info;

    // Of the maps without a name only the first (the executable) has a
    // usable symbol table.
    let first_map = query.maps_visited == 0;
    query.maps_visited += 1;
    let name = object_name(info);
    if !first_map && name.to_bytes().is_empty() {
        return 0;
    }
    if name.to_bytes() == b"linux-vdso.so.1" {
        // No symbols worth reading there.
        return 0;
    }

    let headers = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    for header in headers {
        if header.p_type != libc::PT_DYNAMIC {
            continue;
        }
        let dynamic = (info.dlpi_addr as usize).wrapping_add(header.p_vaddr as usize)
            as *const DynamicArrayItem;
        let view = DynamicView::new(info.dlpi_addr as usize, dynamic);
        let address = view.address_of(query.symbol_name);
        if address == 0 {
            continue;
        }
        query.address = address;
        return 1;
    }
    0
}

pub(crate) fn resolve_symbol(symbol_name: &str) -> usize {
    let mut query = SymbolQuery {
        symbol_name,
        address: 0,
        maps_visited: 0,
    };
    unsafe {
        libc::dl_iterate_phdr(
            Some(symfind_callback),
            &mut query as *mut SymbolQuery as *mut c_void,
        );
    }
    query.address
}

pub(crate) unsafe fn object_name(info: &libc::dl_phdr_info) -> &CStr {
    if info.dlpi_name.is_null() {
        return CStr::from_bytes_with_nul_unchecked(b"\0");
    }
    CStr::from_ptr(info.dlpi_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_kind_is_total() {
        let all = [
            Allocator::Malloc,
            Allocator::Calloc,
            Allocator::Realloc,
            Allocator::Memalign,
            Allocator::PosixMemalign,
            Allocator::Valloc,
            Allocator::Pvalloc,
            Allocator::Free,
            Allocator::Mmap,
            Allocator::Munmap,
        ];
        for allocator in all {
            let kind = allocator_kind(allocator);
            match allocator {
                Allocator::Free => assert_eq!(kind, AllocatorKind::SimpleDeallocator),
                Allocator::Mmap => assert_eq!(kind, AllocatorKind::RangedAllocator),
                Allocator::Munmap => assert_eq!(kind, AllocatorKind::RangedDeallocator),
                _ => assert_eq!(kind, AllocatorKind::SimpleAllocator),
            }
        }
    }

    #[test]
    fn registry_is_closed_and_unique() {
        assert_eq!(HOOKS.len(), 14);
        let mut names: Vec<&str> = HOOKS.iter().map(|hook| hook.symbol()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 14);
    }

    #[test]
    fn resolves_libc_allocator_symbols() {
        for symbol in ["malloc", "free", "calloc", "realloc", "mmap", "munmap"] {
            assert_ne!(resolve_symbol(symbol), 0, "{symbol} should resolve");
        }
    }

    #[test]
    fn missing_symbols_resolve_to_zero() {
        assert_eq!(resolve_symbol("memtrail_no_such_symbol_q7z"), 0);
    }

    #[test]
    fn gil_hook_stays_uninitialised_without_python() {
        // This test binary embeds no Python runtime, so the entry must
        // be left alone rather than aborting the process.
        assert!(!PYGILSTATE_ENSURE.resolve_original());
        assert!(!Hook::is_initialised(&PYGILSTATE_ENSURE));
    }

    #[test]
    fn find_hook_matches_by_name() {
        assert!(find_hook("malloc").is_some());
        assert!(find_hook("strlen").is_none());
        assert!(find_hook("").is_none());
    }

    #[test]
    fn wrapper_addresses_are_distinct() {
        let mut addresses: Vec<usize> = HOOKS.iter().map(|hook| hook.wrapper_address()).collect();
        addresses.sort_unstable();
        addresses.dedup();
        assert_eq!(addresses.len(), 14);
        assert!(addresses.iter().all(|&address| address != 0));
    }
}
