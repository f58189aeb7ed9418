//! The relocation-table rewriter: a single `dl_iterate_phdr` pass that
//! flips every tracked GOT slot of every loaded object to the wrappers
//! (install) or back to the resolved originals (restore).

use core::ffi::{c_int, c_void};
use std::sync::{Mutex, OnceLock};

use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::elf::dynamic_array::DynamicArrayItem;
use crate::elf::view::DynamicView;
use crate::hooks::{self, Hook};
use crate::page_size;

#[derive(Clone, Copy, PartialEq, Eq)]
enum PatchMode {
    Install,
    Restore,
}

/// Objects already processed by an install pass, keyed by `dlpi_name`.
/// Cleared by every restore pass so the next install starts fresh.
static PATCHED_OBJECTS: Mutex<Option<FxHashSet<Box<str>>>> = Mutex::new(None);

/// Installs the wrappers across all currently loaded objects. Must not
/// run concurrently with itself or with `restore_symbols`; other
/// threads may keep executing through already-patched slots, since
/// each patch is a single aligned pointer-sized store.
pub fn overwrite_symbols() {
    hooks::resolve_pending_hooks();
    let mode = PatchMode::Install;
    unsafe {
        libc::dl_iterate_phdr(
            Some(phdrs_callback),
            &mode as *const PatchMode as *mut c_void,
        );
    }
}

/// Puts the original addresses back into every tracked slot.
pub fn restore_symbols() {
    let mut guard = PATCHED_OBJECTS.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(patched) = guard.as_mut() {
        patched.clear();
    }
    drop(guard);

    let mode = PatchMode::Restore;
    unsafe {
        libc::dl_iterate_phdr(
            Some(phdrs_callback),
            &mode as *const PatchMode as *mut c_void,
        );
    }
}

/// Records an object on an install pass; true if it was seen already.
fn seen_before(name: &str) -> bool {
    let mut guard = PATCHED_OBJECTS.lock().unwrap_or_else(|e| e.into_inner());
    let patched = guard.get_or_insert_with(FxHashSet::default);
    !patched.insert(Box::from(name))
}

/// Path of the tracer's own shared object, or None when it is linked
/// straight into the executable (whose `dlpi_name` is empty).
fn own_object_path() -> Option<&'static str> {
    static OWN_PATH: OnceLock<Option<Box<str>>> = OnceLock::new();
    OWN_PATH
        .get_or_init(|| unsafe {
            let mut info: libc::Dl_info = core::mem::zeroed();
            if libc::dladdr(overwrite_symbols as *const () as *const c_void, &mut info) == 0
                || info.dli_fname.is_null()
            {
                return None;
            }
            let path = core::ffi::CStr::from_ptr(info.dli_fname).to_string_lossy();
            Some(Box::from(path.as_ref()))
        })
        .as_deref()
}

unsafe extern "C" fn phdrs_callback(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    let mode = *(data as *const PatchMode);
    let info = &*info;
    let name = hooks::object_name(info).to_string_lossy();

    if mode == PatchMode::Install && seen_before(&name) {
        return 0;
    }

    // Leave the dynamic linker alone (patching it would wedge the next
    // lazy resolution) and the VDSO (nothing usable to patch).
    if name.contains("/ld-linux") || name.contains("linux-vdso.so.1") {
        return 0;
    }
    // Patching our own relocations would send the tracker's internal
    // allocations back through the wrappers.
    if !name.is_empty() && own_object_path() == Some(&*name) {
        return 0;
    }

    info!(object = &*name, "patching symbols");

    let headers = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    for header in headers {
        if header.p_type != libc::PT_DYNAMIC {
            continue;
        }
        let dynamic = (info.dlpi_addr as usize).wrapping_add(header.p_vaddr as usize)
            as *const DynamicArrayItem;
        let view = DynamicView::new(info.dlpi_addr as usize, dynamic);
        patch_object(&view, mode);
    }
    0
}

/// Rel, Rela, then Jmprel, entries in on-disk order. A tracked name
/// appearing in more than one table gets every slot rewritten; they
/// must all agree.
unsafe fn patch_object(view: &DynamicView, mode: PatchMode) {
    for table in view.relocation_tables() {
        for entry in table.iter() {
            let symbol_name = view.symbol_name(entry.r_sym());
            if let Some(hook) = hooks::find_hook(symbol_name) {
                let slot = view.base().wrapping_add(entry.r_offset);
                patch_symbol(hook, mode, slot);
            }
        }
    }
}

unsafe fn patch_symbol(hook: &'static dyn Hook, mode: PatchMode, slot: usize) {
    // A symbol that never resolved has nothing to restore to, and its
    // wrapper would have nothing to delegate to.
    if !hook.is_initialised() {
        return;
    }

    if unprotect_page(slot) < 0 {
        // Typically a read-only GOT under RELRO hardening; skip this
        // slot and keep scanning.
        warn!(
            symbol = hook.symbol(),
            slot, "could not make the memory page writable for patching"
        );
        return;
    }

    let value = match mode {
        PatchMode::Install => hook.wrapper_address(),
        PatchMode::Restore => hook.original_address(),
    };
    // GOT slots are pointer-aligned, so this store is atomic with
    // respect to concurrent readers: they observe either the wrapper
    // or the real function, both of which are correct.
    core::ptr::write_volatile(slot as *mut usize, value);

    debug!(symbol = hook.symbol(), slot, "symbol intercepted");
}

/// The page protection is left at read+write afterwards; restoring it
/// would cost a second `mprotect` per slot.
unsafe fn unprotect_page(address: usize) -> c_int {
    let page = page_size::get_page_start(address);
    libc::mprotect(
        page as *mut c_void,
        page_size::get_page_size(),
        libc::PROT_READ | libc::PROT_WRITE,
    )
}
