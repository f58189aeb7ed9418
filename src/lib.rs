//! In-process allocation tracer for ELF systems.
//!
//! Diverts the allocator family (`malloc`..`munmap`), the loader entry
//! points (`dlopen`/`dlclose`), and the host-runtime GIL acquisition
//! into tracking wrappers by rewriting the GOT/relocation slots of
//! every loaded shared object at runtime. The wrappers notify an
//! installed [`Tracker`] and then delegate to the real implementation.
//!
//! No recompilation of the target and no `LD_PRELOAD` ordering games:
//! patching happens after the fact, against whatever the dynamic
//! linker already resolved, and is re-applied when `dlopen` mutates
//! the set of loaded objects.
#![allow(dead_code)]

mod elf;
mod hooks;
mod intercept;
mod page_size;
mod patch;
mod tracker;

pub use hooks::{allocator_kind, ensure_all_hooks_are_valid, Allocator, AllocatorKind};
pub use patch::{overwrite_symbols, restore_symbols};
pub use tracker::{clear_tracker, set_tracker, Tracker};
