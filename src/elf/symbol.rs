/// Special section index marking an undefined symbol.
pub const SHN_UNDEF: u16 = 0;

/// A `DT_SYMTAB` entry. Field order differs between ELF32 and ELF64;
/// the conditional layout keeps the struct overlay-correct on both.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Symbol {
    /// String table index of the symbol name.
    pub st_name: u32,
    #[cfg(target_pointer_width = "32")]
    pub st_value: usize,
    #[cfg(target_pointer_width = "32")]
    pub st_size: usize,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    #[cfg(target_pointer_width = "64")]
    pub st_value: usize,
    #[cfg(target_pointer_width = "64")]
    pub st_size: usize,
}

impl Symbol {
    /// A symbol whose address can be taken: named, bound to a section,
    /// and carrying a non-zero value.
    #[inline(always)]
    pub fn is_defined(&self) -> bool {
        self.st_name != 0 && self.st_shndx != SHN_UNDEF && self.st_value != 0
    }
}

/// Raw view over the symbol table. The table length is not recorded in
/// the dynamic array; callers bound their indexes externally.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct SymbolTable(*const Symbol);

impl SymbolTable {
    #[inline(always)]
    pub const fn new(ptr: *const Symbol) -> Self {
        Self(ptr)
    }

    #[inline(always)]
    pub const fn as_ptr(&self) -> *const Symbol {
        self.0
    }

    #[inline(always)]
    pub unsafe fn get_ref(&self, index: usize) -> &'static Symbol {
        &*self.0.add(index)
    }
}
