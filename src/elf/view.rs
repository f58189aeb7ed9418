use core::mem::size_of;
use smallvec::SmallVec;

use crate::elf::dynamic_array::{
    DynamicArrayItem, DynamicArrayIter, DT_GNU_HASH, DT_HASH, DT_JMPREL, DT_PLTREL, DT_PLTRELSZ,
    DT_REL, DT_RELA, DT_RELASZ, DT_RELENT, DT_RELSZ, DT_STRSZ, DT_STRTAB, DT_SYMTAB,
};
use crate::elf::relocate::{Rel, Rela, RelocationTable};
use crate::elf::string_table::StringTable;
use crate::elf::symbol::{Symbol, SymbolTable};

/// Read-only structural view of one loaded object's dynamic section:
/// its symbol table, string table, and the three relocation tables
/// (Rel, Rela, and the PLT's Jmprel).
///
/// Construction never fails; an object missing any of the tables just
/// yields empty lookups, which is the right behavior for the odd
/// things `dl_iterate_phdr` reports alongside real libraries.
pub struct DynamicView {
    base: usize,
    symbol_table: SymbolTable,
    string_table: StringTable,
    symbol_count: usize,
    relocation_tables: SmallVec<[RelocationTable; 3]>,
}

impl DynamicView {
    /// SAFETY: `dynamic` must point at the live `PT_DYNAMIC` array of an
    /// object loaded at `base`; the tables it references must stay
    /// mapped for the lifetime of the view.
    pub unsafe fn new(base: usize, dynamic: *const DynamicArrayItem) -> Self {
        let mut symbol_table_value = 0usize;
        let mut string_table_value = 0usize;
        let mut string_table_size = 0usize;
        let mut sysv_hash_value = 0usize;
        let mut gnu_hash_value = 0usize;

        let mut rel_value = 0usize;
        let mut rel_size = 0usize;
        let mut rel_entry_size = size_of::<Rel>();
        let mut rela_value = 0usize;
        let mut rela_size = 0usize;
        let mut jmprel_value = 0usize;
        let mut jmprel_size = 0usize;
        let mut plt_entries_are_rela = true;

        for item in DynamicArrayIter::new(dynamic) {
            match item.d_tag {
                DT_SYMTAB => symbol_table_value = item.d_un.d_val,
                DT_STRTAB => string_table_value = item.d_un.d_val,
                DT_STRSZ => string_table_size = item.d_un.d_val,
                DT_HASH => sysv_hash_value = item.d_un.d_val,
                DT_GNU_HASH => gnu_hash_value = item.d_un.d_val,
                DT_REL => rel_value = item.d_un.d_val,
                DT_RELSZ => rel_size = item.d_un.d_val,
                DT_RELENT => rel_entry_size = item.d_un.d_val,
                DT_RELA => rela_value = item.d_un.d_val,
                DT_RELASZ => rela_size = item.d_un.d_val,
                DT_JMPREL => jmprel_value = item.d_un.d_val,
                DT_PLTRELSZ => jmprel_size = item.d_un.d_val,
                DT_PLTREL => plt_entries_are_rela = item.d_un.d_val == DT_RELA,
                _ => (),
            }
        }

        // Loaded objects normally carry absolute, loader-adjusted table
        // addresses; kernel-injected objects keep pristine file offsets
        // that still need the load base added.
        let adjusted = symbol_table_value > base || string_table_value > base;
        let resolve = |value: usize| -> usize {
            if value == 0 {
                0
            } else if adjusted {
                value
            } else {
                base.wrapping_add(value)
            }
        };

        let symbol_table = SymbolTable::new(resolve(symbol_table_value) as *const Symbol);
        let string_table =
            StringTable::new(resolve(string_table_value) as *const u8, string_table_size);
        let symbol_count = symbol_count(
            resolve(sysv_hash_value) as *const u32,
            resolve(gnu_hash_value) as *const u32,
            symbol_table.as_ptr(),
            resolve(string_table_value) as *const u8,
        );

        let mut relocation_tables = SmallVec::new();
        relocation_tables.push(RelocationTable::new(
            resolve(rel_value) as *const u8,
            rel_size,
            rel_entry_size,
        ));
        relocation_tables.push(RelocationTable::new(
            resolve(rela_value) as *const u8,
            rela_size,
            size_of::<Rela>(),
        ));
        relocation_tables.push(RelocationTable::new(
            resolve(jmprel_value) as *const u8,
            jmprel_size,
            if plt_entries_are_rela {
                size_of::<Rela>()
            } else {
                size_of::<Rel>()
            },
        ));

        Self {
            base,
            symbol_table,
            string_table,
            symbol_count,
            relocation_tables,
        }
    }

    #[inline(always)]
    pub fn base(&self) -> usize {
        self.base
    }

    /// The Rel, Rela, and Jmprel tables, in that order. Empty tables
    /// are included and iterate as nothing.
    pub fn relocation_tables(&self) -> &[RelocationTable] {
        &self.relocation_tables
    }

    /// Resolves a relocation's symbol index to its name. Out-of-range
    /// indexes yield the empty string.
    pub unsafe fn symbol_name(&self, index: usize) -> &'static str {
        if index >= self.symbol_count || self.symbol_table.as_ptr().is_null() {
            return "";
        }
        let symbol = self.symbol_table.get_ref(index);
        self.string_table.get(symbol.st_name as usize)
    }

    /// Absolute address of the first defined symbol with this exact
    /// name, or 0 when the object does not provide it.
    pub unsafe fn address_of(&self, name: &str) -> usize {
        if self.symbol_table.as_ptr().is_null() || name.is_empty() {
            return 0;
        }
        let requested = name.as_bytes();
        for index in 0..self.symbol_count {
            let symbol = self.symbol_table.get_ref(index);
            if !symbol.is_defined() {
                continue;
            }
            if self.string_table.get_bytes(symbol.st_name as usize) == requested {
                return self.base.wrapping_add(symbol.st_value);
            }
        }
        0
    }
}

/// The dynamic array does not record the symbol table length; recover
/// it from `DT_HASH` (nchain), else by walking the GNU hash chains,
/// else from the strtab/symtab distance as a last resort.
unsafe fn symbol_count(
    sysv_hash: *const u32,
    gnu_hash: *const u32,
    symbol_table: *const Symbol,
    string_table: *const u8,
) -> usize {
    if !sysv_hash.is_null() {
        return *sysv_hash.add(1) as usize;
    }

    if let Some(count) = gnu_hash_symbol_count(gnu_hash) {
        return count;
    }

    if !symbol_table.is_null() && (string_table as usize) > (symbol_table as usize) {
        return (string_table as usize - symbol_table as usize) / size_of::<Symbol>();
    }
    0
}

/// Chains are laid out in symbol order and each ends at an entry with
/// its low bit set, so only the chain started by the highest bucket
/// needs walking: its terminator is the last hashed symbol.
unsafe fn gnu_hash_symbol_count(gnu_hash: *const u32) -> Option<usize> {
    if gnu_hash.is_null() {
        return None;
    }

    let nbuckets = *gnu_hash as usize;
    let symoffset = *gnu_hash.add(1) as usize;
    let bloom_size = *gnu_hash.add(2) as usize;
    if nbuckets == 0 {
        return Some(symoffset);
    }

    // The header is four u32 words; the bloom filter after it is
    // pointer-width, so it spans twice as many u32 slots on 64-bit.
    let bloom_u32_span = bloom_size * (usize::BITS / u32::BITS) as usize;
    let buckets = core::slice::from_raw_parts(gnu_hash.add(4 + bloom_u32_span), nbuckets);
    let chains = gnu_hash.add(4 + bloom_u32_span + nbuckets);

    let last_chain_start = buckets
        .iter()
        .map(|&bucket| bucket as usize)
        .max()
        .unwrap_or(0);
    if last_chain_start < symoffset {
        // Every bucket is empty; only the unhashed prefix exists.
        return Some(symoffset);
    }

    let mut index = last_chain_start;
    // The cap keeps a corrupt table from walking off the mapping.
    while index - symoffset < (1 << 24) {
        if *chains.add(index - symoffset) & 1 != 0 {
            return Some(index + 1);
        }
        index += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ffi::{c_int, c_void, CStr};

    struct Probe {
        fragment: &'static str,
        view: Option<(DynamicView, String)>,
    }

    unsafe extern "C" fn capture_view(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let probe = &mut *(data as *mut Probe);
        let info = &*info;
        if info.dlpi_name.is_null() {
            return 0;
        }
        let name = CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned();
        if !name.contains(probe.fragment) {
            return 0;
        }
        let headers = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        for header in headers {
            if header.p_type != libc::PT_DYNAMIC {
                continue;
            }
            let dynamic = (info.dlpi_addr as usize).wrapping_add(header.p_vaddr as usize)
                as *const DynamicArrayItem;
            probe.view = Some((
                DynamicView::new(info.dlpi_addr as usize, dynamic),
                name.clone(),
            ));
            return 1;
        }
        0
    }

    fn view_of(fragment: &'static str) -> Option<(DynamicView, String)> {
        let mut probe = Probe {
            fragment,
            view: None,
        };
        unsafe {
            libc::dl_iterate_phdr(
                Some(capture_view),
                &mut probe as *mut Probe as *mut c_void,
            );
        }
        probe.view
    }

    #[test]
    fn libc_view_resolves_malloc() {
        let (view, name) = view_of("libc").expect("libc should be loaded");
        let address = unsafe { view.address_of("malloc") };
        assert_ne!(address, 0, "no malloc in {name}");
        let missing = unsafe { view.address_of("definitely_not_a_libc_symbol_x9q") };
        assert_eq!(missing, 0);
    }

    #[test]
    fn out_of_range_symbol_index_is_empty() {
        let (view, _) = view_of("libc").expect("libc should be loaded");
        assert_eq!(unsafe { view.symbol_name(usize::MAX / 2) }, "");
    }

    #[test]
    fn relocation_entries_name_real_symbols() {
        let (view, name) = view_of("libc").expect("libc should be loaded");
        let mut named = 0usize;
        for table in view.relocation_tables() {
            for entry in table.iter() {
                if !unsafe { view.symbol_name(entry.r_sym()) }.is_empty() {
                    named += 1;
                }
            }
        }
        assert!(named > 0, "no named relocations in {name}");
    }
}
