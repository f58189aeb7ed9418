/// A single entry of the `PT_DYNAMIC` array.
///
/// The array is terminated by an entry whose tag is `DT_NULL`. Whether
/// `d_un` holds a plain value or an address depends on the tag; both
/// views are pointer-width integers at runtime.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DynamicArrayItem {
    pub d_tag: usize,
    pub d_un: DynamicArrayValue,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union DynamicArrayValue {
    pub d_val: usize,
    pub d_ptr: *const u8,
}

pub const DT_NULL: usize = 0;
pub const DT_PLTRELSZ: usize = 2;
pub const DT_HASH: usize = 4;
pub const DT_STRTAB: usize = 5;
pub const DT_SYMTAB: usize = 6;
pub const DT_RELA: usize = 7;
pub const DT_RELASZ: usize = 8;
pub const DT_STRSZ: usize = 10;
pub const DT_REL: usize = 17;
pub const DT_RELSZ: usize = 18;
pub const DT_RELENT: usize = 19;
pub const DT_PLTREL: usize = 20;
pub const DT_JMPREL: usize = 23;
pub const DT_GNU_HASH: usize = 0x6ffffef5;

/// Walks a dynamic array until `DT_NULL`.
#[derive(Clone)]
pub struct DynamicArrayIter(*const DynamicArrayItem);

impl DynamicArrayIter {
    #[inline(always)]
    pub const fn new(ptr: *const DynamicArrayItem) -> Self {
        Self(ptr)
    }
}

impl Iterator for DynamicArrayIter {
    type Item = DynamicArrayItem;

    fn next(&mut self) -> Option<DynamicArrayItem> {
        if self.0.is_null() {
            return None;
        }
        let item = unsafe { *self.0 };
        if item.d_tag == DT_NULL {
            return None;
        }
        self.0 = unsafe { self.0.add(1) };
        Some(item)
    }
}
