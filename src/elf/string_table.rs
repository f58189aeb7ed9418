use core::{slice, str};
use memchr::memchr;

/// The `DT_STRTAB` pool: NUL-terminated names packed back to back.
///
/// Indexes come straight out of symbol entries, so every access is
/// bounds-checked against `DT_STRSZ`; a bad index yields the empty
/// string rather than a wild read.
#[derive(Clone, Copy)]
pub struct StringTable {
    ptr: *const u8,
    size: usize,
}

impl StringTable {
    #[inline(always)]
    pub const fn new(ptr: *const u8, size: usize) -> Self {
        Self { ptr, size }
    }

    /// SAFETY: `ptr..ptr+size` must stay readable for the object's lifetime.
    #[inline(always)]
    pub unsafe fn get_bytes(&self, index: usize) -> &'static [u8] {
        if self.ptr.is_null() || index >= self.size {
            return &[];
        }
        let start = self.ptr.add(index);
        let tail = slice::from_raw_parts(start, self.size - index);
        let len = memchr(0, tail).unwrap_or(tail.len());
        slice::from_raw_parts(start, len)
    }

    /// Symbol names are ASCII in practice; the unchecked conversion
    /// mirrors that assumption.
    #[inline(always)]
    pub unsafe fn get(&self, index: usize) -> &'static str {
        str::from_utf8_unchecked(self.get_bytes(index))
    }
}
