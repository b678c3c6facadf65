//! Region index: an open-addressed hash table mapping every page the
//! allocator has handed out (or subdivided into chunks) back to its
//! bookkeeping. Probing runs in the negative direction; deletion is Knuth's
//! algorithm R (Vol. III, 6.4) so the table never needs tombstones.
//!
//! The low `PAGE_SHIFT` bits of the stored pointer are a kind tag. That trick
//! is confined to this module: callers construct records through the `tag_*`
//! helpers and read them back through [`RegionRecord`] accessors.

use crate::chunks::ChunkInfo;
use crate::guarded;
use crate::report;
use crate::util::{hash_page, mask_page, INITIAL_REGIONS, PAGE_MASK};
use core::ptr;

/// Tag a large-allocation page (kind bits zero).
#[inline]
pub fn tag_large(page: *mut u8) -> *mut u8 {
    debug_assert_eq!(page as usize & PAGE_MASK, 0);
    page
}

/// Tag the inaccessible malloc(0) page.
#[inline]
pub fn tag_zero_page(page: *mut u8) -> *mut u8 {
    debug_assert_eq!(page as usize & PAGE_MASK, 0);
    (page as usize | 1) as *mut u8
}

/// Tag a chunk page of class `shift`.
#[inline]
pub fn tag_chunk_page(page: *mut u8, shift: usize) -> *mut u8 {
    debug_assert_eq!(page as usize & PAGE_MASK, 0);
    (page as usize | (shift + 1)) as *mut u8
}

/// One slot of the region index. `p` carries the kind tag in its low bits;
/// `size` is the requested size (guard included) for large regions and the
/// `ChunkInfo` address for chunk pages.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct RegionRecord {
    pub p: *mut u8,
    pub size: usize,
}

impl RegionRecord {
    const EMPTY: RegionRecord = RegionRecord {
        p: ptr::null_mut(),
        size: 0,
    };

    /// The base page of the region, tag stripped.
    #[inline]
    pub fn page(&self) -> *mut u8 {
        mask_page(self.p)
    }

    /// The real byte size this region represents: the stored size for large
    /// regions, zero for the malloc(0) page, the class size for chunk pages.
    #[inline]
    pub fn real_size(&self) -> usize {
        match self.p as usize & PAGE_MASK {
            0 => self.size,
            1 => 0,
            tag => 1 << (tag - 1),
        }
    }

    /// The chunk metadata this record points at. Only meaningful for chunk
    /// and malloc(0) pages.
    #[inline]
    pub fn chunk_info(&self) -> *mut ChunkInfo {
        self.size as *mut ChunkInfo
    }
}

/// Lookup/maintenance counters, dumped with the statistics block.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct RegionStats {
    pub inserts: usize,
    pub insert_collisions: usize,
    pub finds: usize,
    pub find_collisions: usize,
    pub deletes: usize,
    pub delete_moves: usize,
}

#[repr(C)]
pub struct RegionTable {
    slots: *mut RegionRecord,
    /// Total slot count; always a power of two.
    pub total: usize,
    /// Free slot count; `4 * free >= total` is restored before each insert.
    pub free: usize,
    pub stats: RegionStats,
}

const REGION_TABLE_LABEL: &[u8] = b"guardmalloc region table\0";

impl RegionTable {
    pub const fn new() -> Self {
        RegionTable {
            slots: ptr::null_mut(),
            total: 0,
            free: 0,
            stats: RegionStats {
                inserts: 0,
                insert_collisions: 0,
                finds: 0,
                find_collisions: 0,
                deletes: 0,
                delete_moves: 0,
            },
        }
    }

    /// Map the initial table. Returns false on mapping failure.
    pub unsafe fn init(&mut self) -> bool {
        let size = INITIAL_REGIONS * core::mem::size_of::<RegionRecord>();
        let p = guarded::map_guarded(size);
        if p.is_null() {
            return false;
        }
        crate::platform::name_region(p, size, REGION_TABLE_LABEL);
        self.slots = p as *mut RegionRecord;
        self.total = INITIAL_REGIONS;
        self.free = INITIAL_REGIONS;
        true
    }

    #[inline]
    unsafe fn slot(&self, index: usize) -> *mut RegionRecord {
        self.slots.add(index)
    }

    /// Insert a tagged pointer. Grows first when the load factor would exceed
    /// 3/4. Returns false when growth fails (treated as out of memory).
    pub unsafe fn insert(&mut self, tagged: *mut u8, size: usize) -> bool {
        if self.free * 4 < self.total && !self.grow() {
            return false;
        }
        let mask = self.total - 1;
        let mut index = hash_page(tagged) & mask;
        self.stats.inserts += 1;
        while !(*self.slot(index)).p.is_null() {
            index = index.wrapping_sub(1) & mask;
            self.stats.insert_collisions += 1;
        }
        *self.slot(index) = RegionRecord { p: tagged, size };
        self.free -= 1;
        true
    }

    /// Look up the record covering `p` (masked to its page). Returns null
    /// when the page is unknown to this table.
    pub unsafe fn find(&mut self, p: *mut u8) -> *mut RegionRecord {
        let page = mask_page(p);
        let mask = self.total - 1;
        let mut index = hash_page(page) & mask;
        self.stats.finds += 1;
        loop {
            let r = self.slot(index);
            if (*r).p.is_null() {
                return ptr::null_mut();
            }
            if mask_page((*r).p) == page {
                return r;
            }
            index = index.wrapping_sub(1) & mask;
            self.stats.find_collisions += 1;
        }
    }

    /// Remove a record previously returned by [`find`]. Algorithm R: walk the
    /// probe chain, moving entries whose home slot lies in the wrapped range
    /// back over the hole, until the first empty slot terminates the chain.
    pub unsafe fn delete(&mut self, record: *mut RegionRecord) {
        if self.total & (self.total - 1) != 0 {
            report::fatal(ptr::null_mut(), "regions_total not 2^x", ptr::null_mut());
        }
        let mask = self.total - 1;
        self.free += 1;
        self.stats.deletes += 1;

        let mut i = record.offset_from(self.slots) as usize;
        loop {
            *self.slot(i) = RegionRecord::EMPTY;
            let j = i;
            loop {
                i = i.wrapping_sub(1) & mask;
                if (*self.slot(i)).p.is_null() {
                    return;
                }
                let r = hash_page((*self.slot(i)).p) & mask;
                if (i <= r && r < j) || (r < j && j < i) || (j < i && i <= r) {
                    continue;
                }
                *self.slot(j) = *self.slot(i);
                self.stats.delete_moves += 1;
                break;
            }
        }
    }

    /// Double the table and rehash every live entry into a fresh guarded
    /// mapping. The old mapping is released outright so stale bookkeeping
    /// pages can never resurface through the page cache.
    unsafe fn grow(&mut self) -> bool {
        if self.total > usize::MAX / core::mem::size_of::<RegionRecord>() / 2 {
            return false;
        }
        let newtotal = self.total * 2;
        let newsize = newtotal * core::mem::size_of::<RegionRecord>();
        let mask = newtotal - 1;

        let p = guarded::map_guarded(newsize);
        if p.is_null() {
            return false;
        }
        crate::platform::name_region(p, newsize, REGION_TABLE_LABEL);
        let new_slots = p as *mut RegionRecord;

        self.stats.inserts = 0;
        self.stats.insert_collisions = 0;
        for i in 0..self.total {
            let rec = *self.slot(i);
            if rec.p.is_null() {
                continue;
            }
            let mut index = hash_page(rec.p) & mask;
            self.stats.inserts += 1;
            while !(*new_slots.add(index)).p.is_null() {
                index = index.wrapping_sub(1) & mask;
                self.stats.insert_collisions += 1;
            }
            *new_slots.add(index) = rec;
        }

        if guarded::unmap_guarded(
            self.slots as *mut u8,
            self.total * core::mem::size_of::<RegionRecord>(),
        ) != 0
        {
            report::fatal(ptr::null_mut(), "munmap", self.slots as *mut u8);
        }
        self.free += self.total;
        self.total = newtotal;
        self.slots = new_slots;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{PAGE_SIZE, PAGE_SHIFT};

    fn table() -> RegionTable {
        let mut t = RegionTable::new();
        assert!(unsafe { t.init() });
        t
    }

    fn page(n: usize) -> *mut u8 {
        (n * PAGE_SIZE) as *mut u8
    }

    #[test]
    fn insert_find_delete_roundtrip() {
        let mut t = table();
        unsafe {
            assert!(t.insert(tag_large(page(3)), 12345));
            let r = t.find(page(3).add(17));
            assert!(!r.is_null());
            assert_eq!((*r).real_size(), 12345);
            assert_eq!((*r).page(), page(3));
            t.delete(r);
            assert!(t.find(page(3)).is_null());
            assert_eq!(t.free, t.total);
        }
    }

    #[test]
    fn tags_decode_to_sizes() {
        let mut t = table();
        unsafe {
            assert!(t.insert(tag_zero_page(page(5)), 0));
            assert!(t.insert(tag_chunk_page(page(6), 5), 0xbeef0));
            let z = t.find(page(5));
            assert_eq!((*z).real_size(), 0);
            let c = t.find(page(6));
            assert_eq!((*c).real_size(), 32);
            assert_eq!((*c).chunk_info() as usize, 0xbeef0);
        }
    }

    #[test]
    fn load_factor_is_restored_by_growth() {
        let mut t = table();
        unsafe {
            for n in 1..=2000usize {
                assert!(t.insert(tag_large(page(n)), n));
                assert!(
                    4 * t.free >= t.total,
                    "load invariant broken at {} entries",
                    n
                );
            }
            assert!(t.total >= 4096);
            // Everything must still be findable after the rehashes.
            for n in 1..=2000usize {
                let r = t.find(page(n));
                assert!(!r.is_null(), "lost page {}", n);
                assert_eq!((*r).real_size(), n);
            }
        }
    }

    #[test]
    fn delete_repairs_probe_chains() {
        let mut t = table();
        // Pages crafted to collide: the hash shifts off PAGE_SHIFT bits, so
        // addresses differing only above bit PAGE_SHIFT + 40 tend to land
        // close together; instead just insert a dense run and delete from the
        // middle, which exercises the wrap-around move condition heavily.
        unsafe {
            let base = 1usize << (PAGE_SHIFT + 8);
            for n in 0..64usize {
                assert!(t.insert(tag_large(page(base + n)), n + 1));
            }
            for n in (0..64usize).step_by(2) {
                let r = t.find(page(base + n));
                assert!(!r.is_null());
                t.delete(r);
            }
            for n in 0..64usize {
                let r = t.find(page(base + n));
                if n % 2 == 0 {
                    assert!(r.is_null(), "deleted page {} still present", n);
                } else {
                    assert!(!r.is_null(), "surviving page {} lost", n);
                    assert_eq!((*r).real_size(), n + 1);
                }
            }
        }
    }
}
