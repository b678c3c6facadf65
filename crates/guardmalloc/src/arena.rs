//! Arena state and the allocation engine. An arena owns a region index, the
//! chunk machinery, a free-page cache, a quarantine and a private RNG, all
//! serialized by one mutex. Threads shard onto arenas by thread id; a free or
//! size query that misses its own arena walks the others, migrating the lock
//! as it goes.
//!
//! Arenas live in the middle of a guard|arena|guard mapping at a random
//! in-page offset, bracketed by `canary1`/`canary2` which are re-checked on
//! every hot operation.

use crate::chunks::{self, ChunkList};
use crate::options;
use crate::pagecache::{self, PageCache};
use crate::platform;
use crate::quarantine::{self, Quarantine};
use crate::regions::{self, RegionRecord, RegionTable};
use crate::report;
use crate::rng::ArenaRng;
use crate::sync::RawMutex;
use crate::util::{
    page_round, CHUNK_LISTS, JUNK_BYTE, LEEWAY, MAX_CHUNK, MAX_SHIFT, MIN_SIZE, PAGE_SIZE,
    POISON_BYTE, UNKNOWN_OBJECT_SIZE,
};
use crate::util::ARENAS;
use core::ptr;

const ARENA_LABEL: &[u8] = b"guardmalloc arena\0";
const ARENA_GUARD_LABEL: &[u8] = b"guardmalloc arena guard page\0";

#[repr(C)]
pub struct ArenaStats {
    /// Bytes currently mapped on behalf of this arena (cache included).
    pub used_bytes: usize,
    /// Bytes spent on large-allocation guard pages.
    pub guarded_bytes: usize,
    pub cheap_realloc_tries: usize,
    pub cheap_reallocs: usize,
}

impl ArenaStats {
    const fn new() -> Self {
        ArenaStats {
            used_bytes: 0,
            guarded_bytes: 0,
            cheap_realloc_tries: 0,
            cheap_reallocs: 0,
        }
    }
}

#[repr(C)]
pub struct Arena {
    pub canary1: u32,
    /// Nesting depth of the current thread inside this arena; > 1 on entry
    /// means the allocator was re-entered (signal handler, debugger hook).
    pub active: i32,
    pub regions: RegionTable,
    /// Per-class pools of spare ChunkInfo records.
    pub chunk_pool: [ChunkList; MAX_SHIFT + 1],
    /// Per-class partial-page lists, fanned out over CHUNK_LISTS buckets.
    pub chunk_dir: [[ChunkList; CHUNK_LISTS]; MAX_SHIFT + 1],
    pub cache: PageCache,
    pub quarantine: Quarantine,
    pub rng: ArenaRng,
    /// Name of the public operation currently running, for diagnostics.
    pub func: &'static str,
    /// This arena's index into the lock table and the pools array.
    pub mutex: usize,
    /// Rolling start offset for bitmap scans.
    pub chunk_start: u16,
    pub stats: ArenaStats,
    pub canary2: u32,
}

// ---------------------------------------------------------------------------
// Locking
// ---------------------------------------------------------------------------

const LOCK_INIT: RawMutex = RawMutex::new();
static LOCKS: [RawMutex; ARENAS] = [LOCK_INIT; ARENAS];

pub fn lock_index(i: usize) {
    LOCKS[i].lock();
}

pub fn unlock_index(i: usize) {
    LOCKS[i].unlock();
}

/// # Safety
/// `d` must point to a live arena.
pub unsafe fn lock_pool(d: *mut Arena) {
    LOCKS[(*d).mutex].lock();
}

/// # Safety
/// `d` must point to a live arena.
pub unsafe fn unlock_pool(d: *mut Arena) {
    LOCKS[(*d).mutex].unlock();
}

pub fn lock_all() {
    for l in &LOCKS {
        l.lock();
    }
}

pub fn unlock_all() {
    for l in &LOCKS {
        l.unlock();
    }
}

/// # Safety
/// Single-threaded post-fork child only.
pub unsafe fn reset_locks() {
    for l in &LOCKS {
        l.force_reset();
    }
}

/// Drop the arena lock around a slow OS call so page faults in one arena do
/// not serialize the process. Only meaningful once multiple threads exist.
/// Returns whether the lock was released; pass the result to [`reenter`] so
/// the pair stays balanced even if threading mode flips in between.
///
/// # Safety
/// Caller must hold `d`'s lock and call [`reenter`] before touching the
/// arena again.
pub unsafe fn leave(d: *mut Arena) -> bool {
    if options::get().multi_threaded {
        (*d).active -= 1;
        unlock_pool(d);
        true
    } else {
        false
    }
}

/// # Safety
/// Pairs with [`leave`].
pub unsafe fn reenter(d: *mut Arena, left: bool) {
    if left {
        lock_pool(d);
        (*d).active += 1;
    }
}

// ---------------------------------------------------------------------------
// Arena lifecycle
// ---------------------------------------------------------------------------

fn empty_arena(index: usize) -> Arena {
    const LIST: ChunkList = ChunkList::new();
    const DIR: [ChunkList; CHUNK_LISTS] = [LIST; CHUNK_LISTS];
    Arena {
        canary1: 0,
        active: 0,
        regions: RegionTable::new(),
        chunk_pool: [LIST; MAX_SHIFT + 1],
        chunk_dir: [DIR; MAX_SHIFT + 1],
        cache: PageCache::new(),
        quarantine: Quarantine::new(),
        rng: ArenaRng::new(),
        func: "init():",
        mutex: index,
        chunk_start: 0,
        stats: ArenaStats::new(),
        canary2: 0,
    }
}

/// Create arena `index`: a guard|arena|guard spread with the arena at a
/// random in-page offset, plus its region table and quarantine arrays.
/// Mapping failures at this point are fatal; there is no allocator to fall
/// back to.
///
/// # Safety
/// Init path only, options parsed, secrets drawn.
pub unsafe fn create(index: usize) -> *mut Arena {
    let rsz = page_round(core::mem::size_of::<Arena>());
    let p = platform::map_anonymous(rsz + 2 * PAGE_SIZE);
    if p.is_null() {
        report::fatal(ptr::null_mut(), "malloc init mmap failed", ptr::null_mut());
    }
    platform::protect_none(p, PAGE_SIZE);
    platform::protect_none(p.add(PAGE_SIZE + rsz), PAGE_SIZE);
    platform::name_region(p, PAGE_SIZE, ARENA_GUARD_LABEL);
    platform::name_region(p.add(PAGE_SIZE), rsz, ARENA_LABEL);
    platform::name_region(p.add(PAGE_SIZE + rsz), PAGE_SIZE, ARENA_GUARD_LABEL);

    let align = core::mem::align_of::<Arena>();
    let avail = (rsz - core::mem::size_of::<Arena>()) / align;
    let offset = platform::random_uniform(avail as u32) as usize * align;
    let d = p.add(PAGE_SIZE + offset) as *mut Arena;

    ptr::write(d, empty_arena(index));
    (*d).rng.refill();
    if !(*d).regions.init() {
        report::fatal(ptr::null_mut(), "malloc init mmap failed", ptr::null_mut());
    }

    let o = options::get();
    (*d).canary1 = o.process_canary ^ (d as usize as u32);
    (*d).canary2 = !(*d).canary1;

    if o.quarantine_depth != 0 && !(*d).quarantine.init(o.quarantine_depth) {
        report::fatal(ptr::null_mut(), "malloc init mmap failed", ptr::null_mut());
    }
    d
}

/// Verify the arena's canary bracket against the process canary. Cheap, and
/// run on every map, lookup and chunk allocation so bookkeeping tampering is
/// caught at the next operation.
///
/// # Safety
/// `d` must point to a live arena.
pub unsafe fn check(d: *mut Arena) {
    let o = options::get();
    if o.process_canary != (*d).canary1 ^ (d as usize as u32) || (*d).canary1 != !(*d).canary2 {
        report::fatal(d, "internal struct corrupt", ptr::null_mut());
    }
}

/// Canary-checked region lookup.
///
/// # Safety
/// Arena lock held.
pub unsafe fn find_region(d: *mut Arena, p: *mut u8) -> *mut RegionRecord {
    check(d);
    (*d).regions.find(p)
}

// ---------------------------------------------------------------------------
// Cross-arena owner search
// ---------------------------------------------------------------------------

/// Find the arena owning `p`, starting at `argd` (already locked). On a miss
/// in `argd` the other arenas are walked, releasing the current lock before
/// taking the next, so two threads searching in opposite directions cannot
/// deadlock. Returns the pool that ends up locked and the record (null if
/// `p` is unknown everywhere).
///
/// # Safety
/// `argd` locked, its `active` already raised by the entry point.
unsafe fn find_owner(argd: *mut Arena, p: *mut u8) -> (*mut Arena, *mut RegionRecord) {
    let mut pool = argd;
    let mut r = find_region(pool, p);
    if r.is_null() && options::get().multi_threaded {
        for i in 0..ARENAS {
            if i == (*argd).mutex {
                continue;
            }
            (*pool).active -= 1;
            unlock_pool(pool);
            pool = options::get().pools[i];
            lock_pool(pool);
            (*pool).active += 1;
            r = find_region(pool, p);
            if !r.is_null() {
                break;
            }
        }
    }
    (pool, r)
}

/// Return the lock to the entry arena after a cross-arena operation.
///
/// # Safety
/// `pool` locked; pairs with a preceding [`find_owner`].
unsafe fn migrate_back(argd: *mut Arena, pool: *mut Arena) {
    if argd != pool {
        (*pool).active -= 1;
        unlock_pool(pool);
        lock_pool(argd);
        (*argd).active += 1;
    }
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

/// Allocate `sz` bytes from arena `d`. `sz` already includes the canary for
/// small requests. Large requests get a page-rounded mapping, an optional
/// trailing guard page, and are optionally shifted so the object ends flush
/// against the guard.
///
/// # Safety
/// Arena lock held.
pub unsafe fn alloc_in(d: *mut Arena, sz: usize, zero_fill: bool) -> *mut u8 {
    let o = options::get();
    if sz > MAX_CHUNK {
        if sz >= usize::MAX - o.guard_bytes - PAGE_SIZE {
            platform::set_errno(libc::ENOMEM);
            return ptr::null_mut();
        }
        let sz = sz + o.guard_bytes;
        let psz = page_round(sz);
        let mut p = pagecache::map(d, ptr::null_mut(), psz, zero_fill);
        if p.is_null() {
            platform::set_errno(libc::ENOMEM);
            return ptr::null_mut();
        }
        if !(*d).regions.insert(regions::tag_large(p), sz) {
            pagecache::unmap(d, p, psz);
            platform::set_errno(libc::ENOMEM);
            return ptr::null_mut();
        }
        if o.guard_bytes != 0 {
            if platform::protect_none(p.add(psz - o.guard_bytes), o.guard_bytes) != 0 {
                report::fatal(d, "mprotect", ptr::null_mut());
            }
            (*d).stats.guarded_bytes += o.guard_bytes;
        }

        if o.move_to_end && sz - o.guard_bytes < PAGE_SIZE - LEEWAY {
            // Object fits in one page: park it at the far end so a linear
            // overflow runs straight into the guard (or the next mapping).
            if o.junk_init {
                ptr::write_bytes(p, JUNK_BYTE, psz - o.guard_bytes);
            }
            p = p.add((PAGE_SIZE - LEEWAY - (sz - o.guard_bytes)) & !(MIN_SIZE - 1));
            if zero_fill && o.junk_init {
                ptr::write_bytes(p, 0, sz - o.guard_bytes);
            }
        } else if o.junk_init {
            if zero_fill {
                ptr::write_bytes(p.add(sz - o.guard_bytes), JUNK_BYTE, psz - sz);
            } else {
                ptr::write_bytes(p, JUNK_BYTE, psz - o.guard_bytes);
            }
        }
        p
    } else {
        let p = chunks::alloc_bytes(d, sz);
        if zero_fill && !p.is_null() && sz > 0 {
            ptr::write_bytes(p, 0, sz - o.canary_len);
        }
        p
    }
}

// ---------------------------------------------------------------------------
// Free
// ---------------------------------------------------------------------------

/// Check that a freed-and-quarantined chunk still carries its poison fill.
/// Any other byte value means the chunk was written through a dangling
/// pointer while in quarantine.
///
/// # Safety
/// Arena lock held; `p` must be a quarantined chunk of this arena.
pub unsafe fn validate_junk(d: *mut Arena, p: *mut u8) {
    if p.is_null() {
        return;
    }
    let r = find_region(d, p);
    if r.is_null() {
        report::fatal(d, "bogus pointer in validate_junk", p);
    }
    let o = options::get();
    let mut sz = (*r).real_size();
    if sz > 0 && sz <= MAX_CHUNK {
        sz -= o.canary_len;
    }
    if !o.validate_full && sz > 32 {
        sz = 32;
    }
    for byte in 0..sz {
        if *p.add(byte) != POISON_BYTE {
            report::fatal(d, "use after free", p);
        }
    }
}

unsafe fn free_large(pool: *mut Arena, r: *mut RegionRecord, p: *mut u8, sz: usize) {
    let o = options::get();
    let mut p = p;
    if sz - o.guard_bytes >= PAGE_SIZE - LEEWAY {
        if (*r).p != p {
            report::fatal(pool, "bogus pointer", p);
        }
    } else {
        // Shifted toward the guard at allocation time; release the mapping.
        p = (*r).p;
    }
    if o.guard_bytes != 0 {
        if sz < o.guard_bytes {
            report::fatal(pool, "guard size", ptr::null_mut());
        }
        if !o.free_unmap
            && platform::protect_read_write(p.add(page_round(sz) - o.guard_bytes), o.guard_bytes)
                != 0
        {
            report::fatal(pool, "mprotect", ptr::null_mut());
        }
        (*pool).stats.guarded_bytes -= o.guard_bytes;
    }
    pagecache::unmap(pool, p, page_round(sz));
    (*pool).regions.delete(r);
}

unsafe fn free_small(pool: *mut Arena, r: *mut RegionRecord, p: *mut u8, sz: usize) {
    let o = options::get();
    let mut p = p;
    if o.junk_free && sz > 0 {
        ptr::write_bytes(p, POISON_BYTE, sz - o.canary_len);
    }
    if o.quarantine_depth != 0 {
        // Validates alignment, tail canary and the free-bit before the
        // pointer enters the rings.
        chunks::find_chunknum(pool, r, p);
        p = quarantine::defer(pool, p);
        if p.is_null() {
            return;
        }
        if o.junk_free {
            validate_junk(pool, p);
        }
    }
    // With the quarantine disabled this is still the original pointer and
    // the free goes straight to the slab.
    let r = find_region(pool, p);
    if r.is_null() {
        report::fatal(pool, "bogus pointer (double free?)", p);
    }
    chunks::free_bytes(pool, r, p);
}

/// Free `p`, wherever it lives. Unknown pointers are fatal.
///
/// # Safety
/// `argd` locked with `active` raised.
pub unsafe fn free_in(argd: *mut Arena, p: *mut u8) {
    let (pool, r) = find_owner(argd, p);
    if r.is_null() {
        report::fatal(pool, "bogus pointer (double free?)", p);
    }
    let sz = (*r).real_size();
    if sz > MAX_CHUNK {
        free_large(pool, r, p, sz);
    } else {
        free_small(pool, r, p, sz);
    }
    migrate_back(argd, pool);
}

// ---------------------------------------------------------------------------
// Realloc
// ---------------------------------------------------------------------------

unsafe fn realloc_locked(
    pool: *mut Arena,
    r: *mut RegionRecord,
    p: *mut u8,
    newsz: usize,
) -> *mut u8 {
    let o = options::get();
    if newsz >= usize::MAX - o.guard_bytes - PAGE_SIZE {
        platform::set_errno(libc::ENOMEM);
        return ptr::null_mut();
    }

    let mut oldsz = (*r).real_size();
    let goldsz = oldsz;
    if oldsz > MAX_CHUNK {
        if oldsz < o.guard_bytes {
            report::fatal(pool, "guard size", ptr::null_mut());
        }
        oldsz -= o.guard_bytes;
    }
    let mut gnewsz = newsz;
    if gnewsz > MAX_CHUNK {
        gnewsz += o.guard_bytes;
    }

    if newsz > MAX_CHUNK && oldsz > MAX_CHUNK && p == (*r).p && !o.force_realloc {
        let roldsz = page_round(goldsz);
        let rnewsz = page_round(gnewsz);
        if rnewsz > roldsz {
            if o.guard_bytes == 0 {
                let hint = p.add(roldsz);
                let needed = rnewsz - roldsz;
                (*pool).stats.cheap_realloc_tries += 1;

                // A cached span starting exactly at the tail extends the
                // mapping in place. Failing that, clear the cache out of the
                // way and ask the OS for the exact address; accept only an
                // exact placement, anything else is unmapped again.
                let mut q = pagecache::map(pool, hint, needed, false);
                if q.is_null() {
                    pagecache::zap(pool, hint, needed);
                    let left = leave(pool);
                    let m = platform::map_at_hint(hint, needed);
                    reenter(pool, left);
                    if m == hint {
                        (*pool).stats.used_bytes += needed;
                        q = m;
                    } else if !m.is_null() {
                        platform::unmap(m, needed);
                    }
                }
                if q == hint {
                    if o.junk_init {
                        ptr::write_bytes(hint, JUNK_BYTE, needed);
                    }
                    (*r).size = newsz;
                    (*pool).stats.cheap_reallocs += 1;
                    return p;
                }
            }
        } else if rnewsz < roldsz {
            if o.guard_bytes != 0 {
                if platform::protect_read_write(
                    p.add(roldsz - o.guard_bytes),
                    o.guard_bytes,
                ) != 0
                {
                    report::fatal(pool, "mprotect", ptr::null_mut());
                }
                if platform::protect_none(p.add(rnewsz - o.guard_bytes), o.guard_bytes) != 0 {
                    report::fatal(pool, "mprotect", ptr::null_mut());
                }
            }
            pagecache::unmap(pool, p.add(rnewsz), roldsz - rnewsz);
            (*r).size = gnewsz;
            return p;
        } else {
            if newsz > oldsz && o.junk_init {
                ptr::write_bytes(p.add(newsz), JUNK_BYTE, rnewsz - o.guard_bytes - newsz);
            }
            (*r).size = gnewsz;
            return p;
        }
    }

    if newsz <= oldsz && newsz > oldsz / 2 && !o.force_realloc {
        // Keep in place; junk the abandoned tail so stale data cannot be
        // resurrected by a later grow.
        if o.junk_init && newsz > 0 {
            let mut usable_oldsz = oldsz;
            if oldsz <= MAX_CHUNK {
                usable_oldsz -= o.canary_len;
            }
            if newsz < usable_oldsz {
                ptr::write_bytes(p.add(newsz), JUNK_BYTE, usable_oldsz - newsz);
            }
        }
        p
    } else if newsz != oldsz || o.force_realloc {
        let q = alloc_in(pool, newsz, false);
        if q.is_null() {
            return ptr::null_mut();
        }
        if newsz != 0 && oldsz != 0 {
            let mut copysz = oldsz.min(newsz);
            if copysz <= MAX_CHUNK {
                copysz -= o.canary_len;
            }
            ptr::copy_nonoverlapping(p, q, copysz);
        }
        free_in(pool, p);
        q
    } else {
        p
    }
}

/// Reallocate `p` to `newsz` bytes (`newsz` already canary-adjusted).
///
/// # Safety
/// `argd` locked with `active` raised.
pub unsafe fn realloc_in(argd: *mut Arena, p: *mut u8, newsz: usize) -> *mut u8 {
    if p.is_null() {
        return alloc_in(argd, newsz, false);
    }
    let (pool, r) = find_owner(argd, p);
    if r.is_null() {
        report::fatal(pool, "bogus pointer (double free?)", p);
    }
    let ret = realloc_locked(pool, r, p, newsz);
    migrate_back(argd, pool);
    ret
}

// ---------------------------------------------------------------------------
// Aligned allocation
// ---------------------------------------------------------------------------

/// Map a span with at least `alignment`-aligned base by over-mapping and
/// trimming both ends.
unsafe fn mapalign(d: *mut Arena, alignment: usize, sz: usize, zero_fill: bool) -> *mut u8 {
    if alignment < PAGE_SIZE || !alignment.is_power_of_two() {
        report::fatal(d, "mapalign bad alignment", ptr::null_mut());
    }
    if sz != page_round(sz) {
        report::fatal(d, "mapalign round", ptr::null_mut());
    }
    if alignment > usize::MAX - sz {
        return ptr::null_mut();
    }

    let p = pagecache::map(d, ptr::null_mut(), sz + alignment, zero_fill);
    if p.is_null() {
        return ptr::null_mut();
    }
    let q = crate::util::align_up(p as usize, alignment) as *mut u8;
    let lead = q as usize - p as usize;
    if lead != 0 && platform::unmap(p, lead) != 0 {
        report::fatal(d, "munmap", p);
    }
    if platform::unmap(q.add(sz), alignment - lead) != 0 {
        report::fatal(d, "munmap", q.add(sz));
    }
    (*d).stats.used_bytes -= alignment;
    q
}

/// Aligned allocation. Page-or-smaller alignments fall out of the
/// power-of-two classes for free; larger ones oversize and trim.
///
/// # Safety
/// Arena lock held; `sz` canary-adjusted by the caller.
pub unsafe fn memalign_in(d: *mut Arena, alignment: usize, sz: usize, zero_fill: bool) -> *mut u8 {
    let o = options::get();
    if alignment <= PAGE_SIZE {
        // Power-of-two chunks are naturally aligned to their size.
        let sz = if sz < alignment { alignment } else { sz };
        return alloc_in(d, sz, zero_fill);
    }

    if sz >= usize::MAX - o.guard_bytes - PAGE_SIZE {
        platform::set_errno(libc::ENOMEM);
        return ptr::null_mut();
    }
    let mut sz = sz;
    if sz < PAGE_SIZE {
        sz = PAGE_SIZE;
    }
    sz += o.guard_bytes;
    let psz = page_round(sz);

    let p = mapalign(d, alignment, psz, zero_fill);
    if p.is_null() {
        platform::set_errno(libc::ENOMEM);
        return ptr::null_mut();
    }

    if !(*d).regions.insert(regions::tag_large(p), sz) {
        pagecache::unmap(d, p, psz);
        platform::set_errno(libc::ENOMEM);
        return ptr::null_mut();
    }

    if o.guard_bytes != 0 {
        if platform::protect_none(p.add(psz - o.guard_bytes), o.guard_bytes) != 0 {
            report::fatal(d, "mprotect", ptr::null_mut());
        }
        (*d).stats.guarded_bytes += o.guard_bytes;
    }

    if o.junk_init {
        if zero_fill {
            ptr::write_bytes(p.add(sz - o.guard_bytes), JUNK_BYTE, psz - sz);
        } else {
            ptr::write_bytes(p, JUNK_BYTE, psz - o.guard_bytes);
        }
    }
    p
}

// ---------------------------------------------------------------------------
// Size queries
// ---------------------------------------------------------------------------

/// Usable bytes behind `p`: class size minus canary for chunks, mapped size
/// minus guard for large regions. Unknown pointers are fatal.
///
/// # Safety
/// `argd` locked with `active` raised.
pub unsafe fn usable_size_in(argd: *mut Arena, p: *mut u8) -> usize {
    let (pool, r) = find_owner(argd, p);
    if r.is_null() {
        report::fatal(pool, "bogus pointer (double free?)", p);
    }
    let o = options::get();
    let sz = (*r).real_size();
    let ret = if sz > MAX_CHUNK {
        sz - o.guard_bytes
    } else {
        // Validates the canary and the bitmap bit as a side effect.
        chunks::find_chunknum(pool, r, p);
        if sz == 0 {
            0
        } else {
            sz - o.canary_len
        }
    };
    migrate_back(argd, pool);
    ret
}

/// Valid bytes from `p` (which may be interior) to the end of its object,
/// honouring the end-of-page shift of moved large allocations. Returns
/// [`UNKNOWN_OBJECT_SIZE`] when `p` cannot be resolved.
///
/// # Safety
/// `argd` locked with `active` raised.
pub unsafe fn object_size_in(argd: *mut Arena, p: *mut u8) -> usize {
    let (pool, r) = find_owner(argd, p);
    let o = options::get();
    let ret;
    if r.is_null() {
        ret = UNKNOWN_OBJECT_SIZE;
    } else {
        let sz = (*r).real_size();
        if sz == 0 {
            ret = 0;
        } else if sz <= MAX_CHUNK {
            // Chunk base falls out of the power-of-two grid.
            let base = p as usize & !(sz - 1);
            let offset = p as usize - base;
            let usable = sz - o.canary_len;
            ret = if offset > usable { 0 } else { usable - offset };
        } else {
            let mut base = (*r).page() as usize;
            if o.move_to_end && sz - o.guard_bytes < PAGE_SIZE - LEEWAY {
                base += (PAGE_SIZE - LEEWAY - (sz - o.guard_bytes)) & !(MIN_SIZE - 1);
            }
            let offset = (p as usize).wrapping_sub(base);
            ret = if offset > sz - o.guard_bytes {
                0
            } else {
                sz - o.guard_bytes - offset
            };
        }
    }
    migrate_back(argd, pool);
    ret
}

// ---------------------------------------------------------------------------
// Quarantine drain
// ---------------------------------------------------------------------------

/// Validate and release everything still sitting in the quarantine rings.
///
/// # Safety
/// Arena lock held.
pub unsafe fn drain_quarantine(d: *mut Arena) {
    let o = options::get();
    if o.quarantine_depth == 0 {
        return;
    }
    for ring in [(*d).quarantine.probe, (*d).quarantine.queue] {
        for i in 0..o.quarantine_depth {
            let slot = ring.add(i);
            let p = *slot;
            if p.is_null() {
                continue;
            }
            if o.junk_free {
                validate_junk(d, p);
            }
            let r = find_region(d, p);
            if r.is_null() {
                report::fatal(d, "bogus pointer in quarantine drain", p);
            }
            quarantine::set_delete(d, p);
            chunks::free_bytes(d, r, p);
            *slot = ptr::null_mut();
        }
    }
}

/// atexit hook: drain every arena's quarantine so lingering use-after-free
/// writes are caught before the process disappears.
pub extern "C" fn quarantine_atexit() {
    unsafe {
        let o = options::get();
        for i in 0..ARENAS {
            let d = o.pools[i];
            if d.is_null() {
                continue;
            }
            lock_index(i);
            (*d).func = "drain_quarantine():";
            drain_quarantine(d);
            unlock_index(i);
        }
    }
}
