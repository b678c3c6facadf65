//! Per-arena free-page cache: the front-end every page acquisition and
//! release goes through. Released spans are parked here (optionally junked,
//! advised away, or parked PROT_NONE) and handed back out before the OS is
//! asked for fresh pages. Cache bookkeeping errors are heap corruption and
//! fatal.
//!
//! Sizes stored in [`CacheRegion`] are in whole pages, unlike the region
//! index which stores bytes.

use crate::arena::{self, Arena};
use crate::options;
use crate::platform;
use crate::report;
use crate::util::{page_round, MAX_CACHE, PAGE_SHIFT, POISON_BYTE};
use core::ptr;

#[derive(Clone, Copy)]
#[repr(C)]
pub struct CacheRegion {
    pub p: *mut u8,
    /// Span length in pages.
    pub pages: usize,
}

#[repr(C)]
pub struct PageCache {
    pub regions: [CacheRegion; MAX_CACHE],
    /// Total pages currently parked.
    pub cached_pages: usize,
}

impl PageCache {
    pub const fn new() -> Self {
        const EMPTY: CacheRegion = CacheRegion {
            p: ptr::null_mut(),
            pages: 0,
        };
        PageCache {
            regions: [EMPTY; MAX_CACHE],
            cached_pages: 0,
        }
    }
}

/// Acquire `sz` bytes (page-rounded) of mapped memory for arena `d`.
///
/// Preference order: exact-size cached span, split of a larger cached span,
/// fresh OS mapping. With a non-null `hint` only a cached span starting
/// exactly at `hint` qualifies; the OS is never asked. The arena lock is
/// dropped around the raw mapping call so one arena's page fault storm does
/// not serialize the rest of the process.
///
/// # Safety
/// Arena lock held, `d` valid.
pub unsafe fn map(d: *mut Arena, hint: *mut u8, sz: usize, zero_fill: bool) -> *mut u8 {
    arena::check(d);
    if sz != page_round(sz) {
        report::fatal(d, "map round", ptr::null_mut());
    }
    let o = options::get();
    let psz = sz >> PAGE_SHIFT;

    if hint.is_null() && psz > (*d).cache.cached_pages {
        let left = arena::leave(d);
        let p = platform::map_anonymous(sz);
        arena::reenter(d, left);
        if !p.is_null() {
            (*d).stats.used_bytes += sz;
        }
        // Fresh anonymous pages arrive zeroed; no fill needed.
        return p;
    }

    let offset = (*d).rng.byte() as usize;
    let mut big: *mut CacheRegion = ptr::null_mut();
    for i in 0..o.cache_pages {
        let r = &mut (*d).cache.regions[(i + offset) & (o.cache_pages - 1)] as *mut CacheRegion;
        if (*r).p.is_null() {
            continue;
        }
        if !hint.is_null() && (*r).p != hint {
            continue;
        }
        if (*r).pages == psz {
            let p = (*r).p;
            (*r).p = ptr::null_mut();
            (*r).pages = 0;
            (*d).cache.cached_pages -= psz;
            if o.free_unmap {
                platform::protect_read_write(p, sz);
            }
            if o.hint {
                platform::advise_normal(p, sz);
            }
            if zero_fill {
                ptr::write_bytes(p, 0, sz);
            } else if o.junk_free && o.free_unmap {
                // Pages parked PROT_NONE were never junked on release.
                ptr::write_bytes(p, POISON_BYTE, sz);
            }
            return p;
        } else if (*r).pages > psz {
            big = r;
        }
    }

    if !big.is_null() {
        let r = big;
        let p = (*r).p;
        (*r).p = p.add(psz << PAGE_SHIFT);
        if o.free_unmap {
            platform::protect_read_write(p, sz);
        }
        if o.hint {
            platform::advise_normal(p, sz);
        }
        (*r).pages -= psz;
        (*d).cache.cached_pages -= psz;
        if zero_fill {
            ptr::write_bytes(p, 0, sz);
        } else if o.junk_free && o.free_unmap {
            ptr::write_bytes(p, POISON_BYTE, sz);
        }
        return p;
    }

    if !hint.is_null() {
        return ptr::null_mut();
    }
    if (*d).cache.cached_pages > o.cache_pages {
        report::fatal(d, "malloc cache", ptr::null_mut());
    }
    let left = arena::leave(d);
    let p = platform::map_anonymous(sz);
    arena::reenter(d, left);
    if !p.is_null() {
        (*d).stats.used_bytes += sz;
    }
    p
}

/// Release `sz` bytes (page-rounded) back to arena `d`'s cache, unmapping
/// for real whatever the cache cannot hold. Eviction scans from a random
/// offset so the cache's contents are not a FIFO an attacker can pace.
///
/// # Safety
/// Arena lock held; `p`/`sz` must describe a mapping the arena owns.
pub unsafe fn unmap(d: *mut Arena, p: *mut u8, sz: usize) {
    if sz != page_round(sz) {
        report::fatal(d, "munmap round", ptr::null_mut());
    }
    let o = options::get();
    let psz = sz >> PAGE_SHIFT;

    if psz > o.cache_pages {
        if platform::unmap(p, sz) != 0 {
            report::fatal(d, "munmap", p);
        }
        (*d).stats.used_bytes -= sz;
        return;
    }

    let mut tounmap = 0usize;
    let room = o.cache_pages - (*d).cache.cached_pages;
    if psz > room {
        tounmap = psz - room;
    }
    let offset = (*d).rng.byte() as usize;
    for i in 0..o.cache_pages {
        if tounmap == 0 {
            break;
        }
        let r = &mut (*d).cache.regions[(i + offset) & (o.cache_pages - 1)];
        if r.p.is_null() {
            continue;
        }
        let rsz = r.pages << PAGE_SHIFT;
        if platform::unmap(r.p, rsz) != 0 {
            report::fatal(d, "munmap", r.p);
        }
        r.p = ptr::null_mut();
        if tounmap > r.pages {
            tounmap -= r.pages;
        } else {
            tounmap = 0;
        }
        (*d).cache.cached_pages -= r.pages;
        r.pages = 0;
        (*d).stats.used_bytes -= rsz;
    }
    if tounmap > 0 {
        report::fatal(d, "malloc cache underflow", ptr::null_mut());
    }

    let mut parked = false;
    for i in 0..o.cache_pages {
        let r = &mut (*d).cache.regions[(i + offset) & (o.cache_pages - 1)];
        if r.p.is_null() {
            if o.junk_free && !o.free_unmap {
                ptr::write_bytes(p, POISON_BYTE, sz);
            }
            if o.hint {
                platform::advise_free(p, sz);
            }
            if o.free_unmap {
                platform::protect_none(p, sz);
            }
            r.p = p;
            r.pages = psz;
            (*d).cache.cached_pages += psz;
            parked = true;
            break;
        }
    }
    if !parked {
        report::fatal(d, "malloc free slot lost", ptr::null_mut());
    }
    if (*d).cache.cached_pages > o.cache_pages {
        report::fatal(d, "malloc cache overflow", ptr::null_mut());
    }
}

/// Drop every cached span that overlaps `[p, p + len]`. Used before the
/// cheap-realloc grow path asks the OS for the tail mapping, so a cached
/// span cannot shadow the address range.
///
/// # Safety
/// Arena lock held.
pub unsafe fn zap(d: *mut Arena, p: *mut u8, len: usize) {
    let o = options::get();
    for i in 0..o.cache_pages {
        let r = &mut (*d).cache.regions[i];
        if r.p.is_null() {
            continue;
        }
        if (r.p as usize) >= p as usize && (r.p as usize) <= p as usize + len {
            let rsz = r.pages << PAGE_SHIFT;
            if platform::unmap(r.p, rsz) != 0 {
                report::fatal(d, "munmap", r.p);
            }
            r.p = ptr::null_mut();
            (*d).cache.cached_pages -= r.pages;
            r.pages = 0;
            (*d).stats.used_bytes -= rsz;
        }
    }
}
