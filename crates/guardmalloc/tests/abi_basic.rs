//! ABI behavior tests for guardmalloc.
//!
//! These exercise the standard C allocator semantics through the crate's
//! exported entry points. The entry points are `#[no_mangle]`, so the test
//! binary's own heap is served by guardmalloc as well; every assertion runs
//! on top of the allocator it is testing.

use guardmalloc::api;
use guardmalloc::util::{MAX_CHUNK, PAGE_SIZE, UNKNOWN_OBJECT_SIZE};
use std::collections::HashSet;
use std::ffi::c_void;
use std::ptr;

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn set_errno(v: i32) {
    unsafe {
        *libc::__errno_location() = v;
    }
}

const CANARY_LEN: usize = core::mem::size_of::<*mut u8>();

// ---------------------------------------------------------------------------
// malloc basics
// ---------------------------------------------------------------------------

#[test]
fn malloc_returns_writable_memory() {
    unsafe {
        let p = api::malloc(100) as *mut u8;
        assert!(!p.is_null());
        ptr::write_bytes(p, 0xab, 100);
        assert_eq!(*p, 0xab);
        assert_eq!(*p.add(99), 0xab);
        api::free(p as *mut c_void);
    }
}

#[test]
fn malloc_alignment_is_at_least_two_pointers() {
    unsafe {
        for size in [1usize, 7, 16, 24, 100, 1000, 2047, 5000, 100_000] {
            let p = api::malloc(size) as usize;
            assert!(p != 0);
            assert_eq!(p % 16, 0, "malloc({}) returned unaligned {:#x}", size, p);
            api::free(p as *mut c_void);
        }
    }
}

#[test]
fn small_sizes_round_trip_through_all_classes() {
    unsafe {
        for size in 1..=MAX_CHUNK {
            if size % 37 != 0 && size != 1 && size != MAX_CHUNK {
                continue; // sample the range, hit both ends
            }
            let p = api::malloc(size) as *mut u8;
            assert!(!p.is_null(), "malloc({}) failed", size);
            let usable = api::malloc_usable_size(p as *const c_void);
            assert!(usable >= size, "usable {} < requested {}", usable, size);
            ptr::write_bytes(p, 0x5c, usable);
            api::free(p as *mut c_void);
        }
    }
}

#[test]
fn distinct_allocations_do_not_overlap() {
    unsafe {
        let mut live: Vec<(usize, usize)> = Vec::new();
        for _ in 0..512 {
            let p = api::malloc(48) as usize;
            assert!(p != 0);
            let usable = api::malloc_usable_size(p as *const c_void);
            for &(q, qlen) in &live {
                assert!(
                    p + usable <= q || q + qlen <= p,
                    "allocation {:#x} overlaps {:#x}",
                    p,
                    q
                );
            }
            live.push((p, usable));
        }
        for (p, _) in live {
            api::free(p as *mut c_void);
        }
    }
}

// ---------------------------------------------------------------------------
// malloc(0): distinct, untouchable sentinels
// ---------------------------------------------------------------------------

#[test]
fn malloc_zero_returns_unique_non_null_pointers() {
    unsafe {
        let mut ptrs = Vec::new();
        for _ in 0..64 {
            let p = api::malloc(0);
            assert!(!p.is_null(), "malloc(0) must return non-NULL");
            ptrs.push(p as usize);
        }
        let unique: HashSet<usize> = ptrs.iter().copied().collect();
        assert_eq!(unique.len(), ptrs.len(), "malloc(0) pointers must be distinct");
        for p in ptrs {
            api::free(p as *mut c_void);
        }
    }
}

#[test]
fn malloc_zero_reports_zero_size() {
    unsafe {
        let p = api::malloc(0);
        assert_eq!(api::malloc_usable_size(p), 0);
        assert_eq!(api::__malloc_object_size(p), 0);
        api::free(p);
    }
}

// ---------------------------------------------------------------------------
// free
// ---------------------------------------------------------------------------

#[test]
fn free_null_is_a_no_op() {
    unsafe {
        api::free(ptr::null_mut());
    }
}

#[test]
fn free_preserves_errno() {
    unsafe {
        let p = api::malloc(64);
        set_errno(7777);
        api::free(p);
        assert_eq!(errno(), 7777);
    }
}

// ---------------------------------------------------------------------------
// realloc
// ---------------------------------------------------------------------------

#[test]
fn realloc_null_behaves_like_malloc() {
    unsafe {
        let p = api::realloc(ptr::null_mut(), 77) as *mut u8;
        assert!(!p.is_null());
        assert!(api::malloc_usable_size(p as *const c_void) >= 77);
        api::free(p as *mut c_void);
    }
}

#[test]
fn realloc_grow_preserves_contents() {
    unsafe {
        let p = api::malloc(40) as *mut u8;
        for i in 0..40 {
            *p.add(i) = i as u8;
        }
        let q = api::realloc(p as *mut c_void, 4000) as *mut u8;
        assert!(!q.is_null());
        for i in 0..40 {
            assert_eq!(*q.add(i), i as u8, "byte {} lost in grow", i);
        }
        api::free(q as *mut c_void);
    }
}

#[test]
fn realloc_shrink_preserves_contents() {
    unsafe {
        let p = api::malloc(10_000) as *mut u8;
        for i in 0..64 {
            *p.add(i) = (i * 3) as u8;
        }
        let q = api::realloc(p as *mut c_void, 64) as *mut u8;
        assert!(!q.is_null());
        for i in 0..64 {
            assert_eq!(*q.add(i), (i * 3) as u8, "byte {} lost in shrink", i);
        }
        api::free(q as *mut c_void);
    }
}

#[test]
fn realloc_large_shrink_by_less_than_half_keeps_pointer() {
    unsafe {
        let p = api::realloc(ptr::null_mut(), 64 * PAGE_SIZE);
        assert!(!p.is_null());
        let q = api::realloc(p, 40 * PAGE_SIZE);
        assert_eq!(q, p, "page-granular shrink should stay in place");
        api::free(q);
    }
}

#[test]
fn realloc_large_grow_in_place_or_copy() {
    unsafe {
        let p = api::malloc(3 * PAGE_SIZE) as *mut u8;
        *p = 0x42;
        let q = api::realloc(p as *mut c_void, 6 * PAGE_SIZE) as *mut u8;
        assert!(!q.is_null());
        assert_eq!(*q, 0x42);
        // Whole new range must be writable whether it grew in place or moved.
        ptr::write_bytes(q, 0x17, 6 * PAGE_SIZE);
        api::free(q as *mut c_void);
    }
}

// ---------------------------------------------------------------------------
// calloc
// ---------------------------------------------------------------------------

#[test]
fn calloc_zeroes_memory() {
    unsafe {
        // Recycle chunks first so calloc gets dirty memory to clean.
        let mut dirty = Vec::new();
        for _ in 0..32 {
            let p = api::malloc(200) as *mut u8;
            ptr::write_bytes(p, 0xff, 200);
            dirty.push(p);
        }
        for p in dirty {
            api::free(p as *mut c_void);
        }

        for _ in 0..64 {
            let p = api::calloc(25, 8) as *mut u8;
            assert!(!p.is_null());
            for i in 0..200 {
                assert_eq!(*p.add(i), 0, "calloc byte {} not zero", i);
            }
            api::free(p as *mut c_void);
        }
    }
}

#[test]
fn calloc_overflow_fails_with_enomem() {
    unsafe {
        set_errno(0);
        let p = api::calloc(usize::MAX / 2 + 1, 4);
        assert!(p.is_null());
        assert_eq!(errno(), libc::ENOMEM);
    }
}

// ---------------------------------------------------------------------------
// Aligned allocations
// ---------------------------------------------------------------------------

#[test]
fn posix_memalign_rejects_bad_alignment() {
    unsafe {
        let mut p: *mut c_void = ptr::null_mut();
        assert_eq!(api::posix_memalign(&mut p, 3, 64), libc::EINVAL);
        assert_eq!(api::posix_memalign(&mut p, 0, 64), libc::EINVAL);
        assert_eq!(api::posix_memalign(&mut p, 4, 64), libc::EINVAL);
    }
}

#[test]
fn posix_memalign_honors_alignment() {
    unsafe {
        for &align in &[16usize, 64, 256, 1024, PAGE_SIZE, 4 * PAGE_SIZE] {
            for &size in &[1usize, 100, 4000, 20_000] {
                let mut p: *mut c_void = ptr::null_mut();
                let r = api::posix_memalign(&mut p, align, size);
                assert_eq!(r, 0, "posix_memalign({}, {}) failed: {}", align, size, r);
                assert!(!p.is_null());
                assert_eq!(p as usize % align, 0, "{:#x} not {}-aligned", p as usize, align);
                ptr::write_bytes(p as *mut u8, 0x61, size);
                api::free(p);
            }
        }
    }
}

#[test]
fn memalign_rounds_odd_boundaries_up() {
    unsafe {
        // 48 is not a power of two; must behave as 64.
        let p = api::memalign(48, 200) as usize;
        assert!(p != 0);
        assert_eq!(p % 64, 0);
        api::free(p as *mut c_void);
    }
}

#[test]
fn aligned_alloc_enforces_c11_contract() {
    unsafe {
        set_errno(0);
        let p = api::aligned_alloc(64, 100); // 100 not a multiple of 64
        assert!(p.is_null());
        assert_eq!(errno(), libc::EINVAL);

        let p = api::aligned_alloc(64, 128);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        api::free(p);
    }
}

#[test]
fn valloc_and_pvalloc_are_page_aligned() {
    unsafe {
        let p = api::valloc(100);
        assert!(!p.is_null());
        assert_eq!(p as usize % PAGE_SIZE, 0);
        api::free(p);

        let p = api::pvalloc(PAGE_SIZE + 1);
        assert!(!p.is_null());
        assert_eq!(p as usize % PAGE_SIZE, 0);
        assert!(api::malloc_usable_size(p) >= 2 * PAGE_SIZE);
        api::free(p);

        set_errno(0);
        let p = api::pvalloc(usize::MAX - 2);
        assert!(p.is_null());
        assert_eq!(errno(), libc::ENOMEM);
    }
}

// ---------------------------------------------------------------------------
// Size queries
// ---------------------------------------------------------------------------

#[test]
fn small_allocation_size_queries_match_class_layout() {
    unsafe {
        // 17 bytes + canary lands in the 32-byte class.
        let p = api::malloc(17);
        assert_eq!(api::malloc_usable_size(p), 32 - CANARY_LEN);
        assert_eq!(api::__malloc_object_size(p), 32 - CANARY_LEN);
        api::free(p);
    }
}

#[test]
fn object_size_counts_from_interior_pointers() {
    unsafe {
        let p = api::malloc(100) as *mut u8; // 128-byte class
        let usable = api::malloc_usable_size(p as *const c_void);
        assert_eq!(usable, 128 - CANARY_LEN);
        let inner = api::__malloc_object_size(p.add(10) as *const c_void);
        assert_eq!(inner, usable - 10);
        api::free(p as *mut c_void);
    }
}

#[test]
fn object_size_for_large_allocations_counts_to_the_end() {
    unsafe {
        let sz = 10 * PAGE_SIZE;
        let p = api::malloc(sz) as *mut u8;
        assert_eq!(api::__malloc_object_size(p as *const c_void), sz);
        // Interior pointer within the base page.
        assert_eq!(
            api::__malloc_object_size(p.add(100) as *const c_void),
            sz - 100
        );
        // Pages past the first are not indexed; FORTIFY gets "unknown".
        assert_eq!(
            api::__malloc_object_size(p.add(PAGE_SIZE) as *const c_void),
            UNKNOWN_OBJECT_SIZE
        );
        api::free(p as *mut c_void);
    }
}

#[test]
fn object_size_unknown_for_foreign_pointers() {
    unsafe {
        let stack_var: u64 = 0;
        let r = api::__malloc_object_size(&stack_var as *const u64 as *const c_void);
        assert_eq!(r, UNKNOWN_OBJECT_SIZE);
    }
}

#[test]
fn usable_size_of_null_is_zero() {
    unsafe {
        assert_eq!(api::malloc_usable_size(ptr::null()), 0);
        assert_eq!(api::__malloc_object_size(ptr::null()), 0);
    }
}

// ---------------------------------------------------------------------------
// errno discipline
// ---------------------------------------------------------------------------

#[test]
fn successful_operations_preserve_errno() {
    unsafe {
        set_errno(1234);
        let p = api::malloc(64);
        assert_eq!(errno(), 1234);
        let q = api::realloc(p, 128);
        assert_eq!(errno(), 1234);
        let c = api::calloc(4, 16);
        assert_eq!(errno(), 1234);
        api::free(q);
        api::free(c);
        assert_eq!(errno(), 1234);
    }
}

// ---------------------------------------------------------------------------
// ABI stubs
// ---------------------------------------------------------------------------

#[test]
fn mallopt_is_an_accepted_stub() {
    unsafe {
        assert_eq!(api::mallopt(1, 1), 0);
    }
}

#[cfg(target_os = "linux")]
#[test]
fn mallinfo_reports_zeroes() {
    unsafe {
        let mi = api::mallinfo();
        assert_eq!(mi.arena, 0);
        assert_eq!(mi.uordblks, 0);
    }
}

// ---------------------------------------------------------------------------
// Quarantine visible behavior: freed chunks are not immediately reissued
// ---------------------------------------------------------------------------

#[test]
fn freed_chunks_are_not_immediately_recycled() {
    unsafe {
        let mut freed = HashSet::new();
        for _ in 0..16 {
            let p = api::malloc(64);
            assert!(!p.is_null());
            freed.insert(p as usize);
        }
        for &p in &freed {
            api::free(p as *mut c_void);
        }
        // Exiting the quarantine takes at least 2 * depth subsequent frees
        // on a randomized schedule. Other test threads share the arena, so
        // allow stragglers, but an immediate LIFO-style reissue of the batch
        // would show up as (nearly) all 16 coming straight back.
        let mut reissued = 0;
        let mut fresh = Vec::new();
        for _ in 0..16 {
            let p = api::malloc(64);
            assert!(!p.is_null());
            if freed.contains(&(p as usize)) {
                reissued += 1;
            }
            fresh.push(p);
        }
        assert!(
            reissued < 8,
            "{} of 16 freed pointers reissued immediately",
            reissued
        );
        for p in fresh {
            api::free(p);
        }
    }
}
