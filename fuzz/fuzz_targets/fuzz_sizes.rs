#![no_main]

use guardmalloc::api;
use libfuzzer_sys::fuzz_target;
use std::ffi::c_void;

// Size-boundary sweep: allocate fuzzer-chosen sizes, write the full usable
// extent, verify alignment and the size queries, then free. Exercises the
// chunk-class boundaries, the chunk/large crossover at half a page, and
// multi-page mappings.

fuzz_target!(|data: &[u8]| {
    let mut i = 0;
    while i + 4 <= data.len() {
        let raw = u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        i += 4;

        // Cap to keep the corpus fast and the fuzzer out of OOM territory.
        let size = (raw as usize) % (1024 * 1024);

        let p = unsafe { api::malloc(size) } as *mut u8;
        if size == 0 {
            // A distinct sentinel; must be freeable but never touched.
            assert!(!p.is_null());
            unsafe { api::free(p as *mut c_void) };
            continue;
        }
        if p.is_null() {
            continue; // resource failure is a legal outcome
        }

        assert_eq!(
            p as usize % 16,
            0,
            "malloc({}) returned unaligned pointer {:p}",
            size,
            p
        );

        let usable = unsafe { api::malloc_usable_size(p as *const c_void) };
        assert!(
            usable >= size,
            "malloc_usable_size = {} < requested {}",
            usable,
            size
        );
        let objsz = unsafe { api::__malloc_object_size(p as *const c_void) };
        assert!(objsz >= size, "object_size = {} < requested {}", objsz, size);

        // The full usable extent must be writable without tripping anything.
        unsafe {
            std::ptr::write_bytes(p, 0xbb, usable);
            for j in (0..usable).step_by(97) {
                assert_eq!(*p.add(j), 0xbb);
            }
            api::free(p as *mut c_void);
        }

        if size < 65536 {
            let c = unsafe { api::calloc(1, size) } as *mut u8;
            if !c.is_null() {
                for j in 0..size.min(4096) {
                    assert_eq!(unsafe { *c.add(j) }, 0, "calloc not zeroed at {}", j);
                }
                unsafe { api::free(c as *mut c_void) };
            }
        }
    }
});
