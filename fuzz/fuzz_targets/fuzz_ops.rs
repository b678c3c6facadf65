#![no_main]

use guardmalloc::api;
use libfuzzer_sys::fuzz_target;
use std::ffi::c_void;

/// Interpret the input as a sequence of allocator operations over a table of
/// tracked pointers:
///   byte 0: opcode (0=malloc, 1=free, 2=realloc, 3=calloc, 4=size queries)
///   bytes 1-2: size (little-endian u16)
///   byte 3: slot index
/// The driver only performs legal sequences, so any abort (canary, poison,
/// bogus pointer) the allocator raises here is a real finding.
const MAX_SLOTS: usize = 64;

fuzz_target!(|data: &[u8]| {
    let mut slots: [*mut c_void; MAX_SLOTS] = [std::ptr::null_mut(); MAX_SLOTS];
    let mut sizes: [usize; MAX_SLOTS] = [0; MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] % 5;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        unsafe {
            match opcode {
                0 => {
                    if !slots[slot].is_null() {
                        api::free(slots[slot]);
                    }
                    let p = api::malloc(size);
                    slots[slot] = p;
                    sizes[slot] = size;
                    if !p.is_null() && size > 0 {
                        std::ptr::write_bytes(p as *mut u8, 0xaa, size.min(256));
                    }
                }
                1 => {
                    if !slots[slot].is_null() {
                        api::free(slots[slot]);
                        slots[slot] = std::ptr::null_mut();
                        sizes[slot] = 0;
                    }
                }
                2 => {
                    let p = api::realloc(slots[slot], size);
                    if !p.is_null() {
                        slots[slot] = p;
                        sizes[slot] = size;
                        if size > 0 {
                            std::ptr::write_bytes(p as *mut u8, 0xbb, size.min(256));
                        }
                    } else if slots[slot].is_null() {
                        sizes[slot] = 0;
                    }
                    // On failure the original pointer stays valid.
                }
                3 => {
                    if !slots[slot].is_null() {
                        api::free(slots[slot]);
                    }
                    let nmemb = (size >> 8).max(1);
                    let elem = (size & 0xff).max(1);
                    let p = api::calloc(nmemb, elem);
                    slots[slot] = p;
                    sizes[slot] = nmemb * elem;
                    if !p.is_null() {
                        let check = (nmemb * elem).min(256);
                        for j in 0..check {
                            assert_eq!(
                                *(p as *const u8).add(j),
                                0,
                                "calloc memory not zeroed at offset {}",
                                j
                            );
                        }
                    }
                }
                4 => {
                    if !slots[slot].is_null() && sizes[slot] > 0 {
                        let usable = api::malloc_usable_size(slots[slot]);
                        assert!(
                            usable >= sizes[slot],
                            "usable_size {} below requested {}",
                            usable,
                            sizes[slot]
                        );
                        let objsz = api::__malloc_object_size(slots[slot]);
                        assert!(
                            objsz >= sizes[slot],
                            "object_size {} below requested {}",
                            objsz,
                            sizes[slot]
                        );
                    }
                }
                _ => unreachable!(),
            }
        }
    }

    for slot in &mut slots {
        if !slot.is_null() {
            unsafe { api::free(*slot) };
            *slot = std::ptr::null_mut();
        }
    }
});
