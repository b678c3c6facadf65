//! Guarded mappings: `usable` bytes bracketed by one inaccessible page on
//! each side. All allocator bookkeeping (region tables, chunk-info pages,
//! quarantine arrays) lives in guarded mappings so a linear overflow out of
//! adjacent data faults instead of corrupting metadata.

use crate::platform;
use crate::util::PAGE_SIZE;
use core::ptr;

/// Map `usable` bytes with a guard page before and after. Returns the usable
/// pointer, or null on failure.
///
/// # Safety
/// Caller owns the returned region and must release it with
/// [`unmap_guarded`] using the same `usable` size.
pub unsafe fn map_guarded(usable: usize) -> *mut u8 {
    let real = match usable.checked_add(PAGE_SIZE * 2) {
        Some(r) => r,
        None => return ptr::null_mut(),
    };
    // Map the whole span inaccessible, then open up the middle.
    let base = platform::map_anonymous(real);
    if base.is_null() {
        return ptr::null_mut();
    }
    if platform::protect_none(base, real) != 0 {
        platform::unmap(base, real);
        return ptr::null_mut();
    }
    let middle = base.add(PAGE_SIZE);
    if platform::protect_read_write(middle, usable) != 0 {
        platform::unmap(base, real);
        return ptr::null_mut();
    }
    middle
}

/// Release a guarded mapping previously returned by [`map_guarded`].
///
/// # Safety
/// `usable_ptr`/`usable` must match a live guarded mapping exactly.
pub unsafe fn unmap_guarded(usable_ptr: *mut u8, usable: usize) -> i32 {
    let base = usable_ptr.sub(PAGE_SIZE);
    platform::unmap(base, usable + PAGE_SIZE * 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guarded_region_is_usable() {
        unsafe {
            let p = map_guarded(3 * PAGE_SIZE);
            assert!(!p.is_null());
            // The middle must be writable end to end.
            core::ptr::write_bytes(p, 0xa5, 3 * PAGE_SIZE);
            assert_eq!(*p, 0xa5);
            assert_eq!(*p.add(3 * PAGE_SIZE - 1), 0xa5);
            assert_eq!(unmap_guarded(p, 3 * PAGE_SIZE), 0);
        }
    }

    #[test]
    fn sub_page_sizes_round_to_page_protection() {
        unsafe {
            let p = map_guarded(100);
            assert!(!p.is_null());
            core::ptr::write_bytes(p, 0x5a, 100);
            assert_eq!(unmap_guarded(p, 100), 0);
        }
    }
}
