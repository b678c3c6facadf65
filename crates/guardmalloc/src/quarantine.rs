//! Delayed-free quarantine. Freed small chunks are poisoned by the caller,
//! then pushed through two rings: a randomly indexed `probe` array and a
//! FIFO `queue`. A chunk only reaches the slab free-bitmap after being
//! displaced from both, which takes at least `2 * depth` subsequent frees
//! and a randomized schedule an attacker cannot steer. A membership `set`
//! (open-addressed, negative probing, algorithm R deletion) catches double
//! frees while a pointer is still in flight.

use crate::arena::Arena;
use crate::guarded;
use crate::options;
use crate::platform;
use crate::report;
use crate::util::hash_chunk;
use core::ptr;

const QUARANTINE_LABEL: &[u8] = b"guardmalloc quarantine\0";

#[repr(C)]
pub struct Quarantine {
    /// `depth` slots, replaced at a random index per free.
    pub(crate) probe: *mut *mut u8,
    /// `depth` slots, cycled in FIFO order.
    pub(crate) queue: *mut *mut u8,
    /// `4 * depth` slots of membership hash.
    pub(crate) set: *mut *mut u8,
    pub(crate) queue_index: usize,
}

impl Quarantine {
    pub const fn new() -> Self {
        Quarantine {
            probe: ptr::null_mut(),
            queue: ptr::null_mut(),
            set: ptr::null_mut(),
            queue_index: 0,
        }
    }

    /// Map the probe/queue/set arrays in one guarded span. Returns false on
    /// mapping failure. A zero depth leaves the quarantine disabled.
    pub unsafe fn init(&mut self, depth: usize) -> bool {
        if depth == 0 {
            return true;
        }
        let total = depth * 6 * core::mem::size_of::<*mut u8>();
        let p = guarded::map_guarded(total);
        if p.is_null() {
            return false;
        }
        platform::name_region(p, total, QUARANTINE_LABEL);
        self.probe = p as *mut *mut u8;
        self.queue = self.probe.add(depth);
        self.set = self.queue.add(depth);
        true
    }
}

/// Record `p` in the membership set. A collision with an identical pointer
/// means the chunk was freed twice before leaving the quarantine.
///
/// # Safety
/// Arena lock held; quarantine initialized with a nonzero depth.
pub unsafe fn set_insert(d: *mut Arena, p: *mut u8) {
    let mask = options::get().quarantine_depth * 4 - 1;
    let set = (*d).quarantine.set;
    let mut index = hash_chunk(p as usize) & mask;
    loop {
        let q = *set.add(index);
        if q.is_null() {
            break;
        }
        if q == p {
            report::fatal(d, "double free", p);
        }
        index = index.wrapping_sub(1) & mask;
    }
    *set.add(index) = p;
}

/// Remove `p` from the membership set (algorithm R). The pointer must be
/// present; a miss means the set and the rings disagree, which only
/// corruption can cause.
///
/// # Safety
/// Arena lock held; quarantine initialized with a nonzero depth.
pub unsafe fn set_delete(d: *mut Arena, p: *mut u8) {
    let mask = options::get().quarantine_depth * 4 - 1;
    let set = (*d).quarantine.set;
    let mut i = hash_chunk(p as usize) & mask;
    loop {
        let q = *set.add(i);
        if q == p {
            break;
        }
        if q.is_null() {
            report::fatal(d, "pointer missing from address tracking table", p);
        }
        i = i.wrapping_sub(1) & mask;
    }

    loop {
        *set.add(i) = ptr::null_mut();
        let j = i;
        loop {
            i = i.wrapping_sub(1) & mask;
            let q = *set.add(i);
            if q.is_null() {
                return;
            }
            let r = hash_chunk(q as usize) & mask;
            if (i <= r && r < j) || (r < j && j < i) || (j < i && i <= r) {
                continue;
            }
            *set.add(j) = q;
            break;
        }
    }
}

/// Push `p` through the two-stage schedule. Returns the chunk that finally
/// fell out of the queue (already removed from the set) and is now due for
/// poison validation and slab release, or null while everything is still
/// in flight.
///
/// # Safety
/// Arena lock held; quarantine initialized with a nonzero depth; `p` must
/// already be poisoned.
pub unsafe fn defer(d: *mut Arena, p: *mut u8) -> *mut u8 {
    let depth = options::get().quarantine_depth;
    set_insert(d, p);

    let i = ((*d).rng.byte() as usize) & (depth - 1);
    let slot = (*d).quarantine.probe.add(i);
    let displaced = *slot;
    *slot = p;
    if displaced.is_null() {
        return ptr::null_mut();
    }

    let qi = (*d).quarantine.queue_index;
    let slot = (*d).quarantine.queue.add(qi);
    let popped = *slot;
    *slot = displaced;
    (*d).quarantine.queue_index = (qi + 1) & (depth - 1);
    if popped.is_null() {
        return ptr::null_mut();
    }

    set_delete(d, popped);
    popped
}
