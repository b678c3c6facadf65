//! Lazy initialization. The first entry point (or the library constructor,
//! whichever runs first) parses options, creates arena 0 and seals the
//! options page. `_malloc_thread_init` re-enters with `from_threads` once the
//! process grows threads, creating the remaining arenas and enabling
//! cross-arena sharding.

use crate::arena;
use crate::options;
use crate::report;
use crate::stats;
use crate::util::ARENAS;
use core::sync::atomic::{AtomicBool, Ordering};

/// Bring the allocator up. Safe to call repeatedly; serialized on arena 0's
/// lock. With `from_threads` every arena is created and multi-threaded
/// sharding switches on.
///
/// # Safety
/// Must not be called while the calling thread already holds an arena lock.
pub unsafe fn malloc_init(from_threads: bool) {
    arena::lock_index(0);
    if !from_threads && !options::get().pools[0].is_null() {
        arena::unlock_index(0);
        return;
    }
    if options::get().process_canary == 0 {
        options::initialize();
    }

    let max = if from_threads { ARENAS } else { 1 };
    options::unprotect();
    let o = options::get_mut();
    for i in 0..max {
        if (*o).pools[i].is_null() {
            (*o).pools[i] = arena::create(i);
        }
    }
    if from_threads {
        (*o).multi_threaded = true;
    }
    // Options and arena roots are final; trap any further write.
    options::protect();
    arena::unlock_index(0);

    register_hooks();
}

/// Register atexit/atfork handlers exactly once, outside the init lock: the
/// C library may allocate while registering, which must go through the
/// normal (unlocked) entry path.
unsafe fn register_hooks() {
    static REGISTERED: AtomicBool = AtomicBool::new(false);
    if REGISTERED.swap(true, Ordering::AcqRel) {
        return;
    }
    let o = options::get();
    if o.junk_free && libc::atexit(arena::quarantine_atexit) != 0 {
        report::warn(
            "malloc() warning: atexit(2) failed. Will not be able to check for use after free\n",
        );
    }
    if o.stats && libc::atexit(stats::dump_atexit) != 0 {
        report::warn("malloc() warning: atexit(2) failed. Will not be able to dump stats\n");
    }
    libc::pthread_atfork(
        Some(crate::api::_malloc_pre_fork),
        Some(crate::api::_malloc_post_fork_parent),
        Some(crate::api::_malloc_post_fork_child),
    );
}

/// Library constructor: initialize before main so early C-library callers
/// never race the first malloc.
#[used]
#[cfg_attr(target_os = "linux", link_section = ".init_array")]
#[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_init_func")]
static CTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn init() {
        malloc_init(false);
    }
    init
};
