//! Public C ABI: the malloc family, the size queries, the ABI stubs and the
//! fork hooks. Every entry point follows the same discipline: save errno,
//! lock the calling thread's arena, record the operation name, detect
//! recursion through the arena's `active` counter, do the work, restore
//! errno on success.

use crate::arena::{self, Arena};
use crate::init;
use crate::options;
use crate::platform;
use crate::report;
use crate::util::{page_round, splitmix64, ARENAS, MAX_CHUNK, UNKNOWN_OBJECT_SIZE};
use core::ffi::c_void;
use core::ptr;

/// The arena serving the calling thread. Null before initialization.
unsafe fn getpool() -> *mut Arena {
    let o = options::get();
    if !o.multi_threaded {
        o.pools[0]
    } else {
        o.pools[(splitmix64(platform::thread_id() as u64) as usize) & (ARENAS - 1)]
    }
}

unsafe fn pool_or_init() -> *mut Arena {
    let d = getpool();
    if !d.is_null() {
        return d;
    }
    init::malloc_init(false);
    getpool()
}

/// Handle reentry: report once, back out of the arena, fail with EDEADLK.
unsafe fn recurse(d: *mut Arena) {
    report::recursion(d);
    (*d).active -= 1;
    arena::unlock_pool(d);
    platform::set_errno(libc::EDEADLK);
}

// ---------------------------------------------------------------------------
// malloc / free / realloc / calloc
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    let saved_errno = platform::errno();
    let d = pool_or_init();
    arena::lock_pool(d);
    (*d).func = "malloc():";
    let was_active = (*d).active;
    (*d).active += 1;
    if was_active != 0 {
        recurse(d);
        return ptr::null_mut();
    }

    let mut sz = size;
    let o = options::get();
    if sz > 0 && sz <= MAX_CHUNK {
        sz += o.canary_len;
    }
    let r = arena::alloc_in(d, sz, false);

    (*d).active -= 1;
    arena::unlock_pool(d);
    if r.is_null() && o.xmalloc {
        report::fatal(d, "out of memory", ptr::null_mut());
    }
    if !r.is_null() {
        platform::set_errno(saved_errno);
    }
    r as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn free(p: *mut c_void) {
    if p.is_null() {
        return;
    }
    let saved_errno = platform::errno();
    let d = getpool();
    if d.is_null() {
        report::fatal(d, "free() called before allocation", p as *mut u8);
    }
    arena::lock_pool(d);
    (*d).func = "free():";
    let was_active = (*d).active;
    (*d).active += 1;
    if was_active != 0 {
        recurse(d);
        return;
    }

    arena::free_in(d, p as *mut u8);

    (*d).active -= 1;
    arena::unlock_pool(d);
    platform::set_errno(saved_errno);
}

#[no_mangle]
pub unsafe extern "C" fn realloc(p: *mut c_void, size: usize) -> *mut c_void {
    let saved_errno = platform::errno();
    let d = pool_or_init();
    arena::lock_pool(d);
    (*d).func = "realloc():";
    let was_active = (*d).active;
    (*d).active += 1;
    if was_active != 0 {
        recurse(d);
        return ptr::null_mut();
    }

    let mut sz = size;
    let o = options::get();
    if sz > 0 && sz <= MAX_CHUNK {
        sz += o.canary_len;
    }
    let r = arena::realloc_in(d, p as *mut u8, sz);

    (*d).active -= 1;
    arena::unlock_pool(d);
    if r.is_null() && o.xmalloc {
        report::fatal(d, "out of memory", ptr::null_mut());
    }
    if !r.is_null() {
        platform::set_errno(saved_errno);
    }
    r as *mut c_void
}

/// sqrt(usize::MAX + 1): a product of two factors below this bound cannot
/// overflow.
const MUL_NO_OVERFLOW: usize = 1 << (usize::BITS / 2);

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    let saved_errno = platform::errno();
    let d = pool_or_init();
    arena::lock_pool(d);
    (*d).func = "calloc():";
    let o = options::get();
    if (nmemb >= MUL_NO_OVERFLOW || size >= MUL_NO_OVERFLOW)
        && nmemb > 0
        && usize::MAX / nmemb < size
    {
        arena::unlock_pool(d);
        if o.xmalloc {
            report::fatal(d, "out of memory", ptr::null_mut());
        }
        platform::set_errno(libc::ENOMEM);
        return ptr::null_mut();
    }

    let was_active = (*d).active;
    (*d).active += 1;
    if was_active != 0 {
        recurse(d);
        return ptr::null_mut();
    }

    let mut sz = nmemb * size;
    if sz > 0 && sz <= MAX_CHUNK {
        sz += o.canary_len;
    }
    let r = arena::alloc_in(d, sz, true);

    (*d).active -= 1;
    arena::unlock_pool(d);
    if r.is_null() && o.xmalloc {
        report::fatal(d, "out of memory", ptr::null_mut());
    }
    if !r.is_null() {
        platform::set_errno(saved_errno);
    }
    r as *mut c_void
}

// ---------------------------------------------------------------------------
// Aligned allocation
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> libc::c_int {
    if alignment & alignment.wrapping_sub(1) != 0 || alignment < core::mem::size_of::<*mut u8>() {
        return libc::EINVAL;
    }

    let saved_errno = platform::errno();
    let d = pool_or_init();
    arena::lock_pool(d);
    (*d).func = "posix_memalign():";
    let was_active = (*d).active;
    (*d).active += 1;
    if was_active != 0 {
        recurse(d);
        let res = platform::errno();
        platform::set_errno(saved_errno);
        return res;
    }

    let mut sz = size;
    let o = options::get();
    if sz > 0 && sz <= MAX_CHUNK {
        sz += o.canary_len;
    }
    let r = arena::memalign_in(d, alignment, sz, false);

    (*d).active -= 1;
    arena::unlock_pool(d);
    if r.is_null() {
        if o.xmalloc {
            report::fatal(d, "out of memory", ptr::null_mut());
        }
        let res = platform::errno();
        platform::set_errno(saved_errno);
        return res;
    }
    platform::set_errno(saved_errno);
    *memptr = r as *mut c_void;
    0
}

#[no_mangle]
pub unsafe extern "C" fn memalign(boundary: usize, size: usize) -> *mut c_void {
    let mut boundary = boundary;
    if boundary > core::mem::size_of::<*mut u8>() {
        if !boundary.is_power_of_two() {
            boundary = boundary.next_power_of_two();
        }
    } else {
        boundary = core::mem::size_of::<*mut u8>();
    }
    let mut p: *mut c_void = ptr::null_mut();
    let ret = posix_memalign(&mut p, boundary, size);
    if ret != 0 {
        platform::set_errno(ret);
        return ptr::null_mut();
    }
    p
}

#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    // C11: size must be a multiple of alignment.
    if !alignment.is_power_of_two() || (size % alignment != 0 && size != 0) {
        platform::set_errno(libc::EINVAL);
        return ptr::null_mut();
    }
    memalign(alignment, size)
}

#[no_mangle]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    memalign(crate::util::PAGE_SIZE, size)
}

#[no_mangle]
pub unsafe extern "C" fn pvalloc(bytes: usize) -> *mut c_void {
    let size = page_round(bytes);
    if size < bytes {
        platform::set_errno(libc::ENOMEM);
        return ptr::null_mut();
    }
    memalign(crate::util::PAGE_SIZE, size)
}

// ---------------------------------------------------------------------------
// Size queries
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(p: *const c_void) -> usize {
    if p.is_null() {
        return 0;
    }
    let d = getpool();
    if d.is_null() {
        report::fatal(d, "malloc_usable_size() called before allocation", ptr::null_mut());
    }
    arena::lock_pool(d);
    (*d).func = "malloc_usable_size():";
    let was_active = (*d).active;
    (*d).active += 1;
    if was_active != 0 {
        recurse(d);
        return 0;
    }

    let ret = arena::usable_size_in(d, p as *mut u8);

    (*d).active -= 1;
    arena::unlock_pool(d);
    ret
}

/// Bytes of valid storage from `p` to the end of its containing object, or
/// [`UNKNOWN_OBJECT_SIZE`] when `p` is not heap memory this allocator knows.
/// FORTIFY wrappers consult this to bound-check I/O buffers.
#[no_mangle]
pub unsafe extern "C" fn __malloc_object_size(p: *const c_void) -> usize {
    if p.is_null() {
        return 0;
    }
    let d = getpool();
    if d.is_null() {
        return UNKNOWN_OBJECT_SIZE;
    }
    arena::lock_pool(d);
    (*d).func = "__malloc_object_size():";
    let was_active = (*d).active;
    (*d).active += 1;
    if was_active != 0 {
        recurse(d);
        return 0;
    }

    let ret = arena::object_size_in(d, p as *mut u8);

    (*d).active -= 1;
    arena::unlock_pool(d);
    ret
}

// ---------------------------------------------------------------------------
// ABI stubs
// ---------------------------------------------------------------------------

/// Present for ABI compatibility; always reports failure.
#[no_mangle]
pub unsafe extern "C" fn mallopt(_param: libc::c_int, _value: libc::c_int) -> libc::c_int {
    0
}

/// Present for ABI compatibility; all fields zero.
#[cfg(target_os = "linux")]
#[no_mangle]
pub unsafe extern "C" fn mallinfo() -> libc::mallinfo {
    core::mem::zeroed()
}

// ---------------------------------------------------------------------------
// Thread and fork hooks, called by the C library
// ---------------------------------------------------------------------------

/// The process is about to become multi-threaded: create the remaining
/// arenas and switch on sharding.
#[no_mangle]
pub unsafe extern "C" fn _malloc_thread_init() {
    init::malloc_init(true);
}

#[no_mangle]
pub unsafe extern "C" fn _malloc_pre_fork() {
    arena::lock_all();
}

#[no_mangle]
pub unsafe extern "C" fn _malloc_post_fork_parent() {
    arena::unlock_all();
}

#[no_mangle]
pub unsafe extern "C" fn _malloc_post_fork_child() {
    arena::reset_locks();
}
