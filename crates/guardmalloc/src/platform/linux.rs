use core::ptr;

// PR_SET_VMA is present on any kernel new enough to matter but spelled out
// here so we do not depend on libc exposing it.
const PR_SET_VMA: libc::c_int = 0x53564d41;
const PR_SET_VMA_ANON_NAME: libc::c_ulong = 0;

pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

pub unsafe fn map_at_hint(hint: *mut u8, size: usize) -> *mut u8 {
    let result = libc::mmap(
        hint as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        result as *mut u8
    }
}

pub unsafe fn unmap(ptr: *mut u8, size: usize) -> i32 {
    libc::munmap(ptr as *mut libc::c_void, size)
}

pub unsafe fn protect_none(ptr: *mut u8, size: usize) -> i32 {
    libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_NONE)
}

pub unsafe fn protect_read_write(ptr: *mut u8, size: usize) -> i32 {
    libc::mprotect(
        ptr as *mut libc::c_void,
        size,
        libc::PROT_READ | libc::PROT_WRITE,
    )
}

pub unsafe fn advise_free(ptr: *mut u8, size: usize) {
    libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_FREE);
}

pub unsafe fn advise_normal(ptr: *mut u8, size: usize) {
    libc::madvise(ptr as *mut libc::c_void, size, libc::MADV_NORMAL);
}

pub unsafe fn name_region(ptr: *mut u8, size: usize, label: &'static [u8]) {
    debug_assert_eq!(label.last(), Some(&0u8));
    libc::prctl(
        PR_SET_VMA,
        PR_SET_VMA_ANON_NAME,
        ptr as usize,
        size,
        label.as_ptr() as usize,
    );
}

pub fn random_bytes(buf: &mut [u8]) {
    let mut filled = 0usize;
    while filled < buf.len() {
        let r = unsafe {
            libc::getrandom(
                buf[filled..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - filled,
                0,
            )
        };
        if r < 0 {
            let e = unsafe { *libc::__errno_location() };
            if e == libc::EINTR || e == libc::EAGAIN {
                continue;
            }
            // No entropy source means no canaries and no randomized layout;
            // running without them would silently drop every hardening
            // property, so give up instead.
            unsafe { libc::abort() };
        }
        filled += r as usize;
    }
}

/// Cached gettid. `try_with` so a dying thread (TLS already torn down) still
/// gets an answer via the raw syscall.
#[inline]
pub fn thread_id() -> usize {
    use core::cell::Cell;

    thread_local! {
        static CACHED_TID: Cell<usize> = const { Cell::new(0) };
    }

    let cached = CACHED_TID.try_with(|tid| {
        let t = tid.get();
        if t != 0 {
            return t;
        }
        let fresh = unsafe { libc::syscall(libc::SYS_gettid) as usize };
        tid.set(fresh);
        fresh
    });
    match cached {
        Ok(t) => t,
        Err(_) => unsafe { libc::syscall(libc::SYS_gettid) as usize },
    }
}

pub unsafe fn errno_location() -> *mut i32 {
    libc::__errno_location()
}

pub fn program_name() -> *const libc::c_char {
    extern "C" {
        static mut program_invocation_short_name: *mut libc::c_char;
    }
    unsafe { program_invocation_short_name as *const libc::c_char }
}

pub fn secure_environment() -> bool {
    unsafe { libc::getauxval(libc::AT_SECURE) != 0 }
}
