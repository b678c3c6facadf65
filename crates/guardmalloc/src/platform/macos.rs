use core::ptr;

pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    let result = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
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
        libc::MAP_PRIVATE | libc::MAP_ANON,
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

/// No mapping-name facility on macOS.
pub unsafe fn name_region(_ptr: *mut u8, _size: usize, _label: &'static [u8]) {}

pub fn random_bytes(buf: &mut [u8]) {
    // getentropy caps each request at 256 bytes.
    for chunk in buf.chunks_mut(256) {
        let r = unsafe { libc::getentropy(chunk.as_mut_ptr() as *mut libc::c_void, chunk.len()) };
        if r != 0 {
            unsafe { libc::abort() };
        }
    }
}

#[inline]
pub fn thread_id() -> usize {
    use core::cell::Cell;

    thread_local! {
        static CACHED_TID: Cell<usize> = const { Cell::new(0) };
    }

    let fetch = || {
        let mut raw: u64 = 0;
        unsafe { libc::pthread_threadid_np(libc::pthread_self(), &mut raw) };
        raw as usize
    };

    match CACHED_TID.try_with(|tid| {
        let t = tid.get();
        if t != 0 {
            return t;
        }
        let fresh = fetch();
        tid.set(fresh);
        fresh
    }) {
        Ok(t) => t,
        Err(_) => fetch(),
    }
}

pub unsafe fn errno_location() -> *mut i32 {
    libc::__error()
}

pub fn program_name() -> *const libc::c_char {
    unsafe { libc::getprogname() }
}

pub fn secure_environment() -> bool {
    unsafe { libc::issetugid() != 0 }
}
