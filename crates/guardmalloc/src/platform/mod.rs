//! OS page provider. Everything above this module is OS-agnostic: it sees
//! anonymous page mappings, protection changes, advisory release, a
//! cryptographic byte source and a cheap thread identifier.

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

/// Map `size` bytes of private anonymous read-write memory. Returns null on
/// failure.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
#[inline]
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    sys::map_anonymous(size)
}

/// Map `size` bytes near `hint` without MAP_FIXED. The kernel is free to
/// place the mapping elsewhere; callers that need the exact address must
/// compare the result against `hint` and unmap on mismatch.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
#[inline]
pub unsafe fn map_at_hint(hint: *mut u8, size: usize) -> *mut u8 {
    sys::map_at_hint(hint, size)
}

/// Unmap a region. Returns the raw munmap result so callers can treat a
/// failure as heap corruption.
///
/// # Safety
/// `ptr`/`size` must describe a mapping owned by the caller.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) -> i32 {
    sys::unmap(ptr, size)
}

/// Make a region inaccessible (guard page).
///
/// # Safety
/// Region must be valid and page-aligned.
#[inline]
pub unsafe fn protect_none(ptr: *mut u8, size: usize) -> i32 {
    sys::protect_none(ptr, size)
}

/// Make a region readable and writable again.
///
/// # Safety
/// Region must be valid and page-aligned.
#[inline]
pub unsafe fn protect_read_write(ptr: *mut u8, size: usize) -> i32 {
    sys::protect_read_write(ptr, size)
}

/// Tell the kernel the pages' contents are disposable.
///
/// # Safety
/// Region must be valid and page-aligned.
#[inline]
pub unsafe fn advise_free(ptr: *mut u8, size: usize) {
    sys::advise_free(ptr, size);
}

/// Undo a previous [`advise_free`] before handing pages back out.
///
/// # Safety
/// Region must be valid and page-aligned.
#[inline]
pub unsafe fn advise_normal(ptr: *mut u8, size: usize) {
    sys::advise_normal(ptr, size);
}

/// Attach a human-readable label to a mapping for tooling (smaps, crash
/// dumps). Best effort; a no-op where the OS has no equivalent.
///
/// # Safety
/// Region must be a valid mapping. `label` must be NUL-terminated.
#[inline]
pub unsafe fn name_region(ptr: *mut u8, size: usize, label: &'static [u8]) {
    sys::name_region(ptr, size, label);
}

/// Fill `buf` from the OS cryptographic RNG. Never returns partially filled.
#[inline]
pub fn random_bytes(buf: &mut [u8]) {
    sys::random_bytes(buf);
}

/// One cryptographically random u32.
pub fn random_u32() -> u32 {
    let mut b = [0u8; 4];
    random_bytes(&mut b);
    u32::from_ne_bytes(b)
}

/// Uniform draw in `[0, bound)` without modulo bias. Init-time only.
pub fn random_uniform(bound: u32) -> u32 {
    if bound < 2 {
        return 0;
    }
    let limit = u32::MAX - u32::MAX % bound;
    loop {
        let v = random_u32();
        if v < limit {
            return v % bound;
        }
    }
}

/// Cheap thread identifier for arena sharding. Cached in TLS; falls back to
/// the raw syscall when TLS is unavailable (early init, thread teardown).
#[inline]
pub fn thread_id() -> usize {
    sys::thread_id()
}

/// Read the calling thread's errno.
#[inline]
pub fn errno() -> i32 {
    unsafe { *sys::errno_location() }
}

/// Set the calling thread's errno.
#[inline]
pub fn set_errno(value: i32) {
    unsafe { *sys::errno_location() = value }
}

/// Short program name for diagnostics, as a NUL-terminated C string.
#[inline]
pub fn program_name() -> *const libc::c_char {
    sys::program_name()
}

/// True when the process runs set-uid/set-gid and must not trust its
/// environment.
#[inline]
pub fn secure_environment() -> bool {
    sys::secure_environment()
}
