//! Diagnostic statistics dump. Enabled with the `D` option: appended to
//! `malloc.out` at exit and written to stderr by the fatal reporter. The
//! format is not stable and must not be parsed.

use crate::arena::{self, Arena};
use crate::options;
use crate::util::{ARENAS, CHUNK_LISTS, MAX_SHIFT};

unsafe fn put(fd: i32, s: &[u8]) {
    libc::write(fd, s.as_ptr() as *const libc::c_void, s.len());
}

unsafe fn put_dec(fd: i32, v: usize) {
    let mut buf = [0u8; 20];
    let mut tmp = [0u8; 20];
    let mut x = v;
    let mut i = tmp.len();
    loop {
        i -= 1;
        tmp[i] = b'0' + (x % 10) as u8;
        x /= 10;
        if x == 0 {
            break;
        }
    }
    let len = tmp.len() - i;
    buf[..len].copy_from_slice(&tmp[i..]);
    put(fd, &buf[..len]);
}

unsafe fn put_pair(fd: i32, label: &[u8], a: usize, b: usize) {
    put(fd, label);
    put_dec(fd, a);
    put(fd, b"/");
    put_dec(fd, b);
    put(fd, b"\n");
}

/// Dump one arena block.
///
/// # Safety
/// `d` must be a live arena; the caller serializes access.
pub unsafe fn dump_arena(fd: i32, d: *mut Arena) {
    put(fd, b"Arena ");
    put_dec(fd, (*d).mutex);
    put(fd, b"\n");
    let rs = &(*d).regions.stats;
    put_pair(
        fd,
        b"  region slots free ",
        (*d).regions.free,
        (*d).regions.total,
    );
    put_pair(fd, b"  finds ", rs.finds, rs.find_collisions);
    put_pair(fd, b"  inserts ", rs.inserts, rs.insert_collisions);
    put_pair(fd, b"  deletes ", rs.deletes, rs.delete_moves);
    put_pair(
        fd,
        b"  cheap reallocs ",
        (*d).stats.cheap_reallocs,
        (*d).stats.cheap_realloc_tries,
    );

    put(fd, b"  partial pages per class:");
    for class in 0..=MAX_SHIFT {
        let mut count = 0usize;
        for bucket in 0..CHUNK_LISTS {
            let mut p = (*d).chunk_dir[class][bucket].first;
            while !p.is_null() {
                count += 1;
                p = (*p).next();
            }
        }
        put(fd, b" ");
        put_dec(fd, count);
    }
    put(fd, b"\n");

    put(fd, b"  cached pages ");
    put_dec(fd, (*d).cache.cached_pages);
    put(fd, b"\n  in use ");
    put_dec(fd, (*d).stats.used_bytes);
    put(fd, b"\n  guarded ");
    put_dec(fd, (*d).stats.guarded_bytes);
    put(fd, b"\n");
}

/// Dump every arena. Used from the fatal reporter; takes no locks, the
/// process is about to abort.
///
/// # Safety
/// Best-effort: arenas may be mid-operation.
pub unsafe fn dump_all(fd: i32) {
    let o = options::get();
    for i in 0..ARENAS {
        let d = o.pools[i];
        if !d.is_null() {
            dump_arena(fd, d);
        }
    }
}

/// atexit hook: drain quarantines and append one block per arena to
/// `malloc.out` in the working directory. The file is never created; no
/// file, no dump.
pub extern "C" fn dump_atexit() {
    unsafe {
        let fd = libc::open(
            b"malloc.out\0".as_ptr() as *const libc::c_char,
            libc::O_RDWR | libc::O_APPEND,
        );
        if fd == -1 {
            crate::report::warn("malloc() warning: couldn't dump stats\n");
            return;
        }
        let o = options::get();
        for i in 0..ARENAS {
            let d = o.pools[i];
            if d.is_null() {
                continue;
            }
            arena::lock_index(i);
            (*d).func = "malloc_dump():";
            arena::drain_quarantine(d);
            dump_arena(fd, d);
            arena::unlock_index(i);
        }
        libc::close(fd);
    }
}
