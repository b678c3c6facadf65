//! Fatal-error reporter. Every integrity violation funnels through
//! [`fatal`], which writes one structured line to stderr with a single
//! vectored write and aborts. Nothing here allocates; the heap is presumed
//! hostile by the time we get called.

use crate::arena::Arena;
use crate::options;
use crate::platform;
use core::sync::atomic::{AtomicBool, Ordering};

/// Render `value` as decimal into `buf`, returning the used length.
fn fmt_dec(mut value: u64, buf: &mut [u8]) -> usize {
    let mut tmp = [0u8; 20];
    let mut i = tmp.len();
    loop {
        i -= 1;
        tmp[i] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    let len = tmp.len() - i;
    buf[..len].copy_from_slice(&tmp[i..]);
    len
}

/// Render `value` as 0x-prefixed hex into `buf`, returning the used length.
fn fmt_hex(value: usize, buf: &mut [u8]) -> usize {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    buf[0] = b'0';
    buf[1] = b'x';
    let mut tmp = [0u8; 16];
    let mut v = value;
    let mut i = tmp.len();
    loop {
        i -= 1;
        tmp[i] = DIGITS[v & 0xf];
        v >>= 4;
        if v == 0 {
            break;
        }
    }
    let len = tmp.len() - i;
    buf[2..2 + len].copy_from_slice(&tmp[i..]);
    2 + len
}

unsafe fn c_strlen(s: *const libc::c_char) -> usize {
    if s.is_null() {
        return 0;
    }
    let mut n = 0;
    while *s.add(n) != 0 {
        n += 1;
    }
    n
}

/// Emit one diagnostic line:
/// `progname(pid) in <func> error: <msg> 0x<ptr>`.
unsafe fn emit(d: *mut Arena, msg: &str, p: *mut u8) {
    let prog = platform::program_name();
    let prog_len = c_strlen(prog);

    let mut pidbuf = [0u8; 32];
    pidbuf[0] = b'(';
    let mut n = 1 + fmt_dec(libc::getpid() as u64, &mut pidbuf[1..]);
    pidbuf[n..n + 5].copy_from_slice(b") in ");
    n += 5;
    let pid_len = n;

    let func: &str = if d.is_null() { "unknown" } else { (*d).func };
    let sep = " error: ";

    let mut ptrbuf = [0u8; 24];
    let ptr_len = if p.is_null() {
        0
    } else {
        ptrbuf[0] = b' ';
        1 + fmt_hex(p as usize, &mut ptrbuf[1..])
    };

    let iov = [
        libc::iovec {
            iov_base: prog as *mut libc::c_void,
            iov_len: prog_len,
        },
        libc::iovec {
            iov_base: pidbuf.as_ptr() as *mut libc::c_void,
            iov_len: pid_len,
        },
        libc::iovec {
            iov_base: func.as_ptr() as *mut libc::c_void,
            iov_len: func.len(),
        },
        libc::iovec {
            iov_base: sep.as_ptr() as *mut libc::c_void,
            iov_len: sep.len(),
        },
        libc::iovec {
            iov_base: msg.as_ptr() as *mut libc::c_void,
            iov_len: msg.len(),
        },
        libc::iovec {
            iov_base: ptrbuf.as_ptr() as *mut libc::c_void,
            iov_len: ptr_len,
        },
        libc::iovec {
            iov_base: b"\n".as_ptr() as *mut libc::c_void,
            iov_len: 1,
        },
    ];
    libc::writev(libc::STDERR_FILENO, iov.as_ptr(), iov.len() as libc::c_int);
}

/// Report an unrecoverable heap integrity violation and abort. Preserves
/// errno for whatever inspects the corpse.
///
/// # Safety
/// `d` may be null (early init); when non-null it must point to a live arena.
#[cold]
#[inline(never)]
pub unsafe fn fatal(d: *mut Arena, msg: &str, p: *mut u8) -> ! {
    let saved_errno = platform::errno();
    emit(d, msg, p);

    if options::get().stats {
        crate::stats::dump_all(libc::STDERR_FILENO);
    }

    platform::set_errno(saved_errno);
    libc::abort();
}

/// Report allocator reentry. Only the first occurrence is printed so the
/// reporter cannot itself feed the loop that caused the recursion.
///
/// # Safety
/// `d` must point to a live arena.
#[cold]
pub unsafe fn recursion(d: *mut Arena) {
    static REPORTED: AtomicBool = AtomicBool::new(false);
    if !REPORTED.swap(true, Ordering::Relaxed) {
        emit(d, "recursive call", core::ptr::null_mut());
    }
}

/// One warning line to stderr (option parser, atexit registration).
pub fn warn(msg: &str) {
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            msg.as_ptr() as *const libc::c_void,
            msg.len(),
        );
    }
}
