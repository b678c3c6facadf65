//! Multi-threaded stress tests: arena sharding, cross-arena frees, and fork
//! safety. `_malloc_thread_init` is invoked up front the way the C library
//! would on first thread creation, so the full multi-arena configuration is
//! exercised.

use std::ptr;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

fn enable_threads() {
    unsafe { guardmalloc::api::_malloc_thread_init() };
}

// ---------------------------------------------------------------------------
// Rapid malloc/free cycles across many threads
// ---------------------------------------------------------------------------

fn stress_malloc_free(num_threads: usize) {
    const ITERATIONS: usize = 5_000;

    enable_threads();
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|t| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                unsafe {
                    for i in 0..ITERATIONS {
                        let size = 1 + ((i * 7 + t * 13) % 512);
                        let p = guardmalloc::api::malloc(size) as *mut u8;
                        assert!(!p.is_null(), "malloc({}) failed under contention", size);
                        ptr::write_bytes(p, 0xcc, size);
                        guardmalloc::api::free(p as *mut _);
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread panicked during malloc/free stress");
    }
}

#[test]
fn stress_malloc_free_4_threads() {
    stress_malloc_free(4);
}

#[test]
fn stress_malloc_free_8_threads() {
    stress_malloc_free(8);
}

// ---------------------------------------------------------------------------
// Cross-thread free: producer allocates, consumer frees
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

#[test]
fn cross_thread_free() {
    const COUNT: usize = 2_000;

    enable_threads();
    let shared: Arc<Mutex<Vec<SendPtr>>> = Arc::new(Mutex::new(Vec::with_capacity(COUNT)));
    let barrier = Arc::new(Barrier::new(2));

    let producer = {
        let shared = Arc::clone(&shared);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            unsafe {
                for i in 0..COUNT {
                    let size = 1 + (i % 300);
                    let p = guardmalloc::api::malloc(size) as *mut u8;
                    assert!(!p.is_null());
                    ptr::write_bytes(p, 0xdd, size);
                    shared.lock().unwrap().push(SendPtr(p));
                }
            }
        })
    };

    let consumer = {
        let shared = Arc::clone(&shared);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            let mut freed = 0;
            while freed < COUNT {
                let batch: Vec<SendPtr> = {
                    let mut guard = shared.lock().unwrap();
                    guard.drain(..).collect()
                };
                if batch.is_empty() {
                    thread::yield_now();
                    continue;
                }
                // The consumer's arena is usually not the producer's; every
                // one of these frees exercises the cross-arena owner search.
                for SendPtr(p) in batch {
                    unsafe { guardmalloc::api::free(p as *mut _) };
                    freed += 1;
                }
            }
        })
    };

    producer.join().expect("producer panicked");
    consumer.join().expect("consumer panicked");
}

// ---------------------------------------------------------------------------
// Concurrent realloc churn
// ---------------------------------------------------------------------------

#[test]
fn concurrent_realloc_churn() {
    const THREADS: usize = 4;
    const ITERATIONS: usize = 400;

    enable_threads();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                unsafe {
                    let mut p = guardmalloc::api::malloc(16) as *mut u8;
                    let mut size = 16usize;
                    *p = t as u8;
                    for i in 0..ITERATIONS {
                        let new_size = 1 + ((i * 37 + t) % 9000);
                        let q = guardmalloc::api::realloc(p as *mut _, new_size) as *mut u8;
                        assert!(!q.is_null());
                        if size > 0 && new_size > 0 {
                            assert_eq!(*q, t as u8, "first byte lost in realloc");
                        }
                        p = q;
                        size = new_size;
                        *p = t as u8;
                    }
                    let _ = size;
                    guardmalloc::api::free(p as *mut _);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().expect("realloc churn thread panicked");
    }
}

// ---------------------------------------------------------------------------
// Fork safety: child allocates freely even if other threads held arena
// locks at the fork moment
// ---------------------------------------------------------------------------

#[test]
fn fork_while_threads_allocate() {
    enable_threads();

    // Background churn so arena locks are hot when fork happens.
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let churners: Vec<_> = (0..2)
        .map(|_| {
            let stop = Arc::clone(&stop);
            thread::spawn(move || unsafe {
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    let p = guardmalloc::api::malloc(96);
                    guardmalloc::api::free(p);
                }
            })
        })
        .collect();

    for _ in 0..10 {
        unsafe {
            let pid = libc::fork();
            assert!(pid >= 0, "fork failed");
            if pid == 0 {
                // Child: single-threaded, locks were reset by the atfork
                // handler. Allocate and exit without flushing stdio.
                for _ in 0..64 {
                    let p = guardmalloc::api::malloc(128);
                    if p.is_null() {
                        libc::_exit(2);
                    }
                    guardmalloc::api::free(p);
                }
                libc::_exit(0);
            }
            let mut status = 0;
            let r = libc::waitpid(pid, &mut status, 0);
            assert_eq!(r, pid);
            assert!(
                libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0,
                "forked child failed or deadlocked (status {:#x})",
                status
            );
        }
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in churners {
        h.join().unwrap();
    }
}
