//! guardmalloc: a security-hardened drop-in replacement for the C
//! malloc/free/realloc family. Small objects come from per-arena slab pages
//! with randomized bitmap placement and tail canaries; large objects get
//! page-granular mappings with trailing guard pages; every free runs through
//! a poisoned, randomized delayed-free quarantine; all options and arena
//! roots live on a page remapped read-only after startup.

extern crate libc;

pub mod api;
pub mod arena;
pub mod canary;
pub mod chunks;
pub mod global_alloc;
pub mod guarded;
pub mod init;
pub mod options;
pub mod pagecache;
pub mod platform;
pub mod quarantine;
pub mod regions;
pub mod report;
pub mod rng;
pub mod stats;
pub mod sync;
pub mod util;

pub use global_alloc::GuardMalloc;
