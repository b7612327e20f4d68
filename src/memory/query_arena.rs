//! Per-query bump allocator for ephemeral metadata: hash-table buckets,
//! tuple chunk blocks, pipeline local-state slabs.
//!
//! Allocations are never freed individually; the whole pool is rewound at
//! query end. Each worker owns a 128-page reservation carved out at setup
//! so small allocations do not touch the shared cursor.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::error::{DbError, Result};
use crate::memory::mmap::Mmap;
use crate::scheduler;
use crate::storage::page::PAGE_SIZE;

/// Pages reserved per worker.
const LOCAL_PAGES: usize = 128;

const ALIGNMENT: usize = 64;

struct Arena {
    mapping: Mmap,
    page_count: usize,
    prefault_count: usize,
    /// Bump cursor, in pages.
    pages: AtomicUsize,
    prefaulted: AtomicUsize,
}

struct LocalArena {
    memory: *mut u8,
    byte_count: usize,
    bytes: usize,
}

struct Locals(Vec<CachePadded<UnsafeCell<LocalArena>>>);

unsafe impl Send for Locals {}
unsafe impl Sync for Locals {}

static ARENA: OnceCell<Arena> = OnceCell::new();
static LOCALS: OnceCell<Locals> = OnceCell::new();

impl Arena {
    fn allocate_pages(&self, count: usize) -> Result<*mut u8> {
        let idx = self.pages.fetch_add(count, Ordering::Relaxed);
        if idx + count > self.page_count {
            return Err(DbError::QueryMemoryExhausted { requested: count * PAGE_SIZE });
        }
        Ok(unsafe { self.mapping.data().add(idx * PAGE_SIZE) })
    }

    fn prefault(&self) -> bool {
        let step = (64 * 1024) / PAGE_SIZE;
        let floor = self.pages.load(Ordering::Relaxed);
        self.prefaulted.fetch_max(floor, Ordering::Relaxed);
        let p = self.prefaulted.load(Ordering::Relaxed);
        if p < self.prefault_count {
            let p = self.prefaulted.fetch_add(step, Ordering::Relaxed);
            Mmap::prefault(unsafe { self.mapping.data().add(p * PAGE_SIZE) }, step * PAGE_SIZE);
            false
        } else {
            true
        }
    }
}

/// Initialize the arena and carve the worker reservations. Idempotent.
pub fn setup(pool_bytes: usize, concurrency: usize) {
    let arena = ARENA.get_or_init(|| {
        let page_count = (pool_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
        let prefault_count = (pool_bytes / 2).min(1 << 30) / PAGE_SIZE;
        let mapping = Mmap::map_memory(page_count * PAGE_SIZE).expect("query pool mapping");
        debug!(pages = page_count, "query pool mapped");
        Arena {
            mapping,
            page_count,
            prefault_count,
            pages: AtomicUsize::new(0),
            prefaulted: AtomicUsize::new(0),
        }
    });
    LOCALS.get_or_init(|| {
        let locals = (0..concurrency)
            .map(|_| {
                let memory = arena.allocate_pages(LOCAL_PAGES).expect("worker reservation");
                CachePadded::new(UnsafeCell::new(LocalArena {
                    memory,
                    byte_count: LOCAL_PAGES * PAGE_SIZE,
                    bytes: 0,
                }))
            })
            .collect();
        Mmap::prefault(arena.mapping.data(), arena.pages.load(Ordering::Relaxed) * PAGE_SIZE);
        arena.prefaulted.store(arena.pages.load(Ordering::Relaxed), Ordering::Relaxed);
        Locals(locals)
    });
}

/// Allocate `bytes` of query-lifetime memory, cache-line aligned.
pub fn allocate(bytes: usize) -> Result<NonNull<u8>> {
    let arena = ARENA.get().expect("query arena not set up");
    let bytes = (bytes + ALIGNMENT - 1) & !(ALIGNMENT - 1);

    if let Some(locals) = LOCALS.get() {
        let worker = scheduler::thread_id();
        if worker < locals.0.len() {
            let local = unsafe { &mut *locals.0[worker].get() };
            if bytes < PAGE_SIZE && local.bytes + bytes <= local.byte_count {
                let offset = local.bytes;
                local.bytes += bytes;
                let ptr = unsafe { local.memory.add(offset) };
                return Ok(unsafe { NonNull::new_unchecked(ptr) });
            }
        }
    }
    let pages = (bytes + PAGE_SIZE - 1) / PAGE_SIZE;
    let ptr = arena.allocate_pages(pages)?;
    Ok(unsafe { NonNull::new_unchecked(ptr) })
}

/// Typed allocation of `count` elements. The memory is uninitialized.
pub fn allocate_array<T>(count: usize) -> Result<NonNull<T>> {
    debug_assert!(std::mem::align_of::<T>() <= PAGE_SIZE);
    let ptr = allocate(count * std::mem::size_of::<T>())?;
    Ok(ptr.cast())
}

/// Rewind the pool: the shared cursor returns to the end of the worker
/// reservations and the reservations rearm.
pub fn end_query() {
    let (Some(arena), Some(locals)) = (ARENA.get(), LOCALS.get()) else {
        return;
    };
    arena.pages.store(LOCAL_PAGES * locals.0.len(), Ordering::Relaxed);
    for local in &locals.0 {
        unsafe { (*local.get()).bytes = 0 };
    }
}

/// Advance one prefault step; true once the target is reached.
pub fn prefault() -> bool {
    match ARENA.get() {
        Some(arena) => arena.prefault(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_and_reset() {
        let _guard = crate::test_util::engine_lock();
        setup(32 << 20, 2);
        let a = allocate(100).unwrap();
        let b = allocate(100).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(a.as_ptr() as usize % ALIGNMENT, 0);
        // Oversize allocations bypass the local reservation and come back
        // page aligned.
        let big = allocate(PAGE_SIZE * 3).unwrap();
        assert_eq!(big.as_ptr() as usize % PAGE_SIZE, 0);
        end_query();
        let c = allocate(100).unwrap();
        assert_eq!(a.as_ptr(), c.as_ptr());
        end_query();
    }
}
