//! Process-wide pool of fixed-size 8 KiB pages.
//!
//! A bump cursor over a huge-page-hinted anonymous mapping hands out page
//! runs; freed pages are recorded in a bitmap and reclaimed wholesale at
//! the next query start by walking the cursor backwards over trailing
//! freed slots. Workers amortize the shared cursor with a small local
//! cache. When the reserved range is exhausted the pool degrades to the
//! system allocator, one page at a time.

use std::alloc::{alloc, dealloc, Layout};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::memory::mmap::Mmap;
use crate::scheduler;
use crate::storage::page::{Page, PAGE_SIZE};

/// Pages cached per worker between visits to the shared cursor.
const LOCAL_PAGES: usize = 16;

struct Pool {
    #[allow(dead_code)]
    mapping: Mmap,
    /// PAGE_SIZE-aligned start of the usable region.
    data: *mut u8,
    bitmap: Vec<AtomicU64>,
    page_count: usize,
    prefault_count: usize,
    /// Bump cursor, in pages.
    pages: AtomicUsize,
    prefaulted: AtomicUsize,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

struct LocalCache {
    begin: *mut u8,
    end: *mut u8,
}

struct Locals(Vec<CachePadded<UnsafeCell<LocalCache>>>);

unsafe impl Send for Locals {}
unsafe impl Sync for Locals {}

static POOL: OnceCell<Pool> = OnceCell::new();
static LOCALS: OnceCell<Locals> = OnceCell::new();

impl Pool {
    /// Claim a run of pages from the bump cursor. `None` once the reserved
    /// range is exhausted; slots wasted by a partial overrun are marked
    /// freed so the next `start_query` reclaims them.
    fn try_allocate(&self, num_pages: usize) -> Option<*mut u8> {
        let idx = self.pages.fetch_add(num_pages, Ordering::Relaxed);
        if idx + num_pages <= self.page_count {
            Some(unsafe { self.data.add(idx * PAGE_SIZE) })
        } else {
            if idx < self.page_count {
                for i in idx..self.page_count {
                    self.bitmap[i / 64].fetch_or(1 << (i % 64), Ordering::Relaxed);
                }
            }
            None
        }
    }

    fn contains(&self, ptr: *const u8) -> bool {
        let start = self.data as usize;
        let p = ptr as usize;
        p >= start && p < start + self.page_count * PAGE_SIZE
    }

    fn deallocate(&self, ptr: *const u8) {
        debug_assert_eq!((ptr as usize) % PAGE_SIZE, 0);
        let idx = (ptr as usize - self.data as usize) / PAGE_SIZE;
        debug_assert!(idx < self.pages.load(Ordering::Relaxed));
        self.bitmap[idx / 64].fetch_or(1 << (idx % 64), Ordering::Relaxed);
    }

    fn prefault(&self) -> bool {
        let step = (64 * 1024) / PAGE_SIZE;
        let floor = self.pages.load(Ordering::Relaxed);
        self.prefaulted.fetch_max(floor, Ordering::Relaxed);
        let p = self.prefaulted.load(Ordering::Relaxed);
        if p < self.prefault_count {
            let p = self.prefaulted.fetch_add(step, Ordering::Relaxed);
            Mmap::prefault(unsafe { self.data.add(p * PAGE_SIZE) }, step * PAGE_SIZE);
            false
        } else {
            true
        }
    }
}

/// Initialize the pool. Idempotent; later calls keep the first sizing.
pub fn setup(pool_bytes: usize, concurrency: usize) {
    POOL.get_or_init(|| {
        let mut page_count = (pool_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
        let prefault_count = (pool_bytes / 2).min(1 << 30) / PAGE_SIZE;
        let mapping = Mmap::map_memory(page_count * PAGE_SIZE).expect("page pool mapping");
        let data = ((mapping.data() as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)) as *mut u8;
        page_count -= 1;
        let bitmap = (0..(page_count + 63) / 64).map(|_| AtomicU64::new(0)).collect();
        debug!(pages = page_count, "page pool mapped");
        Pool {
            mapping,
            data,
            bitmap,
            page_count,
            prefault_count,
            pages: AtomicUsize::new(0),
            prefaulted: AtomicUsize::new(0),
        }
    });
    LOCALS.get_or_init(|| {
        Locals(
            (0..concurrency)
                .map(|_| {
                    CachePadded::new(UnsafeCell::new(LocalCache {
                        begin: std::ptr::null_mut(),
                        end: std::ptr::null_mut(),
                    }))
                })
                .collect(),
        )
    });
}

fn alloc_unpooled() -> *mut Page {
    let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
    let ptr = unsafe { alloc(layout) };
    assert!(!ptr.is_null(), "system allocator failed");
    ptr.cast()
}

/// Allocate one page, preferring the worker-local cache.
pub fn allocate_page() -> *mut Page {
    let (Some(pool), Some(locals)) = (POOL.get(), LOCALS.get()) else {
        return alloc_unpooled();
    };
    let worker = scheduler::thread_id();
    if worker >= locals.0.len() {
        return match pool.try_allocate(1) {
            Some(p) => p.cast(),
            None => alloc_unpooled(),
        };
    }
    let local = unsafe { &mut *locals.0[worker].get() };
    if local.begin == local.end {
        match pool.try_allocate(LOCAL_PAGES) {
            Some(run) => {
                local.begin = run;
                local.end = unsafe { run.add(LOCAL_PAGES * PAGE_SIZE) };
            }
            None => return alloc_unpooled(),
        }
    }
    let page = local.begin;
    local.begin = unsafe { local.begin.add(PAGE_SIZE) };
    page.cast()
}

/// Return a page. Pool pages flip their bitmap bit; unpooled pages go back
/// to the system allocator.
pub fn free_page(page: *mut Page) {
    let ptr = page.cast::<u8>();
    if let Some(pool) = POOL.get() {
        if pool.contains(ptr) {
            pool.deallocate(ptr);
            return;
        }
    }
    let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
    unsafe { dealloc(ptr, layout) };
}

/// Advance one prefault step; true once the target is reached.
pub fn prefault() -> bool {
    match POOL.get() {
        Some(pool) => pool.prefault(),
        None => true,
    }
}

/// Cheap reclamation at query start: drain worker caches, then walk the
/// cursor backwards over contiguous freed slots.
pub fn start_query() {
    let Some(pool) = POOL.get() else { return };
    if let Some(locals) = LOCALS.get() {
        for cache in &locals.0 {
            let local = unsafe { &mut *cache.get() };
            while local.begin != local.end {
                pool.deallocate(local.begin);
                local.begin = unsafe { local.begin.add(PAGE_SIZE) };
            }
            local.begin = std::ptr::null_mut();
            local.end = std::ptr::null_mut();
        }
    }

    let mut begin = pool.pages.load(Ordering::Relaxed).min(pool.page_count);
    if begin == 0 {
        return;
    }
    if begin % 64 != 0 {
        // The slots past the cursor in this word count as freed.
        pool.bitmap[begin / 64].fetch_or(!((1u64 << (begin % 64)) - 1), Ordering::Relaxed);
        begin += 64 - begin % 64;
    }
    for i in (0..=(begin - 1) / 64).rev() {
        let word = pool.bitmap[i].load(Ordering::Relaxed);
        if word != u64::MAX {
            let bit_pos = 64 - (!word).leading_zeros() as usize;
            pool.bitmap[i].store(word & (u64::MAX >> (64 - bit_pos)), Ordering::Relaxed);
            pool.pages.store(i * 64 + bit_pos, Ordering::Relaxed);
            return;
        }
        pool.bitmap[i].store(0, Ordering::Relaxed);
    }
    pool.pages.store(0, Ordering::Relaxed);
}

/// Pages currently claimed and not marked freed. Test observability.
pub fn occupied_pages() -> usize {
    let Some(pool) = POOL.get() else { return 0 };
    let cursor = pool.pages.load(Ordering::Relaxed).min(pool.page_count);
    let mut freed = 0usize;
    for i in 0..(cursor + 63) / 64 {
        let mut word = pool.bitmap[i].load(Ordering::Relaxed);
        if (i + 1) * 64 > cursor {
            word &= (1u64 << (cursor % 64)) - 1;
        }
        freed += word.count_ones() as usize;
    }
    cursor - freed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpooled_roundtrip() {
        // Without setup the pool transparently degrades to the system
        // allocator.
        let page = allocate_page();
        assert!(!page.is_null());
        assert_eq!(page as usize % PAGE_SIZE, 0);
        unsafe {
            (*page).set_num_rows(7);
            assert_eq!((*page).num_rows(), 7);
        }
        free_page(page);
    }
}
