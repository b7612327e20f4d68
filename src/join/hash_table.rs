//! Chained hash table with per-bucket bloom slots and a partitioned,
//! lock-free build.
//!
//! Stored tuples are contiguous u64 records: `[next, multiplicity, key,
//! attr...]`. The `next` word threads the chain inside one bucket. During
//! the build each worker appends records into per-partition chunk chains;
//! `finish_consume` then installs every partition independently, so chain
//! links need no synchronization inside a partition.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::filter::bloom;
use crate::memory::query_arena;
use crate::scheduler;

/// Word offsets inside a stored record.
pub const ENTRY_NEXT: usize = 0;
pub const ENTRY_MULT: usize = 1;
pub const ENTRY_KEY: usize = 2;
pub const ENTRY_ATTRS: usize = 3;

/// Fibonacci multiplier; the truncated product is both the bucket hash and
/// the bloom hash.
const FIBONACCI: u64 = 0x9E3779B97F4A7C15;

const HASH_BITS: u32 = 64;

#[inline(always)]
pub fn compute_hashes(key: u64) -> (u64, u32) {
    let h = (key as u32 as u64).wrapping_mul(FIBONACCI);
    (h, h as u32)
}

pub struct Hashtable {
    /// `bucket = hash >> shift`
    shift: AtomicU32,
    buckets: AtomicPtr<u64>,
    bloom: AtomicPtr<u16>,
    num_tuples: AtomicUsize,
    num_keys: AtomicUsize,
    certainly_duplicate_free: AtomicBool,
}

unsafe impl Send for Hashtable {}
unsafe impl Sync for Hashtable {}

impl Default for Hashtable {
    fn default() -> Self {
        Hashtable {
            shift: AtomicU32::new(HASH_BITS),
            buckets: AtomicPtr::new(std::ptr::null_mut()),
            bloom: AtomicPtr::new(std::ptr::null_mut()),
            num_tuples: AtomicUsize::new(0),
            num_keys: AtomicUsize::new(0),
            certainly_duplicate_free: AtomicBool::new(true),
        }
    }
}

impl Hashtable {
    #[inline]
    pub fn ht_size(&self) -> usize {
        1usize << (HASH_BITS - self.shift.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn num_tuples(&self) -> usize {
        self.num_tuples.load(Ordering::Relaxed)
    }

    /// Distinct-key estimate collected during the build.
    #[inline]
    pub fn num_keys_estimate(&self) -> usize {
        self.num_keys.load(Ordering::Relaxed).max(1)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_tuples() == 0
    }

    #[inline]
    pub fn is_duplicate_free(&self) -> bool {
        self.certainly_duplicate_free.load(Ordering::Relaxed)
    }

    #[inline]
    fn bucket_base(&self) -> *mut u64 {
        self.buckets.load(Ordering::Relaxed)
    }

    #[inline]
    fn bloom_base(&self) -> *mut u16 {
        self.bloom.load(Ordering::Relaxed)
    }

    /// Head of the chain for `key`, possibly null.
    #[inline]
    pub fn bucket_head(&self, key: u64) -> *const u64 {
        let (h, _) = compute_hashes(key);
        let index = (h >> self.shift.load(Ordering::Relaxed)) as usize;
        unsafe { *self.bucket_base().add(index) as *const u64 }
    }

    #[inline]
    pub fn prefetch(&self, key: u64) {
        let head = self.bucket_head(key);
        #[cfg(target_arch = "x86_64")]
        unsafe {
            use std::arch::x86_64::{_mm_prefetch, _MM_HINT_NTA};
            _mm_prefetch::<_MM_HINT_NTA>(head.cast());
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = head;
    }

    /// Bloom-only membership test: no false negatives.
    #[inline]
    pub fn join_filter(&self, key: u64) -> bool {
        let (h, b) = compute_hashes(key);
        let entry =
            unsafe { *self.bloom_base().add((h >> self.shift.load(Ordering::Relaxed)) as usize) };
        bloom::check_entry(b, entry)
    }

    /// Bloom test plus a chain walk: exact membership.
    #[inline]
    pub fn join_filter_precise(&self, key: u64) -> bool {
        let (h, b) = compute_hashes(key);
        let index = (h >> self.shift.load(Ordering::Relaxed)) as usize;
        let entry = unsafe { *self.bloom_base().add(index) };
        if !bloom::check_entry(b, entry) {
            return false;
        }
        // A set bloom entry guarantees a non-empty chain.
        let mut current = unsafe { *self.bucket_base().add(index) as *const u64 };
        debug_assert!(!current.is_null());
        while !current.is_null() {
            unsafe {
                if *current.add(ENTRY_KEY) == key {
                    return true;
                }
                current = *current.add(ENTRY_NEXT) as *const u64;
            }
        }
        false
    }

    /// Size the bucket and bloom arrays: `2^ceil(log2(n))` slots, at
    /// least 16.
    fn allocate_buckets(&self, num_elements: usize) {
        let size_shift = (usize::BITS - num_elements.leading_zeros()).max(4);
        self.shift.store(HASH_BITS - size_shift, Ordering::Relaxed);
        let entries = self.ht_size();
        let bytes = entries * (std::mem::size_of::<u64>() + std::mem::size_of::<u16>());
        let memory = query_arena::allocate(bytes).expect("query memory exhausted");
        let buckets: *mut u64 = memory.cast().as_ptr();
        self.buckets.store(buckets, Ordering::Relaxed);
        self.bloom.store(unsafe { buckets.add(entries).cast() }, Ordering::Relaxed);
    }

    /// Visit every stored entry.
    pub fn iterate_entries(&self, mut callback: impl FnMut(*const u64)) {
        let base = self.bucket_base();
        if base.is_null() {
            return;
        }
        for i in 0..self.ht_size() {
            let mut current = unsafe { *base.add(i) as *const u64 };
            while !current.is_null() {
                callback(current);
                current = unsafe { *current.add(ENTRY_NEXT) as *const u64 };
            }
        }
    }

    /// Visit every stored key.
    pub fn iterate_all(&self, mut callback: impl FnMut(u64)) {
        self.iterate_entries(|entry| callback(unsafe { *entry.add(ENTRY_KEY) }));
    }

    /// Unlink every tuple whose attribute at `attr_offset` (0 = key)
    /// differs from `value`. Runs in parallel over bucket ranges.
    pub fn filter_eq(&self, attr_offset: usize, value: u64) -> crate::error::Result<()> {
        let size = self.ht_size();
        let morsel = (size / scheduler::concurrency()).max(100);
        let base = self.bucket_base() as usize;
        let word = ENTRY_KEY + attr_offset;
        scheduler::parallel_morsel(0, size as u64, morsel as u64, false, &move |_, start| {
            let base = base as *mut u64;
            let mut removed_tuples = 0usize;
            let mut removed_slots = 0usize;
            let end = (start as usize + morsel).min(size);
            for i in start as usize..end {
                unsafe {
                    if *base.add(i) == 0 {
                        continue;
                    }
                    let mut owner = base.add(i);
                    loop {
                        let tuple = *owner as *mut u64;
                        if *tuple.add(word) != value {
                            *owner = *tuple.add(ENTRY_NEXT);
                            removed_tuples += 1;
                        } else {
                            owner = tuple.add(ENTRY_NEXT);
                        }
                        if *owner == 0 {
                            break;
                        }
                    }
                    if *base.add(i) == 0 {
                        removed_slots += 1;
                    }
                }
            }
            self.num_keys.fetch_sub(removed_slots, Ordering::SeqCst);
            self.num_tuples.fetch_sub(removed_tuples, Ordering::SeqCst);
        })
    }
}

/// Chunk and block geometry for the build-side tuple store.
const CHUNK_SIZE: usize = 8048;
const CHUNK_WORDS: usize = CHUNK_SIZE / 8 - 2;
const BLOCK_CHUNKS: usize = HashtableBuild::MAX_PARTITIONS - 1;

#[repr(C)]
struct Chunk {
    next: *mut Chunk,
    end: usize,
    data: [u64; CHUNK_WORDS],
}

#[repr(C, align(4096))]
struct Block {
    next: *mut Block,
    current_chunk: usize,
    chunks: [Chunk; BLOCK_CHUNKS],
}

#[derive(Clone, Copy)]
struct ChunkRef {
    cur: *mut u64,
    end: *const u64,
}

/// Per-worker build state: one chunk chain per partition.
pub struct BuildLocalState {
    num_tuples: usize,
    partitions: [ChunkRef; HashtableBuild::MAX_PARTITIONS],
    chunks: [*mut Chunk; HashtableBuild::MAX_PARTITIONS],
    blocks: *mut Block,
    attr_count: usize,
    next: *mut BuildLocalState,
}

unsafe impl Send for BuildLocalState {}
unsafe impl Sync for BuildLocalState {}

impl BuildLocalState {
    pub fn new(_build: &HashtableBuild) -> BuildLocalState {
        BuildLocalState {
            num_tuples: 0,
            partitions: [ChunkRef { cur: std::ptr::null_mut(), end: std::ptr::null() };
                HashtableBuild::MAX_PARTITIONS],
            chunks: [std::ptr::null_mut(); HashtableBuild::MAX_PARTITIONS],
            blocks: std::ptr::null_mut(),
            attr_count: 0,
            next: std::ptr::null_mut(),
        }
    }

    /// Link this state into the build's collection list. Must be called
    /// once the state has its final address.
    pub fn register(&mut self, build: &HashtableBuild) {
        self.next = build.local_states.swap(self, Ordering::AcqRel);
    }

    #[cold]
    fn allocate_chunk(&mut self, partition: usize, attr_count: usize) {
        unsafe {
            if self.blocks.is_null() || (*self.blocks).current_chunk == BLOCK_CHUNKS {
                self.attr_count = attr_count;
                let block: *mut Block = query_arena::allocate_array::<Block>(1)
                    .expect("query memory exhausted")
                    .as_ptr();
                (*block).next = self.blocks;
                (*block).current_chunk = 0;
                self.blocks = block;
            }
            debug_assert_eq!(self.attr_count, attr_count);

            // Seal the partition's previous chunk at its current fill.
            if !self.chunks[partition].is_null() {
                let prev = self.chunks[partition];
                (*prev).end = self.partitions[partition].cur.offset_from((*prev).data.as_ptr())
                    as usize;
            }

            let block = self.blocks;
            let chunk = &mut (*block).chunks[(*block).current_chunk];
            (*block).current_chunk += 1;
            chunk.next = self.chunks[partition];
            chunk.end = 0;
            self.chunks[partition] = chunk;

            self.partitions[partition] = ChunkRef {
                cur: chunk.data.as_mut_ptr(),
                end: chunk.data.as_ptr().add(CHUNK_WORDS - (CHUNK_WORDS % attr_count)),
            };
        }
    }
}

/// Build sub-operator: collects tuples into partition chunks, then
/// installs them partition-parallel.
pub struct HashtableBuild {
    pub ht: Arc<Hashtable>,
    partition_shift: u32,
    local_states: AtomicPtr<BuildLocalState>,
    pub is_cross_product: bool,
}

unsafe impl Send for HashtableBuild {}
unsafe impl Sync for HashtableBuild {}

impl HashtableBuild {
    pub const MAX_PARTITIONS_SHIFT: u32 = 7;
    pub const MAX_PARTITIONS: usize = 1 << Self::MAX_PARTITIONS_SHIFT;

    pub fn new(ht: Arc<Hashtable>, card_estimate: usize) -> HashtableBuild {
        let mut upper = Self::MAX_PARTITIONS_SHIFT as usize;
        upper = upper.min(scheduler::concurrency() * 2);
        let width = (usize::BITS - (card_estimate / 1024).leading_zeros()) as usize;
        let partition_count_shift = width.clamp(2, upper) as u32;
        HashtableBuild {
            ht,
            partition_shift: HASH_BITS - partition_count_shift,
            local_states: AtomicPtr::new(std::ptr::null_mut()),
            is_cross_product: false,
        }
    }

    /// Append one tuple to the worker's partition chunks.
    #[inline]
    pub fn consume(&self, ls: &mut BuildLocalState, multiplicity: u64, key: u64, attrs: &[u64]) {
        let attr_count = attrs.len() + ENTRY_ATTRS;
        ls.num_tuples += 1;

        let (hash, _) = compute_hashes(key);
        let partition = (hash >> self.partition_shift) as usize;
        debug_assert!(partition < Self::MAX_PARTITIONS);
        if ls.partitions[partition].cur as *const u64 == ls.partitions[partition].end {
            ls.allocate_chunk(partition, attr_count);
        }
        let part = &mut ls.partitions[partition];
        unsafe {
            debug_assert!(part.cur.add(attr_count) as *const u64 <= part.end);
            *part.cur.add(ENTRY_NEXT) = 0;
            *part.cur.add(ENTRY_MULT) = multiplicity;
            *part.cur.add(ENTRY_KEY) = key;
            for (i, &attr) in attrs.iter().enumerate() {
                *part.cur.add(ENTRY_ATTRS + i) = attr;
            }
            part.cur = part.cur.add(attr_count);
        }
    }

    fn local_state_list(&self) -> Vec<*mut BuildLocalState> {
        let mut states = Vec::new();
        let mut current = self.local_states.load(Ordering::Acquire);
        while !current.is_null() {
            states.push(current);
            current = unsafe { (*current).next };
        }
        states
    }

    /// Walk every record collected for `partition` across all workers.
    fn iterate_tuples(&self, partition: usize, mut callback: impl FnMut(*mut u64)) {
        for &ls in &self.local_state_list() {
            unsafe {
                let ls = &mut *ls;
                let attr_count = ls.attr_count;
                let mut chunk = ls.chunks[partition];
                if chunk.is_null() {
                    continue;
                }
                // Seal the partition's open chunk at its current fill.
                (*chunk).end =
                    ls.partitions[partition].cur.offset_from((*chunk).data.as_ptr()) as usize;
                while !chunk.is_null() {
                    let data = (*chunk).data.as_mut_ptr();
                    let end = (*chunk).end;
                    let mut offset = 0;
                    while offset < end {
                        callback(data.add(offset));
                        offset += attr_count;
                    }
                    chunk = (*chunk).next;
                }
            }
        }
    }

    fn install_partition(&self, partition: usize, attr_count: usize) {
        let ht = &self.ht;
        let partition_count_shift = HASH_BITS - self.partition_shift;
        let size = ht.ht_size() >> partition_count_shift;
        let shift = ht.shift.load(Ordering::Relaxed);
        let buckets = ht.bucket_base();
        let blooms = ht.bloom_base();

        unsafe {
            std::ptr::write_bytes(buckets.add(partition * size), 0, size);
            std::ptr::write_bytes(blooms.add(partition * size), 0, size);
        }

        let mut local_num_keys = 0usize;
        let mut local_removed = 0usize;
        let mut possible_duplicate = false;

        self.iterate_tuples(partition, |tuple| unsafe {
            let key = *tuple.add(ENTRY_KEY);
            let (h, b) = compute_hashes(key);
            debug_assert_eq!((h >> self.partition_shift) as usize, partition);
            let index = (h >> shift) as usize;
            debug_assert!(index >= partition * size && index < (partition + 1) * size);

            let old = *buckets.add(index) as *mut u64;
            let mask = bloom::get_mask(b);
            let bloom_entry = blooms.add(index);
            possible_duplicate |= *tuple.add(ENTRY_MULT) > 1;
            if bloom::check_mask_with_entry(mask, *bloom_entry) {
                let key_eq = *old.add(ENTRY_KEY) == key;
                let duplicate = key_eq || *old.add(ENTRY_NEXT) != 0;
                possible_duplicate |= duplicate;
                local_num_keys += usize::from(!duplicate);
                if key_eq && rest_equal(old, tuple, attr_count) {
                    // Identical payload: fold into the stored tuple.
                    local_removed += 1;
                    debug_assert!(*tuple.add(ENTRY_MULT) >= 1);
                    *old.add(ENTRY_MULT) += *tuple.add(ENTRY_MULT);
                    return;
                }
            } else {
                local_num_keys += 1;
            }
            *tuple.add(ENTRY_NEXT) = old as u64;
            *buckets.add(index) = tuple as u64;
            *bloom_entry |= mask;
        });

        ht.num_keys.fetch_add(local_num_keys, Ordering::SeqCst);
        ht.num_tuples.fetch_sub(local_removed, Ordering::SeqCst);
        if possible_duplicate {
            ht.certainly_duplicate_free.store(false, Ordering::SeqCst);
        }
    }

    fn install_partition_cross_product(&self, partition: usize, attr_count: usize) {
        let ht = &self.ht;
        let mut head: *mut u64 = std::ptr::null_mut();
        let mut tail: *mut u64 = std::ptr::null_mut();
        self.iterate_tuples(partition, |tuple| unsafe {
            if head.is_null() {
                head = tuple;
                tail = tuple;
                if *tuple.add(ENTRY_MULT) > 1 {
                    ht.certainly_duplicate_free.store(false, Ordering::SeqCst);
                }
            } else {
                debug_assert!(!ht.is_duplicate_free());
                if tuple_equal(tail, tuple, attr_count) {
                    *tail.add(ENTRY_MULT) += *tuple.add(ENTRY_MULT);
                } else {
                    *tail.add(ENTRY_NEXT) = tuple as u64;
                    tail = tuple;
                }
            }
        });
        if !head.is_null() {
            let (h, _) = compute_hashes(0);
            let index = (h >> ht.shift.load(Ordering::Relaxed)) as usize;
            let bucket = unsafe { &*(ht.bucket_base().add(index) as *const AtomicU64) };
            let old = bucket.swap(head as u64, Ordering::SeqCst);
            unsafe { *tail.add(ENTRY_NEXT) = old };
        }
    }

    /// Install all collected tuples. Must run after every scan feeding the
    /// build has finished.
    pub fn finish_consume(&self) -> crate::error::Result<()> {
        let states = self.local_state_list();

        let mut num_tuples = 0usize;
        let mut attr_count = ENTRY_ATTRS;
        for &state in &states {
            let state = unsafe { &*state };
            num_tuples += state.num_tuples;
            if state.num_tuples > 0 {
                attr_count = state.attr_count;
            }
        }
        self.ht.num_tuples.store(num_tuples, Ordering::Relaxed);
        self.ht.num_keys.store(0, Ordering::Relaxed);

        let partition_count_shift = HASH_BITS - self.partition_shift;
        let num_partitions = 1usize << partition_count_shift;

        if self.is_cross_product {
            // One bucket, pseudo-key zero, bloom wide open.
            self.ht
                .certainly_duplicate_free
                .store(num_tuples == 1, Ordering::Relaxed);
            self.ht.num_keys.store(1, Ordering::Relaxed);
            self.ht.allocate_buckets(1);
            let entries = self.ht.ht_size();
            unsafe {
                std::ptr::write_bytes(self.ht.bucket_base(), 0, entries);
                std::ptr::write_bytes(self.ht.bloom_base(), 0, entries);
                let (h, _) = compute_hashes(0);
                *self.ht.bloom_base().add((h >> self.ht.shift.load(Ordering::Relaxed)) as usize) =
                    0xFFFF;
            }
        } else {
            self.ht.allocate_buckets(num_tuples.max(num_partitions));
        }

        let single_threaded = num_tuples <= 256 || states.len() <= 1;
        if single_threaded {
            for partition in 0..num_partitions {
                if self.is_cross_product {
                    self.install_partition_cross_product(partition, attr_count);
                } else {
                    self.install_partition(partition, attr_count);
                }
            }
        } else {
            scheduler::parallel_for(0, num_partitions as u64, &|_, partition| {
                if self.is_cross_product {
                    self.install_partition_cross_product(partition as usize, attr_count);
                } else {
                    self.install_partition(partition as usize, attr_count);
                }
            })?;
        }

        // Small tables afford an exact duplicate-freeness answer.
        if self.ht.num_tuples() <= 32 {
            let mut keys = HashSet::with_capacity(self.ht.num_tuples());
            let mut has_multiplicity = false;
            self.ht.iterate_entries(|entry| unsafe {
                debug_assert!(*entry.add(ENTRY_MULT) >= 1);
                if *entry.add(ENTRY_MULT) != 1 {
                    has_multiplicity = true;
                }
                keys.insert(*entry.add(ENTRY_KEY) as u32);
            });
            let duplicate_free = !has_multiplicity && keys.len() == self.ht.num_tuples();
            self.ht.certainly_duplicate_free.store(duplicate_free, Ordering::Relaxed);
        }
        Ok(())
    }
}

#[inline(always)]
unsafe fn rest_equal(a: *const u64, b: *const u64, attr_count: usize) -> bool {
    for i in ENTRY_ATTRS..attr_count {
        if *a.add(i) != *b.add(i) {
            return false;
        }
    }
    true
}

#[inline(always)]
unsafe fn tuple_equal(a: *const u64, b: *const u64, attr_count: usize) -> bool {
    *a.add(ENTRY_KEY) == *b.add(ENTRY_KEY) && rest_equal(a, b, attr_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn setup() -> parking_lot::MutexGuard<'static, ()> {
        let guard = crate::test_util::engine_lock();
        crate::scheduler::setup(&EngineConfig {
            page_pool_bytes: Some(64 << 20),
            query_pool_bytes: Some(64 << 20),
            ..EngineConfig::default()
        });
        crate::scheduler::start_query();
        guard
    }

    fn build_table(rows: &[(u64, u64, u64)]) -> Arc<Hashtable> {
        let ht = Arc::new(Hashtable::default());
        let build = HashtableBuild::new(ht.clone(), rows.len());
        let mut ls = BuildLocalState::new(&build);
        ls.register(&build);
        for &(mult, key, attr) in rows {
            build.consume(&mut ls, mult, key, &[attr]);
        }
        build.finish_consume().unwrap();
        ht
    }

    #[test]
    fn test_build_and_probe() {
        let _guard = setup();
        let ht = build_table(&[(1, 10, 100), (1, 20, 200), (1, 10, 101)]);
        assert_eq!(ht.num_tuples(), 3);
        assert!(!ht.is_duplicate_free());

        let mut found = Vec::new();
        let mut current = ht.bucket_head(10);
        while !current.is_null() {
            unsafe {
                if *current.add(ENTRY_KEY) == 10 {
                    found.push(*current.add(ENTRY_ATTRS));
                }
                current = *current.add(ENTRY_NEXT) as *const u64;
            }
        }
        found.sort_unstable();
        assert_eq!(found, vec![100, 101]);
        assert!(ht.bucket_head(99).is_null() || {
            // A shared bucket is possible; the chain must then hold no key 99.
            let mut current = ht.bucket_head(99);
            let mut clean = true;
            while !current.is_null() {
                unsafe {
                    clean &= *current.add(ENTRY_KEY) != 99;
                    current = *current.add(ENTRY_NEXT) as *const u64;
                }
            }
            clean
        });
        crate::scheduler::end_query();
        crate::memory::query_arena::end_query();
    }

    #[test]
    fn test_bloom_soundness() {
        let _guard = setup();
        let rows: Vec<(u64, u64, u64)> = (0..500).map(|i| (1, i * 7 % 311, i)).collect();
        let ht = build_table(&rows);
        // No false negatives through the bloom filter.
        for &(_, key, _) in &rows {
            assert!(ht.join_filter(key), "bloom dropped key {key}");
            assert!(ht.join_filter_precise(key));
        }
        // The precise filter rejects every absent key.
        for key in 1000..1100u64 {
            assert!(!ht.join_filter_precise(key), "precise accepted absent {key}");
        }
        crate::scheduler::end_query();
        crate::memory::query_arena::end_query();
    }

    #[test]
    fn test_duplicate_collapse() {
        let _guard = setup();
        // Identical (key, attrs) tuples fold into one record with summed
        // multiplicity.
        let ht = build_table(&[(2, 5, 50), (3, 5, 50), (1, 5, 50)]);
        assert_eq!(ht.num_tuples(), 1);
        let mut mults = Vec::new();
        ht.iterate_entries(|entry| unsafe {
            mults.push(*entry.add(ENTRY_MULT));
        });
        assert_eq!(mults, vec![6]);
        assert!(!ht.is_duplicate_free());
        crate::scheduler::end_query();
        crate::memory::query_arena::end_query();
    }

    #[test]
    fn test_duplicate_free_detection() {
        let _guard = setup();
        let ht = build_table(&[(1, 1, 10), (1, 2, 20), (1, 3, 30)]);
        assert!(ht.is_duplicate_free());
        assert_eq!(ht.num_keys_estimate(), 3);
        crate::scheduler::end_query();
        crate::memory::query_arena::end_query();
    }

    #[test]
    fn test_filter_eq() {
        let _guard = setup();
        let ht = build_table(&[(1, 1, 10), (1, 2, 10), (1, 3, 30)]);
        ht.filter_eq(1, 10).unwrap();
        assert_eq!(ht.num_tuples(), 2);
        let mut keys = Vec::new();
        ht.iterate_all(|k| keys.push(k));
        keys.sort_unstable();
        assert_eq!(keys, vec![1, 2]);
        crate::scheduler::end_query();
        crate::memory::query_arena::end_query();
    }
}
