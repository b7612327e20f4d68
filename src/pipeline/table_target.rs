//! Terminal operator materializing tuples back into the page format.
//!
//! One writer per output column. Writers track a bit budget per page
//! (header and null bit included per value), flush full pages, and keep
//! per-worker page lists that `extract` stitches together without
//! copying. Multiplicity expansion happens here, not upstream.

use std::sync::atomic::{AtomicPtr, Ordering};

use crate::common::is_null;
use crate::memory::page_pool;
use crate::query::plan::{Column, ColumnarTable};
use crate::storage::column::DataType;
use crate::storage::page::{Page, PAGE_SIZE};
use crate::storage::string_ptr::StringPtr;

/// Tuples buffered per local state before the writers run.
const BUFFER_COUNT: usize = 64;

/// Bit budget of a fresh page for a given element size.
fn fresh_budget(elem_size: usize) -> i64 {
    8 * (PAGE_SIZE as i64 - 4 - if elem_size == 8 { 4 } else { 0 })
}

/// Append-only store for a page's null bitmap.
struct NullStore {
    size: usize,
    bits: Box<[u8; PAGE_SIZE]>,
}

impl NullStore {
    fn new() -> NullStore {
        NullStore { size: 0, bits: Box::new([0; PAGE_SIZE]) }
    }

    #[inline]
    fn push(&mut self, is_valid: bool) {
        self.bits[self.size / 8] |= (is_valid as u8) << (self.size % 8);
        self.size += 1;
    }

    fn push_many(&mut self, is_valid: bool, count: usize) {
        if !is_valid {
            // Null bits are zero; only the length moves.
            self.size += count;
            return;
        }
        let mut remaining = count;
        let initial = (8 - self.size % 8).min(remaining);
        self.bits[self.size / 8] |= (((1u16 << initial) - 1) as u8) << (self.size % 8);
        self.size += initial;
        remaining -= initial;
        if remaining == 0 {
            return;
        }
        debug_assert_eq!(self.size % 8, 0);
        let bytes = remaining / 8;
        for b in &mut self.bits[self.size / 8..self.size / 8 + bytes] {
            *b = 0xFF;
        }
        self.size += bytes * 8;
        remaining -= bytes * 8;
        self.bits[self.size / 8] |= ((1u16 << remaining) - 1) as u8;
        self.size += remaining;
    }

    #[inline]
    fn len(&self) -> usize {
        self.size
    }

    fn byte_len(&self) -> usize {
        (self.size + 7) / 8
    }

    fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn clear(&mut self) {
        let len = self.byte_len();
        for b in &mut self.bits[..len] {
            *b = 0;
        }
        self.size = 0;
    }
}

pub trait ColumnWriter {
    /// Write one value `count` times.
    fn step_many(&mut self, value: u64, count: usize);
    /// Write a batch, expanding per-tuple multiplicities.
    ///
    /// # Safety
    /// Both pointers must cover `count` slots.
    unsafe fn step_batch(&mut self, multiplicities: *const u64, values: *const u64, count: usize);
    /// Seal the current page without starting a new one.
    fn flush(&mut self);
    fn pages_mut(&mut self) -> &mut Vec<*mut Page>;
}

fn allocate_into(pages: &mut Vec<*mut Page>) -> *mut Page {
    let page = page_pool::allocate_page();
    unsafe { (*page).zero() };
    pages.push(page);
    page
}

struct IntWriter {
    elem_size: usize,
    available: i64,
    next: *mut u8,
    nulls: NullStore,
    pages: Vec<*mut Page>,
}

impl IntWriter {
    fn new(elem_size: usize) -> IntWriter {
        let mut pages = Vec::new();
        let page = allocate_into(&mut pages);
        let next = unsafe { (*page).bytes_mut().as_mut_ptr().add(Page::data_offset(elem_size)) };
        IntWriter { elem_size, available: fresh_budget(elem_size), next, nulls: NullStore::new(), pages }
    }

    fn seal(&mut self) {
        let page = unsafe { &mut **self.pages.last().unwrap() };
        page.set_num_rows(self.nulls.len() as u16);
        let values_start =
            unsafe { page.bytes_mut().as_mut_ptr().add(Page::data_offset(self.elem_size)) };
        page.set_num_not_null(
            (unsafe { self.next.offset_from(values_start) } as usize / self.elem_size) as u16,
        );
        let offset = page.nulls_offset();
        page.bytes_mut()[offset..offset + self.nulls.byte_len()]
            .copy_from_slice(&self.nulls.bits[..self.nulls.byte_len()]);
    }

    fn flush_page(&mut self) {
        self.seal();
        self.nulls.clear();
        let page = allocate_into(&mut self.pages);
        self.next = unsafe { (*page).bytes_mut().as_mut_ptr().add(Page::data_offset(self.elem_size)) };
        self.available = fresh_budget(self.elem_size);
    }

    #[inline]
    fn step(&mut self, value: u64) {
        let value_bits = if is_null(value) { 0 } else { self.elem_size as i64 * 8 };
        self.available -= 1 + value_bits;
        if self.available < 0 {
            self.flush_page();
            self.available -= 1 + value_bits;
        }
        unsafe {
            // Branchless store: write, then advance only for non-null.
            match self.elem_size {
                4 => (self.next as *mut u32).write_unaligned(value as u32),
                _ => (self.next as *mut u64).write_unaligned(value),
            }
            self.next = self.next.add(if is_null(value) { 0 } else { self.elem_size });
        }
        self.nulls.push(!is_null(value));
    }
}

impl ColumnWriter for IntWriter {
    fn step_many(&mut self, value: u64, count: usize) {
        for _ in 0..count {
            self.step(value);
        }
    }

    unsafe fn step_batch(&mut self, multiplicities: *const u64, values: *const u64, count: usize) {
        for i in 0..count {
            self.step_many(*values.add(i), *multiplicities.add(i) as usize);
        }
    }

    fn flush(&mut self) {
        if self.nulls.is_empty() {
            return;
        }
        self.seal();
        self.nulls.clear();
    }

    fn pages_mut(&mut self) -> &mut Vec<*mut Page> {
        &mut self.pages
    }
}

struct VarcharWriter {
    available: i64,
    strings: Box<[u8; PAGE_SIZE]>,
    strings_size: usize,
    /// Next offset-table slot on the current page.
    next: *mut u16,
    nulls: NullStore,
    pages: Vec<*mut Page>,
}

impl VarcharWriter {
    fn new() -> VarcharWriter {
        let mut pages = Vec::new();
        let page = allocate_into(&mut pages);
        let next = unsafe { (*page).bytes_mut().as_mut_ptr().add(4) as *mut u16 };
        VarcharWriter {
            available: 8 * (PAGE_SIZE as i64 - 4),
            strings: Box::new([0; PAGE_SIZE]),
            strings_size: 0,
            next,
            nulls: NullStore::new(),
            pages,
        }
    }

    fn seal(&mut self) {
        let page = unsafe { &mut **self.pages.last().unwrap() };
        page.set_num_rows(self.nulls.len() as u16);
        let values_start = unsafe { page.bytes_mut().as_mut_ptr().add(4) as *mut u16 };
        let num_not_null = unsafe { self.next.offset_from(values_start) } as usize;
        page.set_num_not_null(num_not_null as u16);
        let strings_at = 4 + num_not_null * 2;
        page.bytes_mut()[strings_at..strings_at + self.strings_size]
            .copy_from_slice(&self.strings[..self.strings_size]);
        let offset = page.nulls_offset();
        page.bytes_mut()[offset..offset + self.nulls.byte_len()]
            .copy_from_slice(&self.nulls.bits[..self.nulls.byte_len()]);
    }

    fn flush_page(&mut self) {
        self.seal();
        self.nulls.clear();
        self.strings_size = 0;
        let page = allocate_into(&mut self.pages);
        self.next = unsafe { (*page).bytes_mut().as_mut_ptr().add(4) as *mut u16 };
        self.available = 8 * (PAGE_SIZE as i64 - 4);
    }

    #[inline]
    fn append_string(&mut self, value: StringPtr) {
        let len = value.len();
        let dest = &mut self.strings[self.strings_size..self.strings_size + len];
        dest.copy_from_slice(value.short_bytes());
        self.strings_size += len;
    }

    fn step(&mut self, raw: u64) {
        if is_null(raw) {
            self.available -= 1;
            if self.available < 0 {
                self.flush_page();
                self.available -= 1;
            }
            self.nulls.push(false);
            return;
        }
        let value = StringPtr::from_bits(raw);
        if !value.is_long() {
            let delta = 1 + 16 + 8 * value.len() as i64;
            self.available -= delta;
            if self.available < 0 {
                self.flush_page();
                self.available -= delta;
            }
            self.append_string(value);
            unsafe {
                self.next.write_unaligned(self.strings_size as u16);
                self.next = self.next.add(1);
            }
            self.nulls.push(true);
        } else {
            // Long strings copy their source pages through verbatim.
            self.flush_page();
            for page in value.pages() {
                let dest = *self.pages.last().unwrap();
                unsafe {
                    std::ptr::copy_nonoverlapping(page.get().bytes().as_ptr(), (*dest).bytes_mut().as_mut_ptr(), PAGE_SIZE);
                }
                let fresh = allocate_into(&mut self.pages);
                self.next = unsafe { (*fresh).bytes_mut().as_mut_ptr().add(4) as *mut u16 };
            }
        }
    }
}

impl ColumnWriter for VarcharWriter {
    fn step_many(&mut self, raw: u64, mut count: usize) {
        if is_null(raw) {
            while count > 0 {
                if self.available < 1 {
                    self.flush_page();
                    continue;
                }
                let batch = count.min(self.available as usize);
                self.available -= batch as i64;
                self.nulls.push_many(false, batch);
                count -= batch;
            }
            return;
        }
        let value = StringPtr::from_bits(raw);
        if value.is_long() {
            for _ in 0..count {
                self.step(raw);
            }
            return;
        }
        let len = value.len();
        let delta = 1 + 16 + 8 * len as i64;

        // A page flushed right before filling holds only copies of this
        // string; identical follow-up pages can be duplicated wholesale.
        let mut flushed = false;
        if self.available < delta {
            self.flush_page();
            flushed = true;
        }

        let mut prev_batch = usize::MAX;
        while count > 0 {
            let mut batch = (self.available / delta) as usize;
            if batch > count {
                batch = count;
            }
            if batch == prev_batch {
                debug_assert!(self.nulls.is_empty());
                debug_assert_eq!(self.strings_size, 0);
                let src = self.pages[self.pages.len() - 2];
                let dest = *self.pages.last().unwrap();
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        (*src).bytes().as_ptr(),
                        (*dest).bytes_mut().as_mut_ptr(),
                        PAGE_SIZE,
                    );
                }
                count -= batch;
                let fresh = allocate_into(&mut self.pages);
                self.next = unsafe { (*fresh).bytes_mut().as_mut_ptr().add(4) as *mut u16 };
                continue;
            }

            // Exponential doubling within the string region.
            let base = self.strings_size;
            self.strings[base..base + len].copy_from_slice(value.short_bytes());
            let mut copied = 1usize;
            while copied < batch {
                let to_copy = copied.min(batch - copied);
                self.strings.copy_within(base..base + to_copy * len, base + copied * len);
                copied += to_copy;
            }

            for i in 0..batch {
                unsafe {
                    self.next
                        .add(i)
                        .write_unaligned((base + (i + 1) * len) as u16);
                }
            }
            self.strings_size += batch * len;
            self.next = unsafe { self.next.add(batch) };
            self.available -= batch as i64 * delta;
            self.nulls.push_many(true, batch);
            count -= batch;
            if flushed {
                prev_batch = batch;
            }

            if count > 0 {
                debug_assert!(self.available < delta);
                self.flush_page();
                flushed = true;
            }
        }
    }

    unsafe fn step_batch(&mut self, multiplicities: *const u64, values: *const u64, count: usize) {
        for i in 0..count {
            let raw = *values.add(i);
            let mult = *multiplicities.add(i) as usize;
            if mult == 1 && raw & (1 << 15) == 0 {
                debug_assert!(!is_null(raw));
                let value = StringPtr::from_bits(raw);
                let delta = 1 + 16 + 8 * value.len() as i64;
                if self.available < delta {
                    self.flush_page();
                }
                self.append_string(value);
                self.next.write_unaligned(self.strings_size as u16);
                self.next = self.next.add(1);
                self.available -= delta;
                self.nulls.push(true);
            } else {
                self.step_many(raw, mult);
            }
        }
    }

    fn flush(&mut self) {
        if self.nulls.is_empty() {
            return;
        }
        self.seal();
        self.nulls.clear();
        self.strings_size = 0;
    }

    fn pages_mut(&mut self) -> &mut Vec<*mut Page> {
        &mut self.pages
    }
}

fn make_writer(data_type: DataType) -> Box<dyn ColumnWriter> {
    match data_type {
        DataType::Int32 => Box::new(IntWriter::new(4)),
        DataType::Int64 | DataType::Fp64 => Box::new(IntWriter::new(8)),
        DataType::Varchar => Box::new(VarcharWriter::new()),
    }
}

/// Per-worker writer set plus a small tuple buffer.
pub struct TargetLocalState {
    cur: usize,
    num_rows: usize,
    writers: Vec<Box<dyn ColumnWriter>>,
    buffer: Vec<u64>,
    next: *mut TargetLocalState,
}

unsafe impl Send for TargetLocalState {}

impl TargetLocalState {
    fn flush_buffers(&mut self) {
        let count = self.cur;
        if count == 0 {
            return;
        }
        for i in 0..count {
            debug_assert!(self.buffer[i] >= 1);
            self.num_rows += self.buffer[i] as usize;
        }
        for (i, writer) in self.writers.iter_mut().enumerate() {
            unsafe {
                writer.step_batch(
                    self.buffer.as_ptr(),
                    self.buffer.as_ptr().add((i + 1) * BUFFER_COUNT),
                    count,
                );
            }
        }
        self.cur = 0;
    }
}

impl Drop for TargetLocalState {
    fn drop(&mut self) {
        // Pages not claimed by an extract go back to the pool.
        for writer in &mut self.writers {
            for &page in writer.pages_mut().iter() {
                page_pool::free_page(page);
            }
            writer.pages_mut().clear();
        }
    }
}

/// Either a produced column or a constant to replicate.
pub enum OutputColumn {
    Writer(usize),
    Constant(DataType, u64),
}

pub struct TableTarget {
    local_state_refs: AtomicPtr<TargetLocalState>,
    locals: Vec<Box<TargetLocalState>>,
    types: Vec<DataType>,
}

unsafe impl Send for TableTarget {}
unsafe impl Sync for TableTarget {}

impl TableTarget {
    pub fn new(types: Vec<DataType>) -> TableTarget {
        TableTarget { local_state_refs: AtomicPtr::new(std::ptr::null_mut()), locals: Vec::new(), types }
    }

    /// Create and register a local state for one worker.
    pub fn make_local_state(&self) -> Box<TargetLocalState> {
        let writers: Vec<Box<dyn ColumnWriter>> =
            self.types.iter().map(|&t| make_writer(t)).collect();
        let mut state = Box::new(TargetLocalState {
            cur: 0,
            num_rows: 0,
            writers,
            buffer: vec![0u64; (1 + self.types.len()) * BUFFER_COUNT],
            next: std::ptr::null_mut(),
        });
        state.next = self.local_state_refs.swap(&mut *state, Ordering::AcqRel);
        state
    }

    /// Buffer one tuple.
    #[inline]
    pub fn consume(&self, ls: &mut TargetLocalState, multiplicity: u64, attrs: &[u64]) {
        debug_assert_eq!(attrs.len(), ls.writers.len());
        let cur = ls.cur;
        ls.buffer[cur] = multiplicity;
        for (i, &attr) in attrs.iter().enumerate() {
            ls.buffer[(i + 1) * BUFFER_COUNT + cur] = attr;
        }
        ls.cur += 1;
        if ls.cur == BUFFER_COUNT {
            ls.flush_buffers();
        }
    }

    /// Flush a worker's buffered tuples and seal its open pages.
    pub fn finalize(&self, ls: &mut TargetLocalState) {
        ls.flush_buffers();
        for writer in &mut ls.writers {
            writer.flush();
        }
    }

    /// Adopt the registered local states; must run after all workers have
    /// settled.
    pub fn finish_consume(&mut self, states: Vec<Box<TargetLocalState>>) {
        self.locals = states;
        // Keep only states that actually registered.
        let mut seen: Vec<*mut TargetLocalState> = Vec::new();
        let mut current = self.local_state_refs.load(Ordering::Acquire);
        while !current.is_null() {
            seen.push(current);
            current = unsafe { (*current).next };
        }
        debug_assert_eq!(seen.len(), self.locals.len());
    }

    fn total_rows(&self) -> usize {
        self.locals.iter().map(|ls| ls.num_rows).sum()
    }

    /// Gather all writer pages into a result table without copying.
    pub fn extract(&mut self) -> ColumnarTable {
        let mut result = ColumnarTable { num_rows: self.total_rows(), columns: Vec::new() };
        for (i, &data_type) in self.types.iter().enumerate() {
            let mut column = Column::new(data_type);
            for state in &mut self.locals {
                column.pages.append(state.writers[i].pages_mut());
            }
            result.columns.push(column);
        }
        result
    }

    /// Assemble the final output: produced columns in the requested order,
    /// constants expanded to full columns, duplicate references deep-
    /// copied after the first use.
    pub fn prepare_and_extract(&mut self, columns: &[OutputColumn]) -> ColumnarTable {
        let num_rows = self.total_rows();
        let mut result = ColumnarTable { num_rows, columns: Vec::new() };
        let writer_count = self.types.len();
        let mut writer_used: Vec<Option<usize>> = vec![None; writer_count];

        for (col_index, column) in columns.iter().enumerate() {
            match column {
                OutputColumn::Writer(idx) => {
                    let idx = *idx;
                    let mut out = Column::new(self.types[idx]);
                    match writer_used[idx] {
                        None => {
                            for state in &mut self.locals {
                                out.pages.append(state.writers[idx].pages_mut());
                            }
                            writer_used[idx] = Some(col_index);
                        }
                        Some(first) => {
                            // Same source feeding a second output column:
                            // the pages must be deep-copied.
                            let source: Vec<*mut Page> = result.columns[first].pages.clone();
                            for src in source {
                                let page = page_pool::allocate_page();
                                unsafe {
                                    std::ptr::copy_nonoverlapping(
                                        (*src).bytes().as_ptr(),
                                        (*page).bytes_mut().as_mut_ptr(),
                                        PAGE_SIZE,
                                    );
                                }
                                out.pages.push(page);
                            }
                        }
                    }
                    result.columns.push(out);
                }
                OutputColumn::Constant(data_type, value) => {
                    let mut out = Column::new(*data_type);
                    if num_rows > 0 {
                        let mut writer = make_writer(*data_type);
                        writer.step_many(*value, num_rows);
                        writer.flush();
                        out.pages.append(writer.pages_mut());
                    }
                    result.columns.push(out);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NULL_VALUE;
    use crate::query::plan::{to_rows, Data};

    fn collect(target: &mut TableTarget, rows: &[(u64, Vec<u64>)]) {
        let mut ls = target.make_local_state();
        for (mult, attrs) in rows {
            target.consume(&mut ls, *mult, attrs);
        }
        target.finalize(&mut ls);
        target.finish_consume(vec![ls]);
    }

    #[test]
    fn test_int_column_output() {
        let mut target = TableTarget::new(vec![DataType::Int32, DataType::Int64]);
        collect(
            &mut target,
            &[(1, vec![1, 100]), (1, vec![NULL_VALUE, 200]), (2, vec![3, NULL_VALUE])],
        );
        let table = target.extract();
        assert_eq!(table.num_rows, 4);
        let rows = to_rows(&table);
        assert_eq!(rows[0], vec![Data::Int32(1), Data::Int64(100)]);
        assert_eq!(rows[1], vec![Data::Null, Data::Int64(200)]);
        assert_eq!(rows[2], vec![Data::Int32(3), Data::Null]);
        assert_eq!(rows[3], vec![Data::Int32(3), Data::Null]);
    }

    #[test]
    fn test_page_overflow() {
        let mut target = TableTarget::new(vec![DataType::Int32]);
        let rows: Vec<(u64, Vec<u64>)> = (0..5000).map(|i| (1, vec![i])).collect();
        collect(&mut target, &rows);
        let table = target.extract();
        assert_eq!(table.num_rows, 5000);
        assert!(table.columns[0].pages.len() > 1);
        let back = to_rows(&table);
        assert_eq!(back[4999], vec![Data::Int32(4999)]);
    }

    #[test]
    fn test_varchar_output() {
        let mut target = TableTarget::new(vec![DataType::Varchar]);
        let hello = StringPtr::from_str_bytes(b"hello").as_bits();
        let tiny = StringPtr::from_str_bytes(b"ab").as_bits();
        collect(&mut target, &[(1, vec![hello]), (1, vec![NULL_VALUE]), (3, vec![tiny])]);
        let table = target.extract();
        let rows = to_rows(&table);
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0], vec![Data::Str("hello".into())]);
        assert_eq!(rows[1], vec![Data::Null]);
        for r in &rows[2..] {
            assert_eq!(*r, vec![Data::Str("ab".into())]);
        }
    }

    #[test]
    fn test_constant_and_duplicate_columns() {
        let mut target = TableTarget::new(vec![DataType::Int32]);
        collect(&mut target, &[(1, vec![7]), (1, vec![8])]);
        let table = target.prepare_and_extract(&[
            OutputColumn::Writer(0),
            OutputColumn::Constant(DataType::Int32, 42),
            OutputColumn::Writer(0),
        ]);
        let rows = to_rows(&table);
        assert_eq!(rows[0], vec![Data::Int32(7), Data::Int32(42), Data::Int32(7)]);
        assert_eq!(rows[1], vec![Data::Int32(8), Data::Int32(42), Data::Int32(8)]);
    }

    #[test]
    fn test_bulk_string_expansion() {
        // step_many with a large count crosses page boundaries and uses the
        // page-duplication fast path.
        let mut target = TableTarget::new(vec![DataType::Varchar]);
        let value = StringPtr::from_str_bytes(b"repeated-string-value").as_bits();
        collect(&mut target, &[(20_000, vec![value])]);
        let table = target.extract();
        assert_eq!(table.num_rows, 20_000);
        let rows = to_rows(&table);
        assert!(rows.iter().all(|r| *r == vec![Data::Str("repeated-string-value".into())]));
    }
}
