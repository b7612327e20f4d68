//! Stateful column readers positioned by (page, in-page row, non-null
//! index).
//!
//! `skip_to` repositions in O(log pages) through the column's prefix sums
//! and recovers the non-null index by popcounting the null bitmap prefix.
//! `step64` emits up to 64 rows into the scan buffer, translating between
//! the raw-row and dense-value bit domains with pext/pdep.

use std::sync::Arc;

use crate::common::bits::{pdep, pext};
use crate::filter::RestrictionLogic;
use crate::storage::column::{ColumnInfo, DataType};
use crate::storage::copy;
use crate::storage::page::Page;
use crate::storage::string_ptr::StringPtr;

#[derive(Clone, Copy, PartialEq, Eq)]
enum ReaderKind {
    Int32,
    Int64,
    Varchar,
}

pub struct Reader {
    column: Arc<ColumnInfo>,
    kind: ReaderKind,
    /// Current page index.
    cur: usize,
    pub row_id: u64,
    pub tuple_index: usize,
    pub non_null_index: usize,
}

/// Load 8 bytes, clamped so the read never crosses `end`; the result keeps
/// the bytes starting at `bits` in its low end.
#[inline]
unsafe fn load64_bounded(bits: *const u8, end: *const u8) -> u64 {
    if bits.add(8) <= end {
        bits.cast::<u64>().read_unaligned()
    } else {
        let avail = end.offset_from(bits) as usize;
        debug_assert!(avail <= 7);
        let value = end.sub(8).cast::<u64>().read_unaligned();
        value >> ((64 - avail * 8) & 63)
    }
}

impl Reader {
    pub fn new(column: Arc<ColumnInfo>) -> Reader {
        let kind = match column.data_type {
            DataType::Int32 => ReaderKind::Int32,
            DataType::Int64 | DataType::Fp64 => ReaderKind::Int64,
            DataType::Varchar => ReaderKind::Varchar,
        };
        Reader { column, kind, cur: 0, row_id: 0, tuple_index: 0, non_null_index: 0 }
    }

    #[inline]
    pub fn done(&self) -> bool {
        self.cur == self.column.pages.len()
    }

    #[inline]
    pub fn page(&self) -> &Page {
        self.column.pages[self.cur].get()
    }

    /// Skip over leading empty pages.
    #[inline]
    pub fn skip_empty_pages(&mut self) {
        while !self.done() && self.page().num_rows() == 0 {
            self.cur += 1;
        }
    }

    /// Rows left on the current page.
    #[inline]
    pub fn page_remainder(&self) -> usize {
        self.page().contained_rows() - self.tuple_index
    }

    /// First page index whose cumulative offset covers `requested`.
    fn exponential_search(offsets: &[u32], requested: u32) -> usize {
        if requested == 0 {
            debug_assert_eq!(offsets[0], 0);
            return 0;
        }
        debug_assert!(requested >= offsets[0]);
        debug_assert!(requested < *offsets.last().unwrap());
        let n = offsets.len();
        let mut jump = 1;
        while jump < n && offsets[jump] <= requested {
            jump *= 2;
        }
        let lo = jump / 2;
        let hi = jump.min(n);
        let pos = lo + offsets[lo..hi].partition_point(|&v| v <= requested) - 1;
        debug_assert!(offsets[pos] <= requested);
        debug_assert!(offsets[pos + 1] > requested);
        pos
    }

    /// Reposition to an absolute row id.
    pub fn skip_to(&mut self, requested: u64) {
        if requested == self.row_id {
            return;
        }
        let search_base = if requested < self.row_id { 0 } else { self.cur };
        self.tuple_index = 0;
        self.non_null_index = 0;
        let offsets = &self.column.page_offsets[search_base..];
        let pos = search_base + Self::exponential_search(offsets, requested as u32);
        self.cur = pos;
        self.row_id = self.column.page_offsets[pos] as u64;

        debug_assert!(self.row_id <= requested);
        debug_assert!(self.row_id + self.page().contained_rows() as u64 > requested);
        self.tuple_index = (requested - self.row_id) as usize;
        if self.page().has_no_nulls() {
            self.non_null_index = self.tuple_index;
        } else {
            // Count non-null bits below tuple_index.
            let mut remaining = self.tuple_index;
            let mut bits = self.page().nulls().as_ptr();
            let mut non_null = 0usize;
            unsafe {
                while remaining >= 8 {
                    non_null += (*bits).count_ones() as usize;
                    bits = bits.add(1);
                    remaining -= 8;
                }
                if remaining > 0 {
                    non_null += (*bits & ((1u8 << remaining) - 1)).count_ones() as usize;
                }
            }
            debug_assert!(non_null <= self.tuple_index);
            self.non_null_index = non_null;
        }
        self.row_id = requested;
    }

    /// Not-null bits for the 64 rows from the current position; all-ones
    /// on pages without nulls.
    #[inline]
    pub fn next_not_nulls(&self) -> u64 {
        let page = self.page();
        if page.has_no_nulls() {
            return u64::MAX;
        }
        unsafe {
            let base = page.nulls().as_ptr().add(self.tuple_index / 8);
            let shift = self.tuple_index % 8;
            (load64_bounded(base.add(1), page.end_ptr()) << (8 - shift)) | ((*base as u64) >> shift)
        }
    }

    /// Advance without emitting values.
    pub fn skip_many(&mut self, mut num_tuples: usize) {
        if num_tuples == 0 {
            return;
        }
        self.row_id += num_tuples as u64;
        if self.page().is_long_string_start() {
            debug_assert!(num_tuples <= 1);
            self.cur += 1;
            while !self.done() && self.page().is_long_string_continuation() {
                self.cur += 1;
            }
            self.tuple_index = 0;
            self.non_null_index = 0;
            return;
        }
        debug_assert!(num_tuples <= self.page().num_rows() as usize - self.tuple_index);
        if self.page().has_no_nulls() {
            self.non_null_index += num_tuples;
            self.tuple_index += num_tuples;
        } else {
            while num_tuples >= 64 {
                let not_nulls = self.next_not_nulls();
                self.non_null_index += not_nulls.count_ones() as usize;
                self.tuple_index += 64;
                num_tuples -= 64;
            }
            if num_tuples > 0 {
                let not_nulls = self.next_not_nulls();
                self.non_null_index +=
                    (not_nulls & (u64::MAX >> (64 - num_tuples))).count_ones() as usize;
                self.tuple_index += num_tuples;
            }
        }
        if self.tuple_index == self.page().num_rows() as usize {
            self.cur += 1;
            self.tuple_index = 0;
            self.non_null_index = 0;
        }
    }

    /// Emit exactly the rows selected by `matches` (within the next
    /// `num_tuples` rows, ≤ 64) into `target`; unmatched slots become the
    /// null marker. For VARCHAR the emitted value is a packed string
    /// pointer.
    pub fn step64(&mut self, target: *mut u64, matches: u64, num_tuples: usize) {
        if num_tuples == 0 {
            return;
        }
        debug_assert!(!self.done());
        debug_assert!(num_tuples <= self.page().num_rows() as usize - self.tuple_index);

        if self.kind == ReaderKind::Varchar && self.page().is_long_string_start() {
            debug_assert!(matches <= 1);
            debug_assert!(num_tuples <= 1);
            let start = self.cur;
            self.cur += 1;
            while !self.done() && self.page().is_long_string_continuation() {
                self.cur += 1;
            }
            let pages = &self.column.pages[start..self.cur];
            let value = StringPtr::from_long(pages.as_ptr(), pages.len()).as_bits();
            self.tuple_index = 0;
            self.non_null_index = 0;
            if matches != 0 {
                unsafe { *target = value };
            }
            self.row_id += 1;
            return;
        }

        let not_nulls = self.next_not_nulls();
        let mut src_offsets = pext(matches & not_nulls, not_nulls);
        let mut dst_offsets = pext(matches & not_nulls, matches);

        let page = self.page();
        unsafe {
            match self.kind {
                ReaderKind::Int32 => {
                    let data = page.values_ptr::<u32>().add(self.non_null_index);
                    copy::extract_int32(target, data, src_offsets, dst_offsets, num_tuples);
                }
                ReaderKind::Int64 => {
                    let data = page.values_ptr::<u64>().add(self.non_null_index);
                    copy::extract_int64(target, data, src_offsets, dst_offsets, num_tuples);
                }
                ReaderKind::Varchar => {
                    let data = page.values_ptr::<u16>().add(self.non_null_index);
                    let string_head = page.strings_ptr();
                    // The page-leading string has no predecessor offset;
                    // emit it separately.
                    let read_first = self.non_null_index == 0 && (src_offsets & 1) != 0;
                    let mut dst_pos = 0;
                    if read_first {
                        src_offsets -= 1;
                        dst_pos = dst_offsets.trailing_zeros() as usize;
                        dst_offsets -= 1 << dst_pos;
                    }
                    copy::extract_varchar(
                        target,
                        data,
                        src_offsets,
                        dst_offsets,
                        num_tuples,
                        string_head,
                    );
                    if read_first {
                        let len = data.read_unaligned() as usize;
                        *target.add(dst_pos) = StringPtr::from_short(string_head, len).as_bits();
                    }
                }
            }
        }

        let non_null_advance = if page.has_no_nulls() {
            num_tuples
        } else {
            (not_nulls & (u64::MAX >> (64 - num_tuples))).count_ones() as usize
        };
        self.row_id += num_tuples as u64;
        self.tuple_index += num_tuples;
        self.non_null_index += non_null_advance;
        if self.tuple_index == self.page().num_rows() as usize {
            self.cur += 1;
            self.tuple_index = 0;
            self.non_null_index = 0;
        }
    }
}

/// A reader with a compiled restriction attached; drives the scan's
/// filtering.
pub struct RestrictedReader {
    pub reader: Reader,
    /// `None` means not-null only.
    restriction: Option<Arc<RestrictionLogic>>,
    pub selectivity: f64,
}

impl RestrictedReader {
    pub fn new(
        column: Arc<ColumnInfo>,
        restriction: Arc<RestrictionLogic>,
        selectivity: f64,
    ) -> RestrictedReader {
        let restriction = match *restriction {
            RestrictionLogic::NotNull => None,
            _ => Some(restriction),
        };
        RestrictedReader { reader: Reader::new(column), restriction, selectivity }
    }

    /// Refine an existing 64-row mask by this restriction.
    pub fn peek64(&mut self, existing_mask: u64, num_tuples: usize) -> u64 {
        debug_assert!(num_tuples != 0);
        debug_assert!(num_tuples <= self.reader.page().num_rows() as usize - self.reader.tuple_index);

        let Some(restriction) = &self.restriction else {
            return if self.reader.page().has_no_nulls() {
                existing_mask
            } else {
                existing_mask & self.reader.next_not_nulls()
            };
        };

        let not_nulls = self.reader.next_not_nulls();
        let mask = existing_mask & not_nulls;
        if mask == 0 {
            return 0;
        }
        let src_offsets = pext(mask, not_nulls);
        unsafe {
            let values = self.reader.page().values_ptr::<u32>().add(self.reader.non_null_index);
            let new_mask = restriction.run(values, src_offsets);
            mask & pdep(new_mask, not_nulls)
        }
    }

    /// Scan forward up to `num_tuples` rows for the first 64-row window
    /// with a match, consuming nulls and mismatches. Returns the window
    /// mask and the rows skipped; `(0, num_tuples)` when nothing matches.
    pub fn peek_first(&mut self, num_tuples: usize) -> (u64, usize) {
        debug_assert!(!self.reader.done());
        debug_assert!(num_tuples != 0);
        debug_assert!(num_tuples <= self.reader.page().num_rows() as usize - self.reader.tuple_index);

        if self.reader.page().has_no_nulls() {
            let Some(restriction) = &self.restriction else {
                return (u64::MAX >> (64 - num_tuples.min(64)), 0);
            };
            unsafe {
                let values =
                    self.reader.page().values_ptr::<u32>().add(self.reader.non_null_index);
                let (mask, skipped) = restriction.run_and_skip(values, num_tuples);
                debug_assert!(skipped <= num_tuples);
                self.reader.tuple_index += skipped;
                self.reader.non_null_index += skipped;
                self.reader.row_id += skipped as u64;
                if mask != 0 {
                    return (mask, skipped);
                }
            }
        } else {
            let mut skipped = 0usize;
            while skipped < num_tuples {
                debug_assert!(self.reader.tuple_index < self.reader.page().num_rows() as usize);
                let step = (num_tuples - skipped).min(64);
                let not_nulls = self.reader.next_not_nulls();
                let mut mask = not_nulls & (u64::MAX >> (64 - step));
                let not_null_count = mask.count_ones() as usize;
                if not_null_count > 0 {
                    if let Some(restriction) = &self.restriction {
                        unsafe {
                            let values = self
                                .reader
                                .page()
                                .values_ptr::<u32>()
                                .add(self.reader.non_null_index);
                            let new_mask = restriction.run_dense(values, not_null_count);
                            mask = pdep(new_mask, not_nulls);
                        }
                    }
                }
                if mask != 0 {
                    return (mask, skipped);
                }
                skipped += step;
                self.reader.tuple_index += step;
                self.reader.non_null_index += not_null_count;
                self.reader.row_id += step as u64;
            }
        }
        if self.reader.tuple_index == self.reader.page().num_rows() as usize {
            self.reader.cur += 1;
            self.reader.tuple_index = 0;
            self.reader.non_null_index = 0;
        }
        (0, num_tuples)
    }
}
