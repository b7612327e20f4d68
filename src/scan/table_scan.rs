//! Morselized, predicate-pushdown table scan.
//!
//! Each worker owns a set of readers over the scanned columns. Per
//! morsel, the strongest restriction hunts for a matching 64-row window
//! (`peek_first`), the remaining restrictions refine the window mask
//! (`peek64`), and the output readers then emit exactly the surviving
//! rows into a per-worker tuple buffer. Full buffers flush through the
//! pipeline's per-batch callback.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::common::NULL_VALUE;
use crate::config::Selectivities;
use crate::error::Result;
use crate::filter::RestrictionLogic;
use crate::scan::reader::{Reader, RestrictedReader};
use crate::scheduler::{self, MORSEL_FINI, MORSEL_INIT};
use crate::storage::column::TableInfo;

/// Tuples buffered per column before flushing to the pipeline.
pub const BUFFER_COUNT: usize = 128;

const NULL32: u32 = u32::MAX;

/// A restriction bound to a column of the scanned table.
#[derive(Clone)]
pub struct RestrictionInfo {
    pub column: u32,
    pub selectivity: f64,
    pub restriction: Arc<RestrictionLogic>,
}

struct ReaderDef {
    column: u32,
    info: Option<RestrictionInfo>,
}

enum AnyReader {
    Plain(Reader),
    Restricted(RestrictedReader),
}

impl AnyReader {
    #[inline]
    fn reader(&mut self) -> &mut Reader {
        match self {
            AnyReader::Plain(r) => r,
            AnyReader::Restricted(r) => &mut r.reader,
        }
    }
}

/// Per-worker scan state.
pub struct ScanLocalState {
    readers: Vec<AnyReader>,
    non_output: Vec<RestrictedReader>,
    /// Restriction evaluation order: (is_output, index).
    restricted: Vec<(bool, usize)>,
    values: Vec<u64>,
    value_index: usize,
}

impl ScanLocalState {
    fn new(scan: &TableScan) -> ScanLocalState {
        let mut readers = Vec::with_capacity(scan.reader_defs.len());
        for def in &scan.reader_defs {
            let column = scan.table.columns[def.column as usize].clone();
            match &def.info {
                Some(info) => readers.push(AnyReader::Restricted(RestrictedReader::new(
                    column,
                    info.restriction.clone(),
                    info.selectivity,
                ))),
                None => readers.push(AnyReader::Plain(Reader::new(column))),
            }
        }
        let mut non_output = Vec::with_capacity(scan.non_output_reader_defs.len());
        for def in &scan.non_output_reader_defs {
            let info = def.info.as_ref().unwrap();
            let column = scan.table.columns[def.column as usize].clone();
            non_output.push(RestrictedReader::new(
                column,
                info.restriction.clone(),
                info.selectivity,
            ));
        }

        let has_constant = scan.produce_constant_column != NULL_VALUE;
        let mut values =
            vec![0u64; (readers.len() + usize::from(has_constant)) * BUFFER_COUNT + BUFFER_COUNT];
        if has_constant {
            for slot in values[readers.len() * BUFFER_COUNT..].iter_mut() {
                *slot = scan.produce_constant_column;
            }
        }

        ScanLocalState {
            readers,
            non_output,
            restricted: scan.restricted_defs.clone(),
            values,
            value_index: 0,
        }
    }

    #[inline]
    fn restricted_mut(&mut self, slot: usize) -> &mut RestrictedReader {
        let (is_output, index) = self.restricted[slot];
        if is_output {
            match &mut self.readers[index] {
                AnyReader::Restricted(r) => r,
                AnyReader::Plain(_) => unreachable!("restricted slot points at plain reader"),
            }
        } else {
            &mut self.non_output[index]
        }
    }

    /// Apply `f` to every reader, output and non-output alike.
    fn for_each_reader(&mut self, mut f: impl FnMut(&mut Reader)) {
        for reader in &mut self.readers {
            f(reader.reader());
        }
        for reader in &mut self.non_output {
            f(&mut reader.reader);
        }
    }
}

struct Slab(Vec<CachePadded<UnsafeCell<Option<ScanLocalState>>>>);

unsafe impl Sync for Slab {}

pub struct TableScan {
    table: TableInfo,
    reader_defs: Vec<ReaderDef>,
    non_output_reader_defs: Vec<ReaderDef>,
    restricted_defs: Vec<(bool, usize)>,
    morsel_end: u64,
    morsel_size: u64,
    /// When set, an extra trailing column holding this constant is
    /// produced (cross-product key).
    pub produce_constant_column: u64,
    local_states: Slab,
}

impl TableScan {
    pub fn new(
        table: TableInfo,
        cols: &[u32],
        restrictions: &[RestrictionInfo],
        mult: f64,
        selectivity: f64,
        defaults: &Selectivities,
    ) -> TableScan {
        let mut col_restrictions: HashMap<u32, RestrictionInfo> =
            restrictions.iter().map(|r| (r.column, r.clone())).collect();

        let mut reader_defs = Vec::with_capacity(cols.len());
        let mut restricted_defs = Vec::new();
        for &col in cols {
            let info = col_restrictions.remove(&col);
            if info.is_some() {
                restricted_defs.push((true, reader_defs.len()));
            }
            reader_defs.push(ReaderDef { column: col, info });
        }
        // Columns read only to apply their restriction.
        let mut non_output_reader_defs = Vec::new();
        for (col, info) in col_restrictions {
            restricted_defs.push((false, non_output_reader_defs.len()));
            non_output_reader_defs.push(ReaderDef { column: col, info: Some(info) });
        }

        // Strongest cheap filter first.
        let score = |slot: &(bool, usize)| -> (f64, f64) {
            let info = if slot.0 {
                reader_defs[slot.1].info.as_ref().unwrap()
            } else {
                non_output_reader_defs[slot.1].info.as_ref().unwrap()
            };
            (info.selectivity, info.restriction.estimate_cost())
        };
        restricted_defs.sort_by(|a, b| {
            let (mut asel, acost) = score(a);
            let (mut bsel, bcost) = score(b);
            if asel == bsel {
                let (ai, bi) = (a, b);
                let arest = if ai.0 {
                    &reader_defs[ai.1].info.as_ref().unwrap().restriction
                } else {
                    &non_output_reader_defs[ai.1].info.as_ref().unwrap().restriction
                };
                let brest = if bi.0 {
                    &reader_defs[bi.1].info.as_ref().unwrap().restriction
                } else {
                    &non_output_reader_defs[bi.1].info.as_ref().unwrap().restriction
                };
                asel = arest.estimate_selectivity(defaults);
                bsel = brest.estimate_selectivity(defaults);
            }
            let a_score = (1.0 - asel) / acost;
            let b_score = (1.0 - bsel) / bcost;
            b_score.partial_cmp(&a_score).unwrap_or(std::cmp::Ordering::Equal)
        });

        let first_column = if let Some(&(is_output, index)) = restricted_defs.first() {
            if is_output {
                reader_defs[index].column
            } else {
                non_output_reader_defs[index].column
            }
        } else {
            reader_defs.first().map(|def| def.column).unwrap_or(0)
        };

        // Morsel sizing: num_rows / concurrency clamped to [256, 4 pages],
        // shrunk when downstream multiplicity inflates the output.
        let morsel_end = table.num_rows;
        let first_pages = &table.columns[first_column as usize].pages;
        let page_rows = match first_pages.first() {
            Some(page) if page.get().contained_rows() > 0 => page.get().contained_rows() as u64,
            _ => 1984,
        };
        let mut morsel_size = table.num_rows / scheduler::concurrency() as u64;
        if morsel_size < 256 {
            morsel_size = 256;
        } else if morsel_size > page_rows {
            morsel_size = 4.min((morsel_size + page_rows - 1) / page_rows) * page_rows;
            if mult >= 2.0 && selectivity >= 0.1 && morsel_size > page_rows {
                morsel_size = (morsel_size / 2).max(page_rows);
                if mult >= 4.0 && morsel_size > page_rows {
                    morsel_size = (morsel_size / 2).max(page_rows);
                }
            }
            debug_assert!(morsel_size >= page_rows);
        }

        let slab = Slab(
            (0..scheduler::concurrency().max(1))
                .map(|_| CachePadded::new(UnsafeCell::new(None)))
                .collect(),
        );

        TableScan {
            table,
            reader_defs,
            non_output_reader_defs,
            restricted_defs,
            morsel_end,
            morsel_size,
            produce_constant_column: NULL_VALUE,
            local_states: slab,
        }
    }

    pub fn produced_columns(&self) -> usize {
        self.reader_defs.len()
    }

    pub fn table_name(&self) -> &str {
        let name = self.table.name.as_str();
        name.split('|').next().unwrap_or(name)
    }

    /// Workers this scan can meaningfully use.
    pub fn concurrency(&self) -> usize {
        if self.morsel_end <= self.morsel_size {
            1
        } else {
            scheduler::concurrency()
        }
    }

    fn morsel(&self, worker_id: usize, row0: u64, on_batch: &(dyn Fn(usize, *const u64, usize) + Sync)) {
        let ls = unsafe { &mut *self.local_states.0[worker_id].get() };
        let ls = ls.as_mut().expect("scan local state initialized");

        let mut row = row0;
        let end = (row0 + self.morsel_size).min(self.table.num_rows);

        ls.for_each_reader(|reader| reader.skip_to(row));

        while row < end {
            // Align all readers on the smallest per-page remainder.
            let mut max_tuples = (end - row) as usize;
            ls.for_each_reader(|reader| {
                reader.skip_empty_pages();
                let remainder = reader.page_remainder();
                debug_assert!(remainder > 0);
                max_tuples = max_tuples.min(remainder);
            });
            debug_assert!(max_tuples > 0);

            let mut mask = u64::MAX >> (64 - max_tuples.min(64));
            if !ls.restricted.is_empty() {
                let mut skipped = 0usize;
                while skipped < max_tuples {
                    let (first_mask, new_skipped) =
                        ls.restricted_mut(0).peek_first(max_tuples - skipped);
                    mask = first_mask;
                    skipped += new_skipped;

                    let count = (max_tuples - skipped).min(64);
                    if mask != 0 {
                        let primary_row = ls.restricted_mut(0).reader.row_id;
                        let mut rejected = false;
                        for r in 1..ls.restricted.len() {
                            {
                                let reader = ls.restricted_mut(r);
                                if reader.reader.row_id < primary_row {
                                    let delta = primary_row - reader.reader.row_id;
                                    reader.reader.skip_many(delta as usize);
                                }
                                mask = reader.peek64(mask, count);
                            }
                            if mask == 0 {
                                ls.restricted_mut(0).reader.skip_many(count);
                                rejected = true;
                                break;
                            }
                        }
                        if !rejected {
                            break;
                        }
                    }
                    skipped += count;
                }

                if skipped > 0 {
                    let primary_row = ls.restricted_mut(0).reader.row_id;
                    ls.for_each_reader(|reader| {
                        if reader.row_id < primary_row {
                            let delta = primary_row - reader.row_id;
                            reader.skip_many(delta as usize);
                        }
                    });
                    row += skipped as u64;
                    max_tuples -= skipped;
                }
            }

            let max_tuples = max_tuples.min(64);
            debug_assert!(mask == 0 || max_tuples > 0);
            if max_tuples > 0 {
                debug_assert!(mask != 0);
                let base = ls.value_index;
                let values_ptr = ls.values.as_mut_ptr();
                for (i, any) in ls.readers.iter_mut().enumerate() {
                    let reader = any.reader();
                    debug_assert_eq!(reader.row_id, row);
                    unsafe {
                        reader.step64(values_ptr.add(base + i * BUFFER_COUNT), mask, max_tuples);
                    }
                }
                for restricted in &mut ls.non_output {
                    debug_assert_eq!(restricted.reader.row_id, row);
                    restricted.reader.skip_many(max_tuples);
                }

                ls.value_index += mask.count_ones() as usize;
                if ls.value_index >= BUFFER_COUNT / 2 {
                    on_batch(worker_id, ls.values.as_ptr(), ls.value_index);
                    ls.value_index = 0;
                }
                row += max_tuples as u64;
            }
        }

        if ls.value_index > 0 {
            on_batch(worker_id, ls.values.as_ptr(), ls.value_index);
            ls.value_index = 0;
        }
    }

    /// Drive the scan: `on_batch(worker, values, count)` receives buffered
    /// tuples laid out column-major with stride `BUFFER_COUNT`;
    /// `lifecycle(worker, is_init)` brackets every participating worker.
    pub fn produce(
        &self,
        on_batch: &(dyn Fn(usize, *const u64, usize) + Sync),
        lifecycle: &(dyn Fn(usize, bool) + Sync),
    ) -> Result<()> {
        let logic = |worker_id: usize, row: u64| {
            if row == MORSEL_INIT {
                let slot = unsafe { &mut *self.local_states.0[worker_id].get() };
                *slot = Some(ScanLocalState::new(self));
                lifecycle(worker_id, true);
                return;
            }
            if row == MORSEL_FINI {
                let slot = unsafe { &mut *self.local_states.0[worker_id].get() };
                *slot = None;
                lifecycle(worker_id, false);
                return;
            }
            self.morsel(worker_id, row, on_batch);
        };
        if self.concurrency() <= 1 {
            logic(0, MORSEL_INIT);
            let mut row = 0;
            while row < self.morsel_end {
                logic(0, row);
                row += self.morsel_size;
            }
            logic(0, MORSEL_FINI);
            Ok(())
        } else {
            scheduler::parallel_morsel(0, self.morsel_end, self.morsel_size, true, &logic)
        }
    }

    /// Deterministic pseudorandom sample of the scanned columns, ≤
    /// `sample_size` rows, column-major; null rows yield the 32-bit null
    /// marker. Only meaningful for INT32 columns.
    pub fn create_unfiltered_sample(&self, sample_size: usize) -> Vec<u32> {
        debug_assert!(sample_size as u64 <= self.table.num_rows);
        if sample_size == 0 || self.reader_defs.is_empty() {
            return Vec::new();
        }
        let mut readers: Vec<Reader> = self
            .reader_defs
            .iter()
            .map(|def| Reader::new(self.table.columns[def.column as usize].clone()))
            .collect();

        let mut rng = StdRng::seed_from_u64(0);
        let mut row_ids: Vec<u64> =
            (0..sample_size).map(|_| rng.random_range(0..self.table.num_rows)).collect();
        row_ids.sort_unstable();

        let mut result = vec![0u32; sample_size * readers.len()];
        for (ind, &row_id) in row_ids.iter().enumerate() {
            for reader in readers.iter_mut() {
                reader.skip_to(row_id);
            }
            for (col, reader) in readers.iter().enumerate() {
                let page = reader.page();
                let is_null = page.is_null(reader.tuple_index);
                result[ind + col * sample_size] =
                    if is_null { NULL32 } else { page.value::<u32>(reader.non_null_index) };
            }
        }
        result
    }
}
