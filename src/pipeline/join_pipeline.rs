//! Runtime-composed join pipeline: one scan, a chain of hash-table
//! probes, and a terminal target.
//!
//! Operator wiring is data, not code: each probe key and each output
//! attribute names its source as `(op, offset)`, where op 0 is the scan
//! and op i > 0 is the tuple matched by probe i. Tuples flow one at a
//! time through the probe chain; multiplicities multiply along the way
//! and the target sees the product.

use std::cell::UnsafeCell;
use std::sync::Arc;

use crossbeam::utils::CachePadded;

use crate::error::Result;
use crate::join::hash_table::{
    BuildLocalState, Hashtable, HashtableBuild, ENTRY_KEY, ENTRY_MULT, ENTRY_NEXT,
};
use crate::pipeline::collector::{CollectorLocalState, CollectorTarget};
use crate::pipeline::table_target::{TableTarget, TargetLocalState};
use crate::scan::table_scan::{TableScan, BUFFER_COUNT};
use crate::scheduler;

/// Where a pipeline value comes from: op 0 is the scan, op i > 0 the
/// tuple matched by probe i; `offset` indexes the producer's columns
/// (for probes, 0 is the join key).
#[derive(Debug, Clone, Copy)]
pub struct Source {
    pub op: u32,
    pub offset: u32,
}

pub enum PipelineTarget<'a> {
    Build(&'a HashtableBuild),
    Table(&'a TableTarget),
    Collector(&'a CollectorTarget),
}

/// Target-side local states handed back to the owner after the run.
pub enum TargetStates {
    Build,
    Table(Vec<Box<TargetLocalState>>),
    Collector(Vec<Box<CollectorLocalState>>),
}

struct LocalState {
    build: Option<BuildLocalState>,
    table: Option<Box<TargetLocalState>>,
    collector: Option<Box<CollectorLocalState>>,
}

struct Slab(Vec<CachePadded<UnsafeCell<Option<LocalState>>>>);

unsafe impl Sync for Slab {}

/// Upper bound on output attributes of a single pipeline.
const MAX_ATTRS: usize = 64;

pub struct JoinPipeline<'a> {
    scan: &'a TableScan,
    probes: Vec<(Arc<Hashtable>, Source)>,
    attr_sources: Vec<Source>,
    target: PipelineTarget<'a>,
    locals: Slab,
}

impl<'a> JoinPipeline<'a> {
    pub fn new(
        scan: &'a TableScan,
        probes: Vec<(Arc<Hashtable>, Source)>,
        attr_sources: Vec<Source>,
        target: PipelineTarget<'a>,
    ) -> JoinPipeline<'a> {
        debug_assert!(attr_sources.len() <= MAX_ATTRS);
        let workers = if scan.concurrency() == 1 { 1 } else { scheduler::concurrency() };
        let locals = Slab((0..workers).map(|_| CachePadded::new(UnsafeCell::new(None))).collect());
        JoinPipeline { scan, probes, attr_sources, target, locals }
    }

    /// Value addressed by `source` for the current tuple.
    #[inline(always)]
    unsafe fn value_of(&self, source: Source, row: *const u64, matched: &[*const u64]) -> u64 {
        if source.op == 0 {
            *row.add(source.offset as usize * BUFFER_COUNT)
        } else {
            *matched[source.op as usize - 1].add(ENTRY_KEY + source.offset as usize)
        }
    }

    #[inline(always)]
    fn emit(&self, ls: &mut LocalState, multiplicity: u64, row: *const u64, matched: &[*const u64]) {
        let mut attrs = [0u64; MAX_ATTRS];
        let count = self.attr_sources.len();
        for (i, &source) in self.attr_sources.iter().enumerate() {
            attrs[i] = unsafe { self.value_of(source, row, matched) };
        }
        match &self.target {
            PipelineTarget::Build(build) => {
                // The first output attribute is the build key.
                build.consume(
                    ls.build.as_mut().unwrap(),
                    multiplicity,
                    attrs[0],
                    &attrs[1..count],
                );
            }
            PipelineTarget::Table(table) => {
                table.consume(ls.table.as_mut().unwrap(), multiplicity, &attrs[..count]);
            }
            PipelineTarget::Collector(collector) => {
                collector.consume(ls.collector.as_mut().unwrap(), multiplicity, &attrs[..count]);
            }
        }
    }

    fn walk(
        &self,
        ls: &mut LocalState,
        probe_index: usize,
        multiplicity: u64,
        row: *const u64,
        matched: &mut [*const u64],
    ) {
        if probe_index == self.probes.len() {
            self.emit(ls, multiplicity, row, matched);
            return;
        }
        let (ht, key_source) = &self.probes[probe_index];
        let key = unsafe { self.value_of(*key_source, row, matched) };
        let mut current = ht.bucket_head(key);
        while !current.is_null() {
            unsafe {
                if *current.add(ENTRY_KEY) == key {
                    matched[probe_index] = current;
                    let mult = multiplicity * *current.add(ENTRY_MULT);
                    self.walk(ls, probe_index + 1, mult, row, matched);
                }
                current = *current.add(ENTRY_NEXT) as *const u64;
            }
        }
    }

    fn consume_batch(&self, worker_id: usize, values: *const u64, count: usize) {
        let ls = unsafe { &mut *self.locals.0[worker_id].get() };
        let ls = ls.as_mut().expect("pipeline local state initialized");
        let mut matched = [std::ptr::null::<u64>(); MAX_ATTRS];
        for i in 0..count {
            if let Some((ht, _)) = self.probes.first() {
                // Prefetch one tuple ahead; the trailing buffer slack makes
                // the read past the last tuple harmless.
                ht.prefetch(unsafe { *values.add(i + 1) });
            }
            let row = unsafe { values.add(i) };
            self.walk(ls, 0, 1, row, &mut matched);
        }
    }

    fn init_local(&self, worker_id: usize) {
        let mut state =
            LocalState { build: None, table: None, collector: None };
        match &self.target {
            PipelineTarget::Build(build) => state.build = Some(BuildLocalState::new(build)),
            PipelineTarget::Table(table) => state.table = Some(table.make_local_state()),
            PipelineTarget::Collector(collector) => {
                state.collector = Some(collector.make_local_state())
            }
        }
        let slot = unsafe { &mut *self.locals.0[worker_id].get() };
        *slot = Some(state);
        // Build states register once their address is final.
        if let PipelineTarget::Build(build) = &self.target {
            slot.as_mut().unwrap().build.as_mut().unwrap().register(build);
        }
    }

    fn finalize_local(&self, worker_id: usize) {
        let slot = unsafe { &mut *self.locals.0[worker_id].get() };
        let Some(state) = slot.as_mut() else { return };
        if let (PipelineTarget::Table(table), Some(ls)) = (&self.target, state.table.as_mut()) {
            table.finalize(ls);
        }
    }

    /// Run the scan through the probe chain into the target, then hand
    /// back the per-worker target states (and finish hash-table builds).
    pub fn execute(self) -> Result<TargetStates> {
        self.scan.produce(
            &|worker_id, values, count| self.consume_batch(worker_id, values, count),
            &|worker_id, is_init| {
                if is_init {
                    self.init_local(worker_id);
                } else {
                    self.finalize_local(worker_id);
                }
            },
        )?;

        // All workers have settled. For a build the registered local
        // states must stay put until the tuples are installed.
        if let PipelineTarget::Build(build) = &self.target {
            build.finish_consume()?;
        }

        let mut tables = Vec::new();
        let mut collectors = Vec::new();
        for slot in &self.locals.0 {
            let slot = unsafe { &mut *slot.get() };
            if let Some(mut state) = slot.take() {
                if let Some(table) = state.table.take() {
                    tables.push(table);
                }
                if let Some(collector) = state.collector.take() {
                    collectors.push(collector);
                }
            }
        }

        match self.target {
            PipelineTarget::Build(_) => Ok(TargetStates::Build),
            PipelineTarget::Table(_) => Ok(TargetStates::Table(tables)),
            PipelineTarget::Collector(_) => Ok(TargetStates::Collector(collectors)),
        }
    }
}
