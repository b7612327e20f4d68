//! Minimal terminal that gathers produced values into a vector; used by
//! singleton elimination to pull the single surviving row of a relation.

use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::Result;
use crate::scan::TableScan;

pub struct CollectorLocalState {
    values: Vec<u64>,
    next: *mut CollectorLocalState,
}

unsafe impl Send for CollectorLocalState {}

pub struct CollectorTarget {
    local_state_refs: AtomicPtr<CollectorLocalState>,
    pub values: Vec<u64>,
}

unsafe impl Send for CollectorTarget {}
unsafe impl Sync for CollectorTarget {}

impl CollectorTarget {
    pub fn new() -> CollectorTarget {
        CollectorTarget {
            local_state_refs: AtomicPtr::new(std::ptr::null_mut()),
            values: Vec::new(),
        }
    }

    pub fn make_local_state(&self) -> Box<CollectorLocalState> {
        let mut state =
            Box::new(CollectorLocalState { values: Vec::new(), next: std::ptr::null_mut() });
        state.next = self.local_state_refs.swap(&mut *state, Ordering::AcqRel);
        state
    }

    #[inline]
    pub fn consume(&self, ls: &mut CollectorLocalState, multiplicity: u64, attrs: &[u64]) {
        for _ in 0..multiplicity {
            ls.values.extend_from_slice(attrs);
        }
    }

    pub fn finish_consume(&mut self, states: Vec<Box<CollectorLocalState>>) {
        for state in states {
            self.values.extend_from_slice(&state.values);
        }
    }

    /// Run a scan straight into this collector.
    pub fn collect(&mut self, scan: &TableScan) -> Result<()> {
        use crate::pipeline::join_pipeline::{JoinPipeline, PipelineTarget, Source, TargetStates};

        let cols = scan.produced_columns();
        let attr_sources: Vec<Source> =
            (0..cols as u32).map(|offset| Source { op: 0, offset }).collect();
        let pipeline =
            JoinPipeline::new(scan, Vec::new(), attr_sources, PipelineTarget::Collector(&*self));
        let states = pipeline.execute()?;
        if let TargetStates::Collector(states) = states {
            self.finish_consume(states);
        }
        Ok(())
    }
}

impl Default for CollectorTarget {
    fn default() -> Self {
        Self::new()
    }
}
