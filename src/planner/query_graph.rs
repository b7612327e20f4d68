//! Cost-based bushy join enumeration over the current inputs, followed by
//! extraction of the cheapest executable pipeline.
//!
//! DP state lives per (relation subset, pipeline count): the same subset
//! can be reached with 0..2 pipeline breaks and the cheapest plan per
//! bucket is kept. Join cost is `card + 10 * left.card`; cardinalities
//! use max-aggregation over the children. The pipeline pass then walks
//! the best tree and picks the cheapest linear spine: a scan leaf through
//! hash-table-leaf probes, ending either at the root (terminal) or at a
//! node that becomes a new hash table.

use std::cell::Cell;

use crate::common::BitSet;
use crate::planner::dpccp::{self, GraphView};

/// Equivalence-class id reserved for cross-product keys.
pub const CROSS_PRODUCT_EQ: u32 = 63;

/// "No join key": the input is a base table.
pub const NO_KEY: u32 = u32::MAX;

/// Pipeline-count buckets tracked per subset.
pub const MAX_PIPELINE_LENGTH: usize = 3;

/// One enumeration input: a base table or an already-built hash table.
#[derive(Debug, Clone)]
pub struct QgInput {
    pub produced_eq: BitSet,
    pub cardinality: f64,
    /// Expected output inflation when probing this table.
    pub multiplicity: f64,
    /// Join-key class for hash tables, `NO_KEY` for base tables.
    pub join_key: u32,
}

#[derive(Clone)]
struct PlanCell {
    eqs: Cell<BitSet>,
    neighborhood: Cell<BitSet>,
    /// -1 encodes "not reached yet".
    card: Cell<f64>,
    base_card: Cell<f64>,
    cost: Cell<f64>,
    left: Cell<Option<(u64, u8)>>,
    right: Cell<Option<(u64, u8)>>,
}

impl Default for PlanCell {
    fn default() -> Self {
        PlanCell {
            eqs: Cell::new(BitSet::new()),
            neighborhood: Cell::new(BitSet::new()),
            card: Cell::new(-1.0),
            base_card: Cell::new(0.0),
            cost: Cell::new(f64::INFINITY),
            left: Cell::new(None),
            right: Cell::new(None),
        }
    }
}

pub struct QueryGraph {
    pub inputs: Vec<QgInput>,
    plans: Vec<[PlanCell; MAX_PIPELINE_LENGTH]>,
}

impl GraphView for QueryGraph {
    fn neighborhood(&self, set: BitSet) -> BitSet {
        let cell = &self.plans[set.raw() as usize][0];
        if cell.eqs.get().is_empty() {
            let mut eqs = BitSet::new();
            for r in set {
                eqs += self.inputs[r as usize].produced_eq;
            }
            self.compute_neighborhood(set, eqs)
        } else {
            cell.neighborhood.get()
        }
    }

    fn connected(&self, set: BitSet) -> bool {
        let cells = &self.plans[set.raw() as usize];
        if cells[0].card.get() == -1.0 {
            return false;
        }
        cells.iter().any(|c| c.cost.get() < f64::INFINITY)
    }

    fn size(&self) -> u32 {
        self.inputs.len() as u32
    }
}

impl QueryGraph {
    pub fn new(inputs: Vec<QgInput>) -> QueryGraph {
        assert!(inputs.len() <= 24, "too many inputs for subset enumeration");
        let plans = vec![<[PlanCell; MAX_PIPELINE_LENGTH]>::default(); 1usize << inputs.len()];
        QueryGraph { inputs, plans }
    }

    #[inline]
    fn get(&self, set: BitSet, pipes: usize) -> &PlanCell {
        &self.plans[set.raw() as usize][pipes]
    }

    fn compute_neighborhood(&self, rels: BitSet, eqs: BitSet) -> BitSet {
        let mut result = BitSet::new();
        for (i, input) in self.inputs.iter().enumerate() {
            if eqs.intersects(input.produced_eq) {
                result.insert(i as u32);
            }
        }
        result - rels
    }

    fn compute_cost(card: f64, left_card: f64) -> f64 {
        let cost = card + left_card * 10.0;
        debug_assert!(cost.is_finite());
        cost
    }

    /// Max-aggregation cardinality model.
    fn combine_card(&self, target: &PlanCell, left: &PlanCell, right: &PlanCell) {
        let base = left.base_card.get().max(right.base_card.get());
        target.base_card.set(base);
        target.card.set(base);
    }

    /// A join of `left` into `right` is legal when they share a class, the
    /// right side is not itself a hash table, and a hash-table left side
    /// joins on its own key.
    fn can_join(&self, left: BitSet, right: BitSet) -> bool {
        let intersection = self.get(left, 0).eqs.get() & self.get(right, 0).eqs.get();
        if intersection.is_empty() {
            return false;
        }
        if right.is_single() && self.inputs[right.front() as usize].join_key != NO_KEY {
            return false;
        }
        if left.is_single() {
            let key = self.inputs[left.front() as usize].join_key;
            if key != NO_KEY {
                return intersection.contains(key);
            }
        }
        true
    }

    /// Account the plan that builds `left` and pipelines `right`.
    fn consider(&self, left: BitSet, right: BitSet) {
        let total = left + right;
        let base_cost =
            Self::compute_cost(self.get(total, 0).card.get(), self.get(left, 0).card.get());
        for right_pipes in 0..MAX_PIPELINE_LENGTH - 1 {
            let right_plan = self.get(right, right_pipes);
            let target = self.get(total, right_pipes + 1);
            if right_plan.cost.get() >= target.cost.get() {
                continue;
            }
            let bound = target.cost.get() - (right_plan.cost.get() + base_cost);
            for left_pipes in 0..MAX_PIPELINE_LENGTH {
                let left_plan = self.get(left, left_pipes);
                if left_plan.cost.get() < bound {
                    let cost = left_plan.cost.get() + right_plan.cost.get() + base_cost;
                    debug_assert!(cost.is_finite());
                    target.cost.set(cost);
                    target.left.set(Some((left.raw(), left_pipes as u8)));
                    target.right.set(Some((right.raw(), right_pipes as u8)));
                }
            }
        }
    }

    fn seed_pair(&self, left: BitSet, right: BitSet) {
        let total = left + right;
        let base = self.get(total, 0);
        if base.card.get() == -1.0 {
            base.eqs.set(self.get(left, 0).eqs.get() + self.get(right, 0).eqs.get());
            self.combine_card(base, self.get(left, 0), self.get(right, 0));
            base.neighborhood.set(self.compute_neighborhood(total, base.eqs.get()));
            for pipes in 1..MAX_PIPELINE_LENGTH {
                let cell = self.get(total, pipes);
                cell.eqs.set(base.eqs.get());
                cell.card.set(base.card.get());
                cell.base_card.set(base.base_card.get());
                cell.neighborhood.set(base.neighborhood.get());
            }
        }
    }

    /// Run the enumeration; returns the best (subset, pipes) root.
    pub fn optimize(&self) -> (BitSet, usize) {
        for (i, input) in self.inputs.iter().enumerate() {
            let cell = self.get(BitSet::single(i as u32), 0);
            cell.eqs.set(input.produced_eq);
            cell.neighborhood
                .set(self.compute_neighborhood(BitSet::single(i as u32), input.produced_eq));
            cell.base_card.set(input.cardinality);
            cell.card.set(input.cardinality);
            cell.cost.set(input.cardinality);
        }

        dpccp::enumerate_csg_cmp(self, &mut |left, right| {
            debug_assert!(self.get(left, 0).card.get() >= 0.0);
            debug_assert!(self.get(right, 0).card.get() >= 0.0);
            self.seed_pair(left, right);
            if self.can_join(left, right) {
                self.consider(left, right);
            }
            if self.can_join(right, left) {
                self.consider(right, left);
            }
        });

        let full = BitSet::prefix(self.inputs.len() as u32);
        let mut best_pipes = 0;
        for pipes in 0..MAX_PIPELINE_LENGTH {
            if self.get(full, pipes).cost.get() < self.get(full, best_pipes).cost.get() {
                best_pipes = pipes;
            }
        }

        if self.get(full, best_pipes).cost.get() == f64::INFINITY {
            self.stitch_cross_products(full);
            for pipes in 0..MAX_PIPELINE_LENGTH {
                if self.get(full, pipes).cost.get() < self.get(full, best_pipes).cost.get() {
                    best_pipes = pipes;
                }
            }
        }

        debug_assert!(self.get(full, 0).card.get() >= 0.0);
        debug_assert!(self.get(full, best_pipes).cost.get() < f64::INFINITY);
        (full, best_pipes)
    }

    /// No connected plan covers everything: merge the connected components
    /// with cross products, built hash table first, then by ascending
    /// cardinality.
    fn stitch_cross_products(&self, full: BitSet) {
        let mut components: Vec<BitSet> = Vec::new();
        let mut remaining = full;
        while !remaining.is_empty() {
            if self.connected(remaining) {
                components.push(remaining);
                break;
            }
            for subset in remaining.subsets() {
                debug_assert!(subset != remaining);
                let candidate = remaining - subset;
                if !self.connected(candidate) {
                    continue;
                }
                debug_assert!(components.iter().all(|c| !c.intersects(candidate)));
                components.push(candidate);
                remaining -= candidate;
                break;
            }
        }

        components.sort_by(|a, b| {
            let a_ht = a.is_single() && self.inputs[a.front() as usize].join_key != NO_KEY;
            let b_ht = b.is_single() && self.inputs[b.front() as usize].join_key != NO_KEY;
            debug_assert!(!(a_ht && b_ht));
            if a_ht {
                return std::cmp::Ordering::Less;
            }
            if b_ht {
                return std::cmp::Ordering::Greater;
            }
            self.get(*a, 0)
                .card
                .get()
                .partial_cmp(&self.get(*b, 0).card.get())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut current = components[0];
        for &next in &components[1..] {
            let total = current + next;
            debug_assert!(self.connected(current));
            debug_assert!(self.connected(next));
            let base = self.get(total, 0);
            self.combine_card(base, self.get(current, 0), self.get(next, 0));
            base.eqs.set(self.get(current, 0).eqs.get() + self.get(next, 0).eqs.get());
            for pipes in 1..MAX_PIPELINE_LENGTH {
                self.get(total, pipes).card.set(base.card.get());
            }
            self.consider(current, next);
            debug_assert!(self.connected(total));
            current = total;
        }
        debug_assert_eq!(current, full);
    }

    pub fn card(&self, set: BitSet, pipes: usize) -> f64 {
        self.get(set, pipes).card.get()
    }

    pub fn cost(&self, set: BitSet, pipes: usize) -> f64 {
        self.get(set, pipes).cost.get()
    }
}

/// A probe step in an executable pipeline.
#[derive(Debug, Clone, Copy)]
pub struct ProbeInfo {
    pub probe_input: u32,
    pub probe_key_eq: u32,
}

/// An executable pipeline: one scan, hash-table probes, and either a new
/// hash table on `key_eq` or (`key_eq == NO_KEY`) the final output.
#[derive(Debug, Clone)]
pub struct PlanPipeline {
    pub rels: BitSet,
    pub cost: f64,
    pub key_eq: u32,
    pub scan_input: u32,
    pub probes: Vec<ProbeInfo>,
}

impl PlanPipeline {
    fn invalid() -> PlanPipeline {
        PlanPipeline {
            rels: BitSet::new(),
            cost: f64::INFINITY,
            key_eq: NO_KEY,
            scan_input: u32::MAX,
            probes: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.cost != f64::INFINITY
    }

    pub fn is_output(&self) -> bool {
        self.key_eq == NO_KEY
    }

    fn better_of(a: PlanPipeline, b: PlanPipeline) -> PlanPipeline {
        if (b.cost, b.probes.len()) < (a.cost, a.probes.len()) {
            b
        } else {
            a
        }
    }
}

struct Subtree {
    cheapest: PlanPipeline,
    current: PlanPipeline,
}

fn cheapest_rec(qg: &QueryGraph, node: (BitSet, usize)) -> Subtree {
    let (set, pipes) = node;
    let cell = qg.get(set, pipes);
    let (left_link, right_link) = (cell.left.get(), cell.right.get());
    let Some(left_link) = left_link else {
        // Leaf: a pipeline starts here with a plain scan.
        let mut current = PlanPipeline::invalid();
        current.rels = set;
        current.scan_input = set.front();
        current.cost = 0.0;
        return Subtree { cheapest: PlanPipeline::invalid(), current };
    };
    let right_link = right_link.unwrap();
    let left_node = (BitSet::from_raw(left_link.0), left_link.1 as usize);
    let right_node = (BitSet::from_raw(right_link.0), right_link.1 as usize);
    let left = cheapest_rec(qg, left_node);
    let right = cheapest_rec(qg, right_node);

    let mut result = Subtree {
        cheapest: PlanPipeline::better_of(left.cheapest, right.cheapest),
        current: PlanPipeline::invalid(),
    };

    let left_cell = qg.get(left_node.0, left_node.1);
    let right_cell = qg.get(right_node.0, right_node.1);
    let mut left_pipeline = PlanPipeline::invalid();
    if left.current.is_valid() {
        left_pipeline = left.current;
        let intersection = left_cell.eqs.get() & right_cell.eqs.get();
        left_pipeline.key_eq =
            if intersection.is_empty() { CROSS_PRODUCT_EQ } else { intersection.front() };
        left_pipeline.cost = left_cell.cost.get() + left_cell.card.get() * 10.0;
        left_pipeline.rels = left_node.0;
    }

    let left_is_ht = left_node.0.is_single()
        && qg.inputs[left_node.0.front() as usize].join_key != NO_KEY;
    // A subtree that is not yet a hash table can become one.
    if left_pipeline.is_valid() && !qg.inputs[left_node.0.front() as usize].join_key_is_set() {
        result.cheapest = PlanPipeline::better_of(result.cheapest, left_pipeline.clone());
    }
    // Pipelines extend only through hash-table leaves on the left.
    if left_pipeline.is_valid() && left_is_ht {
        result.current = right.current;
        result.current.probes.push(ProbeInfo {
            probe_input: left_node.0.front(),
            probe_key_eq: left_pipeline.key_eq,
        });
        result.current.rels = set;
    }
    result
}

impl QgInput {
    fn join_key_is_set(&self) -> bool {
        self.join_key != NO_KEY
    }
}

/// Walk the best tree and return the cheapest pipeline to run next.
pub fn find_cheapest_pipeline(qg: &QueryGraph, root: (BitSet, usize)) -> PlanPipeline {
    let mut result = cheapest_rec(qg, root);
    if result.current.is_valid() {
        result.current.cost = qg.get(root.0, root.1).cost.get();
        result.cheapest = PlanPipeline::better_of(result.cheapest, result.current);
    }
    result.cheapest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(eqs: &[u32], card: f64) -> QgInput {
        QgInput {
            produced_eq: eqs.iter().copied().collect(),
            cardinality: card,
            multiplicity: 1.0,
            join_key: NO_KEY,
        }
    }

    #[test]
    fn test_two_relation_plan() {
        let qg = QueryGraph::new(vec![base(&[0], 100.0), base(&[0], 10.0)]);
        let root = qg.optimize();
        let pipeline = find_cheapest_pipeline(&qg, root);
        assert!(pipeline.is_valid());
        // With no hash tables yet, the first pipeline builds one side.
        assert!(!pipeline.is_output());
        assert!(pipeline.rels.is_single());
        assert!(pipeline.probes.is_empty());
        assert_eq!(pipeline.key_eq, 0);
    }

    #[test]
    fn test_probe_through_built_table() {
        // Input 1 is a hash table on class 0; the scan of input 0 should
        // probe it and terminate.
        let qg = QueryGraph::new(vec![
            base(&[0, 1], 1000.0),
            QgInput {
                produced_eq: [0u32].into_iter().collect(),
                cardinality: 10.0,
                multiplicity: 1.0,
                join_key: 0,
            },
        ]);
        let root = qg.optimize();
        let pipeline = find_cheapest_pipeline(&qg, root);
        assert!(pipeline.is_valid());
        assert!(pipeline.is_output());
        assert_eq!(pipeline.scan_input, 0);
        assert_eq!(pipeline.probes.len(), 1);
        assert_eq!(pipeline.probes[0].probe_input, 1);
        assert_eq!(pipeline.probes[0].probe_key_eq, 0);
    }

    #[test]
    fn test_cheaper_side_becomes_build() {
        let qg = QueryGraph::new(vec![base(&[0], 1_000_000.0), base(&[0], 5.0)]);
        let root = qg.optimize();
        let pipeline = find_cheapest_pipeline(&qg, root);
        // Building the small side is cheapest.
        assert!(!pipeline.is_output());
        assert_eq!(pipeline.scan_input, 1);
    }

    #[test]
    fn test_cross_product_components() {
        // No shared classes at all: the planner inserts a cross product
        // rather than failing.
        let qg = QueryGraph::new(vec![base(&[0], 10.0), base(&[1], 20.0)]);
        let root = qg.optimize();
        assert!(qg.cost(root.0, root.1).is_finite());
        let pipeline = find_cheapest_pipeline(&qg, root);
        assert!(pipeline.is_valid());
    }

    #[test]
    fn test_chain_enumeration_terminates() {
        let inputs: Vec<QgInput> =
            (0..8).map(|i| base(&[i, i + 1], 100.0 * (i + 1) as f64)).collect();
        let qg = QueryGraph::new(inputs);
        let root = qg.optimize();
        assert!(qg.cost(root.0, root.1).is_finite());
        let pipeline = find_cheapest_pipeline(&qg, root);
        assert!(pipeline.is_valid());
        assert!(!pipeline.rels.is_empty());
    }
}
