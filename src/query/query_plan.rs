//! End-to-end query driver.
//!
//! One invocation eliminates singleton relations, seeds per-input samples,
//! then loops: enumerate the remaining inputs, pick the cheapest pipeline,
//! run it, and either install the produced hash table (deriving a join
//! filter on its key class) or return the materialized result. Inputs
//! consumed by a pipeline retire to a graveyard kept alive until query
//! end so restrictions built over them stay valid.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::common::{BitSet, NULL_VALUE};
use crate::config::Selectivities;
use crate::error::Result;
use crate::filter::RestrictionLogic;
use crate::join::hash_table::{Hashtable, HashtableBuild, ENTRY_KEY};
use crate::pipeline::collector::CollectorTarget;
use crate::pipeline::join_pipeline::{JoinPipeline, PipelineTarget, Source, TargetStates};
use crate::pipeline::table_target::{OutputColumn, TableTarget};
use crate::planner::query_graph::{
    find_cheapest_pipeline, PlanPipeline, QgInput, QueryGraph, CROSS_PRODUCT_EQ, NO_KEY,
};
use crate::query::plan::ColumnarTable;
use crate::scan::table_scan::{RestrictionInfo, TableScan};
use crate::storage::catalog::DataSource;
use crate::storage::column::{ColumnInfo, DataType, TableInfo};

/// An attribute provided by some table scan.
pub struct Attribute {
    pub relation: u32,
    pub column: u32,
    pub data_type: DataType,
    pub eq_class: u32,
    info: Option<Arc<ColumnInfo>>,
}

/// A planner input: a restricted base table, or a hash table produced by
/// an earlier pipeline.
struct Input {
    produced_eq: BitSet,
    cardinality: f64,
    ht: Option<Arc<Hashtable>>,
    /// The join filter derived from this hash table.
    #[allow(dead_code)]
    restriction_logic: Option<Arc<RestrictionLogic>>,
    /// Point restrictions installed when this input collapsed to one row.
    #[allow(dead_code)]
    additional_restrictions: Vec<Arc<RestrictionLogic>>,
    /// Class → offset of its value inside the stored tuple (key at 0).
    eq_offsets: Vec<(u32, u32)>,
    key_eq: u32,
    is_cross_product: bool,
    produced_attributes: BitSet,
    relation: Option<usize>,
    table_info: TableInfo,
    /// Column-major sample of INT32 join attributes, ≤ 64 rows.
    sample: Vec<u32>,
    sample_offsets: HashMap<u32, usize>,
    sample_size: usize,
    sample_matches: u64,
}

impl Input {
    fn new_base(relation: usize, attrs: BitSet) -> Input {
        Input {
            produced_eq: BitSet::new(),
            cardinality: 1.0,
            ht: None,
            restriction_logic: None,
            additional_restrictions: Vec::new(),
            eq_offsets: Vec::new(),
            key_eq: NO_KEY,
            is_cross_product: false,
            produced_attributes: attrs,
            relation: Some(relation),
            table_info: TableInfo::default(),
            sample: Vec::new(),
            sample_offsets: HashMap::new(),
            sample_size: 0,
            sample_matches: u64::MAX,
        }
    }

    fn new_hash_table(produced_eq: BitSet) -> Input {
        Input {
            produced_eq,
            cardinality: 1.0,
            ht: None,
            restriction_logic: None,
            additional_restrictions: Vec::new(),
            eq_offsets: Vec::new(),
            key_eq: NO_KEY,
            is_cross_product: false,
            produced_attributes: BitSet::new(),
            relation: None,
            table_info: TableInfo::default(),
            sample: Vec::new(),
            sample_offsets: HashMap::new(),
            sample_size: 0,
            sample_matches: u64::MAX,
        }
    }

    fn is_base(&self) -> bool {
        self.relation.is_some()
    }

    fn recompute_cardinality(&mut self) {
        debug_assert!(self.is_base());
        let matches = self.sample_matches.count_ones();
        let selectivity = if matches > 0 {
            f64::from(matches) / self.sample_size as f64
        } else {
            1.0 / (self.sample_size as f64 * 2.0)
        };
        self.cardinality = self.table_info.num_rows as f64 * selectivity;
    }
}

pub struct QueryPlan {
    db: DataSource,
    attributes: Vec<Attribute>,
    output_eqs: Vec<u32>,
    inputs: Vec<Input>,
    graveyard: Vec<Input>,
    equivalence_sets: Vec<BitSet>,
    eq_constants: HashMap<u32, u64>,
    eq_restrictions: HashMap<u32, Arc<RestrictionLogic>>,
    selectivities: Selectivities,
}

impl QueryPlan {
    pub fn new(db: DataSource) -> QueryPlan {
        QueryPlan {
            db,
            attributes: Vec::new(),
            output_eqs: Vec::new(),
            inputs: Vec::new(),
            graveyard: Vec::new(),
            equivalence_sets: Vec::new(),
            eq_constants: HashMap::new(),
            eq_restrictions: HashMap::new(),
            selectivities: Selectivities::default(),
        }
    }

    pub fn data_source(&self) -> &DataSource {
        &self.db
    }

    pub fn data_source_mut(&mut self) -> &mut DataSource {
        &mut self.db
    }

    pub fn add_input(&mut self, relation: usize, attrs: BitSet) {
        self.inputs.push(Input::new_base(relation, attrs));
    }

    pub fn add_attribute(&mut self, relation: u32, column: u32, data_type: DataType) {
        self.attributes.push(Attribute { relation, column, data_type, eq_class: 0, info: None });
    }

    /// Resolve equivalence classes and prepare the scanned columns.
    pub fn prepare(&mut self, equivalence_sets: Vec<BitSet>) -> Result<()> {
        self.equivalence_sets = equivalence_sets;
        for (eq_class, set) in self.equivalence_sets.iter().enumerate() {
            for attr in *set {
                self.attributes[attr as usize].eq_class = eq_class as u32;
            }
        }

        for attr in &mut self.attributes {
            let table = &self.db.relations[attr.relation as usize];
            let column = &table.columns[attr.column as usize];
            attr.info =
                Some(Arc::new(ColumnInfo::prepare(column.data_type, column.pages.clone())));
        }

        for input in &mut self.inputs {
            for attr in input.produced_attributes {
                input.produced_eq.insert(self.attributes[attr as usize].eq_class);
            }
            let relation = input.relation.unwrap();
            let table = &self.db.relations[relation];
            input.table_info.num_rows = table.num_rows;
            input.table_info.name = table.name.clone();
            input.table_info.columns = input
                .produced_attributes
                .map(|attr| self.attributes[attr as usize].info.clone().unwrap())
                .collect();
            input.cardinality = table.num_rows as f64;
        }
        Ok(())
    }

    pub fn set_output(&mut self, attrs: &[u32]) {
        self.output_eqs =
            attrs.iter().map(|&a| self.attributes[a as usize].eq_class).collect();
    }

    fn eq_type(&self, eq: u32) -> DataType {
        self.attributes[self.equivalence_sets[eq as usize].front() as usize].data_type
    }

    /// Column index of `eq` within the input's scan output.
    fn column_of(&self, input: &Input, eq: u32) -> u32 {
        let attrs = input.produced_attributes & self.equivalence_sets[eq as usize];
        debug_assert_eq!(attrs.len(), 1);
        input.produced_attributes.index_of(attrs.front())
    }

    fn build_scan(&self, input: &Input, required_eqs: BitSet, mult: f64) -> TableScan {
        debug_assert!(input.is_base());
        let eqs = input.produced_eq & required_eqs;
        let cols: Vec<u32> = eqs.map(|eq| self.column_of(input, eq)).collect();

        let mut restrictions = Vec::new();
        for eq in input.produced_eq {
            let Some(restriction) = self.eq_restrictions.get(&eq) else { continue };
            let col = self.column_of(input, eq);
            // Samples may not exist yet during singleton elimination.
            let mut selectivity = 1.0;
            if !input.sample.is_empty() {
                if let Some(&offset) = input.sample_offsets.get(&eq) {
                    let window = &input.sample[offset..offset + input.sample_size];
                    let mask = u64::MAX >> (64 - input.sample_size);
                    let matches = restriction.run_sample(window, mask).count_ones();
                    selectivity = if matches > 0 {
                        f64::from(matches) / input.sample_size as f64
                    } else {
                        1.0 / (input.sample_size as f64 * 2.0)
                    };
                }
            }
            restrictions.push(RestrictionInfo {
                column: col,
                selectivity,
                restriction: restriction.clone(),
            });
        }

        let selectivity = input.cardinality / (input.table_info.num_rows.max(1)) as f64;
        TableScan::new(
            input.table_info.clone(),
            &cols,
            &restrictions,
            mult,
            selectivity,
            &self.selectivities,
        )
    }

    /// Selectivity product with dampening, for inputs without a sample.
    fn estimate_cardinality(&self, input: &Input) -> f64 {
        if !input.is_base() {
            return input.ht.as_ref().unwrap().num_tuples() as f64;
        }
        let mut sels: Vec<f64> = input
            .produced_eq
            .filter_map(|eq| {
                self.eq_restrictions
                    .get(&eq)
                    .map(|r| r.estimate_selectivity(&self.selectivities))
            })
            .collect();
        sels.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mut total = 1.0;
        let mut dampening = 1.0;
        for s in sels {
            total *= 1.0 - (1.0 - s) * dampening;
            dampening *= 0.5;
        }
        (input.table_info.num_rows as f64 * total).max(0.5)
    }

    /// Classes still needed outside `relations`, restricted to what the
    /// set produces; constant classes are already satisfied.
    fn compute_required_eq(&self, relations: BitSet) -> BitSet {
        let mut produced = BitSet::new();
        let mut required = BitSet::new();
        for (i, input) in self.inputs.iter().enumerate() {
            if relations.contains(i as u32) {
                produced += input.produced_eq;
            } else {
                required += input.produced_eq;
            }
        }
        for &eq in &self.output_eqs {
            required.insert(eq);
        }
        for &eq in self.eq_constants.keys() {
            required.remove(eq);
        }
        produced & required
    }

    /// Resolve relations with ≤ 1 row up front: empty means an empty
    /// query, a single row becomes per-class constants plus Eq
    /// restrictions on shared classes.
    fn eliminate_singletons(&mut self) -> Result<()> {
        let mut i = 0;
        while i < self.inputs.len() {
            debug_assert!(self.inputs[i].is_base());
            let num_rows = self.inputs[i].table_info.num_rows;
            if num_rows > 1 {
                i += 1;
                continue;
            }
            if num_rows == 0 {
                self.inputs.clear();
                break;
            }
            if self.inputs.len() == 1 {
                break;
            }
            let scan =
                self.build_scan(&self.inputs[i], self.inputs[i].produced_eq, 1.0);
            let mut collector = CollectorTarget::new();
            collector.collect(&scan)?;
            if collector.values.is_empty() {
                self.inputs.clear();
                break;
            }
            let produced = self.inputs[i].produced_eq;
            for eq in produced {
                let value = collector.values[produced.index_of(eq) as usize];
                self.eq_constants.insert(eq, value);
                if self.equivalence_sets[eq as usize].len() > 1 {
                    let logic = Arc::new(RestrictionLogic::Eq(value as u32));
                    self.inputs[i].additional_restrictions.push(logic.clone());
                    self.eq_restrictions.insert(eq, logic);
                }
            }
            let retired = self.inputs.swap_remove(i);
            self.graveyard.push(retired);
        }
        Ok(())
    }

    /// Draw deterministic samples over INT32 join attributes and seed the
    /// match masks from the restrictions known so far.
    fn compute_samples(&mut self) -> Result<()> {
        for i in 0..self.inputs.len() {
            let (int_eqs, sample_size) = {
                let input = &self.inputs[i];
                debug_assert!(input.is_base());
                let mut int_eqs = BitSet::new();
                for attr in input.produced_attributes {
                    let attribute = &self.attributes[attr as usize];
                    if attribute.data_type == DataType::Int32
                        && self.equivalence_sets[attribute.eq_class as usize].len() > 1
                    {
                        int_eqs.insert(attribute.eq_class);
                    }
                }
                (int_eqs, input.table_info.num_rows.min(64) as usize)
            };

            let scan = self.build_scan(&self.inputs[i], int_eqs, 1.0);
            let sample = scan.create_unfiltered_sample(sample_size);

            let offsets: Vec<(u32, usize)> = int_eqs
                .map(|eq| (eq, sample_size * int_eqs.index_of(eq) as usize))
                .collect();
            {
                let input = &mut self.inputs[i];
                input.sample_offsets = offsets.iter().copied().collect();
                input.sample = sample;
                input.sample_size = sample_size;
                input.sample_matches = u64::MAX >> (64 - sample_size);
            }

            for (eq, offset) in offsets {
                let restriction = self
                    .eq_restrictions
                    .get(&eq)
                    .expect("multi-relation class carries a restriction")
                    .clone();
                let input = &mut self.inputs[i];
                let window = &input.sample[offset..offset + input.sample_size];
                input.sample_matches = restriction.run_sample(window, input.sample_matches);
            }
            self.inputs[i].recompute_cardinality();
        }
        Ok(())
    }

    /// Compile and run one pipeline. Returns the final table for the
    /// terminal pipeline, `None` when a hash table was installed instead.
    fn run_pipeline(
        &mut self,
        pipeline: &PlanPipeline,
        card_estimate: f64,
    ) -> Result<Option<ColumnarTable>> {
        let scan_idx = pipeline.scan_input as usize;
        let scan_required = self.compute_required_eq(BitSet::single(pipeline.scan_input));
        let scan_produced = self.inputs[scan_idx].produced_eq & scan_required;

        let mut sources: HashMap<u32, Source> = HashMap::new();
        for eq in scan_produced {
            sources.insert(eq, Source { op: 0, offset: scan_produced.index_of(eq) });
        }

        let required = self.compute_required_eq(pipeline.rels);
        let mut new_input = Input::new_hash_table(required);

        let mut zero_column_value = NULL_VALUE;
        let zero_column_pos = scan_produced.len();

        // Wire the probes: key sources plus the classes each table adds.
        let mut probes: Vec<(Arc<Hashtable>, Source)> = Vec::with_capacity(pipeline.probes.len());
        for probe in &pipeline.probes {
            let input = &self.inputs[probe.probe_input as usize];
            debug_assert!(!input.is_base());
            let ht = input.ht.clone().expect("probe input carries a hash table");
            let key_source = if input.is_cross_product {
                // Cross products ride on a constant scan column.
                debug_assert_eq!(zero_column_value, NULL_VALUE);
                zero_column_value = if input.key_eq == CROSS_PRODUCT_EQ {
                    0
                } else {
                    self.eq_constants[&input.key_eq]
                };
                new_input.key_eq = input.key_eq;
                Source { op: 0, offset: zero_column_pos }
            } else {
                sources[&probe.probe_key_eq]
            };
            for &(eq, offset) in &input.eq_offsets {
                sources
                    .entry(eq)
                    .or_insert(Source { op: probes.len() as u32 + 1, offset });
            }
            probes.push((ht, key_source));
        }

        // The build key always sits at offset 0 of the stored tuple.
        let mut output_sources: Vec<(Source, u32)> = Vec::with_capacity(required.len() as usize + 1);
        let mut build = None;
        if !pipeline.is_output() {
            let ht = Arc::new(Hashtable::default());
            new_input.ht = Some(ht.clone());
            let mut b = HashtableBuild::new(ht, card_estimate.max(0.0) as usize);
            if pipeline.key_eq == CROSS_PRODUCT_EQ {
                if zero_column_value == NULL_VALUE {
                    zero_column_value = 0;
                    new_input.key_eq = CROSS_PRODUCT_EQ;
                }
                new_input.is_cross_product = true;
                b.is_cross_product = true;
                output_sources.push((Source { op: 0, offset: zero_column_pos }, CROSS_PRODUCT_EQ));
            } else {
                new_input.key_eq = pipeline.key_eq;
                debug_assert!(required.contains(pipeline.key_eq));
                output_sources.push((sources[&pipeline.key_eq], pipeline.key_eq));
            }
            build = Some(b);
        }
        for eq in required {
            if eq != pipeline.key_eq {
                output_sources.push((sources[&eq], eq));
            }
        }
        // Grouping attributes by producing operator keeps tuple layouts
        // compact and stable.
        let fixed = usize::from(!pipeline.is_output());
        output_sources[fixed..].sort_by_key(|entry| (entry.0.op, entry.0.offset));
        for (position, &(_, eq)) in output_sources.iter().enumerate() {
            new_input.eq_offsets.push((eq, position as u32));
        }

        let mut mult = 1.0;
        for (ht, _) in &probes {
            mult *= ht.num_tuples() as f64 / ht.num_keys_estimate() as f64;
        }

        let mut scan = self.build_scan(&self.inputs[scan_idx], scan_required, mult);
        if zero_column_value != NULL_VALUE {
            scan.produce_constant_column = zero_column_value;
        }
        let attr_sources: Vec<Source> = output_sources.iter().map(|&(s, _)| s).collect();

        debug!(
            scan = scan.table_name(),
            probes = probes.len(),
            key_eq = pipeline.key_eq,
            terminal = pipeline.is_output(),
            "running pipeline"
        );

        if pipeline.is_output() {
            let types: Vec<DataType> =
                output_sources.iter().map(|&(_, eq)| self.eq_type(eq)).collect();
            let mut table_target = TableTarget::new(types);
            let jp = JoinPipeline::new(
                &scan,
                probes,
                attr_sources,
                PipelineTarget::Table(&table_target),
            );
            let states = jp.execute()?;
            if let TargetStates::Table(states) = states {
                table_target.finish_consume(states);
            }

            let mut output_columns = Vec::with_capacity(self.output_eqs.len());
            for &eq in &self.output_eqs {
                if let Some(&value) = self.eq_constants.get(&eq) {
                    output_columns.push(OutputColumn::Constant(self.eq_type(eq), value));
                } else {
                    let index = output_sources
                        .iter()
                        .position(|&(_, e)| e == eq)
                        .expect("output class produced by terminal pipeline");
                    output_columns.push(OutputColumn::Writer(index));
                }
            }
            return Ok(Some(table_target.prepare_and_extract(&output_columns)));
        }

        let build = build.unwrap();
        {
            let jp = JoinPipeline::new(&scan, probes, attr_sources, PipelineTarget::Build(&build));
            jp.execute()?;
        }

        let ht = new_input.ht.clone().unwrap();
        if ht.num_tuples() == 0 {
            self.inputs.clear();
            return Ok(None);
        }
        let singleton = ht.num_tuples() == 1;

        // A duplicate-free single-class table adds no columns downstream:
        // the derived filter alone carries its effect, so the tuples can
        // be dropped.
        let mut simplified = required.is_single()
            && self.equivalence_sets[required.front() as usize].len() > 1
            && ht.is_duplicate_free();
        if simplified {
            for (i, input) in self.inputs.iter().enumerate() {
                if pipeline.rels.contains(i as u32) {
                    continue;
                }
                if !input.is_base() && input.produced_eq.contains(required.front()) {
                    simplified = false;
                    break;
                }
            }
        }

        let restriction = Arc::new(RestrictionLogic::from_hash_table(&ht, simplified));
        new_input.restriction_logic = Some(restriction.clone());
        self.eq_restrictions.insert(pipeline.key_eq, restriction.clone());
        new_input.cardinality = ht.num_tuples() as f64;

        let mut kept = Vec::with_capacity(self.inputs.len());
        for (i, input) in self.inputs.drain(..).enumerate() {
            if pipeline.rels.contains(i as u32) {
                self.graveyard.push(input);
            } else {
                kept.push(input);
            }
        }
        self.inputs = kept;

        if singleton {
            // Propagate the single tuple's values as point restrictions.
            let mut tuple: Option<*const u64> = None;
            ht.iterate_entries(|entry| {
                debug_assert!(tuple.is_none());
                tuple = Some(entry);
            });
            let tuple = tuple.unwrap();
            for &(eq, offset) in &new_input.eq_offsets.clone() {
                if eq == CROSS_PRODUCT_EQ {
                    continue;
                }
                let value = unsafe { *tuple.add(ENTRY_KEY + offset as usize) } as u32;
                if self.equivalence_sets[eq as usize].len() > 1 && eq != pipeline.key_eq {
                    let logic = Arc::new(RestrictionLogic::Eq(value));
                    new_input.additional_restrictions.push(logic.clone());
                    self.eq_restrictions.insert(eq, logic.clone());
                    for input in &mut self.inputs {
                        if !input.is_base() || !input.produced_eq.contains(eq) {
                            continue;
                        }
                        let Some(&offset) = input.sample_offsets.get(&eq) else { continue };
                        let window = &input.sample[offset..offset + input.sample_size];
                        input.sample_matches = logic.run_sample(window, input.sample_matches);
                        input.recompute_cardinality();
                    }
                }
            }
        }
        if !simplified {
            self.inputs.push(new_input);
        } else {
            self.graveyard.push(new_input);
        }

        for input in &mut self.inputs {
            if input.is_base() && input.produced_eq.contains(pipeline.key_eq) {
                let Some(&offset) = input.sample_offsets.get(&pipeline.key_eq) else { continue };
                let window = &input.sample[offset..offset + input.sample_size];
                input.sample_matches = restriction.run_sample(window, input.sample_matches);
                input.recompute_cardinality();
            }
        }
        Ok(None)
    }

    fn empty_result(&self) -> ColumnarTable {
        let types: Vec<DataType> = self.output_eqs.iter().map(|&eq| self.eq_type(eq)).collect();
        let mut target = TableTarget::new(types);
        let ls = target.make_local_state();
        target.finish_consume(vec![ls]);
        target.extract()
    }

    /// Execute the whole query.
    pub fn run(&mut self) -> Result<ColumnarTable> {
        // Any class shared between relations must drop null keys.
        for eq in 0..self.equivalence_sets.len() as u32 {
            debug_assert!(!self.equivalence_sets[eq as usize].is_empty());
            if !self.equivalence_sets[eq as usize].is_single() {
                self.eq_restrictions.entry(eq).or_insert_with(|| Arc::new(RestrictionLogic::NotNull));
            }
        }
        for i in 0..self.inputs.len() {
            let cardinality = self.estimate_cardinality(&self.inputs[i]);
            self.inputs[i].cardinality = cardinality;
        }

        if self.inputs.len() > 24 {
            return Err(crate::error::DbError::InvalidPlan(format!(
                "plan joins {} relations, at most 24 supported",
                self.inputs.len()
            )));
        }

        self.eliminate_singletons()?;
        self.compute_samples()?;

        while !self.inputs.is_empty() {
            let mut constants = BitSet::new();
            for &eq in self.eq_constants.keys() {
                constants.insert(eq);
            }
            let qg_inputs: Vec<QgInput> = self
                .inputs
                .iter()
                .map(|input| {
                    debug_assert_eq!(input.is_base(), input.key_eq == NO_KEY);
                    let multiplicity = match &input.ht {
                        Some(ht) => ht.num_tuples() as f64 / ht.num_keys_estimate() as f64,
                        None => 1.0,
                    };
                    QgInput {
                        produced_eq: input.produced_eq - constants,
                        cardinality: input.cardinality,
                        multiplicity,
                        join_key: input.key_eq,
                    }
                })
                .collect();

            let qg = QueryGraph::new(qg_inputs);
            let root = qg.optimize();
            let pipeline = find_cheapest_pipeline(&qg, root);
            debug_assert!(pipeline.is_valid());
            debug_assert!(!pipeline.rels.is_empty());

            if let Some(result) = self.run_pipeline(&pipeline, qg.card(root.0, root.1))? {
                return Ok(result);
            }
        }

        Ok(self.empty_result())
    }
}
