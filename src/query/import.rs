//! Translate the plan IR into a prepared query: base-table inputs,
//! attributes, and equivalence classes derived from the join predicates
//! with a union-find.

use crate::common::BitSet;
use crate::error::{DbError, Result};
use crate::query::plan::{NodeKind, Plan, PlanNode};
use crate::query::query_plan::QueryPlan;
use crate::storage::catalog::{DataSource, Table, TableColumn};
use crate::storage::page::PagePtr;

struct UnionFind {
    parent: Vec<u32>,
}

impl UnionFind {
    fn new() -> UnionFind {
        UnionFind { parent: Vec::new() }
    }

    fn ensure(&mut self, id: u32) {
        while self.parent.len() <= id as usize {
            self.parent.push(self.parent.len() as u32);
        }
    }

    fn find(&mut self, id: u32) -> u32 {
        self.ensure(id);
        let mut root = id;
        while self.parent[root as usize] != root {
            root = self.parent[root as usize];
        }
        // Path compression.
        let mut cur = id;
        while self.parent[cur as usize] != root {
            let next = self.parent[cur as usize];
            self.parent[cur as usize] = root;
            cur = next;
        }
        root
    }

    fn merge(&mut self, a: u32, b: u32) {
        self.ensure(a.max(b));
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb as usize] = ra;
        }
    }
}

struct PlanImporter<'a> {
    plan: &'a Plan,
    result: QueryPlan,
    groups: UnionFind,
    attr_count: u32,
}

impl<'a> PlanImporter<'a> {
    fn import_node(&mut self, node: &PlanNode) -> Result<Vec<u32>> {
        match &node.kind {
            NodeKind::Join(join) => {
                let plan = self.plan;
                if join.left >= plan.nodes.len() || join.right >= plan.nodes.len() {
                    return Err(DbError::InvalidPlan("join child out of range".into()));
                }
                let left = self.import_node(&plan.nodes[join.left])?;
                let right = self.import_node(&plan.nodes[join.right])?;
                let mut attrs = Vec::with_capacity(node.output_attrs.len());
                for &(idx, _) in &node.output_attrs {
                    let attr = if idx < left.len() {
                        left[idx]
                    } else if idx - left.len() < right.len() {
                        right[idx - left.len()]
                    } else {
                        return Err(DbError::InvalidPlan(format!(
                            "output attribute {idx} out of range"
                        )));
                    };
                    attrs.push(attr);
                }
                let left_key = *left.get(join.left_attr).ok_or_else(|| {
                    DbError::InvalidPlan(format!("left join attribute {} out of range", join.left_attr))
                })?;
                let right_key = *right.get(join.right_attr).ok_or_else(|| {
                    DbError::InvalidPlan(format!(
                        "right join attribute {} out of range",
                        join.right_attr
                    ))
                })?;
                self.groups.merge(left_key, right_key);
                Ok(attrs)
            }
            NodeKind::Scan(scan) => {
                if scan.base_table_id >= self.result.data_source().relations.len() {
                    return Err(DbError::InvalidPlan(format!(
                        "scan references missing table {}",
                        scan.base_table_id
                    )));
                }
                let mut attrs = Vec::with_capacity(node.output_attrs.len());
                let mut attr_set = BitSet::new();
                // Empty tables may come without column metadata.
                let fill_table =
                    self.result.data_source().relations[scan.base_table_id].columns.is_empty();
                for &(idx, data_type) in &node.output_attrs {
                    attrs.push(self.attr_count);
                    attr_set.insert(self.attr_count);
                    if fill_table {
                        let columns =
                            &mut self.result.data_source_mut().relations[scan.base_table_id].columns;
                        while columns.len() <= idx {
                            columns.push(TableColumn { data_type, pages: Vec::new() });
                        }
                    } else if idx
                        >= self.result.data_source().relations[scan.base_table_id].columns.len()
                    {
                        return Err(DbError::InvalidPlan(format!(
                            "scan of table {} references missing column {idx}",
                            scan.base_table_id
                        )));
                    }
                    self.result.add_attribute(scan.base_table_id as u32, idx as u32, data_type);
                    self.attr_count += 1;
                }
                self.result.add_input(scan.base_table_id, attr_set);
                Ok(attrs)
            }
        }
    }
}

/// Borrow the plan's input tables into a data source.
pub fn import_tables(plan: &Plan) -> DataSource {
    let mut ds = DataSource::default();
    for input in &plan.inputs {
        let columns = input
            .columns
            .iter()
            .map(|column| TableColumn {
                data_type: column.data_type,
                pages: column.pages.iter().map(|&p| PagePtr(p)).collect(),
            })
            .collect();
        ds.relations.push(Table {
            num_rows: input.num_rows as u64,
            columns,
            name: format!("input{}", ds.relations.len()),
        });
    }
    ds
}

/// Build a prepared query plan over `data_source` from the IR.
pub fn import_plan(data_source: DataSource, plan: &Plan) -> Result<QueryPlan> {
    if plan.root >= plan.nodes.len() {
        return Err(DbError::InvalidPlan("root node out of range".into()));
    }
    let mut importer = PlanImporter {
        plan,
        result: QueryPlan::new(data_source),
        groups: UnionFind::new(),
        attr_count: 0,
    };
    let output = importer.import_node(&plan.nodes[plan.root])?;
    if importer.attr_count > 64 {
        return Err(DbError::InvalidPlan(format!(
            "plan uses {} attributes, at most 64 supported",
            importer.attr_count
        )));
    }

    let attr_count = importer.attr_count;
    let mut groups = importer.groups;
    let mut class_sets: Vec<(u32, BitSet)> = Vec::new();
    for attr in 0..attr_count {
        let root = groups.find(attr);
        match class_sets.iter_mut().find(|(r, _)| *r == root) {
            Some((_, set)) => set.insert(attr),
            None => class_sets.push((root, BitSet::single(attr))),
        }
    }
    let equivalence_sets: Vec<BitSet> = class_sets.into_iter().map(|(_, set)| set).collect();

    let mut result = importer.result;
    result.prepare(equivalence_sets)?;
    result.set_output(&output);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_find_groups() {
        let mut uf = UnionFind::new();
        uf.merge(0, 1);
        uf.merge(2, 3);
        uf.merge(1, 3);
        assert_eq!(uf.find(0), uf.find(3));
        assert_ne!(uf.find(0), uf.find(4));
        uf.merge(5, 0);
        assert_eq!(uf.find(5), uf.find(2));
    }
}
