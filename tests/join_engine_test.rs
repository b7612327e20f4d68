//! End-to-end join scenarios validated against a nested-loop reference.

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use morseldb::memory::page_pool;
use morseldb::query::plan::{self, Data, Plan};
use morseldb::{build_context_with, execute, Context, DataType, EngineConfig};

static ENGINE: Lazy<Mutex<Context>> = Lazy::new(|| {
    let config = EngineConfig {
        page_pool_bytes: Some(256 << 20),
        query_pool_bytes: Some(256 << 20),
        ..EngineConfig::default()
    };
    Mutex::new(build_context_with(config))
});

// ---------------------------------------------------------------------------
// Reference semantics
// ---------------------------------------------------------------------------

struct RefTable {
    rows: Vec<Vec<Data>>,
}

fn data_key(d: &Data) -> String {
    match d {
        Data::Int32(v) => format!("i{v:020}"),
        Data::Int64(v) => format!("l{v:020}"),
        Data::Fp64(v) => format!("f{v:024.6}"),
        Data::Str(s) => format!("s{s}"),
        Data::Null => "~null".to_string(),
    }
}

fn sort_rows(mut rows: Vec<Vec<Data>>) -> Vec<Vec<Data>> {
    rows.sort_by_key(|row| row.iter().map(data_key).collect::<Vec<_>>());
    rows
}

/// Nested-loop evaluation of the same plan shape: null keys never match.
fn reference_join(
    left: &RefTable,
    right: &RefTable,
    left_attr: usize,
    right_attr: usize,
    output: &[usize],
) -> RefTable {
    let mut rows = Vec::new();
    for l in &left.rows {
        for r in &right.rows {
            let matches = match (&l[left_attr], &r[right_attr]) {
                (Data::Int32(a), Data::Int32(b)) => a == b,
                (Data::Null, _) | (_, Data::Null) => false,
                _ => panic!("non-INT32 join key"),
            };
            if !matches {
                continue;
            }
            let combined: Vec<Data> = l.iter().chain(r.iter()).cloned().collect();
            rows.push(output.iter().map(|&i| combined[i].clone()).collect());
        }
    }
    RefTable { rows }
}

fn run_plan(plan: &Plan) -> Vec<Vec<Data>> {
    let ctx = ENGINE.lock();
    let result = execute(plan, &ctx).expect("query executes");
    plan::to_rows(&result)
}

// ---------------------------------------------------------------------------
// Two-table helpers
// ---------------------------------------------------------------------------

fn two_table_plan(
    r: Vec<Vec<Data>>,
    r_types: Vec<DataType>,
    s: Vec<Vec<Data>>,
    s_types: Vec<DataType>,
    build_left: bool,
    output: Vec<(usize, DataType)>,
) -> Plan {
    let mut plan = Plan::default();
    let r_id = plan.new_input(plan::from_rows(&r, &r_types));
    let s_id = plan.new_input(plan::from_rows(&s, &s_types));
    let r_scan = plan.new_scan_node(
        r_id,
        r_types.iter().copied().enumerate().collect(),
    );
    let s_scan = plan.new_scan_node(
        s_id,
        s_types.iter().copied().enumerate().collect(),
    );
    plan.root = plan.new_join_node(build_left, r_scan, s_scan, 0, 0, output);
    plan
}

#[test]
fn test_s1_empty_join() {
    let plan = two_table_plan(
        vec![],
        vec![DataType::Int32],
        vec![],
        vec![DataType::Int32],
        true,
        vec![(0, DataType::Int32), (1, DataType::Int32)],
    );
    let rows = run_plan(&plan);
    assert!(rows.is_empty());
}

#[test]
fn test_s2_singleton_join() {
    let plan = two_table_plan(
        vec![vec![Data::Int32(1)]],
        vec![DataType::Int32],
        vec![vec![Data::Int32(1)]],
        vec![DataType::Int32],
        true,
        vec![(0, DataType::Int32), (1, DataType::Int32)],
    );
    let rows = run_plan(&plan);
    assert_eq!(rows, vec![vec![Data::Int32(1), Data::Int32(1)]]);
}

#[test]
fn test_s3_multi_match() {
    let r: Vec<Vec<Data>> =
        [1, 1, 2, 3].iter().map(|&v| vec![Data::Int32(v)]).collect();
    let plan = two_table_plan(
        r.clone(),
        vec![DataType::Int32],
        r,
        vec![DataType::Int32],
        true,
        vec![(0, DataType::Int32), (1, DataType::Int32)],
    );
    let rows = sort_rows(run_plan(&plan));
    let expected: Vec<Vec<Data>> = vec![
        vec![Data::Int32(1), Data::Int32(1)],
        vec![Data::Int32(1), Data::Int32(1)],
        vec![Data::Int32(1), Data::Int32(1)],
        vec![Data::Int32(1), Data::Int32(1)],
        vec![Data::Int32(2), Data::Int32(2)],
        vec![Data::Int32(3), Data::Int32(3)],
    ];
    assert_eq!(rows, expected);
}

#[test]
fn test_s4_null_keys_never_match() {
    let r: Vec<Vec<Data>> = vec![
        vec![Data::Int32(1)],
        vec![Data::Int32(1)],
        vec![Data::Null],
        vec![Data::Int32(2)],
        vec![Data::Int32(3)],
    ];
    let plan = two_table_plan(
        r.clone(),
        vec![DataType::Int32],
        r,
        vec![DataType::Int32],
        true,
        vec![(0, DataType::Int32), (1, DataType::Int32)],
    );
    let rows = sort_rows(run_plan(&plan));
    assert_eq!(rows.len(), 6);
    assert!(rows.iter().all(|row| row[0] != Data::Null && row[0] == row[1]));
    assert_eq!(rows.iter().filter(|row| row[0] == Data::Int32(1)).count(), 4);
}

#[test]
fn test_s5_build_on_right_with_strings() {
    let table: Vec<Vec<Data>> = vec![
        vec![Data::Int32(10), Data::Str("xxx".into())],
        vec![Data::Int32(10), Data::Str("yyy".into())],
        vec![Data::Null, Data::Str("zzz".into())],
        vec![Data::Int32(20), Data::Str("uuu".into())],
        vec![Data::Int32(30), Data::Str("vvv".into())],
    ];
    let types = vec![DataType::Int32, DataType::Varchar];
    // Output projects (R.col0, S.col0, R.col1).
    let plan = two_table_plan(
        table.clone(),
        types.clone(),
        table,
        types,
        true,
        vec![(0, DataType::Int32), (2, DataType::Int32), (1, DataType::Varchar)],
    );
    let rows = sort_rows(run_plan(&plan));
    let expected = sort_rows(vec![
        vec![Data::Int32(10), Data::Int32(10), Data::Str("xxx".into())],
        vec![Data::Int32(10), Data::Int32(10), Data::Str("xxx".into())],
        vec![Data::Int32(10), Data::Int32(10), Data::Str("yyy".into())],
        vec![Data::Int32(10), Data::Int32(10), Data::Str("yyy".into())],
        vec![Data::Int32(20), Data::Int32(20), Data::Str("uuu".into())],
        vec![Data::Int32(30), Data::Int32(30), Data::Str("vvv".into())],
    ]);
    assert_eq!(rows, expected);
}

#[test]
fn test_s6_seven_way_chain_with_singleton_pinning() {
    // Table0 holds exactly one surviving row; the chain pins every other
    // relation down to the two matching rows of Table2.
    let tables: Vec<(Vec<Vec<Data>>, Vec<DataType>)> = vec![
        // Table0: the singleton (10, 111).
        (
            vec![vec![Data::Int32(10), Data::Int32(111)]],
            vec![DataType::Int32, DataType::Int32],
        ),
        // Table1: joins Table0 on 111.
        (
            vec![
                vec![Data::Int32(111), Data::Int32(5)],
                vec![Data::Int32(112), Data::Int32(6)],
            ],
            vec![DataType::Int32, DataType::Int32],
        ),
        // Table2: two rows match key 5.
        (
            vec![
                vec![Data::Int32(5), Data::Int32(77)],
                vec![Data::Int32(5), Data::Int32(78)],
                vec![Data::Int32(9), Data::Int32(99)],
            ],
            vec![DataType::Int32, DataType::Int32],
        ),
        // Tables 3..6: singleton-like links keyed off 77/78.
        (
            vec![
                vec![Data::Int32(77), Data::Int32(1000)],
                vec![Data::Int32(78), Data::Int32(1000)],
                vec![Data::Int32(99), Data::Int32(2000)],
            ],
            vec![DataType::Int32, DataType::Int32],
        ),
        (
            vec![
                vec![Data::Int32(1000), Data::Int32(41)],
                vec![Data::Int32(2000), Data::Int32(42)],
            ],
            vec![DataType::Int32, DataType::Int32],
        ),
        (
            vec![vec![Data::Int32(41), Data::Int32(7)], vec![Data::Int32(43), Data::Int32(8)]],
            vec![DataType::Int32, DataType::Int32],
        ),
        (
            vec![vec![Data::Int32(7)], vec![Data::Int32(9)]],
            vec![DataType::Int32],
        ),
    ];

    let mut plan = Plan::default();
    let mut scans = Vec::new();
    for (rows, types) in &tables {
        let id = plan.new_input(plan::from_rows(rows, types));
        scans.push(
            plan.new_scan_node(id, types.iter().copied().enumerate().collect()),
        );
    }

    // Left-deep chain: each join keys the rightmost produced column of the
    // accumulated left side against column 0 of the next table, keeping
    // (left key context, new table's second column) around.
    let reference: Vec<RefTable> = tables
        .iter()
        .map(|(rows, _)| RefTable { rows: rows.clone() })
        .collect();

    let mut current = scans[0];
    let mut current_ref = RefTable { rows: reference[0].rows.clone() };
    let mut current_width = 2;
    for (i, &scan) in scans.iter().enumerate().skip(1) {
        let right_width = tables[i].1.len();
        // Keep every column of both sides.
        let output: Vec<(usize, DataType)> = (0..current_width)
            .map(|c| (c, DataType::Int32))
            .chain((0..right_width).map(|c| (current_width + c, DataType::Int32)))
            .collect();
        let output_indices: Vec<usize> = (0..current_width + right_width).collect();
        current = plan.new_join_node(
            i % 2 == 0,
            current,
            scan,
            current_width - 1,
            0,
            output,
        );
        current_ref = reference_join(
            &current_ref,
            &reference[i],
            current_width - 1,
            0,
            &output_indices,
        );
        current_width += right_width;
    }
    plan.root = current;

    let rows = sort_rows(run_plan(&plan));
    let expected = sort_rows(current_ref.rows);
    assert_eq!(rows.len(), 2, "chain pins the output to Table2's two rows");
    assert_eq!(rows, expected);
}

#[test]
fn test_three_way_join_matches_reference() {
    // Deterministic pseudo-random data with duplicates and nulls.
    let mut seed = 42u64;
    let mut next = move || {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (seed >> 33) as u32
    };
    let mut make_rows = |count: usize, key_range: u32| -> Vec<Vec<Data>> {
        (0..count)
            .map(|_| {
                let key = next() % key_range;
                let value = next() % 1000;
                let key = if key == 0 { Data::Null } else { Data::Int32(key as i32) };
                vec![key, Data::Int32(value as i32)]
            })
            .collect()
    };
    let a = make_rows(300, 40);
    let b = make_rows(200, 40);
    let c = make_rows(100, 40);
    let types = vec![DataType::Int32, DataType::Int32];

    let mut plan = Plan::default();
    let ids: Vec<usize> = [&a, &b, &c]
        .iter()
        .map(|rows| plan.new_input(plan::from_rows(rows, &types)))
        .collect();
    let scans: Vec<usize> = ids
        .iter()
        .map(|&id| plan.new_scan_node(id, vec![(0, DataType::Int32), (1, DataType::Int32)]))
        .collect();
    let ab = plan.new_join_node(
        false,
        scans[0],
        scans[1],
        0,
        0,
        vec![
            (0, DataType::Int32),
            (1, DataType::Int32),
            (2, DataType::Int32),
            (3, DataType::Int32),
        ],
    );
    plan.root = plan.new_join_node(
        true,
        ab,
        scans[2],
        0,
        0,
        vec![(1, DataType::Int32), (3, DataType::Int32), (5, DataType::Int32)],
    );

    let got = sort_rows(run_plan(&plan));

    let ab_ref = reference_join(
        &RefTable { rows: a },
        &RefTable { rows: b },
        0,
        0,
        &[0, 1, 2, 3],
    );
    let abc_ref =
        reference_join(&ab_ref, &RefTable { rows: c }, 0, 0, &[1, 3, 5]);
    assert_eq!(got.len(), abc_ref.rows.len());
    assert_eq!(got, sort_rows(abc_ref.rows));
}

#[test]
fn test_passthrough_types_survive_join() {
    let r: Vec<Vec<Data>> = vec![
        vec![Data::Int32(1), Data::Int64(1 << 40), Data::Fp64(2.5)],
        vec![Data::Int32(2), Data::Null, Data::Fp64(-1.0)],
    ];
    let s: Vec<Vec<Data>> =
        vec![vec![Data::Int32(1)], vec![Data::Int32(2)], vec![Data::Int32(3)]];
    let mut plan = Plan::default();
    let r_id =
        plan.new_input(plan::from_rows(&r, &[DataType::Int32, DataType::Int64, DataType::Fp64]));
    let s_id = plan.new_input(plan::from_rows(&s, &[DataType::Int32]));
    let r_scan = plan.new_scan_node(
        r_id,
        vec![(0, DataType::Int32), (1, DataType::Int64), (2, DataType::Fp64)],
    );
    let s_scan = plan.new_scan_node(s_id, vec![(0, DataType::Int32)]);
    plan.root = plan.new_join_node(
        true,
        r_scan,
        s_scan,
        0,
        0,
        vec![(0, DataType::Int32), (1, DataType::Int64), (2, DataType::Fp64)],
    );
    let rows = sort_rows(run_plan(&plan));
    assert_eq!(
        rows,
        sort_rows(vec![
            vec![Data::Int32(1), Data::Int64(1 << 40), Data::Fp64(2.5)],
            vec![Data::Int32(2), Data::Null, Data::Fp64(-1.0)],
        ])
    );
}

#[test]
fn test_long_strings_survive_join() {
    let long_a = "a".repeat(20_000);
    let long_b = "b".repeat(9_000);
    let r: Vec<Vec<Data>> = vec![
        vec![Data::Int32(1), Data::Str(long_a.clone())],
        vec![Data::Int32(2), Data::Str(long_b.clone())],
        vec![Data::Int32(3), Data::Str("short".into())],
    ];
    let s: Vec<Vec<Data>> = vec![vec![Data::Int32(1)], vec![Data::Int32(2)]];
    let mut plan = Plan::default();
    let r_id = plan.new_input(plan::from_rows(&r, &[DataType::Int32, DataType::Varchar]));
    let s_id = plan.new_input(plan::from_rows(&s, &[DataType::Int32]));
    let r_scan =
        plan.new_scan_node(r_id, vec![(0, DataType::Int32), (1, DataType::Varchar)]);
    let s_scan = plan.new_scan_node(s_id, vec![(0, DataType::Int32)]);
    plan.root = plan.new_join_node(
        false,
        r_scan,
        s_scan,
        0,
        0,
        vec![(0, DataType::Int32), (1, DataType::Varchar)],
    );
    let rows = sort_rows(run_plan(&plan));
    assert_eq!(
        rows,
        sort_rows(vec![
            vec![Data::Int32(1), Data::Str(long_a)],
            vec![Data::Int32(2), Data::Str(long_b)],
        ])
    );
}

#[test]
fn test_page_pool_conservation_across_queries() {
    let plan = two_table_plan(
        (0..2000).map(|i| vec![Data::Int32(i % 97)]).collect(),
        vec![DataType::Int32],
        (0..500).map(|i| vec![Data::Int32(i % 97)]).collect(),
        vec![DataType::Int32],
        true,
        vec![(0, DataType::Int32), (1, DataType::Int32)],
    );
    {
        let ctx = ENGINE.lock();
        let first = execute(&plan, &ctx).expect("first run");
        drop(first);
        let second = execute(&plan, &ctx).expect("second run");
        let after_second = page_pool::occupied_pages();
        drop(second);
        let third = execute(&plan, &ctx).expect("third run");
        let after_third = page_pool::occupied_pages();
        drop(third);
        // Dropped pages return to the pool at the next query start, so a
        // repeated identical query settles at the same occupancy.
        assert_eq!(after_second, after_third);
    }
}

#[test]
fn test_wide_key_range_uses_bloom_filters() {
    // Many distinct keys with partial overlap exercises the bloom-slot
    // path rather than the tiny-table lowering.
    let r: Vec<Vec<Data>> =
        (0..4000).map(|i| vec![Data::Int32(i), Data::Int32(i * 2)]).collect();
    let s: Vec<Vec<Data>> = (3000..5000).map(|i| vec![Data::Int32(i)]).collect();
    let types = vec![DataType::Int32, DataType::Int32];
    let mut plan = Plan::default();
    let r_id = plan.new_input(plan::from_rows(&r, &types));
    let s_id = plan.new_input(plan::from_rows(&s, &[DataType::Int32]));
    let r_scan =
        plan.new_scan_node(r_id, vec![(0, DataType::Int32), (1, DataType::Int32)]);
    let s_scan = plan.new_scan_node(s_id, vec![(0, DataType::Int32)]);
    plan.root = plan.new_join_node(
        false,
        r_scan,
        s_scan,
        0,
        0,
        vec![(0, DataType::Int32), (1, DataType::Int32)],
    );
    let rows = sort_rows(run_plan(&plan));
    assert_eq!(rows.len(), 1000);
    for row in &rows {
        let Data::Int32(k) = row[0] else { panic!("unexpected null") };
        assert!((3000..4000).contains(&k));
        assert_eq!(row[1], Data::Int32(k * 2));
    }
}
