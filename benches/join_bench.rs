use criterion::{criterion_group, criterion_main, Criterion};

use morseldb::config::env_flag;
use morseldb::query::plan::{self, Data, Plan};
use morseldb::{build_context_with, execute, DataType, EngineConfig};

fn build_plan(rows: usize) -> Plan {
    let r: Vec<Vec<Data>> = (0..rows)
        .map(|i| vec![Data::Int32((i % 4093) as i32), Data::Int32(i as i32)])
        .collect();
    let s: Vec<Vec<Data>> =
        (0..rows / 8).map(|i| vec![Data::Int32((i % 4093) as i32)]).collect();
    let types = vec![DataType::Int32, DataType::Int32];

    let mut plan = Plan::default();
    let r_id = plan.new_input(plan::from_rows(&r, &types));
    let s_id = plan.new_input(plan::from_rows(&s, &[DataType::Int32]));
    let r_scan = plan.new_scan_node(r_id, vec![(0, DataType::Int32), (1, DataType::Int32)]);
    let s_scan = plan.new_scan_node(s_id, vec![(0, DataType::Int32)]);
    plan.root = plan.new_join_node(
        false,
        r_scan,
        s_scan,
        0,
        0,
        vec![(0, DataType::Int32), (1, DataType::Int32)],
    );
    plan
}

fn bench_two_way_join(c: &mut Criterion) {
    let ctx = build_context_with(EngineConfig {
        page_pool_bytes: Some(512 << 20),
        query_pool_bytes: Some(512 << 20),
        ..EngineConfig::from_env()
    });
    let check = env_flag("MORSELDB_CHECKRESULT").unwrap_or(false);
    let repeat: usize = std::env::var("MORSELDB_REPEAT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let plan = build_plan(200_000);

    c.bench_function("two_way_join_200k", |b| {
        b.iter(|| {
            for _ in 0..repeat {
                let result = execute(&plan, &ctx).expect("query executes");
                if check {
                    assert!(result.num_rows > 0);
                }
            }
        })
    });
}

criterion_group!(benches, bench_two_way_join);
criterion_main!(benches);
