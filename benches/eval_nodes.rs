//! Selection core benchmarks
//!
//! Measures dispatch plus strategy cost over synthetic clusters:
//! - consecutive-run best fit at several cluster sizes
//! - spread and least-loaded weight-group strategies
//! - tree topology with a leaf-switch constraint

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use anvil_select::{
    AvailRes, Cluster, CrType, EvalContext, JobRequest, NodeMask, NodeRecord, NullGres,
    SelectInput, Switch, SwitchTable,
};

/// Create a test cluster with `node_count` nodes of 2x8x2 geometry
fn create_cluster(node_count: usize) -> Cluster {
    let nodes = (0..node_count)
        .map(|i| {
            NodeRecord::new(format!("node{:04}", i), 2, 8, 2)
                .with_weight(10 + (i % 4) as u64 * 10)
        })
        .collect();
    Cluster::new(nodes)
}

/// Same geometry, plus a two-level switch tree with 8-node leaves
fn create_switched_cluster(node_count: usize) -> Cluster {
    let cluster = create_cluster(node_count);
    let leaf_size = 8;
    let leaf_count = node_count.div_ceil(leaf_size);
    let mut switches = Vec::new();
    for leaf in 0..leaf_count {
        let lo = leaf * leaf_size;
        let hi = (lo + leaf_size).min(node_count);
        let indices: Vec<usize> = (lo..hi).collect();
        switches.push(
            Switch::leaf(format!("leaf{}", leaf), NodeMask::from_indices(node_count, &indices))
                .with_parent(leaf_count),
        );
    }
    switches.push(Switch::interior("spine", 1, NodeMask::full(node_count)));
    cluster.with_switches(SwitchTable::new(switches))
}

fn input_for(cluster: &Cluster, min: u32, req: u32) -> SelectInput {
    let n = cluster.node_count();
    let avail_res = (0..n).map(|_| AvailRes::new(16)).collect();
    SelectInput::new(NodeMask::full(n), avail_res).nodes(min, req, n as u32)
}

fn bench_consec(c: &mut Criterion) {
    let mut group = c.benchmark_group("consec");
    for node_count in [16usize, 64, 256] {
        let cluster = create_cluster(node_count);
        group.bench_with_input(
            BenchmarkId::from_parameter(node_count),
            &node_count,
            |b, _| {
                b.iter(|| {
                    let job = JobRequest::new(1, 64);
                    let input = input_for(&cluster, 4, 4);
                    let mut ctx = EvalContext::new(&cluster, &NullGres, job, input);
                    black_box(anvil_select::eval_nodes(&mut ctx)).unwrap();
                });
            },
        );
    }
    group.finish();
}

fn bench_weight_groups(c: &mut Criterion) {
    let cluster = create_cluster(128);
    c.bench_function("spread_128", |b| {
        b.iter(|| {
            let job = JobRequest::new(1, 128).spread();
            let input = input_for(&cluster, 8, 8);
            let mut ctx = EvalContext::new(&cluster, &NullGres, job, input);
            black_box(anvil_select::eval_nodes(&mut ctx)).unwrap();
        });
    });
    c.bench_function("lln_128", |b| {
        b.iter(|| {
            let job = JobRequest::new(1, 128);
            let input = input_for(&cluster, 8, 8).with_cr_type(CrType::LLN);
            let mut ctx = EvalContext::new(&cluster, &NullGres, job, input);
            black_box(anvil_select::eval_nodes(&mut ctx)).unwrap();
        });
    });
}

fn bench_topology(c: &mut Criterion) {
    let cluster = create_switched_cluster(128);
    c.bench_function("topo_128_switch_constraint", |b| {
        b.iter(|| {
            let mut job = JobRequest::new(1, 64).with_switches(1, 0);
            job.wait4switch_start = Some(chrono::Utc::now());
            let input = input_for(&cluster, 4, 8);
            let mut ctx = EvalContext::new(&cluster, &NullGres, job, input);
            black_box(anvil_select::eval_nodes(&mut ctx)).unwrap();
        });
    });
}

criterion_group!(benches, bench_consec, bench_weight_groups, bench_topology);
criterion_main!(benches);
