//! End-to-end selection scenarios over the public surface
//!
//! Covers the boundary cases every strategy must get right: required-node
//! absorption, consecutive best fit, spread vs least-loaded ordering,
//! topology retries, block locality failures, and the invariant laws that
//! hold on every successful selection.

use anvil_select::{
    build_weight_buckets, choose_strategy, enough_nodes, eval_nodes, AvailRes, BaseBlock,
    BlockTable, Cluster, CountingGres, CrType, EvalContext, GresRequest, JobRequest, NodeMask,
    NodeRecord, NullGres, SelectConfig, SelectError, SelectInput, Selector, SockGres, Strategy,
    Switch, SwitchTable,
};

/// Route strategy tracing to the test output when `RUST_LOG` is set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn uniform_nodes(count: usize, cores: u32) -> Vec<NodeRecord> {
    (0..count)
        .map(|i| NodeRecord::new(format!("n{}", i), 1, cores, 1).with_weight(10))
        .collect()
}

fn flat_avail(count: usize, cpus: u32) -> Vec<AvailRes> {
    (0..count).map(|_| AvailRes::new(cpus)).collect()
}

/// Invariants that must hold on every successful selection.
fn assert_selection_invariants(
    ctx: &EvalContext<'_>,
    candidates: &NodeMask,
    min_nodes: u32,
    max_nodes: u32,
    job: &JobRequest,
) {
    assert!(
        candidates.is_superset_of(&ctx.node_map),
        "selected nodes must come from the candidates"
    );
    let selected = ctx.node_map.count() as u32;
    assert!(selected >= min_nodes, "node minimum violated");
    assert!(selected <= max_nodes, "node maximum violated");
    let total: u64 = ctx
        .node_map
        .iter_set()
        .map(|i| ctx.avail_res[i].avail_cpus as u64)
        .sum();
    assert!(total >= job.min_cpus as u64, "cpu minimum violated");
    if let Some(max_cpus) = job.max_cpus {
        assert!(total <= max_cpus as u64, "cpu maximum violated");
    }
    if let Some(req) = &job.req_node_mask {
        assert!(
            ctx.node_map.is_superset_of(req),
            "required nodes must be selected"
        );
    }
    for i in 0..ctx.node_map.len() {
        if !ctx.node_map.test(i) {
            assert_eq!(ctx.avail_res[i].avail_cpus, 0, "unselected nodes carry no cpus");
        }
    }
}

// ---------------------------------------------------------------------------
// Boundary scenarios
// ---------------------------------------------------------------------------

#[test]
fn required_nodes_satisfy_request() {
    init_tracing();
    let cluster = Cluster::new(uniform_nodes(4, 8));
    let job = JobRequest::new(1, 16).require_nodes(NodeMask::from_indices(4, &[0, 1]));
    let input = SelectInput::new(NodeMask::full(4), flat_avail(4, 8)).nodes(2, 2, 4);
    let candidates = input.candidates.clone();
    let mut ctx = EvalContext::new(&cluster, &NullGres, job.clone(), input);

    eval_nodes(&mut ctx).unwrap();
    assert_eq!(ctx.node_map, NodeMask::from_indices(4, &[0, 1]));
    assert_eq!(ctx.avail_res[0].avail_cpus, 8);
    assert_eq!(ctx.avail_res[1].avail_cpus, 8);
    assert_selection_invariants(&ctx, &candidates, 2, 4, &job);
}

#[test]
fn consec_takes_the_sufficient_run() {
    // Gap at index 3: runs [0..2] (12 cpus) and [4..7] (16 cpus).
    let cluster = Cluster::new(uniform_nodes(8, 4));
    let candidates = NodeMask::from_indices(8, &[0, 1, 2, 4, 5, 6, 7]);
    let input = SelectInput::new(candidates, flat_avail(8, 4)).nodes(4, 4, 8);
    let mut ctx = EvalContext::new(&cluster, &NullGres, JobRequest::new(1, 16), input);

    eval_nodes(&mut ctx).unwrap();
    assert_eq!(ctx.node_map, NodeMask::from_indices(8, &[4, 5, 6, 7]));
}

#[test]
fn spread_and_lln_disagree_on_ratio() {
    // Nodes 0..3: 8 of 16 CPUs free. Node 4: all 8 of 8 free.
    let mut nodes = uniform_nodes(5, 16);
    nodes[4] = NodeRecord::new("n4", 1, 8, 1).with_weight(10);
    let cluster = Cluster::new(nodes);

    let spread_input = SelectInput::new(NodeMask::full(5), flat_avail(5, 8)).nodes(2, 2, 5);
    let mut ctx = EvalContext::new(
        &cluster,
        &NullGres,
        JobRequest::new(1, 16).spread(),
        spread_input,
    );
    eval_nodes(&mut ctx).unwrap();
    assert_eq!(ctx.node_map, NodeMask::from_indices(5, &[0, 1]), "spread: index order");

    let lln_input = SelectInput::new(NodeMask::full(5), flat_avail(5, 8))
        .nodes(2, 2, 5)
        .with_cr_type(CrType::LLN);
    let mut ctx = EvalContext::new(&cluster, &NullGres, JobRequest::new(1, 16), lln_input);
    eval_nodes(&mut ctx).unwrap();
    assert!(ctx.node_map.test(4), "lln: the fully-free node wins on ratio");
    assert_eq!(ctx.node_map.count(), 2);
}

#[test]
fn topo_retries_down_to_one_leaf() {
    init_tracing();
    let nodes = uniform_nodes(4, 4);
    let table = SwitchTable::new(vec![
        Switch::leaf("leaf0", NodeMask::from_indices(4, &[0, 1])).with_parent(2),
        Switch::leaf("leaf1", NodeMask::from_indices(4, &[2, 3])).with_parent(2),
        Switch::interior("top", 1, NodeMask::full(4)),
    ]);
    let cluster = Cluster::new(nodes).with_switches(table);

    let mut job = JobRequest::new(1, 4).with_switches(1, u32::MAX);
    job.wait4switch_start = Some(chrono::Utc::now());
    let input = SelectInput::new(NodeMask::full(4), flat_avail(4, 4)).nodes(2, 4, 4);
    let mut ctx = EvalContext::new(&cluster, &NullGres, job, input);

    eval_nodes(&mut ctx).unwrap();
    // The request had node slack; the retry trades nodes for locality.
    assert_eq!(ctx.node_map.count(), 2);
    let table = cluster.switches.as_ref().unwrap();
    let leaves_used = table
        .switches
        .iter()
        .filter(|s| s.level == 0 && s.nodes.overlaps(&ctx.node_map))
        .count();
    assert_eq!(leaves_used, 1);
    assert!(ctx.job.best_switch);
}

#[test]
fn block_required_straddle_is_an_error() {
    let nodes = uniform_nodes(8, 4);
    let blocks: Vec<_> = (0..4)
        .map(|b| BaseBlock::new(format!("bb{}", b), NodeMask::from_indices(8, &[2 * b, 2 * b + 1])))
        .collect();
    let cluster = Cluster::new(nodes).with_blocks(BlockTable::new(blocks, 0b10));

    let job = JobRequest::new(1, 8).require_nodes(NodeMask::from_indices(8, &[1, 4]));
    let input = SelectInput::new(NodeMask::full(8), flat_avail(8, 4)).nodes(2, 2, 8);
    let mut ctx = EvalContext::new(&cluster, &NullGres, job, input);

    assert!(matches!(eval_nodes(&mut ctx), Err(SelectError::Locality(_))));
    assert_eq!(ctx.node_map.count(), 0, "failed selection clears the map");
}

#[test]
fn insufficient_resources_clear_the_map() {
    let cluster = Cluster::new(uniform_nodes(2, 4));
    let input = SelectInput::new(NodeMask::full(2), flat_avail(2, 4)).nodes(1, 1, 2);
    let mut ctx = EvalContext::new(&cluster, &NullGres, JobRequest::new(1, 16), input);

    assert!(matches!(
        eval_nodes(&mut ctx),
        Err(SelectError::InsufficientResources)
    ));
    assert_eq!(ctx.node_map.count(), 0);
}

// ---------------------------------------------------------------------------
// Laws
// ---------------------------------------------------------------------------

#[test]
fn selection_is_idempotent() {
    let cluster = Cluster::new(uniform_nodes(8, 4));
    let candidates = NodeMask::from_indices(8, &[0, 1, 2, 4, 5, 6, 7]);
    let job = JobRequest::new(1, 16);

    let input = SelectInput::new(candidates, flat_avail(8, 4)).nodes(4, 4, 8);
    let mut ctx = EvalContext::new(&cluster, &NullGres, job.clone(), input);
    eval_nodes(&mut ctx).unwrap();
    let first = ctx.node_map.clone();

    // Re-run with the previous selection as the candidate set.
    let input = SelectInput::new(first.clone(), flat_avail(8, 4)).nodes(4, 4, 8);
    let mut ctx = EvalContext::new(&cluster, &NullGres, job, input);
    eval_nodes(&mut ctx).unwrap();
    assert_eq!(ctx.node_map, first);
}

#[test]
fn order_within_a_bucket_is_by_index() {
    // Nodes 1 and 2 share the low weight; index order decides inside it.
    let mut nodes = uniform_nodes(4, 8);
    nodes[0].sched_weight = 20;
    nodes[1].sched_weight = 10;
    nodes[2].sched_weight = 10;
    nodes[3].sched_weight = 20;
    let cluster = Cluster::new(nodes);

    let input = SelectInput::new(NodeMask::full(4), flat_avail(4, 8)).nodes(2, 2, 4);
    let mut ctx = EvalContext::new(&cluster, &NullGres, JobRequest::new(1, 16), input);
    eval_nodes(&mut ctx).unwrap();
    assert_eq!(ctx.node_map, NodeMask::from_indices(4, &[1, 2]));

    let buckets = build_weight_buckets(&cluster.nodes, &NodeMask::full(4));
    assert_eq!(buckets[0].weight, 10);
    assert_eq!(buckets[0].node_cnt, 2);
}

#[test]
fn enough_nodes_is_monotone() {
    for avail in 0..6i64 {
        if enough_nodes(avail, 3, 2, 4) {
            assert!(enough_nodes(avail + 1, 3, 2, 4));
        }
    }
    // With req <= min the predicate is a plain comparison.
    for avail in 0..6i64 {
        assert_eq!(enough_nodes(avail, 3, 3, 3), avail >= 3);
        assert_eq!(enough_nodes(avail, 3, 4, 2), avail >= 3);
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[test]
fn dispatch_follows_rule_order() {
    let nodes = uniform_nodes(4, 4);
    let table = SwitchTable::new(vec![Switch::leaf("leaf0", NodeMask::full(4))]);
    let blocks = BlockTable::new(vec![BaseBlock::new("bb0", NodeMask::full(4))], 0b1);

    let base_input = || SelectInput::new(NodeMask::full(4), flat_avail(4, 4)).nodes(1, 1, 4);

    // Block topology wins over everything.
    let cluster = Cluster::new(nodes.clone())
        .with_switches(table.clone())
        .with_blocks(blocks);
    let ctx = EvalContext::new(
        &cluster,
        &NullGres,
        JobRequest::new(1, 4).spread(),
        base_input(),
    );
    assert_eq!(choose_strategy(&ctx), Strategy::Block);

    // Spread flag beats busy preference.
    let cluster = Cluster::new(nodes.clone());
    let input = base_input().prefer_alloc_nodes();
    let ctx = EvalContext::new(&cluster, &NullGres, JobRequest::new(1, 4).spread(), input);
    assert_eq!(choose_strategy(&ctx), Strategy::Spread);

    // Busy preference, unless the job is contiguous.
    let input = base_input().prefer_alloc_nodes();
    let ctx = EvalContext::new(&cluster, &NullGres, JobRequest::new(1, 4), input);
    assert_eq!(choose_strategy(&ctx), Strategy::Busy);
    let input = base_input().prefer_alloc_nodes();
    let ctx = EvalContext::new(&cluster, &NullGres, JobRequest::new(1, 4).contiguous(), input);
    assert_eq!(choose_strategy(&ctx), Strategy::Consec);

    // LLN via partition flag.
    let input = base_input().lln_partition();
    let ctx = EvalContext::new(&cluster, &NullGres, JobRequest::new(1, 4), input);
    assert_eq!(choose_strategy(&ctx), Strategy::Lln);

    // Serial gate needs the tunable and a 1-cpu/1-node request.
    let cluster_serial = Cluster::new(nodes.clone())
        .with_config(SelectConfig::default().with_sched_params("pack_serial_at_end"));
    let ctx = EvalContext::new(
        &cluster_serial,
        &NullGres,
        JobRequest::new(1, 1),
        base_input(),
    );
    assert_eq!(choose_strategy(&ctx), Strategy::Serial);

    // Tree topology, dragonfly variant behind its tunable.
    let cluster_topo = Cluster::new(nodes.clone()).with_switches(table.clone());
    let ctx = EvalContext::new(
        &cluster_topo,
        &NullGres,
        JobRequest::new(1, 4),
        base_input(),
    );
    assert_eq!(choose_strategy(&ctx), Strategy::Topology);

    let cluster_dfly = Cluster::new(nodes.clone())
        .with_switches(table.clone())
        .with_config(SelectConfig::default().with_topology_param("dragonfly"));
    let ctx = EvalContext::new(
        &cluster_dfly,
        &NullGres,
        JobRequest::new(1, 4),
        base_input(),
    );
    assert_eq!(choose_strategy(&ctx), Strategy::Dragonfly);

    // Optional topology only engages when switches were requested.
    let cluster_opt = Cluster::new(nodes.clone())
        .with_switches(table)
        .with_config(SelectConfig::default().with_topology_param("TopoOptional"));
    let ctx = EvalContext::new(
        &cluster_opt,
        &NullGres,
        JobRequest::new(1, 4),
        base_input(),
    );
    assert_eq!(choose_strategy(&ctx), Strategy::Consec);
    let ctx = EvalContext::new(
        &cluster_opt,
        &NullGres,
        JobRequest::new(1, 4).with_switches(1, 0),
        base_input(),
    );
    assert_eq!(choose_strategy(&ctx), Strategy::Topology);
}

// ---------------------------------------------------------------------------
// GRES and the selector facade
// ---------------------------------------------------------------------------

#[test]
fn per_job_gres_keeps_adding_nodes() {
    let cluster = Cluster::new(uniform_nodes(4, 8));
    let gres = GresRequest::default().per_job("gpu", 4);
    let job = JobRequest::new(1, 4).with_gres(gres);
    let avail_res: Vec<AvailRes> = (0..4)
        .map(|_| AvailRes::new(8).with_sock_gres(vec![SockGres::new("gpu", 2)]))
        .collect();
    let input = SelectInput::new(NodeMask::full(4), avail_res).nodes(1, 1, 4);
    let mut ctx = EvalContext::new(&cluster, &CountingGres, job, input);

    eval_nodes(&mut ctx).unwrap();
    // One node covers the CPUs, but four GPUs need two nodes.
    assert_eq!(ctx.node_map.count(), 2);
}

#[test]
fn selector_facade_round_trip() {
    let selector = Selector::new(Cluster::new(uniform_nodes(4, 8)));
    let mut job = JobRequest::new(7, 16);
    let input = SelectInput::new(NodeMask::full(4), flat_avail(4, 8)).nodes(2, 2, 4);

    let selection = selector.select(&mut job, input).unwrap();
    assert_eq!(selection.nodes.count(), 2);
    assert_eq!(selection.total_cpus, 16);
    assert!(selection.best_switch);
    assert_eq!(selection.cpus_per_node.iter().filter(|&&c| c > 0).count(), 2);

    // A busy cluster steers the busy strategy through the same facade.
    selector.update_cluster(|c| c.mark_busy(3));
    let input = SelectInput::new(NodeMask::full(4), flat_avail(4, 8))
        .nodes(1, 1, 4)
        .prefer_alloc_nodes();
    let mut job = JobRequest::new(8, 8);
    let selection = selector.select(&mut job, input).unwrap();
    assert!(selection.nodes.test(3), "busy node preferred");
}
