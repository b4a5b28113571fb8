//! Generic tree switch topology strategy
//!
//! Picks the top switch spanning the request, then grows the selection one
//! leaf switch at a time, always choosing the leaf closest (by accumulated
//! switch distance) to the leaves already in use. When the result lands on
//! more leaf switches than the job asked for and the request has node-count
//! slack, the whole selection phase is retried with one node fewer, until
//! the constraint is met or the slack runs out.

use std::cmp::Ordering;

use tracing::debug;

use crate::bitmap::NodeMask;
use crate::error::{Result, SelectError};
use crate::gres::GresAccum;
use crate::topology::{dist_add, SwitchTable};
use crate::types::build_weight_buckets;

use super::common::{enough_nodes, leaf_switches_used, switch_wait_secs, Counters};
use super::EvalContext;

/// Usable candidate count and CPU sum under every switch
fn switch_usage(ctx: &EvalContext<'_>, sw_nodes: &[NodeMask]) -> Vec<(i64, i64)> {
    sw_nodes
        .iter()
        .map(|mask| {
            let mut nodes = 0i64;
            let mut cpus = 0i64;
            for n in mask.iter_set() {
                if ctx.node_map.test(n) || ctx.avail_res[n].avail_cpus == 0 {
                    continue;
                }
                nodes += 1;
                cpus += ctx.avail_res[n].avail_cpus as i64;
            }
            (nodes, cpus)
        })
        .collect()
}

/// Rank switch `a` against incumbent `b` for the remaining request
///
/// A switch that fits the whole remainder beats one that does not; between
/// two that fit, fewer spare nodes win; between two that do not, more nodes
/// win, walking up the parent ladder while the counts stay tied. The final
/// tie goes to the lower level, then the larger candidate count.
fn compare_switches(
    table: &SwitchTable,
    usage: &[(i64, i64)],
    a: usize,
    b: usize,
    rem_nodes: i64,
    rem_cpus: i64,
) -> Ordering {
    let (orig_a, orig_b) = (a, b);
    let (mut a, mut b) = (a, b);
    loop {
        let a_fit = usage[a].0 >= rem_nodes && usage[a].1 >= rem_cpus;
        let b_fit = usage[b].0 >= rem_nodes && usage[b].1 >= rem_cpus;
        if a_fit && b_fit {
            match usage[a].0.cmp(&usage[b].0) {
                Ordering::Less => return Ordering::Greater,
                Ordering::Greater => return Ordering::Less,
                Ordering::Equal => break,
            }
        } else if a_fit {
            return Ordering::Greater;
        } else if b_fit {
            return Ordering::Less;
        } else {
            match usage[a].0.cmp(&usage[b].0) {
                Ordering::Greater => return Ordering::Greater,
                Ordering::Less => return Ordering::Less,
                Ordering::Equal => {}
            }
            match (table.switches[a].parent, table.switches[b].parent) {
                (Some(pa), Some(pb)) if pa != pb => {
                    a = pa;
                    b = pb;
                }
                _ => break,
            }
        }
    }
    match table.switches[orig_b].level.cmp(&table.switches[orig_a].level) {
        Ordering::Equal => usage[orig_a].0.cmp(&usage[orig_b].0),
        other => other,
    }
}

/// Pre-selection state restored when the overshoot retry relaxes the
/// request
struct Snapshot {
    node_map: NodeMask,
    sw_required: Vec<bool>,
    sw_nodes: Vec<NodeMask>,
    avail_cpus: Vec<u32>,
    counters: Counters,
    gres_accum: GresAccum,
}

pub(crate) fn eval_topo(ctx: &mut EvalContext<'_>) -> Result<()> {
    let cluster = ctx.cluster;
    let Some(table) = cluster.switches.as_ref() else {
        return Err(SelectError::invalid("no switch topology configured"));
    };
    let time_waiting = switch_wait_secs(&ctx.job);
    let mut counters = Counters::init(ctx);
    let orig_node_map = ctx.node_map.clone();
    let req_mask = ctx.job.req_node_mask.clone();

    let nsw = table.len();
    let mut sw_nodes: Vec<NodeMask> = table
        .switches
        .iter()
        .map(|s| s.nodes.and(&orig_node_map))
        .collect();

    // Top switch: highest level covering every required node, else the
    // highest level with enough capacity over the lowest-weight bucket.
    let mut top: Option<usize> = None;
    if let Some(req) = &req_mask {
        for (i, switch) in table.switches.iter().enumerate() {
            if sw_nodes[i].is_superset_of(req)
                && top.map_or(true, |t| switch.level > table.switches[t].level)
            {
                top = Some(i);
            }
        }
        if top.is_none() {
            return Err(SelectError::Locality("switch"));
        }
    } else {
        let usage = switch_usage(ctx, &sw_nodes);
        let buckets = build_weight_buckets(&cluster.nodes, &orig_node_map);
        let mut top_weight = u64::MAX;
        if let Some(lowest) = buckets.first() {
            for (i, switch) in table.switches.iter().enumerate() {
                let (node_cnt, cpu_cnt) = usage[i];
                if cpu_cnt < counters.rem_cpus
                    || !enough_nodes(
                        node_cnt,
                        counters.rem_nodes,
                        ctx.min_nodes as i64,
                        ctx.req_nodes as i64,
                    )
                {
                    continue;
                }
                if !sw_nodes[i].overlaps(&lowest.nodes) {
                    continue;
                }
                let weight = sw_nodes[i]
                    .iter_set()
                    .map(|n| cluster.nodes[n].sched_weight)
                    .min()
                    .unwrap_or(u64::MAX);
                let better = match top {
                    None => true,
                    Some(t) => {
                        switch.level > table.switches[t].level
                            || (switch.level == table.switches[t].level && weight < top_weight)
                    }
                };
                if better {
                    top = Some(i);
                    top_weight = weight;
                }
            }
        }
        if top.is_none() {
            return Err(SelectError::InsufficientResources);
        }
    }
    let top = top.unwrap();
    debug!(
        job_id = ctx.job.job_id,
        top_switch = %table.switches[top].name,
        "topology top switch chosen"
    );

    let had_required = ctx.absorb_required(&mut counters)?;
    ctx.reset_to_required();
    if had_required && counters.satisfied(ctx) {
        return Ok(());
    }

    // Only nodes reachable from the top switch stay in play.
    let top_nodes = sw_nodes[top].clone();
    for (i, mask) in sw_nodes.iter_mut().enumerate() {
        if i != top {
            mask.and_assign(&top_nodes);
        }
    }

    let (best_nodes, satisfied) = ctx.build_best_nodes(&mut counters, &top_nodes);
    if satisfied {
        return Ok(());
    }

    // Switches already carrying selected nodes are fixed points.
    let mut sw_required = vec![false; nsw];
    for (i, mask) in sw_nodes.iter().enumerate() {
        if mask.overlaps(&ctx.node_map) {
            sw_required[i] = true;
        }
    }

    let snapshot = Snapshot {
        node_map: ctx.node_map.clone(),
        sw_required: sw_required.clone(),
        sw_nodes: sw_nodes.clone(),
        avail_cpus: ctx.avail_res.iter().map(|r| r.avail_cpus).collect(),
        counters,
        gres_accum: ctx.gres_accum.clone(),
    };
    let absorbed = ctx.node_map.count() as i64;
    let mut req_nodes_cur = ctx.req_nodes as i64;

    loop {
        // Fill leaves that already hold selected nodes before adding any.
        for i in 0..nsw {
            if !sw_required[i] || table.switches[i].level != 0 {
                continue;
            }
            if counters.max_nodes <= 0 || counters.satisfied(ctx) {
                break;
            }
            let cands: Vec<usize> = sw_nodes[i]
                .iter_set()
                .filter(|&n| {
                    best_nodes.test(n) && !ctx.node_map.test(n) && ctx.avail_res[n].avail_cpus > 0
                })
                .collect();
            for n in cands {
                if counters.max_nodes <= 0 || counters.satisfied(ctx) {
                    break;
                }
                ctx.try_take_node(n, &mut counters);
            }
        }

        // Add leaf switches by accumulated distance to the ones in use.
        while counters.max_nodes > 0 && !counters.satisfied(ctx) {
            let usage = switch_usage(ctx, &sw_nodes);
            let mut dist = vec![0u64; nsw];
            for required in 0..nsw {
                if !sw_required[required] {
                    continue;
                }
                for (i, d) in dist.iter_mut().enumerate() {
                    *d = dist_add(*d, table.dist(required, i));
                }
            }
            let mut best: Option<usize> = None;
            for i in 0..nsw {
                if table.switches[i].level != 0 || sw_required[i] {
                    continue;
                }
                if usage[i].0 == 0 || dist[i] == u64::MAX {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some(b) => {
                        dist[i] < dist[b]
                            || (dist[i] == dist[b]
                                && compare_switches(
                                    table,
                                    &usage,
                                    i,
                                    b,
                                    counters.rem_nodes,
                                    counters.rem_cpus,
                                ) == Ordering::Greater)
                    }
                };
                if better {
                    best = Some(i);
                }
            }
            let Some(leaf) = best else { break };
            sw_required[leaf] = true;
            debug!(
                job_id = ctx.job.job_id,
                leaf = %table.switches[leaf].name,
                "adding leaf switch"
            );
            let cands: Vec<usize> = sw_nodes[leaf]
                .iter_set()
                .filter(|&n| {
                    best_nodes.test(n) && !ctx.node_map.test(n) && ctx.avail_res[n].avail_cpus > 0
                })
                .collect();
            for n in cands {
                if counters.max_nodes <= 0 || counters.satisfied(ctx) {
                    break;
                }
                ctx.try_take_node(n, &mut counters);
            }
        }

        if !counters.satisfied(ctx) {
            return Err(SelectError::InsufficientResources);
        }

        // Overshoot check: more leaves than requested may warrant a retry
        // with one node of slack given up.
        if ctx.job.req_switch > 0 {
            let leafs = leaf_switches_used(table, &ctx.node_map);
            if leafs > ctx.job.req_switch {
                if time_waiting < ctx.job.wait4switch as i64 {
                    if req_nodes_cur > ctx.min_nodes as i64 && leafs > 1 {
                        req_nodes_cur -= 1;
                        ctx.node_map = snapshot.node_map.clone();
                        sw_required = snapshot.sw_required.clone();
                        sw_nodes = snapshot.sw_nodes.clone();
                        for (i, &avail) in snapshot.avail_cpus.iter().enumerate() {
                            ctx.avail_res[i].avail_cpus = avail;
                        }
                        ctx.gres_accum = snapshot.gres_accum.clone();
                        counters = snapshot.counters;
                        counters.rem_nodes = Counters::base_rem_nodes(
                            counters.gres_per_job,
                            ctx.min_nodes as i64,
                            req_nodes_cur,
                        ) - absorbed;
                        debug!(
                            job_id = ctx.job.job_id,
                            req_nodes = req_nodes_cur,
                            "too many leaf switches; retrying with a relaxed node count"
                        );
                        continue;
                    }
                    ctx.job.best_switch = false;
                } else {
                    debug!(
                        job_id = ctx.job.job_id,
                        waited = time_waiting,
                        leafs,
                        "switch wait expired; accepting the wider placement"
                    );
                    ctx.job.best_switch = true;
                }
            }
        }
        return Ok(());
    }
}
