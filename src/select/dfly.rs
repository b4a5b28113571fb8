//! Dragonfly switch topology strategy
//!
//! Dragonfly fabrics want a job either on one leaf switch or spread
//! round-robin across the leaves under one top switch. The strategy picks
//! the top switch, tries to satisfy the request from a single leaf, and
//! otherwise distributes one node per leaf per pass. After success it
//! checks the job's leaf-switch constraint and flags `best_switch = false`
//! when waiting longer might improve locality.

use tracing::debug;

use crate::error::{Result, SelectError};
use crate::topology::SwitchTable;
use crate::types::build_weight_buckets;

use super::common::{enough_nodes, leaf_switches_used, switch_wait_secs, Counters};
use super::EvalContext;

/// Set the advisory locality flag after a successful selection
fn advisory_best_switch(ctx: &mut EvalContext<'_>, table: &SwitchTable, time_waiting: i64) {
    if ctx.job.req_switch == 0 {
        return;
    }
    let leafs = leaf_switches_used(table, &ctx.node_map);
    if leafs > ctx.job.req_switch && time_waiting < ctx.job.wait4switch as i64 {
        debug!(
            job_id = ctx.job.job_id,
            leafs,
            req_switch = ctx.job.req_switch,
            "leaf switch constraint unmet; advising the caller to wait"
        );
        ctx.job.best_switch = false;
    }
}

pub(crate) fn eval_dfly(ctx: &mut EvalContext<'_>) -> Result<()> {
    let cluster = ctx.cluster;
    let Some(table) = cluster.switches.as_ref() else {
        return Err(SelectError::invalid("no switch topology configured"));
    };
    if ctx.job.req_switch > 1 {
        debug!(
            job_id = ctx.job.job_id,
            req_switch = ctx.job.req_switch,
            "dragonfly supports one leaf switch; clamping the request"
        );
        ctx.job.req_switch = 1;
    }
    let time_waiting = switch_wait_secs(&ctx.job);
    let mut counters = Counters::init(ctx);
    let orig_node_map = ctx.node_map.clone();
    let req_mask = ctx.job.req_node_mask.clone();

    // Per-switch candidate sets and the top switch.
    let nsw = table.len();
    let mut sw_nodes: Vec<_> = table
        .switches
        .iter()
        .map(|s| s.nodes.and(&orig_node_map))
        .collect();
    let mut sw_required = vec![false; nsw];
    let mut top: Option<usize> = None;
    if let Some(req) = &req_mask {
        for (i, switch) in table.switches.iter().enumerate() {
            if !sw_nodes[i].overlaps(req) {
                continue;
            }
            if sw_nodes[i].is_superset_of(req)
                && top.map_or(true, |t| switch.level > table.switches[t].level)
            {
                top = Some(i);
            }
            if switch.level == 0 {
                sw_required[i] = true;
            }
        }
        if top.is_none() {
            return Err(SelectError::Locality("switch"));
        }
    } else {
        let buckets = build_weight_buckets(&cluster.nodes, &orig_node_map);
        if let Some(lowest) = buckets.first() {
            for (i, switch) in table.switches.iter().enumerate() {
                if !sw_nodes[i].overlaps(&lowest.nodes) {
                    continue;
                }
                if top.map_or(true, |t| switch.level > table.switches[t].level) {
                    top = Some(i);
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
        "dragonfly top switch chosen"
    );

    let had_required = ctx.absorb_required(&mut counters)?;
    ctx.reset_to_required();
    if had_required && counters.satisfied(ctx) {
        advisory_best_switch(ctx, table, time_waiting);
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
        advisory_best_switch(ctx, table, time_waiting);
        return Ok(());
    }

    // With no required leaf, start from the leaf with the most candidates.
    let have_req_leaf = (0..nsw).any(|i| sw_required[i] && table.switches[i].level == 0);
    if !have_req_leaf {
        let mut best_leaf: Option<usize> = None;
        for (i, switch) in table.switches.iter().enumerate() {
            if switch.level != 0 || sw_nodes[i].count() == 0 {
                continue;
            }
            if best_leaf.map_or(true, |b| sw_nodes[i].count() > sw_nodes[b].count()) {
                best_leaf = Some(i);
            }
        }
        if let Some(leaf) = best_leaf {
            sw_required[leaf] = true;
        }
    }

    // One required leaf that satisfies the whole remainder: take it.
    let req_leafs: Vec<usize> = (0..nsw)
        .filter(|&i| sw_required[i] && table.switches[i].level == 0)
        .collect();
    if req_leafs.len() == 1 {
        let leaf = req_leafs[0];
        let usable: Vec<usize> = sw_nodes[leaf]
            .iter_set()
            .filter(|&n| best_nodes.test(n) && !ctx.node_map.test(n) && ctx.avail_res[n].avail_cpus > 0)
            .collect();
        let cpu_sum: i64 = usable.iter().map(|&n| ctx.avail_res[n].avail_cpus as i64).sum();
        if cpu_sum >= counters.rem_cpus
            && enough_nodes(
                usable.len() as i64,
                counters.rem_nodes,
                ctx.min_nodes as i64,
                ctx.req_nodes as i64,
            )
        {
            for n in usable {
                if counters.max_nodes <= 0 || counters.satisfied(ctx) {
                    break;
                }
                ctx.try_take_node(n, &mut counters);
            }
            if counters.satisfied(ctx) {
                advisory_best_switch(ctx, table, time_waiting);
                return Ok(());
            }
        }
    }

    // Round-robin: one node per leaf per pass until drained or stalled.
    let mut prev_rem_nodes = counters.rem_nodes + 1;
    while counters.rem_nodes < prev_rem_nodes
        && !counters.satisfied(ctx)
        && counters.max_nodes > 0
    {
        prev_rem_nodes = counters.rem_nodes;
        for (i, switch) in table.switches.iter().enumerate() {
            if switch.level != 0 {
                continue;
            }
            if counters.satisfied(ctx) || counters.max_nodes <= 0 {
                break;
            }
            let cands: Vec<usize> = sw_nodes[i]
                .iter_set()
                .filter(|&n| {
                    best_nodes.test(n) && !ctx.node_map.test(n) && ctx.avail_res[n].avail_cpus > 0
                })
                .collect();
            for n in cands {
                if ctx.try_take_node(n, &mut counters) {
                    break;
                }
            }
        }
    }

    if counters.satisfied(ctx) {
        advisory_best_switch(ctx, table, time_waiting);
        Ok(())
    } else {
        Err(SelectError::InsufficientResources)
    }
}
