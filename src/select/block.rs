//! Block topology strategy
//!
//! Base blocks group into power-of-two block groups; a job must fit inside
//! one group. The group size is the smallest legal size covering the node
//! request, the group is chosen by required nodes or lowest weight, and
//! base blocks inside it are then claimed one at a time, best match first.

use tracing::debug;

use crate::bitmap::NodeMask;
use crate::error::{Result, SelectError};
use crate::topology::BlockTable;

use super::common::{enough_nodes, Counters};
use super::EvalContext;

/// Smallest legal base-blocks-per-group for the remaining node count;
/// `None` means no legal level fits and one group must span everything
fn pick_group_size(table: &BlockTable, rem_nodes: i64) -> Option<usize> {
    let base = table.base_size().max(1) as i64;
    let needed_bblocks = ((rem_nodes.max(1) + base - 1) / base).max(1) as u32;
    let k0 = 32 - (needed_bblocks - 1).leading_zeros();
    (k0..32).find(|k| table.block_levels & (1u32 << k) != 0).map(|k| 1usize << k)
}

/// Usable not-yet-selected candidates of `mask`
fn usable_count(ctx: &EvalContext<'_>, mask: &NodeMask) -> i64 {
    mask.iter_set()
        .filter(|&n| !ctx.node_map.test(n) && ctx.avail_res[n].avail_cpus > 0)
        .count() as i64
}

/// Take usable candidates from `mask` until the request is satisfied
fn fill_from(ctx: &mut EvalContext<'_>, counters: &mut Counters, mask: &NodeMask, best: &NodeMask) {
    let cands: Vec<usize> = mask
        .iter_set()
        .filter(|&n| best.test(n) && !ctx.node_map.test(n) && ctx.avail_res[n].avail_cpus > 0)
        .collect();
    for n in cands {
        if counters.max_nodes <= 0 || counters.satisfied(ctx) {
            return;
        }
        ctx.try_take_node(n, counters);
    }
}

pub(crate) fn eval_block(ctx: &mut EvalContext<'_>) -> Result<()> {
    let cluster = ctx.cluster;
    let Some(table) = cluster.blocks.as_ref() else {
        return Err(SelectError::invalid("no block topology configured"));
    };
    let mut counters = Counters::init(ctx);
    let orig_node_map = ctx.node_map.clone();
    let req_mask = ctx.job.req_node_mask.clone();
    let len = ctx.node_map.len();
    let total_bblocks = table.len();

    let per_group = pick_group_size(table, counters.rem_nodes).unwrap_or(total_bblocks.max(1));
    let group_starts: Vec<usize> = (0..total_bblocks).step_by(per_group.max(1)).collect();
    let group_masks: Vec<NodeMask> = group_starts
        .iter()
        .map(|&start| {
            let mut mask = NodeMask::new(len);
            for b in start..(start + per_group).min(total_bblocks) {
                mask.or_assign(&table.base_blocks[b].nodes);
            }
            mask.and_assign(&orig_node_map);
            mask
        })
        .collect();

    // Choose the block group.
    let group = if let Some(req) = &req_mask {
        let Some(g) = group_masks.iter().position(|m| m.overlaps(req)) else {
            return Err(SelectError::Locality("block"));
        };
        if !group_masks[g].is_superset_of(req) {
            return Err(SelectError::Locality("block"));
        }
        g
    } else {
        let mut chosen: Option<usize> = None;
        let mut chosen_weight = u64::MAX;
        for (g, mask) in group_masks.iter().enumerate() {
            let node_cnt = mask.count() as i64;
            let cpu_cnt: i64 = mask
                .iter_set()
                .map(|n| ctx.avail_res[n].avail_cpus as i64)
                .sum();
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
            let weight = mask
                .iter_set()
                .map(|n| cluster.nodes[n].sched_weight)
                .min()
                .unwrap_or(u64::MAX);
            let better = match chosen {
                None => true,
                Some(c) => {
                    weight < chosen_weight
                        || (weight == chosen_weight && node_cnt < group_masks[c].count() as i64)
                }
            };
            if better {
                chosen = Some(g);
                chosen_weight = weight;
            }
        }
        let Some(g) = chosen else {
            return Err(SelectError::InsufficientResources);
        };
        g
    };
    let group_range = group_starts[group]..(group_starts[group] + per_group).min(total_bblocks);
    debug!(
        job_id = ctx.job.job_id,
        group,
        bblocks = per_group,
        "block group chosen"
    );

    let had_required = ctx.absorb_required(&mut counters)?;
    ctx.reset_to_required();
    if had_required && counters.satisfied(ctx) {
        return Ok(());
    }

    // Base blocks holding required nodes are fixed points.
    let mut bblock_required = vec![false; total_bblocks];
    if let Some(req) = &req_mask {
        for b in group_range.clone() {
            if table.base_blocks[b].nodes.overlaps(req) {
                bblock_required[b] = true;
            }
        }
    }

    let (best_nodes, satisfied) = ctx.build_best_nodes(&mut counters, &group_masks[group]);
    if satisfied {
        return Ok(());
    }

    // Fill required base blocks first.
    for b in group_range.clone() {
        if !bblock_required[b] {
            continue;
        }
        if counters.max_nodes <= 0 || counters.satisfied(ctx) {
            break;
        }
        let mask = table.base_blocks[b].nodes.and(&group_masks[group]);
        fill_from(ctx, &mut counters, &mask, &best_nodes);
    }

    // Claim base blocks best matching the remaining need.
    let mut prev_rem_nodes = counters.rem_nodes + 1;
    while counters.max_nodes > 0
        && !counters.satisfied(ctx)
        && counters.rem_nodes < prev_rem_nodes
    {
        prev_rem_nodes = counters.rem_nodes;
        let mut pick: Option<(usize, i64)> = None;
        for b in group_range.clone() {
            if bblock_required[b] {
                continue;
            }
            let mask = table.base_blocks[b].nodes.and(&best_nodes);
            let nodes_on_bblock = usable_count(ctx, &mask);
            if nodes_on_bblock == 0 {
                continue;
            }
            let better = match pick {
                None => true,
                Some((_, incumbent)) => {
                    let fits = nodes_on_bblock >= counters.rem_nodes;
                    let incumbent_fits = incumbent >= counters.rem_nodes;
                    if fits && incumbent_fits {
                        nodes_on_bblock < incumbent
                    } else if fits {
                        true
                    } else if incumbent_fits {
                        false
                    } else {
                        nodes_on_bblock > incumbent
                    }
                }
            };
            if better {
                pick = Some((b, nodes_on_bblock));
            }
        }
        let Some((b, _)) = pick else { break };
        bblock_required[b] = true;
        debug!(
            job_id = ctx.job.job_id,
            bblock = %table.base_blocks[b].name,
            "claiming base block"
        );
        let mask = table.base_blocks[b].nodes.and(&group_masks[group]);
        fill_from(ctx, &mut counters, &mask, &best_nodes);
    }

    if counters.satisfied(ctx) {
        Ok(())
    } else {
        Err(SelectError::InsufficientResources)
    }
}
