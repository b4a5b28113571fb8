//! Best-fit selection over runs of consecutive candidate nodes
//!
//! The candidate map is partitioned into maximal runs of same-weight,
//! gapless, usable nodes. Runs are then ranked and drained until the
//! request is satisfied: required runs first, then lower weight, then the
//! tightest sufficient fit (or the largest insufficient one while nothing
//! suffices).

use tracing::debug;

use crate::error::{Result, SelectError};
use crate::gres::GresAccum;

use super::common::{enough_nodes, Counters};
use super::EvalContext;

/// One maximal run of consecutive same-weight candidates
#[derive(Debug, Clone)]
struct Run {
    /// First node index in the run
    begin: usize,
    /// Last node index in the run
    end: usize,
    /// CPUs offered by the run's not-yet-selected nodes
    cpus: i64,
    /// Not-yet-selected node count
    node_cnt: i64,
    /// First required node inside the run, if any
    req_inx: Option<usize>,
    /// Shared scheduling weight
    weight: u64,
    /// Tentative GRES aggregate over the run
    gres: GresAccum,
}

impl Run {
    fn new(index: usize, weight: u64) -> Self {
        Self {
            begin: index,
            end: index,
            cpus: 0,
            node_cnt: 0,
            req_inx: None,
            weight,
            gres: GresAccum::new(),
        }
    }
}

/// Build the run table, absorbing required nodes along the way
///
/// Non-required candidates are cleared from the in/out map (they are
/// re-added as they are picked); unusable nodes are cleared and break the
/// run like a gap. Required nodes are charged immediately and leave their
/// run marked.
fn build_runs(ctx: &mut EvalContext<'_>, counters: &mut Counters) -> Result<Vec<Run>> {
    let len = ctx.node_map.len();
    let req_mask = ctx.job.req_node_mask.clone();
    let mut runs: Vec<Run> = Vec::new();
    let mut current: Option<Run> = None;
    let mut req_pos = 0usize;

    for i in 0..len {
        if !ctx.node_map.test(i) {
            if let Some(run) = current.take() {
                runs.push(run);
            }
            continue;
        }
        let weight = ctx.cluster.nodes[i].sched_weight;
        if let Some(run) = &current {
            if run.weight != weight {
                runs.push(current.take().unwrap());
            }
        }
        let required = req_mask.as_ref().map_or(false, |m| m.test(i));
        if required {
            if counters.max_nodes <= 0 {
                return Err(SelectError::NodeLimit);
            }
            ctx.select_cores(i, counters.min_rem_nodes);
            if ctx.avail_cpus == 0 {
                return Err(SelectError::required_unusable(
                    ctx.cluster.nodes[i].name.clone(),
                ));
            }
            ctx.cpus_to_use(i, counters.rem_max_cpus, counters.min_rem_nodes);
            if let Some(tpn) = &ctx.job.arbitrary_tpn {
                if let Some(&tasks) = tpn.get(req_pos) {
                    let req_cpus = tasks.saturating_mul(ctx.job.cpus_per_task.max(1));
                    if ctx.avail_cpus < req_cpus {
                        return Err(SelectError::required_unusable(
                            ctx.cluster.nodes[i].name.clone(),
                        ));
                    }
                    ctx.avail_cpus = req_cpus;
                    ctx.avail_res[i].avail_cpus = req_cpus;
                }
            }
            req_pos += 1;
            if counters.gres_per_job {
                let gres = ctx.gres;
                gres.sched_add(
                    &mut ctx.gres_accum,
                    &ctx.job.gres,
                    &ctx.avail_res[i].sock_gres,
                    &mut ctx.avail_cpus,
                );
                ctx.avail_res[i].avail_cpus = ctx.avail_cpus;
                if ctx.avail_cpus == 0 {
                    return Err(SelectError::required_unusable(
                        ctx.cluster.nodes[i].name.clone(),
                    ));
                }
            }
            if let Some(max_cpus) = ctx.job.max_cpus {
                if counters.total_cpus + ctx.avail_cpus as u64 > max_cpus as u64 {
                    return Err(SelectError::CpuLimit);
                }
            }
            counters.consume(ctx.avail_cpus);
            let run = current.get_or_insert_with(|| Run::new(i, weight));
            run.end = i;
            if run.req_inx.is_none() {
                run.req_inx = Some(i);
            }
        } else {
            ctx.select_cores(i, counters.min_rem_nodes);
            ctx.node_map.clear(i);
            if ctx.avail_cpus == 0 {
                // unusable node acts as a gap
                if let Some(run) = current.take() {
                    runs.push(run);
                }
                continue;
            }
            let run = current.get_or_insert_with(|| Run::new(i, weight));
            run.end = i;
            run.cpus += ctx.avail_cpus as i64;
            run.node_cnt += 1;
            if counters.gres_per_job {
                let gres = ctx.gres;
                gres.sched_consec(&mut run.gres, &ctx.job.gres, &ctx.avail_res[i].sock_gres);
            }
        }
    }
    if let Some(run) = current.take() {
        runs.push(run);
    }
    Ok(runs)
}

/// Take candidates from one run, in the given index order
fn fill<I>(ctx: &mut EvalContext<'_>, counters: &mut Counters, iter: I)
where
    I: Iterator<Item = usize>,
{
    for i in iter {
        if counters.max_nodes <= 0 || counters.satisfied(ctx) {
            return;
        }
        if ctx.node_map.test(i) || ctx.avail_res[i].avail_cpus == 0 {
            continue;
        }
        ctx.try_take_node(i, counters);
    }
}

pub(crate) fn eval_consec(ctx: &mut EvalContext<'_>) -> Result<()> {
    let mut counters = Counters::init(ctx);
    let mut runs = build_runs(ctx, &mut counters)?;
    // node_map now holds required nodes only
    if counters.satisfied(ctx) {
        return Ok(());
    }

    if ctx.job.contiguous {
        let required_runs = runs.iter().filter(|r| r.req_inx.is_some()).count();
        if required_runs > 1 {
            return Err(SelectError::Locality("contiguous run"));
        }
    }

    while counters.max_nodes > 0 && !counters.satisfied(ctx) {
        // Rank the remaining runs.
        let mut best: Option<usize> = None;
        let mut best_sufficient = false;
        for (ri, run) in runs.iter().enumerate() {
            if run.node_cnt == 0 {
                continue;
            }
            let gres_ok = !counters.gres_per_job || {
                let combined = ctx.gres_accum.merged(&run.gres);
                ctx.gres.sched_sufficient(&ctx.job.gres, &combined)
            };
            let sufficient = run.cpus >= counters.rem_cpus
                && enough_nodes(
                    run.node_cnt,
                    counters.rem_nodes,
                    ctx.min_nodes as i64,
                    ctx.req_nodes as i64,
                )
                && gres_ok;
            let better = match best {
                None => true,
                Some(b) => {
                    let incumbent = &runs[b];
                    if incumbent.req_inx.is_none() && run.req_inx.is_some() {
                        true
                    } else if incumbent.req_inx.is_some() && run.req_inx.is_none() {
                        false
                    } else if run.weight != incumbent.weight {
                        run.weight < incumbent.weight
                    } else if sufficient != best_sufficient {
                        sufficient
                    } else if sufficient {
                        run.cpus < incumbent.cpus
                    } else {
                        run.cpus > incumbent.cpus
                    }
                }
            };
            if better {
                best = Some(ri);
                best_sufficient = sufficient;
            }
        }
        let Some(bi) = best else { break };
        let chosen = runs[bi].clone();
        if ctx.job.contiguous && !best_sufficient {
            // no hole large enough for a contiguous allocation
            break;
        }
        debug!(
            job_id = ctx.job.job_id,
            begin = chosen.begin,
            end = chosen.end,
            cpus = chosen.cpus,
            sufficient = best_sufficient,
            gres = %ctx.gres.sched_str(&chosen.gres),
            "filling run"
        );

        if let Some(req_inx) = chosen.req_inx {
            // Fan out from the required node: upward first, then downward.
            fill(ctx, &mut counters, req_inx..=chosen.end);
            fill(ctx, &mut counters, (chosen.begin..req_inx).rev());
        } else if counters.rem_nodes <= 1 {
            // One node left: best-fit, least waste.
            let mut best_fit: Option<usize> = None;
            for i in chosen.begin..=chosen.end {
                if ctx.node_map.test(i) || ctx.avail_res[i].avail_cpus == 0 {
                    continue;
                }
                let avail = ctx.avail_res[i].avail_cpus;
                if (avail as i64) < counters.rem_cpus {
                    continue;
                }
                if best_fit.map_or(true, |b| avail < ctx.avail_res[b].avail_cpus) {
                    best_fit = Some(i);
                }
            }
            if let Some(i) = best_fit {
                fill(ctx, &mut counters, std::iter::once(i));
            }
            if !counters.satisfied(ctx) {
                fill(ctx, &mut counters, chosen.begin..=chosen.end);
            }
        } else {
            fill(ctx, &mut counters, chosen.begin..=chosen.end);
        }

        runs[bi].cpus = 0;
        runs[bi].node_cnt = 0;
    }

    if counters.satisfied(ctx) {
        return Ok(());
    }
    // Late success: the CPU request is covered and the node shortfall is
    // within the request's [min..req] slack.
    if counters.rem_cpus <= 0
        && enough_nodes(
            0,
            counters.rem_nodes,
            ctx.min_nodes as i64,
            ctx.req_nodes as i64,
        )
        && (!counters.gres_per_job || ctx.gres.sched_test(&ctx.job.gres, &ctx.gres_accum))
    {
        return Ok(());
    }
    Err(SelectError::InsufficientResources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::NodeMask;
    use crate::cluster::Cluster;
    use crate::gres::NullGres;
    use crate::job::JobRequest;
    use crate::select::SelectInput;
    use crate::types::{AvailRes, NodeRecord};

    fn uniform_cluster(count: usize, cpus: u32) -> Cluster {
        Cluster::new(
            (0..count)
                .map(|i| NodeRecord::new(format!("n{}", i), 1, cpus, 1))
                .collect(),
        )
    }

    fn ctx_for<'a>(
        cluster: &'a Cluster,
        job: JobRequest,
        candidates: NodeMask,
        min: u32,
        req: u32,
    ) -> EvalContext<'a> {
        let n = cluster.node_count();
        let avail_res = (0..n)
            .map(|i| AvailRes::new(cluster.nodes[i].cpus))
            .collect();
        let input = SelectInput::new(candidates, avail_res).nodes(min, req, n as u32);
        EvalContext::new(cluster, &NullGres, job, input)
    }

    #[test]
    fn test_prefers_sufficient_run() {
        // Runs [0..2] (12 cpus) and [4..7] (16 cpus); only the second can
        // hold the whole request.
        let cluster = uniform_cluster(8, 4);
        let candidates = NodeMask::from_indices(8, &[0, 1, 2, 4, 5, 6, 7]);
        let mut ctx = ctx_for(&cluster, JobRequest::new(1, 16), candidates, 4, 4);
        eval_consec(&mut ctx).unwrap();
        assert_eq!(ctx.node_map, NodeMask::from_indices(8, &[4, 5, 6, 7]));
    }

    #[test]
    fn test_weight_change_breaks_run() {
        // Same-weight prefix too small; the lower-weight suffix run wins
        // even though the indices are contiguous.
        let mut cluster = uniform_cluster(6, 4);
        for i in 0..3 {
            cluster.nodes[i].sched_weight = 50;
        }
        let mut ctx = ctx_for(&cluster, JobRequest::new(1, 12), NodeMask::full(6), 3, 3);
        eval_consec(&mut ctx).unwrap();
        assert_eq!(ctx.node_map, NodeMask::from_indices(6, &[3, 4, 5]));
    }

    #[test]
    fn test_required_run_fans_out() {
        let cluster = uniform_cluster(8, 4);
        let job = JobRequest::new(1, 12).require_nodes(NodeMask::from_indices(8, &[5]));
        let mut ctx = ctx_for(&cluster, job, NodeMask::full(8), 3, 3);
        eval_consec(&mut ctx).unwrap();
        // Fan-out from node 5 climbs upward and never needs to turn around.
        assert_eq!(ctx.node_map, NodeMask::from_indices(8, &[5, 6, 7]));
    }

    #[test]
    fn test_best_fit_single_node() {
        // One node needed; the smallest node that still fits wins.
        let mut cluster = uniform_cluster(3, 16);
        cluster.nodes[1] = NodeRecord::new("n1", 1, 8, 1);
        let mut ctx = ctx_for(&cluster, JobRequest::new(1, 8), NodeMask::full(3), 1, 1);
        eval_consec(&mut ctx).unwrap();
        assert_eq!(ctx.node_map, NodeMask::from_indices(3, &[1]));
    }

    #[test]
    fn test_contiguous_required_straddle_fails() {
        let cluster = uniform_cluster(8, 4);
        let job = JobRequest::new(1, 16)
            .require_nodes(NodeMask::from_indices(8, &[0, 7]))
            .contiguous();
        let candidates = NodeMask::from_indices(8, &[0, 1, 6, 7]);
        let mut ctx = ctx_for(&cluster, job, candidates, 2, 2);
        assert!(matches!(
            eval_consec(&mut ctx),
            Err(SelectError::Locality(_))
        ));
    }

    #[test]
    fn test_arbitrary_tpn_pins_required_cpus() {
        let cluster = uniform_cluster(4, 8);
        let mut job = JobRequest::new(1, 4).require_nodes(NodeMask::from_indices(4, &[1, 2]));
        job.arbitrary_tpn = Some(vec![3, 1]);
        let mut ctx = ctx_for(&cluster, job, NodeMask::full(4), 2, 2);
        eval_consec(&mut ctx).unwrap();
        assert_eq!(ctx.avail_res[1].avail_cpus, 3);
        assert_eq!(ctx.avail_res[2].avail_cpus, 1);
    }

    #[test]
    fn test_insufficient_errors() {
        let cluster = uniform_cluster(2, 4);
        let mut ctx = ctx_for(&cluster, JobRequest::new(1, 16), NodeMask::full(2), 1, 1);
        assert!(matches!(
            eval_consec(&mut ctx),
            Err(SelectError::InsufficientResources)
        ));
    }
}
