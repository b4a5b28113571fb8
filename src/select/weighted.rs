//! Weight-group strategies: spread, serial, busy, lln
//!
//! All four share one engine: absorb required nodes, then walk weight
//! buckets in ascending order and pick nodes according to the rule's inner
//! scan. They differ only in the order candidates inside one bucket are
//! tried.

use tracing::debug;

use crate::error::{Result, SelectError};
use crate::types::build_weight_buckets;

use super::common::Counters;
use super::EvalContext;

/// Inner pick order inside one weight bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WeightedRule {
    /// Forward index order
    Spread,
    /// Reverse index order (anti-fragmentation for serial jobs)
    Serial,
    /// Nodes already running work first, idle nodes second
    Busy,
    /// Greatest available-to-total CPU ratio first
    Lln,
}

/// Take usable nodes from `iter` until the request is satisfied or the
/// node cap runs out
fn scan_take<I>(ctx: &mut EvalContext<'_>, counters: &mut Counters, iter: I)
where
    I: Iterator<Item = usize>,
{
    for i in iter {
        if counters.max_nodes <= 0 {
            return;
        }
        if ctx.node_map.test(i) || ctx.avail_res[i].avail_cpus == 0 {
            continue;
        }
        ctx.try_take_node(i, counters);
        if counters.satisfied(ctx) {
            return;
        }
    }
}

/// Repeatedly pick the node with the greatest `max_cpus / total_cpus`
/// ratio, compared by integer cross product. Once a candidate matches the
/// previous round's winning ratio the scan stops early: no better ratio
/// can appear.
fn scan_lln(ctx: &mut EvalContext<'_>, counters: &mut Counters, bucket: &crate::bitmap::NodeMask) {
    let mut last_max_cpus: Option<u32> = None;
    loop {
        if counters.max_nodes <= 0 || counters.satisfied(ctx) {
            return;
        }
        let mut best: Option<usize> = None;
        for i in bucket.iter_set() {
            if ctx.node_map.test(i) || ctx.avail_res[i].avail_cpus == 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    (ctx.avail_res[i].max_cpus as u64) * (ctx.cluster.nodes[b].cpus as u64)
                        > (ctx.avail_res[b].max_cpus as u64) * (ctx.cluster.nodes[i].cpus as u64)
                }
            };
            if better {
                best = Some(i);
                if last_max_cpus == Some(ctx.avail_res[i].max_cpus) {
                    break;
                }
            }
        }
        let Some(pick) = best else { return };
        last_max_cpus = Some(ctx.avail_res[pick].max_cpus);
        ctx.try_take_node(pick, counters);
    }
}

/// Shared engine for the four weight-group strategies
pub(crate) fn eval_weighted(ctx: &mut EvalContext<'_>, rule: WeightedRule) -> Result<()> {
    let mut counters = Counters::init(ctx);
    if rule != WeightedRule::Spread {
        if let Some(num_tasks) = ctx.job.num_tasks {
            counters.max_nodes = counters.max_nodes.min(num_tasks as i64);
        }
    }

    let orig_node_map = ctx.node_map.clone();
    let had_required = ctx.absorb_required(&mut counters)?;
    ctx.reset_to_required();
    if had_required && counters.satisfied(ctx) {
        debug!(job_id = ctx.job.job_id, "required nodes satisfy the request");
        return Ok(());
    }

    let idle = ctx.cluster.idle_nodes.clone();
    let buckets = build_weight_buckets(&ctx.cluster.nodes, &orig_node_map);
    for bucket in &buckets {
        if counters.max_nodes <= 0 || counters.satisfied(ctx) {
            break;
        }
        match rule {
            WeightedRule::Spread => {
                scan_take(ctx, &mut counters, bucket.nodes.iter_set());
            }
            WeightedRule::Serial => {
                scan_take(ctx, &mut counters, bucket.nodes.iter_set().rev());
            }
            WeightedRule::Busy => {
                scan_take(
                    ctx,
                    &mut counters,
                    bucket.nodes.iter_set().filter(|&i| !idle.test(i)),
                );
                scan_take(
                    ctx,
                    &mut counters,
                    bucket.nodes.iter_set().filter(|&i| idle.test(i)),
                );
            }
            WeightedRule::Lln => {
                scan_lln(ctx, &mut counters, &bucket.nodes);
            }
        }
    }

    if counters.satisfied(ctx) {
        Ok(())
    } else {
        Err(SelectError::InsufficientResources)
    }
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
        avail: &[u32],
        min: u32,
        req: u32,
    ) -> EvalContext<'a> {
        let avail_res = avail.iter().map(|&a| AvailRes::new(a)).collect();
        let n = cluster.node_count() as u32;
        let input = SelectInput::new(NodeMask::full(cluster.node_count()), avail_res)
            .nodes(min, req, n);
        EvalContext::new(cluster, &NullGres, job, input)
    }

    #[test]
    fn test_spread_forward_order() {
        let cluster = uniform_cluster(4, 8);
        let mut ctx = ctx_for(&cluster, JobRequest::new(1, 16), &[8, 8, 8, 8], 2, 2);
        eval_weighted(&mut ctx, WeightedRule::Spread).unwrap();
        assert_eq!(ctx.node_map, NodeMask::from_indices(4, &[0, 1]));
    }

    #[test]
    fn test_serial_reverse_order() {
        let cluster = uniform_cluster(4, 8);
        let mut ctx = ctx_for(&cluster, JobRequest::new(1, 1), &[8, 8, 8, 8], 1, 1);
        eval_weighted(&mut ctx, WeightedRule::Serial).unwrap();
        assert_eq!(ctx.node_map, NodeMask::from_indices(4, &[3]));
    }

    #[test]
    fn test_busy_prefers_allocated_nodes() {
        let mut cluster = uniform_cluster(4, 8);
        cluster.mark_busy(2);
        cluster.mark_busy(3);
        let mut ctx = ctx_for(&cluster, JobRequest::new(1, 16), &[8, 8, 8, 8], 2, 2);
        eval_weighted(&mut ctx, WeightedRule::Busy).unwrap();
        assert_eq!(ctx.node_map, NodeMask::from_indices(4, &[2, 3]));
    }

    #[test]
    fn test_lln_prefers_highest_ratio() {
        // Nodes 0..3 offer 8 of 16 CPUs; node 4 offers all 8 of its 8.
        let mut cluster = uniform_cluster(5, 16);
        cluster.nodes[4] = NodeRecord::new("n4", 1, 8, 1);
        let mut ctx = ctx_for(&cluster, JobRequest::new(1, 16), &[8, 8, 8, 8, 8], 2, 2);
        eval_weighted(&mut ctx, WeightedRule::Lln).unwrap();
        assert!(ctx.node_map.test(4), "fully-free node wins on ratio");
        assert_eq!(ctx.node_map.count(), 2);
        assert!(ctx.node_map.test(0), "then first of the equal-ratio rest");
    }

    #[test]
    fn test_lower_weight_bucket_wins() {
        let mut cluster = uniform_cluster(4, 8);
        cluster.nodes[0].sched_weight = 100;
        cluster.nodes[1].sched_weight = 100;
        let mut ctx = ctx_for(&cluster, JobRequest::new(1, 16), &[8, 8, 8, 8], 2, 2);
        eval_weighted(&mut ctx, WeightedRule::Spread).unwrap();
        assert_eq!(ctx.node_map, NodeMask::from_indices(4, &[2, 3]));
    }

    #[test]
    fn test_required_nodes_absorbed_first() {
        let cluster = uniform_cluster(4, 8);
        let job = JobRequest::new(1, 16).require_nodes(NodeMask::from_indices(4, &[1, 3]));
        let mut ctx = ctx_for(&cluster, job, &[8, 8, 8, 8], 2, 2);
        eval_weighted(&mut ctx, WeightedRule::Spread).unwrap();
        assert_eq!(ctx.node_map, NodeMask::from_indices(4, &[1, 3]));
    }

    #[test]
    fn test_insufficient_resources_fails() {
        let cluster = uniform_cluster(2, 4);
        let mut ctx = ctx_for(&cluster, JobRequest::new(1, 16), &[4, 4], 1, 1);
        assert!(eval_weighted(&mut ctx, WeightedRule::Spread).is_err());
    }
}
