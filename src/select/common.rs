//! Primitives shared by every selection strategy
//!
//! The strategies differ in how they pick the next node; everything else —
//! counter bookkeeping, per-node CPU trimming, GRES accounting, required
//! node absorption — funnels through here so the invariants hold on every
//! path.

use tracing::trace;

use crate::error::{Result, SelectError};
use crate::gres::SockCoreFilter;
use crate::job::JobRequest;
use crate::topology::SwitchTable;
use crate::types::{build_weight_buckets, CrType, NodeRecord};

use super::EvalContext;
use crate::bitmap::NodeMask;

/// Can `avail_nodes` more nodes still satisfy the request?
///
/// When the job asks for a range `[min..req]`, falling short of `req` by up
/// to `req - min` is acceptable provided `min` stays reachable.
pub fn enough_nodes(avail_nodes: i64, rem_nodes: i64, min_nodes: i64, req_nodes: i64) -> bool {
    let needed = if req_nodes > min_nodes {
        rem_nodes + min_nodes - req_nodes
    } else {
        rem_nodes
    };
    avail_nodes >= needed
}

/// Upper bound of CPUs still chargeable to the job
pub(crate) fn get_rem_max_cpus(job: &JobRequest, rem_nodes: i64) -> i64 {
    let mut rem_max = job.min_cpus as i64;
    if let Some(max_cpus) = job.max_cpus {
        rem_max = max_cpus as i64;
    }
    if job.gres.min_cpus_per_node > 0 {
        rem_max = rem_max.max(rem_nodes.max(0) * job.gres.min_cpus_per_node as i64);
    }
    if job.gres.min_cpus_per_job > 0 {
        rem_max = rem_max.max(job.gres.min_cpus_per_job as i64);
    }
    rem_max
}

/// CPUs consumed per core once task binding is applied
pub(crate) fn determine_cpus_per_core(cr_type: CrType, node: &NodeRecord) -> u32 {
    if cr_type.contains(CrType::ONE_TASK_PER_CORE) {
        return 1;
    }
    node.tpc.max(1)
}

/// Seconds the job has been waiting for switch locality
pub(crate) fn switch_wait_secs(job: &JobRequest) -> i64 {
    match job.wait4switch_start {
        Some(start) => (chrono::Utc::now() - start).num_seconds().max(0),
        None => 0,
    }
}

/// Number of leaf switches a node set touches
pub(crate) fn leaf_switches_used(table: &SwitchTable, mask: &NodeMask) -> u32 {
    table
        .switches
        .iter()
        .filter(|s| s.level == 0 && s.nodes.overlaps(mask))
        .count() as u32
}

/// Monotone request counters threaded through a strategy
///
/// `rem_nodes`, `min_rem_nodes`, `max_nodes`, `rem_cpus` and `rem_max_cpus`
/// only ever decrease; `total_cpus` only grows. Signed so the remainders
/// may pass through zero.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Counters {
    pub rem_nodes: i64,
    pub min_rem_nodes: i64,
    pub rem_cpus: i64,
    pub rem_max_cpus: i64,
    pub max_nodes: i64,
    pub total_cpus: u64,
    pub gres_per_job: bool,
}

impl Counters {
    pub fn init(ctx: &EvalContext<'_>) -> Self {
        let gres_per_job = ctx.gres.sched_init(&ctx.job.gres);
        let rem_nodes = Self::base_rem_nodes(gres_per_job, ctx.min_nodes as i64, ctx.req_nodes as i64);
        let mut counters = Self {
            rem_nodes,
            min_rem_nodes: ctx.min_nodes as i64,
            rem_cpus: ctx.job.min_cpus as i64,
            rem_max_cpus: 0,
            max_nodes: ctx.max_nodes as i64,
            total_cpus: 0,
            gres_per_job,
        };
        counters.rem_max_cpus = get_rem_max_cpus(&ctx.job, counters.rem_nodes);
        counters
    }

    /// Node remainder seeded from the request bounds
    pub fn base_rem_nodes(gres_per_job: bool, min_nodes: i64, req_nodes: i64) -> i64 {
        if gres_per_job {
            min_nodes.min(req_nodes)
        } else {
            min_nodes.max(req_nodes)
        }
    }

    /// Charge one selected node
    pub fn consume(&mut self, cpus: u32) {
        self.rem_nodes -= 1;
        self.min_rem_nodes -= 1;
        self.max_nodes -= 1;
        self.rem_cpus -= cpus as i64;
        self.rem_max_cpus -= cpus as i64;
        self.total_cpus += cpus as u64;
    }

    /// Node and CPU remainders drained
    pub fn drained(&self) -> bool {
        self.rem_nodes <= 0 && self.rem_cpus <= 0
    }

    /// Drained and the committed GRES aggregate passes
    pub fn satisfied(&self, ctx: &EvalContext<'_>) -> bool {
        self.drained() && (!self.gres_per_job || ctx.gres.sched_test(&ctx.job.gres, &ctx.gres_accum))
    }
}

impl EvalContext<'_> {
    /// Compute task bounds for one node and let the GRES subsystem prune
    /// its sockets/cores; leaves the resulting CPU count in
    /// `self.avail_cpus` and mirrored on the availability record.
    pub(crate) fn select_cores(&mut self, node_inx: usize, rem_nodes: i64) {
        let cluster = self.cluster;
        let gres = self.gres;
        let node = &cluster.nodes[node_inx];
        let job = &self.job;

        let mut min_tasks: u32 = 1;
        let mut max_tasks: Option<u32> = None;
        if let Some(per_node) = job.ntasks_per_node {
            min_tasks = per_node;
            max_tasks = Some(per_node);
        } else if let Some(per_board) = job.ntasks_per_board {
            min_tasks = per_board;
            max_tasks = Some(per_board.saturating_mul(node.boards));
        } else if let Some(per_socket) = job.ntasks_per_socket {
            min_tasks = per_socket;
            max_tasks = Some(per_socket.saturating_mul(node.tot_sockets));
        } else if let Some(per_core) = job.ntasks_per_core {
            min_tasks = per_core;
            max_tasks = Some(per_core.saturating_mul(node.tot_cores.saturating_sub(node.core_spec_cnt)));
        } else if job.ntasks_per_tres.is_some() {
            // Node ranges are not allowed with per-TRES task counts
            if let Some(num_tasks) = job.num_tasks {
                if self.min_nodes != 0 && self.min_nodes == self.max_nodes {
                    let per = num_tasks / self.min_nodes;
                    min_tasks = per;
                    max_tasks = Some(per);
                }
            }
        } else if self.max_nodes == 1 {
            if let Some(num_tasks) = job.num_tasks {
                if num_tasks > 0 {
                    min_tasks = num_tasks;
                    max_tasks = Some(num_tasks);
                }
            }
        } else if job.num_tasks == Some(1) {
            min_tasks = 1;
            max_tasks = Some(1);
        }

        let before = self.avail_res[node_inx].avail_cpus;
        if !job.overcommit {
            if let Some(cap) = max_tasks {
                max_tasks = Some(cap.min(before / job.cpus_per_task.max(1)));
            }
        }

        let args = SockCoreFilter {
            gres: &job.gres,
            node,
            min_tasks,
            max_tasks,
            rem_nodes,
            enforce_binding: self.enforce_binding,
            first_pass: self.first_pass,
            whole_node: job.whole_node,
            avail_cpus: before,
        };
        let mut avail = gres.filter_sock_core(
            &args,
            &mut self.avail_core[node_inx],
            &mut self.avail_res[node_inx],
        );

        if max_tasks == Some(0) {
            avail = 0;
        } else if self.cr_type.contains(CrType::ONE_TASK_PER_CORE) {
            avail = self.avail_core[node_inx].count() as u32;
        }

        self.avail_res[node_inx].avail_cpus = avail;
        self.avail_cpus = avail;
    }

    /// Trim the node's CPU charge, reserving headroom for nodes not yet
    /// picked and honoring the per-node floors
    pub(crate) fn cpus_to_use(&mut self, node_inx: usize, rem_max_cpus: i64, rem_nodes: i64) {
        if self.job.whole_node {
            self.avail_res[node_inx].avail_cpus = self.avail_cpus;
            return;
        }
        let node = &self.cluster.nodes[node_inx];
        let mut resv_cpus = rem_nodes.saturating_sub(1).max(0);
        resv_cpus *= determine_cpus_per_core(self.cr_type, node) as i64;
        if self.cr_type.contains(CrType::SOCKET) {
            resv_cpus *= node.cores as i64;
        }
        let headroom = rem_max_cpus - resv_cpus;
        if (self.avail_cpus as i64) > headroom {
            let mut trimmed = headroom.max(self.job.pn_min_cpus as i64);
            let gres_floor = self.avail_res[node_inx].gres_min_cpus;
            if gres_floor > 0 {
                trimmed = trimmed.max(gres_floor as i64);
            } else {
                trimmed = trimmed.max(self.job.gres.min_cpus_per_node as i64);
            }
            self.avail_cpus = trimmed.clamp(0, u32::MAX as i64) as u32;
        }
        self.avail_res[node_inx].avail_cpus = self.avail_cpus;
    }

    /// Full per-node pipeline: refine CPUs, trim, commit GRES, mark the
    /// node selected and charge the counters. Returns false (selecting
    /// nothing) when the node turns out unusable.
    pub(crate) fn try_take_node(&mut self, node_inx: usize, counters: &mut Counters) -> bool {
        self.select_cores(node_inx, counters.min_rem_nodes);
        if self.avail_cpus == 0 {
            trace!(node = %self.cluster.nodes[node_inx].name, "node unusable");
            return false;
        }
        self.cpus_to_use(node_inx, counters.rem_max_cpus, counters.min_rem_nodes);
        if counters.gres_per_job {
            let gres = self.gres;
            gres.sched_add(
                &mut self.gres_accum,
                &self.job.gres,
                &self.avail_res[node_inx].sock_gres,
                &mut self.avail_cpus,
            );
            self.avail_res[node_inx].avail_cpus = self.avail_cpus;
            if self.avail_cpus == 0 {
                return false;
            }
        }
        trace!(
            node = %self.cluster.nodes[node_inx].name,
            cpus = self.avail_cpus,
            "node selected"
        );
        self.node_map.set(node_inx);
        counters.consume(self.avail_cpus);
        true
    }

    /// Absorb every node the job explicitly names
    ///
    /// Returns `Ok(true)` when a required set was present. Fails when a
    /// required node is unusable, the node cap runs out, or the required
    /// nodes alone exceed the job's CPU ceiling.
    pub(crate) fn absorb_required(&mut self, counters: &mut Counters) -> Result<bool> {
        let Some(req) = self.job.req_node_mask.clone() else {
            return Ok(false);
        };
        for i in req.iter_set() {
            if counters.max_nodes <= 0 {
                return Err(SelectError::NodeLimit);
            }
            self.select_cores(i, counters.min_rem_nodes);
            if self.avail_cpus == 0 {
                return Err(SelectError::required_unusable(
                    self.cluster.nodes[i].name.clone(),
                ));
            }
            self.cpus_to_use(i, counters.rem_max_cpus, counters.min_rem_nodes);
            if counters.gres_per_job {
                let gres = self.gres;
                gres.sched_add(
                    &mut self.gres_accum,
                    &self.job.gres,
                    &self.avail_res[i].sock_gres,
                    &mut self.avail_cpus,
                );
                self.avail_res[i].avail_cpus = self.avail_cpus;
                if self.avail_cpus == 0 {
                    return Err(SelectError::required_unusable(
                        self.cluster.nodes[i].name.clone(),
                    ));
                }
            }
            if let Some(max_cpus) = self.job.max_cpus {
                if counters.total_cpus + self.avail_cpus as u64 > max_cpus as u64 {
                    return Err(SelectError::CpuLimit);
                }
            }
            counters.consume(self.avail_cpus);
        }
        Ok(true)
    }

    /// Reset the in/out map to the required nodes only, ready to
    /// accumulate picks
    pub(crate) fn reset_to_required(&mut self) {
        let req = self.job.req_node_mask.clone();
        self.node_map.clear_all();
        if let Some(req) = req {
            self.node_map.or_assign(&req);
        }
    }

    /// Walk weight buckets inside `domain` (ascending weight) until the
    /// accumulated nodes could satisfy the remaining request; every bucket
    /// before the last one used is mandatory and absorbed immediately.
    ///
    /// Returns the accumulated best-node set and whether the request is
    /// already satisfied.
    pub(crate) fn build_best_nodes(
        &mut self,
        counters: &mut Counters,
        domain: &NodeMask,
    ) -> (NodeMask, bool) {
        let len = self.node_map.len();
        let buckets = build_weight_buckets(&self.cluster.nodes, domain);
        let mut best = NodeMask::new(len);
        let mut best_cpus: i64 = 0;
        let mut tentative = self.gres_accum.clone();
        let mut used: Vec<NodeMask> = Vec::new();

        for bucket in &buckets {
            let mut added = NodeMask::new(len);
            for i in bucket.nodes.iter_set() {
                if self.node_map.test(i) || self.avail_res[i].avail_cpus == 0 {
                    continue;
                }
                added.set(i);
                best_cpus += self.avail_res[i].avail_cpus as i64;
                if counters.gres_per_job {
                    let gres = self.gres;
                    gres.sched_consec(&mut tentative, &self.job.gres, &self.avail_res[i].sock_gres);
                }
            }
            if added.count() == 0 {
                continue;
            }
            best.or_assign(&added);
            used.push(added);
            let have = best.count() as i64;
            let enough = best_cpus >= counters.rem_cpus
                && enough_nodes(
                    have,
                    counters.rem_nodes,
                    self.min_nodes as i64,
                    self.req_nodes as i64,
                );
            let gres_ok = !counters.gres_per_job
                || self.gres.sched_sufficient(&self.job.gres, &tentative);
            if enough && gres_ok {
                break;
            }
        }

        // Buckets below the last one used are strictly preferred: take them.
        if used.len() > 1 {
            for mask in &used[..used.len() - 1] {
                for i in mask.iter_set() {
                    if counters.max_nodes <= 0 {
                        break;
                    }
                    if self.node_map.test(i) {
                        continue;
                    }
                    self.try_take_node(i, counters);
                }
            }
        }

        let satisfied = counters.satisfied(self);
        (best, satisfied)
    }
}
