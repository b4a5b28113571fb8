//! Node selection: dispatch and evaluation context
//!
//! The core exposes one operation, [`eval_nodes`], which routes a request
//! to one of seven strategies based on job flags, topology configuration,
//! and cluster tunables:
//!
//! - **spread** — maximize node count, round-robin across weight groups
//! - **busy** — prefer nodes already running work
//! - **lln** — least-loaded node within each weight group
//! - **serial** — fill 1-CPU/1-node jobs from the high end of the table
//! - **consec** — best-fit over runs of consecutive same-weight nodes
//! - **dragonfly** / **topology** — switch-tree aware placement
//! - **block** — block-group aware placement
//!
//! [`Selector`] is the concurrency boundary: it owns the cluster state
//! behind a reader/writer lock and holds the read side for the duration of
//! a call, so strategies see a stable node table.

mod block;
mod common;
mod consec;
mod dfly;
mod topo;
mod weighted;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::bitmap::{CoreMask, NodeMask};
use crate::cluster::Cluster;
use crate::error::{Result, SelectError};
use crate::gres::{GresAccum, GresScheduler, NullGres};
use crate::job::JobRequest;
use crate::types::{AvailRes, CrType};

pub use common::enough_nodes;
use weighted::WeightedRule;

/// The strategy chosen for one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Block-group topology placement
    Block,
    /// Maximize node count
    Spread,
    /// Prefer nodes already running work
    Busy,
    /// Least-loaded node
    Lln,
    /// Pack serial jobs at the high end of the node table
    Serial,
    /// Dragonfly switch topology
    Dragonfly,
    /// Generic tree switch topology
    Topology,
    /// Consecutive-run best fit
    Consec,
}

impl Strategy {
    /// Strategy name for diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Block => "block",
            Strategy::Spread => "spread",
            Strategy::Busy => "busy",
            Strategy::Lln => "lln",
            Strategy::Serial => "serial",
            Strategy::Dragonfly => "dragonfly",
            Strategy::Topology => "topology",
            Strategy::Consec => "consec",
        }
    }
}

/// Per-call inputs built by the caller
#[derive(Debug, Clone)]
pub struct SelectInput {
    /// Candidate nodes
    pub candidates: NodeMask,
    /// Candidate cores per node; empty means every core is a candidate
    pub avail_core: Vec<CoreMask>,
    /// Availability record per node
    pub avail_res: Vec<AvailRes>,
    /// Minimum acceptable node count
    pub min_nodes: u32,
    /// Preferred node count
    pub req_nodes: u32,
    /// Maximum node count
    pub max_nodes: u32,
    /// Consumable-resource flags
    pub cr_type: CrType,
    /// Tasks must bind to the GRES topology
    pub enforce_binding: bool,
    /// First scheduling pass over this job
    pub first_pass: bool,
    /// Prefer nodes that already run allocations
    pub prefer_alloc_nodes: bool,
    /// The partition asks for least-loaded-node placement
    pub part_lln: bool,
}

impl SelectInput {
    /// Create inputs for a single-node request over the given candidates
    pub fn new(candidates: NodeMask, avail_res: Vec<AvailRes>) -> Self {
        let max = candidates.len() as u32;
        Self {
            candidates,
            avail_core: Vec::new(),
            avail_res,
            min_nodes: 1,
            req_nodes: 1,
            max_nodes: max.max(1),
            cr_type: CrType::empty(),
            enforce_binding: false,
            first_pass: true,
            prefer_alloc_nodes: false,
            part_lln: false,
        }
    }

    /// Set the node-count bounds (`min <= req <= max`)
    pub fn nodes(mut self, min: u32, req: u32, max: u32) -> Self {
        self.min_nodes = min;
        self.req_nodes = req;
        self.max_nodes = max;
        self
    }

    /// Set candidate core masks
    pub fn with_avail_core(mut self, avail_core: Vec<CoreMask>) -> Self {
        self.avail_core = avail_core;
        self
    }

    /// Set consumable-resource flags
    pub fn with_cr_type(mut self, cr_type: CrType) -> Self {
        self.cr_type = cr_type;
        self
    }

    /// Prefer nodes that already run allocations
    pub fn prefer_alloc_nodes(mut self) -> Self {
        self.prefer_alloc_nodes = true;
        self
    }

    /// Ask for least-loaded-node placement at the partition level
    pub fn lln_partition(mut self) -> Self {
        self.part_lln = true;
        self
    }
}

/// The parameter object threaded through every strategy
///
/// `node_map` is in/out: candidates on entry, the selected subset on
/// success. Strategies refine `avail_res[i].avail_cpus` as they select.
pub struct EvalContext<'a> {
    /// Cluster state (read-stable for the call)
    pub cluster: &'a Cluster,
    /// GRES subsystem
    pub gres: &'a dyn GresScheduler,
    /// The job under evaluation; `best_switch`/`req_switch` may be updated
    pub job: JobRequest,
    /// In: candidates. Out on success: selected nodes
    pub node_map: NodeMask,
    /// Candidate cores per node
    pub avail_core: Vec<CoreMask>,
    /// Availability record per node
    pub avail_res: Vec<AvailRes>,
    /// Minimum acceptable node count
    pub min_nodes: u32,
    /// Preferred node count
    pub req_nodes: u32,
    /// Maximum node count
    pub max_nodes: u32,
    /// Scratch: CPUs chosen for the node currently under consideration
    pub avail_cpus: u32,
    /// Consumable-resource flags
    pub cr_type: CrType,
    /// Tasks must bind to the GRES topology
    pub enforce_binding: bool,
    /// First scheduling pass over this job
    pub first_pass: bool,
    /// Prefer nodes that already run allocations
    pub prefer_alloc_nodes: bool,
    /// The partition asks for least-loaded-node placement
    pub part_lln: bool,
    /// GRES committed on selected nodes so far
    pub gres_accum: GresAccum,
}

impl<'a> EvalContext<'a> {
    /// Build a context from per-call inputs
    pub fn new(
        cluster: &'a Cluster,
        gres: &'a dyn GresScheduler,
        job: JobRequest,
        input: SelectInput,
    ) -> Self {
        let avail_core = if input.avail_core.is_empty() {
            cluster
                .nodes
                .iter()
                .map(|n| CoreMask::full(n.tot_cores as usize))
                .collect()
        } else {
            input.avail_core
        };
        Self {
            cluster,
            gres,
            job,
            node_map: input.candidates,
            avail_core,
            avail_res: input.avail_res,
            min_nodes: input.min_nodes,
            req_nodes: input.req_nodes,
            max_nodes: input.max_nodes,
            avail_cpus: 0,
            cr_type: input.cr_type,
            enforce_binding: input.enforce_binding,
            first_pass: input.first_pass,
            prefer_alloc_nodes: input.prefer_alloc_nodes,
            part_lln: input.part_lln,
            gres_accum: GresAccum::new(),
        }
    }
}

/// Pick the strategy for a request; first matching rule wins
pub fn choose_strategy(ctx: &EvalContext<'_>) -> Strategy {
    let tunables = ctx.cluster.tunables();
    if ctx
        .cluster
        .blocks
        .as_ref()
        .map_or(false, |b| b.nodes_any().overlaps(&ctx.node_map))
    {
        return Strategy::Block;
    }
    if ctx.job.spread_job {
        return Strategy::Spread;
    }
    if ctx.prefer_alloc_nodes && !ctx.job.contiguous {
        return Strategy::Busy;
    }
    if ctx.cr_type.contains(CrType::LLN) || ctx.part_lln {
        return Strategy::Lln;
    }
    if tunables.pack_serial_at_end && ctx.job.min_cpus == 1 && ctx.req_nodes == 1 {
        return Strategy::Serial;
    }
    if ctx.cluster.switches.as_ref().map_or(false, |s| !s.is_empty())
        && !ctx.job.contiguous
        && (!tunables.topo_optional || ctx.job.req_switch > 0)
    {
        return if tunables.dragonfly {
            Strategy::Dragonfly
        } else {
            Strategy::Topology
        };
    }
    Strategy::Consec
}

/// Select nodes for the job described by `ctx`
///
/// On success `ctx.node_map` holds the selected subset and every selected
/// node's `avail_res` record carries the CPU count charged to the job
/// (zero for unselected nodes). On error `ctx.node_map` is cleared.
pub fn eval_nodes(ctx: &mut EvalContext<'_>) -> Result<()> {
    let n = ctx.cluster.node_count();
    if ctx.node_map.len() != n || ctx.avail_res.len() != n || ctx.avail_core.len() != n {
        return Err(SelectError::invalid(
            "context arrays do not match the node table",
        ));
    }
    if ctx.min_nodes == 0 || ctx.req_nodes < ctx.min_nodes || ctx.max_nodes < ctx.req_nodes {
        return Err(SelectError::invalid("node-count bounds out of order"));
    }
    if (ctx.node_map.count() as u32) < ctx.min_nodes {
        return Err(SelectError::invalid(
            "fewer candidate nodes than the node minimum",
        ));
    }
    if let Some(req) = &ctx.job.req_node_mask {
        if req.len() != n {
            return Err(SelectError::invalid("required-node mask width mismatch"));
        }
        if !ctx.node_map.is_superset_of(req) {
            return Err(SelectError::invalid(
                "required nodes missing from the candidate set",
            ));
        }
    }

    let strategy = choose_strategy(ctx);
    debug!(
        job_id = ctx.job.job_id,
        strategy = strategy.name(),
        candidates = ctx.node_map.count(),
        "evaluating node selection"
    );

    let outcome = match strategy {
        Strategy::Block => block::eval_block(ctx),
        Strategy::Spread => weighted::eval_weighted(ctx, WeightedRule::Spread),
        Strategy::Busy => weighted::eval_weighted(ctx, WeightedRule::Busy),
        Strategy::Lln => weighted::eval_weighted(ctx, WeightedRule::Lln),
        Strategy::Serial => weighted::eval_weighted(ctx, WeightedRule::Serial),
        Strategy::Dragonfly => dfly::eval_dfly(ctx),
        Strategy::Topology => topo::eval_topo(ctx),
        Strategy::Consec => consec::eval_consec(ctx),
    };

    match outcome {
        Ok(()) => {
            for i in 0..n {
                if !ctx.node_map.test(i) {
                    ctx.avail_res[i].avail_cpus = 0;
                }
            }
            debug!(
                job_id = ctx.job.job_id,
                selected = %ctx.cluster.node_names(&ctx.node_map),
                "selection complete"
            );
            Ok(())
        }
        Err(err) => {
            ctx.node_map.clear_all();
            warn!(job_id = ctx.job.job_id, error = %err, "selection failed");
            Err(err)
        }
    }
}

/// The outcome of a successful [`Selector::select`] call
#[derive(Debug, Clone)]
pub struct Selection {
    /// Selected nodes
    pub nodes: NodeMask,
    /// CPUs charged to the job per node index; zero for unselected nodes
    pub cpus_per_node: Vec<u32>,
    /// Total CPUs across the selection
    pub total_cpus: u64,
    /// False when the switch-locality constraint went unmet and waiting
    /// longer might improve placement
    pub best_switch: bool,
}

/// Concurrency boundary around the selection core
///
/// Owns the cluster state; a selection call holds the read lock for its
/// duration so the node and topology tables stay stable.
pub struct Selector {
    cluster: RwLock<Cluster>,
    gres: Box<dyn GresScheduler>,
}

impl Selector {
    /// Create a selector over a cluster with no generic resources
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster: RwLock::new(cluster),
            gres: Box::new(NullGres),
        }
    }

    /// Use a specific GRES subsystem
    pub fn with_gres(mut self, gres: impl GresScheduler + 'static) -> Self {
        self.gres = Box::new(gres);
        self
    }

    /// Number of nodes in the cluster
    pub fn node_count(&self) -> usize {
        self.cluster.read().node_count()
    }

    /// Mutate cluster state between selection calls
    pub fn update_cluster(&self, f: impl FnOnce(&mut Cluster)) {
        f(&mut self.cluster.write());
    }

    /// Run one selection; advisory fields on `job` are updated in place
    pub fn select(&self, job: &mut JobRequest, input: SelectInput) -> Result<Selection> {
        let cluster = self.cluster.read();
        let mut ctx = EvalContext::new(&cluster, self.gres.as_ref(), job.clone(), input);
        let outcome = eval_nodes(&mut ctx);
        job.best_switch = ctx.job.best_switch;
        job.req_switch = ctx.job.req_switch;
        outcome?;
        let total_cpus = ctx
            .node_map
            .iter_set()
            .map(|i| ctx.avail_res[i].avail_cpus as u64)
            .sum();
        Ok(Selection {
            cpus_per_node: ctx.avail_res.iter().map(|r| r.avail_cpus).collect(),
            total_cpus,
            best_switch: ctx.job.best_switch,
            nodes: ctx.node_map,
        })
    }
}
