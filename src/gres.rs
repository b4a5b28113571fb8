//! Generic-resource (GRES) scheduling seam
//!
//! The selection core never interprets generic resources itself; it drives
//! them through the narrow [`GresScheduler`] contract. The aggregate
//! committed so far lives on the evaluation context and is threaded through
//! every call, which keeps a selection a pure function of its inputs.
//!
//! ## Table of Contents
//! - **GresRequest**: What the job asks for (per-job and per-node counts)
//! - **SockGres**: What one node offers, per socket
//! - **GresAccum**: Aggregate tracked across selected nodes
//! - **GresScheduler**: The subsystem contract
//! - **NullGres** / **CountingGres**: Bundled implementations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::bitmap::CoreMask;
use crate::types::{AvailRes, NodeRecord};

/// A job's generic-resource request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GresRequest {
    /// Total count required across the whole allocation, per resource name
    pub per_job: BTreeMap<String, u64>,
    /// Count required on every selected node, per resource name
    pub per_node: BTreeMap<String, u64>,
    /// CPU floor a node must offer when it carries this job's GRES
    pub min_cpus_per_node: u32,
    /// CPU floor across the whole allocation induced by the GRES request
    pub min_cpus_per_job: u32,
}

impl GresRequest {
    /// True when the job requests no generic resources
    pub fn is_empty(&self) -> bool {
        self.per_job.is_empty() && self.per_node.is_empty()
    }

    /// Require `count` of `name` across the allocation
    pub fn per_job(mut self, name: impl Into<String>, count: u64) -> Self {
        self.per_job.insert(name.into(), count);
        self
    }

    /// Require `count` of `name` on every selected node
    pub fn per_node(mut self, name: impl Into<String>, count: u64) -> Self {
        self.per_node.insert(name.into(), count);
        self
    }

    /// Set the per-node CPU floor tied to this request
    pub fn with_min_cpus_per_node(mut self, cpus: u32) -> Self {
        self.min_cpus_per_node = cpus;
        self
    }
}

/// Availability of one generic resource on one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SockGres {
    /// Resource name (e.g. "gpu")
    pub name: String,
    /// Total count available on the node
    pub total: u64,
    /// Count available per socket
    pub per_socket: Vec<u64>,
}

impl SockGres {
    /// Create a node-level availability entry
    pub fn new(name: impl Into<String>, total: u64) -> Self {
        Self {
            name: name.into(),
            total,
            per_socket: Vec::new(),
        }
    }

    /// Attach a per-socket breakdown
    pub fn with_sockets(mut self, per_socket: Vec<u64>) -> Self {
        self.per_socket = per_socket;
        self
    }
}

/// Aggregate of generic resources over a set of nodes
#[derive(Debug, Clone, Default)]
pub struct GresAccum(BTreeMap<String, u64>);

impl GresAccum {
    /// Empty aggregate
    pub fn new() -> Self {
        Self::default()
    }

    /// Count aggregated for `name`
    pub fn get(&self, name: &str) -> u64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    /// Add `count` of `name`
    pub fn add(&mut self, name: &str, count: u64) {
        *self.0.entry(name.to_string()).or_insert(0) += count;
    }

    /// Merge another aggregate into a copy of this one
    pub fn merged(&self, other: &GresAccum) -> GresAccum {
        let mut out = self.clone();
        for (name, count) in &other.0 {
            out.add(name, *count);
        }
        out
    }
}

impl fmt::Display for GresAccum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (n, (name, count)) in self.0.iter().enumerate() {
            if n > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", name, count)?;
        }
        Ok(())
    }
}

/// Inputs to [`GresScheduler::filter_sock_core`]
#[derive(Debug)]
pub struct SockCoreFilter<'a> {
    /// The job's GRES request
    pub gres: &'a GresRequest,
    /// The node being filtered
    pub node: &'a NodeRecord,
    /// Minimum tasks this node would have to host
    pub min_tasks: u32,
    /// Maximum tasks this node may host; `None` is unbounded
    pub max_tasks: Option<u32>,
    /// Nodes still to be selected after this one
    pub rem_nodes: i64,
    /// Tasks must bind to the GRES topology
    pub enforce_binding: bool,
    /// First scheduling pass over this job
    pub first_pass: bool,
    /// Job takes the whole node
    pub whole_node: bool,
    /// CPUs available before filtering
    pub avail_cpus: u32,
}

/// Contract between the selection core and the GRES subsystem
///
/// All aggregate state is carried by the caller in [`GresAccum`] values, so
/// implementations can be stateless.
pub trait GresScheduler: Send + Sync {
    /// True when the job has per-job GRES constraints that require
    /// aggregate tracking across selected nodes
    fn sched_init(&self, req: &GresRequest) -> bool;

    /// Commit this node's contribution to the job aggregate; may lower
    /// `avail_cpus` when the node's GRES limits the useful CPU count
    fn sched_add(
        &self,
        accum: &mut GresAccum,
        req: &GresRequest,
        sock_gres: &[SockGres],
        avail_cpus: &mut u32,
    );

    /// Tentatively aggregate this node for a run or block under
    /// consideration, without committing anything
    fn sched_consec(&self, accum: &mut GresAccum, req: &GresRequest, sock_gres: &[SockGres]);

    /// Would `accum` satisfy the per-job request?
    fn sched_sufficient(&self, req: &GresRequest, accum: &GresAccum) -> bool;

    /// Does the committed aggregate satisfy the per-job request?
    fn sched_test(&self, req: &GresRequest, accum: &GresAccum) -> bool;

    /// Render an aggregate for diagnostics
    fn sched_str(&self, accum: &GresAccum) -> String {
        accum.to_string()
    }

    /// Prune sockets/cores a job cannot use on this node and return the
    /// resulting CPU count; writes `gres_min_cpus`/`gres_max_tasks` back
    /// onto the availability record
    fn filter_sock_core(
        &self,
        args: &SockCoreFilter<'_>,
        avail_core: &mut CoreMask,
        avail_res: &mut AvailRes,
    ) -> u32;
}

/// GRES scheduler for clusters without generic resources
///
/// Predicates always pass and filtering leaves the CPU count untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullGres;

impl GresScheduler for NullGres {
    fn sched_init(&self, _req: &GresRequest) -> bool {
        false
    }

    fn sched_add(
        &self,
        _accum: &mut GresAccum,
        _req: &GresRequest,
        _sock_gres: &[SockGres],
        _avail_cpus: &mut u32,
    ) {
    }

    fn sched_consec(&self, _accum: &mut GresAccum, _req: &GresRequest, _sock_gres: &[SockGres]) {}

    fn sched_sufficient(&self, _req: &GresRequest, _accum: &GresAccum) -> bool {
        true
    }

    fn sched_test(&self, _req: &GresRequest, _accum: &GresAccum) -> bool {
        true
    }

    fn filter_sock_core(
        &self,
        args: &SockCoreFilter<'_>,
        _avail_core: &mut CoreMask,
        avail_res: &mut AvailRes,
    ) -> u32 {
        avail_res.gres_max_tasks = args.max_tasks;
        args.avail_cpus
    }
}

/// Counting GRES scheduler
///
/// Tracks named resources by count: per-node requirements gate node
/// usability, per-job requirements accumulate across selected nodes up to
/// the requested totals.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountingGres;

impl GresScheduler for CountingGres {
    fn sched_init(&self, req: &GresRequest) -> bool {
        !req.per_job.is_empty()
    }

    fn sched_add(
        &self,
        accum: &mut GresAccum,
        req: &GresRequest,
        sock_gres: &[SockGres],
        _avail_cpus: &mut u32,
    ) {
        for (name, want) in &req.per_job {
            let have = accum.get(name);
            if have >= *want {
                continue;
            }
            let on_node: u64 = sock_gres
                .iter()
                .filter(|s| &s.name == name)
                .map(|s| s.total)
                .sum();
            accum.add(name, on_node.min(*want - have));
        }
    }

    fn sched_consec(&self, accum: &mut GresAccum, req: &GresRequest, sock_gres: &[SockGres]) {
        for name in req.per_job.keys() {
            let on_node: u64 = sock_gres
                .iter()
                .filter(|s| &s.name == name)
                .map(|s| s.total)
                .sum();
            accum.add(name, on_node);
        }
    }

    fn sched_sufficient(&self, req: &GresRequest, accum: &GresAccum) -> bool {
        req.per_job.iter().all(|(name, want)| accum.get(name) >= *want)
    }

    fn sched_test(&self, req: &GresRequest, accum: &GresAccum) -> bool {
        self.sched_sufficient(req, accum)
    }

    fn filter_sock_core(
        &self,
        args: &SockCoreFilter<'_>,
        _avail_core: &mut CoreMask,
        avail_res: &mut AvailRes,
    ) -> u32 {
        avail_res.gres_max_tasks = args.max_tasks;
        for (name, want) in &args.gres.per_node {
            let on_node: u64 = avail_res
                .sock_gres
                .iter()
                .filter(|s| &s.name == name)
                .map(|s| s.total)
                .sum();
            if on_node < *want {
                return 0;
            }
        }
        if !args.gres.per_job.is_empty() || !args.gres.per_node.is_empty() {
            avail_res.gres_min_cpus = args.gres.min_cpus_per_node;
        }
        args.avail_cpus
    }
}
