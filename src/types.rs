//! Core types for the selection data model
//!
//! ## Table of Contents
//! - **NodeRecord**: Hardware shape and scheduling weight of one node
//! - **AvailRes**: Per-node availability record threaded in and out of a call
//! - **CrType**: Consumable-resource flag word
//! - **WeightBucket**: One weight class of candidate nodes

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::bitmap::NodeMask;
use crate::gres::SockGres;

bitflags! {
    /// Consumable-resource behavior flags
    ///
    /// A compacted rendition of the cluster's `select_type_param`; only the
    /// bits the selection core reacts to are modeled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CrType: u32 {
        /// Allocate whole sockets
        const SOCKET = 1 << 0;
        /// Least-loaded-node placement
        const LLN = 1 << 1;
        /// At most one task per core
        const ONE_TASK_PER_CORE = 1 << 2;
    }
}

impl Default for CrType {
    fn default() -> Self {
        Self::empty()
    }
}

/// Static description of one compute node
///
/// Read-only to the selection core; the node table is owned by the caller
/// and must be stable for the duration of a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Node name, used only for diagnostics
    pub name: String,
    /// Scheduling weight; lower is preferred
    pub sched_weight: u64,
    /// Total usable CPUs
    pub cpus: u32,
    /// Board count
    pub boards: u32,
    /// Socket count
    pub tot_sockets: u32,
    /// Cores per socket
    pub cores: u32,
    /// Total cores
    pub tot_cores: u32,
    /// Threads per core
    pub tpc: u32,
    /// Cores reserved for system use
    pub core_spec_cnt: u32,
}

impl NodeRecord {
    /// Create a node from its socket/core/thread geometry
    pub fn new(name: impl Into<String>, sockets: u32, cores_per_socket: u32, tpc: u32) -> Self {
        let tot_cores = sockets * cores_per_socket;
        Self {
            name: name.into(),
            sched_weight: 1,
            cpus: tot_cores * tpc,
            boards: 1,
            tot_sockets: sockets,
            cores: cores_per_socket,
            tot_cores,
            tpc,
            core_spec_cnt: 0,
        }
    }

    /// Set the scheduling weight
    pub fn with_weight(mut self, weight: u64) -> Self {
        self.sched_weight = weight;
        self
    }

    /// Set the board count
    pub fn with_boards(mut self, boards: u32) -> Self {
        self.boards = boards;
        self
    }

    /// Reserve cores for system use
    pub fn with_spec_cores(mut self, count: u32) -> Self {
        self.core_spec_cnt = count;
        self
    }
}

/// Per-node availability record
///
/// Built by the caller for every candidate node before a call. The core
/// refines `avail_cpus` (and the GRES write-back fields) as it selects; on
/// success `avail_cpus` is the CPU count charged to the job on that node,
/// zero for unselected nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvailRes {
    /// CPUs the job may use on this node right now
    pub avail_cpus: u32,
    /// Upper bound of CPUs usable by this job on this node
    pub max_cpus: u32,
    /// Generic-resource GPUs available
    pub avail_gpus: u64,
    /// Total countable resources available
    pub avail_res_cnt: u64,
    /// Per-socket generic-resource availability
    pub sock_gres: Vec<SockGres>,
    /// Socket count covered by `sock_gres`
    pub sock_cnt: u32,
    /// GRES-induced per-node CPU floor (written back by core selection)
    pub gres_min_cpus: u32,
    /// GRES-induced task ceiling (written back by core selection)
    pub gres_max_tasks: Option<u32>,
}

impl AvailRes {
    /// Create a record with the given available CPU count
    pub fn new(avail_cpus: u32) -> Self {
        Self {
            avail_cpus,
            max_cpus: avail_cpus,
            ..Default::default()
        }
    }

    /// Set the per-job CPU ceiling for this node
    pub fn with_max_cpus(mut self, max_cpus: u32) -> Self {
        self.max_cpus = max_cpus;
        self
    }

    /// Attach generic-resource availability
    pub fn with_sock_gres(mut self, sock_gres: Vec<SockGres>) -> Self {
        self.sock_cnt = sock_gres.iter().map(|s| s.per_socket.len() as u32).max().unwrap_or(0);
        self.avail_gpus = sock_gres
            .iter()
            .filter(|s| s.name == "gpu")
            .map(|s| s.total)
            .sum();
        self.avail_res_cnt = sock_gres.iter().map(|s| s.total).sum();
        self.sock_gres = sock_gres;
        self
    }
}

/// One weight class of candidate nodes
#[derive(Debug, Clone)]
pub struct WeightBucket {
    /// Shared scheduling weight of every node in the bucket
    pub weight: u64,
    /// Nodes in this bucket
    pub nodes: NodeMask,
    /// Number of nodes in this bucket
    pub node_cnt: u32,
}

/// Partition a candidate map into weight buckets, ascending by weight
///
/// The buckets partition `map` exactly; iterating them visits every
/// candidate once, lowest weight first.
pub fn build_weight_buckets(nodes: &[NodeRecord], map: &NodeMask) -> Vec<WeightBucket> {
    let mut by_weight: BTreeMap<u64, NodeMask> = BTreeMap::new();
    for i in map.iter_set() {
        by_weight
            .entry(nodes[i].sched_weight)
            .or_insert_with(|| NodeMask::new(map.len()))
            .set(i);
    }
    by_weight
        .into_iter()
        .map(|(weight, nodes)| WeightBucket {
            weight,
            node_cnt: nodes.count() as u32,
            nodes,
        })
        .collect()
}
