//! Job request definition
//!
//! ## Table of Contents
//! - **JobRequest**: Everything a selection call needs to know about one job

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bitmap::NodeMask;
use crate::gres::GresRequest;

/// A job's resource request, as seen by the selection core
///
/// The node-count bounds (`min_nodes`/`req_nodes`/`max_nodes`) travel on the
/// evaluation context rather than here, because the caller may re-evaluate
/// the same job under different bounds. Task-layout fields
/// (`cpus_per_task`, `ntasks_per_*`) live directly on the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Job identifier, used only for diagnostics
    pub job_id: u64,
    /// Minimum CPUs across the whole allocation
    pub min_cpus: u32,
    /// CPU ceiling across the whole allocation
    pub max_cpus: Option<u32>,
    /// Per-node CPU floor
    pub pn_min_cpus: u32,
    /// CPUs bound to each task
    pub cpus_per_task: u32,
    /// Total task count, when known
    pub num_tasks: Option<u32>,
    /// Task cap per node
    pub ntasks_per_node: Option<u32>,
    /// Task cap per board
    pub ntasks_per_board: Option<u32>,
    /// Task cap per socket
    pub ntasks_per_socket: Option<u32>,
    /// Task cap per core
    pub ntasks_per_core: Option<u32>,
    /// Task cap per generic resource
    pub ntasks_per_tres: Option<u32>,
    /// Job takes every CPU on each selected node
    pub whole_node: bool,
    /// Selected nodes must be consecutive in the node table
    pub contiguous: bool,
    /// Tasks may oversubscribe CPUs
    pub overcommit: bool,
    /// Maximize node count instead of packing
    pub spread_job: bool,
    /// Nodes the job explicitly names; each must end up selected
    pub req_node_mask: Option<NodeMask>,
    /// Per-required-node task counts for arbitrary task layouts
    pub arbitrary_tpn: Option<Vec<u32>>,
    /// Leaf-switch count the job asks to be confined to
    pub req_switch: u32,
    /// Seconds the job is willing to wait for better switch locality
    pub wait4switch: u32,
    /// When the job started waiting for switch locality
    pub wait4switch_start: Option<DateTime<Utc>>,
    /// Generic-resource request
    pub gres: GresRequest,
    /// Advisory output: false when the switch constraint went unmet and
    /// waiting longer might improve locality
    pub best_switch: bool,
}

impl JobRequest {
    /// Create a request for `min_cpus` CPUs
    pub fn new(job_id: u64, min_cpus: u32) -> Self {
        Self {
            job_id,
            min_cpus,
            max_cpus: None,
            pn_min_cpus: 1,
            cpus_per_task: 1,
            num_tasks: None,
            ntasks_per_node: None,
            ntasks_per_board: None,
            ntasks_per_socket: None,
            ntasks_per_core: None,
            ntasks_per_tres: None,
            whole_node: false,
            contiguous: false,
            overcommit: false,
            spread_job: false,
            req_node_mask: None,
            arbitrary_tpn: None,
            req_switch: 0,
            wait4switch: 0,
            wait4switch_start: None,
            gres: GresRequest::default(),
            best_switch: true,
        }
    }

    /// Set the allocation-wide CPU ceiling
    pub fn with_max_cpus(mut self, max_cpus: u32) -> Self {
        self.max_cpus = Some(max_cpus);
        self
    }

    /// Set the per-node CPU floor
    pub fn with_node_min_cpus(mut self, pn_min_cpus: u32) -> Self {
        self.pn_min_cpus = pn_min_cpus;
        self
    }

    /// Set the task count and CPUs per task
    pub fn with_tasks(mut self, num_tasks: u32, cpus_per_task: u32) -> Self {
        self.num_tasks = Some(num_tasks);
        self.cpus_per_task = cpus_per_task;
        self
    }

    /// Cap tasks per node
    pub fn tasks_per_node(mut self, count: u32) -> Self {
        self.ntasks_per_node = Some(count);
        self
    }

    /// Name nodes that must be part of the selection
    pub fn require_nodes(mut self, mask: NodeMask) -> Self {
        self.req_node_mask = Some(mask);
        self
    }

    /// Request whole-node allocation
    pub fn whole_node(mut self) -> Self {
        self.whole_node = true;
        self
    }

    /// Request consecutive nodes
    pub fn contiguous(mut self) -> Self {
        self.contiguous = true;
        self
    }

    /// Request node-spread placement
    pub fn spread(mut self) -> Self {
        self.spread_job = true;
        self
    }

    /// Confine the job to `count` leaf switches, waiting up to `wait_secs`
    pub fn with_switches(mut self, count: u32, wait_secs: u32) -> Self {
        self.req_switch = count;
        self.wait4switch = wait_secs;
        self
    }

    /// Attach a generic-resource request
    pub fn with_gres(mut self, gres: GresRequest) -> Self {
        self.gres = gres;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::NodeMask;

    #[test]
    fn test_serde_round_trip() {
        let job = JobRequest::new(5, 8).require_nodes(NodeMask::from_indices(4, &[1]));
        let json = serde_json::to_string(&job).unwrap();
        let back: JobRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.min_cpus, 8);
        assert!(back.req_node_mask.unwrap().test(1));
    }

    #[test]
    fn test_builder() {
        let job = JobRequest::new(1001, 32)
            .with_max_cpus(64)
            .with_tasks(8, 4)
            .with_switches(1, 300)
            .contiguous();

        assert_eq!(job.min_cpus, 32);
        assert_eq!(job.max_cpus, Some(64));
        assert_eq!(job.num_tasks, Some(8));
        assert_eq!(job.cpus_per_task, 4);
        assert_eq!(job.req_switch, 1);
        assert!(job.contiguous);
        assert!(job.best_switch);
    }
}
