//! Cluster state handed into a selection call
//!
//! ## Table of Contents
//! - **Cluster**: Node table, topology tables, idle set, tunables
//! - **SelectConfig**: Raw tunable strings from the scheduler configuration
//! - **Tunables**: The three cached selection tunables

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::bitmap::NodeMask;
use crate::topology::{BlockTable, SwitchTable};
use crate::types::NodeRecord;

/// Raw configuration strings the selection core reads its tunables from
///
/// The strings carry comma-separated parameter lists exactly as they appear
/// in the scheduler's configuration file; membership tests are
/// case-insensitive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectConfig {
    /// Scheduler parameter list (e.g. `"pack_serial_at_end,bf_continue"`)
    pub sched_params: String,
    /// Topology plugin parameter list (e.g. `"dragonfly,TopoOptional"`)
    pub topology_param: String,
}

impl SelectConfig {
    /// Set the scheduler parameter list
    pub fn with_sched_params(mut self, params: impl Into<String>) -> Self {
        self.sched_params = params.into();
        self
    }

    /// Set the topology parameter list
    pub fn with_topology_param(mut self, params: impl Into<String>) -> Self {
        self.topology_param = params.into();
        self
    }
}

fn has_param(list: &str, name: &str) -> bool {
    list.split(',').any(|p| p.trim().eq_ignore_ascii_case(name))
}

/// Selection tunables, parsed from [`SelectConfig`] once per cluster
#[derive(Debug, Clone, Copy, Default)]
pub struct Tunables {
    /// Serial (1 CPU / 1 node) jobs pack from the high end of the node table
    pub pack_serial_at_end: bool,
    /// Switch topology is a dragonfly
    pub dragonfly: bool,
    /// Topology-aware placement only when the job asked for switches
    pub topo_optional: bool,
}

impl Tunables {
    fn from_config(cfg: &SelectConfig) -> Self {
        Self {
            pack_serial_at_end: has_param(&cfg.sched_params, "pack_serial_at_end"),
            dragonfly: has_param(&cfg.topology_param, "dragonfly"),
            topo_optional: has_param(&cfg.topology_param, "topoptional"),
        }
    }
}

/// Everything the selection core reads about the cluster
///
/// Read-only for the duration of a call; the [`Selector`](crate::select::Selector)
/// boundary enforces this with a reader lock.
#[derive(Debug, Default)]
pub struct Cluster {
    /// Node records, addressed by node index
    pub nodes: Vec<NodeRecord>,
    /// Switch tree, when the cluster has one
    pub switches: Option<SwitchTable>,
    /// Block topology, when the cluster has one
    pub blocks: Option<BlockTable>,
    /// Nodes currently running no work
    pub idle_nodes: NodeMask,
    config: SelectConfig,
    tunables: OnceLock<Tunables>,
}

impl Cluster {
    /// Create a cluster over the given node table; every node starts idle
    pub fn new(nodes: Vec<NodeRecord>) -> Self {
        let idle_nodes = NodeMask::full(nodes.len());
        Self {
            nodes,
            switches: None,
            blocks: None,
            idle_nodes,
            config: SelectConfig::default(),
            tunables: OnceLock::new(),
        }
    }

    /// Attach a switch tree
    pub fn with_switches(mut self, switches: SwitchTable) -> Self {
        self.switches = Some(switches);
        self
    }

    /// Attach a block topology
    pub fn with_blocks(mut self, blocks: BlockTable) -> Self {
        self.blocks = Some(blocks);
        self
    }

    /// Attach configuration
    pub fn with_config(mut self, config: SelectConfig) -> Self {
        self.config = config;
        self
    }

    /// Number of nodes in the cluster
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Mark a node busy (running work)
    pub fn mark_busy(&mut self, node: usize) {
        self.idle_nodes.clear(node);
    }

    /// Mark a node idle
    pub fn mark_idle(&mut self, node: usize) {
        self.idle_nodes.set(node);
    }

    /// The cached selection tunables, parsed on first use
    pub fn tunables(&self) -> Tunables {
        *self.tunables.get_or_init(|| Tunables::from_config(&self.config))
    }

    /// Render a node mask as a comma-separated name list, for diagnostics
    pub fn node_names(&self, mask: &NodeMask) -> String {
        mask.iter_set()
            .map(|i| self.nodes[i].name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}
