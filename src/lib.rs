//! # anvil-select
//!
//! Node-selection core for the Anvil batch scheduler: given a job's
//! resource request and a set of candidate compute nodes, choose the
//! subset of nodes (and the CPU count to charge on each) that satisfies
//! the request while honoring scheduling weights, switch/block topology,
//! and generic-resource constraints.
//!
//! ## Features
//!
//! - **Strategies**: spread, busy, least-loaded, serial, consecutive-run
//!   best fit, dragonfly, tree topology with retry, block topology
//! - **Weight ordering**: candidates partition into ascending weight
//!   buckets; lower weight always wins first
//! - **Topology locality**: selections stay under one top switch or
//!   inside one block group, with an advisory flag when waiting longer
//!   could improve locality
//! - **GRES seam**: generic resources drive through a narrow trait, so
//!   the core never interprets them itself
//!
//! ## Quick Start
//!
//! ```rust
//! use anvil_select::{AvailRes, Cluster, JobRequest, NodeMask, NodeRecord, SelectInput, Selector};
//!
//! fn main() -> anvil_select::Result<()> {
//!     let nodes: Vec<NodeRecord> = (0..4)
//!         .map(|i| NodeRecord::new(format!("node{i}"), 2, 8, 1))
//!         .collect();
//!     let selector = Selector::new(Cluster::new(nodes));
//!
//!     let mut job = JobRequest::new(42, 32);
//!     let avail_res = (0..4).map(|_| AvailRes::new(16)).collect();
//!     let input = SelectInput::new(NodeMask::full(4), avail_res).nodes(2, 2, 4);
//!
//!     let selection = selector.select(&mut job, input)?;
//!     assert_eq!(selection.nodes.count(), 2);
//!     assert_eq!(selection.total_cpus, 32);
//!     Ok(())
//! }
//! ```
//!
//! The core is synchronous and pure: it performs no I/O, keeps no state
//! between calls, and is deterministic for a given input.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod bitmap;
pub mod cluster;
pub mod error;
pub mod gres;
pub mod job;
pub mod select;
pub mod topology;
pub mod types;

// Re-exports for ergonomic API
pub use bitmap::{Bitmap, CoreMask, NodeMask};
pub use cluster::{Cluster, SelectConfig, Tunables};
pub use error::{Result, SelectError};
pub use gres::{CountingGres, GresAccum, GresRequest, GresScheduler, NullGres, SockGres};
pub use job::JobRequest;
pub use select::{
    choose_strategy, enough_nodes, eval_nodes, EvalContext, SelectInput, Selection, Selector,
    Strategy,
};
pub use topology::{BaseBlock, BlockTable, Switch, SwitchTable};
pub use types::{build_weight_buckets, AvailRes, CrType, NodeRecord, WeightBucket};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bitmap::{CoreMask, NodeMask};
    pub use crate::cluster::Cluster;
    pub use crate::error::Result;
    pub use crate::gres::{GresRequest, GresScheduler};
    pub use crate::job::JobRequest;
    pub use crate::select::{eval_nodes, EvalContext, SelectInput, Selector};
    pub use crate::types::{AvailRes, CrType, NodeRecord};
}
