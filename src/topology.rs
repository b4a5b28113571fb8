//! Cluster topology tables
//!
//! Two independent topology models feed the selection strategies:
//!
//! - a **switch tree** (arena of [`Switch`] records addressed by index,
//!   with parent links and pairwise distances), consumed by the tree and
//!   dragonfly strategies;
//! - a **block table** (flat list of base blocks plus a bitmask of legal
//!   power-of-two group sizes), consumed by the block strategy.
//!
//! Both are built by the caller and read-only during a selection call.

use serde::{Deserialize, Serialize};

use crate::bitmap::NodeMask;

/// Distance sentinel for unreachable switch pairs
///
/// Sticky under accumulation: any sum involving it stays unreachable.
pub const UNREACHABLE: u32 = u32::MAX;

/// One switch in the tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Switch {
    /// Switch name, used only for diagnostics
    pub name: String,
    /// Tree level; 0 is a leaf directly attached to nodes
    pub level: u32,
    /// Parent switch index, `None` at a tree root
    pub parent: Option<usize>,
    /// All nodes reachable through this switch
    pub nodes: NodeMask,
    /// Distance to every other switch; empty until computed
    pub link_dist: Vec<u32>,
}

impl Switch {
    /// Create a leaf switch over the given nodes
    pub fn leaf(name: impl Into<String>, nodes: NodeMask) -> Self {
        Self {
            name: name.into(),
            level: 0,
            parent: None,
            nodes,
            link_dist: Vec::new(),
        }
    }

    /// Create an interior switch at `level` spanning the given nodes
    pub fn interior(name: impl Into<String>, level: u32, nodes: NodeMask) -> Self {
        Self {
            name: name.into(),
            level,
            parent: None,
            nodes,
            link_dist: Vec::new(),
        }
    }

    /// Set the parent switch index
    pub fn with_parent(mut self, parent: usize) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// The switch tree, stored as an arena addressed by index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchTable {
    /// Switch records; parent links index into this vector
    pub switches: Vec<Switch>,
}

impl SwitchTable {
    /// Build a table from switch records and derive pairwise distances
    /// from the parent links (hops to the closest common ancestor; pairs
    /// in different trees are [`UNREACHABLE`])
    pub fn new(switches: Vec<Switch>) -> Self {
        let mut table = Self { switches };
        table.compute_distances();
        table
    }

    /// Number of switches
    pub fn len(&self) -> usize {
        self.switches.len()
    }

    /// True when the table holds no switches
    pub fn is_empty(&self) -> bool {
        self.switches.is_empty()
    }

    /// Distance between two switches
    pub fn dist(&self, a: usize, b: usize) -> u32 {
        if a == b {
            return 0;
        }
        self.switches[a].link_dist.get(b).copied().unwrap_or(UNREACHABLE)
    }

    fn ancestors(&self, mut i: usize) -> Vec<usize> {
        let mut chain = vec![i];
        while let Some(p) = self.switches[i].parent {
            chain.push(p);
            i = p;
        }
        chain
    }

    fn compute_distances(&mut self) {
        let n = self.switches.len();
        let chains: Vec<Vec<usize>> = (0..n).map(|i| self.ancestors(i)).collect();
        for a in 0..n {
            let mut dist = vec![UNREACHABLE; n];
            for (b, chain_b) in chains.iter().enumerate() {
                if a == b {
                    dist[b] = 0;
                    continue;
                }
                let mut best = UNREACHABLE;
                for (up_a, anc) in chains[a].iter().enumerate() {
                    if let Some(up_b) = chain_b.iter().position(|x| x == anc) {
                        best = (up_a + up_b) as u32;
                        break;
                    }
                }
                dist[b] = best;
            }
            self.switches[a].link_dist = dist;
        }
    }
}

/// Saturating distance accumulation with a sticky sentinel
pub fn dist_add(acc: u64, step: u32) -> u64 {
    if acc == u64::MAX || step == UNREACHABLE {
        u64::MAX
    } else {
        acc.saturating_add(step as u64)
    }
}

/// A leaf unit of the block topology
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseBlock {
    /// Block name, used only for diagnostics
    pub name: String,
    /// Nodes in this base block
    pub nodes: NodeMask,
}

impl BaseBlock {
    /// Create a base block over the given nodes
    pub fn new(name: impl Into<String>, nodes: NodeMask) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }
}

/// The block topology: base blocks plus legal grouping sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockTable {
    /// Base blocks in node order
    pub base_blocks: Vec<BaseBlock>,
    /// Bitmask of legal group sizes: bit `k` set means groups of `2^k`
    /// base blocks may be allocated
    pub block_levels: u32,
    bblock_node_cnt: u32,
    nodes_any: NodeMask,
}

impl BlockTable {
    /// Build a table; base blocks are assumed uniform in size
    pub fn new(base_blocks: Vec<BaseBlock>, block_levels: u32) -> Self {
        let width = base_blocks.first().map(|b| b.nodes.len()).unwrap_or(0);
        let mut nodes_any = NodeMask::new(width);
        for b in &base_blocks {
            nodes_any.or_assign(&b.nodes);
        }
        let bblock_node_cnt = base_blocks.first().map(|b| b.nodes.count() as u32).unwrap_or(0);
        Self {
            base_blocks,
            block_levels,
            bblock_node_cnt,
            nodes_any,
        }
    }

    /// Number of base blocks
    pub fn len(&self) -> usize {
        self.base_blocks.len()
    }

    /// True when the table holds no base blocks
    pub fn is_empty(&self) -> bool {
        self.base_blocks.is_empty()
    }

    /// Nodes per base block
    pub fn base_size(&self) -> u32 {
        self.bblock_node_cnt
    }

    /// Union of every base block's nodes
    pub fn nodes_any(&self) -> &NodeMask {
        &self.nodes_any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Bitmap;

    /// Two leaves under one root, plus a detached leaf.
    fn sample_table() -> SwitchTable {
        let width = 6;
        SwitchTable::new(vec![
            Switch::leaf("leaf0", Bitmap::from_indices(width, &[0, 1])).with_parent(2),
            Switch::leaf("leaf1", Bitmap::from_indices(width, &[2, 3])).with_parent(2),
            Switch::interior("spine", 1, Bitmap::from_indices(width, &[0, 1, 2, 3])),
            Switch::leaf("island", Bitmap::from_indices(width, &[4, 5])),
        ])
    }

    #[test]
    fn test_tree_distances() {
        let t = sample_table();
        assert_eq!(t.dist(0, 0), 0);
        assert_eq!(t.dist(0, 2), 1);
        assert_eq!(t.dist(0, 1), 2);
        assert_eq!(t.dist(0, 3), UNREACHABLE);
        assert_eq!(t.dist(3, 2), UNREACHABLE);
    }

    #[test]
    fn test_dist_add_sticky() {
        assert_eq!(dist_add(3, 2), 5);
        assert_eq!(dist_add(3, UNREACHABLE), u64::MAX);
        assert_eq!(dist_add(u64::MAX, 0), u64::MAX);
    }

    #[test]
    fn test_block_table() {
        let width = 8;
        let blocks: Vec<_> = (0..4)
            .map(|b| BaseBlock::new(format!("b{}", b), Bitmap::from_indices(width, &[2 * b, 2 * b + 1])))
            .collect();
        let t = BlockTable::new(blocks, 0b10);
        assert_eq!(t.len(), 4);
        assert_eq!(t.base_size(), 2);
        assert_eq!(t.nodes_any().count(), 8);
    }
}
