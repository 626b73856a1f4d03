use std::{collections::VecDeque, fmt::Display};

use bitvec::prelude::LocalBits;
use bitvec::vec::BitVec;

use crate::factor_tree::node::NodeId;

/// Selects the semiring messages are computed in.
/// Both runs combine independent contributions by multiplication and differ only in how
/// alternative assignments are aggregated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Run {
    SumProduct, // marginal totals
    MaxProduct, // best achievable quality
}

impl Run {
    pub fn aggregate(&self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Run::SumProduct => lhs + rhs,
            Run::MaxProduct => lhs.max(rhs),
        }
    }

    /// Neutral element of `aggregate` over non-negative numbers
    pub fn aggregate_identity(&self) -> f64 {
        0.
    }

    pub fn combine(&self, lhs: f64, rhs: f64) -> f64 {
        lhs * rhs
    }

    pub fn combine_identity(&self) -> f64 {
        1.
    }
}

impl Display for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Run::SumProduct => write!(f, "sum-product"),
            Run::MaxProduct => write!(f, "max-product"),
        }
    }
}

/// Record of a forward pass toward a target node.
/// Every visited node other than the target resolved the directed edge to its next hop,
/// so walking the edges backwards from the target reaches each node exactly once.
#[derive(Debug, Clone)]
pub struct Traversal {
    target: NodeId,
    run: Run,
    visited: BitVec<usize, LocalBits>,
    next_hop: Vec<Option<NodeId>>, // neighbor one step closer to the target
    order: Vec<NodeId>,            // breadth-first order starting at the target
}

impl Traversal {
    /// Orients the tree toward `target` by a breadth-first walk over the given adjacency lists
    pub(crate) fn new(target: NodeId, run: Run, neighbors: &[Vec<NodeId>]) -> Self {
        let num_nodes = neighbors.len();
        let mut visited = BitVec::<usize, LocalBits>::repeat(false, num_nodes);
        let mut next_hop = vec![None; num_nodes];
        let mut order = Vec::with_capacity(num_nodes);
        let mut queue = VecDeque::from([target]);
        visited.set(target.index(), true);

        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &neighbor in &neighbors[node.index()] {
                if !visited[neighbor.index()] {
                    visited.set(neighbor.index(), true);
                    next_hop[neighbor.index()] = Some(node);
                    queue.push_back(neighbor);
                }
            }
        }

        Traversal {
            target,
            run,
            visited,
            next_hop,
            order,
        }
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn run(&self) -> Run {
        self.run
    }

    /// Number of nodes of the tree the traversal was recorded on
    pub fn num_nodes(&self) -> usize {
        self.next_hop.len()
    }

    pub fn is_visited(&self, node: NodeId) -> bool {
        node.index() < self.visited.len() && self.visited[node.index()]
    }

    pub fn num_visited(&self) -> usize {
        self.visited.count_ones()
    }

    pub fn next_hop(&self, node: NodeId) -> Option<NodeId> {
        self.next_hop.get(node.index()).copied().flatten()
    }

    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Directed edges resolved by the pass, in breadth-first order from the target outward
    pub fn resolved_edges(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.order
            .iter()
            .filter_map(|node| self.next_hop(*node).map(|hop| (*node, hop)))
    }

    /// Neighbors of `node` that sent their message to it during the pass
    pub fn outward<'a>(
        &'a self,
        node: NodeId,
        neighbors: &'a [Vec<NodeId>],
    ) -> impl Iterator<Item = NodeId> + 'a {
        neighbors[node.index()]
            .iter()
            .copied()
            .filter(move |neighbor| self.next_hop(*neighbor) == Some(node))
    }
}
