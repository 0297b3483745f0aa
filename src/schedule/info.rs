//! Per-node solver state, scoped to one solve.

use crate::bufferize::LogicalBuffer;
use crate::polyhedral::AffineMap;
use crate::solver::{IntExpr, VarId};
use crate::tile::node::{OpId, TileNodeId};
use std::fmt;

/// Which domain dimensions of a node change the region of a buffer it
/// accesses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopMask(Vec<bool>);

impl LoopMask {
    /// Mask of a node whose domain reaches the buffer through `relation`
    /// (node domain to leaf domain) followed by `access` (leaf domain to
    /// buffer).
    pub fn new(relation: &AffineMap, access: &AffineMap) -> Self {
        let used = access.used_inputs();
        let mut mask = vec![false; relation.n_in()];
        for (d, driver) in relation.dim_mapping().into_iter().enumerate() {
            if let Some(e) = driver {
                if used[d] {
                    mask[e] = true;
                }
            }
        }
        Self(mask)
    }

    /// Whether dimension `dim` affects the buffer.
    pub fn contains(&self, dim: usize) -> bool {
        self.0.get(dim).copied().unwrap_or(false)
    }

    /// Loops enclosing a placement at `position` that force it to be
    /// refilled. With `skip_trailing`, innermost enclosing loops that do not
    /// affect the buffer reuse the previous fill.
    pub fn reload_loops(&self, order: &[usize], position: usize, skip_trailing: bool) -> Vec<usize> {
        let mut end = position.min(order.len());
        if skip_trailing {
            while end > 0 && !self.contains(order[end - 1]) {
                end -= 1;
            }
        }
        order[..end].to_vec()
    }
}

impl fmt::Display for LoopMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &bit in &self.0 {
            write!(f, "{}", if bit { '1' } else { '0' })?;
        }
        Ok(())
    }
}

/// How a buffer relates to the subtree of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// Produced outside, read inside
    Input,
    /// Produced inside, needed outside
    Output,
    /// Produced and fully consumed inside
    Internal,
}

/// A buffer as seen from one node.
#[derive(Debug, Clone)]
pub struct NodeBufferInfo {
    /// The tensor
    pub buffer: LogicalBuffer,
    /// Leaf operator whose access defines the region
    pub accessor: OpId,
    /// Buffer index within the accessor
    pub index: usize,
    /// Role relative to the node
    pub role: BufferRole,
    /// Lives in the top memory level regardless of placement
    pub top_resident: bool,
    /// Dimensions of the node that move the accessed region
    pub mask: LoopMask,
    /// `place[position][store_level]`; empty for leaves
    pub place: Vec<Vec<VarId>>,
    /// Region shape per loop position
    pub shapes: Vec<Vec<IntExpr>>,
    /// Region size in bytes per loop position
    pub bytes: Vec<IntExpr>,
    /// Element size
    pub elem_bytes: i64,
}

/// Solver state of one tile node.
#[derive(Debug, Clone)]
pub struct TileNodeInfo {
    /// The node
    pub node: TileNodeId,
    /// Operator whose domain the node iterates
    pub op: OpId,
    /// Hierarchy level
    pub level: usize,
    /// Trip count variable per domain dimension
    pub trips: Vec<VarId>,
    /// Extent covered by one loop iteration, per dimension
    pub inner: Vec<IntExpr>,
    /// Extent covered by one invocation, per dimension
    pub extents: Vec<IntExpr>,
    /// Dimensions from outermost to innermost loop
    pub loop_order: Vec<usize>,
    /// Number of times the node is entered
    pub invocations: IntExpr,
    /// First and last leaf timestamp under the node
    pub lifetime: (usize, usize),
    /// Buffers accessed under the node
    pub buffers: Vec<NodeBufferInfo>,
}

impl TileNodeInfo {
    /// Number of loop positions, one more than the domain rank.
    pub fn num_positions(&self) -> usize {
        self.trips.len() + 1
    }

    /// Position of a dimension's loop in the nest.
    pub fn loop_position(&self, dim: usize) -> usize {
        self.loop_order.iter().position(|&d| d == dim).unwrap_or(self.loop_order.len())
    }

    /// Buffer state by tensor.
    pub fn buffer(&self, buffer: LogicalBuffer) -> Option<&NodeBufferInfo> {
        self.buffers.iter().find(|b| b.buffer == buffer)
    }

    /// Product of the trip counts of the given loops.
    pub fn trips_of(&self, dims: &[usize]) -> IntExpr {
        IntExpr::product(dims.iter().map(|&d| IntExpr::var(self.trips[d])))
    }

    /// Product of every trip count of the node.
    pub fn total_trips(&self) -> IntExpr {
        IntExpr::product(self.trips.iter().map(|&t| IntExpr::var(t)))
    }

    /// Whether a timestamp falls within the node's lifetime.
    pub fn is_live_at(&self, timestamp: usize) -> bool {
        self.lifetime.0 <= timestamp && timestamp <= self.lifetime.1
    }
}

/// Solver state of one operator.
#[derive(Debug, Clone)]
pub struct OpNodeInfo {
    /// The operator
    pub op: OpId,
    /// Its leaf
    pub leaf: TileNodeId,
    /// Leaf tile per dimension
    pub tile: Vec<IntExpr>,
    /// Per domain dimension, the `(node, dim)` loops that tile it
    pub drivers: Vec<Vec<(TileNodeId, usize)>>,
    /// Micro-kernel calls over the whole domain
    pub primitive_calls: i64,
    /// Cycles of those calls
    pub compute_cycles: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_mask() {
        // matmul domain (m, n, k) reading A[m, k]
        let mask = LoopMask::new(&AffineMap::identity(3), &AffineMap::select(3, &[0, 2]));
        assert_eq!(mask.to_string(), "101");
        assert!(!mask.contains(1));

        // loops m, k, n: a trailing n does not refill A
        assert_eq!(mask.reload_loops(&[0, 2, 1], 3, true), vec![0, 2]);
        assert_eq!(mask.reload_loops(&[0, 2, 1], 3, false), vec![0, 2, 1]);
        assert_eq!(mask.reload_loops(&[0, 1, 2], 2, true), vec![0]);
    }

    #[test]
    fn test_loop_mask_through_relation() {
        // relu (a, b) drives matmul (a, b, 0); A[m, k] only moves with a
        let relation = AffineMap::select(3, &[0, 1]).inverse().unwrap();
        let mask = LoopMask::new(&relation, &AffineMap::select(3, &[0, 2]));
        assert_eq!(mask.to_string(), "10");
    }
}
