//! Operator leaves, buffer identities and domain relations.

use crate::ir::grid::{ExprId, OpKind};
use crate::ir::tensor::{DataType, TensorType};
use crate::polyhedral::{AffineExpr, AffineMap};
use crate::target::MicroKernelInfo;
use crate::utils::fingerprint;
use serde::{Serialize, Deserialize};
use std::fmt;

/// Index of an operator within one tile graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId(pub usize);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Stable arena index of a tile node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileNodeId(pub usize);

impl fmt::Display for TileNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A buffer as seen by one operator: `index < num_reads` is an operand,
/// `index == num_reads` is the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BufferIdentity {
    /// Accessing operator
    pub op: OpId,
    /// Buffer index within the operator
    pub index: usize,
}

impl BufferIdentity {
    /// Create an identity.
    pub fn new(op: OpId, index: usize) -> Self {
        Self { op, index }
    }
}

impl fmt::Display for BufferIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.b{}", self.op, self.index)
    }
}

/// A leaf: one operator with inferred domain bounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpNode {
    /// Operator index
    pub id: OpId,
    /// Name of the operator's result
    pub name: String,
    /// Operator kind
    pub kind: OpKind,
    /// Iteration domain size per dimension
    pub bounds: Vec<i64>,
    /// Read access map of each operand
    pub reads: Vec<AffineMap>,
    /// Write access map of the result
    pub write: AffineMap,
    /// Per-shard shape of each buffer, operands first
    pub buffer_shapes: Vec<Vec<i64>>,
    /// Element type of each buffer, operands first
    pub dtypes: Vec<DataType>,
    /// Micro-kernel executing the leaf tile
    pub kernel: MicroKernelInfo,
}

impl OpNode {
    /// Number of operands.
    pub fn num_reads(&self) -> usize {
        self.reads.len()
    }

    /// Number of buffers, the result included.
    pub fn num_buffers(&self) -> usize {
        self.reads.len() + 1
    }

    /// Rank of the iteration domain.
    pub fn rank(&self) -> usize {
        self.bounds.len()
    }

    /// Access map of a buffer.
    pub fn access(&self, index: usize) -> &AffineMap {
        if index < self.reads.len() {
            &self.reads[index]
        } else {
            &self.write
        }
    }

    /// Identity of the result buffer.
    pub fn output(&self) -> BufferIdentity {
        BufferIdentity::new(self.id, self.num_reads())
    }

    /// Element size of a buffer.
    pub fn elem_bytes(&self, index: usize) -> i64 {
        self.dtypes[index].size_in_bytes()
    }

    /// Structural signature: equal signatures schedule identically.
    pub fn signature(&self) -> u64 {
        fingerprint(&(&self.kind, &self.bounds, &self.reads, &self.write, &self.buffer_shapes, &self.dtypes, &self.kernel))
    }
}

/// A data dependence between two operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpEdge {
    /// Operator producing the value
    pub producer: OpId,
    /// Operator reading it
    pub consumer: OpId,
    /// Operand index of the consumer
    pub arg: usize,
}

/// A graph input read by the scheduled region.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphInput {
    /// Expression in the original graph
    pub expr: ExprId,
    /// Name of the input
    pub name: String,
    /// Type of the input
    pub ty: TensorType,
}

/// Maps a node's parent domain onto the node's own domain.
///
/// Output dimensions the parent does not drive are the constant zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainRelation {
    /// Parent domain to node domain
    pub map: AffineMap,
    /// Operator whose domain is the map's input
    pub domain_op: OpId,
    /// Operator whose domain is the map's output
    pub range_op: OpId,
}

impl DomainRelation {
    /// Identity relation on one operator's domain.
    pub fn identity(op: OpId, rank: usize) -> Self {
        Self {
            map: AffineMap::identity(rank),
            domain_op: op,
            range_op: op,
        }
    }

    /// Relation of a node directly under the root: the root has no domain,
    /// so every dimension is unmapped.
    pub fn unconstrained(op: OpId, rank: usize) -> Self {
        Self {
            map: AffineMap::from_outputs(0, vec![AffineExpr::zero(0); rank]),
            domain_op: op,
            range_op: op,
        }
    }

    /// `self` followed by `next`: relation(A->B) then relation(B->C) is relation(A->C).
    pub fn apply_range(&self, next: &DomainRelation) -> DomainRelation {
        debug_assert_eq!(self.range_op, next.domain_op);
        DomainRelation {
            map: next.map.compose(&self.map),
            domain_op: self.domain_op,
            range_op: next.range_op,
        }
    }
}

impl fmt::Display for DomainRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}: {}", self.domain_op, self.range_op, self.map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_range() {
        // relu domain (a, b) -> matmul domain (a, b, 0) -> matmul transposed
        let relu_to_mm = DomainRelation {
            map: AffineMap::select(3, &[0, 1]).inverse().unwrap(),
            domain_op: OpId(1),
            range_op: OpId(0),
        };
        let mm_swap = DomainRelation {
            map: AffineMap::permutation(&[1, 0, 2]),
            domain_op: OpId(0),
            range_op: OpId(2),
        };
        let net = relu_to_mm.apply_range(&mm_swap);
        assert_eq!(net.domain_op, OpId(1));
        assert_eq!(net.range_op, OpId(2));
        assert_eq!(net.map.apply(&[3, 5]), vec![5, 3, 0]);
        assert!(net.map.is_projected_permutation());
    }
}
