//! Buffer dependency graph.
//!
//! Vertices are [`BufferIdentity`]s. `Inter` edges run from each operand of
//! an operator to its result; `Outer` edges run from a consumer's operand to
//! the producer result it reads. Outer edges are recorded while walking the
//! cluster hierarchy, on the lowest cluster holding both operators.

use crate::tile::graph::{TileGraph, TileNodeKind};
use crate::tile::node::{BufferIdentity, OpId, TileNodeId};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Serialize, Deserialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Kind of a buffer dependence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferEdgeKind {
    /// Operand to result of the same operator
    Inter,
    /// Consumer operand to producer result
    Outer,
}

/// A tensor as the scheduler sees it, independent of who accesses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogicalBuffer {
    /// A graph input, by index into the graph's inputs
    Input(usize),
    /// The result of an operator
    Produced(OpId),
}

impl fmt::Display for LogicalBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalBuffer::Input(i) => write!(f, "in{}", i),
            LogicalBuffer::Produced(op) => write!(f, "{}.out", op),
        }
    }
}

/// Explicit def-use graph over buffer identities.
#[derive(Debug, Clone, Default)]
pub struct BufferGraph {
    graph: DiGraph<BufferIdentity, BufferEdgeKind>,
    index: BTreeMap<BufferIdentity, NodeIndex>,
    owners: BTreeMap<BufferIdentity, TileNodeId>,
    inputs: BTreeMap<BufferIdentity, usize>,
    results: BTreeSet<BufferIdentity>,
}

impl BufferGraph {
    /// Derive the buffer graph of a tile graph.
    pub fn build(graph: &TileGraph) -> Self {
        let mut buffers = Self::default();
        buffers.visit(graph, graph.root());
        for id in buffers.index.keys().copied().collect::<Vec<_>>() {
            if let Some(i) = graph.input_index(id) {
                buffers.inputs.insert(id, i);
            }
        }
        buffers
    }

    fn vertex(&mut self, id: BufferIdentity) -> NodeIndex {
        if let Some(&v) = self.index.get(&id) {
            return v;
        }
        let v = self.graph.add_node(id);
        self.index.insert(id, v);
        v
    }

    fn visit(&mut self, graph: &TileGraph, id: TileNodeId) {
        match &graph.node(id).kind {
            TileNodeKind::Leaf(op) => {
                let out = self.vertex(op.output());
                self.results.insert(op.output());
                for arg in 0..op.num_reads() {
                    let input = self.vertex(BufferIdentity::new(op.id, arg));
                    self.graph.add_edge(input, out, BufferEdgeKind::Inter);
                }
            }
            TileNodeKind::Cluster(children) => {
                for &child in children {
                    self.visit(graph, child);
                }
                for edge in graph.edges() {
                    let from = graph.child_containing(id, graph.leaf(edge.producer));
                    let to = graph.child_containing(id, graph.leaf(edge.consumer));
                    if let (Some(a), Some(b)) = (from, to) {
                        if a != b {
                            let input = BufferIdentity::new(edge.consumer, edge.arg);
                            let output = graph.op_node(edge.producer).output();
                            let (u, v) = (self.vertex(input), self.vertex(output));
                            self.graph.add_edge(u, v, BufferEdgeKind::Outer);
                            self.owners.insert(input, id);
                        }
                    }
                }
            }
        }
    }

    /// Number of buffer identities.
    pub fn num_buffers(&self) -> usize {
        self.graph.node_count()
    }

    /// All buffer identities in order.
    pub fn buffers(&self) -> impl Iterator<Item = BufferIdentity> + '_ {
        self.index.keys().copied()
    }

    /// Producer result read by an operand.
    pub fn producer_of(&self, input: BufferIdentity) -> Option<BufferIdentity> {
        let v = *self.index.get(&input)?;
        self.graph
            .edges_directed(v, Direction::Outgoing)
            .find(|e| *e.weight() == BufferEdgeKind::Outer)
            .map(|e| self.graph[e.target()])
    }

    /// Operands reading a result.
    pub fn users(&self, output: BufferIdentity) -> Vec<BufferIdentity> {
        let Some(&v) = self.index.get(&output) else {
            return Vec::new();
        };
        let mut users: Vec<BufferIdentity> = self.graph
            .edges_directed(v, Direction::Incoming)
            .filter(|e| *e.weight() == BufferEdgeKind::Outer)
            .map(|e| self.graph[e.source()])
            .collect();
        users.sort();
        users
    }

    /// Cluster on which the outer edge of an operand was recorded.
    pub fn owner(&self, input: BufferIdentity) -> Option<TileNodeId> {
        self.owners.get(&input).copied()
    }

    /// Edges of one kind, sorted.
    pub fn edges(&self, kind: BufferEdgeKind) -> Vec<(BufferIdentity, BufferIdentity)> {
        let mut edges: Vec<_> = self.graph
            .edge_references()
            .filter(|e| *e.weight() == kind)
            .map(|e| (self.graph[e.source()], self.graph[e.target()]))
            .collect();
        edges.sort();
        edges
    }

    /// The tensor an access refers to.
    pub fn logical(&self, id: BufferIdentity) -> Option<LogicalBuffer> {
        if let Some(producer) = self.producer_of(id) {
            return Some(LogicalBuffer::Produced(producer.op));
        }
        if let Some(&i) = self.inputs.get(&id) {
            return Some(LogicalBuffer::Input(i));
        }
        self.results.contains(&id).then_some(LogicalBuffer::Produced(id.op))
    }

    /// Whether the graph has no dependence cycle.
    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&self.graph)
    }
}

impl fmt::Display for BufferGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (kind, tag) in [(BufferEdgeKind::Inter, "inter"), (BufferEdgeKind::Outer, "outer")] {
            for (a, b) in self.edges(kind) {
                writeln!(f, "{} {} -> {}", tag, a, b)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::grid::{BinaryOp, GridGraph, UnaryOp};
    use crate::ir::tensor::{DataType, TensorType};
    use crate::target::TargetOptions;
    use crate::tile::builder::{DomainBoundsCache, TileGraphBuilder};
    use crate::tile::merge::{GraphMerger, MergePoint};

    fn residual() -> TileGraph {
        let mut grid = GridGraph::new();
        let x = grid.add_input("x", TensorType::new(DataType::F32, vec![32]));
        let e = grid.unary("e", UnaryOp::Exp, x).unwrap();
        let s = grid.binary("s", BinaryOp::Add, e, x).unwrap();
        let target = TargetOptions::cpu();
        TileGraphBuilder::new(&grid, &target, 1)
            .build(s, &mut DomainBoundsCache::new())
            .unwrap()
            .graph
    }

    #[test]
    fn test_edges() {
        let g = residual();
        let buffers = BufferGraph::build(&g);
        let b = BufferIdentity::new;
        assert_eq!(buffers.num_buffers(), 5);
        assert_eq!(
            buffers.edges(BufferEdgeKind::Inter),
            vec![(b(OpId(0), 0), b(OpId(0), 1)), (b(OpId(1), 0), b(OpId(1), 2)), (b(OpId(1), 1), b(OpId(1), 2))]
        );
        assert_eq!(buffers.edges(BufferEdgeKind::Outer), vec![(b(OpId(1), 0), b(OpId(0), 1))]);
        assert_eq!(buffers.producer_of(b(OpId(1), 0)), Some(b(OpId(0), 1)));
        assert_eq!(buffers.producer_of(b(OpId(1), 1)), None);
        assert_eq!(buffers.users(b(OpId(0), 1)), vec![b(OpId(1), 0)]);
        assert_eq!(buffers.owner(b(OpId(1), 0)), Some(g.root()));
        assert!(buffers.is_acyclic());
    }

    #[test]
    fn test_logical_buffers() {
        let g = residual();
        let buffers = BufferGraph::build(&g);
        let b = BufferIdentity::new;
        assert_eq!(buffers.logical(b(OpId(0), 0)), Some(LogicalBuffer::Input(0)));
        assert_eq!(buffers.logical(b(OpId(1), 1)), Some(LogicalBuffer::Input(0)));
        assert_eq!(buffers.logical(b(OpId(1), 0)), Some(LogicalBuffer::Produced(OpId(0))));
        assert_eq!(buffers.logical(b(OpId(1), 2)), Some(LogicalBuffer::Produced(OpId(1))));
    }

    #[test]
    fn test_owner_follows_merge() {
        let mut g = residual();
        assert!(GraphMerger::new().merge(&mut g, &MergePoint::new(OpId(1), OpId(0), 1)));
        let buffers = BufferGraph::build(&g);
        let owner = buffers.owner(BufferIdentity::new(OpId(1), 0)).unwrap();
        assert_eq!(g.node(owner).level, 1);
        assert_eq!(g.node(owner).op, OpId(1));
        assert!(buffers.to_string().contains("outer op1.b0 -> op0.b1"));
    }
}
