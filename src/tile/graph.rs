//! The tiered tile graph.
//!
//! Nodes live in an arena addressed by [`TileNodeId`]; each node knows its
//! parent and clusters keep their children in execution order. Leaves sit at
//! level 0, every operator starts wrapped in one cluster per memory level
//! `1..=top`, and a root pseudo-cluster at `top + 1` holds everything.
//!
//! Data dependences are stored once, between operators. The dependence
//! between two sibling clusters at any level is the lift of those edges.

use crate::polyhedral::AffineMap;
use crate::tile::node::{BufferIdentity, DomainRelation, GraphInput, OpEdge, OpId, OpNode, TileNodeId};
use crate::utils::fingerprint;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// What a tile node holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileNodeKind {
    /// An operator
    Leaf(OpNode),
    /// Child nodes in execution order
    Cluster(Vec<TileNodeId>),
}

/// A node of the tile graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileNode {
    /// Arena index
    pub id: TileNodeId,
    /// Hierarchy level, 0 for leaves
    pub level: usize,
    /// Operator whose domain the node iterates
    pub op: OpId,
    /// Enclosing cluster, `None` for the root
    pub parent: Option<TileNodeId>,
    /// Parent domain to this node's domain
    pub relation: DomainRelation,
    /// Leaf or cluster payload
    pub kind: TileNodeKind,
}

impl TileNode {
    /// Whether the node is an operator leaf.
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, TileNodeKind::Leaf(_))
    }

    /// Children of a cluster; empty for leaves.
    pub fn children(&self) -> &[TileNodeId] {
        match &self.kind {
            TileNodeKind::Cluster(children) => children,
            TileNodeKind::Leaf(_) => &[],
        }
    }
}

/// Tiered, clustered graph of operators.
#[derive(Debug, Clone)]
pub struct TileGraph {
    nodes: Vec<Option<TileNode>>,
    root: TileNodeId,
    top_level: usize,
    leaves: Vec<TileNodeId>,
    edges: Vec<OpEdge>,
    topo_rank: Vec<usize>,
    inputs: Vec<GraphInput>,
    input_bindings: BTreeMap<BufferIdentity, usize>,
    output_op: OpId,
}

impl TileGraph {
    /// Create a graph holding only the root, for a hierarchy whose outermost
    /// memory level is `top_level`.
    pub fn new(top_level: usize) -> Self {
        let root = TileNode {
            id: TileNodeId(0),
            level: top_level + 1,
            op: OpId(0),
            parent: None,
            relation: DomainRelation::identity(OpId(0), 0),
            kind: TileNodeKind::Cluster(Vec::new()),
        };
        Self {
            nodes: vec![Some(root)],
            root: TileNodeId(0),
            top_level,
            leaves: Vec::new(),
            edges: Vec::new(),
            topo_rank: Vec::new(),
            inputs: Vec::new(),
            input_bindings: BTreeMap::new(),
            output_op: OpId(0),
        }
    }

    /// Add an operator wrapped in one cluster per level and attach it to the
    /// root. Operators must be added in topological order.
    pub fn add_op(&mut self, op: OpNode) -> TileNodeId {
        let id = op.id;
        let rank = op.rank();
        debug_assert_eq!(id.0, self.leaves.len());

        let relation = |parent: TileNodeId| if parent == TileNodeId(0) {
            DomainRelation::unconstrained(id, rank)
        } else {
            DomainRelation::identity(id, rank)
        };
        let mut parent = self.root;
        let mut outermost = None;
        for level in (1..=self.top_level).rev() {
            let cluster = self.push_node(level, id, Some(parent), relation(parent), TileNodeKind::Cluster(Vec::new()));
            self.attach(parent, cluster);
            outermost.get_or_insert(cluster);
            parent = cluster;
        }
        let leaf = self.push_node(0, id, Some(parent), relation(parent), TileNodeKind::Leaf(op));
        self.attach(parent, leaf);

        self.leaves.push(leaf);
        self.topo_rank.push(id.0);
        self.output_op = id;
        outermost.unwrap_or(leaf)
    }

    /// Record a dependence between two operators.
    pub fn add_edge(&mut self, edge: OpEdge) {
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    /// Register a graph input and bind it to an operand.
    pub fn bind_input(&mut self, input: GraphInput, buffer: BufferIdentity) {
        let index = match self.inputs.iter().position(|i| i.expr == input.expr) {
            Some(i) => i,
            None => {
                self.inputs.push(input);
                self.inputs.len() - 1
            }
        };
        self.input_bindings.insert(buffer, index);
    }

    fn push_node(
        &mut self,
        level: usize,
        op: OpId,
        parent: Option<TileNodeId>,
        relation: DomainRelation,
        kind: TileNodeKind,
    ) -> TileNodeId {
        let id = TileNodeId(self.nodes.len());
        self.nodes.push(Some(TileNode { id, level, op, parent, relation, kind }));
        id
    }

    fn attach(&mut self, parent: TileNodeId, child: TileNodeId) {
        if let TileNodeKind::Cluster(children) = &mut self.node_mut(parent).kind {
            children.push(child);
        }
    }

    /// The root pseudo-cluster.
    pub fn root(&self) -> TileNodeId {
        self.root
    }

    /// Outermost memory level.
    pub fn top_level(&self) -> usize {
        self.top_level
    }

    /// Number of operators.
    pub fn num_ops(&self) -> usize {
        self.leaves.len()
    }

    /// Operator producing the region's result.
    pub fn output_op(&self) -> OpId {
        self.output_op
    }

    /// Dependences between operators.
    pub fn edges(&self) -> &[OpEdge] {
        &self.edges
    }

    /// Graph inputs in first-use order.
    pub fn inputs(&self) -> &[GraphInput] {
        &self.inputs
    }

    /// The graph input an operand reads, if it is one.
    pub fn input_binding(&self, buffer: BufferIdentity) -> Option<&GraphInput> {
        self.input_bindings.get(&buffer).map(|&i| &self.inputs[i])
    }

    /// Index into [`TileGraph::inputs`] of the graph input an operand reads.
    pub fn input_index(&self, buffer: BufferIdentity) -> Option<usize> {
        self.input_bindings.get(&buffer).copied()
    }

    /// Look up a node; `None` for ids removed by a merge or never allocated.
    pub fn try_node(&self, id: TileNodeId) -> Option<&TileNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    /// Look up a live node.
    ///
    /// # Panics
    /// If the id was removed by a merge.
    pub fn node(&self, id: TileNodeId) -> &TileNode {
        self.try_node(id).unwrap_or_else(|| panic!("tile node {} was removed", id))
    }

    /// Live nodes in arena order.
    pub fn nodes(&self) -> impl Iterator<Item = &TileNode> {
        self.nodes.iter().flatten()
    }

    pub(crate) fn node_mut(&mut self, id: TileNodeId) -> &mut TileNode {
        self.nodes[id.0].as_mut().unwrap_or_else(|| panic!("tile node {} was removed", id))
    }

    pub(crate) fn remove_node(&mut self, id: TileNodeId) -> Option<TileNode> {
        self.nodes.get_mut(id.0).and_then(Option::take)
    }

    pub(crate) fn set_children(&mut self, id: TileNodeId, new_children: Vec<TileNodeId>) {
        if let TileNodeKind::Cluster(children) = &mut self.node_mut(id).kind {
            *children = new_children;
        }
    }

    /// Leaf holding an operator.
    pub fn leaf(&self, op: OpId) -> TileNodeId {
        self.leaves[op.0]
    }

    /// The operator of a leaf, or of the node's own operator.
    pub fn op_node(&self, op: OpId) -> &OpNode {
        match &self.node(self.leaf(op)).kind {
            TileNodeKind::Leaf(node) => node,
            TileNodeKind::Cluster(_) => unreachable!("leaf index points at a cluster"),
        }
    }

    /// Domain rank of a node.
    pub fn rank(&self, id: TileNodeId) -> usize {
        if id == self.root {
            0
        } else {
            self.op_node(self.node(id).op).rank()
        }
    }

    /// Children of a node.
    pub fn children(&self, id: TileNodeId) -> &[TileNodeId] {
        self.node(id).children()
    }

    /// Strict ancestors from the parent up to the root.
    pub fn ancestors(&self, id: TileNodeId) -> Vec<TileNodeId> {
        let mut out = Vec::new();
        let mut cur = self.node(id).parent;
        while let Some(p) = cur {
            out.push(p);
            cur = self.node(p).parent;
        }
        out
    }

    /// The node at `level` on the path from `id` to the root, `id` included.
    pub fn ancestor_at_level(&self, id: TileNodeId, level: usize) -> Option<TileNodeId> {
        let mut cur = Some(id);
        while let Some(n) = cur {
            let node = self.node(n);
            if node.level == level {
                return Some(n);
            }
            if node.level > level {
                return None;
            }
            cur = node.parent;
        }
        None
    }

    /// Whether `node` lies in the subtree of `ancestor` (inclusive). A
    /// removed `node` lies nowhere.
    pub fn contains(&self, ancestor: TileNodeId, node: TileNodeId) -> bool {
        let mut cur = self.try_node(node);
        while let Some(n) = cur {
            if n.id == ancestor {
                return true;
            }
            cur = n.parent.and_then(|p| self.try_node(p));
        }
        false
    }

    /// The child of `parent` whose subtree holds `node`.
    pub fn child_containing(&self, parent: TileNodeId, node: TileNodeId) -> Option<TileNodeId> {
        let mut cur = node;
        loop {
            let p = self.node(cur).parent?;
            if p == parent {
                return Some(cur);
            }
            cur = p;
        }
    }

    /// Leaves under a node in execution order.
    pub fn leaves_under(&self, id: TileNodeId) -> Vec<TileNodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            let node = self.node(n);
            if node.is_leaf() {
                out.push(n);
            } else {
                stack.extend(node.children().iter().rev());
            }
        }
        out
    }

    /// Operators under a node in execution order.
    pub fn ops_under(&self, id: TileNodeId) -> Vec<OpId> {
        self.leaves_under(id).into_iter().map(|l| self.node(l).op).collect()
    }

    /// Relation from `ancestor`'s domain to `descendant`'s domain, composed
    /// along the path between them.
    pub fn relation_between(&self, ancestor: TileNodeId, descendant: TileNodeId) -> AffineMap {
        let mut path = Vec::new();
        let mut cur = descendant;
        while cur != ancestor {
            path.push(cur);
            match self.node(cur).parent {
                Some(p) => cur = p,
                None => break,
            }
        }
        let mut map = AffineMap::identity(self.rank(ancestor));
        for n in path.into_iter().rev() {
            map = self.node(n).relation.map.compose(&map);
        }
        map
    }

    /// Lifted dependences between the children of a cluster.
    pub fn sibling_edges(&self, parent: TileNodeId) -> Vec<(TileNodeId, TileNodeId)> {
        let mut out = BTreeSet::new();
        for edge in &self.edges {
            let from = self.child_containing(parent, self.leaf(edge.producer));
            let to = self.child_containing(parent, self.leaf(edge.consumer));
            if let (Some(a), Some(b)) = (from, to) {
                if a != b {
                    out.insert((a, b));
                }
            }
        }
        out.into_iter().collect()
    }

    /// Reorder a cluster's children topologically, breaking ties by the
    /// original operator order.
    pub(crate) fn sort_children(&mut self, id: TileNodeId) {
        let children = self.children(id).to_vec();
        let edges = self.sibling_edges(id);
        let key = |g: &Self, c: TileNodeId| {
            g.ops_under(c).iter().map(|o| g.topo_rank[o.0]).min().unwrap_or(usize::MAX)
        };

        let mut in_degree: HashMap<TileNodeId, usize> = children.iter().map(|&c| (c, 0)).collect();
        for (_, b) in &edges {
            if let Some(d) = in_degree.get_mut(b) {
                *d += 1;
            }
        }
        let mut ready: BTreeSet<(usize, TileNodeId)> = children.iter()
            .filter(|c| in_degree[c] == 0)
            .map(|&c| (key(self, c), c))
            .collect();

        let mut order = Vec::with_capacity(children.len());
        while let Some(first) = ready.iter().next().copied() {
            ready.remove(&first);
            let (_, c) = first;
            order.push(c);
            for (a, b) in &edges {
                if *a == c {
                    if let Some(d) = in_degree.get_mut(b) {
                        *d -= 1;
                        if *d == 0 {
                            ready.insert((key(self, *b), *b));
                        }
                    }
                }
            }
        }

        if order.len() == children.len() {
            self.set_children(id, order);
        }
    }

    /// Clusters at a level, in arena order.
    pub fn clusters_at_level(&self, level: usize) -> Vec<TileNodeId> {
        self.nodes()
            .filter(|n| n.level == level && !n.is_leaf())
            .map(|n| n.id)
            .collect()
    }

    /// Whether every cluster's sibling dependences are acyclic.
    pub fn is_acyclic(&self) -> bool {
        self.nodes().filter(|n| !n.is_leaf()).all(|n| {
            let children = n.children();
            let mut g = DiGraph::<TileNodeId, ()>::new();
            let index: HashMap<TileNodeId, _> = children.iter().map(|&c| (c, g.add_node(c))).collect();
            for (a, b) in self.sibling_edges(n.id) {
                g.add_edge(index[&a], index[&b], ());
            }
            !is_cyclic_directed(&g)
        })
    }

    /// Structural fingerprint; equal graphs schedule identically.
    pub fn signature(&self) -> u64 {
        let mut parts: Vec<(usize, usize, u64, Vec<usize>, u64)> = Vec::new();
        let mut stack = vec![self.root];
        while let Some(n) = stack.pop() {
            let node = self.node(n);
            let op_sig = if n == self.root { 0 } else { self.op_node(node.op).signature() };
            let children: Vec<usize> = node.children().iter().map(|c| self.node(*c).op.0).collect();
            parts.push((node.level, node.op.0, op_sig, children, fingerprint(&node.relation.map)));
            stack.extend(node.children().iter().rev());
        }
        fingerprint(&(parts, &self.edges))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::grid::{OpKind, UnaryOp};
    use crate::ir::tensor::DataType;
    use crate::target::MicroKernelInfo;

    fn relu(id: usize) -> OpNode {
        OpNode {
            id: OpId(id),
            name: format!("t{}", id),
            kind: OpKind::Unary(UnaryOp::Relu),
            bounds: vec![8, 8],
            reads: vec![AffineMap::identity(2)],
            write: AffineMap::identity(2),
            buffer_shapes: vec![vec![8, 8]; 2],
            dtypes: vec![DataType::F32; 2],
            kernel: MicroKernelInfo::scalar(2, None),
        }
    }

    fn chain(n: usize, top: usize) -> TileGraph {
        let mut g = TileGraph::new(top);
        for i in 0..n {
            g.add_op(relu(i));
            if i > 0 {
                g.add_edge(OpEdge { producer: OpId(i - 1), consumer: OpId(i), arg: 0 });
            }
        }
        g
    }

    #[test]
    fn test_wrapping() {
        let g = chain(2, 2);
        assert_eq!(g.node(g.root()).level, 3);
        assert_eq!(g.children(g.root()).len(), 2);
        let leaf = g.leaf(OpId(1));
        assert_eq!(g.ancestors(leaf).len(), 3);
        let l2 = g.ancestor_at_level(leaf, 2).unwrap();
        assert_eq!(g.node(l2).op, OpId(1));
        assert!(g.contains(l2, leaf));
        assert_eq!(g.child_containing(g.root(), leaf), Some(l2));
        assert!(g.relation_between(l2, leaf).is_identity());
    }

    #[test]
    fn test_sibling_edges_and_order() {
        let mut g = chain(3, 1);
        let root = g.root();
        let kids = g.children(root).to_vec();
        assert_eq!(g.sibling_edges(root), vec![(kids[0], kids[1]), (kids[1], kids[2])]);

        g.set_children(root, vec![kids[2], kids[0], kids[1]]);
        g.sort_children(root);
        assert_eq!(g.children(root), kids.as_slice());
        assert!(g.is_acyclic());
    }

    #[test]
    fn test_signature_ignores_ids_not_structure() {
        let a = chain(2, 1);
        let b = chain(2, 1);
        assert_eq!(a.signature(), b.signature());
        let c = chain(3, 1);
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn test_try_node_after_removal() {
        let mut g = chain(2, 1);
        let cluster = g.clusters_at_level(1)[1];
        let leaf = g.leaf(OpId(1));
        assert_eq!(g.try_node(cluster).map(|n| n.op), Some(OpId(1)));
        assert!(g.contains(cluster, leaf));
        assert!(g.try_node(TileNodeId(g.nodes().count() + 10)).is_none());

        let live = g.nodes().count();
        g.remove_node(cluster);
        assert!(g.try_node(cluster).is_none());
        assert!(!g.contains(g.root(), cluster));
        assert_eq!(g.nodes().count(), live - 1);
    }

    #[test]
    fn test_leaves_under() {
        let g = chain(3, 1);
        assert_eq!(g.ops_under(g.root()), vec![OpId(0), OpId(1), OpId(2)]);
        assert_eq!(g.clusters_at_level(1).len(), 3);
    }
}
