//! Trip count variables, bound equalities and loop extents.
//!
//! Every non-root node gets one trip count variable per dimension of its
//! operator's domain, ranging over the divisors of `bound / primitive`. A
//! node's extent along a dimension is its trip count times the extent of the
//! child that continues its own operator's chain, bottoming out at the
//! primitive multiple in the leaf. For every leaf dimension, the trip counts
//! of every node driving it multiply to `bound / primitive`.

use crate::schedule::info::{OpNodeInfo, TileNodeInfo};
use crate::solver::{IntExpr, Model, Relation};
use crate::tile::graph::TileGraph;
use crate::tile::node::{OpId, OpNode, TileNodeId};
use crate::utils::errors::{ScheduleError, ScheduleResult, UnsupportedError, UnsupportedErrorKind};
use crate::utils::matrix::divisors;
use log::trace;
use std::collections::{BTreeMap, HashMap};

/// Variables and derived loop expressions of a tile graph.
#[derive(Debug, Clone)]
pub struct Initialized {
    /// State of every non-root node
    pub nodes: BTreeMap<TileNodeId, TileNodeInfo>,
    /// State of every operator, by op index
    pub ops: Vec<OpNodeInfo>,
    /// Leaves in execution order; the index is the leaf's timestamp
    pub leaf_order: Vec<TileNodeId>,
    /// Non-root nodes, parents before children
    pub preorder: Vec<TileNodeId>,
}

impl Initialized {
    /// Non-root strict ancestors of a node, innermost first.
    pub fn ancestors(&self, graph: &TileGraph, id: TileNodeId) -> Vec<TileNodeId> {
        graph.ancestors(id).into_iter().filter(|&a| a != graph.root()).collect()
    }
}

/// Creates trip count variables and the bound equalities.
pub struct Initializer<'a> {
    graph: &'a TileGraph,
}

fn primitive(op: &OpNode, dim: usize) -> i64 {
    op.kernel.primitives.get(dim).copied().unwrap_or(1)
}

/// Loop order of a domain: the reduction dimension, if any, innermost.
pub fn loop_order(rank: usize, reduction: Option<usize>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..rank).filter(|&d| Some(d) != reduction).collect();
    if let Some(r) = reduction.filter(|&r| r < rank) {
        order.push(r);
    }
    order
}

impl<'a> Initializer<'a> {
    /// Create an initializer.
    pub fn new(graph: &'a TileGraph) -> Self {
        Self { graph }
    }

    /// Add the variables and equalities to `model`.
    pub fn run(&self, model: &mut Model) -> ScheduleResult<Initialized> {
        let graph = self.graph;
        let preorder = self.preorder();
        let leaf_order = graph.leaves_under(graph.root());
        let timestamp: HashMap<TileNodeId, usize> = leaf_order.iter().enumerate().map(|(i, &l)| (l, i)).collect();

        let mut nodes = BTreeMap::new();
        for &id in &preorder {
            let node = graph.node(id);
            let op = graph.op_node(node.op);
            let mut trips = Vec::with_capacity(op.rank());
            for (d, &bound) in op.bounds.iter().enumerate() {
                let prim = primitive(op, d);
                if prim <= 0 || bound % prim != 0 {
                    return Err(UnsupportedError::new(
                        UnsupportedErrorKind::Operator,
                        format!("{}: primitive {} does not divide bound {}", op.name, prim, bound),
                    ).into());
                }
                trips.push(model.add_int_var_with_values(divisors(bound / prim), format!("t_{}_{}", id, d)));
            }

            let stamps: Vec<usize> = graph.leaves_under(id).iter().map(|l| timestamp[l]).collect();
            let lifetime = (
                stamps.iter().copied().min().unwrap_or(0),
                stamps.iter().copied().max().unwrap_or(0),
            );
            nodes.insert(id, TileNodeInfo {
                node: id,
                op: node.op,
                level: node.level,
                trips,
                inner: Vec::new(),
                extents: Vec::new(),
                loop_order: loop_order(op.rank(), op.kernel.reduction_dim),
                invocations: IntExpr::constant(1),
                lifetime,
                buffers: Vec::new(),
            });
        }

        self.derive_extents(&preorder, &mut nodes)?;

        for &id in &preorder {
            let invocations = IntExpr::product(
                graph.ancestors(id)
                    .into_iter()
                    .filter(|&a| a != graph.root())
                    .map(|a| nodes[&a].total_trips()),
            );
            if let Some(info) = nodes.get_mut(&id) {
                info.invocations = invocations;
            }
        }

        let ops = (0..graph.num_ops())
            .map(|i| self.bound_op(model, &nodes, OpId(i)))
            .collect();

        Ok(Initialized { nodes, ops, leaf_order, preorder })
    }

    fn preorder(&self) -> Vec<TileNodeId> {
        let graph = self.graph;
        let mut order = Vec::new();
        let mut stack: Vec<TileNodeId> = graph.children(graph.root()).iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(graph.children(id).iter().rev());
        }
        order
    }

    fn derive_extents(&self, preorder: &[TileNodeId], nodes: &mut BTreeMap<TileNodeId, TileNodeInfo>) -> ScheduleResult<()> {
        let graph = self.graph;
        for &id in preorder.iter().rev() {
            let node = graph.node(id);
            let op = graph.op_node(node.op);
            let inner: Vec<IntExpr> = if node.is_leaf() {
                (0..op.rank()).map(|d| IntExpr::constant(primitive(op, d))).collect()
            } else {
                let rep = graph.child_containing(id, graph.leaf(node.op))
                    .filter(|&c| graph.node(c).op == node.op)
                    .ok_or_else(|| ScheduleError::Internal(format!("cluster {} lost its own operator {}", id, node.op)))?;
                nodes[&rep].extents.clone()
            };
            if let Some(info) = nodes.get_mut(&id) {
                info.extents = info.trips.iter().zip(&inner).map(|(&t, i)| IntExpr::var(t) * i.clone()).collect();
                info.inner = inner;
            }
        }
        Ok(())
    }

    fn bound_op(&self, model: &mut Model, nodes: &BTreeMap<TileNodeId, TileNodeInfo>, id: OpId) -> OpNodeInfo {
        let graph = self.graph;
        let op = graph.op_node(id);
        let leaf = graph.leaf(id);
        let mappings: Vec<(TileNodeId, Vec<Option<usize>>)> = graph.ancestors(leaf)
            .into_iter()
            .filter(|&a| a != graph.root())
            .map(|a| (a, graph.relation_between(a, leaf).dim_mapping()))
            .collect();

        let mut drivers = Vec::with_capacity(op.rank());
        let mut primitive_calls: i64 = 1;
        for (d, &bound) in op.bounds.iter().enumerate() {
            let calls = bound / primitive(op, d);
            primitive_calls = primitive_calls.saturating_mul(calls);

            let mut chain = vec![(leaf, d)];
            chain.extend(mappings.iter().filter_map(|(a, m)| m.get(d).copied().flatten().map(|e| (*a, e))));
            let product = IntExpr::product(chain.iter().map(|(n, e)| IntExpr::var(nodes[n].trips[*e])));
            trace!("{} dim {}: {} = {}", id, d, product, calls);
            model.add_constraint(product, Relation::Eq, calls);
            drivers.push(chain);
        }

        OpNodeInfo {
            op: id,
            leaf,
            tile: nodes[&leaf].extents.clone(),
            drivers,
            primitive_calls,
            compute_cycles: primitive_calls.saturating_mul(op.kernel.cycles_per_primitive),
        }
    }
}
