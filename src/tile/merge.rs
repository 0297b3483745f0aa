//! Merge point discovery and graph merging.
//!
//! A merge point names a producer and a consumer whose clusters at some
//! level are siblings connected by a dependence. Merging splices the
//! producer's cluster into the consumer's, re-expressing every spliced
//! domain in terms of the consumer's domain.

use crate::polyhedral::AffineMap;
use crate::tile::graph::TileGraph;
use crate::tile::node::{DomainRelation, OpId, TileNodeId};
use crate::utils::errors::MergeRejection;
use log::{debug, trace};
use petgraph::algo::{floyd_warshall, has_path_connecting, is_cyclic_directed};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{depth_first_search, Control, DfsEvent};
use serde::{Serialize, Deserialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// A candidate fusion: the producer's level-`level` cluster is spliced into
/// the consumer's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MergePoint {
    /// Operator heading the cluster that absorbs the other
    pub consumer: OpId,
    /// Operator heading the cluster that is absorbed
    pub producer: OpId,
    /// Level of the two clusters
    pub level: usize,
}

impl MergePoint {
    /// Create a merge point.
    pub fn new(consumer: OpId, producer: OpId, level: usize) -> Self {
        Self { consumer, producer, level }
    }
}

impl fmt::Display for MergePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {} @ L{}", self.consumer, self.producer, self.level)
    }
}

/// Finds candidate merge points. Purely structural; legality is the
/// merger's concern.
pub struct MergePointCollector<'a> {
    graph: &'a TileGraph,
}

impl<'a> MergePointCollector<'a> {
    /// Create a collector over a graph.
    pub fn new(graph: &'a TileGraph) -> Self {
        Self { graph }
    }

    /// Merge points between sibling clusters at `level`.
    pub fn collect(&self, level: usize) -> Vec<MergePoint> {
        let mut seen = HashSet::new();
        let mut points = Vec::new();
        if level == 0 || level > self.graph.top_level() {
            return points;
        }
        for parent in self.graph.clusters_at_level(level + 1) {
            for (from, to) in self.graph.sibling_edges(parent) {
                let point = MergePoint::new(self.graph.node(to).op, self.graph.node(from).op, level);
                if seen.insert(point) {
                    points.push(point);
                }
            }
        }
        points
    }

    /// Merge points at every level, outermost first.
    pub fn collect_all(&self) -> Vec<MergePoint> {
        (1..=self.graph.top_level())
            .rev()
            .flat_map(|level| self.collect(level))
            .collect()
    }
}

/// Everything a legal merge needs, computed before the graph is touched.
struct MergePlan {
    consumer: TileNodeId,
    producer: TileNodeId,
    parent: TileNodeId,
    net: DomainRelation,
}

/// Applies merge points to a tile graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphMerger;

impl GraphMerger {
    /// Create a merger.
    pub fn new() -> Self {
        Self
    }

    /// Apply a merge point. Returns `false` and leaves the graph untouched
    /// when the merge is illegal.
    pub fn merge(&self, graph: &mut TileGraph, point: &MergePoint) -> bool {
        match self.try_merge(graph, point) {
            Ok(()) => true,
            Err(reason) => {
                debug!("merge {} rejected: {}", point, reason);
                false
            }
        }
    }

    /// Whether a merge point could be applied.
    pub fn is_legal(&self, graph: &TileGraph, point: &MergePoint) -> bool {
        self.plan(graph, point).is_ok()
    }

    /// Apply a merge point, reporting why it was rejected.
    pub fn try_merge(&self, graph: &mut TileGraph, point: &MergePoint) -> Result<(), MergeRejection> {
        let plan = self.plan(graph, point)?;
        self.splice(graph, &plan);
        debug!("merged {}", point);
        Ok(())
    }

    fn plan(&self, graph: &TileGraph, point: &MergePoint) -> Result<MergePlan, MergeRejection> {
        let (c_op, p_op) = (point.consumer, point.producer);
        let ids = (c_op.0, p_op.0);
        let missing = |op: OpId| MergeRejection::MissingCluster { op: op.0, level: point.level };

        if c_op == p_op {
            return Err(MergeRejection::AlreadyMerged { consumer: ids.0, producer: ids.1 });
        }
        let consumer = find_cluster(graph, c_op, point.level).ok_or_else(|| missing(c_op))?;
        if graph.contains(consumer, graph.leaf(p_op)) {
            return Err(MergeRejection::AlreadyMerged { consumer: ids.0, producer: ids.1 });
        }
        let producer = find_cluster(graph, p_op, point.level).ok_or_else(|| missing(p_op))?;
        if graph.contains(producer, graph.leaf(c_op)) {
            return Err(MergeRejection::AlreadyMerged { consumer: ids.0, producer: ids.1 });
        }

        let parent = match (graph.node(consumer).parent, graph.node(producer).parent) {
            (Some(a), Some(b)) if a == b => a,
            _ => return Err(MergeRejection::NotSiblings { consumer: ids.0, producer: ids.1 }),
        };

        check_dependence(graph, parent, producer, consumer)
            .map_err(|kind| kind.into_rejection(ids))?;
        check_spliced_order(graph, producer, consumer)
            .map_err(|kind| kind.into_rejection(ids))?;

        let net = net_relation(graph, producer, consumer, p_op)
            .ok_or(MergeRejection::NonPermutation { consumer: ids.0, producer: ids.1 })?;
        trace!("net relation for {}: {}", point, net);

        Ok(MergePlan { consumer, producer, parent, net: DomainRelation { map: net, domain_op: c_op, range_op: p_op } })
    }

    fn splice(&self, graph: &mut TileGraph, plan: &MergePlan) {
        let siblings: Vec<TileNodeId> = graph.children(plan.parent)
            .iter()
            .copied()
            .filter(|&c| c != plan.producer)
            .collect();
        graph.set_children(plan.parent, siblings);

        let moved = graph.children(plan.producer).to_vec();
        for &child in &moved {
            let node = graph.node_mut(child);
            node.relation = plan.net.apply_range(&node.relation);
            node.parent = Some(plan.consumer);
        }
        let mut children = graph.children(plan.consumer).to_vec();
        children.extend(moved);
        graph.set_children(plan.consumer, children);
        graph.remove_node(plan.producer);
        graph.sort_children(plan.consumer);
    }
}

enum Illegal {
    NoDependence,
    Cycle,
}

impl Illegal {
    fn into_rejection(self, (consumer, producer): (usize, usize)) -> MergeRejection {
        match self {
            Illegal::NoDependence => MergeRejection::NoDependence { consumer, producer },
            Illegal::Cycle => MergeRejection::Cycle { consumer, producer },
        }
    }
}

fn find_cluster(graph: &TileGraph, op: OpId, level: usize) -> Option<TileNodeId> {
    graph.clusters_at_level(level)
        .into_iter()
        .find(|&c| c != graph.root() && graph.node(c).op == op)
}

/// The sibling graph under `parent` must have a producer-to-consumer path,
/// and contracting the two must not close a cycle.
fn check_dependence(
    graph: &TileGraph,
    parent: TileNodeId,
    producer: TileNodeId,
    consumer: TileNodeId,
) -> Result<(), Illegal> {
    let children = graph.children(parent);
    let edges = graph.sibling_edges(parent);

    let mut siblings = DiGraph::<TileNodeId, ()>::new();
    let index: HashMap<TileNodeId, NodeIndex> = children.iter().map(|&c| (c, siblings.add_node(c))).collect();
    for (a, b) in &edges {
        siblings.add_edge(index[a], index[b], ());
    }
    if !has_path_connecting(&siblings, index[&producer], index[&consumer], None) {
        return Err(Illegal::NoDependence);
    }

    let mut contracted = DiGraph::<TileNodeId, ()>::new();
    let merged = |c: TileNodeId| if c == producer { consumer } else { c };
    let cindex: HashMap<TileNodeId, NodeIndex> = children.iter()
        .filter(|&&c| c != producer)
        .map(|&c| (c, contracted.add_node(c)))
        .collect();
    for (a, b) in &edges {
        let (a, b) = (merged(*a), merged(*b));
        if a != b {
            contracted.update_edge(cindex[&a], cindex[&b], ());
        }
    }

    let roots: Vec<NodeIndex> = contracted.node_indices().collect();
    let result = depth_first_search(&contracted, roots, |event| match event {
        DfsEvent::BackEdge(_, _) => Control::Break(()),
        _ => Control::Continue,
    });
    if matches!(result, Control::Break(())) {
        return Err(Illegal::Cycle);
    }
    Ok(())
}

/// The union of both clusters' children must stay acyclic.
fn check_spliced_order(graph: &TileGraph, producer: TileNodeId, consumer: TileNodeId) -> Result<(), Illegal> {
    let groups: Vec<(TileNodeId, HashSet<OpId>)> = graph.children(consumer)
        .iter()
        .chain(graph.children(producer))
        .map(|&c| (c, graph.ops_under(c).into_iter().collect()))
        .collect();

    let mut g = DiGraph::<TileNodeId, ()>::new();
    let nodes: Vec<NodeIndex> = groups.iter().map(|(c, _)| g.add_node(*c)).collect();
    let group_of = |op: OpId| groups.iter().position(|(_, ops)| ops.contains(&op));
    for edge in graph.edges() {
        if let (Some(a), Some(b)) = (group_of(edge.producer), group_of(edge.consumer)) {
            if a != b {
                g.update_edge(nodes[a], nodes[b], ());
            }
        }
    }
    if is_cyclic_directed(&g) {
        Err(Illegal::Cycle)
    } else {
        Ok(())
    }
}

/// Relation from the consumer cluster's domain to the producer cluster's
/// domain, derived through the dependence edge nearest the consumer.
fn net_relation(graph: &TileGraph, producer: TileNodeId, consumer: TileNodeId, p_op: OpId) -> Option<AffineMap> {
    let c_op = graph.node(consumer).op;
    let producer_ops: HashSet<OpId> = graph.ops_under(producer).into_iter().collect();
    let consumer_ops: HashSet<OpId> = graph.ops_under(consumer).into_iter().collect();

    let mut ops = DiGraph::<OpId, ()>::new();
    let nodes: Vec<NodeIndex> = (0..graph.num_ops()).map(|i| ops.add_node(OpId(i))).collect();
    for edge in graph.edges() {
        ops.update_edge(nodes[edge.producer.0], nodes[edge.consumer.0], ());
    }
    let distances = floyd_warshall(&ops, |_| 1usize).ok()?;
    let distance = |from: OpId, to: OpId| {
        distances.get(&(nodes[from.0], nodes[to.0])).copied().filter(|&d| d != usize::MAX)
    };

    let relay = graph.edges()
        .iter()
        .filter(|e| producer_ops.contains(&e.producer) && consumer_ops.contains(&e.consumer))
        .filter_map(|e| distance(e.consumer, c_op).map(|d| (e.producer != p_op, d, e.consumer, e.arg, e.producer)))
        .min()?;
    let (_, _, r_op, arg, x_op) = relay;

    let x = graph.op_node(x_op);
    let r = graph.op_node(r_op);
    let relay_to_x = x.write.inverse()?.compose(&r.reads[arg]);
    if !relay_to_x.is_projected_permutation() {
        return None;
    }

    let consumer_to_x = relay_to_x.compose(&graph.relation_between(consumer, graph.leaf(r_op)));
    if x_op == p_op {
        return Some(consumer_to_x);
    }
    let producer_to_x = graph.relation_between(producer, graph.leaf(x_op));
    Some(producer_to_x.inverse()?.compose(&consumer_to_x))
}
